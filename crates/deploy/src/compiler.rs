//! Solidity compilation.
//!
//! Sources are compiled with solc in standard-JSON mode, inside the official
//! `ethereum/solc` image. The project root is bind-mounted at `/project`; the compiler
//! input, its output and the `solc --version` banner go through the cache directory.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Bytes;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    artifacts::{Artifact, Artifacts, BuildInfo},
    config::{CompilerSettings, Project},
    docker::{DockerImage, ServiceConfig, SilensDocker},
    fs::FsHandler,
};

/// The solc image. Tags are `<version>-alpine`.
pub const SOLC_IMAGE: &str = "ethereum/solc";

const CONTAINER_PROJECT_DIR: &str = "/project";
const CONTAINER_NAME: &str = "silens-solc";

const INPUT_FILENAME: &str = "solc-input.json";
const OUTPUT_FILENAME: &str = "solc-output.json";
const VERSION_FILENAME: &str = "solc-version.txt";

/// How long to wait for solc output to appear on the host after the container exits.
const OUTPUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker of an unlinked library address in solc bytecode.
const LINK_PLACEHOLDER: &str = "__$";

/// Extract `v<version>+commit.<hash>` from `solc --version` output.
pub fn parse_long_version(version_output: &str) -> Result<String> {
    let version = version_output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Version:"))
        .map(str::trim)
        .context("solc --version output has no Version line")?;

    // e.g. 0.8.24+commit.e11b9ed9.Linux.g++
    let mut parts = version.split('.');
    let (major, minor, patch_and_commit, hash) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(major), Some(minor), Some(patch), Some(hash)) => (major, minor, patch, hash),
            _ => anyhow::bail!("Unexpected solc version format: {}", version),
        };

    if !patch_and_commit.contains("+commit") {
        anyhow::bail!("Unexpected solc version format: {}", version);
    }

    Ok(format!("v{}.{}.{}.{}", major, minor, patch_and_commit, hash))
}

/// Standard-JSON compiler input for `sources` (source name to content).
pub fn standard_json_input(settings: &CompilerSettings, sources: &BTreeMap<String, String>) -> Value {
    let sources: serde_json::Map<String, Value> = sources
        .iter()
        .map(|(name, content)| (name.clone(), json!({ "content": content })))
        .collect();

    let mut solc_settings = json!({
        "optimizer": {
            "enabled": settings.optimizer.enabled,
            "runs": settings.optimizer.runs,
        },
        "viaIR": settings.via_ir,
        "outputSelection": {
            "*": {
                "*": ["abi", "evm.bytecode.object", "evm.deployedBytecode.object", "metadata"],
                "": ["ast"],
            }
        }
    });
    if let Some(evm_version) = &settings.evm_version {
        solc_settings["evmVersion"] = json!(evm_version);
    }

    json!({
        "language": "Solidity",
        "sources": sources,
        "settings": solc_settings,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolcError {
    severity: String,
    #[serde(default)]
    formatted_message: Option<String>,
    message: String,
}

impl SolcError {
    fn text(&self) -> &str {
        self.formatted_message.as_deref().unwrap_or(&self.message)
    }
}

#[derive(Debug, Deserialize)]
struct BytecodeObject {
    object: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Evm {
    bytecode: BytecodeObject,
    deployed_bytecode: BytecodeObject,
}

#[derive(Debug, Deserialize)]
struct SolcContract {
    abi: Value,
    evm: Evm,
}

#[derive(Debug, Default, Deserialize)]
struct SolcOutput {
    #[serde(default)]
    errors: Vec<SolcError>,
    #[serde(default)]
    sources: BTreeMap<String, Value>,
    #[serde(default)]
    contracts: BTreeMap<String, BTreeMap<String, SolcContract>>,
}

fn decode_bytecode(contract: &str, object: &str) -> Result<Bytes> {
    if object.contains(LINK_PLACEHOLDER) {
        anyhow::bail!(
            "{} references external libraries, which must be linked before deployment",
            contract
        );
    }
    hex::decode(object.trim_start_matches("0x"))
        .map(Bytes::from)
        .with_context(|| format!("Invalid bytecode for {}", contract))
}

/// Result of a successful compilation.
#[derive(Debug)]
pub struct CompileOutput {
    pub artifacts: Artifacts,
    /// Source units solc loaded, imported dependencies included.
    pub source_names: Vec<String>,
    pub warnings: usize,
}

/// Turn solc standard-JSON output into artifacts.
///
/// Errors reported by solc fail the compilation; warnings are logged. Artifacts are keyed
/// by contract name: two contracts of `project_sources` sharing a name fail the
/// compilation, while an imported contract is only kept when its name is unique.
pub fn parse_output(output: &Value, project_sources: &BTreeSet<String>) -> Result<CompileOutput> {
    let output: SolcOutput =
        serde_json::from_value(output.clone()).context("Failed to parse solc output")?;

    let mut errors = Vec::new();
    let mut warnings = 0;
    for diagnostic in &output.errors {
        match diagnostic.severity.as_str() {
            "error" => errors.push(diagnostic.text().trim_end().to_string()),
            _ => {
                warnings += 1;
                tracing::warn!("{}", diagnostic.text().trim_end());
            }
        }
    }

    if !errors.is_empty() {
        anyhow::bail!(
            "Compilation failed with {} error(s):\n{}",
            errors.len(),
            errors.join("\n")
        );
    }

    let mut artifacts = Artifacts::default();
    let mut imported: BTreeMap<String, Vec<Artifact>> = BTreeMap::new();
    for (source_name, contracts) in output.contracts {
        for (contract_name, contract) in contracts {
            let abi = serde_json::from_value(contract.abi)
                .with_context(|| format!("Invalid ABI for {}", contract_name))?;
            let artifact = Artifact {
                bytecode: decode_bytecode(&contract_name, &contract.evm.bytecode.object)?,
                deployed_bytecode: decode_bytecode(
                    &contract_name,
                    &contract.evm.deployed_bytecode.object,
                )?,
                contract_name,
                source_name: source_name.clone(),
                abi,
            };

            if !project_sources.contains(&source_name) {
                imported
                    .entry(artifact.contract_name.clone())
                    .or_default()
                    .push(artifact);
                continue;
            }

            if let Some(existing) = artifacts.get(&artifact.contract_name) {
                anyhow::bail!(
                    "Contract {} is defined in both {} and {}",
                    artifact.contract_name,
                    existing.source_name,
                    source_name
                );
            }
            artifacts.insert(artifact);
        }
    }

    for (contract_name, mut candidates) in imported {
        if artifacts.get(&contract_name).is_some() || candidates.len() > 1 {
            tracing::debug!(
                contract = %contract_name,
                definitions = candidates.len(),
                "Skipping imported contract with an ambiguous name"
            );
            continue;
        }
        if let Some(artifact) = candidates.pop() {
            artifacts.insert(artifact);
        }
    }

    Ok(CompileOutput {
        artifacts,
        source_names: output.sources.into_keys().collect(),
        warnings,
    })
}

/// Shell script run in the solc container.
fn solc_script() -> String {
    let cache = format!("{}/cache", CONTAINER_PROJECT_DIR);
    format!(
        "solc --version > {cache}/{version} && solc --standard-json --base-path {root} \
         --include-path {root}/node_modules --allow-paths {root} {cache}/{input} > {cache}/{output}",
        cache = cache,
        root = CONTAINER_PROJECT_DIR,
        version = VERSION_FILENAME,
        input = INPUT_FILENAME,
        output = OUTPUT_FILENAME,
    )
}

/// Compiles the sources of a project.
pub struct Compiler<'a> {
    project: &'a Project,
}

impl<'a> Compiler<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self { project }
    }

    pub fn image(&self) -> DockerImage {
        DockerImage::new(
            SOLC_IMAGE,
            format!("{}-alpine", self.project.config.solidity.version),
        )
    }

    /// Name of `path` as seen by solc: relative to the project root, `/`-separated.
    fn source_name(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.project.root).with_context(|| {
            format!(
                "Source {} is outside the project root {}",
                path.display(),
                self.project.root.display()
            )
        })?;

        Ok(relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }

    fn read_sources(&self) -> Result<BTreeMap<String, String>> {
        let sources_dir = self.project.sources_dir();
        let files = FsHandler::collect_files(&sources_dir, "sol")?;
        if files.is_empty() {
            anyhow::bail!("No Solidity sources found in {}", sources_dir.display());
        }

        files
            .iter()
            .map(|path| {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read source {}", path.display()))?;
                Ok((self.source_name(path)?, content))
            })
            .collect()
    }

    /// Where solc found an imported source unit on the host.
    fn locate_import(&self, source_name: &str) -> Option<PathBuf> {
        [
            self.project.root.join(source_name),
            self.project.root.join("node_modules").join(source_name),
        ]
        .into_iter()
        .find(|path| path.is_file())
    }

    /// Add the sources solc imported on its own, so the build info is self-contained.
    fn complete_input(&self, input: &mut Value, source_names: &[String]) -> Result<()> {
        let Some(sources) = input["sources"].as_object_mut() else {
            anyhow::bail!("Compiler input has no sources");
        };

        for name in source_names {
            if sources.contains_key(name) {
                continue;
            }
            let path = self
                .locate_import(name)
                .with_context(|| format!("Cannot locate imported source {}", name))?;
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read imported source {}", path.display()))?;
            sources.insert(name.clone(), json!({ "content": content }));
        }

        Ok(())
    }

    #[cfg(unix)]
    fn container_user(&self) -> Result<Option<String>> {
        use std::os::unix::fs::MetadataExt;

        let metadata = std::fs::metadata(&self.project.root)
            .with_context(|| format!("Failed to stat {}", self.project.root.display()))?;
        Ok(Some(format!("{}:{}", metadata.uid(), metadata.gid())))
    }

    #[cfg(not(unix))]
    fn container_user(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Compile every source, write artifacts and build info.
    pub async fn compile(&self, docker: &mut SilensDocker) -> Result<CompileOutput> {
        let settings = &self.project.config.solidity;
        let sources = self.read_sources()?;
        tracing::info!(
            sources = sources.len(),
            version = %settings.version,
            optimizer_runs = settings.optimizer.runs,
            via_ir = settings.via_ir,
            "Compiling contracts"
        );

        let cache_dir = self.project.cache_dir();
        // Container paths are fixed, so the cache has to live at <root>/cache.
        if cache_dir != self.project.root.join("cache") {
            anyhow::bail!(
                "The cache directory must be <project>/cache, got {}",
                cache_dir.display()
            );
        }
        FsHandler::create_bind_directory(&cache_dir)?;

        let output_path = cache_dir.join(OUTPUT_FILENAME);
        if output_path.exists() {
            std::fs::remove_file(&output_path).context("Failed to remove stale solc output")?;
        }

        let mut input = standard_json_input(settings, &sources);
        std::fs::write(
            cache_dir.join(INPUT_FILENAME),
            serde_json::to_string(&input).context("Failed to serialize compiler input")?,
        )
        .context("Failed to write compiler input")?;

        let mut service = ServiceConfig::new(self.image())
            .entrypoint(vec!["sh".to_string(), "-c".to_string()])
            .cmd(vec![solc_script()])
            .bind(&self.project.root, CONTAINER_PROJECT_DIR, "rw")
            .working_dir(CONTAINER_PROJECT_DIR);
        if let Some(user) = self.container_user()? {
            service = service.user(user);
        }

        docker.run_to_completion(CONTAINER_NAME, service).await?;

        FsHandler::wait_for_file(&output_path, OUTPUT_TIMEOUT).await?;
        let raw_output = std::fs::read_to_string(&output_path)
            .with_context(|| format!("Failed to read {}", output_path.display()))?;
        let output: Value =
            serde_json::from_str(&raw_output).context("solc produced invalid JSON output")?;

        let compiled = parse_output(&output, &sources.keys().cloned().collect())?;

        let version_output = std::fs::read_to_string(cache_dir.join(VERSION_FILENAME))
            .context("Failed to read solc version")?;
        let solc_long_version = parse_long_version(&version_output)?;

        self.complete_input(&mut input, &compiled.source_names)?;
        self.write_artifacts(&compiled.artifacts)?;
        BuildInfo {
            solc_long_version,
            input,
        }
        .save(&self.project.artifacts_dir())?;

        tracing::info!(
            contracts = compiled.artifacts.len(),
            warnings = compiled.warnings,
            "Compiled successfully"
        );

        Ok(compiled)
    }

    /// Replace the artifacts directory contents with `artifacts`.
    fn write_artifacts(&self, artifacts: &Artifacts) -> Result<()> {
        let dir = self.project.artifacts_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        for stale in FsHandler::collect_files(&dir, "json")? {
            std::fs::remove_file(&stale)
                .with_context(|| format!("Failed to remove stale artifact {}", stale.display()))?;
        }

        for artifact in artifacts.iter() {
            let path = artifact.save(&dir)?;
            tracing::debug!(contract = %artifact.contract_name, path = %path.display(), "Artifact written");
        }

        Ok(())
    }
}
