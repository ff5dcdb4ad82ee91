//! Compiled contract artifacts and ABI encoding of step arguments.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier},
    json_abi::{JsonAbi, Param},
    primitives::{Address, Bytes},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File holding the compiler input and version of the last build.
pub const BUILD_INFO_FILENAME: &str = "build-info.json";

/// ABI and bytecode of one compiled contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub contract_name: String,
    /// Path of the defining source file, relative to the project root.
    pub source_name: String,
    pub abi: JsonAbi,
    /// Creation bytecode, without constructor arguments.
    pub bytecode: Bytes,
    /// Runtime bytecode.
    pub deployed_bytecode: Bytes,
}

impl Artifact {
    /// Path of the artifact of `contract_name` inside `artifacts_dir`.
    pub fn path(artifacts_dir: &Path, contract_name: &str) -> PathBuf {
        artifacts_dir.join(format!("{}.json", contract_name))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read artifact from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))
    }

    pub fn save(&self, artifacts_dir: &Path) -> Result<PathBuf> {
        let path = Self::path(artifacts_dir, &self.contract_name);
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize artifact")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write artifact to {}", path.display()))?;
        Ok(path)
    }

    /// Fully qualified name, `<source>:<contract>`, as expected by block explorers.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.source_name, self.contract_name)
    }
}

/// Inputs of the build that produced the artifacts, kept for source verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    /// e.g. `v0.8.24+commit.e11b9ed9`.
    pub solc_long_version: String,
    /// Standard-JSON compiler input.
    pub input: Value,
}

impl BuildInfo {
    pub fn load(artifacts_dir: &Path) -> Result<Self> {
        let path = artifacts_dir.join(BUILD_INFO_FILENAME);
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read build info from {} - run `silens compile` first",
                path.display()
            )
        })?;
        serde_json::from_str(&content).context("Failed to parse build info")
    }

    pub fn save(&self, artifacts_dir: &Path) -> Result<()> {
        let path = artifacts_dir.join(BUILD_INFO_FILENAME);
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize build info")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write build info to {}", path.display()))
    }
}

/// All artifacts of a build, by contract name.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    artifacts: BTreeMap<String, Artifact>,
}

impl Artifacts {
    /// Load every `<Contract>.json` in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).with_context(|| {
            format!(
                "Failed to read artifacts directory {} - run `silens compile` first",
                dir.display()
            )
        })?;

        let mut artifacts = Self::default();
        for entry in entries {
            let path = entry.context("Failed to read artifacts directory entry")?.path();
            let is_artifact = path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|name| name != BUILD_INFO_FILENAME);
            if is_artifact {
                artifacts.insert(Artifact::load(&path)?);
            }
        }

        tracing::debug!(dir = %dir.display(), count = artifacts.len(), "Loaded artifacts");
        Ok(artifacts)
    }

    pub fn insert(&mut self, artifact: Artifact) {
        self.artifacts
            .insert(artifact.contract_name.clone(), artifact);
    }

    pub fn get(&self, contract_name: &str) -> Option<&Artifact> {
        self.artifacts.get(contract_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl FromIterator<Artifact> for Artifacts {
    fn from_iter<I: IntoIterator<Item = Artifact>>(iter: I) -> Self {
        let mut artifacts = Self::default();
        for artifact in iter {
            artifacts.insert(artifact);
        }
        artifacts
    }
}

/// An argument after contract references have been replaced by addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedArgument {
    Address(Address),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{contract} has no method {method} taking {arity} argument(s)")]
    UnknownMethod {
        contract: String,
        method: String,
        arity: usize,
    },

    #[error("{target} expects {expected} argument(s), got {actual}")]
    ArgumentCount {
        target: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument {index} of {target} is not a valid {ty}: {reason}")]
    InvalidArgument {
        target: String,
        index: usize,
        ty: String,
        reason: String,
    },
}

/// Coerce a JSON literal to a value of `ty`.
fn coerce_literal(ty: &DynSolType, value: &Value) -> Result<DynSolValue, String> {
    match (ty, value) {
        (DynSolType::Array(inner), Value::Array(items)) => items
            .iter()
            .map(|item| coerce_literal(inner, item))
            .collect::<Result<_, _>>()
            .map(DynSolValue::Array),
        (DynSolType::FixedArray(inner, len), Value::Array(items)) => {
            if items.len() != *len {
                return Err(format!("expected {} elements, got {}", len, items.len()));
            }
            items
                .iter()
                .map(|item| coerce_literal(inner, item))
                .collect::<Result<_, _>>()
                .map(DynSolValue::FixedArray)
        }
        (DynSolType::Tuple(types), Value::Array(items)) => {
            if items.len() != types.len() {
                return Err(format!(
                    "expected {} tuple fields, got {}",
                    types.len(),
                    items.len()
                ));
            }
            types
                .iter()
                .zip(items)
                .map(|(ty, item)| coerce_literal(ty, item))
                .collect::<Result<_, _>>()
                .map(DynSolValue::Tuple)
        }
        (_, Value::String(s)) => ty.coerce_str(s).map_err(|e| e.to_string()),
        (_, Value::Number(n)) => ty.coerce_str(&n.to_string()).map_err(|e| e.to_string()),
        (_, Value::Bool(b)) => ty
            .coerce_str(if *b { "true" } else { "false" })
            .map_err(|e| e.to_string()),
        (_, other) => Err(format!("unsupported literal {}", other)),
    }
}

/// Coerce resolved arguments against the parameters of a constructor or function.
fn coerce_arguments(
    target: &str,
    params: &[Param],
    args: &[ResolvedArgument],
) -> Result<Vec<DynSolValue>, EncodeError> {
    if params.len() != args.len() {
        return Err(EncodeError::ArgumentCount {
            target: target.to_string(),
            expected: params.len(),
            actual: args.len(),
        });
    }

    params
        .iter()
        .zip(args)
        .enumerate()
        .map(|(index, (param, arg))| {
            let invalid = |reason: String| EncodeError::InvalidArgument {
                target: target.to_string(),
                index,
                ty: param.ty.clone(),
                reason,
            };

            let ty = param.resolve().map_err(|e| invalid(e.to_string()))?;
            match arg {
                ResolvedArgument::Address(address) => match ty {
                    DynSolType::Address => Ok(DynSolValue::Address(*address)),
                    _ => Err(invalid(format!(
                        "contract reference resolves to address {}",
                        address
                    ))),
                },
                ResolvedArgument::Literal(value) => coerce_literal(&ty, value).map_err(invalid),
            }
        })
        .collect()
}

/// ABI-encode constructor arguments (without selector).
///
/// Contracts without an explicit constructor accept no arguments.
pub fn encode_constructor_args(
    artifact: &Artifact,
    args: &[ResolvedArgument],
) -> Result<Bytes, EncodeError> {
    let target = format!("{} constructor", artifact.contract_name);

    let Some(constructor) = artifact.abi.constructor() else {
        return coerce_arguments(&target, &[], args).map(|_| Bytes::new());
    };

    let values = coerce_arguments(&target, &constructor.inputs, args)?;
    constructor
        .abi_encode_input(&values)
        .map(Bytes::from)
        .map_err(|e| EncodeError::InvalidArgument {
            target,
            index: 0,
            ty: "constructor input".to_string(),
            reason: e.to_string(),
        })
}

/// Creation bytecode followed by the encoded constructor arguments.
pub fn encode_deployment(artifact: &Artifact, constructor_args: &Bytes) -> Bytes {
    let mut initcode = Vec::with_capacity(artifact.bytecode.len() + constructor_args.len());
    initcode.extend_from_slice(&artifact.bytecode);
    initcode.extend_from_slice(constructor_args);
    initcode.into()
}

/// ABI-encode a call to `method` (selector included).
///
/// Overloads are matched on arity, then on the first one accepting every argument.
pub fn encode_call(
    artifact: &Artifact,
    method: &str,
    args: &[ResolvedArgument],
) -> Result<Bytes, EncodeError> {
    let candidates: Vec<_> = artifact
        .abi
        .function(method)
        .into_iter()
        .flatten()
        .filter(|f| f.inputs.len() == args.len())
        .collect();

    let unknown = || EncodeError::UnknownMethod {
        contract: artifact.contract_name.clone(),
        method: method.to_string(),
        arity: args.len(),
    };

    let mut last_error = None;
    for function in candidates {
        let target = format!("{}.{}", artifact.contract_name, function.signature());
        match coerce_arguments(&target, &function.inputs, args) {
            Ok(values) => {
                return function
                    .abi_encode_input(&values)
                    .map(Bytes::from)
                    .map_err(|e| EncodeError::InvalidArgument {
                        target,
                        index: 0,
                        ty: "function input".to_string(),
                        reason: e.to_string(),
                    });
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(unknown))
}
