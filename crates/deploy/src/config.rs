//! Project configuration.
//!
//! Settings live in `Silens.toml` at the project root and can be overridden with
//! `SILENS_*` environment variables, nested keys separated by a double underscore
//! (`SILENS_SOLIDITY__OPTIMIZER__RUNS=1000`). Secrets are never stored here: networks
//! and explorers only name the [`Vars`](crate::vars::Vars) entries holding them.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{vars::Vars, verify::ExplorerConfig};

/// Name of the project configuration file.
pub const CONFIG_FILENAME: &str = "Silens.toml";

/// Prefix of environment variables overriding the configuration.
pub const ENV_PREFIX: &str = "SILENS_";

/// Var holding the deployer private key.
pub const PRIVATE_KEY_VAR: &str = "PRIVATE_KEY";

/// Solidity compiler settings, forwarded to solc as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    pub version: String,
    pub optimizer: OptimizerSettings,
    pub via_ir: bool,
    /// EVM version targeted by solc. Left to the compiler default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evm_version: Option<String>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            version: "0.8.24".to_string(),
            optimizer: OptimizerSettings::default(),
            via_ir: true,
            evm_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub enabled: bool,
    pub runs: u32,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            runs: 200,
        }
    }
}

/// Project layout, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub sources: PathBuf,
    pub artifacts: PathBuf,
    pub cache: PathBuf,
    pub deployments: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sources: PathBuf::from("contracts"),
            artifacts: PathBuf::from("artifacts"),
            cache: PathBuf::from("cache"),
            deployments: PathBuf::from("deployments"),
        }
    }
}

/// A named network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint.
    pub url: String,
    /// Expected chain id, checked against the endpoint before deploying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Names of the vars holding the private keys of the accounts. The first one deploys.
    #[serde(default)]
    pub accounts: Vec<String>,
}

impl NetworkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            chain_id: None,
            accounts: vec![PRIVATE_KEY_VAR.to_string()],
        }
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }
}

/// Explorer entry for a chain that is not built in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomChain {
    pub network: String,
    pub chain_id: u64,
    pub api_url: String,
    pub browser_url: String,
}

/// Block-explorer verification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtherscanConfig {
    /// Network name to the name of the var holding its explorer API key.
    pub api_keys: BTreeMap<String, String>,
    pub custom_chains: Vec<CustomChain>,
}

impl Default for EtherscanConfig {
    fn default() -> Self {
        Self {
            api_keys: BTreeMap::from([
                ("scrollSepolia".to_string(), "SCROLLSCAN_API_KEY".to_string()),
                ("sepolia".to_string(), "ETHERSCAN_API_KEY".to_string()),
            ]),
            custom_chains: vec![CustomChain {
                network: "scrollSepolia".to_string(),
                chain_id: 534351,
                api_url: "https://api-sepolia.scrollscan.com/api".to_string(),
                browser_url: "https://sepolia.scrollscan.com/".to_string(),
            }],
        }
    }
}

/// Bytecode size report settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractSizerConfig {
    /// Sort contracts by name instead of by size.
    pub alpha_sort: bool,
    /// Print the report after every compilation.
    pub run_on_compile: bool,
    /// Show fully qualified names instead of contract names.
    pub disambiguate_paths: bool,
    /// Fail when a contract exceeds a size limit.
    pub strict: bool,
}

impl Default for ContractSizerConfig {
    fn default() -> Self {
        Self {
            alpha_sort: true,
            run_on_compile: true,
            disambiguate_paths: false,
            strict: false,
        }
    }
}

/// Deployment execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSettings {
    /// How long to wait for a transaction receipt, in seconds.
    pub confirmation_timeout_secs: u64,
    /// Interval between receipt polls, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 300,
            poll_interval_ms: 2_000,
        }
    }
}

impl DeploymentSettings {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Contents of `Silens.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilensConfig {
    pub solidity: CompilerSettings,
    pub paths: PathsConfig,
    pub networks: BTreeMap<String, NetworkConfig>,
    pub etherscan: EtherscanConfig,
    pub contract_sizer: ContractSizerConfig,
    pub deployment: DeploymentSettings,
}

impl Default for SilensConfig {
    fn default() -> Self {
        Self {
            solidity: CompilerSettings::default(),
            paths: PathsConfig::default(),
            networks: BTreeMap::from([
                (
                    "scrollSepolia".to_string(),
                    NetworkConfig::new("https://sepolia-rpc.scroll.io").chain_id(534351),
                ),
                (
                    "sepolia".to_string(),
                    NetworkConfig::new("https://rpc.sepolia.org").chain_id(11155111),
                ),
            ]),
            etherscan: EtherscanConfig::default(),
            contract_sizer: ContractSizerConfig::default(),
            deployment: DeploymentSettings::default(),
        }
    }
}

impl SilensConfig {
    /// Layer defaults, the config file (if present) and the environment.
    pub fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(config_path: &Path) -> Result<Self> {
        Self::figment(config_path)
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", config_path.display()))
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration to {}", path.display()))?;
        Ok(())
    }
}

/// Network selected for a run, with its secrets resolved.
#[derive(Debug, Clone)]
pub struct ResolvedNetwork {
    pub name: String,
    pub url: Url,
    pub chain_id: Option<u64>,
    /// Private key of the deploying account.
    pub private_key: String,
}

/// A project: its root directory and its configuration.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: SilensConfig,
}

impl Project {
    /// Load the project rooted at `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let config = SilensConfig::load(&root.join(CONFIG_FILENAME))?;
        tracing::debug!(root = %root.display(), "Loaded project configuration");

        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.resolve(&self.config.paths.sources)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.resolve(&self.config.paths.artifacts)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.resolve(&self.config.paths.cache)
    }

    pub fn deployments_dir(&self) -> PathBuf {
        self.resolve(&self.config.paths.deployments)
    }

    /// Look up `name` and resolve its deployer key from `vars`.
    pub fn network(&self, name: &str, vars: &Vars) -> Result<ResolvedNetwork> {
        let network = self.config.networks.get(name).with_context(|| {
            format!(
                "Unknown network {}. Configured networks: {}",
                name,
                self.config
                    .networks
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })?;

        let account = network
            .accounts
            .first()
            .with_context(|| format!("Network {} has no configured account", name))?;

        let url = Url::parse(&network.url)
            .with_context(|| format!("Invalid RPC URL for network {}: {}", name, network.url))?;

        Ok(ResolvedNetwork {
            name: name.to_string(),
            url,
            chain_id: network.chain_id,
            private_key: vars.require(account)?.to_string(),
        })
    }

    /// Explorer of `network`, with its API key resolved from `vars`.
    pub fn explorer(&self, network: &str, vars: &Vars) -> Result<ExplorerConfig> {
        let api_key = match self.config.etherscan.api_keys.get(network) {
            Some(var) => vars.require(var)?.to_string(),
            None => anyhow::bail!("No explorer API key configured for network {}", network),
        };

        let custom = self
            .config
            .etherscan
            .custom_chains
            .iter()
            .find(|chain| chain.network == network);

        match custom {
            Some(chain) => Ok(ExplorerConfig::new(&chain.api_url, &chain.browser_url, api_key)),
            None => ExplorerConfig::builtin(network, api_key)
                .with_context(|| format!("No block explorer known for network {}", network)),
        }
    }
}
