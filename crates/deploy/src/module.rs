//! Declarative module descriptions.
//!
//! A module is pure data: the contracts to construct (with their constructor
//! arguments) and the ordered list of configuration calls applied once every
//! contract exists. Modules are written in TOML:
//!
//! ```toml
//! id = "SilensModule"
//!
//! [[contract]]
//! id = "ModelRegistry"
//!
//! [[contract]]
//! id = "VotingProposal"
//! args = [{ contract = "ReputationSystem" }, { contract = "ModelRegistry" }]
//!
//! [[call]]
//! target = "ModelRegistry"
//! method = "setProposalContract"
//! args = [{ contract = "VotingProposal" }]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::IntoEnumIterator;

/// An argument passed to a constructor or to a configuration call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    /// Reference to another contract of the module, resolved to its deployed address.
    Contract { contract: String },
    /// Literal value, coerced against the ABI type of the parameter it is passed to.
    Literal(Value),
}

impl Argument {
    /// Reference another contract of the module.
    pub fn contract(id: impl Into<String>) -> Self {
        Self::Contract {
            contract: id.into(),
        }
    }

    /// A literal value.
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// The contract id this argument references, if any.
    pub fn reference(&self) -> Option<&str> {
        match self {
            Self::Contract { contract } => Some(contract),
            Self::Literal(_) => None,
        }
    }
}

/// One contract construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpec {
    /// Identifier of the contract inside the module.
    pub id: String,
    /// Name of the compiled artifact. Defaults to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Constructor arguments, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
}

impl ContractSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            artifact: None,
            args: Vec::new(),
        }
    }

    /// Deploy a differently named artifact under this id.
    pub fn artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn arg(mut self, arg: Argument) -> Self {
        self.args.push(arg);
        self
    }

    pub fn artifact_name(&self) -> &str {
        self.artifact.as_deref().unwrap_or(&self.id)
    }

    /// Contract ids referenced by the constructor arguments.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(Argument::reference)
    }
}

/// A post-deployment method invocation on one of the module's contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationCall {
    /// Explicit step id, needed when the same method is called twice on a target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Contract id the call is sent to.
    pub target: String,
    /// Method name as it appears in the target's ABI.
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
}

impl ConfigurationCall {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: None,
            target: target.into(),
            method: method.into(),
            args: Vec::new(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn arg(mut self, arg: Argument) -> Self {
        self.args.push(arg);
        self
    }

    /// Contract ids referenced by the call, the target included.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.target.as_str()).chain(self.args.iter().filter_map(Argument::reference))
    }
}

/// A complete deployment module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    /// Module identifier, part of every step id and of the journal location.
    pub id: String,
    #[serde(default, rename = "contract")]
    pub contracts: Vec<ContractSpec>,
    #[serde(default, rename = "call")]
    pub calls: Vec<ConfigurationCall>,
}

impl ModuleDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            contracts: Vec::new(),
            calls: Vec::new(),
        }
    }

    pub fn contract(mut self, spec: ContractSpec) -> Self {
        self.contracts.push(spec);
        self
    }

    pub fn call(mut self, call: ConfigurationCall) -> Self {
        self.calls.push(call);
        self
    }

    /// Parse a module from its TOML representation.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse module definition as TOML")
    }

    /// Load a module from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read module from {}", path.display()))?;
        let module = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), module = %module.id, "Module loaded");
        Ok(module)
    }

    /// Resolve a module reference: a built-in module name or a path to a TOML file.
    pub fn resolve(reference: &str) -> Result<Self> {
        if let Ok(builtin) = reference.parse::<BuiltinModule>() {
            return builtin.definition();
        }

        let path = Path::new(reference);
        if !path.exists() {
            let builtins = BuiltinModule::iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            anyhow::bail!(
                "Unknown module '{}': not a built-in module ({}) nor an existing file",
                reference,
                builtins
            );
        }

        Self::load_from_file(path)
    }
}

/// Modules embedded in the library.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
pub enum BuiltinModule {
    /// Full wiring: core registered on the voting contract, satellites cross-linked.
    #[strum(serialize = "SilensModule")]
    Silens,
    /// Satellites wired, ModelRegistry ownership handed to the Silens core.
    #[strum(serialize = "SilensCoreOwnedModule")]
    SilensCoreOwned,
    /// Satellites wired, ModelRegistry ownership handed to VotingProposal.
    #[strum(serialize = "SilensProposalOwnedModule")]
    SilensProposalOwned,
}

impl BuiltinModule {
    fn source(&self) -> &'static str {
        match self {
            Self::Silens => include_str!("../modules/silens.toml"),
            Self::SilensCoreOwned => include_str!("../modules/silens_core_owned.toml"),
            Self::SilensProposalOwned => include_str!("../modules/silens_proposal_owned.toml"),
        }
    }

    pub fn definition(&self) -> Result<ModuleDefinition> {
        ModuleDefinition::from_toml(self.source())
            .with_context(|| format!("Built-in module {} is malformed", self))
    }
}
