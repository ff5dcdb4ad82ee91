//! silens-deploy - Deployment library for the Silens contracts.
//!
//! This crate compiles the Silens Solidity sources, deploys the contract graph described
//! by a module and applies its wiring calls exactly once per network, resuming from a
//! persisted journal after any failure.

pub mod artifacts;
pub mod chain;
pub mod compiler;
pub mod config;
pub mod fingerprint;
pub mod journal;
pub mod module;
pub mod orchestrator;
pub mod plan;
pub mod rpc;
pub mod size;
pub mod verify;
pub mod vars;

mod docker;
mod fs;

pub use artifacts::{Artifact, Artifacts, BuildInfo};
pub use chain::{
    ChainClient, LocalSigner, Receipt, RpcChainClient, SentTransaction, TransactionError,
    TransactionRequest, TransactionState,
};
pub use compiler::Compiler;
pub use config::{Project, SilensConfig};
pub use docker::{DockerImage, ServiceConfig, SilensDocker, SilensDockerConfig};
pub use journal::{AddressBook, DeployedContract, DeploymentJournal, StepStatus};
pub use module::{Argument, BuiltinModule, ConfigurationCall, ContractSpec, ModuleDefinition};
pub use orchestrator::{ExecutionError, Orchestrator};
pub use plan::{ExecutionPlan, PlanError, StepId, plan};
pub use size::SizeReport;
pub use vars::Vars;
pub use verify::{ExplorerConfig, Verifier};
