use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// The module deployed when none is given.
const DEFAULT_MODULE: &str = "SilensModule";

/// How `plan` and `status` print their result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "silens")]
#[command(
    author,
    version,
    about = "Compile, deploy and verify the Silens contracts"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "SILENS_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// The project root, holding Silens.toml.
    #[arg(long, global = true, env = "SILENS_ROOT", default_value = ".")]
    pub root: PathBuf,

    /// Path to the vars file holding private keys and explorer API keys.
    ///
    /// Defaults to <config dir>/silens/vars.toml.
    #[arg(long, global = true, env = "SILENS_VARS_FILE")]
    pub vars_file: Option<PathBuf>,

    /// Skips the cleanup of docker containers when the program exits.
    #[arg(long, global = true, env = "SILENS_NO_CLEANUP")]
    pub no_cleanup: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a Silens.toml with the default settings.
    Init {
        /// Overwrite an existing configuration.
        #[arg(long)]
        force: bool,
    },

    /// Compile the Solidity sources.
    Compile,

    /// Print the bytecode sizes of the last build.
    SizeContracts,

    /// Compile, then print the bytecode sizes.
    ContractSize,

    /// Show the steps a module would execute, in order.
    Plan {
        /// A built-in module name or the path to a module TOML file.
        #[arg(default_value = DEFAULT_MODULE)]
        module: String,

        #[arg(long, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Deploy a module to a network, resuming any previous run.
    Deploy(DeployArgs),

    /// Show the journaled state of a deployment.
    Status {
        #[command(flatten)]
        target: DeploymentTarget,

        #[arg(long, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Verify the contracts of a completed deployment on the block explorer.
    Verify {
        #[command(flatten)]
        target: DeploymentTarget,
    },

    /// Manage private keys and API keys.
    #[command(subcommand)]
    Vars(VarsCommand),
}

/// A module on a network.
#[derive(Debug, Clone, Args)]
pub struct DeploymentTarget {
    /// A built-in module name or the path to a module TOML file.
    #[arg(default_value = DEFAULT_MODULE)]
    pub module: String,

    /// The network, as named in Silens.toml.
    #[arg(short, long, env = "SILENS_NETWORK")]
    pub network: String,
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: DeploymentTarget,

    /// Discard the journal of the deployment and start over.
    #[arg(long)]
    pub reset: bool,

    /// Verify the deployed contracts once the deployment completes.
    #[arg(long, env = "SILENS_VERIFY")]
    pub verify: bool,

    /// Deploy the existing artifacts without compiling first.
    #[arg(long)]
    pub no_compile: bool,

    /// How long to wait for each transaction, in seconds. Overrides Silens.toml.
    #[arg(long, env = "SILENS_CONFIRMATION_TIMEOUT")]
    pub confirmation_timeout: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum VarsCommand {
    /// Store a value.
    Set { name: String, value: String },

    /// Print a stored value.
    Get { name: String },

    /// List the stored names.
    List,

    /// Remove a stored value.
    Delete { name: String },

    /// Print the path of the vars file.
    Path,
}
