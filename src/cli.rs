use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::engine::model::{Action, InstallId, InstallStatus};

#[derive(Debug, Parser)]
#[command(
    name = "appkeeper",
    version,
    about = "Lifecycle and reconciliation for installed container apps"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Use a specific config file
    #[arg(short = 'f', long = "file", global = true)]
    pub config_file: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Name recorded as the actor of audit records
    #[arg(long, global = true, env = "APPKEEPER_ACTOR", default_value = "cli")]
    pub actor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Table,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List every install
    List,
    /// Search installs with filters and paging
    Search {
        /// Substring of the install name
        #[arg(long)]
        name: Option<String>,
        /// Template key
        #[arg(long = "app")]
        app_key: Option<String>,
        /// Only installs with this status
        #[arg(long, value_parser = parse_status)]
        status: Option<InstallStatus>,
        /// Only installs with an upgrade available
        #[arg(long)]
        has_update: bool,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        page_size: usize,
        /// Return every match, ignoring paging
        #[arg(long)]
        all: bool,
    },
    /// Show one install in full
    Show { id: InstallId },
    /// Check whether an install of an app exists
    Check {
        app_key: String,
        /// Install name (first install of the app if omitted)
        #[arg(default_value = "")]
        name: String,
    },
    /// Print the primary host port of an install
    Port {
        app_key: String,
        #[arg(default_value = "")]
        name: String,
    },
    /// Show connection details of an install
    Conn {
        app_key: String,
        #[arg(default_value = "")]
        name: String,
    },
    /// List resources that block deleting an install
    DeleteCheck { id: InstallId },
    /// Reconcile recorded status with the container runtime
    Sync {
        /// Ignore the debounce window
        #[arg(long)]
        force: bool,
    },
    /// Start, stop, restart or upgrade an install
    Operate {
        id: InstallId,
        #[arg(value_parser = parse_action)]
        action: Action,
        /// Upgrade target (newest compatible version if omitted)
        #[arg(long)]
        version: Option<String>,
    },
    /// Installs of an app that other resources can connect to
    Services {
        app_key: String,
        /// Describe the template's services instead
        #[arg(long)]
        template: bool,
    },
    /// Versions an install can upgrade to
    Versions {
        id: InstallId,
        /// Include incompatible versions
        #[arg(long)]
        all: bool,
    },
    /// Move an install's published port
    ChangePort {
        app_key: String,
        name: String,
        port: u16,
        /// Service owning the port (primary port if omitted)
        #[arg(long)]
        service: Option<String>,
    },
    /// Print the config rendered when the install was created
    DefaultConfig {
        app_key: String,
        #[arg(default_value = "")]
        name: String,
    },
    /// Show an install's parameters and rendered config
    Params { id: InstallId },
    /// Update an install's parameters
    SetParams {
        id: InstallId,
        /// KEY=VALUE pairs; values are parsed as JSON when possible
        #[arg(short = 's', long = "set", value_parser = parse_key_value, required = true)]
        values: Vec<(String, String)>,
    },
    /// Stop offering an upgrade version
    IgnoreUpgrade { id: InstallId, version: String },
    /// Remove an install and its containers
    Delete {
        id: InstallId,
        /// Keep going when container teardown fails
        #[arg(long)]
        force: bool,
    },
    /// Record a new install before its containers are created
    Register {
        app_key: String,
        name: String,
        version: String,
        #[arg(short = 's', long = "set", value_parser = parse_key_value)]
        values: Vec<(String, String)>,
    },
    /// Mark a registered install as finished
    Complete {
        id: InstallId,
        /// Record the install as failed with this reason
        #[arg(long)]
        failed: Option<String>,
    },
    /// Record that an external resource depends on an install
    Bind {
        id: InstallId,
        kind: String,
        resource_id: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a dependency binding
    Unbind { kind: String, resource_id: String },
    /// Run the periodic sync loop until interrupted
    Daemon,
    /// Validate the configuration file
    Validate,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn parse_action(s: &str) -> Result<Action, String> {
    s.parse()
}

fn parse_status(s: &str) -> Result<InstallStatus, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown status '{s}'"))
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
