use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::backends::cloud_monitoring::DEFAULT_ENDPOINT;
use crate::pull_server::DEFAULT_LISTEN_ADDR;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the exporter daemon, following changes to the config file
    Daemon(Box<DaemonArgs>),
    /// Parse a config file and print the resulting exporter config
    #[command(name = "validate-config")]
    ValidateConfig(ValidateConfigArgs),
}

/// Arguments identifying the config file and the metrics it applies to.
#[derive(Parser, Clone, Debug)]
pub struct ConfigSourceArgs {
    #[arg(
        long,
        env = "METRICS_CONFIG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Path of the observability ConfigMap data, e.g. /etc/config-observability/config.yaml"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "METRICS_DOMAIN",
        help = "Metric domain, e.g. knative.dev/serving"
    )]
    pub domain: String,

    #[arg(
        long,
        env = "METRICS_COMPONENT",
        help = "Component emitting the metrics, e.g. autoscaler"
    )]
    pub component: String,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub source: ConfigSourceArgs,

    #[arg(
        long,
        env = "METRICS_LISTEN_ADDR",
        default_value = DEFAULT_LISTEN_ADDR,
        help = "Address the scrape endpoint of pull backends binds to"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        env = "CLOUD_MONITORING_ENDPOINT",
        default_value = DEFAULT_ENDPOINT,
        help = "Base URL of the cloud monitoring API used by push backends"
    )]
    pub cloud_monitoring_endpoint: String,

    #[arg(
        long,
        env = "CLOUD_MONITORING_ACCESS_TOKEN",
        hide_env_values = true,
        help = "Bearer token sent with push requests"
    )]
    pub access_token: Option<String>,

    #[arg(
        long,
        env = utils::logging::LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::FilePath,
        help = "Write logs to a daily rolling file instead of stderr"
    )]
    pub log_file: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
pub struct ValidateConfigArgs {
    #[command(flatten)]
    pub source: ConfigSourceArgs,
}
