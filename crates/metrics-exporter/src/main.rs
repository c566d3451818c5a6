use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use metrics_exporter::app::Application;
use metrics_exporter::config::exporter_config_from_map;
use metrics_exporter::config::load_config_map;
use metrics_exporter::config::Cli;
use metrics_exporter::config::Commands;
use metrics_exporter::config::DaemonArgs;
use metrics_exporter::config::ValidateConfigArgs;
use metrics_exporter::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ValidateConfig(validate_args) => run_validate_config(validate_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_file.as_deref());

    tracing::info!("Starting metrics exporter daemon {}", &**version::VERSION);

    let app = Application::new(daemon_args);

    let run_result = app.run().await;
    app.shutdown().await?;
    run_result
}

fn run_validate_config(args: ValidateConfigArgs) -> Result<()> {
    let source = &args.source;
    let data = load_config_map(&source.config)
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("failed to load config")?;
    let config = exporter_config_from_map(&data, &source.domain, &source.component)
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("invalid metrics config")?;

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
