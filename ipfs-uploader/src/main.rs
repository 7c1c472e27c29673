use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use ipfs_uploader::{
    Application, Config,
    backends::kubo::KuboFactory,
    build_lifecycle, commands,
    config::{Args, Command},
    lifecycle::spawn_signal_handlers,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // These work on the config file itself, so they must not require it to load
    match &args.command {
        Some(Command::Init { url, api_key, force }) => {
            return commands::init(Path::new(&args.config), url.clone(), api_key.clone(), *force).await;
        }
        Some(Command::Reset { force }) => {
            telemetry::init_telemetry(false)?;
            return commands::reset(Path::new(&args.config), *force).await;
        }
        _ => {}
    }

    // Load configuration
    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize telemetry (tracing + optional OpenTelemetry)
    telemetry::init_telemetry(config.enable_otel_export)?;

    tracing::debug!("{:?}", args);

    let result = match args.command {
        Some(Command::Upload { deadline, target }) => {
            let lifecycle = build_lifecycle(&config, Arc::new(KuboFactory))?;
            spawn_signal_handlers(lifecycle.clone())?;

            let result = commands::upload(&lifecycle, target, deadline).await;
            lifecycle.shutdown().await;
            result
        }
        _ => {
            // Runs until SIGTERM/SIGQUIT/Ctrl+C moves the lifecycle into shutdown
            let app = Application::new(config)?;
            spawn_signal_handlers(app.lifecycle())?;
            app.serve().await.map(|report| {
                tracing::info!(released_handles = report.released_handles, forced = report.forced, "Server stopped");
            })
        }
    };

    telemetry::shutdown_telemetry();
    result
}
