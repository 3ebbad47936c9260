use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use steady_dispatch::{http, DispatchConfig, DispatchManager};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// HTTP ingress for the dispatch layer.
#[derive(Debug, Parser)]
#[command(name = "steady-dispatch", version)]
struct Args {
    /// YAML file describing connections. Without it a single `default`
    /// connection runs jobs inline.
    #[arg(short, long, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the file and `DISPATCH_BIND`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let mut config = match &args.config {
        Some(path) => DispatchConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DispatchConfig::default(),
    }
    .apply_env();
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let manager = Arc::new(DispatchManager::new(&config));
    info!("connections: {:?}", manager.connection_names());
    let app = http::router(manager, &config);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!("listening on {}", config.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for ctrl-c: {}", e);
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}
