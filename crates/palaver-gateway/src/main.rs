use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use palaver_core::PalaverConfig;
use palaver_extensions::FactoryTable;
use tracing::info;

mod app;
mod backends;
mod http;
mod startup;
mod telnet;

/// Multi-platform chat gateway.
#[derive(Debug, Parser)]
#[command(name = "palaver", version, about)]
struct Cli {
    /// Config file path (default: ~/.palaver/palaver.toml).
    #[arg(short, long, env = "PALAVER_CONFIG")]
    config: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

const DEFAULT_LOG_FILTER: &str =
    "palaver_gateway=info,palaver_pipeline=info,palaver_ipc=info,palaver_channels=info,palaver_extensions=info,palaver_context=info,tower_http=info";

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    // Misconfiguration is fatal: nothing starts on a bad file.
    let config = PalaverConfig::load(cli.config.as_deref())?;
    let http_addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let telnet_addr: SocketAddr = format!("{}:{}", config.telnet.bind, config.telnet.port).parse()?;

    let runtime = startup::build(config, &FactoryTable::with_builtins()).await?;
    let state = Arc::clone(&runtime.state);
    let pipeline = Arc::clone(&state.pipeline);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let router_task = Arc::clone(&state.router).spawn_consumer(runtime.commands, shutdown_rx.clone());
    let inbound_task = startup::spawn_inbound(Arc::clone(&pipeline), runtime.inbound, shutdown_rx.clone());
    let schedules = runtime.schedules;
    let schedule_rx = shutdown_rx.clone();
    tokio::spawn(async move { schedules.run(schedule_rx).await });

    if let Some(ref client) = state.telnet {
        let listener = tokio::net::TcpListener::bind(telnet_addr).await?;
        tokio::spawn(telnet::serve(
            listener,
            Arc::clone(&pipeline),
            Arc::clone(client),
            shutdown_rx.clone(),
        ));
    }

    let router = app::build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!("palaver gateway listening on {}", http_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    pipeline.shutdown();
    let _ = router_task.await;
    let _ = inbound_task.await;
    info!("palaver gateway stopped");
    Ok(())
}
