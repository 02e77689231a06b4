use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;

use stat_projections_runtime::api;
use stat_projections_runtime::cli::Cli;
use stat_projections_runtime::config::Config;
use stat_projections_runtime::error::AppError;
use stat_projections_runtime::logging::init_logging;
use stat_projections_runtime::runtime::Runtime;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    if let Err(err) = run(Cli::parse()).await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = Config::from_env().map_err(AppError::Config)?;
    config.apply_cli(&cli).map_err(AppError::Config)?;
    tracing::info!("Service starting with config: {:?}", config);

    let bind_addr = config.bind_addr;
    let runtime = Runtime::from_config(config)?;
    runtime.register_builtin_jobs().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = api::router(runtime.state());
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!("Listening on {}", bind_addr);

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let mut scheduler_shutdown = shutdown_rx;
    let scheduler = runtime.run_scheduler(async move {
        let _ = scheduler_shutdown.wait_for(|stop| *stop).await;
    });

    tokio::join!(scheduler, async {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    match server.await {
        Ok(result) => result?,
        Err(err) => return Err(AppError::Server(std::io::Error::other(err))),
    }
    tracing::info!("Service stopped cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
