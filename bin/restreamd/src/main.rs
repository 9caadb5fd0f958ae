mod api;
mod config;
mod playlist;

use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use fake_user_agent::get_chrome_rua;
use restream::{ChannelRegistry, HttpClient, SegmentSource};
use tokio::net::TcpListener;

use crate::{api::App, config::Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .try_from_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let engine = args.engine()?;
    tracing::info!(
        playlist = %args.m3u_path.display(),
        video_bandwidth = engine.video_bandwidth,
        autostart = args.autostart,
        "Starting restreamd"
    );

    let client = HttpClient::builder()
        .timeout(engine.request_timeout)
        .user_agent(get_chrome_rua())
        .proxy(args.proxy.clone())
        .build()?;
    let app = Arc::new(App {
        registry: ChannelRegistry::http(engine, client),
        playlist: args.m3u_path.clone(),
        autostart: args.autostart,
    });

    if app.playlist.exists() {
        let channels = playlist::load(&app.playlist).await?;
        app.registry.reload(channels, app.autostart).await;
    } else {
        tracing::warn!(
            playlist = %app.playlist.display(),
            "Playlist not found, POST /api/reload once it is in place"
        );
    }

    let addr = SocketAddr::new(args.host, args.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, api::router(app.clone()))
        .with_graceful_shutdown(shutdown(app))
        .await?;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM, after every channel was stopped so that open
/// streams end and the server can drain.
async fn shutdown<S: SegmentSource>(app: Arc<App<S>>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutting down");
    app.registry.shutdown().await;
}
