//! Image Proxy - MITM forward proxy that replaces images with a placeholder.
//!
//! Runs the intercepting proxy and, unless disabled, the trust server that
//! hands out the root certificate.

use std::path::Path;

use clap::Parser;
use image_proxy::{Dispatcher, ProxyServer};
use image_proxy_app::config::{generate_ca, Args, Command};
use image_proxy_app::telemetry::TimedResponseHook;
use image_proxy_server::{TrustServer, TrustServerConfig, TrustState};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging, optionally with a daily rolling file.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("image_proxy={},warn", log_level)));

    if let Some(log_dir) = args.log_dir.as_deref() {
        match file_appender(log_dir) {
            Ok(appender) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
            Err(e) => {
                tracing_subscriber::fmt().with_env_filter(env_filter).init();
                tracing::warn!("File logging unavailable ({}), using console only", e);
                return None;
            }
        }
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

fn file_appender(log_dir: &Path) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)?;
    Ok(RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(5)
        .filename_prefix("image-proxy")
        .filename_suffix("log")
        .build(log_dir)?)
}

async fn serve(args: Args) -> anyhow::Result<()> {
    let config = args.proxy_config()?;
    let context = args.load_context()?;

    if args.trust_port != 0 {
        let state = TrustState::from_authority(context.authority(), config.addr.port());
        let trust = TrustServer::new(
            TrustServerConfig::default()
                .with_host(args.bind.to_string())
                .with_port(args.trust_port),
            state,
        )?;
        tokio::spawn(async move {
            if let Err(e) = trust.run().await {
                tracing::error!("Trust server error: {}", e);
            }
        });
    }

    let dispatcher = Dispatcher::builder(context).wrap_response_hook(TimedResponseHook::new);
    let server = ProxyServer::bind(config, dispatcher).await?;
    let handle = server.start()?;
    tracing::info!("Image proxy ready on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, shutting down");
    handle.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_logging(&args);

    if let Some(Command::GenerateCa { out, common_name }) = &args.command {
        let (cert, key) = generate_ca(out, common_name)?;
        tracing::info!("Wrote {} and {}", cert.display(), key.display());
        println!("Root certificate: {}", cert.display());
        println!("Private key:      {}", key.display());
        return Ok(());
    }

    tracing::info!("Starting Image Proxy...");
    serve(args).await
}
