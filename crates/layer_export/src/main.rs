use anyhow::Context;
use clap::Parser;
use layer_export::platform::TaskState;
use layer_export::{
    Config, InMemoryPlatform, LayerExporter, LayerReport, LogFormat, Metrics, Platform,
    RestPlatform, RunSettings,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_format);

    let settings = config.settings()?;
    tracing::info!(settings = ?settings, dry_run = config.dry_run, "Loaded configuration");

    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::warn!("Shutdown signal received. Aborting; submitted tasks keep running remotely.");
            cancel.cancel();
        });
    }

    let result = if config.dry_run {
        let platform = InMemoryPlatform::new(&settings.project)
            .with_default_script(vec![TaskState::Completed]);
        run(platform, settings, metrics.clone(), cancel).await
    } else {
        let platform = RestPlatform::new(
            &config.api_base,
            &settings.project,
            config.access_token.clone(),
            config.http_timeout(),
        )
        .context("Failed to create platform client")?;
        run(platform, settings, metrics.clone(), cancel).await
    };

    match &config.metrics_file {
        Some(path) => {
            if let Err(e) = metrics.write_to(path) {
                tracing::error!(error = %e, path = %path.display(), "Failed to write metrics file");
            }
        }
        None => match metrics.render() {
            Ok(text) => tracing::debug!(metrics = %text, "Run metrics"),
            Err(e) => tracing::error!(error = %e, "Failed to render metrics"),
        },
    }

    for report in result? {
        tracing::info!(
            layer = %report.layer,
            rows = report.rows,
            batches = report.batches,
            submitted = report.submitted,
            skipped = report.skipped,
            merged = ?report.merged_asset_id.as_ref().map(|id| id.to_string()),
            cleanup_failures = report.cleanup.as_ref().map_or(0, |c| c.failed.len()),
            "Layer summary"
        );
    }
    Ok(())
}

async fn run<P: Platform>(
    platform: P,
    settings: RunSettings,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<LayerReport>> {
    LayerExporter::new(platform, settings, metrics, cancel).run().await
}

fn init_tracing(format: LogFormat) {
    let builder = fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
