use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use y2sj::{
    TransferRequest,
    config::AppConfig,
    run_pipeline,
    services::{
        extractor::{YtDlpConfig, YtDlpSource},
        local_store::LocalStorage,
    },
};

const CONFIG_ERROR_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config ---
    let cfg = match AppConfig::from_env_and_args() {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("{:#}", err);
            return ExitCode::from(CONFIG_ERROR_EXIT);
        }
    };
    tracing::debug!(
        video = %cfg.video,
        destination = %cfg.destination,
        quality = %cfg.quality,
        extractor = %cfg.extractor_path.display(),
        "configuration loaded"
    );

    // --- Ctrl-C cancels the transfer ---
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling transfer");
            on_signal.cancel();
        }
    });

    let source = YtDlpSource::new(YtDlpConfig {
        binary: cfg.extractor_path.clone(),
        ..YtDlpConfig::default()
    });
    let request = TransferRequest {
        source: cfg.video,
        destination: cfg.destination,
        grant: cfg.access_grant,
        quality: cfg.quality,
    };

    match run_pipeline(&request, &source, &LocalStorage, cfg.progress_interval, &cancel).await {
        Ok(report) => {
            tracing::info!(
                "stored {} bytes at sj://{}/{} in {:.1}s",
                report.bytes,
                report.location.bucket(),
                report.key,
                report.elapsed.as_secs_f64()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(kind = %err.kind(), "{}", err);
            ExitCode::from(err.exit_code())
        }
    }
}
