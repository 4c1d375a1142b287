use anyhow::{Context, Result};
use faceattend_hw::CaptureSession;
use faceattendd::proxy::{self, GatewayState};
use faceattendd::{
    ApiContext, AttendanceClient, CaptureScheduler, Config, LocalStore, SchedulerEvent,
    SchedulerHandle,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(api = %config.api_url, listen = %config.listen, "faceattendd starting");

    let store = LocalStore::open(config.store_path()).context("failed to open local store")?;
    let ctx = Arc::new(ApiContext::new(
        config.api_url.clone(),
        config.recognize_path.clone(),
    ));
    if let Some(token) = config.admin_token.as_deref().or(store.admin_token()) {
        ctx.login(token);
    } else {
        tracing::warn!(
            "no admin token configured; run `faceattend login` or set FACEATTEND_ADMIN_TOKEN"
        );
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let shutdown = CancellationToken::new();
    let gateway = GatewayState::new(
        ctx.clone(),
        config.submit_timeout(),
        config.max_upload_bytes(),
    );
    let stop_serving = shutdown.clone();
    let server = tokio::spawn(proxy::serve(listener, gateway, async move {
        stop_serving.cancelled().await
    }));

    let scheduler = match config.camera.as_deref() {
        Some(camera) => Some(start_capture(&config, &store, ctx.clone(), camera).await?),
        None => {
            tracing::info!("no camera configured; capture loop disabled");
            None
        }
    };

    tracing::info!("faceattendd ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("faceattendd shutting down");

    if let Some(handle) = scheduler {
        if let Err(e) = handle.shutdown().await {
            tracing::warn!(error = %e, "capture scheduler did not shut down cleanly");
        }
    }
    shutdown.cancel();
    server
        .await
        .context("gateway task panicked")?
        .context("gateway failed")?;

    Ok(())
}

async fn start_capture(
    config: &Config,
    store: &LocalStore,
    ctx: Arc<ApiContext>,
    camera: &str,
) -> Result<SchedulerHandle> {
    let target = store.resolve_camera(camera);
    let mut session = CaptureSession::new(config.security_context());
    session
        .connect(&target)
        .await
        .with_context(|| format!("failed to open camera {target}"))?;
    tracing::info!(camera = %session.describe().unwrap_or(target), "camera connected");

    let recognizer = Arc::new(AttendanceClient::new(ctx, config.submit_timeout()));
    let (handle, events) =
        CaptureScheduler::spawn(Box::new(session), recognizer, config.scheduler_config());
    tokio::spawn(log_events(events));

    let interval = handle.start(config.capture_interval()).await?;
    tracing::info!(interval_ms = interval.as_millis() as u64, "capture loop running");
    Ok(handle)
}

async fn log_events(mut events: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SchedulerEvent::Attendance(e) => {
                tracing::info!(subject = %e.subject.id, kind = e.kind.as_str(), "{}", e.text);
            }
            SchedulerEvent::CycleCompleted {
                recognized,
                unrecognized,
                total_faces,
                processing_time_ms,
            } => tracing::debug!(
                recognized,
                unrecognized,
                total_faces,
                processing_time_ms,
                "cycle completed"
            ),
            SchedulerEvent::CaptureFailed { message, fatal: true } => {
                tracing::error!(error = %message, "camera lost; capture stopped");
            }
            SchedulerEvent::CaptureFailed { message, fatal: false } => {
                tracing::warn!(error = %message, "frame capture failed");
            }
            SchedulerEvent::RecognitionFailed(failure) => {
                tracing::warn!(
                    kind = ?failure.kind,
                    error = %failure.message,
                    "recognition failed"
                );
            }
            SchedulerEvent::Stopped { reason } => tracing::info!(%reason, "capture loop stopped"),
        }
    }
}
