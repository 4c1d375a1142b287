use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use faceattend_hw::remote::{self, RemoteEndpoint};
use faceattend_hw::{CaptureError, CaptureSession, FrameSource, SecurityContext};
use faceattendd::{
    ApiContext, AttendanceClient, CameraPreset, CaptureScheduler, Config, LocalStore,
    SchedulerEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "faceattend", about = "FaceAttend attendance capture CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save the admin token used for the attendance service
    Login {
        #[arg(short, long)]
        token: String,
    },
    /// Forget the saved admin token
    Logout,
    /// Manage saved IP camera addresses
    Presets {
        #[command(subcommand)]
        action: PresetAction,
    },
    /// Show how a camera address is interpreted
    Resolve {
        /// IP, IP:port or full URL
        address: String,
        /// Ask the camera which stream type it serves
        #[arg(long)]
        probe: bool,
    },
    /// Capture a single frame to a JPEG file
    Snapshot {
        /// Device path, camera address or preset name (default: configured camera or /dev/video0)
        #[arg(short, long)]
        camera: Option<String>,
        #[arg(short, long, default_value = "snapshot.jpg")]
        output: PathBuf,
    },
    /// Run the capture loop and print Welcome/Goodbye notifications
    Watch {
        #[arg(short, long)]
        camera: Option<String>,
        /// Capture interval in milliseconds (minimum 500)
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum PresetAction {
    /// List saved presets
    List,
    /// Save a preset, replacing one with the same name
    Add { name: String, address: String },
    /// Delete a preset
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    let mut store = LocalStore::open(config.store_path()).context("failed to open local store")?;

    match cli.command {
        Commands::Login { token } => {
            if token.trim().is_empty() {
                bail!("token must not be empty");
            }
            store.set_admin_token(&token)?;
            println!("Token saved to {}", store.path().display());
        }
        Commands::Logout => {
            if store.clear_admin_token()? {
                println!("Logged out");
            } else {
                println!("No token was saved");
            }
        }
        Commands::Presets { action } => presets(&mut store, action)?,
        Commands::Resolve { address, probe } => resolve(&address, probe).await?,
        Commands::Snapshot { camera, output } => {
            let target = camera_target(&config, &store, camera);
            snapshot(&target, &output).await?;
        }
        Commands::Watch {
            camera,
            interval_ms,
        } => {
            let target = camera_target(&config, &store, camera);
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.capture_interval());
            watch(&config, &store, &target, interval).await?;
        }
    }

    Ok(())
}

fn camera_target(config: &Config, store: &LocalStore, camera: Option<String>) -> String {
    let name = camera
        .or_else(|| config.camera.clone())
        .unwrap_or_else(|| "/dev/video0".to_string());
    store.resolve_camera(&name)
}

fn capture_error(e: CaptureError) -> anyhow::Error {
    anyhow!("{e}\n{}", e.user_message())
}

fn presets(store: &mut LocalStore, action: PresetAction) -> Result<()> {
    match action {
        PresetAction::List => {
            let presets = store.camera_presets();
            if presets.is_empty() {
                println!("No presets saved");
            }
            for p in presets {
                println!("{:<20} {}", p.name, p.url);
            }
        }
        PresetAction::Add { name, address } => {
            let endpoint = remote::resolve_remote(&address).map_err(capture_error)?;
            store.save_camera_preset(CameraPreset {
                name: name.clone(),
                url: address,
            })?;
            println!("Saved {name} -> {}", endpoint.url);
        }
        PresetAction::Remove { name } => {
            if !store.remove_camera_preset(&name)? {
                bail!("no preset named {name:?}");
            }
            println!("Removed {name}");
        }
    }
    Ok(())
}

async fn resolve(address: &str, probe: bool) -> Result<()> {
    let mut endpoint = remote::resolve_remote(address).map_err(capture_error)?;
    if probe {
        let client = reqwest::Client::new();
        let unprobed = RemoteEndpoint {
            url: endpoint.url,
            kind: None,
        };
        endpoint = remote::probe(&client, unprobed, remote::PROBE_TIMEOUT)
            .await
            .map_err(capture_error)?;
    }
    println!("url:  {}", endpoint.url);
    match endpoint.kind {
        Some(kind) => println!("kind: {kind}"),
        None => println!("kind: unknown (use --probe to ask the camera)"),
    }
    Ok(())
}

async fn snapshot(target: &str, output: &Path) -> Result<()> {
    // Frames stay on this machine, so no secure-endpoint requirement.
    let mut session = CaptureSession::new(SecurityContext::Secure);
    session.connect(target).await.map_err(capture_error)?;
    let frame = session.capture_frame().await;
    session.release().await;
    let frame = frame.map_err(capture_error)?;

    std::fs::write(output, &frame.jpeg)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Saved {}x{} frame to {}",
        frame.width,
        frame.height,
        output.display()
    );
    Ok(())
}

async fn watch(
    config: &Config,
    store: &LocalStore,
    target: &str,
    interval: Duration,
) -> Result<()> {
    let ctx = Arc::new(ApiContext::new(
        config.api_url.clone(),
        config.recognize_path.clone(),
    ));
    match config.admin_token.as_deref().or(store.admin_token()) {
        Some(token) => ctx.login(token),
        None => eprintln!("warning: no admin token saved; run `faceattend login`"),
    }

    let mut session = CaptureSession::new(config.security_context());
    session.connect(target).await.map_err(capture_error)?;
    println!(
        "Watching {} (Ctrl-C to stop)",
        session.describe().unwrap_or_else(|| target.to_string())
    );

    let recognizer = Arc::new(AttendanceClient::new(ctx, config.submit_timeout()));
    let (handle, mut events) =
        CaptureScheduler::spawn(Box::new(session), recognizer, config.scheduler_config());
    handle.start(interval).await?;

    let mut fatal = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SchedulerEvent::Attendance(e)) => {
                    println!("[{}] {}", e.occurred_at.format("%H:%M:%S"), e.text);
                }
                Some(SchedulerEvent::CycleCompleted { recognized, total_faces, .. }) => {
                    tracing::debug!(recognized, total_faces, "cycle completed");
                }
                Some(SchedulerEvent::CaptureFailed { message, fatal: true }) => {
                    fatal = Some(message);
                }
                Some(SchedulerEvent::CaptureFailed { message, fatal: false }) => {
                    eprintln!("capture: {message}");
                }
                Some(SchedulerEvent::RecognitionFailed(failure)) => {
                    eprintln!("recognition: {}", failure.message);
                }
                Some(SchedulerEvent::Stopped { .. }) | None => break,
            },
        }
    }

    handle.shutdown().await?;
    if let Some(message) = fatal {
        bail!("camera lost: {message}");
    }
    Ok(())
}
