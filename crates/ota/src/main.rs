mod journal;
mod logging;
mod single_instance;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use ota_core::{
    BootOutcome, BootRecoveryController, ReqwestTransport, UpdateContext, UpdateSettings,
};
use ota_platform::{DevicePaths, JsonConfigStore, LinkMonitor, ResetPrimitive, SystemReset};
use thiserror::Error;

use journal::UpdateJournal;
use single_instance::{AcquireError, SingleInstance};

const DEFAULT_PROBE_HOST: &str = "api.github.com";
const DEFAULT_PROBE_PORT: u16 = 443;
const LINK_PROBE_INTERVAL: Duration = Duration::from_secs(5);
const LOCK_RETRIES: u32 = 10;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
enum StartupError {
    #[error("could not resolve device root: {0}")]
    Paths(#[from] ota_platform::DevicePathsError),
    #[error("failed to prepare device directories: {0}")]
    Dirs(#[source] std::io::Error),
    #[error(transparent)]
    Lock(AcquireError),
    #[error("failed to build HTTP client: {0}")]
    Transport(#[from] ota_core::TransportError),
}

#[tokio::main]
async fn main() -> ExitCode {
    match boot().await {
        Ok(outcome) => {
            if matches!(outcome, BootOutcome::RecoveryFailed(_)) {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(StartupError::Lock(AcquireError::AlreadyRunning)) => {
            warn!("Update engine already running, exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Startup failed: {e}");
            eprintln!("ota: {e}");
            ExitCode::FAILURE
        }
    }
}

/// A restart-mode reset spawns the next engine before this one exits, so
/// the lock may still be held for a moment.
async fn acquire_instance(paths: &DevicePaths) -> Result<SingleInstance, StartupError> {
    let lock_path = paths.lock_file();
    let mut retries = 0;
    loop {
        match SingleInstance::acquire(&lock_path) {
            Err(AcquireError::AlreadyRunning) if retries < LOCK_RETRIES => {
                retries += 1;
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
            result => return result.map_err(StartupError::Lock),
        }
    }
}

/// Holds a reset the controller asked for until the boot outcome is on disk.
#[derive(Default)]
struct DeferredReset {
    requested: AtomicBool,
}

impl DeferredReset {
    fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl ResetPrimitive for DeferredReset {
    fn reset(&self) {
        info!("Reset requested");
        self.requested.store(true, Ordering::SeqCst);
    }
}

async fn boot() -> Result<BootOutcome, StartupError> {
    let paths = DevicePaths::new()?;
    paths.ensure_dirs().map_err(StartupError::Dirs)?;

    let config = start_logging(&paths);

    let _instance = acquire_instance(&paths).await?;

    info!(
        "ota {} starting, device root {}",
        env!("CARGO_PKG_VERSION"),
        paths.root.display()
    );

    let settings = UpdateSettings::from_config(&config);
    let transport = ReqwestTransport::new(&settings.transport_options())?;

    let (probe_host, probe_port) = settings
        .endpoint
        .as_ref()
        .and_then(ota_core::ReleaseEndpoint::probe_target)
        .unwrap_or_else(|| (DEFAULT_PROBE_HOST.to_string(), DEFAULT_PROBE_PORT));
    let network = LinkMonitor::new(probe_host, probe_port, LINK_PROBE_INTERVAL);
    let reset_mode = settings.reset_mode;
    let reset = DeferredReset::default();

    let ctx = UpdateContext {
        paths: &paths,
        config: &config,
        network: &network,
        transport: &transport,
        reset: &reset,
    };

    let mut controller = BootRecoveryController::with_settings(ctx, settings);
    let outcome = controller.run().await;

    match &outcome {
        BootOutcome::RecoveryFailed(_) => error!("FATAL: boot finished: {outcome}"),
        BootOutcome::AttemptFailed { .. } | BootOutcome::NetworkUnavailable => {
            warn!("Boot finished: {outcome}");
        }
        _ => info!("Boot finished: {outcome}"),
    }
    UpdateJournal::new(paths.update_log_file(), journal::DEFAULT_MAX_JOURNAL_SIZE)
        .record(&outcome);
    log::logger().flush();

    if reset.requested() {
        SystemReset::new(reset_mode).reset();
    }

    Ok(outcome)
}

/// The logger comes up before the config is read so config load problems
/// reach the log file; the config then sets the level.
fn start_logging(paths: &DevicePaths) -> JsonConfigStore {
    logging::init_logging(&paths.log_file(), logging::DEFAULT_MAX_LOG_SIZE);
    let config = JsonConfigStore::open(paths.config_file());
    logging::apply_config(&config);
    config
}
