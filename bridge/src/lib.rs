// sop bridge
//
// Process bootstrap for the sequencer: logging, the tokio runtime, settings
// and start-up of the actor with its workers.

mod error;
mod event;
mod settings;

pub use error::*;
pub use event::*;
pub use settings::*;

use anyhow::Context;
use futures::FutureExt;
use sop_sequencer::{EventBus, Models, SimulatedDeviceOps, SopActor, SopContext, StatusModel};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Prefix of the daily rolling log files
pub const LOG_FILE_PREFIX: &str = "sop.log";

/// Days of log files kept at start-up
const LOG_KEEP_DAYS: i64 = 7;

/// Global Tokio runtime for callers without one
static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Set once runtime creation has failed for good
static RUNTIME_INIT_FAILED: AtomicBool = AtomicBool::new(false);

static RUNTIME_ERROR_MSG: OnceLock<String> = OnceLock::new();

static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Keeps the non-blocking file writer alive
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// The global runtime, created on first use
///
/// Never panics; a permanent creation failure is remembered and returned to
/// every later caller.
pub fn ensure_runtime() -> Result<&'static Runtime, BridgeError> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    if RUNTIME_INIT_FAILED.load(Ordering::Acquire) {
        let msg = RUNTIME_ERROR_MSG
            .get()
            .map(|s| s.as_str())
            .unwrap_or("Unknown runtime initialization failure");
        return Err(BridgeError::RuntimeInitFailed(msg.to_string()));
    }

    match try_create_runtime_with_fallbacks() {
        Ok(rt) => Ok(RUNTIME.get_or_init(|| rt)),
        Err(error_msg) => {
            tracing::error!("Runtime initialization failed permanently: {}", error_msg);
            let _ = RUNTIME_ERROR_MSG.set(error_msg.clone());
            RUNTIME_INIT_FAILED.store(true, Ordering::Release);
            Err(BridgeError::RuntimeInitFailed(error_msg))
        }
    }
}

fn try_create_runtime_with_fallbacks() -> Result<Runtime, String> {
    match Runtime::new() {
        Ok(rt) => {
            tracing::debug!("Created multi-threaded Tokio runtime");
            return Ok(rt);
        }
        Err(e) => tracing::warn!("Failed to create default Tokio runtime: {}", e),
    }

    // Workers need timers, so there is no minimal fallback
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map(|rt| {
            tracing::warn!("Using single-threaded Tokio runtime as fallback");
            rt
        })
        .map_err(|e| format!("All runtime creation attempts failed: {}", e))
}

fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let msg = panic_info.to_string();
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        eprintln!("PANIC at {}: {}", location, msg);
        tracing::error!("PANIC at {}: {}", location, msg);
    }));
}

/// Install the log subscriber and the panic hook
///
/// Logs go to the console, and to `sop.log.YYYY-MM-DD` under
/// `log_directory` when one is given. `RUST_LOG` overrides the default
/// `info` level. Calling this twice leaves the first subscriber in place.
pub fn init_logging(log_directory: Option<&Path>) -> BridgeResult<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    init_panic_handler();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(false).with_ansi(true);

    let Some(log_dir) = log_directory else {
        if tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .is_ok()
        {
            tracing::info!("sop logging initialized (console only)");
        }
        return Ok(());
    };

    std::fs::create_dir_all(log_dir)?;
    LOG_DIR.set(log_dir.to_path_buf()).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::warn!("A log subscriber was already installed; {} not attached", log_dir.display());
        return Ok(());
    }

    tracing::info!("sop logging initialized; log directory: {}", log_dir.display());
    cleanup_old_logs(log_dir, LOG_KEEP_DAYS);
    Ok(())
}

pub fn get_log_directory() -> Option<PathBuf> {
    LOG_DIR.get().cloned()
}

/// Today's log file, if file logging is on
pub fn get_current_log_file() -> Option<PathBuf> {
    LOG_DIR.get().map(|dir| {
        let today = chrono::Local::now().format("%Y-%m-%d");
        dir.join(format!("{}.{}", LOG_FILE_PREFIX, today))
    })
}

/// Delete `sop.log.YYYY-MM-DD` files older than `keep_days`
///
/// Returns how many were removed. Files with other names are left alone.
pub fn cleanup_old_logs(log_dir: &Path, keep_days: i64) -> usize {
    use chrono::TimeZone;

    let cutoff = chrono::Local::now() - chrono::Duration::days(keep_days);
    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read log directory for cleanup: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(date_str) = name
            .strip_prefix(LOG_FILE_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };
        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };
        let Some(file_datetime) = file_date.and_hms_opt(0, 0, 0) else {
            continue;
        };
        let Some(file_local) = chrono::Local.from_local_datetime(&file_datetime).single() else {
            continue;
        };

        if file_local < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!("Deleted old log file: {:?}", path);
                    removed += 1;
                }
                Err(e) => tracing::warn!("Failed to delete old log file {:?}: {}", path, e),
            }
        }
    }
    removed
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Run `future` to completion on the global runtime
///
/// For synchronous callers. A panic inside the future comes back as
/// [`BridgeError::Internal`].
pub fn run_async_safe<F, T>(future: F) -> BridgeResult<T>
where
    F: std::future::Future<Output = BridgeResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let runtime = ensure_runtime()?;
    match runtime.block_on(AssertUnwindSafe(future).catch_unwind()) {
        Ok(result) => result,
        Err(payload) => {
            let msg = extract_panic_message(&payload);
            tracing::error!("Panic during async execution: {}", msg);
            Err(BridgeError::Internal(format!("Panic during async execution: {}", msg)))
        }
    }
}

/// A running sequencer and its event log
pub struct SopBridge {
    actor: Arc<SopActor>,
    event_log: JoinHandle<()>,
}

impl SopBridge {
    /// Build the context, start every worker and load the initial plate
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(settings: &BridgeSettings) -> BridgeResult<Self> {
        settings.validate()?;

        let events = EventBus::default();
        let event_log = spawn_event_log(&events);

        let status = Arc::new(StatusModel::new(Models::quiescent(tokio::time::Instant::now())));
        let ops = Arc::new(SimulatedDeviceOps::new(status.clone()));
        let ctx = Arc::new(SopContext::new(settings.sop.clone(), status, ops, events));
        for name in &settings.bypasses {
            ctx.bypass.set(name, true)?;
        }

        let actor = SopActor::start(ctx)?;
        if settings.cartridge != actor.context().cartridge() {
            actor.update_cartridge(settings.cartridge);
        }
        tracing::info!(
            "sop started: cartridge={} survey={}",
            actor.context().cartridge(),
            actor.context().survey()
        );
        Ok(Self {
            actor: Arc::new(actor),
            event_log,
        })
    }

    pub fn actor(&self) -> Arc<SopActor> {
        self.actor.clone()
    }

    /// Stop every worker and the event log
    pub async fn shutdown(self) {
        self.actor.shutdown().await;
        self.event_log.abort();
        tracing::info!("sop shut down");
    }
}

/// Load settings from `path`, set up logging and start the sequencer
///
/// Must be called from within a tokio runtime.
pub fn start_from_file(path: &Path) -> anyhow::Result<SopBridge> {
    let settings = BridgeSettings::load(path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    init_logging(settings.log_directory.as_deref()).context("failed to initialize logging")?;
    let bridge = SopBridge::start(&settings).context("failed to start the sequencer")?;
    Ok(bridge)
}

/// Version of the bridge crate
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_sequencer::Survey;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sop-bridge-{}-{}", uuid::Uuid::new_v4(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_cleanup_old_logs() {
        let dir = temp_dir("logs");
        let old = (chrono::Local::now() - chrono::Duration::days(30)).format("%Y-%m-%d");
        let today = chrono::Local::now().format("%Y-%m-%d");
        std::fs::write(dir.join(format!("sop.log.{}", old)), "old").unwrap();
        std::fs::write(dir.join(format!("sop.log.{}", today)), "new").unwrap();
        std::fs::write(dir.join("notes.txt"), "keep").unwrap();

        assert_eq!(cleanup_old_logs(&dir, 7), 1);
        assert!(dir.join(format!("sop.log.{}", today)).exists());
        assert!(dir.join("notes.txt").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_run_async_safe_catches_panics() {
        assert_eq!(run_async_safe(async { Ok(7) }).unwrap(), 7);
        let result: BridgeResult<()> = run_async_safe(async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        assert!(matches!(result, Err(BridgeError::Internal(msg)) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_start_with_settings() {
        let settings = BridgeSettings {
            cartridge: 3,
            bypasses: vec!["ffs".to_string()],
            ..Default::default()
        };
        let bridge = SopBridge::start(&settings).unwrap();
        let actor = bridge.actor();
        assert_eq!(actor.context().survey(), Survey::Apogee);
        assert!(actor.context().bypass.get("ffs"));

        actor.ping();
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_from_missing_file_uses_defaults() {
        let dir = temp_dir("start");
        let bridge = start_from_file(&dir.join("sop.json")).unwrap();
        assert_eq!(bridge.actor().context().cartridge(), -1);
        bridge.shutdown().await;
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_start_rejects_unknown_bypass() {
        let settings = BridgeSettings {
            bypasses: vec!["dome".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            SopBridge::start(&settings),
            Err(BridgeError::InvalidSettings(_))
        ));
    }
}
