//! Terminal and file logging for control sessions.

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock, PoisonError},
};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

/// Filter used when `RUST_LOG` is unset or invalid
const DEFAULT_FILTER: &str = "info";

type SessionFileLayer = fmt::Layer<
    Registry,
    fmt::format::DefaultFields,
    fmt::format::Format<fmt::format::Full, fmt::time::ChronoUtc>,
    NonBlocking,
>;

/// Installed once per process
static SESSION_LOG: OnceLock<SessionLog> = OnceLock::new();

/// The per-session file output of the installed subscriber.
struct SessionLog {
    /// Swaps the file layer when a new session starts
    reload: reload::Handle<SessionFileLayer, Registry>,

    /// Writer threads; dropping a guard flushes its writer
    file_guard: Mutex<WorkerGuard>,
    _stdout_guard: WorkerGuard,
}

/// A session log file opened behind a non-blocking writer
struct SessionFile {
    path: PathBuf,
    writer: NonBlocking,
    guard: WorkerGuard,
}

impl SessionFile {
    /// Open `<op_dir>/logs/<op_name>.log` for appending
    fn open(op_dir: &Path, op_name: &str) -> Result<Self, String> {
        let dir = op_dir.join("logs");
        fs::create_dir_all(&dir).map_err(|e| format!("Failed to create log directory: {e}"))?;

        let path = dir.join(format!("{op_name}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| format!("Failed to open log file {}: {e}", path.display()))?;

        let (writer, guard) = tracing_appender::non_blocking(file);
        Ok(Self {
            path,
            writer,
            guard,
        })
    }

    fn layer(writer: NonBlocking) -> SessionFileLayer {
        fmt::layer::<Registry>()
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .with_writer(writer)
            .with_ansi(false)
    }
}

impl SessionLog {
    /// Install the global subscriber with terminal output and `file`
    fn install(file: SessionFile) -> Result<Self, String> {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
            .map_err(|e| format!("Failed to set up logging env filter: {e}"))?;

        let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
        let stdout_layer = fmt::layer()
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .with_writer(stdout_writer)
            .with_thread_names(true)
            .with_target(false);

        let (file_layer, reload) = reload::Layer::new(SessionFile::layer(file.writer));

        tracing_subscriber::registry()
            .with(file_layer)
            .with(env_filter)
            .with(stdout_layer)
            .try_init()
            .map_err(|e| format!("Failed to initialize logging: {e}"))?;

        Ok(Self {
            reload,
            file_guard: Mutex::new(file.guard),
            _stdout_guard: stdout_guard,
        })
    }

    /// Send file output to `file` from now on
    fn switch_to(&self, file: SessionFile) -> Result<(), String> {
        let mut current = self
            .file_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.reload
            .modify(|layer| *layer = SessionFile::layer(file.writer))
            .map_err(|e| format!("Failed to reload logging file layer: {e}"))?;

        // Flushes the previous file
        *current = file.guard;
        Ok(())
    }
}

/// Log to the terminal and to `<op_dir>/logs/<op_name>.log`.
///
/// Logging is process-global. The first call installs the subscriber,
/// with the level filter taken from `RUST_LOG` (default `info`). Later
/// calls keep the terminal output and move the file output.
/// Returns the path of the log file.
pub fn init_logging(op_dir: &Path, op_name: &str) -> Result<PathBuf, String> {
    let file = SessionFile::open(op_dir, op_name)?;
    let path = file.path.clone();

    match SESSION_LOG.get() {
        Some(log) => log.switch_to(file)?,
        None => {
            let log = SessionLog::install(file)?;
            let _ = SESSION_LOG.set(log);
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_session_gets_its_own_file() {
        let dir = std::env::temp_dir().join(format!("daqloop-logging-{}", std::process::id()));

        let first = init_logging(&dir, "first").unwrap();
        assert_eq!(first, dir.join("logs").join("first.log"));
        tracing::info!("into the first file");

        let second = init_logging(&dir, "second").unwrap();
        assert!(first.exists());
        assert!(second.exists());
        assert_ne!(first, second);

        let _ = fs::remove_dir_all(&dir);
    }
}
