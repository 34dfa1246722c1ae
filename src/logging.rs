//! Logging initialization
//!
//! The pool emits structured events through the `tracing` ecosystem and
//! never installs a subscriber on its own. Binaries and tests embedding the
//! pool can call [`init_logging`] to get a sensible default subscriber.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter (e.g. "debug,memforge=trace")
//! - `MEMFORGE_LOG_LEVEL`: simple level override (error, warn, info, debug,
//!   trace); takes precedence over `RUST_LOG`

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVEL_ENV: &str = "MEMFORGE_LOG_LEVEL";

/// Install a formatting subscriber honoring the environment.
///
/// Idempotent; later calls are no-ops. Safe to call when another subscriber
/// is already installed (the attempt is silently discarded).
pub fn init_logging() {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = match std::env::var(LOG_LEVEL_ENV) {
            Ok(level) => EnvFilter::new(level),
            Err(_) => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    });
}
