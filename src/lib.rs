pub mod activity;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod models;
pub mod session;
pub mod store;
pub mod timer;

#[cfg(test)]
pub mod test_utils;

pub use activity::{ActivityEmitter, ActivitySource};
pub use config::Config;
pub use coordinator::{Ports, RestoreReport, SessionCoordinator, SessionRestore, WriteOutcome};
pub use error::app_error::SessionError;
pub use models::activity::ActivityEvent;
pub use models::event::SessionEvent;
pub use models::login_attempt::LockoutStatus;
pub use models::session::{Session, SessionSnapshot};

use crate::store::open_store;
use tracing_subscriber::EnvFilter;

pub fn init_tracing(log_level: &str, json_format: bool) {
    // RUST_LOG takes precedence over the configured level, e.g.
    //   RUST_LOG=session_sentinel::coordinator=debug
    //   RUST_LOG=info,session_sentinel::activity=trace
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_line_number(true);

    if json_format {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Opens the configured store and restores a coordinator on top of it, using the wall clock
/// and tokio timers.
pub async fn open_coordinator(config: &Config) -> Result<SessionCoordinator, SessionError> {
    let store = open_store(&config.storage).await?;
    SessionCoordinator::open(config, Ports::system(store)).await
}
