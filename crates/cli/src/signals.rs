//! Signal handling: SIGINT/SIGTERM stop dispatching new units.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use migration_rebase_core::ShutdownFlag;

/// Create a shutdown flag and register OS signal handlers.
///
/// On SIGTERM or SIGINT (Ctrl+C) the flag is set; units already being
/// processed finish and the report is still printed.
pub fn setup_signal_handlers() -> ShutdownFlag {
    let flag = Arc::new(AtomicBool::new(false));
    let flag_clone = flag.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to register SIGTERM handler");
                    if ctrl_c.await.is_ok() {
                        info!("received SIGINT (Ctrl+C), stopping dispatch");
                        flag_clone.store(true, Ordering::SeqCst);
                    }
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT (Ctrl+C), stopping dispatch");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, stopping dispatch");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = ctrl_c.await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("received Ctrl+C, stopping dispatch");
        }

        flag_clone.store(true, Ordering::SeqCst);
    });

    flag
}
