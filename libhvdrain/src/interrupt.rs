//! Ctrl-C handling for mutating runs. A first interrupt never aborts a host
//! midway; it is recorded and the run stops at the next host boundary. A
//! second one cancels the run's token, which ends any wait in progress.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::log::*;

#[derive(Debug, Clone, Default)]
pub struct InterruptGuard {
    received: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl InterruptGuard {
    /// Take over SIGINT for the rest of the process.
    pub fn install() -> Self {
        let guard = Self::default();
        let handler = guard.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if handler.request() == 1 {
                    warn!("interrupt received, deferring until the current host is done");
                    println!(
                        "! Interrupt received. Finishing the current host first so it is not left half-drained. Press Ctrl-C again to stop waiting."
                    );
                } else {
                    warn!("repeated interrupt, cancelling the step in progress");
                    println!("! Cancelling. The current host may need manual attention.");
                }
            }
        });
        guard
    }

    /// Record an interrupt. Returns how many have been received so far.
    pub fn request(&self) -> u32 {
        let count = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        if count > 1 {
            self.cancel.cancel();
        }
        count
    }

    pub fn requested(&self) -> bool {
        self.received.load(Ordering::SeqCst) > 0
    }

    /// Cancelled on the second interrupt.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
