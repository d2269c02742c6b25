//! Idle-lock timer
//!
//! Re-locks the inventory after a period without query activity by posting a
//! close op to the state manager and rearming. The reset channel has
//! capacity 1 and drops on overflow; a lost reset only means a slightly
//! earlier lock, which is always safe.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::state::StateHandle;

/// Handle used by the RPC surface to signal activity.
#[derive(Clone)]
pub struct IdleTimer {
    reset_tx: mpsc::Sender<()>,
}

impl IdleTimer {
    /// Spawn the timer loop with the given period.
    pub fn spawn(state: StateHandle, period: Duration) -> Self {
        let (reset_tx, mut reset_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let sleep = tokio::time::sleep(period);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    () = &mut sleep => {
                        debug!("idle-lock timer fired");
                        if let Err(e) = state.close().await {
                            warn!(error = %e, "idle lock could not reach the state manager");
                            break;
                        }
                        sleep.as_mut().reset(Instant::now() + period);
                    }
                    msg = reset_rx.recv() => match msg {
                        Some(()) => sleep.as_mut().reset(Instant::now() + period),
                        // All handles dropped; the daemon is going away.
                        None => break,
                    },
                }
            }
        });

        Self { reset_tx }
    }

    /// Restart the countdown. Lossy: a full channel means a reset is already
    /// pending, so dropping this one changes nothing.
    pub fn touch(&self) {
        let _ = self.reset_tx.try_send(());
    }
}
