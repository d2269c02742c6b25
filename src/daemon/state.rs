//! Daemon state and its serialization loop
//!
//! One task owns the sole mutable [`DaemonState`]; every read and write goes
//! through a single operation channel, so reads and writes share one FIFO
//! ordering and no observer ever sees a torn state. Snapshots are cheap
//! clones whose READY payloads sit behind `Arc`s; replacing the state in the
//! loop never mutates anything a snapshot still points at.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::protocol::StateKind;
use crate::inventory::Inventory;
use crate::search::SearchIndex;

/// The daemon lifecycle as a sum type; each variant carries exactly the data
/// valid in that state.
#[derive(Clone, Default)]
pub enum DaemonState {
    /// No encrypted inventory has been loaded.
    #[default]
    NoFile,

    /// The encrypted blob is in memory but not decrypted.
    Locked { blob: Arc<Vec<u8>> },

    /// Decrypted and queryable. The blob is kept so an idle lock does not
    /// require re-reading the file.
    Ready {
        blob: Arc<Vec<u8>>,
        inventory: Arc<Inventory>,
        tags: Arc<HashMap<String, usize>>,
        index: Arc<SearchIndex>,
    },
}

impl DaemonState {
    pub fn kind(&self) -> StateKind {
        match self {
            DaemonState::NoFile => StateKind::ConfigFileRequired,
            DaemonState::Locked { .. } => StateKind::DecryptionRequired,
            DaemonState::Ready { .. } => StateKind::Ready,
        }
    }
}

enum StateOp {
    Read { reply: oneshot::Sender<DaemonState> },
    Write { state: DaemonState },
    Close,
}

/// Handle to the state manager loop. Cloneable; all clones feed the same
/// FIFO channel.
#[derive(Clone)]
pub struct StateHandle {
    ops: mpsc::Sender<StateOp>,
}

impl StateHandle {
    /// Snapshot the current state.
    pub async fn read(&self) -> Result<DaemonState> {
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(StateOp::Read { reply })
            .await
            .map_err(|_| anyhow!("state manager is gone"))?;
        rx.await.map_err(|_| anyhow!("state manager is gone"))
    }

    /// Replace the state.
    pub async fn write(&self, state: DaemonState) -> Result<()> {
        self.ops
            .send(StateOp::Write { state })
            .await
            .map_err(|_| anyhow!("state manager is gone"))
    }

    /// Release the decrypted inventory and index; READY becomes LOCKED,
    /// other states are untouched.
    pub async fn close(&self) -> Result<()> {
        self.ops
            .send(StateOp::Close)
            .await
            .map_err(|_| anyhow!("state manager is gone"))
    }
}

/// Spawn the state manager loop. The state starts as NO_FILE and lives for
/// the whole process; it is only ever transitioned, never replaced by a new
/// loop.
pub fn spawn_state_manager() -> StateHandle {
    let (ops, mut rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let mut state = DaemonState::NoFile;
        while let Some(op) = rx.recv().await {
            match op {
                StateOp::Read { reply } => {
                    let _ = reply.send(state.clone());
                }
                StateOp::Write { state: next } => {
                    debug!(from = ?state.kind(), to = ?next.kind(), "state transition");
                    state = next;
                }
                StateOp::Close => {
                    if let DaemonState::Ready { blob, .. } = &state {
                        info!("releasing decrypted inventory, back to locked");
                        // Drops the loop's inventory/map/index handles.
                        state = DaemonState::Locked { blob: blob.clone() };
                    }
                }
            }
        }
        debug!("state manager loop stopped");
    });

    StateHandle { ops }
}
