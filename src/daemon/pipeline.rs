//! Decrypt-and-index pipeline
//!
//! Transforms the stored encrypted blob into a queryable READY state in
//! ordered steps, streaming one progress event per step over a bounded
//! channel. The first failure terminates the stream and leaves the state
//! untouched; success ends with a state write followed by `{DONE, SUCCESS}`.
//!
//! The KDF/decrypt and hash/index work are CPU-bound and run on blocking
//! threads; stale-index cleanup is fired off separately so the caller is not
//! serialized behind it.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::idle::IdleTimer;
use super::protocol::{DecryptStep, StepKind};
use super::state::{DaemonState, StateHandle};
use crate::inventory::Inventory;
use crate::search::SearchIndex;
use crate::{crypto, inventory, search};

/// Buffered progress events; the producer blocks once the client stops
/// draining, which is the stream's natural backpressure.
const PROGRESS_BUFFER: usize = 8;

/// Start the pipeline and return the stream of progress events. The stream
/// is finite and ends with exactly one terminal step.
pub fn spawn(
    password: Vec<u8>,
    state: StateHandle,
    indices_dir: PathBuf,
    timer: IdleTimer,
) -> mpsc::Receiver<DecryptStep> {
    let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
    tokio::spawn(async move {
        run(password, state, indices_dir, timer, tx).await;
    });
    rx
}

// The pipeline is non-cancellable: a disconnected client stops event
// delivery but the remaining steps still run to completion.
async fn emit(tx: &mpsc::Sender<DecryptStep>, step: DecryptStep) {
    if tx.send(step).await.is_err() {
        debug!("decrypt progress consumer went away");
    }
}

async fn run(
    password: Vec<u8>,
    state: StateHandle,
    indices_dir: PathBuf,
    timer: IdleTimer,
    tx: mpsc::Sender<DecryptStep>,
) {
    let snapshot = match state.read().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            emit(&tx, DecryptStep::failure(StepKind::Done, e.to_string())).await;
            return;
        }
    };

    let blob = match snapshot {
        DaemonState::Ready { .. } => {
            // Already decrypted; nothing to redo.
            emit(&tx, DecryptStep::success(StepKind::Done)).await;
            return;
        }
        DaemonState::NoFile => {
            emit(
                &tx,
                DecryptStep::failure(StepKind::Validate, "no configuration was loaded"),
            )
            .await;
            return;
        }
        DaemonState::Locked { blob } => blob,
    };

    // DECODE_BASE64
    let ciphertext = match base64::engine::general_purpose::STANDARD.decode(blob.trim_ascii()) {
        Ok(ciphertext) => ciphertext,
        Err(e) => {
            emit(
                &tx,
                DecryptStep::failure(
                    StepKind::DecodeBase64,
                    format!("corrupt configuration file, failed at base64 decode: {e}"),
                ),
            )
            .await;
            return;
        }
    };
    emit(&tx, DecryptStep::success(StepKind::DecodeBase64)).await;

    // DECRYPT — the ordinary wrong-password path fails here.
    let decrypted =
        tokio::task::spawn_blocking(move || crypto::open(&password, &ciphertext)).await;
    let plaintext = match decrypted {
        Ok(Ok(plaintext)) => plaintext,
        Ok(Err(e)) => {
            emit(
                &tx,
                DecryptStep::failure(
                    StepKind::Decrypt,
                    format!("failed to decrypt the configuration file: {e}"),
                ),
            )
            .await;
            return;
        }
        Err(e) => {
            emit(
                &tx,
                DecryptStep::failure(StepKind::Decrypt, format!("decrypt worker failed: {e}")),
            )
            .await;
            return;
        }
    };
    emit(&tx, DecryptStep::success(StepKind::Decrypt)).await;

    // UNMARSHAL
    let raw = match inventory::parse(&plaintext) {
        Ok(raw) => raw,
        Err(e) => {
            emit(&tx, DecryptStep::failure(StepKind::Unmarshal, e.to_string())).await;
            return;
        }
    };
    emit(&tx, DecryptStep::success(StepKind::Unmarshal)).await;

    // VALIDATE — the minimum needed for well-typed records; the richer
    // checks live in `jim validate`.
    let parsed = match Inventory::from_raw(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            emit(&tx, DecryptStep::failure(StepKind::Validate, e.to_string())).await;
            return;
        }
    };
    emit(&tx, DecryptStep::success(StepKind::Validate)).await;

    // BUILD_INDEX — reuse the directory matching the content hash, or build
    // a fresh one; either way stale siblings are swept afterwards.
    let parsed = Arc::new(parsed);
    let build_inventory = parsed.clone();
    let build_dir = indices_dir.clone();
    let built = tokio::task::spawn_blocking(move || {
        let hash = build_inventory.content_hash();
        SearchIndex::open_or_build(&build_dir, &hash, &build_inventory)
    })
    .await;
    let (index_name, index) = match built {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            emit(&tx, DecryptStep::failure(StepKind::BuildIndex, e.to_string())).await;
            return;
        }
        Err(e) => {
            emit(
                &tx,
                DecryptStep::failure(StepKind::BuildIndex, format!("index worker failed: {e}")),
            )
            .await;
            return;
        }
    };

    let cleanup_dir = indices_dir.clone();
    tokio::task::spawn_blocking(move || search::cleanup_stale(&cleanup_dir, &index_name));
    emit(&tx, DecryptStep::success(StepKind::BuildIndex)).await;

    // DONE — publish READY, then confirm to the client.
    let tags = Arc::new(parsed.tag_positions());
    let entries = parsed.len();
    let ready = DaemonState::Ready {
        blob,
        inventory: parsed,
        tags,
        index: Arc::new(index),
    };
    if let Err(e) = state.write(ready).await {
        warn!(error = %e, "could not publish decrypted state");
        emit(&tx, DecryptStep::failure(StepKind::Done, e.to_string())).await;
        return;
    }

    timer.touch();
    info!(entries, "inventory decrypted and indexed");
    emit(&tx, DecryptStep::success(StepKind::Done)).await;
}
