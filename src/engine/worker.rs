//! Background feature generation.
//!
//! A single worker thread owns the embed queue, so vector writes stay
//! ordered. Capture enqueues a task and waits on the task's channel with a
//! timeout; when it gives up it sets the task's cancellation flag and the
//! worker drops the late vector instead of persisting it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use super::core::EngineState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedOutcome {
    /// Vector persisted, edges rebuilt
    Stored,
    /// Cancelled before persisting
    Skipped,
    Failed(String),
}

pub enum Task {
    Embed {
        record_id: u64,
        cancelled: Arc<AtomicBool>,
        done_tx: mpsc::Sender<EmbedOutcome>,
    },

    /// request to gracefully shut the worker down
    Shutdown,
}

pub fn spawn(state: Arc<EngineState>) -> (mpsc::Sender<Task>, std::thread::JoinHandle<()>) {
    let (task_tx, task_rx) = mpsc::channel::<Task>();
    let handle = std::thread::spawn(move || start_worker(task_rx, state));
    (task_tx, handle)
}

fn start_worker(task_rx: mpsc::Receiver<Task>, state: Arc<EngineState>) {
    log::debug!("embedding worker waiting for job");
    while let Ok(task) = task_rx.recv() {
        match task {
            Task::Shutdown => {
                log::debug!("embedding worker shutting down");
                return;
            }
            Task::Embed {
                record_id,
                cancelled,
                done_tx,
            } => {
                let outcome = embed_one(&state, record_id, &cancelled);
                if let EmbedOutcome::Failed(msg) = &outcome {
                    log::warn!("embedding for record {record_id} failed: {msg}");
                }
                // the capture path may have stopped waiting; that's fine
                let _ = done_tx.send(outcome);
            }
        }
    }
}

fn embed_one(state: &EngineState, record_id: u64, cancelled: &AtomicBool) -> EmbedOutcome {
    let record = match state.records.get(record_id) {
        Ok(Some(record)) => record,
        Ok(None) => return EmbedOutcome::Failed(format!("record {record_id} is gone")),
        Err(err) => return EmbedOutcome::Failed(err.to_string()),
    };

    let components = state
        .generator
        .generate(&record.title, &record.body, &record.keywords);

    // cancellation point between generation and persistence
    if cancelled.load(Ordering::SeqCst) {
        log::warn!("dropping late vector for record {record_id}");
        return EmbedOutcome::Skipped;
    }

    match state.store_vector(record_id, components) {
        Ok(()) => EmbedOutcome::Stored,
        Err(err) => EmbedOutcome::Failed(err.to_string()),
    }
}
