//! Ordered journal streams for a single run.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use vigil_core::ids::RunId;
use vigil_core::run::RunStatus;
use vigil_store::journal::JournalEntry;
use vigil_store::runs::RunRepo;

use crate::error::EngineError;
use crate::journal::{next_entry_for, Journal};

const BATCH: u32 = 256;
const CHANNEL_CAPACITY: usize = 64;

/// One item of a run's journal stream.
#[derive(Clone, Debug, PartialEq)]
pub enum RunStreamItem {
    Entry(JournalEntry),
    /// Always the last item, sent once the run is terminal and fully replayed.
    Closed { status: RunStatus },
}

pub type RunStream = ReceiverStream<RunStreamItem>;

/// Stream a run's journal from sequence 0, following it live until the run
/// reaches a terminal status.
///
/// Entries come from the store in sequence order; the bus only wakes the
/// reader early, so entries written by other processes still arrive within
/// one `poll` interval.
pub fn subscribe(
    journal: &Journal,
    runs: &RunRepo,
    run_id: &RunId,
    poll: Duration,
) -> Result<RunStream, EngineError> {
    runs.get(run_id).map_err(|e| EngineError::for_run(run_id, e))?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    // Subscribe before the first read so nothing committed in between is missed.
    let mut bus = journal.bus().subscribe();
    let journal = journal.clone();
    let runs = runs.clone();
    let run_id = run_id.clone();

    tokio::spawn(async move {
        let mut last_sequence: i64 = -1;
        loop {
            // Status first: anything committed before a terminal status is read below.
            let status = match runs.get(&run_id) {
                Ok(run) => run.status,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "run stream stopped");
                    return;
                }
            };

            loop {
                let batch = match journal.repo().list_after_sequence(&run_id, last_sequence, BATCH) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "run stream stopped");
                        return;
                    }
                };
                let done = batch.len() < BATCH as usize;
                for entry in batch {
                    last_sequence = entry.sequence;
                    if tx.send(RunStreamItem::Entry(entry)).await.is_err() {
                        debug!(run_id = %run_id, "run stream receiver dropped");
                        return;
                    }
                }
                if done {
                    break;
                }
            }

            if status.is_terminal() {
                let _ = tx.send(RunStreamItem::Closed { status }).await;
                return;
            }

            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(poll) => {}
                _ = next_entry_for(&mut bus, &run_id) => {}
            }
        }
    });

    Ok(ReceiverStream::new(rx))
}
