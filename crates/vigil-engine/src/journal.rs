//! Journal access for the engine: the store repository plus an in-process
//! broadcast of every newly committed entry.

use tokio::sync::broadcast;
use tracing::trace;

use vigil_core::events::JournalEvent;
use vigil_core::ids::RunId;
use vigil_store::journal::{Appended, JournalEntry, JournalRepo};
use vigil_store::runs::Transition;
use vigil_store::{Database, StoreError};

/// Fan-out of committed journal entries to live subscribers.
///
/// Delivery is best effort. Subscribers that lag or miss entries written by
/// another process catch up from the store.
#[derive(Clone)]
pub struct JournalBus {
    tx: broadcast::Sender<JournalEntry>,
}

impl JournalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, entry: &JournalEntry) {
        if self.tx.send(entry.clone()).is_err() {
            trace!(run_id = %entry.run_id, "no journal subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JournalEntry> {
        self.tx.subscribe()
    }
}

/// Journal writes that publish on the bus once committed.
#[derive(Clone)]
pub struct Journal {
    repo: JournalRepo,
    bus: JournalBus,
}

impl Journal {
    pub fn new(db: Database, bus: JournalBus) -> Self {
        Self {
            repo: JournalRepo::new(db),
            bus,
        }
    }

    pub fn bus(&self) -> &JournalBus {
        &self.bus
    }

    pub fn repo(&self) -> &JournalRepo {
        &self.repo
    }

    pub fn append(&self, run_id: &RunId, event: &JournalEvent) -> Result<JournalEntry, StoreError> {
        let entry = self.repo.append(run_id, event)?;
        self.bus.publish(&entry);
        Ok(entry)
    }

    pub fn append_idempotent(
        &self,
        run_id: &RunId,
        event: &JournalEvent,
        key: &str,
    ) -> Result<Appended, StoreError> {
        let appended = self.repo.append_idempotent(run_id, event, key)?;
        self.publish_new(&appended);
        Ok(appended)
    }

    pub fn append_transition(
        &self,
        run_id: &RunId,
        event: &JournalEvent,
        key: Option<&str>,
        transition: &Transition,
    ) -> Result<Appended, StoreError> {
        let appended = self.repo.append_transition(run_id, event, key, transition)?;
        self.publish_new(&appended);
        Ok(appended)
    }

    pub fn list(&self, run_id: &RunId) -> Result<Vec<JournalEntry>, StoreError> {
        self.repo.list(run_id)
    }

    pub fn find_by_key(&self, run_id: &RunId, key: &str) -> Result<Option<JournalEntry>, StoreError> {
        self.repo.find_by_key(run_id, key)
    }

    fn publish_new(&self, appended: &Appended) {
        if appended.inserted {
            self.bus.publish(&appended.entry);
        }
    }
}

/// Resolves on the next bus entry for `run_id`, or when the receiver lagged
/// and the caller should re-read the store. Never resolves once closed.
pub async fn next_entry_for(rx: &mut broadcast::Receiver<JournalEntry>, run_id: &RunId) {
    loop {
        match rx.recv().await {
            Ok(entry) if &entry.run_id == run_id => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::run::RunStatus;
    use vigil_store::runs::{NewRun, RunRepo};

    fn setup() -> (Journal, RunId) {
        let db = Database::in_memory().unwrap();
        let run = RunRepo::new(db.clone())
            .create(&NewRun {
                task: "t".into(),
                agent_kind: "worker".into(),
                user_id: None,
                parent_run_id: None,
            })
            .unwrap();
        (Journal::new(db, JournalBus::new(16)), run.id)
    }

    fn thought(text: &str) -> JournalEvent {
        JournalEvent::AgentThought {
            text: text.into(),
            step: 0,
        }
    }

    #[tokio::test]
    async fn publishes_committed_entries() {
        let (journal, run_id) = setup();
        let mut rx = journal.bus().subscribe();

        let entry = journal.append(&run_id, &thought("a")).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, entry.id);
        assert_eq!(received.sequence, 0);
    }

    #[tokio::test]
    async fn replayed_key_is_not_republished() {
        let (journal, run_id) = setup();
        let mut rx = journal.bus().subscribe();

        journal.append_idempotent(&run_id, &thought("a"), "k").unwrap();
        let again = journal.append_idempotent(&run_id, &thought("a"), "k").unwrap();
        assert!(!again.inserted);

        assert!(rx.recv().await.is_ok());
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn failed_transition_publishes_nothing() {
        let (journal, run_id) = setup();
        let mut rx = journal.bus().subscribe();

        let result = journal.append_transition(
            &run_id,
            &JournalEvent::RunCompleted { summary: None },
            Some("completed"),
            &Transition::to(RunStatus::Completed),
        );
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn next_entry_for_filters_by_run() {
        let (journal, run_id) = setup();
        let other = RunId::new();
        let mut rx = journal.bus().subscribe();

        // An entry for another run is skipped; ours wakes the waiter.
        journal.bus().publish(&JournalEntry {
            id: vigil_core::ids::EntryId::new(),
            run_id: other,
            sequence: 0,
            event: thought("elsewhere"),
            idempotency_key: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        });
        journal.append(&run_id, &thought("here")).unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            next_entry_for(&mut rx, &run_id),
        )
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let (journal, run_id) = setup();
        journal.append(&run_id, &thought("nobody listening")).unwrap();
    }
}
