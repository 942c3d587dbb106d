//! Event store — the single source of truth for build events.
//!
//! Every mutation happens under one write lock, so readers see either the
//! state before or after it. The matching broadcast message is published
//! before the lock is released: subscribers see mutations in the order the
//! store applied them. Publishing never blocks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use crate::events::build::BroadcastMessage;
use crate::models::build_event::{BuildEvent, BuildStatus};
use crate::services::broadcast_hub::BroadcastHub;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("build event {0} not found")]
    NotFound(u64),
    #[error("build event {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: u64,
        from: BuildStatus,
        to: BuildStatus,
    },
    #[error("build event {0} already stopped")]
    AlreadyStopped(u64),
    #[error("build event {id} cannot stop while {status}")]
    NotTerminal { id: u64, status: BuildStatus },
    #[error("build event id {0} leaves no room for another id")]
    IdExhausted(u64),
}

#[derive(Default)]
struct StoreInner {
    next_id: u64,
    events: BTreeMap<u64, BuildEvent>,
}

pub struct EventStore {
    inner: RwLock<StoreInner>,
    hub: Arc<BroadcastHub>,
}

impl EventStore {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            hub,
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Allocate the next id and store a fresh event in `Starting`.
    pub fn create(self: &Arc<Self>, repository: &str) -> EventHandle {
        let id = {
            let mut inner = self.inner.write();
            let id = inner.next_id;
            inner.next_id += 1;
            let event = BuildEvent::new(id, repository);
            self.hub.publish(BroadcastMessage::created(&event));
            inner.events.insert(id, event);
            id
        };

        tracing::info!(event_id = id, repo = %repository, "Build event created");
        crate::metrics::build_status_changed(BuildStatus::Starting.as_str());

        EventHandle {
            id,
            store: Arc::clone(self),
        }
    }

    pub fn get(&self, id: u64) -> Option<BuildEvent> {
        self.inner.read().events.get(&id).cloned()
    }

    /// Up to `n` events, most recently created first.
    pub fn list_recent(&self, n: usize) -> Vec<BuildEvent> {
        self.inner
            .read()
            .events
            .values()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifier the next `create` will hand out.
    pub fn next_id(&self) -> u64 {
        self.inner.read().next_id
    }

    pub fn set_status(&self, id: u64, status: BuildStatus) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write();
            let event = inner.events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if !event.status.can_transition_to(status) {
                return Err(StoreError::IllegalTransition {
                    id,
                    from: event.status,
                    to: status,
                });
            }
            event.status = status;
            if let Some(ok) = status.outcome() {
                event.succeeded = ok;
            }
            self.hub.publish(BroadcastMessage::status_changed(id, status));
        }

        tracing::debug!(event_id = id, status = %status, "Build status changed");
        crate::metrics::build_status_changed(status.as_str());
        Ok(())
    }

    pub fn append_output(&self, id: u64, fragment: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let event = inner.events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if event.is_stopped() {
            return Err(StoreError::AlreadyStopped(id));
        }
        event.output.push(fragment.to_string());
        self.hub.publish(BroadcastMessage::output_appended(id, fragment));
        Ok(())
    }

    /// Record the stop time. Only valid once, and only in a terminal status.
    pub fn mark_stopped(&self, id: u64) -> Result<Duration, StoreError> {
        let elapsed = {
            let mut inner = self.inner.write();
            let event = inner.events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if event.is_stopped() {
                return Err(StoreError::AlreadyStopped(id));
            }
            if !event.status.is_terminal() {
                return Err(StoreError::NotTerminal {
                    id,
                    status: event.status,
                });
            }
            event.stopped_at = Some(Utc::now());
            let elapsed = event.duration();
            self.hub.publish(BroadcastMessage::duration_tick(id, elapsed));
            elapsed
        };

        crate::metrics::build_duration(elapsed.as_millis() as u64);
        Ok(elapsed)
    }

    /// Publish the current elapsed time of a running event.
    ///
    /// Returns `false` without publishing once the event has stopped.
    pub fn duration_tick(&self, id: u64) -> Result<bool, StoreError> {
        let inner = self.inner.read();
        let event = inner.events.get(&id).ok_or(StoreError::NotFound(id))?;
        if event.is_stopped() {
            return Ok(false);
        }
        self.hub.publish(BroadcastMessage::duration_tick(id, event.duration()));
        Ok(true)
    }

    /// Copy of every event, oldest first.
    pub fn snapshot(&self) -> Vec<BuildEvent> {
        self.inner.read().events.values().cloned().collect()
    }

    /// Replace the table with `events`. The counter continues after the
    /// highest restored id; a table whose highest id is `u64::MAX` is
    /// rejected and the store is left untouched.
    pub fn restore(&self, events: Vec<BuildEvent>) -> Result<(), StoreError> {
        let restored_next = match events.iter().map(|e| e.id).max() {
            Some(max) => max.checked_add(1).ok_or(StoreError::IdExhausted(max))?,
            None => 0,
        };

        let mut inner = self.inner.write();
        inner.next_id = inner.next_id.max(restored_next);
        inner.events = events.into_iter().map(|e| (e.id, e)).collect();
        Ok(())
    }
}

/// Mutation handle for one event. All writes go through the store.
#[derive(Clone)]
pub struct EventHandle {
    id: u64,
    store: Arc<EventStore>,
}

impl EventHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn get(&self) -> Option<BuildEvent> {
        self.store.get(self.id)
    }

    pub fn set_status(&self, status: BuildStatus) -> Result<(), StoreError> {
        self.store.set_status(self.id, status)
    }

    pub fn append_output(&self, fragment: &str) -> Result<(), StoreError> {
        self.store.append_output(self.id, fragment)
    }

    pub fn mark_stopped(&self) -> Result<Duration, StoreError> {
        self.store.mark_stopped(self.id)
    }
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::build::BroadcastKind;
    use std::collections::HashSet;

    fn store() -> Arc<EventStore> {
        Arc::new(EventStore::new(Arc::new(BroadcastHub::new(64))))
    }

    #[test]
    fn ids_start_at_zero_and_increase() {
        let store = store();
        let ids: Vec<u64> = (0..3).map(|_| store.create("stun").id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(store.next_id(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_yields_distinct_ids() {
        let store = store();
        let before = store.create("seed").id();

        let mut tasks = Vec::new();
        for n in 0..64 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.create(&format!("repo-{n}")).id()
            }));
        }

        let mut ids = HashSet::new();
        for task in tasks {
            let id = task.await.unwrap();
            assert!(id > before);
            assert!(ids.insert(id), "duplicate id {id}");
        }
        assert_eq!(ids.len(), 64);
        assert_eq!(store.len(), 65);
    }

    #[test]
    fn list_recent_returns_newest_first() {
        let store = store();
        for name in ["a", "b", "c"] {
            store.create(name);
        }

        let recent = store.list_recent(10);
        let repos: Vec<&str> = recent.iter().map(|e| e.repository.as_str()).collect();
        assert_eq!(repos, vec!["c", "b", "a"]);

        let two = store.list_recent(2);
        assert_eq!(two.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 1]);
        assert!(store.list_recent(0).is_empty());
    }

    #[test]
    fn rejects_illegal_transitions() {
        let store = store();
        let handle = store.create("stun");

        assert_eq!(
            handle.set_status(BuildStatus::Provisioning),
            Err(StoreError::IllegalTransition {
                id: 0,
                from: BuildStatus::Starting,
                to: BuildStatus::Provisioning,
            })
        );

        handle.set_status(BuildStatus::Filtering).unwrap();
        handle.set_status(BuildStatus::Skipped).unwrap();
        assert!(handle.set_status(BuildStatus::Syncing).is_err());
        assert!(handle.set_status(BuildStatus::Skipped).is_err());

        let event = handle.get().unwrap();
        assert_eq!(event.status, BuildStatus::Skipped);
        assert!(event.succeeded);
    }

    #[test]
    fn stop_requires_terminal_status_and_happens_once() {
        let store = store();
        let handle = store.create("stun");
        assert_eq!(
            handle.mark_stopped(),
            Err(StoreError::NotTerminal {
                id: 0,
                status: BuildStatus::Starting
            })
        );

        handle.set_status(BuildStatus::Filtering).unwrap();
        handle.set_status(BuildStatus::Syncing).unwrap();
        handle.set_status(BuildStatus::Failed).unwrap();
        handle.mark_stopped().unwrap();
        let stopped_at = handle.get().unwrap().stopped_at;
        assert!(stopped_at.is_some());

        assert_eq!(handle.mark_stopped(), Err(StoreError::AlreadyStopped(0)));
        assert_eq!(handle.get().unwrap().stopped_at, stopped_at);
        assert!(!handle.get().unwrap().succeeded);
    }

    #[test]
    fn output_is_append_only_until_stopped() {
        let store = store();
        let handle = store.create("stun");
        handle.append_output("one\n").unwrap();
        handle.append_output("two\n").unwrap();
        assert_eq!(handle.get().unwrap().output, vec!["one\n", "two\n"]);

        handle.set_status(BuildStatus::Filtering).unwrap();
        handle.set_status(BuildStatus::Skipped).unwrap();
        handle.mark_stopped().unwrap();
        assert_eq!(
            handle.append_output("late"),
            Err(StoreError::AlreadyStopped(0))
        );
        assert_eq!(handle.get().unwrap().output_text(), "one\ntwo\n");
    }

    #[test]
    fn unknown_ids_are_reported() {
        let store = store();
        assert!(store.get(42).is_none());
        assert_eq!(
            store.set_status(42, BuildStatus::Filtering),
            Err(StoreError::NotFound(42))
        );
        assert_eq!(store.append_output(42, "x"), Err(StoreError::NotFound(42)));
        assert_eq!(store.duration_tick(42), Err(StoreError::NotFound(42)));
    }

    #[tokio::test]
    async fn mutations_are_broadcast_in_order() {
        let store = store();
        let mut sub = store.hub().subscribe();
        sub.recv().await; // identity

        let handle = store.create("stun");
        handle.set_status(BuildStatus::Filtering).unwrap();
        handle.append_output("hello").unwrap();
        handle.set_status(BuildStatus::Skipped).unwrap();
        handle.mark_stopped().unwrap();
        assert!(!store.duration_tick(handle.id()).unwrap());

        let kinds: Vec<BroadcastKind> = std::iter::from_fn(|| sub.try_recv())
            .map(|m| {
                assert_eq!(m.event_id, 0);
                m.kind
            })
            .collect();

        assert_eq!(kinds.len(), 5);
        assert!(matches!(kinds[0], BroadcastKind::Created { .. }));
        assert_eq!(
            kinds[1],
            BroadcastKind::StatusChanged {
                status: BuildStatus::Filtering,
                succeeded: None
            }
        );
        assert_eq!(
            kinds[2],
            BroadcastKind::OutputAppended {
                fragment: "hello".to_string()
            }
        );
        assert_eq!(
            kinds[3],
            BroadcastKind::StatusChanged {
                status: BuildStatus::Skipped,
                succeeded: Some(true)
            }
        );
        assert!(matches!(kinds[4], BroadcastKind::DurationTick { .. }));
    }

    #[test]
    fn restore_continues_after_highest_id() {
        let store = store();
        let mut events = vec![BuildEvent::new(3, "a"), BuildEvent::new(11, "b")];
        events[0].status = BuildStatus::Failed;
        store.restore(events).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.next_id(), 12);
        assert_eq!(store.create("c").id(), 12);
        assert_eq!(store.get(3).unwrap().status, BuildStatus::Failed);
    }

    #[test]
    fn restore_rejects_exhausted_id_space() {
        let store = store();
        store.create("kept");

        let events = vec![BuildEvent::new(u64::MAX, "crafted")];
        assert_eq!(store.restore(events), Err(StoreError::IdExhausted(u64::MAX)));

        assert_eq!(store.len(), 1);
        assert_eq!(store.next_id(), 1);
        assert_eq!(store.get(0).unwrap().repository, "kept");
    }

    #[test]
    fn concurrent_appends_are_broadcast_in_stored_order() {
        const WRITERS: usize = 4;
        const LINES: usize = 100;

        for _ in 0..50 {
            let store = Arc::new(EventStore::new(Arc::new(BroadcastHub::new(
                WRITERS * LINES * 2,
            ))));
            let mut sub = store.hub().subscribe();
            let handle = store.create("stun");

            std::thread::scope(|scope| {
                for w in 0..WRITERS {
                    let handle = handle.clone();
                    scope.spawn(move || {
                        for n in 0..LINES {
                            handle.append_output(&format!("{w}:{n}\n")).unwrap();
                        }
                    });
                }
            });

            let seen: Vec<String> = std::iter::from_fn(|| sub.try_recv())
                .filter_map(|m| match m.kind {
                    BroadcastKind::OutputAppended { fragment } => Some(fragment),
                    _ => None,
                })
                .collect();
            let stored = handle.get().unwrap().output;
            assert_eq!(stored.len(), WRITERS * LINES);
            assert_eq!(seen, stored);
        }
    }
}
