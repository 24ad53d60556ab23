//! Per-client state kept by the compilation server
//!
//! Each client numbers its requests. The server applies the class-unload
//! updates carried by requests strictly in that order: a request that arrives
//! early parks until its predecessors have been applied (or until a timeout,
//! after which the gap is skipped), and one whose number was already consumed
//! is discarded as lost.

use crate::protocol::RemoteMethodRef;
use jit_core::{MethodFlags, MethodHandle};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    /// The request's number was already consumed
    Stale { seq_no: u32, expected: u32 },
    /// The session was deleted while waiting
    Terminated,
}

#[derive(Debug)]
struct SessionState {
    expected_seq_no: u32,
    /// Server-side stand-ins for the client's methods, keyed by class
    rom_classes: HashMap<String, HashMap<(String, String), MethodHandle>>,
    unloaded_classes: HashSet<String>,
    aot_records: HashSet<u64>,
    last_active: Instant,
    active_threads: u32,
    marked_for_deletion: bool,
    requests: u64,
    resyncs: u64,
}

#[derive(Debug)]
pub struct ClientSession {
    client_id: Uuid,
    state: Mutex<SessionState>,
    turn: Condvar,
}

impl ClientSession {
    fn new(client_id: Uuid) -> Self {
        Self {
            client_id,
            state: Mutex::new(SessionState {
                expected_seq_no: 0,
                rom_classes: HashMap::new(),
                unloaded_classes: HashSet::new(),
                aot_records: HashSet::new(),
                last_active: Instant::now(),
                active_threads: 0,
                marked_for_deletion: false,
                requests: 0,
                resyncs: 0,
            }),
            turn: Condvar::new(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Block until it is `seq_no`'s turn, then apply `unloaded` and hand the
    /// turn to the next request.
    pub fn process_in_order(
        &self,
        seq_no: u32,
        unloaded: &[String],
        timeout: Duration,
    ) -> Result<(), SequenceError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.marked_for_deletion {
                return Err(SequenceError::Terminated);
            }
            let expected = state.expected_seq_no;
            if seq_no < expected {
                return Err(SequenceError::Stale { seq_no, expected });
            }
            if seq_no == expected {
                break;
            }
            debug!(
                target: "jit::server",
                client = %self.client_id,
                seq_no,
                expected,
                "request parked until its turn"
            );
            if self.turn.wait_until(&mut state, deadline).timed_out() {
                let expected = state.expected_seq_no;
                if seq_no < expected {
                    return Err(SequenceError::Stale { seq_no, expected });
                }
                if seq_no > expected {
                    // Predecessors were lost in transit; skip the gap.
                    warn!(
                        target: "jit::server",
                        client = %self.client_id,
                        seq_no,
                        expected,
                        "sequence gap timed out, resynchronizing"
                    );
                    state.resyncs += 1;
                }
                break;
            }
        }

        for class in unloaded {
            state.rom_classes.remove(class);
            state.unloaded_classes.insert(class.clone());
        }
        state.expected_seq_no = seq_no.wrapping_add(1);
        state.last_active = Instant::now();
        state.requests += 1;
        self.turn.notify_all();
        Ok(())
    }

    /// Server-side method handle for a client method, cached per class.
    pub fn method_for(&self, method: &RemoteMethodRef) -> MethodHandle {
        let mut state = self.state.lock();
        state.unloaded_classes.remove(&method.class_name);
        let class = state
            .rom_classes
            .entry(method.class_name.clone())
            .or_default();
        class
            .entry((method.name.clone(), method.signature.clone()))
            .or_insert_with(|| {
                MethodHandle::new(
                    &method.class_name,
                    &method.name,
                    &method.signature,
                    MethodFlags {
                        has_backward_branches: method.has_backward_branches,
                        ..MethodFlags::default()
                    },
                )
            })
            .clone()
    }

    pub fn cached_classes(&self) -> usize {
        self.state.lock().rom_classes.len()
    }

    pub fn is_unloaded(&self, class_name: &str) -> bool {
        self.state.lock().unloaded_classes.contains(class_name)
    }

    pub fn record_aot(&self, record: u64) {
        self.state.lock().aot_records.insert(record);
    }

    pub fn aot_records(&self) -> usize {
        self.state.lock().aot_records.len()
    }

    pub fn enter(&self) {
        let mut state = self.state.lock();
        state.active_threads += 1;
        state.last_active = Instant::now();
    }

    pub fn leave(&self) {
        let mut state = self.state.lock();
        state.active_threads = state.active_threads.saturating_sub(1);
        state.last_active = Instant::now();
    }

    pub fn active_threads(&self) -> u32 {
        self.state.lock().active_threads
    }

    pub fn requests(&self) -> u64 {
        self.state.lock().requests
    }

    /// Times a sequence gap was skipped.
    pub fn resyncs(&self) -> u64 {
        self.state.lock().resyncs
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_active)
    }

    fn mark_for_deletion(&self) {
        self.state.lock().marked_for_deletion = true;
        self.turn.notify_all();
    }
}

/// Client id → session.
#[derive(Debug)]
pub struct ClientSessionHT {
    sessions: Mutex<HashMap<Uuid, Arc<ClientSession>>>,
    old_age: Duration,
    purge_interval: Duration,
    last_purge: Mutex<Instant>,
}

impl ClientSessionHT {
    pub fn new(old_age: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            old_age,
            purge_interval: (old_age / 2).max(Duration::from_millis(1)),
            last_purge: Mutex::new(Instant::now()),
        }
    }

    pub fn find_or_create(&self, client_id: Uuid) -> (Arc<ClientSession>, bool) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&client_id) {
            return (Arc::clone(session), false);
        }
        let session = Arc::new(ClientSession::new(client_id));
        sessions.insert(client_id, Arc::clone(&session));
        info!(target: "jit::server", client = %client_id, total = sessions.len(), "client session created");
        (session, true)
    }

    pub fn find(&self, client_id: Uuid) -> Option<Arc<ClientSession>> {
        self.sessions.lock().get(&client_id).cloned()
    }

    /// Remove a session. Threads still parked on it are released with
    /// [`SequenceError::Terminated`].
    pub fn delete(&self, client_id: Uuid) -> bool {
        let removed = self.sessions.lock().remove(&client_id);
        match removed {
            Some(session) => {
                session.mark_for_deletion();
                info!(target: "jit::server", client = %client_id, "client session deleted");
                true
            }
            None => false,
        }
    }

    /// Drop sessions idle longer than the configured age, at most once per
    /// purge interval. Returns the number purged.
    pub fn purge_old_data_if_needed(&self) -> usize {
        let now = Instant::now();
        {
            let mut last = self.last_purge.lock();
            if now.saturating_duration_since(*last) < self.purge_interval {
                return 0;
            }
            *last = now;
        }
        self.purge_older_than(now, self.old_age)
    }

    pub fn purge_older_than(&self, now: Instant, age: Duration) -> usize {
        let mut sessions = self.sessions.lock();
        let stale: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, s)| s.active_threads() == 0 && s.idle_for(now) > age)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(session) = sessions.remove(id) {
                session.mark_for_deletion();
            }
        }
        if !stale.is_empty() {
            info!(target: "jit::server", purged = stale.len(), remaining = sessions.len(), "purged old client sessions");
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_out_of_order_request_parks() {
        let table = ClientSessionHT::new(Duration::from_secs(60));
        let (session, created) = table.find_or_create(Uuid::new_v4());
        assert!(created);

        let late = Arc::clone(&session);
        let waiter = thread::spawn(move || {
            late.process_in_order(1, &["a/B".to_string()], Duration::from_secs(5))
        });
        thread::sleep(Duration::from_millis(20));
        session
            .process_in_order(0, &[], Duration::from_secs(5))
            .unwrap();
        waiter.join().unwrap().unwrap();
        assert!(session.is_unloaded("a/B"));
        assert_eq!(session.requests(), 2);
    }

    #[test]
    fn test_stale_request_discarded() {
        let table = ClientSessionHT::new(Duration::from_secs(60));
        let (session, _) = table.find_or_create(Uuid::new_v4());
        session.process_in_order(0, &[], Duration::from_secs(1)).unwrap();
        assert_eq!(
            session.process_in_order(0, &[], Duration::from_secs(1)),
            Err(SequenceError::Stale {
                seq_no: 0,
                expected: 1
            })
        );
    }

    #[test]
    fn test_missing_predecessor_resynchronizes() {
        let table = ClientSessionHT::new(Duration::from_secs(60));
        let (session, _) = table.find_or_create(Uuid::new_v4());
        session
            .process_in_order(3, &[], Duration::from_millis(10))
            .unwrap();
        assert_eq!(session.resyncs(), 1);
        assert_eq!(
            session.process_in_order(2, &[], Duration::from_millis(10)),
            Err(SequenceError::Stale {
                seq_no: 2,
                expected: 4
            })
        );
        session
            .process_in_order(4, &[], Duration::from_millis(10))
            .unwrap();
    }

    #[test]
    fn test_unload_evicts_cached_methods() {
        let table = ClientSessionHT::new(Duration::from_secs(60));
        let (session, _) = table.find_or_create(Uuid::new_v4());
        let method = RemoteMethodRef {
            class_name: "a/B".to_string(),
            name: "f".to_string(),
            signature: "()V".to_string(),
            has_backward_branches: false,
        };
        let first = session.method_for(&method);
        assert_eq!(session.method_for(&method), first);
        session
            .process_in_order(0, &["a/B".to_string()], Duration::from_secs(1))
            .unwrap();
        assert_eq!(session.cached_classes(), 0);
        assert_ne!(session.method_for(&method), first);
    }

    #[test]
    fn test_delete_and_purge() {
        let table = ClientSessionHT::new(Duration::from_secs(60));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        table.find_or_create(a);
        let (busy, _) = table.find_or_create(b);
        busy.enter();

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(table.purge_older_than(later, Duration::from_secs(60)), 1);
        assert!(table.find(a).is_none());
        assert!(table.find(b).is_some());

        assert!(table.delete(b));
        assert!(!table.delete(b));
        assert_eq!(
            busy.process_in_order(0, &[], Duration::from_millis(1)),
            Err(SequenceError::Terminated)
        );
        assert!(table.is_empty());
    }
}
