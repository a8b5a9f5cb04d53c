// src/sessions.rs
//
// Session manager: turns hotplug intents into session starts and stops while
// keeping at most one session per device identity.
//
// The table lock is only held for single inserts/removes, never across
// admission, link opening, or joining a session. A session removed from the
// table is joined even if the caller stops waiting; see `PendingJoin`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::admission::AdmissionPolicy;
use crate::identity::DeviceIdentity;
use crate::io::serial::framer::FramingConfig;
use crate::io::serial::link::{ByteSource, LinkOpener};
use crate::io::serial::reader::{
    run_session_blocking, ExitReason, SessionContext, SessionExit, SessionTiming,
};
use crate::schema::Schema;
use crate::store::PersistenceSink;

/// Result of an arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    /// A session exists or another arrival for the identity won the race
    AlreadyActive,
    Declined,
    LinkFailed(String),
    /// The identity departed (or shutdown began) while its link was opening
    Withdrawn,
    ShuttingDown,
}

/// Result of a departure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepartOutcome {
    NotActive,
    /// The identity is recorded from a different node, which is still present
    OtherNode,
    /// Arrival still in progress; it will stop what it started
    Cancelled,
    Stopped(ExitReason),
}

struct Session {
    path: PathBuf,
    generation: u64,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<ExitReason>,
}

type Stopping = Mutex<Vec<(DeviceIdentity, Session)>>;

/// Waits for one session's task. Dropped before the task ends, it hands the
/// session to the manager's stopping list so `shutdown` still joins it.
struct PendingJoin<'a> {
    identity: DeviceIdentity,
    session: Option<Session>,
    stopping: &'a Stopping,
}

impl PendingJoin<'_> {
    async fn wait(mut self) -> ExitReason {
        let result = match self.session.as_mut() {
            Some(session) => (&mut session.handle).await,
            None => return ExitReason::Stopped,
        };
        self.session = None;
        match result {
            Ok(reason) => reason,
            Err(e) => {
                tlog!("[sessions] {} session task failed: {}", self.identity, e);
                ExitReason::Failed(format!("session task failed: {}", e))
            }
        }
    }
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tlog!("[sessions] {} still stopping, left for shutdown to join", self.identity);
            relock(self.stopping).push((self.identity.clone(), session));
        }
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every mutation is a single insert/remove/push, so a poisoned lock is still consistent
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Slot {
    /// Admitted, link not yet open
    Starting { generation: u64, path: PathBuf },
    Active(Session),
}

impl Slot {
    fn path(&self) -> &Path {
        match self {
            Slot::Starting { path, .. } => path,
            Slot::Active(session) => &session.path,
        }
    }
}

/// Collaborators shared by every session
pub struct SessionDeps {
    pub admission: Arc<dyn AdmissionPolicy>,
    pub opener: Arc<dyn LinkOpener>,
    pub sink: Arc<dyn PersistenceSink>,
    pub schema: Schema,
    pub framing: FramingConfig,
    pub timing: SessionTiming,
}

pub struct SessionManager {
    deps: SessionDeps,
    table: Mutex<HashMap<DeviceIdentity, Slot>>,
    /// Sessions signalled to stop whose join was abandoned
    stopping: Stopping,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
    exits: UnboundedSender<SessionExit>,
}

impl SessionManager {
    /// The receiver yields one message per session that ends; feed them
    /// back through [`SessionManager::on_session_exit`].
    pub fn new(deps: SessionDeps) -> (SessionManager, UnboundedReceiver<SessionExit>) {
        let (exits, exits_rx) = mpsc::unbounded_channel();
        let manager = SessionManager {
            deps,
            table: Mutex::new(HashMap::new()),
            stopping: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            exits,
        };
        (manager, exits_rx)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<DeviceIdentity, Slot>> {
        relock(&self.table)
    }

    async fn join_session(&self, identity: &DeviceIdentity, session: Session) -> ExitReason {
        PendingJoin {
            identity: identity.clone(),
            session: Some(session),
            stopping: &self.stopping,
        }
        .wait()
        .await
    }

    async fn stop_session(&self, identity: &DeviceIdentity, session: Session) -> ExitReason {
        session.cancel.store(true, Ordering::Relaxed);
        self.join_session(identity, session).await
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_active(&self, identity: &DeviceIdentity) -> bool {
        matches!(self.table().get(identity), Some(Slot::Active(_)))
    }

    pub fn active_count(&self) -> usize {
        self.table()
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    /// Drop a session whose loop already ended but whose exit message has not
    /// been handled yet, so a replug is not mistaken for a duplicate.
    async fn reap_finished(&self, identity: &DeviceIdentity) {
        let finished = {
            let mut table = self.table();
            let done = matches!(
                table.get(identity),
                Some(Slot::Active(session)) if session.handle.is_finished()
            );
            match done.then(|| table.remove(identity)).flatten() {
                Some(Slot::Active(session)) => Some(session),
                _ => None,
            }
        };
        if let Some(session) = finished {
            let reason = self.join_session(identity, session).await;
            tlog!("[sessions] Reaped {} ({:?})", identity, reason);
        }
    }

    pub async fn on_arrived(&self, identity: DeviceIdentity, path: PathBuf) -> AdmitOutcome {
        if self.is_shutting_down() {
            return AdmitOutcome::ShuttingDown;
        }

        self.reap_finished(&identity).await;
        if self.table().contains_key(&identity) {
            tlog!("[sessions] {} already active, ignoring arrival", identity);
            return AdmitOutcome::AlreadyActive;
        }

        let admission = self.deps.admission.clone();
        let asked = identity.clone();
        let confirmed = match tokio::task::spawn_blocking(move || admission.confirm(&asked)).await {
            Ok(answer) => answer,
            Err(e) => {
                tlog!("[sessions] Admission check for {} failed: {}", identity, e);
                false
            }
        };
        if !confirmed {
            tlog!("[sessions] {} declined", identity);
            return AdmitOutcome::Declined;
        }

        // Re-check now that admission has returned; the first arrival wins
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self.table();
            if self.is_shutting_down() {
                return AdmitOutcome::ShuttingDown;
            }
            if table.contains_key(&identity) {
                tlog!("[sessions] {} admitted twice, keeping the first", identity);
                return AdmitOutcome::AlreadyActive;
            }
            table.insert(
                identity.clone(),
                Slot::Starting {
                    generation,
                    path: path.clone(),
                },
            );
        }

        let opener = self.deps.opener.clone();
        let open_path = path.clone();
        let opened = tokio::task::spawn_blocking(move || opener.open(&open_path)).await;
        let link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.withdraw(&identity, generation);
                tlog!("[sessions] {}: {}", identity, e);
                return AdmitOutcome::LinkFailed(e.to_string());
            }
            Err(e) => {
                self.withdraw(&identity, generation);
                tlog!("[sessions] {}: link open task failed: {}", identity, e);
                return AdmitOutcome::LinkFailed(e.to_string());
            }
        };

        let session = self.spawn_session(identity.clone(), path, generation, link);

        // Commit only if our reservation survived the open
        let orphan = {
            let mut table = self.table();
            let reserved = matches!(
                table.get(&identity),
                Some(Slot::Starting { generation: g, .. }) if *g == generation
            );
            if reserved && !self.is_shutting_down() {
                table.insert(identity.clone(), Slot::Active(session));
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = orphan {
            tlog!("[sessions] {} withdrawn while starting", identity);
            self.stop_session(&identity, session).await;
            return AdmitOutcome::Withdrawn;
        }

        tlog!("[sessions] {} admitted (generation {})", identity, generation);
        AdmitOutcome::Admitted
    }

    /// Remove a reservation if it is still ours
    fn withdraw(&self, identity: &DeviceIdentity, generation: u64) {
        let mut table = self.table();
        let ours = matches!(
            table.get(identity),
            Some(Slot::Starting { generation: g, .. }) if *g == generation
        );
        if ours {
            table.remove(identity);
        }
    }

    fn spawn_session(
        &self,
        identity: DeviceIdentity,
        path: PathBuf,
        generation: u64,
        link: Box<dyn ByteSource>,
    ) -> Session {
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = SessionContext {
            identity: identity.clone(),
            generation,
            schema: self.deps.schema.clone(),
            framing: self.deps.framing.clone(),
            timing: self.deps.timing,
            sink: self.deps.sink.clone(),
            cancel: cancel.clone(),
            exits: self.exits.clone(),
        };
        let exits = self.exits.clone();

        let handle = tokio::task::spawn_blocking(move || {
            // The link is dropped (and closed) while unwinding
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                run_session_blocking(ctx, link)
            }));
            match result {
                Ok(reason) => reason,
                Err(_) => {
                    tlog!("[session:{}] Panicked", identity);
                    let reason = ExitReason::Failed("session panicked".to_string());
                    let _ = exits.send(SessionExit {
                        identity,
                        generation,
                        reason: reason.clone(),
                    });
                    reason
                }
            }
        });

        Session {
            path,
            generation,
            cancel,
            handle,
        }
    }

    /// Stop the session for `identity` if it reads from `path`. A departure
    /// of some other node matching the same identity leaves it running.
    pub async fn on_departed(&self, identity: &DeviceIdentity, path: &Path) -> DepartOutcome {
        let slot = {
            let mut table = self.table();
            let ours = match table.get(identity) {
                None => return DepartOutcome::NotActive,
                Some(slot) => slot.path() == path,
            };
            if !ours {
                tlog!(
                    "[sessions] {} is recorded from another node, ignoring departure of {}",
                    identity,
                    path.display()
                );
                return DepartOutcome::OtherNode;
            }
            table.remove(identity)
        };
        match slot {
            None => DepartOutcome::NotActive,
            Some(Slot::Starting { .. }) => {
                tlog!("[sessions] {} departed while starting", identity);
                DepartOutcome::Cancelled
            }
            Some(Slot::Active(session)) => {
                tlog!("[sessions] Stopping {} ({})", identity, session.path.display());
                let reason = self.stop_session(identity, session).await;
                DepartOutcome::Stopped(reason)
            }
        }
    }

    /// Forget a session that ended by itself. Stale messages (from a session
    /// already replaced or stopped) are ignored.
    pub async fn on_session_exit(&self, exit: SessionExit) {
        let session = {
            let mut table = self.table();
            let current = matches!(
                table.get(&exit.identity),
                Some(Slot::Active(session)) if session.generation == exit.generation
            );
            match current.then(|| table.remove(&exit.identity)).flatten() {
                Some(Slot::Active(session)) => Some(session),
                _ => None,
            }
        };
        if let Some(session) = session {
            self.join_session(&exit.identity, session).await;
            if let ExitReason::Failed(reason) = &exit.reason {
                tlog!(
                    "[sessions] {} ended: {}; replug to resume recording",
                    exit.identity,
                    reason
                );
            }
        }
    }

    /// Stop every session, including any whose stop was begun but never
    /// waited for. All are signalled before any is joined, so the total wait
    /// is about one read timeout.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let drained: Vec<(DeviceIdentity, Slot)> = self.table().drain().collect();

        let mut sessions: Vec<(DeviceIdentity, Session)> = drained
            .into_iter()
            .filter_map(|(identity, slot)| match slot {
                Slot::Active(session) => Some((identity, session)),
                Slot::Starting { .. } => None,
            })
            .collect();
        sessions.append(&mut relock(&self.stopping));

        let count = sessions.len();
        futures::future::join_all(
            sessions
                .into_iter()
                .map(|(identity, session)| async move {
                    self.stop_session(&identity, session).await
                }),
        )
        .await;

        tlog!("[sessions] Shutdown complete ({} sessions stopped)", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentitySet;
    use crate::io::serial::link::LinkError;
    use crate::store::{Record, StoreError};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    const READ_TIMEOUT: Duration = Duration::from_millis(100);

    struct FakeLink {
        closes: Arc<AtomicUsize>,
        closed: bool,
        fail_after: Option<usize>,
        reads: usize,
    }

    impl ByteSource for FakeLink {
        fn read_chunk(&mut self, _buf: &mut [u8]) -> Result<usize, LinkError> {
            self.reads += 1;
            if matches!(self.fail_after, Some(n) if self.reads > n) {
                return Err(LinkError::Read {
                    path: PathBuf::from("/dev/fake"),
                    source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"),
                });
            }
            // A read that times out with nothing to show
            std::thread::sleep(READ_TIMEOUT);
            Ok(0)
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[derive(Default)]
    struct FakeOpener {
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
        fail_open: AtomicBool,
        fail_after: Option<usize>,
    }

    impl LinkOpener for FakeOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn ByteSource>, LinkError> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(LinkError::Configure {
                    path: path.to_path_buf(),
                    reason: "no such device".to_string(),
                });
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeLink {
                closes: self.closes.clone(),
                closed: false,
                fail_after: self.fail_after,
                reads: 0,
            }))
        }
    }

    struct FakeAdmission {
        answer: bool,
        delay: Duration,
        asked: AtomicUsize,
    }

    impl AdmissionPolicy for FakeAdmission {
        fn confirm(&self, _identity: &DeviceIdentity) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.answer
        }
    }

    struct NullSink;

    impl PersistenceSink for NullSink {
        fn ensure_schema(&self, _columns: &[String]) -> Result<(), StoreError> {
            Ok(())
        }
        fn insert(&self, _record: &Record) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct Harness {
        manager: SessionManager,
        exits: UnboundedReceiver<SessionExit>,
        opener: Arc<FakeOpener>,
        admission: Arc<FakeAdmission>,
    }

    fn harness(answer: bool, delay: Duration, opener: FakeOpener) -> Harness {
        let opener = Arc::new(opener);
        let admission = Arc::new(FakeAdmission {
            answer,
            delay,
            asked: AtomicUsize::new(0),
        });
        let (manager, exits) = SessionManager::new(SessionDeps {
            admission: admission.clone(),
            opener: opener.clone(),
            sink: Arc::new(NullSink),
            schema: Schema::new(["temp", "humidity"]).unwrap(),
            framing: FramingConfig::default(),
            timing: SessionTiming {
                settle_delay: Duration::ZERO,
                idle_sleep: Duration::from_millis(10),
                read_buffer_bytes: 64,
            },
        });
        Harness {
            manager,
            exits,
            opener,
            admission,
        }
    }

    fn onion(n: u8) -> DeviceIdentity {
        IdentitySet::default()
            .get(&format!("Onion{}", n))
            .unwrap()
            .clone()
    }

    fn node(n: u8) -> PathBuf {
        PathBuf::from(format!("/dev/Onion{}", n))
    }

    #[tokio::test]
    async fn test_double_arrival_creates_one_session() {
        let h = harness(true, Duration::from_millis(50), FakeOpener::default());

        let (a, b) = tokio::join!(
            h.manager.on_arrived(onion(1), node(1)),
            h.manager.on_arrived(onion(1), node(1)),
        );
        let mut outcomes = vec![a, b];
        outcomes.sort_by_key(|o| format!("{:?}", o));
        assert_eq!(outcomes, vec![AdmitOutcome::Admitted, AdmitOutcome::AlreadyActive]);
        assert_eq!(h.opener.opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.active_count(), 1);

        // Sequential duplicate never reaches admission
        let asked = h.admission.asked.load(Ordering::SeqCst);
        assert_eq!(
            h.manager.on_arrived(onion(1), node(1)).await,
            AdmitOutcome::AlreadyActive
        );
        assert_eq!(h.admission.asked.load(Ordering::SeqCst), asked);

        h.manager.shutdown().await;
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_declined_arrival_opens_nothing() {
        let h = harness(false, Duration::ZERO, FakeOpener::default());
        assert_eq!(
            h.manager.on_arrived(onion(2), node(2)).await,
            AdmitOutcome::Declined
        );
        assert_eq!(h.opener.opens.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.active_count(), 0);
        assert!(!h.manager.is_active(&onion(2)));
    }

    #[tokio::test]
    async fn test_departure_mid_sleep_then_fresh_session() {
        let h = harness(true, Duration::ZERO, FakeOpener::default());
        assert_eq!(
            h.manager.on_arrived(onion(1), node(1)).await,
            AdmitOutcome::Admitted
        );
        tokio::time::sleep(Duration::from_millis(150)).await;

        let outcome = h.manager.on_departed(&onion(1), &node(1)).await;
        assert_eq!(outcome, DepartOutcome::Stopped(ExitReason::Stopped));
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), 1);
        assert!(!h.manager.is_active(&onion(1)));

        assert_eq!(
            h.manager.on_arrived(onion(1), node(1)).await,
            AdmitOutcome::Admitted
        );
        assert_eq!(h.opener.opens.load(Ordering::SeqCst), 2);
        assert!(h.manager.is_active(&onion(1)));

        h.manager.shutdown().await;
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_latency_bounded_by_read_timeout() {
        let h = harness(true, Duration::ZERO, FakeOpener::default());
        h.manager.on_arrived(onion(3), node(3)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = Instant::now();
        h.manager.on_departed(&onion(3), &node(3)).await;
        // one blocked read, one idle slice, scheduling slack
        assert!(started.elapsed() < READ_TIMEOUT * 4, "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_departure_while_absent_is_noop() {
        let h = harness(true, Duration::ZERO, FakeOpener::default());
        assert_eq!(h.manager.on_departed(&onion(4), &node(4)).await, DepartOutcome::NotActive);
    }

    #[tokio::test]
    async fn test_link_failure_leaves_identity_absent() {
        let opener = FakeOpener::default();
        opener.fail_open.store(true, Ordering::SeqCst);
        let h = harness(true, Duration::ZERO, opener);

        let outcome = h.manager.on_arrived(onion(1), node(1)).await;
        assert!(matches!(outcome, AdmitOutcome::LinkFailed(_)));
        assert_eq!(h.manager.active_count(), 0);

        // Plugging back in retries
        h.opener.fail_open.store(false, Ordering::SeqCst);
        assert_eq!(
            h.manager.on_arrived(onion(1), node(1)).await,
            AdmitOutcome::Admitted
        );
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_session_returns_to_absent() {
        let h = harness(
            true,
            Duration::ZERO,
            FakeOpener {
                fail_after: Some(1),
                ..FakeOpener::default()
            },
        );
        let mut exits = h.exits;
        assert_eq!(
            h.manager.on_arrived(onion(2), node(2)).await,
            AdmitOutcome::Admitted
        );

        let exit = tokio::time::timeout(Duration::from_secs(5), exits.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit.reason, ExitReason::Failed(_)));
        h.manager.on_session_exit(exit).await;

        assert!(!h.manager.is_active(&onion(2)));
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_exit_does_not_remove_new_session() {
        let h = harness(true, Duration::ZERO, FakeOpener::default());
        h.manager.on_arrived(onion(1), node(1)).await;
        h.manager.on_departed(&onion(1), &node(1)).await;
        h.manager.on_arrived(onion(1), node(1)).await;

        let mut exits = h.exits;
        // Exit message from the first, already stopped, session
        let stale = exits.recv().await.unwrap();
        h.manager.on_session_exit(stale).await;
        assert!(h.manager.is_active(&onion(1)));

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything_and_refuses_arrivals() {
        let h = harness(true, Duration::ZERO, FakeOpener::default());
        for n in 1..=3 {
            assert_eq!(
                h.manager.on_arrived(onion(n), node(n)).await,
                AdmitOutcome::Admitted
            );
        }
        assert_eq!(h.manager.active_count(), 3);

        let started = Instant::now();
        h.manager.shutdown().await;
        assert!(started.elapsed() < READ_TIMEOUT * 4, "took {:?}", started.elapsed());
        assert_eq!(h.manager.active_count(), 0);
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), 3);

        assert_eq!(
            h.manager.on_arrived(onion(4), node(4)).await,
            AdmitOutcome::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_departure_racing_arrival_leaves_nothing_running() {
        let h = harness(true, Duration::from_millis(100), FakeOpener::default());

        let arrive = h.manager.on_arrived(onion(1), node(1));
        let depart = async {
            // Let the arrival reserve its slot
            tokio::time::sleep(Duration::from_millis(200)).await;
            h.manager.on_departed(&onion(1), &node(1)).await
        };
        let (arrived, departed) = tokio::join!(arrive, depart);

        // Either the departure hit the reservation or the finished session
        match departed {
            DepartOutcome::Cancelled => assert_eq!(arrived, AdmitOutcome::Withdrawn),
            DepartOutcome::Stopped(_) => assert_eq!(arrived, AdmitOutcome::Admitted),
            DepartOutcome::NotActive => panic!("departure ran before the reservation"),
            DepartOutcome::OtherNode => panic!("departure matched a different node"),
        }
        assert_eq!(h.manager.active_count(), 0);
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), h.opener.opens.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_departure_of_other_node_keeps_session() {
        let h = harness(true, Duration::ZERO, FakeOpener::default());
        let recorded = PathBuf::from("/dev/ttyUSB0");
        let unrecorded = PathBuf::from("/dev/ttyUSB1");

        assert_eq!(
            h.manager.on_arrived(onion(3), recorded.clone()).await,
            AdmitOutcome::Admitted
        );
        // A second adapter with the same ids came and went
        assert_eq!(
            h.manager.on_arrived(onion(3), unrecorded.clone()).await,
            AdmitOutcome::AlreadyActive
        );
        assert_eq!(
            h.manager.on_departed(&onion(3), &unrecorded).await,
            DepartOutcome::OtherNode
        );
        assert!(h.manager.is_active(&onion(3)));
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), 0);

        assert_eq!(
            h.manager.on_departed(&onion(3), &recorded).await,
            DepartOutcome::Stopped(ExitReason::Stopped)
        );
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_stop_is_joined_by_shutdown() {
        let h = harness(true, Duration::ZERO, FakeOpener::default());
        h.manager.on_arrived(onion(1), node(1)).await;
        // Land inside a blocked read
        tokio::time::sleep(Duration::from_millis(30)).await;

        let departed =
            tokio::time::timeout(Duration::from_millis(5), h.manager.on_departed(&onion(1), &node(1)))
                .await;
        assert!(departed.is_err(), "stop finished inside a blocked read");
        assert!(!h.manager.is_active(&onion(1)));

        h.manager.shutdown().await;
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), 1);
    }
}
