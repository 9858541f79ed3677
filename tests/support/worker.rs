#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tasknode::{
    ConnectionError, FatalError, InMemoryMetricRegistry, LeaderAddress, LeaderGateway,
    LeaderSession, ResourceId, SettableLeaderRetrieval, StartupConfiguration, WorkerServices,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Local-execution preset rooted in a fresh `work` directory under `base`.
pub fn local_config(base: &Path) -> StartupConfiguration {
    StartupConfiguration::for_local_execution(base.join("work"))
}

pub fn eventually(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

pub struct RecordingSession {
    leader: LeaderAddress,
    closed: AtomicBool,
    heartbeats: AtomicU64,
    fail_heartbeats: bool,
}

impl RecordingSession {
    pub fn token(&self) -> u64 {
        self.leader.token.0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }
}

impl LeaderSession for RecordingSession {
    fn leader(&self) -> &LeaderAddress {
        &self.leader
    }

    fn heartbeat(&self) -> Result<(), ConnectionError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeats {
            return Err(ConnectionError::Heartbeat {
                endpoint: self.leader.endpoint.clone(),
                reason: "no response".into(),
            });
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Gateway that accepts every leader, optionally after a per-token delay.
#[derive(Default)]
pub struct RecordingGateway {
    sessions: Mutex<Vec<Arc<RecordingSession>>>,
    delays: Mutex<HashMap<u64, Duration>>,
    fail_heartbeats: AtomicBool,
}

impl RecordingGateway {
    pub fn delay_token(&self, token: u64, delay: Duration) {
        self.delays.lock().insert(token, delay);
    }

    pub fn fail_heartbeats(&self) {
        self.fail_heartbeats.store(true, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<Arc<RecordingSession>> {
        self.sessions.lock().clone()
    }

    pub fn open_tokens(&self) -> Vec<u64> {
        self.sessions
            .lock()
            .iter()
            .filter(|session| !session.is_closed())
            .map(|session| session.token())
            .collect()
    }
}

impl LeaderGateway for RecordingGateway {
    fn connect(
        &self,
        leader: &LeaderAddress,
        _worker: &ResourceId,
    ) -> Result<Arc<dyn LeaderSession>, ConnectionError> {
        let delay = self.delays.lock().get(&leader.token.0).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let session = Arc::new(RecordingSession {
            leader: leader.clone(),
            closed: AtomicBool::new(false),
            heartbeats: AtomicU64::new(0),
            fail_heartbeats: self.fail_heartbeats.load(Ordering::SeqCst),
        });
        self.sessions.lock().push(session.clone());
        let session: Arc<dyn LeaderSession> = session;
        Ok(session)
    }
}

/// Collaborators for one boot, kept around so tests can inspect them.
pub struct Fixture {
    pub retrieval: Arc<SettableLeaderRetrieval>,
    pub gateway: Arc<RecordingGateway>,
    pub registry: Arc<InMemoryMetricRegistry>,
    pub fatal: Arc<Mutex<Vec<FatalError>>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_retrieval(SettableLeaderRetrieval::new())
    }

    pub fn with_retrieval(retrieval: SettableLeaderRetrieval) -> Self {
        Self {
            retrieval: Arc::new(retrieval),
            gateway: Arc::new(RecordingGateway::default()),
            registry: Arc::new(InMemoryMetricRegistry::new()),
            fatal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn services(&self) -> WorkerServices {
        let sink = self.fatal.clone();
        WorkerServices::new(self.retrieval.clone(), self.gateway.clone())
            .with_metric_registry(self.registry.clone())
            .with_fatal_error_handler(Arc::new(move |error: FatalError| sink.lock().push(error)))
    }
}
