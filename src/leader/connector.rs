//! Single-writer state machine tracking the current leader.
//!
//! Notifications, connection results and heartbeat verdicts are all turned
//! into [`ConnectorEvent`]s and applied in order by one event thread. Only
//! that thread touches the session and the heartbeat schedule; observers
//! read a [`ConnectorStatus`] snapshot.

use super::{
    ConnectionError, FencingToken, LeaderAddress, LeaderGateway, LeaderRetrievalError,
    LeaderRetrievalListener, LeaderSession,
};
use crate::config::HeartbeatConfiguration;
use crate::error::{FatalError, FatalErrorHandler};
use crate::guard::{FaultHandler, FaultRecord, GuardedTask, TaskResult};
use crate::resource_id::ResourceId;
use crate::scheduler::{PeriodicExecutor, ScheduleHandle};
use crate::timeouts::{ACCEPTED_HISTORY_LIMIT, CONNECTOR_SHUTDOWN_GRACE};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub heartbeat_interval: Duration,
    pub max_consecutive_failures: u32,
}

impl ConnectorConfig {
    pub fn from_heartbeat(heartbeat: &HeartbeatConfiguration) -> Self {
        Self {
            heartbeat_interval: heartbeat.interval(),
            max_consecutive_failures: heartbeat.max_consecutive_failures.max(1),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::from_heartbeat(&HeartbeatConfiguration::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorStatus {
    pub state: ConnectionState,
    /// Newest leader accepted by fencing token.
    pub accepted: Option<LeaderAddress>,
    pub connected_to: Option<LeaderAddress>,
    /// Tokens of accepted notifications, oldest first, bounded.
    pub accepted_history: Vec<FencingToken>,
    pub connection_attempts: u64,
    pub last_error: Option<ConnectionError>,
    pub shut_down: bool,
}

impl ConnectorStatus {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            accepted: None,
            connected_to: None,
            accepted_history: Vec::new(),
            connection_attempts: 0,
            last_error: None,
            shut_down: false,
        }
    }
}

enum ConnectorEvent {
    Leader(LeaderAddress),
    RetrievalFailed(LeaderRetrievalError),
    AttemptFinished {
        generation: u64,
        leader: LeaderAddress,
        result: Result<Arc<dyn LeaderSession>, ConnectionError>,
    },
    /// `None` is an explicit request; `Some` comes from the heartbeat of that
    /// connection generation.
    Reconnect { generation: Option<u64> },
    Shutdown,
}

struct Shared {
    status: Mutex<ConnectorStatus>,
    changed: Condvar,
    #[cfg(test)]
    transitions: Mutex<Vec<ConnectionState>>,
}

impl Shared {
    /// Applies `apply` unless the connector is shut down.
    fn update(&self, apply: impl FnOnce(&mut ConnectorStatus)) -> bool {
        let mut status = self.status.lock();
        if status.shut_down {
            return false;
        }
        #[cfg(test)]
        let before = status.state;
        apply(&mut status);
        #[cfg(test)]
        if status.state != before {
            self.transitions.lock().push(status.state);
        }
        self.changed.notify_all();
        true
    }
}

#[derive(Default)]
struct DrainStopped {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl DrainStopped {
    fn mark_stopped(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.condvar.notify_all();
    }

    fn wait_for_stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.condvar.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

/// Everything the connector borrows from the worker that owns it.
pub struct ConnectorContext {
    pub resource_id: ResourceId,
    pub gateway: Arc<dyn LeaderGateway>,
    pub executor: Arc<PeriodicExecutor>,
    pub config: ConnectorConfig,
    pub fatal_error_handler: Arc<dyn FatalErrorHandler>,
    /// Incremented for every fault captured from guarded background work.
    pub background_faults: Arc<AtomicU64>,
}

pub struct LeaderConnector {
    resource_id: ResourceId,
    shared: Arc<Shared>,
    events: Sender<ConnectorEvent>,
    drain: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<DrainStopped>,
}

impl LeaderConnector {
    /// Spawns the event thread. The connector stays DISCONNECTED until the
    /// first leader notification arrives.
    pub fn start(context: ConnectorContext) -> io::Result<Self> {
        let (events, receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            status: Mutex::new(ConnectorStatus::new()),
            changed: Condvar::new(),
            #[cfg(test)]
            transitions: Mutex::new(Vec::new()),
        });
        let stopped = Arc::new(DrainStopped::default());
        let resource_id = context.resource_id.clone();
        let event_loop = EventLoop {
            context,
            shared: shared.clone(),
            events: events.clone(),
            generation: 0,
            accepted: None,
            connect_failed: false,
            session: None,
            heartbeat: None,
        };
        let thread_stopped = stopped.clone();
        let drain = thread::Builder::new()
            .name("leader-connector".into())
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(|| event_loop.run(receiver))).is_err() {
                    error!("event=leader_connector_panicked");
                }
                thread_stopped.mark_stopped();
            })?;
        Ok(Self {
            resource_id,
            shared,
            events,
            drain: Mutex::new(Some(drain)),
            stopped,
        })
    }

    /// Listener to hand to a [`LeaderRetrievalService`](super::LeaderRetrievalService).
    pub fn listener(&self) -> Arc<dyn LeaderRetrievalListener> {
        Arc::new(ConnectorListener {
            events: self.events.clone(),
        })
    }

    pub fn notify_leader_address(&self, leader: LeaderAddress) {
        let _ = self.events.send(ConnectorEvent::Leader(leader));
    }

    /// Drops the current session and connects again to the accepted leader.
    pub fn request_reconnect(&self) {
        let _ = self
            .events
            .send(ConnectorEvent::Reconnect { generation: None });
    }

    pub fn status(&self) -> ConnectorStatus {
        self.shared.status.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.lock().state
    }

    /// Blocks until `predicate` holds for the status or `timeout` passes.
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&ConnectorStatus) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while !predicate(&status) {
            if self
                .shared
                .changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                return predicate(&status);
            }
        }
        true
    }

    /// Moves to DISCONNECTED regardless of the current state, closes any
    /// session and stops heartbeats. Safe to call more than once and from
    /// any thread, including the connector's own.
    pub fn shutdown(&self) {
        let first = {
            let mut status = self.shared.status.lock();
            let first = !status.shut_down;
            status.shut_down = true;
            status.state = ConnectionState::Disconnected;
            status.connected_to = None;
            self.shared.changed.notify_all();
            first
        };
        if first {
            info!("event=leader_connector_shutdown worker={}", self.resource_id);
            let _ = self.events.send(ConnectorEvent::Shutdown);
        }
        let Some(drain) = self.drain.lock().take() else {
            return;
        };
        if drain.thread().id() == thread::current().id() {
            return;
        }
        if self.stopped.wait_for_stop(CONNECTOR_SHUTDOWN_GRACE) {
            if drain.join().is_err() {
                warn!("event=leader_connector_join_failed worker={}", self.resource_id);
            }
        } else {
            warn!(
                "event=leader_connector_shutdown_timeout worker={} grace_ms={}",
                self.resource_id,
                CONNECTOR_SHUTDOWN_GRACE.as_millis()
            );
        }
    }
}

impl Drop for LeaderConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ConnectorListener {
    events: Sender<ConnectorEvent>,
}

impl LeaderRetrievalListener for ConnectorListener {
    fn notify_leader_address(&self, leader: LeaderAddress) {
        let _ = self.events.send(ConnectorEvent::Leader(leader));
    }

    fn handle_error(&self, error: LeaderRetrievalError) {
        let _ = self.events.send(ConnectorEvent::RetrievalFailed(error));
    }
}

struct EventLoop {
    context: ConnectorContext,
    shared: Arc<Shared>,
    events: Sender<ConnectorEvent>,
    /// Bumped for every connection attempt; results and heartbeat verdicts
    /// from older generations are stale.
    generation: u64,
    accepted: Option<LeaderAddress>,
    /// The last attempt for `accepted` failed and none is in flight.
    connect_failed: bool,
    session: Option<Arc<dyn LeaderSession>>,
    heartbeat: Option<ScheduleHandle>,
}

impl EventLoop {
    fn run(mut self, receiver: Receiver<ConnectorEvent>) {
        while let Ok(event) = receiver.recv() {
            if !self.handle(event) {
                break;
            }
        }
        self.drop_session();
        debug!("event=leader_connector_stopped worker={}", self.context.resource_id);
    }

    fn handle(&mut self, event: ConnectorEvent) -> bool {
        match event {
            ConnectorEvent::Leader(leader) => self.on_leader(leader),
            ConnectorEvent::RetrievalFailed(err) => {
                warn!("event=leader_retrieval_failed error={err}");
                self.context
                    .fatal_error_handler
                    .on_fatal_error(FatalError::LeaderRetrieval(err.to_string()));
            }
            ConnectorEvent::AttemptFinished {
                generation,
                leader,
                result,
            } => self.on_attempt_finished(generation, leader, result),
            ConnectorEvent::Reconnect { generation } => self.on_reconnect(generation),
            ConnectorEvent::Shutdown => return false,
        }
        true
    }

    fn on_leader(&mut self, leader: LeaderAddress) {
        if self.connect_failed {
            if let Some(accepted) = self
                .accepted
                .clone()
                .filter(|accepted| accepted.token == leader.token)
            {
                info!("event=leader_connect_retry leader={accepted}");
                self.start_attempt(accepted);
                return;
            }
        }
        if !leader.supersedes(self.accepted.as_ref()) {
            debug!(
                "event=leader_notification_discarded leader={} accepted_token={}",
                leader,
                self.accepted
                    .as_ref()
                    .map(|accepted| accepted.token.to_string())
                    .unwrap_or_default()
            );
            return;
        }
        let recorded = self.shared.update(|status| {
            status.accepted = Some(leader.clone());
            status.accepted_history.push(leader.token);
            if status.accepted_history.len() > ACCEPTED_HISTORY_LIMIT {
                status.accepted_history.remove(0);
            }
        });
        if !recorded {
            return;
        }
        info!("event=leader_accepted leader={leader}");
        self.accepted = Some(leader.clone());
        self.drop_session();
        self.start_attempt(leader);
    }

    fn on_reconnect(&mut self, generation: Option<u64>) {
        if generation.map_or(false, |generation| generation != self.generation) {
            debug!("event=leader_reconnect_stale generation={generation:?}");
            return;
        }
        let Some(leader) = self.accepted.clone() else {
            debug!("event=leader_reconnect_skipped reason=no_leader");
            return;
        };
        info!("event=leader_reconnect leader={leader}");
        self.drop_session();
        self.start_attempt(leader);
    }

    fn start_attempt(&mut self, leader: LeaderAddress) {
        self.generation += 1;
        self.connect_failed = false;
        let generation = self.generation;
        let started = self.shared.update(|status| {
            status.state = ConnectionState::Connecting;
            status.connected_to = None;
            status.connection_attempts += 1;
        });
        if !started {
            return;
        }

        let gateway = self.context.gateway.clone();
        let resource_id = self.context.resource_id.clone();
        let shared = self.shared.clone();
        let events = self.events.clone();
        let target = leader.clone();
        let submitted = self.context.executor.execute_blocking(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                gateway.connect(&target, &resource_id)
            }))
            .unwrap_or_else(|_| {
                Err(ConnectionError::Unreachable {
                    endpoint: target.endpoint.clone(),
                    reason: "connect panicked".into(),
                })
            });
            deliver_attempt(
                &shared,
                &events,
                ConnectorEvent::AttemptFinished {
                    generation,
                    leader: target,
                    result,
                },
            );
        });
        if let Err(err) = submitted {
            warn!("event=leader_connect_not_submitted leader={leader} error={err}");
            self.connect_failed = true;
            self.shared
                .update(|status| status.state = ConnectionState::Disconnected);
        }
    }

    fn on_attempt_finished(
        &mut self,
        generation: u64,
        leader: LeaderAddress,
        result: Result<Arc<dyn LeaderSession>, ConnectionError>,
    ) {
        if generation != self.generation {
            debug!("event=leader_connect_stale leader={leader} generation={generation}");
            if let Ok(session) = result {
                session.close();
            }
            return;
        }
        match result {
            Ok(session) => {
                let connected = self.shared.update(|status| {
                    status.state = ConnectionState::Connected;
                    status.connected_to = Some(leader.clone());
                    status.last_error = None;
                });
                if !connected {
                    session.close();
                    return;
                }
                info!(
                    "event=leader_connected leader={leader} worker={}",
                    self.context.resource_id
                );
                self.schedule_heartbeat(&session);
                self.session = Some(session);
            }
            Err(err) => {
                warn!("event=leader_connect_failed leader={leader} error={err}");
                self.connect_failed = true;
                self.shared.update(|status| {
                    status.state = ConnectionState::Disconnected;
                    status.last_error = Some(err);
                });
            }
        }
    }

    fn schedule_heartbeat(&mut self, session: &Arc<dyn LeaderSession>) {
        let failures = Arc::new(AtomicU32::new(0));
        let beat = {
            let session = session.clone();
            let failures = failures.clone();
            move || -> TaskResult {
                session.heartbeat()?;
                failures.store(0, Ordering::Release);
                Ok(())
            }
        };
        let handler = HeartbeatFaultHandler {
            leader: session.leader().clone(),
            generation: self.generation,
            failures,
            max_consecutive_failures: self.context.config.max_consecutive_failures,
            events: self.events.clone(),
            fatal_error_handler: self.context.fatal_error_handler.clone(),
            background_faults: self.context.background_faults.clone(),
        };
        let task = GuardedTask::with_shared_handler(beat, Arc::new(handler)).into_runnable();
        let interval = self.context.config.heartbeat_interval;
        match self
            .context
            .executor
            .schedule_with_fixed_delay(interval, interval, task)
        {
            Ok(handle) => self.heartbeat = Some(handle),
            Err(err) => warn!(
                "event=leader_heartbeat_not_scheduled leader={} error={err}",
                session.leader()
            ),
        }
    }

    /// Stops heartbeats and closes the session. The published state is left
    /// to the caller: a new attempt moves it straight to CONNECTING.
    fn drop_session(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        if let Some(session) = self.session.take() {
            debug!("event=leader_session_closed leader={}", session.leader());
            session.close();
        }
    }
}

/// Hands a finished attempt to the event thread, or closes the session when
/// the connector has already shut down. Sending under the status lock keeps
/// every successful attempt ahead of the shutdown event in the queue.
fn deliver_attempt(shared: &Shared, events: &Sender<ConnectorEvent>, event: ConnectorEvent) {
    let status = shared.status.lock();
    let undelivered = if status.shut_down {
        Some(event)
    } else {
        events.send(event).err().map(|mpsc::SendError(event)| event)
    };
    drop(status);
    if let Some(ConnectorEvent::AttemptFinished {
        result: Ok(session),
        ..
    }) = undelivered
    {
        debug!("event=leader_session_orphaned leader={}", session.leader());
        session.close();
    }
}

struct HeartbeatFaultHandler {
    leader: LeaderAddress,
    generation: u64,
    failures: Arc<AtomicU32>,
    max_consecutive_failures: u32,
    events: Sender<ConnectorEvent>,
    fatal_error_handler: Arc<dyn FatalErrorHandler>,
    background_faults: Arc<AtomicU64>,
}

impl FaultHandler for HeartbeatFaultHandler {
    fn handle(&self, record: FaultRecord) {
        self.background_faults.fetch_add(1, Ordering::AcqRel);
        if record.fault.is_panic() {
            self.fatal_error_handler
                .on_fatal_error(FatalError::BackgroundTask {
                    thread: record.thread.to_string(),
                    message: record.fault.message(),
                });
            return;
        }
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            "event=leader_heartbeat_failed leader={} thread={} failures={} error={}",
            self.leader,
            record.thread,
            failures,
            record.fault.message()
        );
        if failures >= self.max_consecutive_failures {
            self.failures.store(0, Ordering::Release);
            let _ = self.events.send(ConnectorEvent::Reconnect {
                generation: Some(self.generation),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FakeSession {
        leader: LeaderAddress,
        closed: AtomicBool,
        fail_heartbeats: bool,
        panic_heartbeats: bool,
    }

    impl LeaderSession for FakeSession {
        fn leader(&self) -> &LeaderAddress {
            &self.leader
        }

        fn heartbeat(&self) -> Result<(), ConnectionError> {
            if self.panic_heartbeats {
                panic!("heartbeat exploded");
            }
            if self.fail_heartbeats {
                return Err(ConnectionError::Heartbeat {
                    endpoint: self.leader.endpoint.clone(),
                    reason: "timeout".into(),
                });
            }
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeGateway {
        sessions: Mutex<Vec<Arc<FakeSession>>>,
        unreachable: Mutex<Vec<String>>,
        fail_heartbeats: AtomicBool,
        panic_heartbeats: AtomicBool,
    }

    impl LeaderGateway for FakeGateway {
        fn connect(
            &self,
            leader: &LeaderAddress,
            _worker: &ResourceId,
        ) -> Result<Arc<dyn LeaderSession>, ConnectionError> {
            if self.unreachable.lock().contains(&leader.endpoint) {
                return Err(ConnectionError::Unreachable {
                    endpoint: leader.endpoint.clone(),
                    reason: "connection refused".into(),
                });
            }
            let fake = Arc::new(FakeSession {
                leader: leader.clone(),
                closed: AtomicBool::new(false),
                fail_heartbeats: self.fail_heartbeats.load(Ordering::SeqCst),
                panic_heartbeats: self.panic_heartbeats.load(Ordering::SeqCst),
            });
            self.sessions.lock().push(fake.clone());
            let session: Arc<dyn LeaderSession> = fake;
            Ok(session)
        }
    }

    struct Harness {
        connector: LeaderConnector,
        gateway: Arc<FakeGateway>,
        executor: Arc<PeriodicExecutor>,
        fatal: Arc<Mutex<Vec<FatalError>>>,
        background_faults: Arc<AtomicU64>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.connector.shutdown();
            self.executor.shutdown();
        }
    }

    fn harness(gateway: FakeGateway, config: ConnectorConfig) -> Harness {
        let gateway = Arc::new(gateway);
        let executor = Arc::new(PeriodicExecutor::new("connector-test").unwrap());
        let fatal = Arc::new(Mutex::new(Vec::new()));
        let sink = fatal.clone();
        let background_faults = Arc::new(AtomicU64::new(0));
        let connector = LeaderConnector::start(ConnectorContext {
            resource_id: ResourceId::new("worker-1"),
            gateway: gateway.clone(),
            executor: executor.clone(),
            config,
            fatal_error_handler: Arc::new(move |fatal: FatalError| sink.lock().push(fatal)),
            background_faults: background_faults.clone(),
        })
        .unwrap();
        Harness {
            connector,
            gateway,
            executor,
            fatal,
            background_faults,
        }
    }

    fn quiet() -> ConnectorConfig {
        ConnectorConfig {
            heartbeat_interval: Duration::from_secs(3600),
            max_consecutive_failures: 3,
        }
    }

    fn eventually(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        predicate()
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn connects_to_first_leader() {
        let h = harness(FakeGateway::default(), quiet());
        assert_eq!(h.connector.state(), ConnectionState::Disconnected);
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-a:6123", 1));
        assert!(h
            .connector
            .wait_for(WAIT, |s| s.state == ConnectionState::Connected));
        let status = h.connector.status();
        assert_eq!(status.connected_to, Some(LeaderAddress::new("rm-a:6123", 1)));
        assert_eq!(status.connection_attempts, 1);
    }

    #[test]
    fn older_and_equal_tokens_are_discarded() {
        let h = harness(FakeGateway::default(), quiet());
        let listener = h.connector.listener();
        listener.notify_leader_address(LeaderAddress::new("rm-a:6123", 7));
        listener.notify_leader_address(LeaderAddress::new("rm-b:6123", 7));
        listener.notify_leader_address(LeaderAddress::new("rm-c:6123", 2));
        assert!(h
            .connector
            .wait_for(WAIT, |s| s.state == ConnectionState::Connected));
        thread::sleep(Duration::from_millis(20));
        let status = h.connector.status();
        assert_eq!(status.accepted_history, vec![FencingToken(7)]);
        assert_eq!(status.connected_to.map(|l| l.endpoint), Some("rm-a:6123".into()));
        assert_eq!(h.gateway.sessions.lock().len(), 1);
    }

    #[test]
    fn newer_leader_replaces_session() {
        let h = harness(FakeGateway::default(), quiet());
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-a:6123", 1));
        assert!(h
            .connector
            .wait_for(WAIT, |s| s.state == ConnectionState::Connected));
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-b:6123", 2));
        assert!(h.connector.wait_for(WAIT, |s| {
            s.connected_to.as_ref().map(|l| l.token) == Some(FencingToken(2))
        }));
        let sessions = h.gateway.sessions.lock();
        assert!(sessions[0].closed.load(Ordering::SeqCst));
        assert!(!sessions[1].closed.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_connect_reports_error_and_stays_disconnected() {
        let gateway = FakeGateway::default();
        gateway.unreachable.lock().push("rm-down:6123".into());
        let h = harness(gateway, quiet());
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-down:6123", 4));
        assert!(h.connector.wait_for(WAIT, |s| s.last_error.is_some()));
        let status = h.connector.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(matches!(
            status.last_error,
            Some(ConnectionError::Unreachable { .. })
        ));
    }

    #[test]
    fn failed_connect_is_retried_when_the_same_leader_is_announced_again() {
        let gateway = FakeGateway::default();
        gateway.unreachable.lock().push("rm:1".into());
        let h = harness(gateway, quiet());
        h.connector.notify_leader_address(LeaderAddress::new("rm:1", 1));
        assert!(h.connector.wait_for(WAIT, |s| s.last_error.is_some()));
        assert_eq!(h.connector.state(), ConnectionState::Disconnected);

        h.gateway.unreachable.lock().clear();
        h.connector.notify_leader_address(LeaderAddress::new("rm:1", 1));
        assert!(h
            .connector
            .wait_for(WAIT, |s| s.state == ConnectionState::Connected));
        let status = h.connector.status();
        assert_eq!(status.connection_attempts, 2);
        assert_eq!(status.accepted_history, vec![FencingToken(1)]);
        assert_eq!(status.last_error, None);

        h.connector.notify_leader_address(LeaderAddress::new("rm:1", 1));
        h.connector.notify_leader_address(LeaderAddress::new("rm:0", 0));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.connector.status().connection_attempts, 2);
    }

    #[test]
    fn leader_change_moves_from_connected_straight_to_connecting() {
        let h = harness(FakeGateway::default(), quiet());
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-a:6123", 1));
        assert!(h
            .connector
            .wait_for(WAIT, |s| s.state == ConnectionState::Connected));
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-b:6123", 2));
        assert!(h.connector.wait_for(WAIT, |s| {
            s.connected_to.as_ref().map(|l| l.token) == Some(FencingToken(2))
        }));
        assert_eq!(
            *h.connector.shared.transitions.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[test]
    fn repeated_heartbeat_failures_trigger_reconnect() {
        let gateway = FakeGateway::default();
        gateway.fail_heartbeats.store(true, Ordering::SeqCst);
        let h = harness(
            gateway,
            ConnectorConfig {
                heartbeat_interval: Duration::from_millis(2),
                max_consecutive_failures: 2,
            },
        );
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-a:6123", 1));
        assert!(h.connector.wait_for(WAIT, |s| s.connection_attempts >= 2));
        assert!(h.background_faults.load(Ordering::SeqCst) >= 2);
        assert!(h.gateway.sessions.lock()[0].closed.load(Ordering::SeqCst));
        assert!(h.fatal.lock().is_empty());
    }

    #[test]
    fn heartbeat_panic_is_fatal_but_contained() {
        let gateway = FakeGateway::default();
        gateway.panic_heartbeats.store(true, Ordering::SeqCst);
        let h = harness(
            gateway,
            ConnectorConfig {
                heartbeat_interval: Duration::from_millis(2),
                max_consecutive_failures: 3,
            },
        );
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-a:6123", 1));
        assert!(eventually(WAIT, || h.fatal.lock().len() >= 2));
        match &h.fatal.lock()[0] {
            FatalError::BackgroundTask { thread, message } => {
                assert!(thread.starts_with("connector-test-"));
                assert_eq!(message, "heartbeat exploded");
            }
            other => panic!("unexpected fatal error {other:?}"),
        }
        assert_eq!(h.connector.state(), ConnectionState::Connected);
    }

    #[test]
    fn retrieval_error_goes_to_fatal_handler() {
        let h = harness(FakeGateway::default(), quiet());
        h.connector
            .listener()
            .handle_error(LeaderRetrievalError::Failed("lost ha backend".into()));
        assert!(eventually(WAIT, || !h.fatal.lock().is_empty()));
        assert_eq!(
            h.fatal.lock()[0],
            FatalError::LeaderRetrieval("leader retrieval failed: lost ha backend".into())
        );
    }

    #[test]
    fn explicit_reconnect_opens_new_session_to_same_leader() {
        let h = harness(FakeGateway::default(), quiet());
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-a:6123", 1));
        assert!(h
            .connector
            .wait_for(WAIT, |s| s.state == ConnectionState::Connected));
        h.connector.request_reconnect();
        assert!(h.connector.wait_for(WAIT, |s| {
            s.connection_attempts == 2 && s.state == ConnectionState::Connected
        }));
        let sessions = h.gateway.sessions.lock();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[0].closed.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_closes_session_and_ignores_later_notifications() {
        let h = harness(FakeGateway::default(), quiet());
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-a:6123", 1));
        assert!(h
            .connector
            .wait_for(WAIT, |s| s.state == ConnectionState::Connected));
        h.connector.shutdown();
        h.connector.shutdown();
        h.connector
            .notify_leader_address(LeaderAddress::new("rm-b:6123", 9));
        let status = h.connector.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.shut_down);
        assert_eq!(status.accepted_history, vec![FencingToken(1)]);
        assert!(h.gateway.sessions.lock()[0].closed.load(Ordering::SeqCst));
    }
}
