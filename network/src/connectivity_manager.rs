// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Connectivity manager for maintaining physical connections
//!
//! Owns the local listeners, the optional NAT mapping and the outbound
//! connection tasks. A task that fails, or whose connection drops, is
//! queued on the retry scheduler when its policy asks for reconnects and
//! removed otherwise.

use crate::config::{ConnectTaskConfig, ListenerConfig, RetryPolicy, TerraGrafConfig};
use crate::counters::NetworkMetrics;
use crate::discovery::Dialer;
use crate::error::Result;
use crate::graph::PeerGraph;
use crate::interfaces::{expand_endpoints, InterfaceProvider};
use crate::nat::{NatTraversal, PortMapper};
use crate::protocols::{PeerId, PeerUpdate};
use crate::scheduler::RetryScheduler;
use crate::session::{ConnectionLost, LinkMeta, SessionManager};
use crate::transport::{apply_socket_options, bind_listener, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outbound connection task identifier
pub type TaskId = u64;

/// Lifecycle state of an outbound task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for its first attempt or for a scheduled retry
    Pending,
    Connecting,
    Connected,
    Failed,
}

/// An outbound connection to a configured endpoint
#[derive(Debug, Clone)]
pub struct ConnectionTask {
    pub id: TaskId,
    pub endpoint: SocketAddr,
    pub policy: RetryPolicy,
    pub close_duplicate: bool,
    pub state: TaskState,
    pub attempts: u32,
    pub next_retry: Option<Instant>,
    /// Peer the task is connected to
    pub peer: Option<PeerId>,
    /// Loss of the connection reported before the attempt completed
    early_loss: Option<ConnectionLost>,
}

impl ConnectionTask {
    fn new(id: TaskId, config: ConnectTaskConfig) -> Self {
        Self {
            id,
            endpoint: config.endpoint,
            policy: config.retry,
            close_duplicate: config.close_duplicate_session,
            state: TaskState::Pending,
            attempts: 0,
            next_retry: None,
            peer: None,
            early_loss: None,
        }
    }
}

/// Connectivity manager for maintaining physical connections
pub struct ConnectivityManager {
    config: TerraGrafConfig,
    sessions: Arc<SessionManager>,
    graph: Arc<PeerGraph>,
    transport: Arc<dyn Transport>,
    interfaces: Arc<dyn InterfaceProvider>,
    nat: Option<NatTraversal>,
    scheduler: RetryScheduler<TaskId>,
    pending: Mutex<HashMap<TaskId, ConnectionTask>>,
    established: Mutex<HashMap<TaskId, ConnectionTask>>,
    next_task: AtomicU64,
    listeners: Mutex<Vec<SocketAddr>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    metrics: NetworkMetrics,
}

impl ConnectivityManager {
    /// Create a new connectivity manager
    pub fn new(
        config: TerraGrafConfig,
        sessions: Arc<SessionManager>,
        transport: Arc<dyn Transport>,
        interfaces: Arc<dyn InterfaceProvider>,
        metrics: NetworkMetrics,
    ) -> Self {
        Self {
            config,
            graph: sessions.graph().clone(),
            sessions,
            transport,
            interfaces,
            nat: None,
            scheduler: RetryScheduler::new(),
            pending: Mutex::new(HashMap::new()),
            established: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Use `mapper` for NAT port mapping
    pub fn with_port_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.nat = Some(NatTraversal::new(mapper, self.interfaces.clone()));
        self
    }

    /// Whether a port mapper is available for NAT traversal
    pub fn maps_nat(&self) -> bool {
        self.nat.is_some()
    }

    /// Open listeners, map the NAT port and start the configured tasks
    pub async fn start(self: &Arc<Self>, lost: mpsc::UnboundedReceiver<ConnectionLost>) -> Result<()> {
        tracing::info!("Connectivity manager starting");

        if self.open_listeners().is_empty() {
            tracing::warn!("No local listener opened, only outbound connections possible");
        }
        self.setup_nat().await;
        self.spawn_workers(lost);

        for task in self.config.connect_tasks.clone() {
            self.add_task(task)?;
        }
        Ok(())
    }

    /// Stop listeners and background loops; pending tasks are left as is
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        futures::future::join_all(handles).await;
        tracing::info!("Connectivity manager stopped");
    }

    /// Endpoints the local peer listens on
    pub fn listeners(&self) -> Vec<SocketAddr> {
        self.listeners.lock().clone()
    }

    fn listener_endpoints(&self) -> Vec<SocketAddr> {
        let (ipv4, ipv6) = (self.config.ipv4, self.config.ipv6);
        match &self.config.listeners {
            ListenerConfig::Automatic { port } => self
                .interfaces
                .local_addresses(ipv4, ipv6)
                .into_iter()
                .map(|ip| SocketAddr::new(ip, *port))
                .collect(),
            ListenerConfig::Manual { endpoints } => {
                let enabled: Vec<SocketAddr> = endpoints
                    .iter()
                    .filter(|e| (e.is_ipv4() && ipv4) || (e.is_ipv6() && ipv6))
                    .copied()
                    .collect();
                expand_endpoints(&enabled, self.interfaces.as_ref())
            }
        }
    }

    /// Bind every listener endpoint; failures are logged and skipped
    pub fn open_listeners(self: &Arc<Self>) -> Vec<SocketAddr> {
        let mut bound = Vec::new();
        for endpoint in self.listener_endpoints() {
            match bind_listener(endpoint) {
                Ok(listener) => {
                    let local = listener.local_addr().unwrap_or(endpoint);
                    tracing::info!("Listening on {}", local);
                    bound.push(local);
                    let handle = tokio::spawn(self.clone().accept_loop(listener));
                    self.handles.lock().push(handle);
                }
                Err(e) => tracing::warn!("Listener on {} skipped: {}", endpoint, e),
            }
        }

        let all = {
            let mut listeners = self.listeners.lock();
            listeners.extend(bound.iter().copied());
            listeners.clone()
        };
        self.graph.set_local_listeners(all.clone());
        if !bound.is_empty() {
            self.sessions.publish_local_update(PeerUpdate::Listeners {
                peer: self.graph.local_id().to_string(),
                endpoints: all,
            });
        }
        bound
    }

    async fn setup_nat(&self) {
        if !self.config.nat.enabled {
            return;
        }
        let Some(nat) = &self.nat else {
            tracing::warn!("NAT mapping enabled but no port mapper configured");
            return;
        };

        let listeners = self.listeners();
        match nat.map(&listeners, self.config.nat.probe_addr).await {
            Ok(Some(external)) => {
                tracing::info!("Reachable through NAT gateway at {}", external);
                self.graph.add_local_nat_endpoint(external);
                self.sessions.publish_local_update(PeerUpdate::NatGateways {
                    peer: self.graph.local_id().to_string(),
                    endpoints: self.graph.local_descriptor().nat_endpoints,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("NAT mapping failed: {}", e),
        }
    }

    /// Start the retry scheduler and the loop reacting to it
    pub fn spawn_workers(self: &Arc<Self>, lost: mpsc::UnboundedReceiver<ConnectionLost>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = self.scheduler.spawn(fired_tx, self.cancel.clone());
        let run = tokio::spawn(self.clone().run(fired_rx, lost));
        self.handles.lock().extend([scheduler, run]);
    }

    async fn run(
        self: Arc<Self>,
        mut fired: mpsc::UnboundedReceiver<TaskId>,
        mut lost: mpsc::UnboundedReceiver<ConnectionLost>,
    ) {
        tracing::info!("Connectivity manager started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(id) = fired.recv() => self.dispatch(id),
                Some(event) = lost.recv() => self.handle_lost(event),
                else => break,
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    if let Err(e) = apply_socket_options(&stream, &self.config.socket) {
                        tracing::debug!("Socket options on {} not applied: {}", remote, e);
                    }
                    let sessions = self.sessions.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sessions.establish(stream, LinkMeta::inbound(remote)).await {
                            tracing::debug!("Inbound connection from {} dropped: {}", remote, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Failed to accept connection: {}", e),
            }
        }
    }

    /// Register an outbound task and dispatch its first attempt
    pub fn add_task(self: &Arc<Self>, config: ConnectTaskConfig) -> Result<TaskId> {
        config.validate()?;
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let endpoint = config.endpoint;
        self.pending.lock().insert(id, ConnectionTask::new(id, config));
        tracing::info!("Connection task {} to {} added", id, endpoint);
        self.dispatch(id);
        Ok(id)
    }

    /// Whether a task is still in the pending set
    pub fn is_pending(&self, id: TaskId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of a task, pending or connected
    pub fn task(&self, id: TaskId) -> Option<ConnectionTask> {
        if let Some(task) = self.pending.lock().get(&id) {
            return Some(task.clone());
        }
        self.established.lock().get(&id).cloned()
    }

    fn dispatch(self: &Arc<Self>, id: TaskId) {
        let (endpoint, timeout, close_duplicate) = {
            let mut pending = self.pending.lock();
            let Some(task) = pending.get_mut(&id) else {
                tracing::trace!("Task {} no longer pending", id);
                return;
            };
            if task.state == TaskState::Connecting {
                return;
            }
            task.state = TaskState::Connecting;
            task.attempts += 1;
            task.next_retry = None;
            (task.endpoint, task.policy.connect_timeout, task.close_duplicate)
        };

        tracing::debug!("Connecting task {} to {}", id, endpoint);
        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager
                .attempt(Some(id), endpoint, timeout, close_duplicate)
                .await;
            manager.complete_attempt(id, result);
        });
    }

    async fn attempt(
        &self,
        task: Option<TaskId>,
        endpoint: SocketAddr,
        timeout: Duration,
        close_duplicate: bool,
    ) -> Result<PeerId> {
        self.metrics.inc_connection_attempts();
        let started = Instant::now();
        let connected = self.transport.connect(endpoint, timeout).await?;
        let mut meta = LinkMeta::outbound(connected.remote_addr, task, started);
        meta.close_duplicate = close_duplicate;
        self.sessions.establish(connected.stream, meta).await
    }

    fn complete_attempt(&self, id: TaskId, result: Result<PeerId>) {
        let mut pending = self.pending.lock();
        match result {
            Ok(peer) => {
                let Some(mut task) = pending.remove(&id) else {
                    return;
                };
                task.peer = Some(peer.clone());
                if let Some(lost) = task.early_loss.take() {
                    tracing::debug!("Connection of task {} to {} closed before registration", id, peer);
                    self.requeue_lost(&mut pending, task, lost);
                    return;
                }
                tracing::info!("Task {} connected to {} at {}", id, peer, task.endpoint);
                task.state = TaskState::Connected;
                self.established.lock().insert(id, task);
            }
            Err(e) => {
                self.metrics.inc_failed_connections();
                let Some(task) = pending.get_mut(&id) else {
                    return;
                };
                task.state = TaskState::Failed;
                let reconnect = task.policy.reconnect_on_failure;
                if reconnect {
                    task.state = TaskState::Pending;
                    task.next_retry = Some(self.scheduler.schedule(id, task.policy.delay));
                    self.metrics.inc_retries_scheduled();
                }

                // refused or timed-out connects heal silently
                match (e.is_transient(), reconnect) {
                    (true, true) => tracing::debug!(
                        "Task {} to {} failed (attempt {}): {}; retrying in {:?}",
                        id,
                        task.endpoint,
                        task.attempts,
                        e,
                        task.policy.delay
                    ),
                    (false, true) => tracing::warn!(
                        "Task {} to {} failed (attempt {}): {}; retrying in {:?}",
                        id,
                        task.endpoint,
                        task.attempts,
                        e,
                        task.policy.delay
                    ),
                    (_, false) => {
                        tracing::warn!("Task {} to {} failed: {}; abandoned", id, task.endpoint, e);
                        pending.remove(&id);
                    }
                }
            }
        }
    }

    fn handle_lost(&self, lost: ConnectionLost) {
        let mut pending = self.pending.lock();
        let established = self.established.lock().remove(&lost.task);
        match established {
            Some(task) => self.requeue_lost(&mut pending, task, lost),
            None => {
                // the attempt has not registered its connection yet
                if let Some(task) = pending.get_mut(&lost.task) {
                    if task.state == TaskState::Connecting {
                        task.early_loss = Some(lost);
                    }
                }
            }
        }
    }

    fn requeue_lost(
        &self,
        pending: &mut HashMap<TaskId, ConnectionTask>,
        mut task: ConnectionTask,
        lost: ConnectionLost,
    ) {
        if lost.retired {
            tracing::info!(
                "Connection of task {} to {} closed by policy, task removed",
                task.id,
                lost.peer
            );
            return;
        }
        if !task.policy.reconnect_on_failure {
            tracing::info!("Connection of task {} to {} lost, task removed", task.id, lost.peer);
            return;
        }

        tracing::info!(
            "Connection of task {} to {} lost, reconnecting in {:?}",
            task.id,
            lost.peer,
            task.policy.delay
        );
        task.state = TaskState::Pending;
        task.peer = None;
        task.next_retry = Some(self.scheduler.schedule(task.id, task.policy.delay));
        self.metrics.inc_retries_scheduled();
        pending.insert(task.id, task);
    }
}

#[async_trait]
impl Dialer for ConnectivityManager {
    async fn dial(&self, endpoint: SocketAddr) -> Result<PeerId> {
        self.attempt(None, endpoint, self.config.discovery.connect_timeout, false)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::interfaces::tests::StaticInterfaces;
    use crate::session::tests::session_manager;
    use crate::transport::Connected;

    struct RefusingTransport {
        attempts: mpsc::UnboundedSender<SocketAddr>,
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn connect(&self, endpoint: SocketAddr, _timeout: Duration) -> Result<Connected> {
            let _ = self.attempts.send(endpoint);
            Err(NetworkError::ConnectionError(format!("{} refused", endpoint)))
        }
    }

    fn manager(
        interfaces: StaticInterfaces,
        config: TerraGrafConfig,
    ) -> (Arc<ConnectivityManager>, mpsc::UnboundedReceiver<SocketAddr>) {
        let (sessions, _outputs) = session_manager("local", "lab");
        let (attempts, attempts_rx) = mpsc::unbounded_channel();
        let manager = ConnectivityManager::new(
            config,
            sessions,
            Arc::new(RefusingTransport { attempts }),
            Arc::new(interfaces),
            NetworkMetrics::new(),
        );
        (Arc::new(manager), attempts_rx)
    }

    fn no_interfaces() -> StaticInterfaces {
        StaticInterfaces {
            addresses: vec![],
            probe_result: None,
        }
    }

    fn task(reconnect: bool, delay: Duration) -> ConnectTaskConfig {
        let mut config = ConnectTaskConfig::new("10.0.0.9:5000".parse().unwrap());
        config.retry = RetryPolicy {
            reconnect_on_failure: reconnect,
            delay,
            connect_timeout: Duration::from_secs(1),
        };
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_stays_pending_with_reconnect() {
        let (manager, mut attempts) =
            manager(no_interfaces(), TerraGrafConfig::for_peer("local", "lab"));
        let (_lost_tx, lost_rx) = mpsc::unbounded_channel();
        manager.spawn_workers(lost_rx);

        let start = Instant::now();
        let id = manager.add_task(task(true, Duration::from_millis(50))).unwrap();
        for _ in 0..3 {
            attempts.recv().await.unwrap();
        }
        // let the third failure be processed
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(manager.is_pending(id));
        let task = manager.task(id).unwrap();
        assert_eq!(task.attempts, 3);
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.next_retry.is_some());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_without_reconnect_is_removed() {
        let (manager, mut attempts) =
            manager(no_interfaces(), TerraGrafConfig::for_peer("local", "lab"));
        let (_lost_tx, lost_rx) = mpsc::unbounded_channel();
        manager.spawn_workers(lost_rx);

        let id = manager.add_task(task(false, Duration::ZERO)).unwrap();
        attempts.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!manager.is_pending(id));
        assert!(manager.task(id).is_none());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(attempts.try_recv().is_err());
        manager.shutdown().await;
    }

    #[test]
    fn test_invalid_port_rejected_at_construction() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (manager, _attempts) =
                manager(no_interfaces(), TerraGrafConfig::for_peer("local", "lab"));
            let bad = ConnectTaskConfig::new("10.0.0.9:0".parse().unwrap());
            assert!(matches!(manager.add_task(bad), Err(NetworkError::InvalidPort(0))));
            assert_eq!(manager.pending_count(), 0);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_requeued_or_removed() {
        let (manager, mut attempts) =
            manager(no_interfaces(), TerraGrafConfig::for_peer("local", "lab"));
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        manager.spawn_workers(lost_rx);

        let mut reconnecting = ConnectionTask::new(7, task(true, Duration::from_millis(50)));
        reconnecting.state = TaskState::Connected;
        let mut retired = ConnectionTask::new(8, task(true, Duration::from_millis(50)));
        retired.state = TaskState::Connected;
        manager.established.lock().insert(7, reconnecting);
        manager.established.lock().insert(8, retired);

        lost_tx
            .send(ConnectionLost {
                task: 7,
                peer: "remote".into(),
                retired: false,
            })
            .unwrap();
        lost_tx
            .send(ConnectionLost {
                task: 8,
                peer: "remote".into(),
                retired: true,
            })
            .unwrap();

        // the requeued task is dialed again after its delay
        assert_eq!(
            attempts.recv().await.unwrap(),
            "10.0.0.9:5000".parse::<SocketAddr>().unwrap()
        );
        assert!(manager.is_pending(7));
        assert!(manager.task(8).is_none());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_before_registration_requeues_task() {
        let (manager, mut attempts) =
            manager(no_interfaces(), TerraGrafConfig::for_peer("local", "lab"));
        let (_lost_tx, lost_rx) = mpsc::unbounded_channel();
        manager.spawn_workers(lost_rx);

        let mut connecting = ConnectionTask::new(5, task(true, Duration::from_millis(50)));
        connecting.state = TaskState::Connecting;
        connecting.attempts = 1;
        manager.pending.lock().insert(5, connecting);

        // the link dies before the attempt reports success
        manager.handle_lost(ConnectionLost {
            task: 5,
            peer: "remote".into(),
            retired: false,
        });
        manager.complete_attempt(5, Ok("remote".to_string()));

        assert!(manager.established.lock().is_empty());
        let task = manager.task(5).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.next_retry.is_some());
        assert!(task.peer.is_none());
        attempts.recv().await.unwrap();
        manager.shutdown().await;
    }

    /// Transport whose far end negotiates and then hangs up at once
    struct HangUpTransport {
        remote: Arc<SessionManager>,
        attempts: mpsc::UnboundedSender<SocketAddr>,
    }

    #[async_trait]
    impl Transport for HangUpTransport {
        async fn connect(&self, endpoint: SocketAddr, _timeout: Duration) -> Result<Connected> {
            let _ = self.attempts.send(endpoint);
            let (near, far) = tokio::io::duplex(64 * 1024);
            let remote = self.remote.clone();
            tokio::spawn(async move {
                if remote.establish(far, LinkMeta::inbound(endpoint)).await.is_ok() {
                    remote.close_all();
                }
            });
            Ok(Connected {
                stream: Box::new(near),
                remote_addr: endpoint,
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_closed_right_after_negotiation_is_retried() {
        let (sessions, outputs) = session_manager("local", "lab");
        let (remote, _remote_outputs) = session_manager("remote", "lab");
        let (attempts_tx, mut attempts) = mpsc::unbounded_channel();
        let manager = Arc::new(ConnectivityManager::new(
            TerraGrafConfig::for_peer("local", "lab"),
            sessions,
            Arc::new(HangUpTransport {
                remote,
                attempts: attempts_tx,
            }),
            Arc::new(no_interfaces()),
            NetworkMetrics::new(),
        ));
        manager.spawn_workers(outputs.lost);

        let id = manager.add_task(task(true, Duration::from_millis(10))).unwrap();
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), attempts.recv())
                .await
                .expect("task was not retried")
                .unwrap();
        }
        assert!(manager.task(id).is_some());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dial_uses_configured_timeout() {
        struct RecordingTransport {
            timeouts: mpsc::UnboundedSender<Duration>,
        }

        #[async_trait]
        impl Transport for RecordingTransport {
            async fn connect(&self, endpoint: SocketAddr, timeout: Duration) -> Result<Connected> {
                let _ = self.timeouts.send(timeout);
                Err(NetworkError::TimeoutError(format!("{} timed out", endpoint)))
            }
        }

        let mut config = TerraGrafConfig::for_peer("local", "lab");
        config.discovery.connect_timeout = Duration::from_millis(1234);
        let (sessions, _outputs) = session_manager("local", "lab");
        let (timeouts, mut recorded) = mpsc::unbounded_channel();
        let manager = ConnectivityManager::new(
            config,
            sessions,
            Arc::new(RecordingTransport { timeouts }),
            Arc::new(no_interfaces()),
            NetworkMetrics::new(),
        );

        assert!(manager.dial("10.0.0.9:5000".parse().unwrap()).await.is_err());
        assert_eq!(recorded.recv().await.unwrap(), Duration::from_millis(1234));
    }

    #[tokio::test]
    async fn test_automatic_listeners_follow_interfaces() {
        let interfaces = StaticInterfaces {
            addresses: vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()],
            probe_result: None,
        };
        let mut config = TerraGrafConfig::for_peer("local", "lab");
        config.listeners = ListenerConfig::Automatic { port: 0 };
        let (manager, _attempts) = manager(interfaces, config);

        let bound = manager.open_listeners();
        // IPv6 is disabled by default
        assert_eq!(bound.len(), 1);
        assert!(bound[0].ip().is_loopback());
        assert_ne!(bound[0].port(), 0);
        assert_eq!(manager.graph.local_descriptor().listeners, bound);
        manager.shutdown().await;
    }
}
