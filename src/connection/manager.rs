//! Connection manager with a serialized call path, background health probing
//! and automatic reconnection

use super::state::{ConnectionState, LinkEvent, LinkStateMachine, LinkStatus, TransitionResult};
use crate::transport::{Dialer, RpcConnection};
use prost::Message;
use rpc_keeper_shared::{defaults, methods};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error returned by [`ConnectionManager::call`]: the connection's own error, untranslated
pub type CallError<D> = <<D as Dialer>::Connection as RpcConnection>::Error;

/// Errors surfaced while constructing a manager
#[derive(Error, Debug)]
pub enum ManagerError<E: std::error::Error + 'static> {
    #[error("can't make rpc connection to {target}: {source}")]
    InitialDial {
        target: String,
        #[source]
        source: E,
    },
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Address dialed at construction and on every reconnect
    pub target: String,
    /// Remote method called with an empty request to probe liveness
    pub healthcheck_method: String,
    /// Wait between health probes
    pub probe_interval: Duration,
    /// Wait between failed redial attempts
    pub reconnect_delay: Duration,
}

impl ConnectionConfig {
    pub fn new(target: impl Into<String>, healthcheck_method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            healthcheck_method: healthcheck_method.into(),
            probe_interval: Duration::from_secs(defaults::PROBE_INTERVAL_SECS),
            reconnect_delay: Duration::from_secs(defaults::RECONNECT_DELAY_SECS),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(defaults::ADDRESS, methods::HEALTH_PING)
    }
}

/// State shared between callers and the liveness task
struct Shared<D: Dialer> {
    dialer: D,
    config: ConnectionConfig,
    /// The one current handle; every use and every replacement holds this lock
    connection: Mutex<D::Connection>,
    status: watch::Sender<LinkStatus>,
}

impl<D: Dialer> Shared<D> {
    fn apply(&self, fsm: &mut LinkStateMachine, event: LinkEvent) {
        match fsm.process_event(event) {
            TransitionResult::Success(state) => {
                self.status.send_replace(fsm.status());
                debug!("rpc connection to {} is {}", self.config.target, state);
            }
            TransitionResult::Invalid { from, event } => {
                warn!("Ignoring {:?} while {}", event, from);
            }
        }
    }
}

/// Owns one RPC connection and keeps it alive
///
/// All calls and health probes go through a single lock, so they never
/// overlap on the connection. When a probe fails the connection is replaced
/// while the lock is held: callers wait out the outage instead of seeing a
/// connection known to be dead.
pub struct ConnectionManager<D: Dialer> {
    shared: Arc<Shared<D>>,
    shutdown: CancellationToken,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Dialer> ConnectionManager<D> {
    /// Dial the target and start the liveness task
    ///
    /// Fails if the first dial fails; there is no retry at construction.
    pub async fn connect(dialer: D, config: ConnectionConfig) -> Result<Self, ManagerError<D::Error>> {
        let connection = dialer
            .dial(&config.target)
            .await
            .map_err(|source| ManagerError::InitialDial {
                target: config.target.clone(),
                source,
            })?;

        info!(
            "Connected to {} via {} (healthcheck: {}, every {:?})",
            config.target,
            dialer.name(),
            config.healthcheck_method,
            config.probe_interval
        );

        let (status, _) = watch::channel(LinkStatus::default());
        let shared = Arc::new(Shared {
            dialer,
            config,
            connection: Mutex::new(connection),
            status,
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(liveness_loop(shared.clone(), shutdown.clone()));

        Ok(Self {
            shared,
            shutdown,
            liveness: Mutex::new(Some(task)),
        })
    }

    /// Invoke `method` on the current connection
    ///
    /// Waits for any in-flight call, probe, or reconnection to finish first.
    /// The transport's result is returned as is: failed calls are not retried
    /// and do not trigger a reconnect.
    pub async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, CallError<D>>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let mut connection = self.shared.connection.lock().await;
        connection.call(method, request).await
    }

    pub fn target(&self) -> &str {
        &self.shared.config.target
    }

    pub fn healthcheck_method(&self) -> &str {
        &self.shared.config.healthcheck_method
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Name of the transport in use
    pub fn transport(&self) -> &'static str {
        self.shared.dialer.name()
    }

    pub fn status(&self) -> LinkStatus {
        *self.shared.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    /// Watch state changes and completed reconnections
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.subscribe()
    }

    /// Stop the liveness task and wait for it to exit
    ///
    /// A reconnection in progress is abandoned and the old connection stays
    /// in place. Calls keep working against whatever connection is current.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        if let Some(task) = self.liveness.lock().await.take() {
            if let Err(e) = task.await {
                error!("Liveness task for {} failed: {}", self.shared.config.target, e);
            }
        }
    }
}

impl<D: Dialer> Drop for ConnectionManager<D> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Probe the connection every interval and replace it when the probe fails
async fn liveness_loop<D: Dialer>(shared: Arc<Shared<D>>, shutdown: CancellationToken) {
    let mut fsm = LinkStateMachine::new();
    let target = shared.config.target.as_str();

    loop {
        // The first probe waits a full interval: construction just proved the link
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(shared.config.probe_interval) => {}
        }

        let mut connection = tokio::select! {
            _ = shutdown.cancelled() => break,
            guard = shared.connection.lock() => guard,
        };

        debug!("rpc healthcheck called");
        let probe = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connection.call::<(), ()>(&shared.config.healthcheck_method, &()) => result,
        };

        if let Err(e) = probe {
            warn!("can't do rpc healthcheck call to {}: {}", target, e);
            shared.apply(&mut fsm, LinkEvent::ProbeFailed);

            // Callers stay blocked on the lock until a fresh handle is in place
            match reconnect(&shared, &shutdown).await {
                Some(fresh) => {
                    *connection = fresh;
                    shared.apply(&mut fsm, LinkEvent::Redialed);
                }
                None => break,
            }
        }
    }

    info!("Liveness loop for {} stopped", target);
}

/// Redial until it succeeds; `None` only when shutdown was requested
async fn reconnect<D: Dialer>(
    shared: &Shared<D>,
    shutdown: &CancellationToken,
) -> Option<D::Connection> {
    let target = shared.config.target.as_str();
    let mut attempt: u32 = 1;

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => return None,
            result = shared.dialer.dial(target) => result,
        };

        match result {
            Ok(connection) => {
                debug!("rpc connection to {} restored after {} attempt(s)", target, attempt);
                return Some(connection);
            }
            // A single blip stays at warn; only a persisting outage is an error
            Err(e) if attempt == 1 => {
                warn!("can't restore rpc connection to {} (attempt {}): {}", target, attempt, e);
            }
            Err(e) => {
                error!("can't restore rpc connection to {} (attempt {}): {}", target, attempt, e);
            }
        }

        attempt = attempt.saturating_add(1);

        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = sleep(shared.config.reconnect_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::future::join_all;
    use rpc_keeper_shared::{EchoReply, EchoRequest};
    use std::fmt;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use tokio::time::{timeout, Instant};
    use tracing::field::{Field, Visit};
    use tracing::Level;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("connection refused")]
        Refused,
        #[error("broken pipe")]
        Broken,
    }

    /// Instrumented in-memory network
    ///
    /// Every successful dial gets the next generation number. Calls echo the
    /// request bytes back as the reply.
    #[derive(Default)]
    struct FakeNet {
        generation: AtomicU64,
        /// Connections with a generation at or below this are dead
        dead_up_to: AtomicU64,
        refuse_next: AtomicU32,
        dials: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        latency: Duration,
        calls: std::sync::Mutex<Vec<(String, u64)>>,
    }

    impl FakeNet {
        fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        fn kill_current(&self) {
            self.dead_up_to
                .store(self.generation.load(Ordering::SeqCst), Ordering::SeqCst);
        }

        fn refuse_dials(&self, count: u32) {
            self.refuse_next.store(count, Ordering::SeqCst);
        }

        fn dials(&self) -> u32 {
            self.dials.load(Ordering::SeqCst)
        }

        fn calls_to(&self, method: &str) -> Vec<u64> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == method)
                .map(|(_, generation)| *generation)
                .collect()
        }
    }

    #[derive(Clone)]
    struct FakeDialer(Arc<FakeNet>);

    struct FakeConnection {
        generation: u64,
        net: Arc<FakeNet>,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        type Connection = FakeConnection;
        type Error = FakeError;

        async fn dial(&self, _address: &str) -> Result<FakeConnection, FakeError> {
            self.0.dials.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .0
                .refuse_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(FakeError::Refused);
            }

            Ok(FakeConnection {
                generation: self.0.generation.fetch_add(1, Ordering::SeqCst) + 1,
                net: self.0.clone(),
            })
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    #[async_trait]
    impl RpcConnection for FakeConnection {
        type Error = FakeError;

        async fn call<Req, Resp>(&mut self, method: &str, request: &Req) -> Result<Resp, FakeError>
        where
            Req: Message,
            Resp: Message + Default,
        {
            let net = &self.net;
            let now = net.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            net.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !net.latency.is_zero() {
                sleep(net.latency).await;
            }
            net.in_flight.fetch_sub(1, Ordering::SeqCst);

            net.calls
                .lock()
                .unwrap()
                .push((method.to_string(), self.generation));

            if self.generation <= net.dead_up_to.load(Ordering::SeqCst) {
                return Err(FakeError::Broken);
            }
            Ok(Resp::decode(request.encode_to_vec().as_slice()).expect("echo layout mismatch"))
        }
    }

    /// Records the level and message of every event
    #[derive(Clone, Default)]
    struct LogCapture(Arc<std::sync::Mutex<Vec<(Level, String)>>>);

    impl LogCapture {
        fn levels_of(&self, needle: &str) -> Vec<Level> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, message)| message.contains(needle))
                .map(|(level, _)| *level)
                .collect()
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for LogCapture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = MessageVisitor::default();
            event.record(&mut visitor);
            self.0
                .lock()
                .unwrap()
                .push((*event.metadata().level(), visitor.0));
        }
    }

    #[derive(Default)]
    struct MessageVisitor(String);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{:?}", value);
            }
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::new("svc:9000", "Ping")
    }

    async fn connect(net: &Arc<FakeNet>, config: ConnectionConfig) -> ConnectionManager<FakeDialer> {
        match ConnectionManager::connect(FakeDialer(net.clone()), config).await {
            Ok(manager) => manager,
            Err(e) => panic!("connect failed: {e}"),
        }
    }

    async fn echo(manager: &ConnectionManager<FakeDialer>, text: &str) -> Result<String, FakeError> {
        let reply: EchoReply = manager.call("Echo", &EchoRequest::new(text)).await?;
        Ok(reply.text)
    }

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.target, "127.0.0.1:7070");
        assert_eq!(config.healthcheck_method, "Health.Ping");
        assert_eq!(config.probe_interval, Duration::from_secs(120));
        assert_eq!(config.reconnect_delay, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_passes_reply_through() {
        let net = Arc::new(FakeNet::default());
        let manager = connect(&net, test_config()).await;

        assert_eq!(manager.target(), "svc:9000");
        assert_eq!(manager.healthcheck_method(), "Ping");
        assert_eq!(manager.transport(), "fake");
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.config().reconnect_delay, ConnectionConfig::default().reconnect_delay);

        assert_eq!(echo(&manager, "hi").await.expect("call failed"), "hi");
        assert_eq!(net.calls_to("Echo"), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_dial_failure_fails_construction() {
        let net = Arc::new(FakeNet::default());
        net.refuse_dials(1);

        let result = ConnectionManager::connect(FakeDialer(net.clone()), test_config()).await;
        let Err(ManagerError::InitialDial { target, source }) = result else {
            panic!("construction should fail when the first dial fails");
        };
        assert_eq!(target, "svc:9000");
        assert!(matches!(source, FakeError::Refused));

        // No background redials happen for a manager that was never built
        sleep(Duration::from_secs(600)).await;
        assert_eq!(net.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_are_serialized() {
        let net = Arc::new(FakeNet::with_latency(Duration::from_millis(10)));
        let config = ConnectionConfig {
            probe_interval: Duration::from_millis(25),
            ..test_config()
        };
        let manager = Arc::new(connect(&net, config).await);

        // Staggered arrivals so probes queue up between calls
        let calls = (0..16u64).map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(i * 5)).await;
                echo(&manager, &format!("call-{i}")).await
            })
        });
        let results = join_all(calls).await;

        for (i, result) in results.into_iter().enumerate() {
            let reply = result.expect("task panicked").expect("call failed");
            assert_eq!(reply, format!("call-{i}"));
        }
        assert!(!net.calls_to("Ping").is_empty(), "probes should interleave with calls");
        assert_eq!(net.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_redials_before_next_probe() {
        let net = Arc::new(FakeNet::default());
        let manager = connect(&net, test_config()).await;
        let mut status = manager.subscribe();
        let start = Instant::now();

        net.kill_current();
        status
            .wait_for(|s| s.reconnects == 1)
            .await
            .expect("status channel closed");

        // Probe at 120s failed, redial succeeded straight away
        assert_eq!(net.dials(), 2);
        assert!(start.elapsed() < Duration::from_secs(240));
        assert_eq!(net.calls_to("Ping"), vec![1]);
        assert_eq!(manager.state(), ConnectionState::Connected);

        assert_eq!(echo(&manager, "after").await.expect("call failed"), "after");
        assert_eq!(net.calls_to("Echo"), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_errors_surface_without_redial() {
        let net = Arc::new(FakeNet::default());
        let manager = connect(&net, test_config()).await;

        net.kill_current();
        let err = echo(&manager, "hi").await.expect_err("dead connection should fail");
        assert!(matches!(err, FakeError::Broken));

        // Only the liveness task repairs the connection
        assert_eq!(net.dials(), 1);
        assert_eq!(net.calls_to("Echo"), vec![1]);
        assert_eq!(manager.status(), LinkStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_scenario() {
        let logs = LogCapture::default();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(logs.clone()));

        let net = Arc::new(FakeNet::default());
        let manager = Arc::new(connect(&net, test_config()).await);
        let mut status = manager.subscribe();

        assert_eq!(echo(&manager, "hi").await.expect("call failed"), "hi");

        // Next probe fails; the first two redials are refused, the third succeeds
        net.refuse_dials(2);
        net.kill_current();
        status
            .wait_for(|s| s.state == ConnectionState::Reconnecting)
            .await
            .expect("status channel closed");
        let outage_start = Instant::now();

        let caller = manager.clone();
        let mut pending = tokio::spawn(async move { echo(&caller, "during").await });

        // Still blocked a while into the outage
        assert!(timeout(Duration::from_secs(30), &mut pending).await.is_err());

        let reply = pending.await.expect("task panicked").expect("call failed");
        assert_eq!(reply, "during");
        assert!(outage_start.elapsed() >= Duration::from_secs(120));
        assert_eq!(net.calls_to("Echo"), vec![1, 2]);
        assert_eq!(net.dials(), 4);
        assert_eq!(
            manager.status(),
            LinkStatus {
                state: ConnectionState::Connected,
                reconnects: 1,
            }
        );

        assert_eq!(logs.levels_of("rpc healthcheck called"), vec![Level::DEBUG]);
        assert_eq!(logs.levels_of("can't do rpc healthcheck call"), vec![Level::WARN]);
        assert_eq!(
            logs.levels_of("can't restore rpc connection"),
            vec![Level::WARN, Level::ERROR]
        );
        assert_eq!(logs.levels_of("restored after 3 attempt(s)"), vec![Level::DEBUG]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_reconnection() {
        let net = Arc::new(FakeNet::default());
        let manager = connect(&net, test_config()).await;
        let mut status = manager.subscribe();

        net.refuse_dials(u32::MAX);
        net.kill_current();
        status
            .wait_for(|s| s.state == ConnectionState::Reconnecting)
            .await
            .expect("status channel closed");

        timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .expect("shutdown should not wait for the outage to end");
        manager.shutdown().await;

        let dials = net.dials();
        sleep(Duration::from_secs(600)).await;
        assert_eq!(net.dials(), dials);

        // The old connection is still the current one
        assert!(matches!(echo(&manager, "hi").await, Err(FakeError::Broken)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_liveness_task() {
        let net = Arc::new(FakeNet::default());
        let manager = connect(&net, test_config()).await;
        assert!(Arc::strong_count(&net) > 1);

        drop(manager);
        sleep(Duration::from_millis(1)).await;

        // Dialer and connection went away with the task
        assert_eq!(Arc::strong_count(&net), 1);
    }
}
