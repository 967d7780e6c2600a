//! Inbound dispatcher — per-session serial workers over the message bus.
//!
//! Every session key gets its own worker with a FIFO queue, so one
//! conversation's messages are routed strictly in arrival order while
//! different conversations run concurrently. Workers retire themselves
//! after an idle TTL; a backlogged session gets a throttled "queued"
//! acknowledgement so the user knows work is pending.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use swarmbot_core::bus::queue::{queued_ack, MessageBus};
use swarmbot_core::bus::types::InboundMessage;
use swarmbot_core::errors::KernelError;
use swarmbot_core::session::key::resolve_session_key;

/// Where dispatched messages go. Implemented by the agent manager.
#[async_trait]
pub trait InboundRouter: Send + Sync {
    /// Route one message to its agent. Called strictly in order per session.
    async fn route_inbound(&self, ctx: &CancellationToken, session_key: &str, msg: InboundMessage);
}

/// Dispatcher tuning.
#[derive(Clone, Debug)]
pub struct DispatchOptions {
    /// Minimum gap between queue acknowledgements per session.
    pub ack_interval: Duration,
    /// Idle time before a worker retires itself.
    pub idle_ttl: Duration,
    /// Optional cap on sessions routing concurrently.
    pub max_concurrent: Option<usize>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            ack_interval: Duration::from_secs(3),
            idle_ttl: Duration::from_secs(600),
            max_concurrent: None,
        }
    }
}

impl DispatchOptions {
    /// Build from the `inbound` config section.
    pub fn from_config(config: &swarmbot_core::config::schema::InboundConfig) -> Self {
        Self {
            ack_interval: config.queue_ack_interval(),
            idle_ttl: config.session_idle_ttl(),
            max_concurrent: config.max_concurrent,
        }
    }
}

// ─────────────────────────────────────────────
// Session worker
// ─────────────────────────────────────────────

/// Sentinel for "no acknowledgement sent yet".
const NEVER_ACKED: u64 = u64::MAX;

/// One conversation's serial work queue.
///
/// Hot fields are atomics; the queue has its own mutex. The run loop is a
/// spawned task owned by the dispatcher map. Timestamps are nanoseconds on
/// the worker's own monotonic clock (`born`), so a wall-clock step can
/// neither retire a live worker nor suppress or double-fire acks.
pub struct SessionWorker {
    session_key: String,
    queue: Mutex<VecDeque<InboundMessage>>,
    busy: AtomicBool,
    /// Last queue or routing activity, in ns since `born`.
    last_active_ns: AtomicU64,
    /// Last queue ack, in ns since `born`; `NEVER_ACKED` until the first.
    last_ack_ns: AtomicU64,
    born: Instant,
    wake: Notify,
}

impl SessionWorker {
    fn new(session_key: String) -> Arc<Self> {
        Arc::new(SessionWorker {
            session_key,
            queue: Mutex::new(VecDeque::new()),
            busy: AtomicBool::new(false),
            last_active_ns: AtomicU64::new(0),
            last_ack_ns: AtomicU64::new(NEVER_ACKED),
            born: Instant::now(),
            wake: Notify::new(),
        })
    }

    /// Append a message and wake the worker.
    ///
    /// Returns the number of items ahead of it (queued plus any message
    /// currently being routed).
    fn enqueue(&self, msg: InboundMessage) -> usize {
        let ahead = {
            let mut queue = self.queue.lock().unwrap();
            let ahead = queue.len() + usize::from(self.busy.load(Ordering::Acquire));
            queue.push_back(msg);
            ahead
        };
        self.touch();
        self.wake.notify_one();
        ahead
    }

    fn clock_ns(&self) -> u64 {
        self.born.elapsed().as_nanos() as u64
    }

    fn touch(&self) {
        self.last_active_ns.store(self.clock_ns(), Ordering::Release);
    }

    /// How long since the worker last saw queue or routing activity.
    fn idle_for(&self) -> Duration {
        let idle_ns = self
            .clock_ns()
            .saturating_sub(self.last_active_ns.load(Ordering::Acquire));
        Duration::from_nanos(idle_ns)
    }

    /// Ack throttle: at most one acknowledgement per interval.
    fn ack_permitted(&self, interval: Duration) -> bool {
        let now = self.clock_ns();
        let last = self.last_ack_ns.load(Ordering::Acquire);
        if last == NEVER_ACKED || now.saturating_sub(last) >= interval.as_nanos() as u64 {
            self.last_ack_ns.store(now, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }
}

// ─────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────

type WorkerMap = Arc<Mutex<HashMap<String, Arc<SessionWorker>>>>;

/// Fans inbound messages out to per-session workers.
pub struct InboundDispatcher {
    workers: WorkerMap,
    router: Arc<dyn InboundRouter>,
    bus: Arc<MessageBus>,
    options: DispatchOptions,
    limiter: Option<Arc<Semaphore>>,
    /// Graceful stop: workers halt at their next dequeue or wait point.
    shutdown: CancellationToken,
    /// Request-scoped cancellation, propagated into routing. Cancelling it
    /// aborts in-flight runtime calls too.
    request_ctx: CancellationToken,
    /// Self-handle for worker tasks.
    weak_self: std::sync::Weak<InboundDispatcher>,
}

impl InboundDispatcher {
    pub fn new(
        bus: Arc<MessageBus>,
        router: Arc<dyn InboundRouter>,
        options: DispatchOptions,
        request_ctx: CancellationToken,
    ) -> Arc<Self> {
        let limiter = options.max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1))));
        Arc::new_cyclic(|weak_self| InboundDispatcher {
            workers: Arc::new(Mutex::new(HashMap::new())),
            router,
            bus,
            options,
            limiter,
            shutdown: CancellationToken::new(),
            request_ctx,
            weak_self: weak_self.clone(),
        })
    }

    /// Consume the inbound queue until the bus closes or the dispatcher
    /// stops, dispatching every message.
    pub async fn run(&self) {
        info!("inbound dispatcher started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.bus.consume_inbound(&self.request_ctx) => match msg {
                    Ok(msg) => {
                        self.dispatch(msg).await;
                    }
                    Err(KernelError::BusClosed) => {
                        info!("inbound bus closed, dispatcher exiting");
                        break;
                    }
                    Err(KernelError::Cancelled) => break,
                    Err(e) => {
                        error!(error = %e, "inbound consume failed");
                        break;
                    }
                },
            }
        }
    }

    /// Route one message to its session worker, creating the worker if
    /// needed, and emit a queue acknowledgement when appropriate.
    pub async fn dispatch(&self, msg: InboundMessage) -> String {
        let session_key =
            resolve_session_key(&msg.channel, &msg.account_id, &msg.chat_id, true);
        let channel = msg.channel.clone();
        let chat_id = msg.chat_id.clone();
        let user_originated = msg.is_user_originated() && msg.channel != "cli";

        // Get-or-create and enqueue under the map lock, so a retiring
        // worker can never swallow the message.
        let (worker, ahead) = {
            let mut workers = self.workers.lock().unwrap();
            let worker = workers
                .entry(session_key.clone())
                .or_insert_with(|| {
                    debug!(session_key = %session_key, "starting session worker");
                    let worker = SessionWorker::new(session_key.clone());
                    self.spawn_worker_loop(worker.clone());
                    worker
                })
                .clone();
            let ahead = worker.enqueue(msg);
            (worker, ahead)
        };

        if ahead > 0 && user_originated && worker.ack_permitted(self.options.ack_interval) {
            let ack = queued_ack(&channel, &chat_id, ahead);
            if let Err(e) = self.bus.publish_outbound(&self.request_ctx, ack).await {
                warn!(session_key = %session_key, error = %e, "queue ack publish failed");
            }
        }

        session_key
    }

    /// Number of live session workers.
    pub fn active_sessions(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Stop all workers at their next dequeue or wait point. The message
    /// currently being routed (if any) is not interrupted.
    pub fn shutdown(&self) {
        info!("inbound dispatcher stopping");
        self.shutdown.cancel();
    }

    fn spawn_worker_loop(&self, worker: Arc<SessionWorker>) {
        let Some(dispatcher) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            dispatcher.worker_loop(worker).await;
        });
    }

    async fn worker_loop(&self, worker: Arc<SessionWorker>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let next = worker.queue.lock().unwrap().pop_front();
            match next {
                Some(msg) => {
                    worker.busy.store(true, Ordering::Release);
                    worker.touch();

                    let permit = match &self.limiter {
                        Some(semaphore) => match semaphore.clone().acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                        None => None,
                    };

                    self.router
                        .route_inbound(&self.request_ctx, worker.session_key(), msg)
                        .await;

                    drop(permit);
                    worker.busy.store(false, Ordering::Release);
                    worker.touch();
                }
                None => {
                    // Wait out whatever remains of the TTL since the last
                    // activity; retirement requires a full idle TTL.
                    let wait = self.options.idle_ttl.saturating_sub(worker.idle_for());
                    tokio::select! {
                        _ = worker.wake.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {
                            if worker.idle_for() >= self.options.idle_ttl
                                && self.try_retire(&worker)
                            {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Remove an idle worker from the map.
    ///
    /// Guarded by pointer equality so a replacement worker under the same
    /// key is never clobbered, and re-checked against the queue under the
    /// map lock so a message enqueued at the last instant survives.
    fn try_retire(&self, worker: &Arc<SessionWorker>) -> bool {
        let mut workers = self.workers.lock().unwrap();
        if !worker.queue.lock().unwrap().is_empty() {
            return false;
        }
        match workers.get(worker.session_key()) {
            Some(current) if Arc::ptr_eq(current, worker) => {
                workers.remove(worker.session_key());
                debug!(session_key = %worker.session_key(), "session worker retired");
                true
            }
            _ => false,
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Records routed messages and can stall to simulate slow turns.
    struct RecordingRouter {
        routed: Mutex<Vec<(String, String)>>,
        delay: Duration,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl RecordingRouter {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(RecordingRouter {
                routed: Mutex::new(Vec::new()),
                delay,
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn routed(&self) -> Vec<(String, String)> {
            self.routed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InboundRouter for RecordingRouter {
        async fn route_inbound(
            &self,
            _ctx: &CancellationToken,
            session_key: &str,
            msg: InboundMessage,
        ) {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.routed
                .lock()
                .unwrap()
                .push((session_key.to_string(), msg.content));
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn make_dispatcher(
        router: Arc<RecordingRouter>,
        options: DispatchOptions,
    ) -> (Arc<InboundDispatcher>, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new(32));
        let dispatcher = InboundDispatcher::new(
            bus.clone(),
            router,
            options,
            CancellationToken::new(),
        );
        (dispatcher, bus)
    }

    fn msg(chat: &str, sender: &str, content: &str) -> InboundMessage {
        InboundMessage::new("telegram", "bot1", chat, sender, content)
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) {
        let start = tokio::time::Instant::now();
        while !check() {
            assert!(start.elapsed() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_options_from_config() {
        let mut config = swarmbot_core::config::schema::InboundConfig::default();
        config.queue_ack_interval_secs = 7;
        config.max_concurrent = Some(3);
        let options = DispatchOptions::from_config(&config);
        assert_eq!(options.ack_interval, Duration::from_secs(7));
        assert_eq!(options.idle_ttl, Duration::from_secs(600));
        assert_eq!(options.max_concurrent, Some(3));
    }

    #[tokio::test]
    async fn test_per_session_fifo_order() {
        let router = RecordingRouter::new(Duration::from_millis(10));
        let (dispatcher, _bus) = make_dispatcher(router.clone(), DispatchOptions::default());

        for i in 0..5 {
            dispatcher.dispatch(msg("c1", "u1", &format!("m{i}"))).await;
        }

        wait_until(Duration::from_secs(2), || router.routed().len() == 5).await;
        let contents: Vec<String> = router.routed().into_iter().map(|(_, c)| c).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_sessions_run_concurrently() {
        let router = RecordingRouter::new(Duration::from_millis(50));
        let (dispatcher, _bus) = make_dispatcher(router.clone(), DispatchOptions::default());

        dispatcher.dispatch(msg("c1", "u1", "a")).await;
        dispatcher.dispatch(msg("c2", "u2", "b")).await;

        wait_until(Duration::from_secs(2), || router.routed().len() == 2).await;
        assert!(router.max_concurrent.load(Ordering::SeqCst) >= 2);
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_concurrency_cap_respected() {
        let router = RecordingRouter::new(Duration::from_millis(30));
        let options = DispatchOptions {
            max_concurrent: Some(1),
            ..DispatchOptions::default()
        };
        let (dispatcher, _bus) = make_dispatcher(router.clone(), options);

        for i in 0..4 {
            dispatcher
                .dispatch(msg(&format!("c{i}"), "u", "work"))
                .await;
        }

        wait_until(Duration::from_secs(3), || router.routed().len() == 4).await;
        assert_eq!(router.max_concurrent.load(Ordering::SeqCst), 1);
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_queue_ack_emitted_for_backlogged_user_session() {
        let router = RecordingRouter::new(Duration::from_millis(100));
        let (dispatcher, bus) = make_dispatcher(router.clone(), DispatchOptions::default());
        let mut sub = bus.subscribe_outbound();

        dispatcher.dispatch(msg("c1", "u1", "first")).await;
        // Give the worker a moment to start routing the first message.
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.dispatch(msg("c1", "u1", "second")).await;

        let ack = sub.recv().await.unwrap();
        assert_eq!(ack.metadata["kind"], "queued_ack");
        assert_eq!(ack.chat_id, "c1");
        assert!(ack.content.contains("one message ahead"));
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_queue_ack_throttled() {
        let router = RecordingRouter::new(Duration::from_millis(200));
        let options = DispatchOptions {
            ack_interval: Duration::from_secs(30),
            ..DispatchOptions::default()
        };
        let (dispatcher, bus) = make_dispatcher(router.clone(), options);
        let ctx = CancellationToken::new();

        dispatcher.dispatch(msg("c1", "u1", "first")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.dispatch(msg("c1", "u1", "second")).await;
        dispatcher.dispatch(msg("c1", "u1", "third")).await;

        // Exactly one ack within the throttle window.
        let first = bus.consume_outbound(&ctx).await.unwrap();
        assert_eq!(first.metadata["kind"], "queued_ack");

        let quiet = CancellationToken::new();
        let quiet_clone = quiet.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            quiet_clone.cancel();
        });
        let second = bus.consume_outbound(&quiet).await;
        assert!(matches!(second, Err(KernelError::Cancelled)));
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_no_ack_for_cli_or_synthetic_senders() {
        let router = RecordingRouter::new(Duration::from_millis(100));
        let (dispatcher, bus) = make_dispatcher(router.clone(), DispatchOptions::default());

        // CLI channel: suppressed.
        dispatcher
            .dispatch(InboundMessage::new("cli", "local", "c1", "user", "first"))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher
            .dispatch(InboundMessage::new("cli", "local", "c1", "user", "second"))
            .await;

        // Synthetic sender: suppressed.
        dispatcher.dispatch(msg("c2", "", "first")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.dispatch(msg("c2", "", "second")).await;

        let quiet = CancellationToken::new();
        let quiet_clone = quiet.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            quiet_clone.cancel();
        });
        assert!(matches!(
            bus.consume_outbound(&quiet).await,
            Err(KernelError::Cancelled)
        ));
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_idle_worker_retires_once() {
        let router = RecordingRouter::new(Duration::ZERO);
        let options = DispatchOptions {
            idle_ttl: Duration::from_millis(50),
            ..DispatchOptions::default()
        };
        let (dispatcher, _bus) = make_dispatcher(router.clone(), options);

        dispatcher.dispatch(msg("c1", "u1", "hello")).await;
        wait_until(Duration::from_secs(1), || router.routed().len() == 1).await;
        assert_eq!(dispatcher.active_sessions(), 1);

        wait_until(Duration::from_secs(2), || dispatcher.active_sessions() == 0).await;

        // A new message after retirement spins up a fresh worker.
        dispatcher.dispatch(msg("c1", "u1", "again")).await;
        wait_until(Duration::from_secs(1), || router.routed().len() == 2).await;
        assert_eq!(dispatcher.active_sessions(), 1);
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_fresh_session_key_for_default_chat() {
        let router = RecordingRouter::new(Duration::ZERO);
        let (dispatcher, _bus) = make_dispatcher(router.clone(), DispatchOptions::default());

        let k1 = dispatcher.dispatch(msg("default", "u1", "one")).await;
        let k2 = dispatcher.dispatch(msg("default", "u1", "two")).await;
        assert_ne!(k1, k2);
        assert!(k1.starts_with("telegram:bot1:"));
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_run_pumps_bus_until_close() {
        let router = RecordingRouter::new(Duration::ZERO);
        let (dispatcher, bus) = make_dispatcher(router.clone(), DispatchOptions::default());
        let ctx = CancellationToken::new();

        let pump = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run().await })
        };

        bus.publish_inbound(&ctx, msg("c1", "u1", "via bus"))
            .await
            .unwrap();
        wait_until(Duration::from_secs(2), || router.routed().len() == 1).await;

        bus.close();
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .expect("pump must exit after bus close")
            .unwrap();
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers_without_interrupting_routing() {
        let router = RecordingRouter::new(Duration::from_millis(100));
        let (dispatcher, _bus) = make_dispatcher(router.clone(), DispatchOptions::default());

        dispatcher.dispatch(msg("c1", "u1", "slow")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.shutdown();

        // The in-flight message still completes.
        wait_until(Duration::from_secs(2), || router.routed().len() == 1).await;
    }
}
