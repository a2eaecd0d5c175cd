// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event-loop drivers for the delivery components.
//!
//! The protocol state machines are single-threaded by contract: every input
//! event runs to completion, state is private, no internal locking. A driver
//! realizes that contract by owning one state machine on a dedicated thread
//! that pulls from a single mailbox channel; the periodic work (the
//! first-message resend tick, registry polling) fires from the same loop via
//! channel receive deadlines, so it is serialized with everything else.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      caller threads (sync)                   |
//! |   ProducerControllerHandle / WorkPullingHandle  (clonable)   |
//! +-----------------------------+--------------------------------+
//!                               | mailbox (crossbeam channel)
//!                               v
//! +--------------------------------------------------------------+
//! |  driver thread: recv_timeout(next deadline) -> on_* handler  |
//! |  timeout -> on_resend_first_tick() / registry poll           |
//! +--------------------------------------------------------------+
//! ```
//!
//! A fatal protocol error from a handler terminates the loop; the handles'
//! `is_running()` flips to false and the user producer is responsible for
//! restarting (re-bootstrapping via `Start`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::config::{DeliveryConfig, WorkPullingConfig};
use crate::delivery::{
    ConfirmationReply, ConsumerEndpoint, ConsumerOp, ControllerRef, DurableQueue,
    ProducerController, ProducerHandle, SeqNr,
};
use crate::work_pulling::{
    ServiceKey, ServiceRegistry, WorkPullingRouter, WorkerEndpoint, WorkerId, WorkerStats,
};
use crate::Result;

// ============================================================================
// PRODUCER CONTROLLER DRIVER
// ============================================================================

/// Mailbox commands of a driven [`ProducerController`].
pub enum ProducerCommand<A> {
    Start(Box<dyn ProducerHandle>),
    RegisterConsumer(Box<dyn ConsumerEndpoint<A>>),
    Send(A),
    SendWithConfirmation(A, ConfirmationReply),
    Consumer(ConsumerOp),
    Stop,
}

/// Clonable handle to a driven [`ProducerController`].
pub struct ProducerControllerHandle<A> {
    tx: Sender<ProducerCommand<A>>,
    running: Arc<AtomicBool>,
    ask_timeout: Duration,
}

impl<A> Clone for ProducerControllerHandle<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            running: Arc::clone(&self.running),
            ask_timeout: self.ask_timeout,
        }
    }
}

impl<A: Send + 'static> ProducerControllerHandle<A> {
    /// Whether the driver loop is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind or rebind the producer reply address.
    pub fn start(&self, producer: Box<dyn ProducerHandle>) {
        let _ = self.tx.send(ProducerCommand::Start(producer));
    }

    /// Bind or rebind the outbound consumer endpoint.
    pub fn register_consumer(&self, consumer: Box<dyn ConsumerEndpoint<A>>) {
        let _ = self.tx.send(ProducerCommand::RegisterConsumer(consumer));
    }

    /// Submit one message (requires an outstanding `RequestNext`).
    pub fn send(&self, payload: A) {
        let _ = self.tx.send(ProducerCommand::Send(payload));
    }

    /// Submit one message and obtain a channel that yields its sequence
    /// number once confirmed.
    pub fn send_with_confirmation(&self, payload: A) -> Receiver<SeqNr> {
        let (reply_tx, reply_rx) = unbounded();
        let _ = self
            .tx
            .send(ProducerCommand::SendWithConfirmation(payload, reply_tx));
        reply_rx
    }

    /// Submit one message and block until it is confirmed.
    ///
    /// Returns `None` if the confirmation did not arrive within the
    /// configured `unexpected_ask_timeout` (safety net, not a protocol
    /// timeout: retransmission keeps running regardless).
    pub fn ask(&self, payload: A) -> Option<SeqNr> {
        let reply_rx = self.send_with_confirmation(payload);
        match reply_rx.recv_timeout(self.ask_timeout) {
            Ok(seq_nr) => Some(seq_nr),
            Err(_) => {
                log::warn!("[producer-controller] ask timed out awaiting confirmation");
                None
            }
        }
    }

    /// Reply address of this controller, for stamping into transport-level
    /// registrations on the consumer side.
    #[must_use]
    pub fn controller_ref(&self) -> ControllerRef {
        let tx = self.tx.clone();
        ControllerRef::new(move |op| {
            let _ = tx.send(ProducerCommand::Consumer(op));
        })
    }

    /// Request loop shutdown (discarding in-flight buffered state).
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.tx.send(ProducerCommand::Stop);
    }
}

/// Owns the driver thread of one [`ProducerController`].
///
/// Dropping the driver stops the loop and joins the thread.
pub struct ProducerControllerDriver<A> {
    handle: ProducerControllerHandle<A>,
    thread: Option<JoinHandle<()>>,
}

impl<A: Clone + Send + 'static> ProducerControllerDriver<A> {
    /// Spawn a fresh, non-durable controller.
    #[must_use]
    pub fn spawn(producer_id: impl Into<String>, config: DeliveryConfig) -> Self {
        let producer_id = producer_id.into();
        let (tx, rx) = unbounded();
        let handle = Self::make_handle(&tx, &config);
        let controller = ProducerController::new(
            producer_id,
            config,
            Self::reply_ref(&tx),
        );
        Self::spawn_loop(handle, controller, rx)
    }

    /// Spawn a durable controller, recovering persisted state first.
    pub fn spawn_durable(
        producer_id: impl Into<String>,
        config: DeliveryConfig,
        durable: Box<dyn DurableQueue<A>>,
    ) -> Result<Self> {
        let producer_id = producer_id.into();
        let (tx, rx) = unbounded();
        let handle = Self::make_handle(&tx, &config);
        let controller =
            ProducerController::recover(producer_id, config, Self::reply_ref(&tx), durable)?;
        Ok(Self::spawn_loop(handle, controller, rx))
    }

    /// Clonable handle to the driven controller.
    #[must_use]
    pub fn handle(&self) -> ProducerControllerHandle<A> {
        self.handle.clone()
    }

    fn make_handle(
        tx: &Sender<ProducerCommand<A>>,
        config: &DeliveryConfig,
    ) -> ProducerControllerHandle<A> {
        ProducerControllerHandle {
            tx: tx.clone(),
            running: Arc::new(AtomicBool::new(true)),
            ask_timeout: config.unexpected_ask_timeout(),
        }
    }

    fn reply_ref(tx: &Sender<ProducerCommand<A>>) -> ControllerRef {
        let tx = tx.clone();
        ControllerRef::new(move |op| {
            let _ = tx.send(ProducerCommand::Consumer(op));
        })
    }

    fn spawn_loop(
        handle: ProducerControllerHandle<A>,
        controller: ProducerController<A>,
        rx: Receiver<ProducerCommand<A>>,
    ) -> Self {
        let running = Arc::clone(&handle.running);
        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let thread = thread::Builder::new()
            .name("convoy-producer".to_string())
            .spawn(move || run_producer_loop(controller, rx, running))
            .expect("failed to spawn producer controller thread");

        Self {
            handle,
            thread: Some(thread),
        }
    }
}

impl<A> Drop for ProducerControllerDriver<A> {
    fn drop(&mut self) {
        self.handle.running.store(false, Ordering::Release);
        let _ = self.handle.tx.send(ProducerCommand::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_producer_loop<A: Clone + Send>(
    mut controller: ProducerController<A>,
    rx: Receiver<ProducerCommand<A>>,
    running: Arc<AtomicBool>,
) {
    let tick_interval = controller.config().resend_first_interval();
    let mut next_tick = Instant::now() + tick_interval;

    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= next_tick {
            controller.on_resend_first_tick();
            next_tick = now + tick_interval;
            continue;
        }

        match rx.recv_timeout(next_tick - now) {
            Ok(ProducerCommand::Stop) => break,
            Ok(command) => {
                let outcome = match command {
                    ProducerCommand::Start(producer) => {
                        controller.on_start(producer);
                        Ok(())
                    }
                    ProducerCommand::RegisterConsumer(consumer) => {
                        controller.on_register_consumer(consumer);
                        Ok(())
                    }
                    ProducerCommand::Send(payload) => controller.on_msg(payload),
                    ProducerCommand::SendWithConfirmation(payload, reply_to) => {
                        controller.on_msg_with_confirmation(payload, reply_to)
                    }
                    ProducerCommand::Consumer(ConsumerOp::Request(request)) => {
                        controller.on_request(request)
                    }
                    ProducerCommand::Consumer(ConsumerOp::Ack(ack)) => controller.on_ack(ack),
                    ProducerCommand::Consumer(ConsumerOp::Resend(resend)) => {
                        controller.on_resend(resend)
                    }
                    ProducerCommand::Stop => unreachable!("handled above"),
                };
                if let Err(err) = outcome {
                    log::error!(
                        "[producer-controller] {} terminating on protocol violation: {}",
                        controller.producer_id(),
                        err
                    );
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {} // tick fires at loop top
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    running.store(false, Ordering::Release);
}

// ============================================================================
// WORK-PULLING DRIVER
// ============================================================================

/// Mailbox commands of a driven [`WorkPullingRouter`].
pub enum RouterCommand<A> {
    Start(Box<dyn ProducerHandle>),
    Send(A),
    SendWithConfirmation(A, ConfirmationReply),
    GetWorkerStats(Sender<WorkerStats>),
    WorkersUpdated(Vec<WorkerEndpoint<A>>),
    WorkerOp(WorkerId, ConsumerOp),
    Stop,
}

/// Clonable handle to a driven [`WorkPullingRouter`].
pub struct WorkPullingHandle<A> {
    tx: Sender<RouterCommand<A>>,
    running: Arc<AtomicBool>,
    ask_timeout: Duration,
}

impl<A> Clone for WorkPullingHandle<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            running: Arc::clone(&self.running),
            ask_timeout: self.ask_timeout,
        }
    }
}

impl<A: Send + 'static> WorkPullingHandle<A> {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bind or rebind the user-producer reply address.
    pub fn start(&self, producer: Box<dyn ProducerHandle>) {
        let _ = self.tx.send(RouterCommand::Start(producer));
    }

    /// Submit one message (requires an outstanding `RequestNext`).
    pub fn send(&self, payload: A) {
        let _ = self.tx.send(RouterCommand::Send(payload));
    }

    /// Submit one message and obtain its confirmation channel.
    pub fn send_with_confirmation(&self, payload: A) -> Receiver<SeqNr> {
        let (reply_tx, reply_rx) = unbounded();
        let _ = self
            .tx
            .send(RouterCommand::SendWithConfirmation(payload, reply_tx));
        reply_rx
    }

    /// Current worker count, or `None` if the router is gone or slow.
    #[must_use]
    pub fn worker_stats(&self) -> Option<WorkerStats> {
        let (stats_tx, stats_rx) = unbounded();
        let _ = self.tx.send(RouterCommand::GetWorkerStats(stats_tx));
        stats_rx.recv_timeout(self.ask_timeout).ok()
    }

    /// Push a worker-set snapshot (for callers managing membership without a
    /// polled registry).
    pub fn update_workers(&self, snapshot: Vec<WorkerEndpoint<A>>) {
        let _ = self.tx.send(RouterCommand::WorkersUpdated(snapshot));
    }

    /// Reply address for one worker's consumer side.
    #[must_use]
    pub fn worker_ref(&self, worker_id: impl Into<WorkerId>) -> ControllerRef {
        let tx = self.tx.clone();
        let worker_id = worker_id.into();
        ControllerRef::new(move |op| {
            let _ = tx.send(RouterCommand::WorkerOp(worker_id.clone(), op));
        })
    }

    /// Request loop shutdown (discarding buffered messages).
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.tx.send(RouterCommand::Stop);
    }
}

/// Owns the driver thread of one [`WorkPullingRouter`].
///
/// Dropping the driver stops the loop and joins the thread.
pub struct WorkPullingDriver<A> {
    handle: WorkPullingHandle<A>,
    thread: Option<JoinHandle<()>>,
}

impl<A: Clone + Send + 'static> WorkPullingDriver<A> {
    /// Spawn a router whose membership is pushed through the handle.
    #[must_use]
    pub fn spawn(producer_id: impl Into<String>, config: WorkPullingConfig) -> Self {
        Self::spawn_inner(producer_id.into(), config, None)
    }

    /// Spawn a router that polls `registry` for the worker set under `key`.
    #[must_use]
    pub fn spawn_with_registry(
        producer_id: impl Into<String>,
        config: WorkPullingConfig,
        registry: Box<dyn ServiceRegistry<A>>,
        key: ServiceKey,
    ) -> Self {
        Self::spawn_inner(producer_id.into(), config, Some((registry, key)))
    }

    /// Clonable handle to the driven router.
    #[must_use]
    pub fn handle(&self) -> WorkPullingHandle<A> {
        self.handle.clone()
    }

    fn spawn_inner(
        producer_id: String,
        config: WorkPullingConfig,
        registry: Option<(Box<dyn ServiceRegistry<A>>, ServiceKey)>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let handle = WorkPullingHandle {
            tx: tx.clone(),
            running: Arc::new(AtomicBool::new(true)),
            ask_timeout: config.delivery.unexpected_ask_timeout(),
        };

        let mut router = WorkPullingRouter::new(producer_id, config);
        let ref_tx = tx.clone();
        router.set_worker_refs(Box::new(move |worker_id: &str| {
            let tx = ref_tx.clone();
            let worker_id = worker_id.to_string();
            ControllerRef::new(move |op| {
                let _ = tx.send(RouterCommand::WorkerOp(worker_id.clone(), op));
            })
        }));

        let running = Arc::clone(&handle.running);
        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let thread = thread::Builder::new()
            .name("convoy-work-pulling".to_string())
            .spawn(move || run_router_loop(router, rx, running, registry))
            .expect("failed to spawn work-pulling router thread");

        Self {
            handle,
            thread: Some(thread),
        }
    }
}

impl<A> Drop for WorkPullingDriver<A> {
    fn drop(&mut self) {
        self.handle.running.store(false, Ordering::Release);
        let _ = self.handle.tx.send(RouterCommand::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_router_loop<A: Clone + Send + 'static>(
    mut router: WorkPullingRouter<A>,
    rx: Receiver<RouterCommand<A>>,
    running: Arc<AtomicBool>,
    registry: Option<(Box<dyn ServiceRegistry<A>>, ServiceKey)>,
) {
    let tick_interval = router.config().delivery.resend_first_interval();
    let poll_interval = router.config().registry_poll_interval();
    let mut next_tick = Instant::now() + tick_interval;
    let mut next_poll = Instant::now(); // poll immediately on startup

    while running.load(Ordering::Acquire) {
        let now = Instant::now();

        if now >= next_tick {
            router.on_tick();
            next_tick = now + tick_interval;
            continue;
        }
        if let Some((registry, key)) = registry.as_ref() {
            if now >= next_poll {
                let snapshot = registry.snapshot(key);
                if let Err(err) = router.on_workers_updated(snapshot) {
                    log::error!(
                        "[work-pulling] {} terminating on membership failure: {}",
                        router.producer_id(),
                        err
                    );
                    break;
                }
                next_poll = now + poll_interval;
                continue;
            }
        }

        let mut deadline = next_tick;
        if registry.is_some() && next_poll < deadline {
            deadline = next_poll;
        }

        match rx.recv_timeout(deadline.saturating_duration_since(now)) {
            Ok(RouterCommand::Stop) => break,
            Ok(command) => {
                let outcome = match command {
                    RouterCommand::Start(producer) => {
                        router.on_start(producer);
                        Ok(())
                    }
                    RouterCommand::Send(payload) => router.on_msg(payload),
                    RouterCommand::SendWithConfirmation(payload, reply_to) => {
                        router.on_msg_with_confirmation(payload, reply_to)
                    }
                    RouterCommand::GetWorkerStats(reply_to) => {
                        router.on_get_worker_stats(&reply_to);
                        Ok(())
                    }
                    RouterCommand::WorkersUpdated(snapshot) => router.on_workers_updated(snapshot),
                    RouterCommand::WorkerOp(worker_id, op) => router.on_worker_op(&worker_id, op),
                    RouterCommand::Stop => unreachable!("handled above"),
                };
                if let Err(err) = outcome {
                    log::error!(
                        "[work-pulling] {} terminating on protocol violation: {}",
                        router.producer_id(),
                        err
                    );
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {} // periodic work fires at loop top
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    running.store(false, Ordering::Release);
}

// ============================================================================
// TESTS
// ============================================================================
