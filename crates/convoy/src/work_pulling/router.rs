// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Work-pulling router.
//!
//! Multiplexes one logical producer over a dynamically-changing pool of
//! worker endpoints. Each registered worker gets its own embedded
//! [`ProducerController`] with an independent sequence-number space; the
//! router dispatches every submission to one worker chosen uniformly at
//! random among those with outstanding demand. Message ordering *across*
//! workers is explicitly irrelevant to applications using this component,
//! which is why selection is random rather than round-robin.
//!
//! When a worker disappears, its unconfirmed messages move to the front of
//! the router's buffer and are re-dispatched (re-sequenced) to the remaining
//! workers. If the lost worker had already processed a message whose
//! confirmation was lost, the rehomed copy is a duplicate; that is the
//! at-least-once contract.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::registry::{WorkerEndpoint, WorkerId};
use crate::config::WorkPullingConfig;
use crate::delivery::{
    ConfirmationReply, ConsumerOp, ControllerRef, DurableQueue, ProducerController, ProducerHandle,
    ProducerId, RequestNext, SeqNr, StoredMessage,
};
use crate::{Error, Result};

/// Reply payload of `GetWorkerStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_count: usize,
}

/// Builds per-worker [`ControllerRef`]s so messages emitted through a worker
/// carry a reply address that routes back to that worker's session.
pub type WorkerRefFactory = Box<dyn Fn(&str) -> ControllerRef + Send>;

/// One registered worker: its embedded controller plus demand bookkeeping.
struct WorkerSession<A> {
    controller: ProducerController<A>,
    demand_rx: Receiver<RequestNext>,
    has_demand: bool,
}

/// A message waiting for (or travelling between) workers.
struct OutboundMessage<A> {
    payload: A,
    reply_to: Option<ConfirmationReply>,
}

/// Durable-mode bookkeeping: an outer sequence number waiting for its
/// worker-level confirmation.
struct InflightConfirmation {
    outer_seq_nr: SeqNr,
    confirm_rx: Receiver<SeqNr>,
}

/// Router multiplexing one producer over a worker pool (see module docs).
pub struct WorkPullingRouter<A> {
    producer_id: ProducerId,
    config: WorkPullingConfig,
    worker_refs: Option<WorkerRefFactory>,

    producer: Option<Box<dyn ProducerHandle>>,
    /// Whether an unfilled `RequestNext` is outstanding toward the producer.
    requested: bool,

    workers: HashMap<WorkerId, WorkerSession<A>>,
    buffered: VecDeque<OutboundMessage<A>>,

    durable: Option<Box<dyn DurableQueue<A>>>,
    /// Next router-level (outer) sequence number.
    next_outer_seq_nr: SeqNr,
    /// Highest contiguously confirmed outer sequence number.
    confirmed_outer_seq_nr: SeqNr,
    /// Outer confirmations that arrived ahead of the contiguous frontier.
    confirmed_out_of_order: BTreeSet<SeqNr>,
    inflight: Vec<InflightConfirmation>,

    rng: StdRng,
}

impl<A: Clone + Send + 'static> WorkPullingRouter<A> {
    /// Create a router without durability.
    #[must_use]
    pub fn new(producer_id: impl Into<ProducerId>, config: WorkPullingConfig) -> Self {
        Self {
            producer_id: producer_id.into(),
            config,
            worker_refs: None,
            producer: None,
            requested: false,
            workers: HashMap::new(),
            buffered: VecDeque::new(),
            durable: None,
            next_outer_seq_nr: 1,
            confirmed_outer_seq_nr: 0,
            confirmed_out_of_order: BTreeSet::new(),
            inflight: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a durable router, recovering persisted state.
    ///
    /// Unconfirmed messages reload into the buffer (in order) and flow to
    /// workers as demand appears.
    pub fn recover(
        producer_id: impl Into<ProducerId>,
        config: WorkPullingConfig,
        mut durable: Box<dyn DurableQueue<A>>,
    ) -> Result<Self> {
        let state = durable.load_state()?;
        let mut router = Self::new(producer_id, config);

        router.next_outer_seq_nr = state.current_seq_nr.max(1);
        router.confirmed_outer_seq_nr = state
            .unconfirmed
            .first()
            .map_or(router.next_outer_seq_nr - 1, |m| m.seq_nr - 1);
        for stored in state.unconfirmed {
            let (confirm_tx, confirm_rx) = unbounded();
            router.inflight.push(InflightConfirmation {
                outer_seq_nr: stored.seq_nr,
                confirm_rx,
            });
            router.buffered.push_back(OutboundMessage {
                payload: stored.payload,
                reply_to: Some(confirm_tx),
            });
        }
        router.durable = Some(durable);

        log::debug!(
            "[work-pulling] {} recovered: next outer seq {}, {} buffered",
            router.producer_id,
            router.next_outer_seq_nr,
            router.buffered.len()
        );
        Ok(router)
    }

    /// Install a factory for per-worker reply addresses (used by the runtime
    /// driver so worker endpoints can answer into the router's mailbox).
    pub fn set_worker_refs(&mut self, factory: WorkerRefFactory) {
        self.worker_refs = Some(factory);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    #[must_use]
    pub fn config(&self) -> &WorkPullingConfig {
        &self.config
    }

    #[must_use]
    pub fn worker_stats(&self) -> WorkerStats {
        WorkerStats {
            worker_count: self.workers.len(),
        }
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Whether an unfilled `RequestNext` is outstanding toward the producer.
    #[must_use]
    pub fn has_requested(&self) -> bool {
        self.requested
    }

    // ------------------------------------------------------------------
    // Producer-side operations
    // ------------------------------------------------------------------

    /// Bind or rebind the user-producer reply address.
    pub fn on_start(&mut self, producer: Box<dyn ProducerHandle>) {
        let rebind = self.producer.is_some();
        self.producer = Some(producer);
        if rebind {
            log::debug!("[work-pulling] {} producer reference rebound", self.producer_id);
        }
        if self.requested {
            self.notify_request_next();
        } else {
            self.maybe_request_next();
        }
    }

    /// Submit a message without confirmation.
    pub fn on_msg(&mut self, payload: A) -> Result<()> {
        self.submit(payload, None)
    }

    /// Submit a message whose `reply_to` receives the assigned (worker-level,
    /// or outer in durable mode) sequence number once confirmed.
    pub fn on_msg_with_confirmation(
        &mut self,
        payload: A,
        reply_to: ConfirmationReply,
    ) -> Result<()> {
        self.submit(payload, Some(reply_to))
    }

    /// Answer a `GetWorkerStats` query.
    pub fn on_get_worker_stats(&self, reply_to: &Sender<WorkerStats>) {
        let _ = reply_to.send(self.worker_stats());
    }

    // ------------------------------------------------------------------
    // Membership and worker-side operations
    // ------------------------------------------------------------------

    /// Apply a service-discovery snapshot of the current worker set.
    ///
    /// Diffs against the known set: new workers are registered (and seeded
    /// from the buffer as their bootstrap traffic), vanished workers are
    /// deregistered with their unconfirmed messages rehomed to the front of
    /// the buffer. Duplicate snapshots are no-ops.
    pub fn on_workers_updated(&mut self, snapshot: Vec<WorkerEndpoint<A>>) -> Result<()> {
        let current: Vec<WorkerId> = snapshot.iter().map(|w| w.id.clone()).collect();

        let removed: Vec<WorkerId> = self
            .workers
            .keys()
            .filter(|id| !current.contains(*id))
            .cloned()
            .collect();
        for id in removed {
            self.deregister_worker(&id);
        }

        for worker in snapshot {
            if !self.workers.contains_key(&worker.id) {
                self.register_worker(worker);
            }
        }

        self.drain_buffered()?;
        self.maybe_request_next();
        Ok(())
    }

    /// Route a consumer-side protocol operation to the worker it addresses.
    ///
    /// Operations for workers that already left the set are stale and
    /// dropped; the rehoming logic has taken over their messages.
    pub fn on_worker_op(&mut self, worker_id: &str, op: ConsumerOp) -> Result<()> {
        let Some(session) = self.workers.get_mut(worker_id) else {
            log::debug!(
                "[work-pulling] {} dropping op for unknown worker {}",
                self.producer_id, worker_id
            );
            return Ok(());
        };

        match op {
            ConsumerOp::Request(request) => session.controller.on_request(request)?,
            ConsumerOp::Ack(ack) => session.controller.on_ack(ack)?,
            ConsumerOp::Resend(resend) => session.controller.on_resend(resend)?,
        }
        Self::drain_demand(session);

        self.sweep_confirmations()?;
        self.drain_buffered()?;
        self.maybe_request_next();
        Ok(())
    }

    /// Periodic tick, forwarded to every embedded controller's first-message
    /// resend timer.
    pub fn on_tick(&mut self) {
        for session in self.workers.values_mut() {
            session.controller.on_resend_first_tick();
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn register_worker(&mut self, worker: WorkerEndpoint<A>) {
        let (demand_tx, demand_rx) = unbounded();
        let reply_to = self
            .worker_refs
            .as_ref()
            .map_or_else(ControllerRef::detached, |make| make(&worker.id));

        let mut controller = ProducerController::new(
            format!("{}/{}", self.producer_id, worker.id),
            self.config.delivery.clone(),
            reply_to,
        );
        controller.on_start(Box::new(demand_tx));
        controller.on_register_consumer(Box::new(worker.endpoint));

        let mut session = WorkerSession {
            controller,
            demand_rx,
            has_demand: false,
        };
        Self::drain_demand(&mut session);

        log::info!(
            "[work-pulling] {} worker {} registered ({} total)",
            self.producer_id,
            worker.id,
            self.workers.len() + 1
        );
        self.workers.insert(worker.id, session);
    }

    fn deregister_worker(&mut self, worker_id: &str) {
        let Some(session) = self.workers.remove(worker_id) else {
            return;
        };
        let rehomed = session.controller.dismantle();
        if !rehomed.is_empty() {
            log::warn!(
                "[work-pulling] {} worker {} lost, rehoming {} unconfirmed message(s)",
                self.producer_id,
                worker_id,
                rehomed.len()
            );
        } else {
            log::info!(
                "[work-pulling] {} worker {} deregistered",
                self.producer_id, worker_id
            );
        }
        // Front of the queue, preserving relative order.
        for (payload, reply_to) in rehomed.into_iter().rev() {
            self.buffered.push_front(OutboundMessage { payload, reply_to });
        }
    }

    fn submit(&mut self, payload: A, reply_to: Option<ConfirmationReply>) -> Result<()> {
        if !self.requested {
            log::warn!(
                "[work-pulling] {} message submitted without demand",
                self.producer_id
            );
            return Err(Error::NoDemand {
                current: self.next_outer_seq_nr,
                requested: self.next_outer_seq_nr.saturating_sub(1),
            });
        }
        self.requested = false;

        let outer_seq_nr = self.next_outer_seq_nr;
        self.next_outer_seq_nr += 1;

        let outbound = if let Some(durable) = self.durable.as_mut() {
            durable.store_message_sent(StoredMessage {
                seq_nr: outer_seq_nr,
                payload: payload.clone(),
                ack_requested: reply_to.is_some(),
            })?;
            // Durable mode: persistence is the confirmation for the caller;
            // worker-level confirmation is tracked internally so the store
            // can be trimmed.
            if let Some(reply) = reply_to {
                let _ = reply.send(outer_seq_nr);
            }
            let (confirm_tx, confirm_rx) = unbounded();
            self.inflight.push(InflightConfirmation {
                outer_seq_nr,
                confirm_rx,
            });
            OutboundMessage {
                payload,
                reply_to: Some(confirm_tx),
            }
        } else {
            OutboundMessage { payload, reply_to }
        };

        self.dispatch_or_buffer(outbound)?;
        self.maybe_request_next();
        Ok(())
    }

    fn dispatch_or_buffer(&mut self, outbound: OutboundMessage<A>) -> Result<()> {
        match self.pick_worker_with_demand() {
            Some(worker_id) => self.dispatch_to(&worker_id, outbound),
            None => {
                // Demand evaporated between notification and submission (or
                // there are no workers at all): hold the message.
                if self.buffered.len() >= self.config.buffer_size {
                    return Err(Error::BufferOverflow(self.buffered.len()));
                }
                log::debug!(
                    "[work-pulling] {} no worker with demand, buffering ({} queued)",
                    self.producer_id,
                    self.buffered.len() + 1
                );
                self.buffered.push_back(outbound);
                Ok(())
            }
        }
    }

    /// Uniformly random choice among workers with outstanding demand.
    fn pick_worker_with_demand(&mut self) -> Option<WorkerId> {
        let mut candidates: Vec<&WorkerId> = self
            .workers
            .iter()
            .filter(|(_, session)| session.has_demand)
            .map(|(id, _)| id)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Stable order before sampling: map iteration order is arbitrary.
        candidates.sort();
        let idx = self.rng.gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    fn dispatch_to(&mut self, worker_id: &str, outbound: OutboundMessage<A>) -> Result<()> {
        let Some(session) = self.workers.get_mut(worker_id) else {
            self.buffered.push_front(outbound);
            return Ok(());
        };
        session.has_demand = false;

        let result = match outbound.reply_to {
            Some(reply_to) => session
                .controller
                .on_msg_with_confirmation(outbound.payload, reply_to),
            None => session.controller.on_msg(outbound.payload),
        };
        result?;

        Self::drain_demand(session);
        Ok(())
    }

    fn drain_demand(session: &mut WorkerSession<A>) {
        while session.demand_rx.try_recv().is_ok() {
            session.has_demand = true;
        }
    }

    fn drain_buffered(&mut self) -> Result<()> {
        while !self.buffered.is_empty() {
            let Some(worker_id) = self.pick_worker_with_demand() else {
                break;
            };
            let Some(outbound) = self.buffered.pop_front() else {
                break;
            };
            self.dispatch_to(&worker_id, outbound)?;
        }
        Ok(())
    }

    /// Record worker-level confirmations against the durable store, keeping
    /// the confirmed frontier contiguous in outer sequence order.
    fn sweep_confirmations(&mut self) -> Result<()> {
        if self.inflight.is_empty() {
            return Ok(());
        }

        let mut newly_confirmed = Vec::new();
        self.inflight.retain(|entry| {
            if entry.confirm_rx.try_recv().is_ok() {
                newly_confirmed.push(entry.outer_seq_nr);
                false
            } else {
                true
            }
        });
        if newly_confirmed.is_empty() {
            return Ok(());
        }

        self.confirmed_out_of_order.extend(newly_confirmed);
        let mut frontier = self.confirmed_outer_seq_nr;
        while self.confirmed_out_of_order.remove(&(frontier + 1)) {
            frontier += 1;
        }
        if frontier > self.confirmed_outer_seq_nr {
            self.confirmed_outer_seq_nr = frontier;
            if let Some(durable) = self.durable.as_mut() {
                durable.store_message_confirmed(frontier)?;
            }
        }
        Ok(())
    }

    fn maybe_request_next(&mut self) {
        if self.requested || self.producer.is_none() {
            return;
        }
        let any_demand = self.workers.values().any(|s| s.has_demand);
        // With every worker gone, keep granting until the buffer is full;
        // past that point backpressure is the withheld RequestNext.
        if any_demand || self.buffered.len() < self.config.buffer_size {
            self.requested = true;
            self.notify_request_next();
        }
    }

    fn notify_request_next(&self) {
        if let Some(producer) = self.producer.as_ref() {
            producer.request_next(RequestNext {
                producer_id: self.producer_id.clone(),
                current_seq_nr: self.next_outer_seq_nr,
                confirmed_seq_nr: self.confirmed_outer_seq_nr,
            });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
