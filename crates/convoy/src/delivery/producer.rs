// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer-side delivery controller.
//!
//! One `ProducerController` per producer instance, bound to a stable
//! `producer_id`. Owns the sliding-window state toward exactly one logical
//! consumer endpoint: sequencing, request/ack bookkeeping, the resend buffer,
//! and the first-message resend timer.
//!
//! The controller is a single-threaded state machine: every `on_*` handler
//! runs to completion and performs its emissions (consumer deliveries,
//! producer notifications, confirmation replies) before returning. Handlers
//! return `Err` only for fatal protocol violations; the host loop must treat
//! any `Err` as controller termination.

use super::buffer::{PendingReplies, ResendBuffer};
use super::durable::{DurableQueue, StoredMessage};
use super::messages::{
    Ack, ConfirmationReply, ConsumerEndpoint, ControllerRef, ProducerHandle, ProducerId, Request,
    RequestNext, Resend, SeqNr, SequencedMessage,
};
use crate::config::DeliveryConfig;
use crate::{Error, Result};

/// Per-producer sequenced-delivery state machine.
///
/// # Lifecycle
///
/// A controller is not *active* until it has seen both `Start` (binding the
/// producer reply address) and `RegisterConsumer` (binding the outbound
/// endpoint), in either order. Until then every other operation is ignored.
/// On activation a fresh controller immediately grants the producer one
/// bootstrap submission: the first `SequencedMessage` is sent *without* a
/// preceding `Request`, because the consumer controller may not exist until
/// the first message reaches it.
///
/// # Demand contract
///
/// At most one [`RequestNext`] notification is outstanding at any moment; the
/// producer must submit exactly one message per notification. Submitting
/// without demand is a fatal protocol violation.
pub struct ProducerController<A> {
    producer_id: ProducerId,
    config: DeliveryConfig,
    /// Handle to this controller's own mailbox, stamped into every outgoing
    /// message so consumers know where to send `Request` / `Ack` / `Resend`.
    reply_to: ControllerRef,
    durable: Option<Box<dyn DurableQueue<A>>>,

    producer: Option<Box<dyn ProducerHandle>>,
    consumer: Option<Box<dyn ConsumerEndpoint<A>>>,
    active: bool,

    /// Next sequence number to assign; >= 1.
    current_seq_nr: SeqNr,
    /// Highest cumulatively confirmed sequence number; 0 = none.
    confirmed_seq_nr: SeqNr,
    /// Highest sequence number the consumer currently permits.
    requested_seq_nr: SeqNr,
    /// Whether an unfilled `RequestNext` is outstanding toward the producer.
    requested: bool,
    /// Sequence number of the earliest unconfirmed message of this consumer
    /// session, or `current_seq_nr` if none. Session-stable: re-derived only
    /// at activation, recovery, and consumer registration.
    first_seq_nr: SeqNr,

    unconfirmed: ResendBuffer<A>,
    pending_replies: PendingReplies,
    /// Whether the periodic first-message resend timer is running.
    resend_first_armed: bool,
}

impl<A: Clone> ProducerController<A> {
    /// Create a fresh, non-durable controller.
    #[must_use]
    pub fn new(
        producer_id: impl Into<ProducerId>,
        config: DeliveryConfig,
        reply_to: ControllerRef,
    ) -> Self {
        let unconfirmed = ResendBuffer::new(config.support_resend);
        Self {
            producer_id: producer_id.into(),
            config,
            reply_to,
            durable: None,
            producer: None,
            consumer: None,
            active: false,
            current_seq_nr: 1,
            confirmed_seq_nr: 0,
            requested_seq_nr: 0,
            requested: false,
            first_seq_nr: 1,
            unconfirmed,
            pending_replies: PendingReplies::new(),
            resend_first_armed: false,
        }
    }

    /// Create a durable controller, recovering persisted state.
    ///
    /// The recovered unconfirmed messages are replayed through the normal
    /// resend path once the controller becomes active. Confirmation replies
    /// for durable submissions fire on persist, not on consumer ack.
    pub fn recover(
        producer_id: impl Into<ProducerId>,
        config: DeliveryConfig,
        reply_to: ControllerRef,
        mut durable: Box<dyn DurableQueue<A>>,
    ) -> Result<Self> {
        let state = durable.load_state()?;
        let mut controller = Self::new(producer_id, config, reply_to);

        let head_seq_nr = state.unconfirmed.first().map(|m| m.seq_nr);
        controller.current_seq_nr = state.current_seq_nr.max(1);
        controller.confirmed_seq_nr =
            head_seq_nr.map_or(controller.current_seq_nr - 1, |head| head - 1);
        controller.requested_seq_nr = controller.confirmed_seq_nr;
        controller.first_seq_nr = head_seq_nr.unwrap_or(controller.current_seq_nr);

        // Recovery always runs with a resend window; replay needs it even if
        // the consumer later declares support_resend = false.
        let mut unconfirmed = ResendBuffer::new(true);
        for stored in state.unconfirmed {
            unconfirmed.push(SequencedMessage {
                producer_id: controller.producer_id.clone(),
                seq_nr: stored.seq_nr,
                payload: stored.payload,
                first: stored.seq_nr == controller.first_seq_nr,
                ack: stored.ack_requested,
                reply_to: controller.reply_to.clone(),
            });
        }
        controller.unconfirmed = unconfirmed;
        controller.durable = Some(durable);

        log::debug!(
            "[producer-controller] {} recovered: next seq {}, {} unconfirmed",
            controller.producer_id,
            controller.current_seq_nr,
            controller.unconfirmed.len()
        );
        Ok(controller)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    #[must_use]
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn current_seq_nr(&self) -> SeqNr {
        self.current_seq_nr
    }

    #[must_use]
    pub fn confirmed_seq_nr(&self) -> SeqNr {
        self.confirmed_seq_nr
    }

    #[must_use]
    pub fn requested_seq_nr(&self) -> SeqNr {
        self.requested_seq_nr
    }

    #[must_use]
    pub fn first_seq_nr(&self) -> SeqNr {
        self.first_seq_nr
    }

    /// Whether the producer currently holds an unfilled demand grant.
    #[must_use]
    pub fn has_demand(&self) -> bool {
        self.requested && self.current_seq_nr <= self.requested_seq_nr
    }

    #[must_use]
    pub fn unconfirmed_len(&self) -> usize {
        self.unconfirmed.len()
    }

    #[must_use]
    pub fn resend_first_armed(&self) -> bool {
        self.resend_first_armed
    }

    // ------------------------------------------------------------------
    // Producer-side operations
    // ------------------------------------------------------------------

    /// Bind or rebind the producer reply address.
    ///
    /// Rebinding resets no protocol state; if demand is outstanding the new
    /// address is re-notified so a restarted producer cannot deadlock.
    pub fn on_start(&mut self, producer: Box<dyn ProducerHandle>) {
        let rebind = self.producer.is_some();
        self.producer = Some(producer);
        if rebind {
            log::debug!(
                "[producer-controller] {} producer reference rebound",
                self.producer_id
            );
        }
        if self.active {
            if self.requested {
                self.notify_request_next();
            }
        } else {
            self.maybe_activate();
        }
    }

    /// Submit a message without confirmation.
    pub fn on_msg(&mut self, payload: A) -> Result<()> {
        self.send_message(payload, None)
    }

    /// Submit a message whose `reply_to` receives the assigned sequence
    /// number once confirmed (or persisted, in durable mode).
    pub fn on_msg_with_confirmation(
        &mut self,
        payload: A,
        reply_to: ConfirmationReply,
    ) -> Result<()> {
        self.send_message(payload, Some(reply_to))
    }

    // ------------------------------------------------------------------
    // Consumer-side operations
    // ------------------------------------------------------------------

    /// Bind or rebind the outbound consumer endpoint.
    ///
    /// On failover to a new consumer, `first_seq_nr` is re-derived from the
    /// earliest unconfirmed message and that message is re-emitted at once
    /// with `first = true`, bootstrapping the new consumer's request loop;
    /// the periodic resend timer keeps re-emitting it until answered.
    pub fn on_register_consumer(&mut self, consumer: Box<dyn ConsumerEndpoint<A>>) {
        let rebind = self.consumer.is_some();
        self.consumer = Some(consumer);

        if !self.active {
            self.maybe_activate();
            return;
        }

        if rebind {
            log::debug!(
                "[producer-controller] {} consumer endpoint rebound, {} unconfirmed",
                self.producer_id,
                self.unconfirmed.len()
            );
        }
        self.first_seq_nr = self
            .unconfirmed
            .head_seq_nr()
            .unwrap_or(self.current_seq_nr);
        if !self.unconfirmed.is_empty() {
            self.resend_first_armed = true;
            self.emit_first_unconfirmed();
        }
    }

    /// Handle a demand grant / cumulative ack from the consumer.
    pub fn on_request(&mut self, request: Request) -> Result<()> {
        if !self.active {
            log::debug!(
                "[producer-controller] {} ignoring Request before activation",
                self.producer_id
            );
            return Ok(());
        }

        let Request {
            confirmed_seq_nr,
            up_to_seq_nr,
            support_resend,
            via_timeout,
        } = request;

        self.apply_ack(confirmed_seq_nr)?;
        if confirmed_seq_nr == self.first_seq_nr {
            self.resend_first_armed = false;
        }

        self.unconfirmed.reconcile(support_resend);

        // Retransmission trigger: a timed-out request means the consumer saw
        // no new traffic (lost tail); a confirmation at or below the session's
        // first message means the consumer is missing the unconfirmed window.
        if (via_timeout || confirmed_seq_nr <= self.first_seq_nr) && !self.unconfirmed.is_empty() {
            self.resend_from(0);
        }

        if up_to_seq_nr > self.requested_seq_nr {
            self.requested_seq_nr = up_to_seq_nr;
        }
        if !self.requested && self.current_seq_nr <= self.requested_seq_nr {
            self.requested = true;
            self.notify_request_next();
        }
        Ok(())
    }

    /// Handle a cumulative ack without new demand.
    pub fn on_ack(&mut self, ack: Ack) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.apply_ack(ack.confirmed_seq_nr)?;
        // The first message being confirmed with traffic still in flight
        // means nothing newer will reveal a gap; resend proactively.
        if ack.confirmed_seq_nr == self.first_seq_nr && !self.unconfirmed.is_empty() {
            self.resend_from(0);
        }
        Ok(())
    }

    /// Handle an explicit retransmission request.
    ///
    /// Fatal if the consumer previously declared `support_resend = false`.
    /// A `from_seq_nr` below the earliest buffered message is clamped to the
    /// buffer head; earlier entries stay buffered until confirmed.
    pub fn on_resend(&mut self, resend: Resend) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        if !self.unconfirmed.is_enabled() {
            return Err(Error::ResendUnsupported(resend.from_seq_nr));
        }
        self.resend_from(resend.from_seq_nr);
        Ok(())
    }

    /// Periodic first-message resend tick (fixed delay, see
    /// [`DeliveryConfig::resend_first_interval_ms`]).
    ///
    /// Re-emits the earliest unconfirmed message with `first = true` until
    /// the consumer answers with its initial `Request`; self-cancels once the
    /// head has moved past `first_seq_nr`.
    pub fn on_resend_first_tick(&mut self) {
        if !self.active || !self.resend_first_armed {
            return;
        }
        match self.unconfirmed.head_seq_nr() {
            Some(head) if head == self.first_seq_nr => {
                log::debug!(
                    "[producer-controller] {} re-emitting first seq {}",
                    self.producer_id, head
                );
                self.emit_first_unconfirmed();
            }
            _ => {
                if self.current_seq_nr > self.first_seq_nr {
                    self.resend_first_armed = false;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Consume the controller, yielding its unconfirmed payloads in order,
    /// each paired with its still-pending confirmation reply (if any).
    ///
    /// Used by the work-pulling router to rehome in-flight messages when a
    /// worker disappears. Rehomed messages are re-sequenced by their next
    /// controller, so duplicates at the old worker are possible; that is the
    /// at-least-once contract.
    #[must_use]
    pub fn dismantle(self) -> Vec<(A, Option<ConfirmationReply>)> {
        let mut pending = self.pending_replies;
        self.unconfirmed
            .into_messages()
            .into_iter()
            .map(|msg| {
                let reply = pending.take_exact(msg.seq_nr);
                (msg.payload, reply)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn maybe_activate(&mut self) {
        if self.active || self.producer.is_none() || self.consumer.is_none() {
            return;
        }
        self.active = true;

        if self.current_seq_nr == 1 && self.unconfirmed.is_empty() {
            // Fresh session: grant one bootstrap submission so message #1 can
            // be sent without a preceding Request.
            self.first_seq_nr = 1;
            self.requested_seq_nr = 1;
            self.requested = true;
            log::debug!("[producer-controller] {} active", self.producer_id);
            self.notify_request_next();
        } else {
            // Recovered session: replay the unconfirmed window and wait for
            // the consumer to re-grant demand.
            self.first_seq_nr = self
                .unconfirmed
                .head_seq_nr()
                .unwrap_or(self.current_seq_nr);
            self.requested_seq_nr = self.requested_seq_nr.max(self.confirmed_seq_nr);
            self.requested = false;
            log::debug!(
                "[producer-controller] {} active after recovery, replaying {} unconfirmed",
                self.producer_id,
                self.unconfirmed.len()
            );
            if !self.unconfirmed.is_empty() {
                self.resend_from(0);
                self.resend_first_armed = true;
            }
        }
    }

    fn send_message(&mut self, payload: A, reply_to: Option<ConfirmationReply>) -> Result<()> {
        if !self.has_demand() {
            log::warn!(
                "[producer-controller] {} message submitted without demand (next seq {}, granted up to {})",
                self.producer_id, self.current_seq_nr, self.requested_seq_nr
            );
            return Err(Error::NoDemand {
                current: self.current_seq_nr,
                requested: self.requested_seq_nr,
            });
        }

        let seq_nr = self.current_seq_nr;
        let msg = SequencedMessage {
            producer_id: self.producer_id.clone(),
            seq_nr,
            payload,
            first: seq_nr == self.first_seq_nr,
            ack: reply_to.is_some(),
            reply_to: self.reply_to.clone(),
        };

        if let Some(durable) = self.durable.as_mut() {
            durable.store_message_sent(StoredMessage {
                seq_nr,
                payload: msg.payload.clone(),
                ack_requested: msg.ack,
            })?;
            // Durable mode: persistence is the confirmation.
            if let Some(reply) = reply_to {
                let _ = reply.send(seq_nr);
            }
        } else if let Some(reply) = reply_to {
            self.pending_replies.insert(seq_nr, reply);
        }

        self.unconfirmed.push(msg.clone());
        if seq_nr == self.first_seq_nr {
            self.resend_first_armed = true;
        }
        self.deliver(msg);

        self.current_seq_nr += 1;
        if self.current_seq_nr <= self.requested_seq_nr {
            self.notify_request_next();
        } else {
            self.requested = false;
        }
        Ok(())
    }

    fn apply_ack(&mut self, confirmed: SeqNr) -> Result<()> {
        if confirmed <= self.confirmed_seq_nr {
            return Ok(());
        }
        for (seq_nr, reply) in self.pending_replies.take_confirmed(confirmed) {
            let _ = reply.send(seq_nr);
        }
        self.unconfirmed.drop_confirmed(confirmed);
        self.confirmed_seq_nr = confirmed;
        if let Some(durable) = self.durable.as_mut() {
            durable.store_message_confirmed(confirmed)?;
        }
        log::debug!(
            "[producer-controller] {} confirmed through seq {}",
            self.producer_id, confirmed
        );
        Ok(())
    }

    /// Retransmit the buffered suffix `seq_nr >= from`, in order.
    fn resend_from(&mut self, from: SeqNr) {
        let first_seq_nr = self.first_seq_nr;
        let batch: Vec<SequencedMessage<A>> = self
            .unconfirmed
            .suffix_from(from)
            .cloned()
            .map(|mut msg| {
                msg.first = msg.seq_nr == first_seq_nr;
                msg
            })
            .collect();
        if batch.is_empty() {
            return;
        }
        log::debug!(
            "[producer-controller] {} resending {} message(s) from seq {}",
            self.producer_id,
            batch.len(),
            batch[0].seq_nr
        );
        for msg in batch {
            self.deliver(msg);
        }
    }

    /// Re-emit only the earliest unconfirmed message, flagged `first`.
    fn emit_first_unconfirmed(&mut self) {
        if let Some(head) = self.unconfirmed.head() {
            let mut msg = head.clone();
            msg.first = true;
            self.deliver(msg);
        }
    }

    fn deliver(&self, msg: SequencedMessage<A>) {
        if let Some(consumer) = self.consumer.as_ref() {
            consumer.deliver(msg);
        }
    }

    fn notify_request_next(&self) {
        if let Some(producer) = self.producer.as_ref() {
            producer.request_next(RequestNext {
                producer_id: self.producer_id.clone(),
                current_seq_nr: self.current_seq_nr,
                confirmed_seq_nr: self.confirmed_seq_nr,
            });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::durable::InMemoryDurableQueue;
    use crossbeam_channel::{unbounded, Receiver};
    use std::sync::{Arc, Mutex};

    /// Endpoint that records every delivered message.
    #[derive(Clone, Default)]
    struct Recording<A> {
        sent: Arc<Mutex<Vec<SequencedMessage<A>>>>,
    }

    impl<A> Recording<A> {
        fn new() -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn seqs(&self) -> Vec<SeqNr> {
            self.sent.lock().unwrap().iter().map(|m| m.seq_nr).collect()
        }

        fn last(&self) -> SequencedMessage<A>
        where
            A: Clone,
        {
            self.sent.lock().unwrap().last().cloned().expect("no message sent")
        }

        fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }

        fn len(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl<A: Clone + Send> ConsumerEndpoint<A> for Recording<A> {
        fn deliver(&self, msg: SequencedMessage<A>) {
            self.sent.lock().unwrap().push(msg);
        }
    }

    fn activated(
        producer_id: &str,
    ) -> (
        ProducerController<String>,
        Recording<String>,
        Receiver<RequestNext>,
    ) {
        let mut pc = ProducerController::new(
            producer_id,
            DeliveryConfig::default(),
            ControllerRef::detached(),
        );
        let endpoint = Recording::new();
        let (producer_tx, producer_rx) = unbounded();
        pc.on_start(Box::new(producer_tx));
        pc.on_register_consumer(Box::new(endpoint.clone()));
        (pc, endpoint, producer_rx)
    }

    #[test]
    fn test_inactive_until_both_bindings() {
        let mut pc = ProducerController::<String>::new(
            "p-1",
            DeliveryConfig::default(),
            ControllerRef::detached(),
        );
        assert!(!pc.is_active());

        let (producer_tx, producer_rx) = unbounded();
        pc.on_start(Box::new(producer_tx));
        assert!(!pc.is_active());
        assert!(producer_rx.try_recv().is_err(), "no grant before activation");

        pc.on_register_consumer(Box::new(Recording::new()));
        assert!(pc.is_active());
        let next = producer_rx.try_recv().expect("bootstrap grant");
        assert_eq!(next.current_seq_nr, 1);
        assert_eq!(next.confirmed_seq_nr, 0);
    }

    #[test]
    fn test_activation_order_is_irrelevant() {
        let mut pc = ProducerController::<String>::new(
            "p-1",
            DeliveryConfig::default(),
            ControllerRef::detached(),
        );
        let (producer_tx, producer_rx) = unbounded();
        pc.on_register_consumer(Box::new(Recording::new()));
        assert!(!pc.is_active());
        pc.on_start(Box::new(producer_tx));
        assert!(pc.is_active());
        assert!(producer_rx.try_recv().is_ok());
    }

    #[test]
    fn test_first_message_flags_and_demand() {
        let (mut pc, endpoint, producer_rx) = activated("p-1");
        producer_rx.try_recv().expect("bootstrap grant");

        pc.on_msg("msg-1".into()).expect("send");
        let msg = endpoint.last();
        assert_eq!(msg.seq_nr, 1);
        assert!(msg.first);
        assert!(!msg.ack);
        assert!(pc.resend_first_armed());

        // Bootstrap grant is spent; no further notification until demand.
        assert!(producer_rx.try_recv().is_err());
        assert!(!pc.has_demand());
    }

    #[test]
    fn test_submission_without_demand_is_fatal() {
        let (mut pc, _endpoint, _producer_rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");

        let err = pc.on_msg("msg-2".into()).expect_err("no demand left");
        assert!(matches!(err, Error::NoDemand { .. }));
    }

    #[test]
    fn test_request_grants_demand_and_notifies_once() {
        let (mut pc, endpoint, producer_rx) = activated("p-1");
        producer_rx.try_recv().expect("bootstrap grant");
        pc.on_msg("msg-1".into()).expect("send");

        pc.on_request(Request::new(1, 10, true, false)).expect("request");
        assert_eq!(pc.confirmed_seq_nr(), 1);
        assert_eq!(pc.requested_seq_nr(), 10);
        assert_eq!(pc.unconfirmed_len(), 0, "confirmed prefix trimmed");
        assert!(!pc.resend_first_armed(), "first confirmed cancels the timer");

        let next = producer_rx.try_recv().expect("new grant");
        assert_eq!(next.current_seq_nr, 2);
        assert_eq!(next.confirmed_seq_nr, 1);
        assert!(producer_rx.try_recv().is_err(), "at most one outstanding");

        // Mid-window sends re-notify immediately.
        endpoint.clear();
        for seq in 2..=4u64 {
            pc.on_msg(format!("msg-{seq}")).expect("send");
            assert_eq!(producer_rx.try_recv().expect("grant").current_seq_nr, seq + 1);
        }
        assert_eq!(endpoint.seqs(), vec![2, 3, 4]);
    }

    #[test]
    fn test_emitted_stream_is_gapless() {
        let (mut pc, endpoint, _rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");
        pc.on_request(Request::new(1, 100, true, false)).expect("request");
        for seq in 2..=20u64 {
            pc.on_msg(format!("msg-{seq}")).expect("send");
        }
        assert_eq!(endpoint.seqs(), (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_resend_retransmits_suffix_in_order() {
        let (mut pc, endpoint, _rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");
        pc.on_request(Request::new(1, 10, true, false)).expect("request");
        for seq in 2..=4u64 {
            pc.on_msg(format!("msg-{seq}")).expect("send");
        }

        endpoint.clear();
        pc.on_resend(Resend::new(3)).expect("resend");
        assert_eq!(endpoint.seqs(), vec![3, 4]);

        // Entries below `from` stay buffered for later retransmission.
        assert_eq!(pc.unconfirmed_len(), 3);

        endpoint.clear();
        pc.on_resend(Resend::new(0)).expect("resend clamps to head");
        assert_eq!(endpoint.seqs(), vec![2, 3, 4]);
    }

    #[test]
    fn test_resend_in_disabled_mode_is_fatal() {
        let (mut pc, _endpoint, _rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");
        pc.on_request(Request::new(1, 10, false, false)).expect("request");

        let err = pc.on_resend(Resend::new(1)).expect_err("disabled mode");
        assert!(matches!(err, Error::ResendUnsupported(1)));
    }

    #[test]
    fn test_via_timeout_request_resends_window() {
        let (mut pc, endpoint, _rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");
        pc.on_request(Request::new(1, 10, true, false)).expect("request");
        for seq in 2..=4u64 {
            pc.on_msg(format!("msg-{seq}")).expect("send");
        }

        endpoint.clear();
        pc.on_request(Request::new(2, 10, true, true)).expect("request");
        assert_eq!(endpoint.seqs(), vec![3, 4], "tail resent after timeout probe");
    }

    #[test]
    fn test_plain_request_beyond_first_does_not_resend() {
        let (mut pc, endpoint, _rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");
        pc.on_request(Request::new(1, 10, true, false)).expect("request");
        for seq in 2..=4u64 {
            pc.on_msg(format!("msg-{seq}")).expect("send");
        }

        endpoint.clear();
        pc.on_request(Request::new(3, 10, true, false)).expect("request");
        assert_eq!(endpoint.len(), 0, "steady-state ack must not retransmit");
        assert_eq!(pc.unconfirmed_len(), 1);
    }

    #[test]
    fn test_ack_at_first_seq_resends_remainder() {
        let (mut pc, endpoint, _rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");
        pc.on_request(Request::new(0, 10, true, false)).expect("request");
        for seq in 2..=3u64 {
            pc.on_msg(format!("msg-{seq}")).expect("send");
        }

        endpoint.clear();
        pc.on_ack(Ack::new(1)).expect("ack");
        assert_eq!(endpoint.seqs(), vec![2, 3]);
        assert_eq!(pc.confirmed_seq_nr(), 1);
    }

    #[test]
    fn test_ack_is_idempotent_and_monotonic() {
        let (mut pc, _endpoint, _rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");
        pc.on_request(Request::new(0, 10, true, false)).expect("request");
        for seq in 2..=4u64 {
            pc.on_msg(format!("msg-{seq}")).expect("send");
        }

        pc.on_ack(Ack::new(3)).expect("ack");
        assert_eq!(pc.confirmed_seq_nr(), 3);
        pc.on_ack(Ack::new(2)).expect("stale ack");
        assert_eq!(pc.confirmed_seq_nr(), 3, "Ack(k') with k' <= k is a no-op");
        assert_eq!(pc.unconfirmed_len(), 1);
    }

    #[test]
    fn test_confirmation_replies_dispatch_in_order() {
        let (mut pc, _endpoint, _rx) = activated("p-1");
        let (reply_tx, reply_rx) = unbounded();

        pc.on_msg_with_confirmation("msg-1".into(), reply_tx.clone())
            .expect("send");
        pc.on_request(Request::new(0, 10, true, false)).expect("request");
        for seq in 2..=4u64 {
            pc.on_msg_with_confirmation(format!("msg-{seq}"), reply_tx.clone())
                .expect("send");
        }
        assert!(reply_rx.try_recv().is_err(), "nothing confirmed yet");

        pc.on_ack(Ack::new(4)).expect("ack");
        assert_eq!(reply_rx.try_iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_resend_first_tick_reemits_head_until_answered() {
        let (mut pc, endpoint, _rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");

        endpoint.clear();
        pc.on_resend_first_tick();
        pc.on_resend_first_tick();
        assert_eq!(endpoint.seqs(), vec![1, 1]);
        assert!(endpoint.sent.lock().unwrap().iter().all(|m| m.first));

        pc.on_request(Request::new(1, 10, true, false)).expect("request");
        endpoint.clear();
        pc.on_resend_first_tick();
        assert_eq!(endpoint.len(), 0, "answered first stops re-emission");
    }

    #[test]
    fn test_register_consumer_failover_reemits_first_unconfirmed() {
        let (mut pc, endpoint, _rx) = activated("p-1");
        pc.on_msg("msg-1".into()).expect("send");
        pc.on_request(Request::new(0, 10, true, false)).expect("request");
        for seq in 2..=4u64 {
            pc.on_msg(format!("msg-{seq}")).expect("send");
        }
        pc.on_ack(Ack::new(2)).expect("ack");

        let replacement = Recording::new();
        pc.on_register_consumer(Box::new(replacement.clone()));

        assert_eq!(pc.first_seq_nr(), 3, "re-derived from earliest unconfirmed");
        assert_eq!(replacement.seqs(), vec![3]);
        assert!(replacement.last().first);
        assert!(pc.resend_first_armed());

        // Nothing goes to the old endpoint anymore.
        assert!(endpoint.seqs().ends_with(&[4]));
    }

    #[test]
    fn test_start_rebind_renotifies_outstanding_demand() {
        let (mut pc, _endpoint, first_rx) = activated("p-1");
        first_rx.try_recv().expect("bootstrap grant");

        let (second_tx, second_rx) = unbounded();
        pc.on_start(Box::new(second_tx));
        let next = second_rx.try_recv().expect("rebound producer re-notified");
        assert_eq!(next.current_seq_nr, 1);

        // State was not reset by the rebind.
        pc.on_msg("msg-1".into()).expect("send");
        assert_eq!(pc.current_seq_nr(), 2);
    }

    #[test]
    fn test_durable_reply_fires_on_persist() {
        let queue = InMemoryDurableQueue::<String>::new();
        let mut pc = ProducerController::recover(
            "p-1",
            DeliveryConfig::default(),
            ControllerRef::detached(),
            Box::new(queue.clone()),
        )
        .expect("recover fresh");

        let endpoint = Recording::new();
        let (producer_tx, _producer_rx) = unbounded();
        pc.on_start(Box::new(producer_tx));
        pc.on_register_consumer(Box::new(endpoint));

        let (reply_tx, reply_rx) = unbounded();
        pc.on_msg_with_confirmation("msg-1".into(), reply_tx).expect("send");
        assert_eq!(
            reply_rx.try_recv().expect("confirmed on persist"),
            1,
            "durable mode confirms on store, not on consumer ack"
        );
        assert_eq!(queue.unconfirmed_len(), 1);

        pc.on_ack(Ack::new(1)).expect("ack");
        assert_eq!(queue.confirmed_seq_nr(), 1);
        assert_eq!(queue.unconfirmed_len(), 0);
    }

    #[test]
    fn test_durable_recovery_replays_unconfirmed() {
        let queue = InMemoryDurableQueue::<String>::new();
        {
            let mut pc = ProducerController::recover(
                "p-1",
                DeliveryConfig::default(),
                ControllerRef::detached(),
                Box::new(queue.clone()),
            )
            .expect("recover fresh");
            let (producer_tx, _rx) = unbounded();
            pc.on_start(Box::new(producer_tx));
            pc.on_register_consumer(Box::new(Recording::new()));
            pc.on_msg("msg-1".into()).expect("send");
            pc.on_request(Request::new(1, 10, true, false)).expect("request");
            pc.on_msg("msg-2".into()).expect("send");
            pc.on_msg("msg-3".into()).expect("send");
            // Controller dropped here: crash with seqs 2, 3 unconfirmed.
        }

        let mut pc = ProducerController::recover(
            "p-1",
            DeliveryConfig::default(),
            ControllerRef::detached(),
            Box::new(queue.clone()),
        )
        .expect("recover");
        assert_eq!(pc.current_seq_nr(), 4);
        assert_eq!(pc.confirmed_seq_nr(), 1);
        assert_eq!(pc.first_seq_nr(), 2);

        let endpoint = Recording::new();
        let (producer_tx, producer_rx) = unbounded();
        pc.on_start(Box::new(producer_tx));
        pc.on_register_consumer(Box::new(endpoint.clone()));

        assert_eq!(endpoint.seqs(), vec![2, 3], "unconfirmed window replayed");
        assert!(endpoint.sent.lock().unwrap()[0].first);
        assert!(
            producer_rx.try_recv().is_err(),
            "no grant until the consumer re-requests"
        );

        pc.on_request(Request::new(3, 10, true, false)).expect("request");
        assert!(producer_rx.try_recv().is_ok());
        pc.on_msg("msg-4".into()).expect("send");
        assert_eq!(endpoint.seqs(), vec![2, 3, 4]);
    }
}
