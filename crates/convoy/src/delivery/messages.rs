// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery protocol messages and endpoint seams.
//!
//! Consolidates the record types exchanged between producer controller and
//! consumer controller:
//! - `SequencedMessage`: payload envelope, producer -> consumer
//! - `Request`: demand grant + cumulative ack, consumer -> producer
//! - `Ack`: cumulative ack without new demand, consumer -> producer
//! - `Resend`: retransmission request, consumer -> producer
//! - `RequestNext`: demand notification, controller -> user producer

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Monotonic 64-bit sequence number, assigned per controller.
///
/// Starts at 1, never reused, never skipped. No wrap handling: at 1M msg/s
/// the space lasts ~584,942 years.
pub type SeqNr = u64;

/// Stable string identifier of a producing controller.
pub type ProducerId = String;

/// Reply channel for confirmation-variant submissions.
///
/// Receives the assigned sequence number once the message is confirmed
/// (consumer-acknowledged, or persisted when a durable queue is configured).
pub type ConfirmationReply = Sender<SeqNr>;

// ============================================================================
// WIRE RECORDS
// ============================================================================

/// Payload envelope emitted to the consumer endpoint.
#[derive(Debug, Clone)]
pub struct SequencedMessage<A> {
    /// Identifier of the producing controller.
    pub producer_id: ProducerId,
    /// Assigned sequence number.
    pub seq_nr: SeqNr,
    /// Application message.
    pub payload: A,
    /// Set on the current earliest unconfirmed message to prompt the
    /// consumer's initial `Request`.
    pub first: bool,
    /// Set when the submitter asked for an explicit confirmation.
    pub ack: bool,
    /// Address for the consumer's `Request` / `Ack` / `Resend` replies.
    pub reply_to: ControllerRef,
}

/// Demand grant and cumulative acknowledgement from the consumer.
///
/// Everything up to and including `confirmed_seq_nr` is acknowledged; the
/// producer may send up to and including `up_to_seq_nr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub confirmed_seq_nr: SeqNr,
    pub up_to_seq_nr: SeqNr,
    /// `false` declares the consumer will never ask for retransmissions and
    /// permits the controller to run without a resend buffer.
    pub support_resend: bool,
    /// `true` when the consumer re-sent this request without receiving new
    /// messages (liveness probe revealing a lost tail).
    pub via_timeout: bool,
}

impl Request {
    /// Create a request. Invariant: `confirmed_seq_nr < up_to_seq_nr`.
    #[must_use]
    pub fn new(
        confirmed_seq_nr: SeqNr,
        up_to_seq_nr: SeqNr,
        support_resend: bool,
        via_timeout: bool,
    ) -> Self {
        debug_assert!(
            confirmed_seq_nr < up_to_seq_nr,
            "Request invariant violated: confirmed {confirmed_seq_nr} >= up_to {up_to_seq_nr}"
        );
        Self {
            confirmed_seq_nr,
            up_to_seq_nr,
            support_resend,
            via_timeout,
        }
    }
}

/// Cumulative acknowledgement with no new demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub confirmed_seq_nr: SeqNr,
}

impl Ack {
    #[must_use]
    pub fn new(confirmed_seq_nr: SeqNr) -> Self {
        Self { confirmed_seq_nr }
    }
}

/// Retransmission request: re-emit every buffered message `>= from_seq_nr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resend {
    pub from_seq_nr: SeqNr,
}

impl Resend {
    #[must_use]
    pub fn new(from_seq_nr: SeqNr) -> Self {
        Self { from_seq_nr }
    }
}

/// Demand notification to the user producer: "you may now submit exactly one
/// message". At most one is outstanding per producer at any moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestNext {
    pub producer_id: ProducerId,
    /// Next sequence number that will be assigned.
    pub current_seq_nr: SeqNr,
    /// Highest cumulatively confirmed sequence number (0 = none).
    pub confirmed_seq_nr: SeqNr,
}

// ============================================================================
// CONSUMER -> PRODUCER OPS
// ============================================================================

/// Protocol operations a consumer controller sends back to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerOp {
    Request(Request),
    Ack(Ack),
    Resend(Resend),
}

/// Clonable handle delivering [`ConsumerOp`]s into a controller's mailbox.
///
/// Stamped into every [`SequencedMessage`] as `reply_to` so the consumer side
/// can reach the controller that produced the message, including after a
/// consumer replacement.
#[derive(Clone)]
pub struct ControllerRef {
    deliver: Arc<dyn Fn(ConsumerOp) + Send + Sync>,
}

impl ControllerRef {
    /// Wrap a delivery function (typically a mailbox enqueue).
    pub fn new(deliver: impl Fn(ConsumerOp) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// A reference that drops every operation.
    ///
    /// Used by tests and by callers that drive a controller directly instead
    /// of through a mailbox.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(|_| {})
    }

    /// Deliver a demand grant / cumulative ack.
    pub fn request(&self, request: Request) {
        (self.deliver)(ConsumerOp::Request(request));
    }

    /// Deliver a cumulative ack.
    pub fn ack(&self, ack: Ack) {
        (self.deliver)(ConsumerOp::Ack(ack));
    }

    /// Deliver a retransmission request.
    pub fn resend(&self, resend: Resend) {
        (self.deliver)(ConsumerOp::Resend(resend));
    }
}

impl fmt::Debug for ControllerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ControllerRef(..)")
    }
}

// ============================================================================
// ENDPOINT SEAMS
// ============================================================================

/// Outbound seam toward the current consumer endpoint.
///
/// Delivery is fire-and-forget: the transport may lose, duplicate, or reorder
/// messages, and recovery is the protocol's job, not the endpoint's.
/// `RegisterConsumer` replaces the controller's endpoint object wholesale.
pub trait ConsumerEndpoint<A>: Send {
    fn deliver(&self, msg: SequencedMessage<A>);
}

/// Shared endpoints (e.g. handed out by service discovery) deliver through
/// the inner endpoint.
impl<A, E: ConsumerEndpoint<A> + Sync + ?Sized> ConsumerEndpoint<A> for Arc<E> {
    fn deliver(&self, msg: SequencedMessage<A>) {
        (**self).deliver(msg);
    }
}

/// Reverse seam toward the user producer.
///
/// Receives [`RequestNext`] notifications; rebindable via `Start`.
pub trait ProducerHandle: Send {
    fn request_next(&self, next: RequestNext);
}

/// Plain channel senders work as producer handles.
impl ProducerHandle for Sender<RequestNext> {
    fn request_next(&self, next: RequestNext) {
        // The producer side may already be gone; termination is observed
        // elsewhere, so a failed notify is not an error here.
        let _ = self.send(next);
    }
}

// ============================================================================
// TESTS
// ============================================================================
