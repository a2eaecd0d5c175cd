// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Convoy - Reliable, Flow-Controlled Message Delivery
//!
//! Producer-side delivery core for point-to-point and work-pulling topologies
//! on top of an unreliable, unordered, best-effort message transport.
//!
//! ## Overview
//!
//! Convoy guarantees at-least-once, in-order delivery from one logical
//! producer to a consumer endpoint (or a dynamic pool of worker endpoints)
//! even when the transport loses, duplicates, or reorders messages.
//!
//! ## Protocol Flow
//!
//! ```text
//! Producer                 Controller                        Consumer
//!    |                         |                                |
//!    |<-- RequestNext ---------|                                |
//!    |--- Msg("a") ----------->|--- Sequenced(seq=1, first) --->|
//!    |<-- RequestNext ---------|<-- Request(conf=1, upTo=10) ---|
//!    |--- Msg("b") ----------->|--- Sequenced(seq=2) --X (lost) |
//!    |--- Msg("c") ----------->|--- Sequenced(seq=3) ---------->|
//!    |                         |<-- Resend(2) ------------------|  (gap!)
//!    |                         |--- Sequenced(seq=2) ---------->|
//!    |                         |--- Sequenced(seq=3) ---------->|
//! ```
//!
//! Demand flows consumer -> producer: the controller notifies the producer
//! with one [`RequestNext`](delivery::RequestNext) at a time, and the
//! producer submits exactly one message per notification. Lost messages are
//! recovered from the controller's resend buffer, triggered either by an
//! explicit [`Resend`](delivery::Resend), by a timed-out
//! [`Request`](delivery::Request), or by the periodic first-message resend
//! timer that bootstraps a silent consumer.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`ProducerController`](delivery::ProducerController) | Per-producer sequencing, flow control, retransmission |
//! | [`WorkPullingRouter`](work_pulling::WorkPullingRouter) | Fans one producer out over a dynamic worker pool |
//! | [`DurableQueue`](delivery::DurableQueue) | Optional persistence hook for crash recovery |
//! | [`ServiceRegistry`](work_pulling::ServiceRegistry) | Supplies the current worker set |
//! | [`runtime`] | Single-threaded event-loop drivers and handles |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use convoy::config::DeliveryConfig;
//! use convoy::runtime::ProducerControllerDriver;
//!
//! let driver = ProducerControllerDriver::<String>::spawn("orders-1", DeliveryConfig::default());
//! let handle = driver.handle();
//! // handle.start(..) / handle.register_consumer(..) bind the two sides,
//! // then submit one message per RequestNext notification:
//! handle.send("first order".to_string());
//! ```
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: unconfirmed messages are retransmitted; consumers and
//!   rehomed workers may observe duplicates.
//! - **Per-producer ordering**: sequence numbers 1, 2, 3, ... without gaps;
//!   emission order is strictly increasing (the transport may still reorder).
//! - **Backpressure**: at most one outstanding `RequestNext` per producer.

pub mod config;
pub mod delivery;
pub mod runtime;
pub mod work_pulling;

use thiserror::Error;

pub use delivery::{
    Ack, ConsumerEndpoint, ControllerRef, DurableQueue, ProducerController, ProducerHandle,
    Request, RequestNext, Resend, SeqNr, SequencedMessage,
};
pub use work_pulling::{ServiceRegistry, WorkPullingRouter, WorkerStats};

/// Errors surfaced by the delivery core.
///
/// Variants in the "protocol violation" group are fatal: the component that
/// returned them must be considered terminated, and the user producer is
/// responsible for restarting it (re-bootstrapping via `Start`). Lost
/// messages, lost requests, and worker churn are *not* errors; they are
/// absorbed by the retransmission machinery.
#[derive(Debug, Error)]
pub enum Error {
    /// A message was submitted while no demand was outstanding.
    #[error("message submitted without outstanding demand (next seq {current}, granted up to {requested})")]
    NoDemand { current: SeqNr, requested: SeqNr },

    /// A `Resend` arrived although the consumer declared `support_resend = false`.
    #[error("resend from seq {0} requested, but the consumer declared support_resend = false")]
    ResendUnsupported(SeqNr),

    /// The work-pulling buffer is full; the producer outran its grants.
    #[error("work-pulling buffer overflow ({0} messages already queued)")]
    BufferOverflow(usize),

    /// The durable queue failed; delivery cannot proceed without persistence.
    #[error("durable queue failure: {0}")]
    Durable(String),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Convenient alias for API results using the crate [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
