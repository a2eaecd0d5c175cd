// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Sequenced delivery protocol (producer side)
//!
//! Implements the per-producer delivery controller: sequencing, sliding-window
//! flow control, gap-triggered retransmission, and at-least-once confirmation
//! bookkeeping over a lossy transport.
//!
//! ## Protocol Flow
//!
//! ```text
//! Producer                    ProducerController                 Consumer
//!   |                               |                               |
//!   |<------ RequestNext(1, 0) ----|                               |
//!   |--- Msg ---------------------->|--- Sequenced(1, first) ----->|
//!   |                               |<-- Request(conf=1, upTo=10) --|
//!   |<------ RequestNext(2, 1) ----|                               |
//!   |--- Msg ---------------------->|--- Sequenced(2) --X (lost)   |
//!   |--- Msg ---------------------->|--- Sequenced(3) ------------>|
//!   |                               |<-- Resend(2) -----------------|
//!   |                               |--- Sequenced(2) ------------>|
//!   |                               |--- Sequenced(3) ------------>|
//! ```
//!
//! The first message of a session is sent *without* a preceding `Request`;
//! its `first` flag (re-emitted by the periodic resend timer until answered)
//! bootstraps the consumer's request loop.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`ProducerController`] | The sequenced-delivery state machine |
//! | [`ResendBuffer`] | Unconfirmed-message window for retransmission |
//! | [`PendingReplies`] | Ordered confirmation-reply bookkeeping |
//! | [`DurableQueue`] | Optional persistence hook for crash recovery |
//! | [`ConsumerEndpoint`] / [`ProducerHandle`] | Rebindable outbound seams |

mod buffer;
mod durable;
mod messages;
mod producer;

pub use buffer::{PendingReplies, ResendBuffer};
pub use durable::{DurableQueue, DurableState, InMemoryDurableQueue, StoredMessage};
pub use messages::{
    Ack, ConfirmationReply, ConsumerEndpoint, ConsumerOp, ControllerRef, ProducerHandle,
    ProducerId, Request, RequestNext, Resend, SeqNr, SequencedMessage,
};
pub use producer::ProducerController;
