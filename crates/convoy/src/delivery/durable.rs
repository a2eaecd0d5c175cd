// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable producer queue seam.
//!
//! Backend-agnostic interface for persisting sent-but-unconfirmed messages so
//! a controller can resume after a crash. In durable mode confirmation
//! replies fire once a message is persisted, not once the consumer processed
//! it: durability upstream is the confirmation contract for at-least-once
//! pipelines.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use super::messages::SeqNr;
use crate::{Error, Result};

/// A persisted sent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage<A> {
    /// Assigned sequence number.
    pub seq_nr: SeqNr,
    /// Application payload.
    pub payload: A,
    /// Whether the submitter asked for an explicit confirmation.
    pub ack_requested: bool,
}

/// State recovered from the durable queue at controller (re)creation.
#[derive(Debug, Clone)]
pub struct DurableState<A> {
    /// Next sequence number to assign.
    pub current_seq_nr: SeqNr,
    /// Sent messages that were never confirmed, in ascending seq order.
    /// Replayed through the normal resend path once a consumer registers.
    pub unconfirmed: Vec<StoredMessage<A>>,
}

impl<A> DurableState<A> {
    /// Fresh state: nothing sent, nothing to replay.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            current_seq_nr: 1,
            unconfirmed: Vec::new(),
        }
    }
}

/// Durable queue trait.
///
/// # Implementations
///
/// - [`InMemoryDurableQueue`] -- reference implementation, process-local
/// - SQL / log-structured backends are expected to live in their own crates
///
/// Every method is synchronous from the controller's point of view: a
/// successful return *is* the store's acknowledgement.
pub trait DurableQueue<A>: Send {
    /// Persist a newly sent message.
    fn store_message_sent(&mut self, message: StoredMessage<A>) -> Result<()>;

    /// Persist that everything up to and including `seq_nr` is confirmed.
    fn store_message_confirmed(&mut self, seq_nr: SeqNr) -> Result<()>;

    /// Recover the persisted state (used once, at controller creation).
    fn load_state(&mut self) -> Result<DurableState<A>>;
}

// ============================================================================
// IN-MEMORY REFERENCE IMPLEMENTATION
// ============================================================================

#[derive(Debug)]
struct QueueInner<A> {
    current_seq_nr: SeqNr,
    confirmed_seq_nr: SeqNr,
    unconfirmed: Vec<StoredMessage<A>>,
}

/// Process-local durable queue.
///
/// Clones share the same underlying state, so a test (or a supervisor
/// recreating a crashed controller) can keep a handle and hand out another.
#[derive(Debug)]
pub struct InMemoryDurableQueue<A> {
    inner: Arc<Mutex<QueueInner<A>>>,
}

impl<A> Clone for InMemoryDurableQueue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> Default for InMemoryDurableQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> InMemoryDurableQueue<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                current_seq_nr: 1,
                confirmed_seq_nr: 0,
                unconfirmed: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueInner<A>>> {
        self.inner
            .lock()
            .map_err(|_| Error::Durable("in-memory queue lock poisoned".into()))
    }

    /// Highest confirmed sequence number recorded so far.
    pub fn confirmed_seq_nr(&self) -> SeqNr {
        self.lock().map(|inner| inner.confirmed_seq_nr).unwrap_or(0)
    }

    /// Number of persisted unconfirmed messages.
    pub fn unconfirmed_len(&self) -> usize {
        self.lock().map(|inner| inner.unconfirmed.len()).unwrap_or(0)
    }
}

impl<A: Clone + Send> DurableQueue<A> for InMemoryDurableQueue<A> {
    fn store_message_sent(&mut self, message: StoredMessage<A>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.current_seq_nr = inner.current_seq_nr.max(message.seq_nr + 1);
        inner.unconfirmed.push(message);
        Ok(())
    }

    fn store_message_confirmed(&mut self, seq_nr: SeqNr) -> Result<()> {
        let mut inner = self.lock()?;
        if seq_nr > inner.confirmed_seq_nr {
            inner.confirmed_seq_nr = seq_nr;
            inner.unconfirmed.retain(|m| m.seq_nr > seq_nr);
        }
        Ok(())
    }

    fn load_state(&mut self) -> Result<DurableState<A>> {
        let inner = self.lock()?;
        Ok(DurableState {
            current_seq_nr: inner.current_seq_nr,
            unconfirmed: inner.unconfirmed.clone(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
