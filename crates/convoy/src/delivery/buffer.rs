// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unconfirmed-message window and confirmation-reply bookkeeping.
//!
//! The resend buffer holds every sent-but-unconfirmed message for
//! retransmission. Whether a buffer exists at all is part of the protocol
//! mode: a consumer that declares `support_resend = false` runs the
//! controller in [`ResendBuffer::Disabled`], where `Resend` is rejected and
//! nothing is retained.

use std::collections::VecDeque;

use super::messages::{ConfirmationReply, SeqNr, SequencedMessage};

// ============================================================================
// RESEND BUFFER
// ============================================================================

/// Window of sent, unconfirmed messages.
///
/// Invariant (when `Enabled` and non-empty): sequence numbers are strictly
/// increasing contiguous integers from `confirmed_seq_nr + 1` up to
/// `current_seq_nr - 1`. Confirmation is the only trimming path.
#[derive(Debug)]
pub enum ResendBuffer<A> {
    /// The consumer may request retransmissions; keep everything unconfirmed.
    Enabled(VecDeque<SequencedMessage<A>>),
    /// The consumer declared `support_resend = false`; retain nothing.
    Disabled,
}

impl<A> ResendBuffer<A> {
    /// Empty buffer in the given mode.
    #[must_use]
    pub fn new(support_resend: bool) -> Self {
        if support_resend {
            Self::Enabled(VecDeque::new())
        } else {
            Self::Disabled
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    /// Number of retained messages (0 in disabled mode).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Enabled(queue) => queue.len(),
            Self::Disabled => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the earliest retained message.
    #[must_use]
    pub fn head_seq_nr(&self) -> Option<SeqNr> {
        match self {
            Self::Enabled(queue) => queue.front().map(|m| m.seq_nr),
            Self::Disabled => None,
        }
    }

    /// Earliest retained message.
    #[must_use]
    pub fn head(&self) -> Option<&SequencedMessage<A>> {
        match self {
            Self::Enabled(queue) => queue.front(),
            Self::Disabled => None,
        }
    }

    /// Retain a sent message. No-op in disabled mode.
    pub fn push(&mut self, msg: SequencedMessage<A>) {
        if let Self::Enabled(queue) = self {
            debug_assert!(
                queue.back().is_none_or(|m| m.seq_nr + 1 == msg.seq_nr),
                "resend buffer must stay contiguous"
            );
            queue.push_back(msg);
        }
    }

    /// Drop the confirmed prefix (`seq_nr <= confirmed`).
    pub fn drop_confirmed(&mut self, confirmed: SeqNr) {
        if let Self::Enabled(queue) = self {
            while queue.front().is_some_and(|m| m.seq_nr <= confirmed) {
                queue.pop_front();
            }
        }
    }

    /// Messages with `seq_nr >= from`, in order. Entries below `from` stay
    /// buffered; they remain retransmittable until confirmed.
    pub fn suffix_from(&self, from: SeqNr) -> impl Iterator<Item = &SequencedMessage<A>> {
        let queue = match self {
            Self::Enabled(queue) => Some(queue),
            Self::Disabled => None,
        };
        queue
            .into_iter()
            .flatten()
            .skip_while(move |m| m.seq_nr < from)
    }

    /// All retained messages, in order.
    pub fn iter(&self) -> impl Iterator<Item = &SequencedMessage<A>> {
        self.suffix_from(0)
    }

    /// Reconcile the buffer mode with the consumer's latest declaration.
    ///
    /// Switching to `support_resend = false` discards the window. Switching
    /// back to `true` starts from an empty window: messages sent before this
    /// point are irrecoverable and must not be buffered retroactively.
    pub fn reconcile(&mut self, support_resend: bool) {
        match (support_resend, self.is_enabled()) {
            (false, true) => *self = Self::Disabled,
            (true, false) => *self = Self::Enabled(VecDeque::new()),
            _ => {}
        }
    }

    /// Consume the buffer, yielding the retained messages in order.
    #[must_use]
    pub fn into_messages(self) -> Vec<SequencedMessage<A>> {
        match self {
            Self::Enabled(queue) => queue.into_iter().collect(),
            Self::Disabled => Vec::new(),
        }
    }
}

// ============================================================================
// PENDING REPLIES
// ============================================================================

/// Confirmation replies awaiting their sequence number to be confirmed.
///
/// Insertions are strictly monotonic in `seq_nr` and extraction is always a
/// prefix, so an ordered queue beats a map + filter-sort here.
#[derive(Debug, Default)]
pub struct PendingReplies {
    entries: VecDeque<(SeqNr, ConfirmationReply)>,
}

impl PendingReplies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a reply for `seq_nr`.
    pub fn insert(&mut self, seq_nr: SeqNr, reply: ConfirmationReply) {
        debug_assert!(
            self.entries.back().is_none_or(|(last, _)| *last < seq_nr),
            "pending replies must be inserted in ascending seq order"
        );
        self.entries.push_back((seq_nr, reply));
    }

    /// Remove and return every entry with `seq_nr <= confirmed`, ascending.
    pub fn take_confirmed(&mut self, confirmed: SeqNr) -> Vec<(SeqNr, ConfirmationReply)> {
        let mut taken = Vec::new();
        while self.entries.front().is_some_and(|(seq, _)| *seq <= confirmed) {
            if let Some(entry) = self.entries.pop_front() {
                taken.push(entry);
            }
        }
        taken
    }

    /// Remove and return the reply registered for exactly `seq_nr`, if any.
    pub fn take_exact(&mut self, seq_nr: SeqNr) -> Option<ConfirmationReply> {
        let idx = self.entries.iter().position(|(seq, _)| *seq == seq_nr)?;
        self.entries.remove(idx).map(|(_, reply)| reply)
    }
}

// ============================================================================
// TESTS
// ============================================================================
