/*
Copyright 2026 The hwqueue Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Queue pairs and completion dispatch.
//!
//! A [`QueuePair`] couples one submission queue with the completion queue
//! reporting on it. [`QueuePair::poll`] returns a lazy iterator that, for
//! each entry the device has handed over:
//!
//! 1. checks for the error layout before reading anything else,
//! 2. checks that the entry belongs to this pair and direction,
//! 3. resolves the referenced slot and takes back its pending buffer,
//! 4. returns the entry to the device and publishes the new consumer.
//!
//! Entries failing 2 or 3 are logged and dropped as corrupted; the walk
//! continues with the next one. The iterator borrows the pair mutably, so
//! polls cannot nest and nothing can be posted while one is in progress.

use crate::allocator::QueueNumber;
use crate::cq::{CompletionEvent, CompletionQueue};
use crate::entry::CompletionEntry;
use crate::error::{DeviceStatus, PostError, QueueError};
use crate::platform::{DmaBuffer, Platform};
use crate::sq::SubmissionQueue;

/// Direction of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Tx,
    Rx,
}

/// Device-side state of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
}

#[derive(Debug)]
pub struct QueuePair<B> {
    kind: QueueKind,
    number: QueueNumber,
    sq: SubmissionQueue<B>,
    cq: CompletionQueue,
    state: QpState,
}

impl<B> QueuePair<B> {
    pub(crate) fn new(
        kind: QueueKind,
        number: QueueNumber,
        sq: SubmissionQueue<B>,
        cq: CompletionQueue,
    ) -> Self {
        Self {
            kind,
            number,
            sq,
            cq,
            state: QpState::Reset,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn number(&self) -> QueueNumber {
        self.number
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: QpState) {
        log::debug!(
            "{:?} queue {:#x}: {:?} -> {:?}",
            self.kind,
            self.number.hw(),
            self.state,
            state
        );
        self.state = state;
    }

    pub fn sq(&self) -> &SubmissionQueue<B> {
        &self.sq
    }

    pub fn cq(&self) -> &CompletionQueue {
        &self.cq
    }

    pub(crate) fn sq_mut(&mut self) -> &mut SubmissionQueue<B> {
        &mut self.sq
    }

    pub(crate) fn cq_mut(&mut self) -> &mut CompletionQueue {
        &mut self.cq
    }

    pub(crate) fn into_parts(self) -> (QueueNumber, SubmissionQueue<B>, CompletionQueue) {
        (self.number, self.sq, self.cq)
    }

    pub fn in_flight(&self) -> u32 {
        self.sq.in_flight()
    }

    pub fn is_full(&self) -> bool {
        self.sq.is_full()
    }

    /// Whether the device accepts new submissions in the current state.
    /// Receive buffers may be posted from Init on; sends need ReadyToSend.
    pub fn accepts_posts(&self) -> bool {
        match self.kind {
            QueueKind::Tx => self.state == QpState::ReadyToSend,
            QueueKind::Rx => self.state != QpState::Reset,
        }
    }
}

impl<B: DmaBuffer> QueuePair<B> {
    /// Post `buffer` to the submission queue.
    pub fn post<P: Platform>(&mut self, platform: &P, buffer: B) -> Result<u32, PostError<B>> {
        if !self.accepts_posts() {
            return Err(PostError::new(QueueError::InvalidState, buffer));
        }
        self.sq.post(platform, buffer)
    }

    /// Drain completions the device has produced so far.
    pub fn poll<'a, P: Platform>(&'a mut self, platform: &'a P) -> Completions<'a, P, B> {
        Completions {
            qp: self,
            platform,
            done: false,
        }
    }

    /// Cancel every outstanding submission, oldest first.
    pub fn cancel_all(&mut self) -> impl Iterator<Item = CompletionEvent<B>> + use<B> {
        let kind = self.kind;
        self.sq
            .drain_pending()
            .into_iter()
            .map(move |buffer| CompletionEvent::cancelled(kind, buffer))
    }

    fn dispatch<P: Platform>(
        &mut self,
        platform: &P,
        entry: &CompletionEntry,
    ) -> Result<CompletionEvent<B>, &'static str> {
        let error = entry.is_error();
        let is_send = entry.is_send().ok_or("unknown opcode")?;
        if entry.qpn != self.number.hw() {
            return Err("foreign queue number");
        }
        if is_send != (self.kind == QueueKind::Tx) {
            return Err("wrong direction");
        }

        let slot = self
            .sq
            .slot_for_completion(platform, entry.wqe)
            .ok_or("work entry reference out of range")?;
        let buffer = self.sq.reclaim(slot).ok_or("no pending submission")?;

        let result = if error {
            let s = entry.syndrome();
            log::debug!(
                "{:?} queue {:#x} slot {}: error syndrome {:#x} vendor {:#x}",
                self.kind,
                self.number.hw(),
                slot,
                s.syndrome,
                s.vendor
            );
            Err(QueueError::DeviceError(DeviceStatus::from_syndrome(
                s.syndrome, s.vendor,
            )))
        } else {
            Ok(entry.byte_count)
        };

        Ok(CompletionEvent {
            kind: self.kind,
            buffer,
            result,
        })
    }
}

/// Iterator over ready completions of one queue pair.
///
/// Each step consumes exactly one completion entry. Dropping the iterator
/// early leaves the rest for the next poll.
pub struct Completions<'a, P, B> {
    qp: &'a mut QueuePair<B>,
    platform: &'a P,
    done: bool,
}

impl<P: Platform, B: DmaBuffer> Iterator for Completions<'_, P, B> {
    type Item = CompletionEvent<B>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let entry = match self.qp.cq.peek(self.platform) {
                Ok(Some(entry)) => entry,
                Ok(None) => return None,
                Err(e) => {
                    log::error!("completion queue {:#x}: {}", self.qp.number.hw(), e);
                    self.done = true;
                    return None;
                }
            };

            let event = self.qp.dispatch(self.platform, &entry);
            if let Err(e) = self.qp.cq.consume(self.platform) {
                log::error!("completion queue {:#x}: {}", self.qp.number.hw(), e);
                self.done = true;
            }

            match event {
                Ok(event) => return Some(event),
                Err(reason) => log::warn!(
                    "{:?} queue {:#x}: dropping corrupted completion ({}): {:?}",
                    self.qp.kind,
                    self.qp.number.hw(),
                    reason,
                    entry
                ),
            }
        }
        None
    }
}
