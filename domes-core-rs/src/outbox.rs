//! Outgoing frame queue
//!
//! Services never touch the transport. They push payloads here and the
//! coordinator drains the queue after each input, stamping the header and
//! handing frames to the transport.

use crate::codec::Payload;
use crate::types::PodAddr;

/// Where a frame goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(PodAddr),
    Broadcast,
}

/// A queued frame, header not yet stamped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub dest: Destination,
    pub seq: u16,
    pub payload: Payload,
}

/// Sequence allocator plus pending frames
#[derive(Debug, Default)]
pub struct Outbox {
    next_seq: u16,
    frames: Vec<Outgoing>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a unicast frame, returning its sequence number
    pub fn send(&mut self, to: PodAddr, payload: Payload) -> u16 {
        self.push(Destination::Unicast(to), payload)
    }

    /// Queue a broadcast frame, returning its sequence number
    pub fn broadcast(&mut self, payload: Payload) -> u16 {
        self.push(Destination::Broadcast, payload)
    }

    /// Queue a frame under an already-used sequence number (event retries)
    pub fn resend(&mut self, to: PodAddr, seq: u16, payload: Payload) {
        self.frames.push(Outgoing {
            dest: Destination::Unicast(to),
            seq,
            payload,
        });
    }

    fn push(&mut self, dest: Destination, payload: Payload) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.frames.push(Outgoing { dest, seq, payload });
        seq
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Take every queued frame in queue order
    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.frames)
    }

    /// Queued frames, oldest first
    pub fn frames(&self) -> &[Outgoing] {
        &self.frames
    }
}
