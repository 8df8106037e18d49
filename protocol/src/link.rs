//! Per-direction reliability state of one RakNet connection.

use crate::ack::{compress, AckPacket, Range};
use crate::fragment::join_payloads;
use crate::{
    Datagram, DecodeError, FragmentError, Fragmenter, RetransmissionTracker, RetransmitPlan,
    SequenceCounter, SplitAssembler,
};
use bytes::Bytes;
use log::trace;
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Instant;

/// Counters, retransmission tracking, split reassembly and pending ACKs
/// for one peer.
#[derive(Debug)]
pub struct ReliableLink {
    mtu: u16,
    reliable_index: SequenceCounter,
    datagram_sequence: SequenceCounter,
    tracker: RetransmissionTracker,
    splits: SplitAssembler,
    received: Mutex<BTreeSet<u32>>,
}

impl ReliableLink {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu,
            reliable_index: SequenceCounter::default(),
            datagram_sequence: SequenceCounter::default(),
            tracker: RetransmissionTracker::new(),
            splits: SplitAssembler::default(),
            received: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    pub fn tracker(&self) -> &RetransmissionTracker {
        &self.tracker
    }

    pub fn splits(&self) -> &SplitAssembler {
        &self.splits
    }

    /// Cuts an application payload into reliable datagrams, not yet registered.
    pub fn fragment<R: Rng>(
        &self,
        payload: Bytes,
        rng: &mut R,
    ) -> Result<Vec<Datagram>, FragmentError> {
        Fragmenter::new(self.mtu, &self.reliable_index, &self.datagram_sequence)
            .fragment(payload, rng)
    }

    pub fn register(&self, datagram: Datagram) -> bool {
        self.tracker.register(datagram)
    }

    pub fn receive(&self, data: &[u8]) -> Result<Vec<Bytes>, DecodeError> {
        self.receive_at(data, Instant::now())
    }

    /// Decodes a datagram, queues its sequence number for acknowledgment and
    /// returns every application payload it completes.
    pub fn receive_at(&self, data: &[u8], now: Instant) -> Result<Vec<Bytes>, DecodeError> {
        let datagram = Datagram::decode(data)?;
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(datagram.sequence);

        let mut payloads = Vec::with_capacity(datagram.fragments.len());
        for fragment in datagram.fragments {
            if fragment.split.is_none() {
                payloads.push(fragment.payload);
                continue;
            }
            if let Some(parts) = self.splits.accept_at(fragment, now) {
                trace!("Reassembled split message from {} parts", parts.len());
                payloads.push(join_payloads(&parts));
            }
        }
        Ok(payloads)
    }

    /// Drains the received sequence numbers into one ACK packet.
    pub fn take_ack(&self) -> Option<AckPacket> {
        let received = std::mem::take(&mut *self.received.lock().unwrap_or_else(|e| e.into_inner()));
        if received.is_empty() {
            return None;
        }
        let sorted: Vec<u32> = received.into_iter().collect();
        Some(AckPacket::ack(compress(&sorted)))
    }

    pub fn handle_ack(&self, ranges: &[Range]) -> usize {
        self.tracker.handle_ack(ranges)
    }

    pub fn handle_nak(&self, ranges: &[Range]) -> usize {
        self.tracker.handle_nak(ranges)
    }

    pub fn poll_retransmit(&self, now: Instant) -> RetransmitPlan {
        self.tracker.poll_at(now)
    }

    pub fn forget(&self, sequence: u32) -> bool {
        self.tracker.forget(sequence)
    }

    pub fn collect_splits(&self, now: Instant) {
        self.splits.collect_at(now);
    }
}
