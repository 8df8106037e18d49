//! Turns one outbound message into MTU-sized reliable datagrams.

use crate::datagram::{Datagram, DATAGRAM_HEADER_SIZE};
use crate::fragment::{
    Fragment, SplitInfo, BASE_HEADER_SIZE, RELIABLE_HEADER_SIZE, SPLIT_HEADER_SIZE,
};
use crate::{FragmentError, Reliability, DATAGRAM_OVERHEAD, U24_MASK};
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};

const SPLIT_FRAGMENT_HEADER: usize = BASE_HEADER_SIZE + RELIABLE_HEADER_SIZE + SPLIT_HEADER_SIZE;

/// Monotonic 24-bit counter shared by every sender on a connection.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU32);

impl SequenceCounter {
    pub fn new(start: u32) -> Self {
        Self(AtomicU32::new(start))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) & U24_MASK
    }

    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::Relaxed) & U24_MASK
    }
}

pub struct Fragmenter<'a> {
    mtu: u16,
    reliable_index: &'a SequenceCounter,
    datagram_sequence: &'a SequenceCounter,
}

impl<'a> Fragmenter<'a> {
    pub fn new(
        mtu: u16,
        reliable_index: &'a SequenceCounter,
        datagram_sequence: &'a SequenceCounter,
    ) -> Self {
        Self {
            mtu,
            reliable_index,
            datagram_sequence,
        }
    }

    /// Encoded bytes a single datagram may occupy.
    pub fn budget(&self) -> usize {
        self.mtu.saturating_sub(DATAGRAM_OVERHEAD) as usize
    }

    /// Largest payload slice that still fits one split fragment in one datagram.
    pub fn max_chunk(&self) -> Result<usize, FragmentError> {
        let budget = self.budget();
        if budget <= DATAGRAM_HEADER_SIZE + SPLIT_FRAGMENT_HEADER {
            return Err(FragmentError::MtuTooSmall { mtu: self.mtu });
        }
        Ok(budget - DATAGRAM_HEADER_SIZE - SPLIT_FRAGMENT_HEADER)
    }

    /// Fragments `payload` as `Reliable` and packs the fragments into datagrams.
    ///
    /// Every fragment draws the next reliability number and every datagram the
    /// next sequence number. Split messages share one random part id.
    pub fn fragment<R: Rng>(
        &self,
        payload: Bytes,
        rng: &mut R,
    ) -> Result<Vec<Datagram>, FragmentError> {
        let fragments = self.split(payload, rng)?;
        self.pack(fragments)
    }

    fn split<R: Rng>(
        &self,
        payload: Bytes,
        rng: &mut R,
    ) -> Result<Vec<Fragment>, FragmentError> {
        let chunk = self.max_chunk()?;
        let part_count = payload.len().div_ceil(chunk).max(1);
        let part_id: u16 = if part_count > 1 { rng.gen() } else { 0 };

        let mut fragments = Vec::with_capacity(part_count);
        for part_index in 0..part_count {
            let start = part_index * chunk;
            let end = (start + chunk).min(payload.len());
            let mut fragment = Fragment::new(Reliability::Reliable, payload.slice(start..end));
            fragment.reliable_index = self.reliable_index.next();
            if part_count > 1 {
                fragment.split = Some(SplitInfo {
                    part_count: part_count as u32,
                    part_id,
                    part_index: part_index as u32,
                });
            }
            fragments.push(fragment);
        }
        Ok(fragments)
    }

    fn pack(&self, fragments: Vec<Fragment>) -> Result<Vec<Datagram>, FragmentError> {
        let budget = self.budget();
        let mut datagrams = Vec::new();
        let mut current: Vec<Fragment> = Vec::new();
        let mut size = DATAGRAM_HEADER_SIZE;

        for fragment in fragments {
            let len = fragment.encoded_len();
            if DATAGRAM_HEADER_SIZE + len > budget {
                return Err(FragmentError::FragmentTooLarge { size: len, budget });
            }
            if size + len > budget && !current.is_empty() {
                let full = std::mem::take(&mut current);
                datagrams.push(Datagram::new(self.datagram_sequence.next(), full));
                size = DATAGRAM_HEADER_SIZE;
            }
            size += len;
            current.push(fragment);
        }
        if !current.is_empty() {
            datagrams.push(Datagram::new(self.datagram_sequence.next(), current));
        }
        Ok(datagrams)
    }
}
