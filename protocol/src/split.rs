//! Reassembly of split messages keyed by their part id.

use crate::fragment::Fragment;
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const SPLIT_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_SPLIT_PARTS: u32 = 1024;

#[derive(Debug)]
struct Composition {
    parts: Vec<Option<Fragment>>,
    received: usize,
    expires_at: Instant,
}

impl Composition {
    fn new(part_count: u32, now: Instant, timeout: Duration) -> Self {
        Self {
            parts: vec![None; part_count as usize],
            received: 0,
            expires_at: now + timeout,
        }
    }
}

/// Collects split fragments until every part of a message has arrived.
///
/// Shared between the owning connection loop and its maintenance tick, so
/// all state sits behind a mutex.
#[derive(Debug)]
pub struct SplitAssembler {
    compositions: Mutex<HashMap<u16, Composition>>,
    timeout: Duration,
}

impl Default for SplitAssembler {
    fn default() -> Self {
        Self::new(SPLIT_TIMEOUT)
    }
}

impl SplitAssembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            compositions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn accept(&self, fragment: Fragment) -> Option<Vec<Fragment>> {
        self.accept_at(fragment, Instant::now())
    }

    /// Stores one part; returns every part ordered by index once the set is complete.
    ///
    /// Fragments without split metadata, indexes outside the declared part
    /// count and oversized part counts are dropped with a debug log.
    pub fn accept_at(&self, fragment: Fragment, now: Instant) -> Option<Vec<Fragment>> {
        let Some(split) = fragment.split else {
            debug!("Ignoring fragment without split metadata");
            return None;
        };
        if split.part_count == 0 || split.part_count > MAX_SPLIT_PARTS {
            debug!(
                "Rejecting split {} with {} parts",
                split.part_id, split.part_count
            );
            return None;
        }

        let mut compositions = self.compositions.lock().unwrap_or_else(|e| e.into_inner());
        let composition = compositions
            .entry(split.part_id)
            .or_insert_with(|| Composition::new(split.part_count, now, self.timeout));

        let index = split.part_index as usize;
        if split.part_index >= split.part_count || index >= composition.parts.len() {
            debug!(
                "Split {} part index {} out of range ({} parts)",
                split.part_id,
                split.part_index,
                composition.parts.len()
            );
            return None;
        }

        if composition.parts[index].is_none() {
            composition.received += 1;
        }
        composition.parts[index] = Some(fragment);

        if composition.received < composition.parts.len() {
            return None;
        }

        let complete = compositions.remove(&split.part_id)?;
        Some(complete.parts.into_iter().flatten().collect())
    }

    pub fn collect(&self) {
        self.collect_at(Instant::now());
    }

    /// Drops every composition whose expiry is not after `now`.
    pub fn collect_at(&self, now: Instant) {
        let mut compositions = self.compositions.lock().unwrap_or_else(|e| e.into_inner());
        compositions.retain(|part_id, composition| {
            let keep = composition.expires_at > now;
            if !keep {
                debug!(
                    "Dropping incomplete split {} ({}/{} parts)",
                    part_id,
                    composition.received,
                    composition.parts.len()
                );
            }
            keep
        });
    }

    pub fn pending(&self) -> usize {
        self.compositions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{join_payloads, SplitInfo};
    use crate::Reliability;
    use bytes::Bytes;

    fn part(part_id: u16, part_count: u32, part_index: u32, payload: &'static [u8]) -> Fragment {
        let mut fragment = Fragment::new(Reliability::Reliable, Bytes::from_static(payload));
        fragment.split = Some(SplitInfo {
            part_count,
            part_id,
            part_index,
        });
        fragment
    }

    #[test]
    fn test_completes_in_any_order() {
        let assembler = SplitAssembler::default();
        let now = Instant::now();

        assert!(assembler.accept_at(part(7, 3, 2, b"c"), now).is_none());
        assert!(assembler.accept_at(part(7, 3, 0, b"a"), now).is_none());
        let parts = assembler.accept_at(part(7, 3, 1, b"b"), now).unwrap();

        assert_eq!(&join_payloads(&parts)[..], b"abc");
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_duplicate_part_does_not_complete() {
        let assembler = SplitAssembler::default();
        let now = Instant::now();

        assert!(assembler.accept_at(part(1, 2, 0, b"a"), now).is_none());
        assert!(assembler.accept_at(part(1, 2, 0, b"a"), now).is_none());
        assert_eq!(assembler.pending(), 1);
        assert!(assembler.accept_at(part(1, 2, 1, b"b"), now).is_some());
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let assembler = SplitAssembler::default();
        let now = Instant::now();

        assert!(assembler.accept_at(part(2, 2, 5, b"x"), now).is_none());
        assert!(assembler.accept_at(part(2, 2, 0, b"a"), now).is_none());
        assert!(assembler.accept_at(part(2, 2, 1, b"b"), now).is_some());
    }

    #[test]
    fn test_oversized_part_count_rejected() {
        let assembler = SplitAssembler::default();
        assert!(assembler
            .accept_at(part(3, MAX_SPLIT_PARTS + 1, 0, b"x"), Instant::now())
            .is_none());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_unsplit_fragment_ignored() {
        let assembler = SplitAssembler::default();
        let fragment = Fragment::new(Reliability::Reliable, Bytes::from_static(b"x"));
        assert!(assembler.accept(fragment).is_none());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_collect_purges_expired() {
        let assembler = SplitAssembler::default();
        let start = Instant::now();

        assembler.accept_at(part(4, 2, 0, b"a"), start);
        assembler.collect_at(start + Duration::from_millis(500));
        assert_eq!(assembler.pending(), 1);

        assembler.collect_at(start + SPLIT_TIMEOUT);
        assert_eq!(assembler.pending(), 0);

        // the late part starts a fresh composition instead of completing
        assert!(assembler
            .accept_at(part(4, 2, 1, b"b"), start + SPLIT_TIMEOUT)
            .is_none());
    }
}
