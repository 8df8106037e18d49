//! Bookkeeping for reliable datagrams awaiting acknowledgment.
//!
//! The tracker never touches a socket. `poll_at` hands back the datagrams
//! that are due for another attempt and the ones given up on; the owning
//! connection performs the sends and reports transport failures through
//! [`RetransmissionTracker::forget`].

use crate::ack::Range;
use crate::Datagram;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Resend attempts allowed after the first transmission.
pub const MAX_RETRIES: u32 = 2;
const BACKOFF_BASE: u32 = 12;

/// `fib(0) = fib(1) = 1`, `fib(12) = 233`.
fn fib(n: u32) -> u64 {
    let (mut prev, mut next) = (0u64, 1u64);
    for _ in 0..n {
        let sum = prev + next;
        prev = next;
        next = sum;
    }
    next
}

/// Delay before the next resend of a datagram that has been retried `tries` times.
pub fn backoff(tries: u32) -> Duration {
    Duration::from_millis(fib(BACKOFF_BASE + tries))
}

#[derive(Debug)]
struct PendingSend {
    datagram: Datagram,
    sent_at: Instant,
    tries: u32,
}

/// Work produced by a retransmission pass.
#[derive(Debug, Default)]
pub struct RetransmitPlan {
    pub resend: Vec<Datagram>,
    pub lost: Vec<u32>,
}

impl RetransmitPlan {
    pub fn is_empty(&self) -> bool {
        self.resend.is_empty() && self.lost.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RetransmissionTracker {
    pending: Mutex<HashMap<u32, PendingSend>>,
}

impl RetransmissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, datagram: Datagram) -> bool {
        self.register_at(datagram, Instant::now())
    }

    /// Starts tracking a datagram just sent; a sequence number already tracked is ignored.
    pub fn register_at(&self, datagram: Datagram, now: Instant) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(&datagram.sequence) {
            debug!("Datagram {} is already tracked", datagram.sequence);
            return false;
        }
        pending.insert(
            datagram.sequence,
            PendingSend {
                datagram,
                sent_at: now,
                tries: 0,
            },
        );
        true
    }

    /// Stops tracking every sequence number inside the acknowledged ranges.
    pub fn handle_ack(&self, ranges: &[Range]) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for range in ranges {
            let before = pending.len();
            pending.retain(|sequence, _| !range.contains(*sequence));
            let acked = before - pending.len();
            removed += acked;
            let span = (range.max - range.min) as usize + 1;
            if acked < span {
                trace!(
                    "ACK for {}..={} named {} untracked datagrams",
                    range.min,
                    range.max,
                    span - acked
                );
            }
        }
        removed
    }

    /// Stops tracking every sequence number the peer reported missing.
    ///
    /// The named datagrams are dropped without a resend, so a NAK currently
    /// loses them outright. Likely a bug: a NAK should trigger a faster resend
    /// than the backoff pass.
    pub fn handle_nak(&self, ranges: &[Range]) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for range in ranges {
            let before = pending.len();
            pending.retain(|sequence, _| !range.contains(*sequence));
            let dropped = before - pending.len();
            if dropped == 0 {
                trace!("NAK for {}..={} names no tracked datagram", range.min, range.max);
            } else {
                debug!(
                    "NAK for {}..={} dropped {} datagrams",
                    range.min, range.max, dropped
                );
            }
            removed += dropped;
        }
        removed
    }

    pub fn poll(&self) -> RetransmitPlan {
        self.poll_at(Instant::now())
    }

    /// Collects datagrams whose backoff has elapsed.
    pub fn poll_at(&self, now: Instant) -> RetransmitPlan {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let due: Vec<u32> = pending
            .iter()
            .filter(|(_, entry)| entry.sent_at + backoff(entry.tries) < now)
            .map(|(sequence, _)| *sequence)
            .collect();

        let mut plan = RetransmitPlan::default();
        for sequence in due {
            Self::retry(&mut pending, sequence, now, &mut plan);
        }
        plan
    }

    fn retry(
        pending: &mut HashMap<u32, PendingSend>,
        sequence: u32,
        now: Instant,
        plan: &mut RetransmitPlan,
    ) {
        let Some(entry) = pending.get_mut(&sequence) else {
            return;
        };
        if entry.tries >= MAX_RETRIES {
            pending.remove(&sequence);
            warn!("Datagram {} lost after {} resends", sequence, MAX_RETRIES);
            plan.lost.push(sequence);
            return;
        }
        entry.tries += 1;
        entry.sent_at = now;
        plan.resend.push(entry.datagram.clone());
    }

    /// Drops a datagram whose resend failed at the transport level.
    pub fn forget(&self, sequence: u32) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let removed = pending.remove(&sequence).is_some();
        if removed {
            warn!("Datagram {} lost: resend failed", sequence);
        }
        removed
    }

    pub fn is_tracked(&self, sequence: u32) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(sequence: u32) -> Datagram {
        Datagram::new(sequence, Vec::new())
    }

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(backoff(0), Duration::from_millis(233));
        assert_eq!(backoff(1), Duration::from_millis(377));
        assert_eq!(backoff(2), Duration::from_millis(610));
    }

    #[test]
    fn test_duplicate_register_ignored() {
        let tracker = RetransmissionTracker::new();
        assert!(tracker.register(datagram(1)));
        assert!(!tracker.register(datagram(1)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_ack_removes_only_acked() {
        let tracker = RetransmissionTracker::new();
        for sequence in 1..=5 {
            tracker.register(datagram(sequence));
        }

        let removed = tracker.handle_ack(&[Range::new(2, 3), Range::single(9)]);

        assert_eq!(removed, 2);
        assert!(tracker.is_tracked(1));
        assert!(!tracker.is_tracked(2));
        assert!(!tracker.is_tracked(3));
        assert!(tracker.is_tracked(4));
        assert!(tracker.is_tracked(5));
    }

    #[test]
    fn test_unknown_ack_is_noop() {
        let tracker = RetransmissionTracker::new();
        tracker.register(datagram(1));
        assert_eq!(tracker.handle_ack(&[Range::new(100, 200)]), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_not_resent_before_backoff() {
        let tracker = RetransmissionTracker::new();
        let start = Instant::now();
        tracker.register_at(datagram(1), start);

        assert!(tracker.poll_at(start + Duration::from_millis(233)).is_empty());
        let plan = tracker.poll_at(start + Duration::from_millis(234));
        assert_eq!(plan.resend.len(), 1);
    }

    #[test]
    fn test_lost_after_two_resends() {
        let tracker = RetransmissionTracker::new();
        let mut now = Instant::now();
        tracker.register_at(datagram(7), now);
        let mut sends = 1;

        for _ in 0..10 {
            now += Duration::from_millis(1000);
            let plan = tracker.poll_at(now);
            sends += plan.resend.len();
            if !plan.lost.is_empty() {
                assert_eq!(plan.lost, vec![7]);
                break;
            }
        }

        assert_eq!(sends, 3);
        assert!(!tracker.is_tracked(7));
        assert!(tracker.poll_at(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_nak_drops_without_resend() {
        let tracker = RetransmissionTracker::new();
        let start = Instant::now();
        tracker.register_at(datagram(3), start);
        tracker.register_at(datagram(4), start);

        assert_eq!(tracker.handle_nak(&[Range::single(3)]), 1);
        assert!(!tracker.is_tracked(3));
        assert!(tracker.is_tracked(4));

        let plan = tracker.poll_at(start + Duration::from_secs(1));
        assert_eq!(plan.resend.len(), 1);
        assert_eq!(plan.resend[0].sequence, 4);
        assert!(plan.lost.is_empty());
    }

    #[test]
    fn test_unknown_nak_is_noop() {
        let tracker = RetransmissionTracker::new();
        tracker.register(datagram(1));
        assert_eq!(tracker.handle_nak(&[Range::new(50, 60)]), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_forget_after_failed_resend() {
        let tracker = RetransmissionTracker::new();
        tracker.register(datagram(8));
        assert!(tracker.forget(8));
        assert!(!tracker.forget(8));
        assert!(tracker.is_empty());
    }
}
