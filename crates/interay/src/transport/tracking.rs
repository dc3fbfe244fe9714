use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::frame::sequence_greater_than;

pub const MIN_RTO: Duration = Duration::from_millis(50);
pub const MAX_RTO: Duration = Duration::from_secs(1);

/// Payload sequences start here; 0 means "nothing received yet" in acks.
pub const FIRST_SEQUENCE: u32 = 1;

/// Next send sequence, skipping the reserved 0 on wrap.
pub fn next_sequence(sequence: u32) -> u32 {
    match sequence.wrapping_add(1) {
        0 => FIRST_SEQUENCE,
        next => next,
    }
}

#[derive(Debug, Clone)]
pub struct PendingPayload {
    pub sequence: u32,
    pub data: Vec<u8>,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub retries: u32,
}

/// Outbound side: remembers every unacknowledged payload until the peer
/// confirms it and hands back the ones whose retransmission timer expired.
#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<PendingPayload>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending.min(256)),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    /// Returns false when the window is full; the payload is not tracked then.
    pub fn track(&mut self, sequence: u32, data: Vec<u8>, now: Instant) -> bool {
        if self.is_full() {
            return false;
        }
        self.pending.push_back(PendingPayload {
            sequence,
            data,
            first_sent: now,
            last_sent: now,
            retries: 0,
        });
        true
    }

    /// Drops every payload covered by `ack`/`ack_bitfield` and returns how
    /// many were newly acknowledged.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32, now: Instant) -> usize {
        if ack == 0 {
            return 0;
        }

        let mut acked = 0;
        let mut rtt_samples = Vec::new();
        self.pending.retain(|pending| {
            let is_acked = if pending.sequence == ack {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                diff <= 32 && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };

            if !is_acked {
                return true;
            }
            acked += 1;
            // Retransmitted payloads give ambiguous samples.
            if pending.retries == 0 {
                rtt_samples.push(now.duration_since(pending.first_sent).as_secs_f32() * 1000.0);
            }
            false
        });

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }
        acked
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn rto(&self) -> Duration {
        let millis = (self.srtt + 4.0 * self.rtt_var).max(0.0);
        Duration::from_secs_f32(millis / 1000.0).clamp(MIN_RTO, MAX_RTO)
    }

    /// Payloads whose timer expired, oldest first. Their timers restart.
    pub fn due_for_resend(&mut self, now: Instant) -> Vec<(u32, Vec<u8>)> {
        let rto = self.rto();
        self.pending
            .iter_mut()
            .filter(|pending| now.duration_since(pending.last_sent) >= rto)
            .map(|pending| {
                pending.last_sent = now;
                pending.retries += 1;
                (pending.sequence, pending.data.clone())
            })
            .collect()
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_pending
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// New payload, stored for in-order delivery.
    Accepted,
    /// Already delivered or already buffered.
    Duplicate,
    /// Too far ahead of the delivery point to buffer.
    OutOfWindow,
}

/// Inbound side: builds ack data and releases payloads strictly in order.
#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bitfield: u32,
    next_expected: u32,
    reorder: HashMap<u32, Vec<u8>>,
    window: u32,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ReceiveTracker {
    pub fn new(window: u32) -> Self {
        Self {
            last_received: 0,
            received_bitfield: 0,
            next_expected: FIRST_SEQUENCE,
            reorder: HashMap::new(),
            window: window.max(1),
        }
    }

    pub fn receive(&mut self, sequence: u32, data: Vec<u8>) -> ReceiveOutcome {
        if sequence == 0
            || sequence_greater_than(self.next_expected, sequence)
            || self.reorder.contains_key(&sequence)
        {
            return ReceiveOutcome::Duplicate;
        }
        if sequence.wrapping_sub(self.next_expected) >= self.window {
            return ReceiveOutcome::OutOfWindow;
        }

        self.reorder.insert(sequence, data);
        self.record_ack(sequence);
        ReceiveOutcome::Accepted
    }

    /// Next payload in sequence order, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<Vec<u8>> {
        let data = self.reorder.remove(&self.next_expected)?;
        self.next_expected = next_sequence(self.next_expected);
        Some(data)
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    fn record_ack(&mut self, sequence: u32) {
        if self.last_received == 0 {
            self.last_received = sequence;
            self.received_bitfield = 0;
        } else if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            if diff <= 32 {
                self.received_bitfield = (self.received_bitfield << 1 | 1) << (diff - 1);
            } else {
                self.received_bitfield = 0;
            }
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(tracker: &mut ReceiveTracker) -> Vec<u8> {
        std::iter::from_fn(|| tracker.pop_ready())
            .map(|data| data[0])
            .collect()
    }

    #[test]
    fn in_order_delivery_and_bitfield() {
        let mut tracker = ReceiveTracker::default();
        for sequence in 1..=3 {
            assert_eq!(
                tracker.receive(sequence, vec![sequence as u8]),
                ReceiveOutcome::Accepted
            );
        }
        assert_eq!(drain(&mut tracker), vec![1, 2, 3]);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn out_of_order_is_held_back() {
        let mut tracker = ReceiveTracker::default();
        tracker.receive(3, vec![3]);
        tracker.receive(2, vec![2]);
        assert!(tracker.pop_ready().is_none());
        assert_eq!(tracker.buffered(), 2);

        tracker.receive(1, vec![1]);
        assert_eq!(drain(&mut tracker), vec![1, 2, 3]);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut tracker = ReceiveTracker::default();
        assert_eq!(tracker.receive(1, vec![1]), ReceiveOutcome::Accepted);
        assert_eq!(tracker.receive(2, vec![2]), ReceiveOutcome::Accepted);
        assert_eq!(tracker.receive(2, vec![2]), ReceiveOutcome::Duplicate);

        assert_eq!(drain(&mut tracker), vec![1, 2]);
        assert_eq!(tracker.receive(1, vec![1]), ReceiveOutcome::Duplicate);
        assert!(tracker.pop_ready().is_none());
    }

    #[test]
    fn window_bounds_buffering() {
        let mut tracker = ReceiveTracker::new(4);
        assert_eq!(tracker.receive(5, vec![5]), ReceiveOutcome::OutOfWindow);
        assert_eq!(tracker.receive(4, vec![4]), ReceiveOutcome::Accepted);
        assert_eq!(tracker.ack_data().0, 4);
    }

    #[test]
    fn acks_clear_pending_and_sample_rtt() {
        let start = Instant::now();
        let mut tracker = AckTracker::new(32);
        for sequence in 1..=3 {
            assert!(tracker.track(sequence, vec![sequence as u8], start));
        }

        let later = start + Duration::from_millis(40);
        assert_eq!(tracker.process_ack(3, 0b01, later), 2);
        assert_eq!(tracker.unacked_count(), 1);
        assert!(tracker.srtt() < 100.0);

        assert_eq!(tracker.process_ack(3, 0b11, later), 1);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn retransmitted_payloads_count_as_acked() {
        let start = Instant::now();
        let mut tracker = AckTracker::new(8);
        tracker.track(1, vec![1], start);
        tracker.track(2, vec![2], start);
        assert_eq!(tracker.due_for_resend(start + MAX_RTO).len(), 2);

        let srtt = tracker.srtt();
        assert_eq!(tracker.process_ack(2, 0b1, start + MAX_RTO * 2), 2);
        assert_eq!(tracker.unacked_count(), 0);
        assert_eq!(tracker.srtt(), srtt);
    }

    #[test]
    fn expired_payloads_are_resent() {
        let start = Instant::now();
        let mut tracker = AckTracker::new(8);
        tracker.track(1, vec![42], start);

        assert!(tracker.due_for_resend(start).is_empty());

        let later = start + MAX_RTO;
        let due = tracker.due_for_resend(later);
        assert_eq!(due, vec![(1, vec![42])]);
        assert!(tracker.due_for_resend(later).is_empty());
    }

    #[test]
    fn rto_is_clamped() {
        let tracker = AckTracker::new(1);
        let rto = tracker.rto();
        assert!(rto >= MIN_RTO && rto <= MAX_RTO);
    }

    #[test]
    fn full_window_refuses_tracking() {
        let now = Instant::now();
        let mut tracker = AckTracker::new(1);
        assert!(tracker.track(1, Vec::new(), now));
        assert!(!tracker.track(2, Vec::new(), now));
    }

    #[test]
    fn sequence_skips_zero() {
        assert_eq!(next_sequence(1), 2);
        assert_eq!(next_sequence(u32::MAX), FIRST_SEQUENCE);
    }
}
