//! Line sniffer: measures the break and mark-after-break actually seen on the line.
//!
//! The sniffer is fed by an edge interrupt on a GPIO which mirrors the DMX line.  It runs beside
//! the UART path and never touches transmit or receive state, so it can be attached and detached
//! at any time, even in the middle of a packet.
//!
//! A break is a low period of at least [`BREAK_LEN_MIN`] µs, closed by a rising edge.  The
//! following high period, closed by the falling edge of the first start bit, is the
//! mark-after-break.  Shorter low periods are data bits or noise and are ignored.
use heapless::Deque;

use crate::consts::{BREAK_LEN_MIN, LINE_TIMING_MAX, MAB_LEN_MIN, SNIFFER_QUEUE_SIZE};
use crate::phy::{Edge, SnifferPin};
use crate::time::Instant;

/// One measured reset sequence.  A value of `-1` means "not measured yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnifferData {
    /// Break length in µs
    pub break_len: i32,
    /// Mark-after-break length in µs
    pub mab_len: i32,
}

impl SnifferData {
    pub const UNKNOWN: SnifferData = SnifferData {
        break_len: -1,
        mab_len: -1,
    };
}

impl Default for SnifferData {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Placeholder pin type for ports which never attach a sniffer.
#[derive(Debug)]
pub enum NoPin {}

impl SnifferPin for NoPin {
    fn enable_edge_interrupt(&mut self, _priority: u8) {
        match *self {}
    }

    fn disable_edge_interrupt(&mut self) {
        match *self {}
    }

    fn next_edge(&mut self) -> Option<Edge> {
        match *self {}
    }
}

/// Edge decoder and measurement queue for one port
#[derive(Debug)]
pub struct Sniffer<P> {
    pin: P,
    queue: Deque<SnifferData, SNIFFER_QUEUE_SIZE>,
    last: SnifferData,
    /// Break measured and waiting for its mark-after-break
    pending_break: Option<i32>,
    last_pos_edge_ts: Option<Instant>,
    last_neg_edge_ts: Option<Instant>,
    dropped: u32,
}

fn duration_in(from: Instant, to: Instant, min: u32) -> Option<i32> {
    let micros = to.total_micros() - from.total_micros();
    if micros >= i64::from(min) && micros <= i64::from(LINE_TIMING_MAX) {
        i32::try_from(micros).ok()
    } else {
        None
    }
}

impl<P: SnifferPin> Sniffer<P> {
    pub fn attach(mut pin: P, priority: u8) -> Self {
        pin.enable_edge_interrupt(priority);
        Self {
            pin,
            queue: Deque::new(),
            last: SnifferData::UNKNOWN,
            pending_break: None,
            last_pos_edge_ts: None,
            last_neg_edge_ts: None,
            dropped: 0,
        }
    }

    pub fn detach(mut self) -> P {
        self.pin.disable_edge_interrupt();
        self.pin
    }

    /// Interrupt handler body: decode all pending edges.
    pub fn handle_interrupt(&mut self) {
        while let Some(edge) = self.pin.next_edge() {
            self.on_edge(edge);
        }
    }

    pub fn on_edge(&mut self, edge: Edge) {
        if edge.is_rising() {
            // End of a low period: a break if it was long enough.
            self.pending_break = self
                .last_neg_edge_ts
                .and_then(|neg| duration_in(neg, edge.timestamp, BREAK_LEN_MIN));
            self.last_pos_edge_ts = Some(edge.timestamp);
        } else {
            // End of a high period: the mark-after-break if a break preceded it.
            if let (Some(break_len), Some(pos)) = (self.pending_break.take(), self.last_pos_edge_ts)
            {
                if let Some(mab_len) = duration_in(pos, edge.timestamp, MAB_LEN_MIN) {
                    self.record(SnifferData { break_len, mab_len });
                }
            }
            self.last_neg_edge_ts = Some(edge.timestamp);
        }
    }

    fn record(&mut self, data: SnifferData) {
        self.last = data;
        if self.queue.is_full() {
            self.queue.pop_front();
            self.dropped = self.dropped.wrapping_add(1);
        }
        // Cannot fail, a slot was freed above.
        let _ = self.queue.push_back(data);
    }

    /// Oldest measurement not yet consumed.
    pub fn pop(&mut self) -> Option<SnifferData> {
        self.queue.pop_front()
    }

    /// Most recent complete measurement.
    #[inline(always)]
    pub fn last(&self) -> SnifferData {
        self.last
    }

    /// Measurements discarded because nobody consumed them in time.
    #[inline(always)]
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}
