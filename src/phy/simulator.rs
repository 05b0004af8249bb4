use std::collections::VecDeque;
use std::sync;

use crate::consts::{BIT_TIME, SLOT_BITS, SLOT_TIME};
use crate::phy::{Edge, UartEvents};
use crate::time::{Duration, Instant};

/// Depth of the simulated hardware FIFOs
const FIFO_SIZE: usize = 128;
/// Line idle time after the last slot before the receiver reports `RX_TIMEOUT`
const RX_IDLE_TIMEOUT: Duration = Duration::from_micros(2 * 44);
/// Sender index used for traffic injected by tests
const EXTERNAL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
enum RxItem {
    Break,
    Slot(u8),
    FramingError,
}

#[derive(Debug)]
struct UartNode {
    name: &'static str,
    clock_enabled: bool,
    baud_rate: u32,
    irq_priority: Option<u8>,
    enabled: UartEvents,
    latched: UartEvents,
    transmit_enabled: bool,

    rx_fifo: VecDeque<u8>,
    /// Line activity from other senders, ordered by the time it becomes visible
    rx_pending: VecDeque<(Instant, RxItem)>,
    last_rx: Instant,
    rx_idle_armed: bool,

    /// Start times of slots queued for transmission
    tx_fifo: VecDeque<Instant>,
    tx_end: Instant,
    tx_active: bool,
    break_done: Option<Instant>,
    mab_done: Option<Instant>,
    line_low_since: Option<Instant>,
    native_break: bool,
}

impl UartNode {
    fn new(name: &'static str, native_break: bool) -> Self {
        Self {
            name,
            clock_enabled: false,
            baud_rate: 0,
            irq_priority: None,
            enabled: UartEvents::empty(),
            latched: UartEvents::empty(),
            transmit_enabled: false,
            rx_fifo: VecDeque::new(),
            rx_pending: VecDeque::new(),
            last_rx: Instant::ZERO,
            rx_idle_armed: false,
            tx_fifo: VecDeque::new(),
            tx_end: Instant::ZERO,
            tx_active: false,
            break_done: None,
            mab_done: None,
            line_low_since: None,
            native_break,
        }
    }

    fn poll(&mut self, now: Instant) -> UartEvents {
        // Data received before a break must be drained before the break is reported, and nothing
        // after the break becomes visible until the break was acknowledged.
        while let Some(&(at, item)) = self.rx_pending.front() {
            if at > now || self.latched.contains(UartEvents::RX_BREAK) {
                break;
            }
            match item {
                RxItem::Break => {
                    if !self.rx_fifo.is_empty() {
                        break;
                    }
                    self.latched |= UartEvents::RX_BREAK;
                    self.rx_idle_armed = false;
                }
                RxItem::Slot(b) => {
                    if self.rx_fifo.len() >= FIFO_SIZE {
                        self.latched |= UartEvents::RX_OVERFLOW;
                    } else {
                        self.rx_fifo.push_back(b);
                    }
                    self.last_rx = at;
                    self.rx_idle_armed = true;
                }
                RxItem::FramingError => {
                    self.latched |= UartEvents::RX_FRAMING_ERROR;
                }
            }
            self.rx_pending.pop_front();
        }

        let idle_at = self.last_rx + RX_IDLE_TIMEOUT;
        if self.rx_idle_armed
            && now >= idle_at
            && self.rx_pending.front().map_or(true, |(at, _)| *at > idle_at)
        {
            self.latched |= UartEvents::RX_TIMEOUT;
            self.rx_idle_armed = false;
        }

        while self.tx_fifo.front().map_or(false, |start| *start <= now) {
            self.tx_fifo.pop_front();
        }
        if self.tx_active && now >= self.tx_end && self.tx_fifo.is_empty() {
            self.latched |= UartEvents::TX_DONE;
            self.tx_active = false;
        }
        if self.break_done.map_or(false, |t| t <= now) {
            self.latched |= UartEvents::TX_BREAK_DONE;
            self.break_done = None;
        }
        if self.mab_done.map_or(false, |t| t <= now) {
            self.latched |= UartEvents::TX_MAB_DONE;
            self.mab_done = None;
        }

        let mut level = UartEvents::empty();
        if !self.rx_fifo.is_empty() {
            level |= UartEvents::RX_DATA;
        }
        if self.tx_fifo.is_empty() {
            level |= UartEvents::TX_FIFO_EMPTY;
        }

        (self.latched | level) & self.enabled
    }
}

#[derive(Debug)]
struct TimerNode {
    irq_priority: Option<u8>,
    alarm_at: Option<Instant>,
}

#[derive(Debug)]
struct CapturedPacket {
    sender: &'static str,
    timestamp: Instant,
    data: Vec<u8>,
}

#[derive(Debug)]
struct SimulatorState {
    time: Instant,
    uarts: Vec<UartNode>,
    timers: Vec<TimerNode>,
    pin_cursors: Vec<usize>,
    /// Level changes on the line, ordered by time.  May extend into the future for slots which
    /// are already scheduled.
    line_log: Vec<Edge>,
    packets: Vec<CapturedPacket>,
}

impl SimulatorState {
    fn sender_name(&self, sender: usize) -> &'static str {
        if sender == EXTERNAL {
            "external"
        } else {
            self.uarts[sender].name
        }
    }

    fn level_at(&self, t: Instant) -> bool {
        self.line_log
            .iter()
            .rev()
            .find(|e| e.timestamp <= t)
            .map_or(true, |e| e.level)
    }

    fn push_edge(&mut self, timestamp: Instant, level: bool) {
        if self.level_at(timestamp) == level {
            return;
        }
        let pos = self.line_log.partition_point(|e| e.timestamp <= timestamp);
        self.line_log.insert(pos, Edge { level, timestamp });
    }

    fn broadcast(&mut self, sender: usize, at: Instant, item: RxItem) {
        for (i, node) in self.uarts.iter_mut().enumerate() {
            if i != sender {
                node.rx_pending.push_back((at, item));
            }
        }
    }

    fn begin_packet(&mut self, sender: usize, timestamp: Instant) {
        self.packets.push(CapturedPacket {
            sender: self.sender_name(sender),
            timestamp,
            data: Vec::new(),
        });
    }

    fn emit_break(&mut self, sender: usize, start: Instant, break_len: u32) {
        let end = start + Duration::from_micros(u64::from(break_len));
        self.push_edge(start, false);
        self.push_edge(end, true);
        if break_len >= SLOT_BITS * 4 {
            self.broadcast(sender, end, RxItem::Break);
        } else {
            self.broadcast(sender, end, RxItem::FramingError);
        }
        self.begin_packet(sender, start);
    }

    fn emit_slot(&mut self, sender: usize, start: Instant, byte: u8) {
        // start bit, 8 data bits LSB first, 2 stop bits
        for bit in 0..SLOT_BITS {
            let level = match bit {
                0 => false,
                1..=8 => byte & (1 << (bit - 1)) != 0,
                _ => true,
            };
            self.push_edge(start + BIT_TIME * bit, level);
        }
        self.broadcast(sender, start + SLOT_TIME, RxItem::Slot(byte));

        let name = self.sender_name(sender);
        match self.packets.last_mut() {
            Some(p) if p.sender == name => p.data.push(byte),
            _ => self.packets.push(CapturedPacket {
                sender: name,
                timestamp: start,
                data: vec![byte],
            }),
        }
    }
}

/// A simulated DMX line
///
/// Any number of [`SimulatorUart`]s can be attached to the line.  Every slot one UART transmits
/// is received by all others with correct line timing; a transmitting UART does not hear itself.
/// [`SimulatorPin`]s mirror the line level for the sniffer.
///
/// Bus time only moves when advanced explicitly, usually from an [`InterruptThread`].
///
/// [`InterruptThread`]: crate::phy::InterruptThread
#[derive(Debug, Clone)]
pub struct SimulatorBus {
    state: sync::Arc<sync::Mutex<SimulatorState>>,
}

impl Default for SimulatorBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatorBus {
    pub fn new() -> Self {
        Self {
            state: sync::Arc::new(sync::Mutex::new(SimulatorState {
                time: Instant::ZERO,
                uarts: Vec::new(),
                timers: Vec::new(),
                pin_cursors: Vec::new(),
                line_log: Vec::new(),
                packets: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> sync::MutexGuard<'_, SimulatorState> {
        self.state.lock().expect("simulator state poisoned")
    }

    /// Attach a UART which can generate breaks natively.
    pub fn uart(&self, name: &'static str) -> SimulatorUart {
        self.attach_uart(name, true)
    }

    /// Attach a UART without native break generation.
    pub fn uart_without_break(&self, name: &'static str) -> SimulatorUart {
        self.attach_uart(name, false)
    }

    fn attach_uart(&self, name: &'static str, native_break: bool) -> SimulatorUart {
        let mut state = self.lock();
        state.uarts.push(UartNode::new(name, native_break));
        SimulatorUart {
            bus: self.clone(),
            index: state.uarts.len() - 1,
        }
    }

    pub fn timer(&self) -> SimulatorTimer {
        let mut state = self.lock();
        state.timers.push(TimerNode {
            irq_priority: None,
            alarm_at: None,
        });
        SimulatorTimer {
            bus: self.clone(),
            index: state.timers.len() - 1,
        }
    }

    /// A monitor pin which sees all line edges from now on.
    pub fn pin(&self) -> SimulatorPin {
        let mut state = self.lock();
        let now = state.time;
        let cursor = state.line_log.partition_point(|e| e.timestamp < now);
        state.pin_cursors.push(cursor);
        SimulatorPin {
            bus: self.clone(),
            index: state.pin_cursors.len() - 1,
            irq_priority: None,
        }
    }

    pub fn time(&self) -> Instant {
        self.lock().time
    }

    pub fn set_time(&self, time: Instant) {
        self.lock().time = time;
    }

    /// Move bus time forward and return the new time.
    pub fn advance(&self, dur: Duration) -> Instant {
        let mut state = self.lock();
        state.time += dur;
        state.time
    }

    /// Transmit a packet from outside any attached UART, starting now.
    ///
    /// With `reset` set to `Some((break_len, mab_len))`, a reset sequence precedes the slots.
    pub fn inject_packet(&self, reset: Option<(u32, u32)>, data: &[u8]) {
        let mut state = self.lock();
        let mut t = state.time;
        if let Some((break_len, mab_len)) = reset {
            state.emit_break(EXTERNAL, t, break_len);
            t += Duration::from_micros(u64::from(break_len) + u64::from(mab_len));
        }
        for b in data.iter().copied() {
            state.emit_slot(EXTERNAL, t, b);
            t += SLOT_TIME;
        }
    }

    /// Make every attached UART see a framing error now.
    pub fn inject_framing_error(&self) {
        let mut state = self.lock();
        let now = state.time;
        state.broadcast(EXTERNAL, now, RxItem::FramingError);
    }

    /// Packets seen on the line so far, as `(sender, data)`.
    pub fn captured_packets(&self) -> Vec<(&'static str, Vec<u8>)> {
        self.lock()
            .packets
            .iter()
            .map(|p| (p.sender, p.data.clone()))
            .collect()
    }

    pub fn print_log(&self) {
        for p in &self.lock().packets {
            print!("{:16} {:>12}:", p.timestamp.total_micros(), p.sender);
            for b in &p.data {
                print!(" 0x{:02x}", b);
            }
            println!();
        }
    }
}

/// UART attached to a [`SimulatorBus`]
#[derive(Debug)]
pub struct SimulatorUart {
    bus: SimulatorBus,
    index: usize,
}

impl SimulatorUart {
    fn with_node<R>(&self, f: impl FnOnce(&mut UartNode, Instant) -> R) -> R {
        let mut state = self.bus.lock();
        let now = state.time;
        f(&mut state.uarts[self.index], now)
    }

    pub fn is_clock_enabled(&self) -> bool {
        self.with_node(|n, _| n.clock_enabled)
    }

    pub fn is_interrupt_enabled(&self) -> bool {
        self.with_node(|n, _| n.irq_priority.is_some())
    }
}

impl crate::phy::DmxUart for SimulatorUart {
    fn set_clock_enabled(&mut self, enabled: bool) {
        self.with_node(|n, _| n.clock_enabled = enabled);
    }

    fn configure(&mut self, baud_rate: u32) {
        self.with_node(|n, _| {
            assert!(n.clock_enabled, "\"{}\" configured while unclocked!", n.name);
            assert_eq!(
                baud_rate,
                crate::consts::DMX_BAUD_RATE,
                "simulator only models the DMX line rate"
            );
            n.baud_rate = baud_rate;
        });
    }

    fn enable_interrupt(&mut self, priority: u8) {
        self.with_node(|n, _| n.irq_priority = Some(priority));
    }

    fn disable_interrupt(&mut self) {
        self.with_node(|n, _| n.irq_priority = None);
    }

    fn enable_events(&mut self, events: UartEvents) {
        self.with_node(|n, _| n.enabled |= events);
    }

    fn disable_events(&mut self, events: UartEvents) {
        self.with_node(|n, _| n.enabled &= !events);
    }

    fn pending_events(&mut self) -> UartEvents {
        self.with_node(|n, now| {
            if !n.clock_enabled || n.irq_priority.is_none() {
                return UartEvents::empty();
            }
            n.poll(now)
        })
    }

    fn clear_events(&mut self, events: UartEvents) {
        self.with_node(|n, _| n.latched &= !events);
    }

    fn read_rx_fifo(&mut self, buf: &mut [u8]) -> usize {
        self.with_node(|n, _| {
            let count = buf.len().min(n.rx_fifo.len());
            for (slot, b) in buf.iter_mut().zip(n.rx_fifo.drain(..count)) {
                *slot = b;
            }
            count
        })
    }

    fn reset_rx_fifo(&mut self) {
        self.with_node(|n, _| n.rx_fifo.clear());
    }

    fn write_tx_fifo(&mut self, data: &[u8]) -> usize {
        let mut state = self.bus.lock();
        let now = state.time;
        let index = self.index;

        let node = &mut state.uarts[index];
        while node.tx_fifo.front().map_or(false, |start| *start <= now) {
            node.tx_fifo.pop_front();
        }
        let count = data.len().min(FIFO_SIZE - node.tx_fifo.len());
        if !node.transmit_enabled {
            log::warn!(
                "\"{}\" wrote {} slots with its line driver disabled",
                node.name,
                count
            );
            return count;
        }

        for b in data[..count].iter().copied() {
            let node = &mut state.uarts[index];
            let mut start = now.max(node.tx_end);
            if let Some(mab_done) = node.mab_done {
                start = start.max(mab_done);
            }
            node.tx_end = start + SLOT_TIME;
            node.tx_fifo.push_back(start);
            node.tx_active = true;
            state.emit_slot(index, start, b);
        }
        count
    }

    fn reset_tx_fifo(&mut self) {
        self.with_node(|n, _| n.tx_fifo.clear());
    }

    fn set_transmit_enabled(&mut self, enabled: bool) {
        self.with_node(|n, _| n.transmit_enabled = enabled);
    }

    fn supports_native_break(&self) -> bool {
        self.with_node(|n, _| n.native_break)
    }

    fn start_break(&mut self, break_len: u32, mab_len: u32) {
        let mut state = self.bus.lock();
        let now = state.time;
        let index = self.index;

        let node = &mut state.uarts[index];
        assert!(node.native_break, "\"{}\" has no break generator", node.name);
        let start = now.max(node.tx_end);
        let break_done = start + Duration::from_micros(u64::from(break_len));
        let mab_done = break_done + Duration::from_micros(u64::from(mab_len));
        node.break_done = Some(break_done);
        node.mab_done = Some(mab_done);
        node.tx_end = mab_done;

        state.emit_break(index, start, break_len);
    }

    fn set_line_low(&mut self, low: bool) {
        let mut state = self.bus.lock();
        let now = state.time;
        let index = self.index;

        if low {
            state.uarts[index].line_low_since = Some(now);
            state.push_edge(now, false);
        } else if let Some(since) = state.uarts[index].line_low_since.take() {
            let break_len = u32::try_from((now - since).total_micros()).unwrap_or(u32::MAX);
            // The low phase is already on the line; emit_break() re-records it for receivers.
            state.emit_break(index, since, break_len);
        }
    }
}

/// Alarm timer driven by [`SimulatorBus`] time
#[derive(Debug)]
pub struct SimulatorTimer {
    bus: SimulatorBus,
    index: usize,
}

impl crate::phy::ResetTimer for SimulatorTimer {
    fn enable_interrupt(&mut self, priority: u8) {
        self.bus.lock().timers[self.index].irq_priority = Some(priority);
    }

    fn disable_interrupt(&mut self) {
        self.bus.lock().timers[self.index].irq_priority = None;
    }

    fn start_alarm(&mut self, after: Duration) {
        let mut state = self.bus.lock();
        let now = state.time;
        state.timers[self.index].alarm_at = Some(now + after);
    }

    fn cancel(&mut self) {
        self.bus.lock().timers[self.index].alarm_at = None;
    }

    fn take_alarm(&mut self) -> bool {
        let mut state = self.bus.lock();
        let now = state.time;
        let timer = &mut state.timers[self.index];
        match timer.alarm_at {
            Some(at) if at <= now && timer.irq_priority.is_some() => {
                timer.alarm_at = None;
                true
            }
            _ => false,
        }
    }
}

/// Monitor pin mirroring the [`SimulatorBus`] line level
#[derive(Debug)]
pub struct SimulatorPin {
    bus: SimulatorBus,
    index: usize,
    irq_priority: Option<u8>,
}

impl crate::phy::SnifferPin for SimulatorPin {
    fn enable_edge_interrupt(&mut self, priority: u8) {
        self.irq_priority = Some(priority);
    }

    fn disable_edge_interrupt(&mut self) {
        self.irq_priority = None;
    }

    fn next_edge(&mut self) -> Option<Edge> {
        self.irq_priority?;
        let mut state = self.bus.lock();
        let now = state.time;
        let cursor = state.pin_cursors[self.index];
        let edge = *state.line_log.get(cursor)?;
        if edge.timestamp > now {
            return None;
        }
        state.pin_cursors[self.index] += 1;
        Some(edge)
    }
}
