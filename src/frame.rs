//! Packet framing state machine
//!
//! Every port runs one [`FrameMachine`].  It is driven from the UART interrupt (and the reset
//! timer interrupt) and tracks where on the line the current packet is:
//!
//! ```text
//!        arm_transmit()           BreakDone          MabDone         TX_DONE
//! Idle ─────────────────▶ Break ───────────▶ MAB ───────────▶ Data ─────────▶ Idle
//!   │    RX_BREAK                 first slot                  rx complete
//!   └────────────────────▶ Break ───────────────────────────▶ Data ─────────▶ Idle
//! ```
//!
//! A receiver cannot observe the end of the mark-after-break separately from the first slot, so
//! on the receive side `Break` leads straight to `Data` when slot 0 arrives.
//!
//! The machine never owns the packet buffer or the peripheral; both are passed in by the driver
//! while it holds the port's critical section.
use crate::consts::{
    DELIMITER_BYTE, DMX_MAX_PACKET_SIZE, PACKET_TIMEOUT, PID_DISC_UNIQUE_BRANCH,
    RDM_DISCOVERY_RESPONSE_SIZE, RDM_MAX_DISCOVERY_RESPONSE_SIZE, SC_DMX, SC_RDM,
};
use crate::phy::{DmxUart, ResetTimer, UartEvents};
use crate::rdm::{self, CommandClass, RdmContext, RdmHeader, Uid};
use crate::reset::{ResetGenerator, ResetStep};
use crate::time::Instant;

/// Position on the line of the packet currently in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Break,
    MarkAfterBreak,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Receive,
    Transmit,
}

/// What kind of packet was sent or received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// No packet yet.
    None,
    /// Null start code (dimmer levels).
    Dmx,
    /// A well-formed RDM message.
    Rdm(CommandClass),
    /// Reply to DISC_UNIQUE_BRANCH, sent without a break.
    RdmDiscoveryResponse,
    /// Any other start code, including malformed RDM.
    AlternateStartCode(u8),
}

/// Metadata of the last packet that went over the line on this port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// Number of slots including the start code
    pub size: usize,
    pub kind: PacketKind,
    /// RDM destination, if the packet is RDM
    pub destination: Option<Uid>,
    /// RDM source, if the packet is RDM
    pub source: Option<Uid>,
    /// When the packet completed
    pub timestamp: Instant,
    /// This port put the packet on the line (or it carries this port's UID as source)
    pub sent_previous: bool,
    /// An RDM packet whose destination matches this port's UID (including broadcasts)
    pub addressed_to_us: bool,
    /// A DISC_UNIQUE_BRANCH this port must not answer because it is muted
    pub discovery_suppressed: bool,
}

impl PacketInfo {
    pub const NONE: PacketInfo = PacketInfo {
        size: 0,
        kind: PacketKind::None,
        destination: None,
        source: None,
        timestamp: Instant::ZERO,
        sent_previous: false,
        addressed_to_us: false,
        discovery_suppressed: false,
    };

    fn classify(packet: &[u8], timestamp: Instant) -> (Self, Option<RdmHeader>) {
        let mut info = PacketInfo {
            size: packet.len(),
            timestamp,
            ..Self::NONE
        };
        let mut header = None;
        info.kind = match packet.first() {
            None => PacketKind::None,
            Some(&SC_DMX) => PacketKind::Dmx,
            Some(&SC_RDM) => match RdmHeader::decode(packet) {
                Some(h) if packet.len() >= h.packet_size() => {
                    info.destination = Some(h.destination);
                    info.source = Some(h.source);
                    header = Some(h);
                    PacketKind::Rdm(h.command_class)
                }
                _ => PacketKind::AlternateStartCode(SC_RDM),
            },
            Some(&sc) => PacketKind::AlternateStartCode(sc),
        };
        (info, header)
    }
}

impl Default for PacketInfo {
    fn default() -> Self {
        Self::NONE
    }
}

/// Result of a packet leaving the line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Sent(PacketInfo),
    Received(PacketInfo),
    ReceiveFailed(crate::Error),
}

/// Framing state of one port
#[derive(Debug)]
pub struct FrameMachine {
    state: FrameState,
    direction: Direction,
    /// Next slot to transmit or receive
    head: usize,
    tx_size: usize,
    rx_size: usize,
    /// Where the packet being received is expected to end
    rx_expected: usize,
    packet_start: Instant,
    /// The packet being received came without break (discovery response)
    in_discovery_response: bool,
    /// A DISC_UNIQUE_BRANCH was sent; replies without break are accepted
    expect_discovery_response: bool,
    /// The buffer belongs to a woken task until it copied the packet out
    held: bool,
    dropped: u32,
    previous: PacketInfo,
}

impl FrameMachine {
    pub const fn new(rx_size: usize) -> Self {
        Self {
            state: FrameState::Idle,
            direction: Direction::Receive,
            head: 0,
            tx_size: 0,
            rx_size,
            rx_expected: rx_size,
            packet_start: Instant::ZERO,
            in_discovery_response: false,
            expect_discovery_response: false,
            held: false,
            dropped: 0,
            previous: PacketInfo::NONE,
        }
    }

    #[inline(always)]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        self.state == FrameState::Idle
    }

    #[inline(always)]
    pub fn is_sending(&self) -> bool {
        !self.is_idle() && self.direction == Direction::Transmit
    }

    #[inline(always)]
    pub fn is_receiving(&self) -> bool {
        !self.is_idle() && self.direction == Direction::Receive
    }

    #[inline(always)]
    pub fn is_in_break(&self) -> bool {
        self.state == FrameState::Break
    }

    #[inline(always)]
    pub fn rx_size(&self) -> usize {
        self.rx_size
    }

    /// Takes effect with the next packet.
    pub fn set_rx_size(&mut self, rx_size: usize) {
        self.rx_size = rx_size;
    }

    #[inline(always)]
    pub fn previous(&self) -> &PacketInfo {
        &self.previous
    }

    #[inline(always)]
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Keep the received packet in the buffer until [`FrameMachine::release()`].
    pub fn hold(&mut self) {
        self.held = true;
    }

    pub fn release(&mut self) {
        self.held = false;
    }

    /// Packets ignored because the buffer was held.
    #[inline(always)]
    pub fn dropped_packets(&self) -> u32 {
        self.dropped
    }

    /// Put the receiver in listening mode.
    pub fn start_listening<U: DmxUart>(&mut self, uart: &mut U) {
        uart.reset_rx_fifo();
        uart.clear_events(UartEvents::RX_ALL);
        uart.enable_events(UartEvents::RX_ALL);
    }

    /// Begin transmitting the first `size` bytes of `buf`.
    ///
    /// The reset sequence starts right away; slots follow once it completed.
    pub fn arm_transmit<U: DmxUart, T: ResetTimer>(
        &mut self,
        uart: &mut U,
        reset: &mut ResetGenerator<T>,
        size: usize,
        break_len: u32,
        mab_len: u32,
    ) -> Result<(), crate::Error> {
        if !self.is_idle() || self.held {
            return Err(crate::Error::OperationInProgress);
        }
        uart.disable_events(UartEvents::RX_ALL | UartEvents::TX_ALL);
        uart.clear_events(UartEvents::TX_ALL);
        uart.reset_tx_fifo();
        uart.set_transmit_enabled(true);

        self.direction = Direction::Transmit;
        self.state = FrameState::Break;
        self.head = 0;
        self.tx_size = size;
        self.expect_discovery_response = false;

        reset.start(uart, break_len, mab_len);
        Ok(())
    }

    /// Abandon whatever is in flight and go back to listening.
    pub fn cancel<U: DmxUart, T: ResetTimer>(
        &mut self,
        uart: &mut U,
        reset: &mut ResetGenerator<T>,
    ) {
        match (self.state, self.direction) {
            (FrameState::Idle, _) => return,
            (_, Direction::Transmit) => {
                log::debug!("Transmission aborted after {} slots", self.head);
                reset.abort(uart);
                uart.reset_tx_fifo();
                uart.disable_events(UartEvents::TX_ALL);
                uart.set_transmit_enabled(false);
                self.start_listening(uart);
            }
            (_, Direction::Receive) => {
                log::debug!("Reception aborted after {} slots", self.head);
            }
        }
        self.state = FrameState::Idle;
        self.in_discovery_response = false;
    }

    pub fn on_reset_step<U: DmxUart>(&mut self, step: ResetStep, uart: &mut U, buf: &[u8]) {
        if self.direction != Direction::Transmit {
            return;
        }
        match (self.state, step) {
            (FrameState::Break, ResetStep::BreakDone) => {
                self.state = FrameState::MarkAfterBreak;
            }
            (FrameState::MarkAfterBreak, ResetStep::MabDone) => {
                self.state = FrameState::Data;
                self.fill_tx_fifo(uart, buf);
            }
            (state, step) => {
                log::warn!("Unexpected reset step {:?} in state {:?}", step, state);
            }
        }
    }

    fn fill_tx_fifo<U: DmxUart>(&mut self, uart: &mut U, buf: &[u8]) {
        if self.head < self.tx_size {
            self.head += uart.write_tx_fifo(&buf[self.head..self.tx_size]);
        }
        if self.head < self.tx_size {
            uart.enable_events(UartEvents::TX_FIFO_EMPTY);
        } else {
            uart.disable_events(UartEvents::TX_FIFO_EMPTY);
            uart.enable_events(UartEvents::TX_DONE);
        }
    }

    /// Give up on a received packet which did not complete within [`PACKET_TIMEOUT`].
    ///
    /// Needs no UART event, so the interrupt glue calls it on every interrupt.  A break followed
    /// by silence would otherwise keep the port receiving forever.
    pub fn check_timeout(&mut self, now: Instant) -> Option<Completion> {
        if !self.is_receiving()
            || now.saturating_duration_since(self.packet_start) <= PACKET_TIMEOUT
        {
            return None;
        }
        let error = crate::Error::Timeout;
        log::warn!("Receive failed: {}", error);
        self.state = FrameState::Idle;
        self.in_discovery_response = false;
        Some(Completion::ReceiveFailed(error))
    }

    /// Handle one batch of UART events.
    ///
    /// Returns at most one completion.  Events belonging to the next packet stay latched in that
    /// case and are handled by the next call.
    pub fn on_uart_events<U: DmxUart>(
        &mut self,
        uart: &mut U,
        buf: &mut [u8],
        rdm: &RdmContext,
        events: UartEvents,
        now: Instant,
    ) -> Option<Completion> {
        if self.is_sending() {
            return self.on_transmit_events(uart, buf, events, now);
        }

        if let Some(c) = self.check_timeout(now) {
            return Some(c);
        }

        if events.intersects(UartEvents::RX_ERRORS) {
            uart.clear_events(UartEvents::RX_ERRORS);
            uart.reset_rx_fifo();
            if self.is_receiving() {
                let error = if events.contains(UartEvents::RX_OVERFLOW) {
                    crate::Error::BufferOverflow
                } else {
                    crate::Error::FramingError
                };
                log::warn!("Receive failed: {}", error);
                self.state = FrameState::Idle;
                self.in_discovery_response = false;
                return Some(Completion::ReceiveFailed(error));
            }
            return None;
        }

        if events.contains(UartEvents::RX_DATA) {
            if let Some(c) = self.read_rx_fifo(uart, buf, rdm, now) {
                return Some(c);
            }
        }

        if events.contains(UartEvents::RX_BREAK) {
            if self.state == FrameState::Data && self.head > 0 {
                // The break ends the packet before it; handle the break itself next round.
                return Some(self.finish_receive(buf, rdm, now));
            }
            uart.clear_events(UartEvents::RX_BREAK);
            self.begin_receive(now);
        }

        if events.contains(UartEvents::RX_TIMEOUT) {
            uart.clear_events(UartEvents::RX_TIMEOUT);
            if self.state == FrameState::Data && self.head > 0 {
                return Some(self.finish_receive(buf, rdm, now));
            }
            if self.is_receiving() && !events.contains(UartEvents::RX_BREAK) {
                log::debug!("Line went idle after a break without slots");
                self.state = FrameState::Idle;
            }
        }

        None
    }

    fn on_transmit_events<U: DmxUart>(
        &mut self,
        uart: &mut U,
        buf: &[u8],
        events: UartEvents,
        now: Instant,
    ) -> Option<Completion> {
        if self.state != FrameState::Data {
            return None;
        }
        if events.contains(UartEvents::TX_FIFO_EMPTY) && self.head < self.tx_size {
            self.fill_tx_fifo(uart, buf);
        }
        if events.contains(UartEvents::TX_DONE) && self.head >= self.tx_size {
            uart.clear_events(UartEvents::TX_DONE);
            return Some(self.finish_transmit(uart, buf, now));
        }
        None
    }

    fn finish_transmit<U: DmxUart>(
        &mut self,
        uart: &mut U,
        buf: &[u8],
        now: Instant,
    ) -> Completion {
        uart.disable_events(UartEvents::TX_ALL);
        uart.set_transmit_enabled(false);
        self.start_listening(uart);
        self.state = FrameState::Idle;

        let (mut info, header) = PacketInfo::classify(&buf[..self.tx_size], now);
        info.sent_previous = true;
        self.expect_discovery_response = header.map_or(false, |h| {
            h.command_class == CommandClass::DiscoveryCommand
                && h.parameter_id == PID_DISC_UNIQUE_BRANCH
        });
        log::trace!("Sent {:?} packet of {} slots", info.kind, info.size);
        self.previous = info;
        Completion::Sent(info)
    }

    fn begin_receive(&mut self, now: Instant) {
        if self.held {
            self.dropped = self.dropped.wrapping_add(1);
            log::warn!("Dropped packet, previous one was not picked up yet");
            return;
        }
        self.direction = Direction::Receive;
        self.state = FrameState::Break;
        self.head = 0;
        self.rx_expected = self.rx_size;
        self.packet_start = now;
        self.in_discovery_response = false;
        self.expect_discovery_response = false;
    }

    fn drain<U: DmxUart>(uart: &mut U) {
        let mut scratch = [0u8; 32];
        while uart.read_rx_fifo(&mut scratch) > 0 {}
    }

    fn read_rx_fifo<U: DmxUart>(
        &mut self,
        uart: &mut U,
        buf: &mut [u8],
        rdm: &RdmContext,
        now: Instant,
    ) -> Option<Completion> {
        match self.state {
            FrameState::Break | FrameState::MarkAfterBreak => {
                self.state = FrameState::Data;
            }
            FrameState::Data => (),
            FrameState::Idle => {
                if self.held || !self.expect_discovery_response || buf.is_empty() {
                    Self::drain(uart);
                    return None;
                }
                if uart.read_rx_fifo(&mut buf[..1]) == 0 {
                    return None;
                }
                if !rdm::is_discovery_response(&buf[..1]) {
                    Self::drain(uart);
                    return None;
                }
                self.direction = Direction::Receive;
                self.state = FrameState::Data;
                self.head = 1;
                self.rx_expected = RDM_MAX_DISCOVERY_RESPONSE_SIZE;
                self.packet_start = now;
                self.in_discovery_response = true;
            }
        }

        loop {
            let limit = self.rx_expected.min(buf.len());
            if self.head >= limit {
                if self.rx_expected < DMX_MAX_PACKET_SIZE {
                    return Some(self.finish_receive(buf, rdm, now));
                }
                // A full-size packet only ends by break or idle line.  One more slot overflows.
                if uart.read_rx_fifo(&mut [0u8; 1]) == 0 {
                    return None;
                }
                Self::drain(uart);
                let error = crate::Error::BufferOverflow;
                log::warn!("Receive failed: {}", error);
                self.state = FrameState::Idle;
                return Some(Completion::ReceiveFailed(error));
            }
            let count = uart.read_rx_fifo(&mut buf[self.head..limit]);
            if count == 0 {
                return None;
            }
            self.head += count;
            self.update_expected_size(buf);
        }
    }

    fn update_expected_size(&mut self, buf: &[u8]) {
        if self.in_discovery_response {
            if let Some(pos) = buf[..self.head].iter().position(|b| *b == DELIMITER_BYTE) {
                self.rx_expected =
                    (pos + 1 + RDM_DISCOVERY_RESPONSE_SIZE).min(RDM_MAX_DISCOVERY_RESPONSE_SIZE);
            }
        } else if let Some(size) = rdm::expected_packet_size(&buf[..self.head]) {
            self.rx_expected = size.min(self.rx_size);
        }
    }

    fn finish_receive(&mut self, buf: &[u8], rdm: &RdmContext, now: Instant) -> Completion {
        let packet = &buf[..self.head];
        let info = if self.in_discovery_response {
            self.expect_discovery_response = false;
            PacketInfo {
                size: packet.len(),
                kind: PacketKind::RdmDiscoveryResponse,
                timestamp: now,
                ..PacketInfo::NONE
            }
        } else {
            let (mut info, header) = PacketInfo::classify(packet, now);
            if let Some(h) = header {
                let uid = rdm.uid();
                info.addressed_to_us = h.destination.targets(uid);
                info.sent_previous = h.source == uid;
                if !rdm::verify_checksum(&packet[..h.packet_size()]) {
                    log::debug!("RDM checksum mismatch in packet from {}", h.source);
                } else if h.is_discovery() {
                    info.discovery_suppressed = rdm.apply_discovery(&h);
                }
            }
            info
        };

        self.state = FrameState::Idle;
        self.in_discovery_response = false;
        log::trace!("Received {:?} packet of {} slots", info.kind, info.size);
        self.previous = info;
        Completion::Received(info)
    }
}

#[cfg(all(test, feature = "phy-simulator"))]
mod tests {
    use super::*;
    use crate::consts::PID_DISC_MUTE;
    use crate::phy::{SimulatorBus, SimulatorTimer, SimulatorUart};
    use crate::reset::ResetStrategy;
    use crate::time::Duration;

    struct Rig {
        bus: SimulatorBus,
        uart: SimulatorUart,
        peer: SimulatorUart,
        reset: ResetGenerator<SimulatorTimer>,
        frame: FrameMachine,
        buf: Vec<u8>,
        rdm: RdmContext,
    }

    const ME: Uid = Uid::new(0x05e0, 0x0000_0001);

    fn ready(uart: &mut SimulatorUart) {
        uart.set_clock_enabled(true);
        uart.configure(crate::consts::DMX_BAUD_RATE);
        uart.enable_interrupt(3);
    }

    impl Rig {
        fn new() -> Self {
            Self::with_warnings(vec![])
        }

        fn with_warnings(allowed: Vec<&'static str>) -> Self {
            crate::test_utils::prepare_test_logger_with_warnings(allowed);
            let bus = SimulatorBus::new();
            let mut uart = bus.uart("dut");
            let mut peer = bus.uart("peer");
            ready(&mut uart);
            ready(&mut peer);
            peer.enable_events(UartEvents::RX_ALL);
            let reset = ResetGenerator::new(ResetStrategy::Native, &uart, None).unwrap();
            let mut frame = FrameMachine::new(DMX_MAX_PACKET_SIZE);
            frame.start_listening(&mut uart);
            Self {
                bus,
                uart,
                peer,
                reset,
                frame,
                buf: vec![0; DMX_MAX_PACKET_SIZE],
                rdm: RdmContext::new(ME),
            }
        }

        fn step(&mut self) -> Option<Completion> {
            let now = self.bus.advance(Duration::from_micros(4));
            crate::test_utils::set_log_timestamp(now);
            for _ in 0..8 {
                let events = self.uart.pending_events();
                if events.is_empty() {
                    break;
                }
                if let Some(step) = self.reset.on_uart_events(&mut self.uart, events) {
                    self.frame.on_reset_step(step, &mut self.uart, &self.buf);
                }
                if let Some(c) =
                    self.frame
                        .on_uart_events(&mut self.uart, &mut self.buf, &self.rdm, events, now)
                {
                    return Some(c);
                }
            }
            None
        }

        fn run_until_completion(&mut self, limit: Duration) -> Option<Completion> {
            let end = self.bus.time() + limit;
            while self.bus.time() < end {
                if let Some(c) = self.step() {
                    return Some(c);
                }
            }
            None
        }
    }

    fn rdm_request(destination: Uid, cc: CommandClass, pid: u16) -> Vec<u8> {
        let header = RdmHeader {
            destination,
            source: Uid::new(0x7a70, 0x0000_0099),
            transaction_number: 3,
            port_id: 1,
            message_count: 0,
            sub_device: 0,
            command_class: cc,
            parameter_id: pid,
            parameter_data_len: 0,
        };
        let mut buf = vec![0; 26];
        header.encode(&[], &mut buf).unwrap();
        buf
    }

    #[test]
    fn receives_short_dmx_packet_on_idle() {
        let mut rig = Rig::new();
        let data: Vec<u8> = (0..=10).collect();
        rig.bus.inject_packet(Some((176, 12)), &data);

        let completion = rig.run_until_completion(Duration::from_millis(5)).unwrap();
        let Completion::Received(info) = completion else {
            panic!("unexpected completion {:?}", completion);
        };
        assert_eq!(info.size, 11);
        assert_eq!(info.kind, PacketKind::Dmx);
        assert!(!info.sent_previous);
        assert_eq!(&rig.buf[..11], &data[..]);
        assert!(rig.frame.is_idle());
    }

    #[test]
    fn rx_size_ends_packet_early() {
        let mut rig = Rig::new();
        rig.frame.set_rx_size(5);
        rig.bus.inject_packet(Some((176, 12)), &[0, 1, 2, 3, 4, 5, 6, 7]);

        let start = rig.bus.time();
        let completion = rig.run_until_completion(Duration::from_millis(5));
        assert!(matches!(completion, Some(Completion::Received(PacketInfo { size: 5, .. }))));
        // Completed right after slot 4, without waiting for the line to go idle
        assert!((rig.bus.time() - start).total_micros() <= 176 + 12 + 5 * 44 + 8);

        // The surplus slots are discarded and do not form a packet
        assert_eq!(rig.run_until_completion(Duration::from_millis(2)), None);
    }

    #[test]
    fn rdm_packet_ends_by_message_length() {
        let mut rig = Rig::new();
        let packet = rdm_request(ME, CommandClass::GetCommand, 0x1000);
        rig.bus.inject_packet(Some((176, 12)), &packet);

        let start = rig.bus.time();
        let Some(Completion::Received(info)) = rig.run_until_completion(Duration::from_millis(5))
        else {
            panic!("no packet received");
        };
        assert!((rig.bus.time() - start).total_micros() < 176 + 12 + 26 * 44 + 44);
        assert_eq!(info.size, 26);
        assert_eq!(info.kind, PacketKind::Rdm(CommandClass::GetCommand));
        assert_eq!(info.destination, Some(ME));
        assert!(info.addressed_to_us);
        assert!(!info.sent_previous);
    }

    #[test]
    fn discovery_mute_suppresses_branch() {
        let mut rig = Rig::new();
        rig.bus.inject_packet(
            Some((176, 12)),
            &rdm_request(ME, CommandClass::DiscoveryCommand, PID_DISC_MUTE),
        );
        assert!(rig.run_until_completion(Duration::from_millis(5)).is_some());
        assert!(rig.rdm.is_discovery_muted());

        rig.bus.inject_packet(
            Some((176, 12)),
            &rdm_request(
                Uid::BROADCAST,
                CommandClass::DiscoveryCommand,
                PID_DISC_UNIQUE_BRANCH,
            ),
        );
        let Some(Completion::Received(info)) = rig.run_until_completion(Duration::from_millis(5))
        else {
            panic!("no packet received");
        };
        assert!(info.discovery_suppressed);
        assert!(info.addressed_to_us);
    }

    #[test]
    fn framing_error_aborts_packet() {
        let mut rig = Rig::with_warnings(vec!["Receive failed: framing error on the DMX line"]);
        rig.bus.inject_packet(Some((176, 12)), &[0, 1, 2, 3]);
        rig.bus.advance(Duration::from_micros(176 + 12 + 2 * 44));
        rig.bus.inject_framing_error();

        assert_eq!(
            rig.run_until_completion(Duration::from_millis(5)),
            Some(Completion::ReceiveFailed(crate::Error::FramingError))
        );
        assert!(rig.frame.is_idle());
    }

    #[test]
    fn oversized_packet_overflows() {
        let mut rig =
            Rig::with_warnings(vec!["Receive failed: packet exceeds the maximum packet size"]);
        let data = vec![0u8; DMX_MAX_PACKET_SIZE + 1];
        rig.bus.inject_packet(Some((176, 12)), &data);
        assert_eq!(
            rig.run_until_completion(Duration::from_millis(30)),
            Some(Completion::ReceiveFailed(crate::Error::BufferOverflow))
        );
        assert!(rig.frame.is_idle());
    }

    #[test]
    fn full_size_packet_ends_on_idle_line() {
        let mut rig = Rig::new();
        let data: Vec<u8> = (0..DMX_MAX_PACKET_SIZE).map(|i| i as u8).collect();
        rig.bus.inject_packet(Some((176, 12)), &data);
        let Some(Completion::Received(info)) = rig.run_until_completion(Duration::from_millis(30))
        else {
            panic!("no packet received");
        };
        assert_eq!(info.size, DMX_MAX_PACKET_SIZE);
        assert_eq!(&rig.buf[..], &data[..]);
    }

    #[test]
    fn transmits_with_reset_sequence() {
        let mut rig = Rig::new();
        let data = [0x00, 0x10, 0x20, 0x30];
        rig.buf[..4].copy_from_slice(&data);
        rig.frame
            .arm_transmit(&mut rig.uart, &mut rig.reset, 4, 176, 12)
            .unwrap();
        assert!(rig.frame.is_sending());
        assert!(rig.frame.is_in_break());
        assert!(!rig.frame.is_receiving());

        // A second transmission cannot be armed meanwhile
        assert_eq!(
            rig.frame
                .arm_transmit(&mut rig.uart, &mut rig.reset, 4, 176, 12),
            Err(crate::Error::OperationInProgress)
        );

        let Some(Completion::Sent(info)) = rig.run_until_completion(Duration::from_millis(5))
        else {
            panic!("transmission did not complete");
        };
        assert!(info.sent_previous);
        assert_eq!(info.kind, PacketKind::Dmx);
        assert!(!rig.frame.is_sending());
        assert_eq!(rig.bus.captured_packets().last().unwrap(), &("dut", data.to_vec()));
        assert!(rig.peer.pending_events().contains(UartEvents::RX_BREAK));
    }

    #[test]
    fn accepts_discovery_response_after_branch() {
        let mut rig = Rig::new();
        let dub = rdm_request(
            Uid::BROADCAST,
            CommandClass::DiscoveryCommand,
            PID_DISC_UNIQUE_BRANCH,
        );
        rig.buf[..dub.len()].copy_from_slice(&dub);
        rig.frame
            .arm_transmit(&mut rig.uart, &mut rig.reset, dub.len(), 176, 12)
            .unwrap();
        assert!(matches!(
            rig.run_until_completion(Duration::from_millis(5)),
            Some(Completion::Sent(_))
        ));

        let mut response = vec![0xfe; 7];
        response.push(0xaa);
        response.extend_from_slice(&[0x55; 16]);
        rig.bus.inject_packet(None, &response);

        let Some(Completion::Received(info)) = rig.run_until_completion(Duration::from_millis(5))
        else {
            panic!("discovery response not received");
        };
        assert_eq!(info.kind, PacketKind::RdmDiscoveryResponse);
        assert_eq!(info.size, 24);
        assert_eq!(&rig.buf[..24], &response[..]);

        // Without a preceding branch request, breakless data is noise
        rig.bus.inject_packet(None, &response);
        assert_eq!(rig.run_until_completion(Duration::from_millis(2)), None);
    }

    #[test]
    fn held_buffer_drops_next_packet() {
        let mut rig =
            Rig::with_warnings(vec!["Dropped packet, previous one was not picked up yet"]);
        rig.bus.inject_packet(Some((176, 12)), &[0, 42]);
        assert!(rig.run_until_completion(Duration::from_millis(2)).is_some());
        rig.frame.hold();

        rig.bus.inject_packet(Some((176, 12)), &[0, 99]);
        assert_eq!(rig.run_until_completion(Duration::from_millis(2)), None);
        assert_eq!(rig.frame.dropped_packets(), 1);
        assert_eq!(rig.buf[1], 42);

        rig.frame.release();
        rig.bus.inject_packet(Some((176, 12)), &[0, 7]);
        assert!(rig.run_until_completion(Duration::from_millis(2)).is_some());
        assert_eq!(rig.buf[1], 7);
    }

    #[test]
    fn break_without_slots_times_out() {
        let mut rig = Rig::with_warnings(vec!["Receive failed: timed out"]);
        rig.bus.inject_packet(Some((176, 12)), &[]);
        assert_eq!(rig.run_until_completion(Duration::from_millis(1)), None);
        assert!(rig.frame.is_receiving());
        assert!(rig.frame.is_in_break());

        let now = rig.bus.time();
        assert_eq!(rig.frame.check_timeout(now), None);

        // No UART event arrives anymore, the packet timeout alone ends the packet
        let later = rig.bus.advance(PACKET_TIMEOUT);
        assert_eq!(
            rig.frame.check_timeout(later),
            Some(Completion::ReceiveFailed(crate::Error::Timeout))
        );
        assert!(rig.frame.is_idle());
        assert_eq!(rig.frame.check_timeout(later), None);
        assert_eq!(
            rig.frame.arm_transmit(&mut rig.uart, &mut rig.reset, 2, 176, 12),
            Ok(())
        );
    }

    #[test]
    fn stalled_packet_times_out() {
        let mut rig = Rig::with_warnings(vec!["Receive failed: timed out"]);
        rig.bus.inject_packet(Some((176, 12)), &[]);
        assert_eq!(rig.run_until_completion(Duration::from_millis(1)), None);

        // Slots showing up long after the break do not continue the packet
        rig.bus.advance(PACKET_TIMEOUT);
        rig.bus.inject_packet(None, &[0x00, 1]);
        assert_eq!(
            rig.run_until_completion(Duration::from_millis(1)),
            Some(Completion::ReceiveFailed(crate::Error::Timeout))
        );
        assert!(rig.frame.is_idle());
        assert!(!rig.frame.is_receiving());

        rig.buf[..2].copy_from_slice(&[0x00, 0x42]);
        rig.frame
            .arm_transmit(&mut rig.uart, &mut rig.reset, 2, 176, 12)
            .unwrap();
        assert!(rig.frame.is_sending());
    }
}
