use std::borrow::Cow;
use std::io;
use std::io::{Read, Write};

use crate::phy::UartEvents;
use crate::time::Duration;

/// Idle gap after which the next received slot is taken to follow a new break.
///
/// Serial port APIs don't report break conditions, so a packet boundary is inferred from the
/// line going quiet.
const PACKET_GAP: std::time::Duration = std::time::Duration::from_micros(500);

/// Platform-independent UART implementation for serial port devices
///
/// Available with the `phy-serial` feature.
///
/// This is meant for USB-RS485 converters, for applications running within a general purpose
/// operating system.  Operating system serial drivers neither generate breaks of exact length
/// nor report received breaks, so:
///
/// - Breaks are shaped in software through the [`SerialTimer`] and `set_break()`/`clear_break()`
///   on the port.  Expect break and mark-after-break lengths to overshoot by the USB latency.
/// - Received breaks are inferred from an idle gap on the line.  Many operating systems deliver
///   the break itself as a `0x00` byte, which this implementation drops when it directly follows
///   such a gap and `break_as_null` is set.
///
/// Particularly FT232-based devices come with a 16ms latency by default; on Linux, low-latency
/// mode is enabled automatically.
///
/// Since there are no real interrupts, the driver's interrupt entry points must be polled, for
/// example from an [`InterruptThread`][`crate::phy::InterruptThread`] using
/// [`Instant::now()`][`crate::time::Instant::now`] as its clock.
pub struct SerialPortUart {
    port: Box<dyn serialport::SerialPort>,
    enabled: UartEvents,
    latched: UartEvents,
    irq_enabled: bool,
    break_as_null: bool,
    rx_buffer: Vec<u8>,
    last_rx: Option<std::time::Instant>,
    tx_active: bool,
}

impl SerialPortUart {
    pub fn new<'a, P: Into<Cow<'a, str>>>(serial_port: P, break_as_null: bool) -> io::Result<Self> {
        Self::new_inner(serial_port.into(), break_as_null)
    }

    fn new_inner(serial_port: Cow<'_, str>, break_as_null: bool) -> io::Result<Self> {
        #[allow(unused_mut)]
        let mut port = serialport::new(serial_port, crate::consts::DMX_BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .flow_control(serialport::FlowControl::None)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::Two)
            .open_native()?;

        #[cfg(target_os = "linux")]
        if let Err(e) = serialport_low_latency::enable_low_latency(&mut port) {
            log::warn!("Could not enable low-latency mode: {}", e);
        }

        Ok(Self {
            port: Box::new(port),
            enabled: UartEvents::empty(),
            latched: UartEvents::empty(),
            irq_enabled: false,
            break_as_null,
            rx_buffer: Vec::with_capacity(crate::consts::DMX_MAX_PACKET_SIZE),
            last_rx: None,
            tx_active: false,
        })
    }

    fn poll_rx(&mut self) {
        let available = match self.port.bytes_to_read() {
            Ok(n) => usize::try_from(n).unwrap_or(0),
            Err(e) => {
                log::warn!("Serial port status failed: {}", e);
                self.latched |= UartEvents::RX_FRAMING_ERROR;
                return;
            }
        };
        let now = std::time::Instant::now();

        if available == 0 {
            if let Some(last) = self.last_rx {
                if now.duration_since(last) >= PACKET_GAP && !self.rx_buffer.is_empty() {
                    self.latched |= UartEvents::RX_TIMEOUT;
                }
            }
            return;
        }

        if self.latched.contains(UartEvents::RX_BREAK) {
            // Nothing after the break may become visible before it was acknowledged.
            return;
        }
        let gap = self
            .last_rx
            .map_or(true, |last| now.duration_since(last) >= PACKET_GAP);
        if gap {
            if !self.rx_buffer.is_empty() {
                // Leftovers belong to the previous packet; report them before the break.
                return;
            }
            self.latched |= UartEvents::RX_BREAK;
            self.last_rx = Some(now);
            return;
        }

        let start = self.rx_buffer.len();
        self.rx_buffer.resize(start + available, 0);
        match self.port.read(&mut self.rx_buffer[start..]) {
            Ok(n) => {
                self.rx_buffer.truncate(start + n);
                if start == 0 && self.break_as_null && self.rx_buffer.first() == Some(&0x00) {
                    self.rx_buffer.remove(0);
                }
                self.last_rx = Some(now);
            }
            Err(e) => {
                log::warn!("Serial port read failed: {}", e);
                self.rx_buffer.truncate(start);
                self.latched |= UartEvents::RX_FRAMING_ERROR;
            }
        }
    }
}

impl core::fmt::Debug for SerialPortUart {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SerialPortUart")
            .field("port", &self.port.name())
            .field("enabled", &self.enabled)
            .field("latched", &self.latched)
            .finish()
    }
}

impl crate::phy::DmxUart for SerialPortUart {
    fn set_clock_enabled(&mut self, _enabled: bool) {}

    fn configure(&mut self, baud_rate: u32) {
        if let Err(e) = self.port.set_baud_rate(baud_rate) {
            log::warn!("Could not set baudrate {}: {}", baud_rate, e);
        }
    }

    fn enable_interrupt(&mut self, _priority: u8) {
        self.irq_enabled = true;
    }

    fn disable_interrupt(&mut self) {
        self.irq_enabled = false;
    }

    fn enable_events(&mut self, events: UartEvents) {
        self.enabled |= events;
    }

    fn disable_events(&mut self, events: UartEvents) {
        self.enabled &= !events;
    }

    fn pending_events(&mut self) -> UartEvents {
        if !self.irq_enabled {
            return UartEvents::empty();
        }
        self.poll_rx();

        let mut level = UartEvents::empty();
        if !self.rx_buffer.is_empty() {
            level |= UartEvents::RX_DATA;
        }
        match self.port.bytes_to_write() {
            Ok(0) => {
                level |= UartEvents::TX_FIFO_EMPTY;
                if self.tx_active {
                    self.tx_active = false;
                    self.latched |= UartEvents::TX_DONE;
                }
            }
            Ok(_) => (),
            Err(e) => log::warn!("Serial port status failed: {}", e),
        }

        (self.latched | level) & self.enabled
    }

    fn clear_events(&mut self, events: UartEvents) {
        self.latched &= !events;
    }

    fn read_rx_fifo(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.rx_buffer.len());
        buf[..count].copy_from_slice(&self.rx_buffer[..count]);
        self.rx_buffer.drain(..count);
        count
    }

    fn reset_rx_fifo(&mut self) {
        self.rx_buffer.clear();
        if let Err(e) = self.port.clear(serialport::ClearBuffer::Input) {
            log::warn!("Could not clear input buffer: {}", e);
        }
    }

    fn write_tx_fifo(&mut self, data: &[u8]) -> usize {
        // TODO: Technically we need to ensure this never blocks
        match self.port.write(data) {
            Ok(n) => {
                self.tx_active |= n > 0;
                n
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                log::warn!("Serial port write failed: {}", e);
                0
            }
        }
    }

    fn reset_tx_fifo(&mut self) {
        if let Err(e) = self.port.clear(serialport::ClearBuffer::Output) {
            log::warn!("Could not clear output buffer: {}", e);
        }
    }

    fn set_transmit_enabled(&mut self, enabled: bool) {
        // Most converters switch direction automatically; drive RTS for those which don't.
        if let Err(e) = self.port.write_request_to_send(enabled) {
            log::trace!("Could not set RTS: {}", e);
        }
    }

    fn supports_native_break(&self) -> bool {
        false
    }

    fn start_break(&mut self, _break_len: u32, _mab_len: u32) {
        unreachable!("serial ports have no timed break generator");
    }

    fn set_line_low(&mut self, low: bool) {
        let res = if low {
            self.port.set_break()
        } else {
            self.port.clear_break()
        };
        if let Err(e) = res {
            log::warn!("Could not toggle break condition: {}", e);
        }
    }
}

/// Software alarm timer on the operating system clock
///
/// Companion to [`SerialPortUart`] for shaping the reset sequence.
#[derive(Debug, Default)]
pub struct SerialTimer {
    alarm_at: Option<std::time::Instant>,
    irq_enabled: bool,
}

impl SerialTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl crate::phy::ResetTimer for SerialTimer {
    fn enable_interrupt(&mut self, _priority: u8) {
        self.irq_enabled = true;
    }

    fn disable_interrupt(&mut self) {
        self.irq_enabled = false;
    }

    fn start_alarm(&mut self, after: Duration) {
        self.alarm_at = Some(std::time::Instant::now() + std::time::Duration::from(after));
    }

    fn cancel(&mut self) {
        self.alarm_at = None;
    }

    fn take_alarm(&mut self) -> bool {
        match self.alarm_at {
            Some(at) if self.irq_enabled && std::time::Instant::now() >= at => {
                self.alarm_at = None;
                true
            }
            _ => false,
        }
    }
}
