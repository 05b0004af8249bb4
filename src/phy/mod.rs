//! Abstractions over the peripherals a DMX port is driven by.
//!
//! A port needs a UART-class peripheral with break/framing status ([`DmxUart`]), optionally a
//! general purpose timer to shape the reset sequence when the UART cannot generate breaks itself
//! ([`ResetTimer`]), and optionally a GPIO with edge interrupts mirroring the line for the sniffer
//! ([`SnifferPin`]).
//!
//! Implementations:
//! - [`SimulatorBus`] (feature `phy-simulator`): a simulated DMX line for host-side testing.
//! - [`SerialPortUart`] (feature `phy-serial`): USB-RS485 adapters through the `serialport` crate.
#[cfg(feature = "phy-serial")]
mod serial;
#[cfg(feature = "phy-serial")]
pub use serial::{SerialPortUart, SerialTimer};

#[cfg(feature = "phy-simulator")]
mod simulator;
#[cfg(feature = "phy-simulator")]
pub use simulator::{SimulatorBus, SimulatorPin, SimulatorTimer, SimulatorUart};

#[cfg(feature = "std")]
mod irq_thread;
#[cfg(feature = "std")]
pub use irq_thread::InterruptThread;

use crate::time::{Duration, Instant};

/// Storage for one packet.
///
/// With `std` this is usually a `Vec<u8>`, on bare metal a `&'static mut [u8]`.
pub type BufferHandle = managed::ManagedSlice<'static, u8>;

bitflags::bitflags! {
    /// Interrupt events a UART-class peripheral reports to the DMX driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UartEvents: u32 {
        /// The receive FIFO holds data.
        const RX_DATA = 1 << 0;
        /// The line went idle after data was received.
        const RX_TIMEOUT = 1 << 1;
        /// A break condition was detected on the line.
        const RX_BREAK = 1 << 2;
        /// A slot was received with a missing stop bit.
        const RX_FRAMING_ERROR = 1 << 3;
        /// The receive FIFO overflowed and data was lost.
        const RX_OVERFLOW = 1 << 4;
        /// The transmit FIFO is empty and can take more data.
        const TX_FIFO_EMPTY = 1 << 5;
        /// All queued data has been shifted out onto the line.
        const TX_DONE = 1 << 6;
        /// A natively generated break has ended.
        const TX_BREAK_DONE = 1 << 7;
        /// A natively generated mark-after-break has ended.
        const TX_MAB_DONE = 1 << 8;

        const RX_ALL = Self::RX_DATA.bits()
            | Self::RX_TIMEOUT.bits()
            | Self::RX_BREAK.bits()
            | Self::RX_FRAMING_ERROR.bits()
            | Self::RX_OVERFLOW.bits();
        const TX_ALL = Self::TX_FIFO_EMPTY.bits()
            | Self::TX_DONE.bits()
            | Self::TX_BREAK_DONE.bits()
            | Self::TX_MAB_DONE.bits();
    }
}

impl UartEvents {
    /// Events that abort a packet being received.
    pub const RX_ERRORS: UartEvents = UartEvents::RX_FRAMING_ERROR.union(UartEvents::RX_OVERFLOW);
}

/// A UART-class peripheral wired to an RS-485 transceiver.
///
/// All methods are called with the port's critical section held, either from the UART interrupt
/// or from task context while arming an operation.  None of them may block.
pub trait DmxUart {
    /// Gate the peripheral's clock and power.
    fn set_clock_enabled(&mut self, enabled: bool);

    /// Configure the line for the given baudrate, 8 data bits, no parity, 2 stop bits.
    fn configure(&mut self, baud_rate: u32);

    /// Register the UART interrupt at the given priority.
    fn enable_interrupt(&mut self, priority: u8);

    /// Unregister the UART interrupt.
    fn disable_interrupt(&mut self);

    fn enable_events(&mut self, events: UartEvents);

    fn disable_events(&mut self, events: UartEvents);

    /// Enabled events which are currently pending.
    ///
    /// When [`UartEvents::RX_BREAK`] is reported together with [`UartEvents::RX_DATA`], the data
    /// in the receive FIFO was received *before* the break.
    fn pending_events(&mut self) -> UartEvents;

    /// Acknowledge latched events.
    fn clear_events(&mut self, events: UartEvents);

    /// Move received data into `buf`, returning how many bytes were read.
    fn read_rx_fifo(&mut self, buf: &mut [u8]) -> usize;

    fn reset_rx_fifo(&mut self);

    /// Queue data for transmission, returning how many bytes the FIFO accepted.
    fn write_tx_fifo(&mut self, data: &[u8]) -> usize;

    fn reset_tx_fifo(&mut self);

    /// Switch the RS-485 transceiver between driving (`true`) and listening (`false`).
    fn set_transmit_enabled(&mut self, enabled: bool);

    /// Whether [`DmxUart::start_break()`] is implemented by this peripheral.
    fn supports_native_break(&self) -> bool;

    /// Hold the line low for `break_len` µs, then high for `mab_len` µs.
    ///
    /// Ends of both phases are reported through [`UartEvents::TX_BREAK_DONE`] and
    /// [`UartEvents::TX_MAB_DONE`].  Data written to the FIFO meanwhile is held back until the
    /// mark-after-break has passed.
    fn start_break(&mut self, break_len: u32, mab_len: u32);

    /// Force the transmit line low (inverted idle) or release it.
    fn set_line_low(&mut self, low: bool);
}

/// A one-shot alarm timer used to shape the reset sequence in software.
pub trait ResetTimer {
    /// Register the timer interrupt at the given priority.
    fn enable_interrupt(&mut self, priority: u8);

    fn disable_interrupt(&mut self);

    /// Fire the alarm once, `after` from now.  Re-arming replaces a pending alarm.
    fn start_alarm(&mut self, after: Duration);

    fn cancel(&mut self);

    /// Whether the alarm fired.  Acknowledges it.
    fn take_alarm(&mut self) -> bool;
}

/// Placeholder timer type for ports which only use native break generation.
#[derive(Debug)]
pub enum NoTimer {}

impl ResetTimer for NoTimer {
    fn enable_interrupt(&mut self, _priority: u8) {
        match *self {}
    }

    fn disable_interrupt(&mut self) {
        match *self {}
    }

    fn start_alarm(&mut self, _after: Duration) {
        match *self {}
    }

    fn cancel(&mut self) {
        match *self {}
    }

    fn take_alarm(&mut self) -> bool {
        match *self {}
    }
}

/// A line level change observed on the sniffer pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Line level after the edge (`true` = mark/high).
    pub level: bool,
    pub timestamp: Instant,
}

impl Edge {
    #[inline(always)]
    pub fn is_rising(&self) -> bool {
        self.level
    }
}

/// A GPIO mirroring the DMX line, with an edge interrupt.
pub trait SnifferPin {
    fn enable_edge_interrupt(&mut self, priority: u8);

    fn disable_edge_interrupt(&mut self);

    /// The next unhandled edge, timestamped as close to the hardware event as possible.
    fn next_edge(&mut self) -> Option<Edge>;
}
