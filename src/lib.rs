//! # `dmxrust` - An interrupt-driven DMX512/RDM port driver
//!
//! _dmxrust_ drives up to [`DMX_NUM_MAX`][consts::DMX_NUM_MAX] DMX512 ports, each backed by a
//! UART-class peripheral wired to an RS-485 transceiver:
//!
//! - The [`phy`] module abstracts the peripherals (UART, reset timer, sniffer pin) and contains
//!   a line simulator and a `serialport` backend.
//! - The [`driver`] module manages installed ports and offers blocking send/receive to tasks.
//! - The [`frame`] module is the per-port packet state machine run from interrupt context.
//! - The [`rdm`] module knows just enough RDM to classify packets, stamp outbound requests, and
//!   track the discovery mute state.
//! - The [`sniffer`] module measures break and mark-after-break timing of received packets.
//!
//! # Example
//! Two ports on a simulated line, one sending to the other:
//!
//! ```
//! use dmxrust::{driver, phy, time, PortNumber};
//!
//! let bus = phy::SimulatorBus::new();
//! let registry: driver::DriverRegistry<phy::SimulatorUart> = driver::DriverRegistry::new();
//!
//! let tx_port = PortNumber::new(0).unwrap();
//! let rx_port = PortNumber::new(1).unwrap();
//! let config = driver::DriverConfig::default();
//! let tx = registry
//!     .install(tx_port, bus.uart("tx"), None, vec![0; 513].into(), config.clone())
//!     .unwrap();
//! let rx = registry
//!     .install(rx_port, bus.uart("rx"), None, vec![0; 513].into(), config)
//!     .unwrap();
//!
//! // Emulate interrupt context
//! let irq = {
//!     let (tx, rx, clock) = (tx.clone(), rx.clone(), bus.clone());
//!     phy::InterruptThread::spawn(
//!         move || clock.advance(time::Duration::from_micros(4)),
//!         vec![Box::new(move |now| {
//!             tx.handle_uart_interrupt(now);
//!             rx.handle_uart_interrupt(now);
//!         })],
//!     )
//! };
//!
//! let receiver = std::thread::spawn(move || {
//!     let mut data = [0u8; 513];
//!     rx.receive(&mut data, std::time::Duration::from_secs(5))
//!         .map(|info| data[..info.size].to_vec())
//! });
//! while !registry.get(rx_port).map_or(false, |p| p.has_waiter()) {
//!     std::thread::yield_now();
//! }
//!
//! tx.send_blocking(&[0x00, 0xff, 0x80, 0x00], std::time::Duration::from_secs(1)).unwrap();
//! assert_eq!(receiver.join().unwrap().unwrap(), vec![0x00, 0xff, 0x80, 0x00]);
//! irq.stop();
//! ```
#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod consts;
pub mod context;
#[cfg(feature = "std")]
pub mod driver;
pub mod error;
pub mod frame;
pub mod handoff;
pub mod phy;
pub mod rdm;
pub mod reset;
pub mod sniffer;
pub mod time;

#[cfg(all(test, feature = "std"))]
pub mod test_utils;

pub use error::Error;

/// Index of a DMX port, below [`DMX_NUM_MAX`][consts::DMX_NUM_MAX]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortNumber(u8);

impl PortNumber {
    /// Returns `None` for port numbers the driver can't manage.
    pub const fn new(num: u8) -> Option<Self> {
        if (num as usize) < consts::DMX_NUM_MAX {
            Some(Self(num))
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn get(self) -> u8 {
        self.0
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// All valid port numbers in ascending order.
    pub fn all() -> impl Iterator<Item = PortNumber> {
        (0..consts::DMX_NUM_MAX as u8).map(PortNumber)
    }
}

impl TryFrom<u8> for PortNumber {
    type Error = Error;

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        Self::new(num).ok_or(Error::InvalidArgument)
    }
}

impl core::fmt::Display for PortNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_number_range() {
        assert_eq!(PortNumber::all().count(), consts::DMX_NUM_MAX);
        assert!(PortNumber::new(consts::DMX_NUM_MAX as u8).is_none());
        assert_eq!(
            PortNumber::try_from(200),
            Err(Error::InvalidArgument)
        );
        assert_eq!(PortNumber::try_from(2).map(PortNumber::index), Ok(2));
        assert_eq!(format!("{}", PortNumber::new(1).unwrap()), "1");
    }
}
