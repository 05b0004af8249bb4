//! Peripheral power state, per port.
//!
//! The hardware context is independent of any installed driver: it may be touched during
//! peripheral bring-up before a driver exists, and it is never guarded by the port mutex a
//! blocked task could be holding.  Each flip of the enable flag happens inside a short critical
//! section together with the clock gate write.
use core::cell::Cell;

use crate::consts::DMX_NUM_MAX;
use crate::phy::DmxUart;
use crate::PortNumber;

/// Power/clock state of one port's UART peripheral
#[derive(Debug)]
pub struct HardwareContext {
    enabled: critical_section::Mutex<Cell<bool>>,
}

impl HardwareContext {
    pub const fn new() -> Self {
        Self {
            enabled: critical_section::Mutex::new(Cell::new(false)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        critical_section::with(|cs| self.enabled.borrow(cs).get())
    }

    /// Clock the peripheral.
    ///
    /// Returns `false` when the peripheral was already enabled.
    pub fn enable<U: DmxUart>(&self, uart: &mut U) -> bool {
        critical_section::with(|cs| {
            let enabled = self.enabled.borrow(cs);
            if enabled.get() {
                return false;
            }
            uart.set_clock_enabled(true);
            enabled.set(true);
            true
        })
    }

    /// Gate the peripheral's clock.
    ///
    /// `in_flight` tells whether a send or receive is still ongoing on this port; disabling the
    /// peripheral underneath it is refused.
    pub fn disable<U: DmxUart>(&self, uart: &mut U, in_flight: bool) -> Result<bool, crate::Error> {
        critical_section::with(|cs| {
            let enabled = self.enabled.borrow(cs);
            if in_flight {
                return Err(crate::Error::OperationInProgress);
            }
            if !enabled.get() {
                return Ok(false);
            }
            uart.set_clock_enabled(false);
            enabled.set(false);
            Ok(true)
        })
    }
}

impl Default for HardwareContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One [`HardwareContext`] per port
#[derive(Debug, Default)]
pub struct HardwareRegistry {
    contexts: [HardwareContext; DMX_NUM_MAX],
}

impl HardwareRegistry {
    pub const fn new() -> Self {
        Self {
            contexts: [
                HardwareContext::new(),
                HardwareContext::new(),
                HardwareContext::new(),
            ],
        }
    }

    #[inline(always)]
    pub fn context(&self, port: PortNumber) -> &HardwareContext {
        &self.contexts[port.index()]
    }

    pub fn is_enabled(&self, port: PortNumber) -> bool {
        self.context(port).is_enabled()
    }

    pub fn enable<U: DmxUart>(&self, port: PortNumber, uart: &mut U) {
        if self.context(port).enable(uart) {
            log::info!("Enabled UART peripheral of DMX port {}", port);
        }
    }

    pub fn disable<U: DmxUart>(
        &self,
        port: PortNumber,
        uart: &mut U,
        in_flight: bool,
    ) -> Result<(), crate::Error> {
        if self.context(port).disable(uart, in_flight)? {
            log::info!("Disabled UART peripheral of DMX port {}", port);
        }
        Ok(())
    }
}
