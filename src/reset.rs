//! Generation of the break + mark-after-break preamble preceding every transmitted packet.
//!
//! Two strategies are supported:
//!
//! - [`ResetStrategy::Native`]: the UART holds the line low itself and reports the end of the
//!   break and of the mark-after-break through interrupt events.
//! - [`ResetStrategy::Timer`]: the transmit line is inverted by software and a one-shot timer
//!   schedules the end of each phase.
//!
//! Both report the same [`ResetStep`]s, so the frame state machine does not care which one is in
//! use.
use crate::phy::{DmxUart, ResetTimer, UartEvents};
use crate::time::Duration;

/// How the reset sequence is generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetStrategy {
    /// Use the UART's own break generator.
    #[default]
    Native,
    /// Use an auxiliary timer to toggle the line.
    Timer,
}

/// Progress of the reset sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStep {
    /// The break ended and the mark-after-break started.
    BreakDone,
    /// The mark-after-break ended; data may be sent.
    MabDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Break,
    Mab,
}

/// Reset sequence generator for one port
#[derive(Debug)]
pub struct ResetGenerator<T> {
    strategy: ResetStrategy,
    timer: Option<T>,
    phase: Phase,
    mab_len: u32,
}

impl<T: ResetTimer> ResetGenerator<T> {
    /// Create the generator.
    ///
    /// Fails with [`Error::Unsupported`][`crate::Error::Unsupported`] when the strategy can't be
    /// served by the given hardware.
    pub fn new<U: DmxUart>(
        strategy: ResetStrategy,
        uart: &U,
        timer: Option<T>,
    ) -> Result<Self, crate::Error> {
        match strategy {
            ResetStrategy::Native if !uart.supports_native_break() => {
                log::warn!("UART has no native break generator and no timer was given");
                return Err(crate::Error::Unsupported);
            }
            ResetStrategy::Timer if timer.is_none() => {
                log::warn!("Timer reset strategy selected without a timer");
                return Err(crate::Error::Unsupported);
            }
            _ => (),
        }
        Ok(Self {
            strategy,
            timer,
            phase: Phase::Idle,
            mab_len: 0,
        })
    }

    #[inline(always)]
    pub fn strategy(&self) -> ResetStrategy {
        self.strategy
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn enable_interrupt(&mut self, priority: u8) {
        if let Some(timer) = self.timer.as_mut() {
            timer.enable_interrupt(priority);
        }
    }

    /// Stop everything and hand back the timer.
    pub fn release(mut self) -> Option<T> {
        if let Some(timer) = self.timer.as_mut() {
            timer.cancel();
            timer.disable_interrupt();
        }
        self.timer.take()
    }

    /// Begin the break.  The line must already be driven by this port.
    pub fn start<U: DmxUart>(&mut self, uart: &mut U, break_len: u32, mab_len: u32) {
        debug_assert!(!self.is_active(), "reset sequence started twice");
        self.mab_len = mab_len;
        self.phase = Phase::Break;
        match (self.strategy, self.timer.as_mut()) {
            (ResetStrategy::Timer, Some(timer)) => {
                uart.set_line_low(true);
                timer.start_alarm(Duration::from_micros(u64::from(break_len)));
            }
            _ => {
                uart.clear_events(UartEvents::TX_BREAK_DONE | UartEvents::TX_MAB_DONE);
                uart.enable_events(UartEvents::TX_BREAK_DONE | UartEvents::TX_MAB_DONE);
                uart.start_break(break_len, mab_len);
            }
        }
    }

    /// Abort a running sequence and return the line to mark.
    pub fn abort<U: DmxUart>(&mut self, uart: &mut U) {
        if !self.is_active() {
            return;
        }
        match (self.strategy, self.timer.as_mut()) {
            (ResetStrategy::Timer, Some(timer)) => {
                timer.cancel();
                uart.set_line_low(false);
            }
            _ => uart.disable_events(UartEvents::TX_BREAK_DONE | UartEvents::TX_MAB_DONE),
        }
        self.phase = Phase::Idle;
    }

    /// Advance on UART events (native strategy).
    pub fn on_uart_events<U: DmxUart>(
        &mut self,
        uart: &mut U,
        events: UartEvents,
    ) -> Option<ResetStep> {
        if self.strategy != ResetStrategy::Native {
            return None;
        }
        match self.phase {
            Phase::Break if events.contains(UartEvents::TX_BREAK_DONE) => {
                uart.clear_events(UartEvents::TX_BREAK_DONE);
                self.phase = Phase::Mab;
                Some(ResetStep::BreakDone)
            }
            Phase::Mab if events.contains(UartEvents::TX_MAB_DONE) => {
                uart.clear_events(UartEvents::TX_MAB_DONE);
                uart.disable_events(UartEvents::TX_BREAK_DONE | UartEvents::TX_MAB_DONE);
                self.phase = Phase::Idle;
                Some(ResetStep::MabDone)
            }
            _ => None,
        }
    }

    /// Advance on the timer alarm (timer strategy).
    pub fn on_timer<U: DmxUart>(&mut self, uart: &mut U) -> Option<ResetStep> {
        let timer = self.timer.as_mut()?;
        if !timer.take_alarm() {
            return None;
        }
        match self.phase {
            Phase::Break => {
                uart.set_line_low(false);
                timer.start_alarm(Duration::from_micros(u64::from(self.mab_len)));
                self.phase = Phase::Mab;
                Some(ResetStep::BreakDone)
            }
            Phase::Mab => {
                self.phase = Phase::Idle;
                Some(ResetStep::MabDone)
            }
            Phase::Idle => {
                log::warn!("Spurious reset timer alarm");
                None
            }
        }
    }
}
