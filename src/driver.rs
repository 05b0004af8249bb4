//! Driver registry and the task-facing port API
//!
//! A [`DriverRegistry`] owns up to [`DMX_NUM_MAX`] installed ports.  Installing a port hands the
//! peripherals and the packet buffer to the driver and returns a [`Port`] handle, which can be
//! cloned freely and shared between tasks and the interrupt glue.
//!
//! Each port has two locks:
//!
//! - a task-level mutex serializing send/receive calls; a blocking call holds it for its whole
//!   duration,
//! - a critical section guarding everything the interrupt handlers touch.  Tasks only ever hold
//!   it for a few instructions.
//!
//! The platform glue must call [`Port::handle_uart_interrupt()`],
//! [`Port::handle_timer_interrupt()`], and [`Port::handle_sniffer_interrupt()`] from the
//! respective interrupt handlers.  On the host, a [`InterruptThread`][crate::phy::InterruptThread]
//! can stand in for them.
use core::cell::RefCell;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::consts::{
    BREAK_LEN_DEFAULT, BREAK_LEN_TX_MIN, DMX_BAUD_RATE, DMX_MAX_PACKET_SIZE, DMX_NUM_MAX,
    LINE_TIMING_MAX, MAB_LEN_DEFAULT, MAB_LEN_TX_MIN, SNIFFER_INTR_PRIORITY, UART_INTR_PRIORITY,
};
use crate::context::HardwareRegistry;
use crate::frame::{Completion, FrameMachine, PacketInfo};
use crate::handoff::{Intent, WaitSlot};
use crate::phy::{BufferHandle, DmxUart, NoTimer, ResetTimer, SnifferPin, UartEvents};
use crate::rdm::{RdmContext, Uid};
use crate::reset::{ResetGenerator, ResetStrategy};
use crate::sniffer::{NoPin, Sniffer, SnifferData};
use crate::time::Instant;
use crate::{Error, PortNumber};

/// Upper bound of event batches handled per UART interrupt
const MAX_EVENT_ROUNDS: usize = 16;

/// Per-port driver configuration
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DriverConfig {
    /// Transmitted break length in µs
    pub break_len: u32,
    /// Transmitted mark-after-break length in µs
    pub mab_len: u32,
    /// Slot count after which a received packet is considered complete
    pub rx_size: usize,
    /// Priority of the UART and reset timer interrupts
    pub interrupt_priority: u8,
    pub reset_strategy: ResetStrategy,
    /// RDM UID of this device
    pub uid: Uid,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            break_len: BREAK_LEN_DEFAULT,
            mab_len: MAB_LEN_DEFAULT,
            rx_size: DMX_MAX_PACKET_SIZE,
            interrupt_priority: UART_INTR_PRIORITY,
            reset_strategy: ResetStrategy::Native,
            uid: Uid::default(),
        }
    }
}

fn check_break_len(break_len: u32) -> Result<u32, Error> {
    if (BREAK_LEN_TX_MIN..=LINE_TIMING_MAX).contains(&break_len) {
        Ok(break_len)
    } else {
        Err(Error::InvalidArgument)
    }
}

fn check_mab_len(mab_len: u32) -> Result<u32, Error> {
    if (MAB_LEN_TX_MIN..=LINE_TIMING_MAX).contains(&mab_len) {
        Ok(mab_len)
    } else {
        Err(Error::InvalidArgument)
    }
}

fn check_rx_size(rx_size: usize) -> Result<usize, Error> {
    if (1..=DMX_MAX_PACKET_SIZE).contains(&rx_size) {
        Ok(rx_size)
    } else {
        Err(Error::InvalidArgument)
    }
}

impl DriverConfig {
    /// Check all parameters against the limits of the DMX line.
    pub fn verify(&self) -> Result<(), Error> {
        check_break_len(self.break_len)?;
        check_mab_len(self.mab_len)?;
        check_rx_size(self.rx_size)?;
        Ok(())
    }
}

/// Builder for [`DriverConfig`]
///
/// ```
/// # use dmxrust::driver::DriverConfigBuilder;
/// let config = DriverConfigBuilder::new()
///     .break_len(200)
///     .mab_len(16)
///     .build_verified()
///     .unwrap();
/// assert_eq!(config.break_len, 200);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DriverConfigBuilder(DriverConfig);

impl DriverConfigBuilder {
    pub fn new() -> Self {
        Self(DriverConfig::default())
    }

    pub fn break_len(&mut self, break_len: u32) -> &mut Self {
        self.0.break_len = break_len;
        self
    }

    pub fn mab_len(&mut self, mab_len: u32) -> &mut Self {
        self.0.mab_len = mab_len;
        self
    }

    pub fn rx_size(&mut self, rx_size: usize) -> &mut Self {
        self.0.rx_size = rx_size;
        self
    }

    pub fn interrupt_priority(&mut self, priority: u8) -> &mut Self {
        self.0.interrupt_priority = priority;
        self
    }

    pub fn reset_strategy(&mut self, strategy: ResetStrategy) -> &mut Self {
        self.0.reset_strategy = strategy;
        self
    }

    pub fn uid(&mut self, uid: Uid) -> &mut Self {
        self.0.uid = uid;
        self
    }

    /// Build the configuration, clamping timing parameters into the range a transmitter may
    /// use.
    pub fn build(&self) -> DriverConfig {
        let mut config = self.0.clone();
        config.break_len = config.break_len.clamp(BREAK_LEN_TX_MIN, LINE_TIMING_MAX);
        config.mab_len = config.mab_len.clamp(MAB_LEN_TX_MIN, LINE_TIMING_MAX);
        config.rx_size = config.rx_size.clamp(1, DMX_MAX_PACKET_SIZE);
        config
    }

    /// Build the configuration, refusing out-of-range parameters.
    pub fn build_verified(&self) -> Result<DriverConfig, Error> {
        self.0.verify()?;
        Ok(self.0.clone())
    }
}

/// Everything the interrupt handlers touch
#[derive(Debug)]
struct IsrShared<U, T, P> {
    uart: U,
    reset: ResetGenerator<T>,
    frame: FrameMachine,
    buffer: BufferHandle,
    waiter: WaitSlot<std::thread::Thread, Result<PacketInfo, Error>>,
    sniffer: Option<Sniffer<P>>,
    break_len: u32,
    mab_len: u32,
}

#[derive(Debug)]
struct PortInner<U, T, P> {
    num: PortNumber,
    lock: Mutex<()>,
    shared: critical_section::Mutex<RefCell<Option<IsrShared<U, T, P>>>>,
    rdm: RdmContext,
}

/// Handle to an installed DMX port
///
/// All methods fail with [`Error::PortNotInstalled`] once the port was uninstalled.
#[derive(Debug)]
pub struct Port<U, T = NoTimer, P = NoPin> {
    inner: Arc<PortInner<U, T, P>>,
}

impl<U, T, P> Clone for Port<U, T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Peripherals and buffer returned by [`DriverRegistry::uninstall()`]
#[derive(Debug)]
pub struct Released<U, T = NoTimer, P = NoPin> {
    pub uart: U,
    pub timer: Option<T>,
    pub pin: Option<P>,
    pub buffer: BufferHandle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A task panicking while holding the port lock leaves no state behind the lock itself.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `None` while another task holds the lock.
fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

fn copy_packet(src: &[u8], dst: &mut [u8]) {
    let count = src.len().min(dst.len());
    dst[..count].copy_from_slice(&src[..count]);
}

/// The set of installed DMX ports
#[derive(Debug)]
pub struct DriverRegistry<U, T = NoTimer, P = NoPin> {
    slots: [Mutex<Option<Port<U, T, P>>>; DMX_NUM_MAX],
    hardware: HardwareRegistry,
}

impl<U, T, P> Default for DriverRegistry<U, T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U, T, P> DriverRegistry<U, T, P> {
    pub const fn new() -> Self {
        Self {
            slots: [Mutex::new(None), Mutex::new(None), Mutex::new(None)],
            hardware: HardwareRegistry::new(),
        }
    }

    /// Power state of the port peripherals.
    #[inline(always)]
    pub fn hardware(&self) -> &HardwareRegistry {
        &self.hardware
    }

    pub fn get(&self, port: PortNumber) -> Option<Port<U, T, P>> {
        lock(&self.slots[port.index()]).clone()
    }

    pub fn is_installed(&self, port: PortNumber) -> bool {
        lock(&self.slots[port.index()]).is_some()
    }
}

impl<U: DmxUart, T: ResetTimer, P: SnifferPin> DriverRegistry<U, T, P> {
    /// Install the driver on `port`.
    ///
    /// `timer` is only needed for [`ResetStrategy::Timer`].  `buffer` must hold at least
    /// [`DMX_MAX_PACKET_SIZE`] bytes; it is used for both directions.
    pub fn install(
        &self,
        port: PortNumber,
        mut uart: U,
        timer: Option<T>,
        buffer: BufferHandle,
        config: DriverConfig,
    ) -> Result<Port<U, T, P>, Error> {
        config.verify()?;
        if buffer.len() < DMX_MAX_PACKET_SIZE {
            log::debug!(
                "Buffer of {} bytes is too small for port {}",
                buffer.len(),
                port
            );
            return Err(Error::InvalidArgument);
        }

        let mut slot = lock(&self.slots[port.index()]);
        if slot.is_some() {
            return Err(Error::PortAlreadyInstalled);
        }

        self.hardware.enable(port, &mut uart);
        let mut reset = match ResetGenerator::new(config.reset_strategy, &uart, timer) {
            Ok(reset) => reset,
            Err(e) => {
                self.hardware.disable(port, &mut uart, false)?;
                return Err(e);
            }
        };
        uart.configure(DMX_BAUD_RATE);
        uart.set_transmit_enabled(false);
        reset.enable_interrupt(config.interrupt_priority);

        let mut frame = FrameMachine::new(config.rx_size);
        frame.start_listening(&mut uart);
        uart.enable_interrupt(config.interrupt_priority);

        let handle = Port {
            inner: Arc::new(PortInner {
                num: port,
                lock: Mutex::new(()),
                shared: critical_section::Mutex::new(RefCell::new(Some(IsrShared {
                    uart,
                    reset,
                    frame,
                    buffer,
                    waiter: WaitSlot::new(),
                    sniffer: None,
                    break_len: config.break_len,
                    mab_len: config.mab_len,
                }))),
                rdm: RdmContext::new(config.uid),
            }),
        };
        *slot = Some(handle.clone());

        log::info!(
            "Installed DMX driver on port {} ({:?} reset, UID {})",
            port,
            config.reset_strategy,
            config.uid,
        );
        Ok(handle)
    }

    /// Remove the driver from `port` and hand back its peripherals.
    ///
    /// Refused with [`Error::OperationInProgress`] while a task uses the port or a transmission
    /// is still going out.
    pub fn uninstall(&self, port: PortNumber) -> Result<Released<U, T, P>, Error> {
        let mut slot = lock(&self.slots[port.index()]);
        let handle = slot.as_ref().ok_or(Error::PortNotInstalled)?;

        let _guard = try_lock(&handle.inner.lock).ok_or(Error::OperationInProgress)?;
        let shared = critical_section::with(|cs| {
            let mut shared = handle.inner.shared.borrow_ref_mut(cs);
            let busy = match shared.as_ref() {
                None => return Err(Error::PortNotInstalled),
                Some(s) => s.frame.is_sending() || s.waiter.is_occupied(),
            };
            if busy {
                return Err(Error::OperationInProgress);
            }
            shared.take().ok_or(Error::PortNotInstalled)
        })?;
        drop(_guard);
        *slot = None;

        let IsrShared {
            mut uart,
            mut reset,
            mut frame,
            buffer,
            sniffer,
            ..
        } = shared;
        frame.cancel(&mut uart, &mut reset);
        uart.disable_events(UartEvents::RX_ALL | UartEvents::TX_ALL);
        uart.disable_interrupt();
        let timer = reset.release();
        let pin = sniffer.map(Sniffer::detach);
        self.hardware.disable(port, &mut uart, false)?;

        log::info!("Uninstalled DMX driver from port {}", port);
        Ok(Released {
            uart,
            timer,
            pin,
            buffer,
        })
    }
}

impl<U: DmxUart, T: ResetTimer, P: SnifferPin> Port<U, T, P> {
    #[inline(always)]
    pub fn number(&self) -> PortNumber {
        self.inner.num
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.inner.lock)
    }

    fn with_shared<R>(
        &self,
        f: impl FnOnce(&mut IsrShared<U, T, P>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        critical_section::with(|cs| {
            let mut shared = self.inner.shared.borrow_ref_mut(cs);
            f(shared.as_mut().ok_or(Error::PortNotInstalled)?)
        })
    }

    /// Start transmitting `data` (start code first) and return right away.
    ///
    /// RDM requests get this port's next transaction number and a fresh checksum.
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let _guard = self.lock();
        self.arm_send(data, false)
    }

    /// Transmit `data` and wait until its last slot left the line.
    pub fn send_blocking(
        &self,
        data: &[u8],
        timeout: std::time::Duration,
    ) -> Result<PacketInfo, Error> {
        let _guard = self.lock();
        self.arm_send(data, true)?;
        self.wait(timeout)
    }

    /// Wait for a transmission started with [`Port::send()`] to complete.
    ///
    /// Returns the metadata of the last packet right away when nothing is being sent.
    pub fn wait_sent(&self, timeout: std::time::Duration) -> Result<PacketInfo, Error> {
        let _guard = self.lock();
        let idle = self.with_shared(|s| {
            if !s.frame.is_sending() {
                return Ok(Some(*s.frame.previous()));
            }
            s.waiter.register(std::thread::current(), Intent::Send)?;
            Ok(None)
        })?;
        match idle {
            Some(info) => Ok(info),
            None => self.wait(timeout),
        }
    }

    fn arm_send(&self, data: &[u8], wait: bool) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if data.len() > DMX_MAX_PACKET_SIZE {
            return Err(Error::BufferOverflow);
        }
        self.with_shared(|s| {
            if s.frame.is_sending() || s.frame.is_receiving() || s.frame.is_held() {
                return Err(Error::OperationInProgress);
            }
            let packet = &mut s.buffer[..data.len()];
            packet.copy_from_slice(data);
            if let Some(tn) = self.inner.rdm.stamp_request(packet) {
                log::trace!("Port {}: RDM request number {}", self.inner.num, tn);
            }
            s.frame.arm_transmit(
                &mut s.uart,
                &mut s.reset,
                data.len(),
                s.break_len,
                s.mab_len,
            )?;
            if wait {
                s.waiter.register(std::thread::current(), Intent::Send)?;
            }
            Ok(())
        })?;
        log::debug!("Port {}: sending {} slots", self.inner.num, data.len());
        Ok(())
    }

    /// Wait for the next packet and copy it into `buf`.
    ///
    /// Packets longer than `buf` are truncated; the returned [`PacketInfo::size`] is the size on
    /// the line.  A receive may be started while a transmission from [`Port::send()`] is still
    /// going out, which is how an RDM controller catches the response to its request.
    pub fn receive(
        &self,
        buf: &mut [u8],
        timeout: std::time::Duration,
    ) -> Result<PacketInfo, Error> {
        // A second waiter is turned away here instead of queueing up on the port lock.
        let _guard = try_lock(&self.inner.lock).ok_or(Error::WaiterConflict)?;
        self.with_shared(|s| s.waiter.register(std::thread::current(), Intent::Receive))?;
        log::debug!("Port {}: waiting for a packet", self.inner.num);

        let info = self.wait(timeout)?;
        self.with_shared(|s| {
            copy_packet(&s.buffer[..info.size], buf);
            s.frame.release();
            Ok(())
        })?;
        Ok(info)
    }

    /// Block until the registered waiter got its outcome or `timeout` passed.
    fn wait(&self, timeout: std::time::Duration) -> Result<PacketInfo, Error> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.with_shared(|s| Ok(s.waiter.take_outcome()))? {
                return outcome;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return self.with_shared(|s| {
                    let intent = s.waiter.pending_intent();
                    // The outcome may have arrived just now.
                    if let Some(outcome) = s.waiter.unregister() {
                        return outcome;
                    }
                    // A receive started during a transmission leaves the transmission alone.
                    if !(intent == Some(Intent::Receive) && s.frame.is_sending()) {
                        s.frame.cancel(&mut s.uart, &mut s.reset);
                    }
                    log::debug!("Port {}: timed out after {:?}", self.inner.num, timeout);
                    Err(Error::Timeout)
                });
            }
            std::thread::park_timeout(deadline - now);
        }
    }

    /// Metadata of the last packet sent or received on this port.
    pub fn previous_packet(&self) -> Result<PacketInfo, Error> {
        self.with_shared(|s| Ok(*s.frame.previous()))
    }

    pub fn is_sending(&self) -> bool {
        self.with_shared(|s| Ok(s.frame.is_sending())).unwrap_or(false)
    }

    pub fn is_receiving(&self) -> bool {
        self.with_shared(|s| Ok(s.frame.is_receiving())).unwrap_or(false)
    }

    pub fn is_in_break(&self) -> bool {
        self.with_shared(|s| Ok(s.frame.is_in_break())).unwrap_or(false)
    }

    /// Sample `(is_sending, is_receiving)` atomically.
    pub fn line_state(&self) -> (bool, bool) {
        self.with_shared(|s| Ok((s.frame.is_sending(), s.frame.is_receiving())))
            .unwrap_or((false, false))
    }

    /// Whether a task is blocked on this port.
    pub fn has_waiter(&self) -> bool {
        self.with_shared(|s| Ok(s.waiter.pending_intent().is_some())).unwrap_or(false)
    }

    /// Packets which arrived while a received packet was waiting to be copied out.
    pub fn dropped_packets(&self) -> Result<u32, Error> {
        self.with_shared(|s| Ok(s.frame.dropped_packets()))
    }

    pub fn break_len(&self) -> Result<u32, Error> {
        self.with_shared(|s| Ok(s.break_len))
    }

    /// Takes effect with the next transmission.
    pub fn set_break_len(&self, break_len: u32) -> Result<(), Error> {
        let break_len = check_break_len(break_len)?;
        self.with_shared(|s| {
            s.break_len = break_len;
            Ok(())
        })
    }

    pub fn mab_len(&self) -> Result<u32, Error> {
        self.with_shared(|s| Ok(s.mab_len))
    }

    /// Takes effect with the next transmission.
    pub fn set_mab_len(&self, mab_len: u32) -> Result<(), Error> {
        let mab_len = check_mab_len(mab_len)?;
        self.with_shared(|s| {
            s.mab_len = mab_len;
            Ok(())
        })
    }

    pub fn rx_size(&self) -> Result<usize, Error> {
        self.with_shared(|s| Ok(s.frame.rx_size()))
    }

    /// Takes effect with the next received packet.
    pub fn set_rx_size(&self, rx_size: usize) -> Result<(), Error> {
        let rx_size = check_rx_size(rx_size)?;
        self.with_shared(|s| {
            s.frame.set_rx_size(rx_size);
            Ok(())
        })
    }

    /// Attach a sniffer pin mirroring the line.  A previously attached pin is handed back.
    pub fn enable_sniffer(&self, pin: P) -> Result<Option<P>, Error> {
        let previous = self.with_shared(|s| {
            let previous = s.sniffer.take().map(Sniffer::detach);
            s.sniffer = Some(Sniffer::attach(pin, SNIFFER_INTR_PRIORITY));
            Ok(previous)
        })?;
        log::info!("Sniffer enabled on port {}", self.inner.num);
        Ok(previous)
    }

    pub fn disable_sniffer(&self) -> Result<Option<P>, Error> {
        let pin = self.with_shared(|s| Ok(s.sniffer.take().map(Sniffer::detach)))?;
        if pin.is_some() {
            log::info!("Sniffer disabled on port {}", self.inner.num);
        }
        Ok(pin)
    }

    pub fn sniffer_enabled(&self) -> bool {
        self.with_shared(|s| Ok(s.sniffer.is_some())).unwrap_or(false)
    }

    /// Take the oldest unread measurement.
    pub fn read_sniffer(&self) -> Result<Option<SnifferData>, Error> {
        self.with_shared(|s| Ok(s.sniffer.as_mut().and_then(Sniffer::pop)))
    }

    /// Measurements the sniffer discarded because they were not read in time.
    pub fn sniffer_dropped(&self) -> Result<u32, Error> {
        self.with_shared(|s| Ok(s.sniffer.as_ref().map_or(0, Sniffer::dropped)))
    }

    /// Latest measurement, [`SnifferData::UNKNOWN`] until one was taken.
    pub fn last_sniffer_data(&self) -> Result<SnifferData, Error> {
        self.with_shared(|s| {
            Ok(s.sniffer
                .as_ref()
                .map_or(SnifferData::UNKNOWN, Sniffer::last))
        })
    }

    pub fn uid(&self) -> Uid {
        self.inner.rdm.uid()
    }

    pub fn set_uid(&self, uid: Uid) {
        self.inner.rdm.set_uid(uid);
    }

    /// Transaction number the next RDM request will carry.
    pub fn transaction_number(&self) -> u32 {
        self.inner.rdm.transaction_number()
    }

    pub fn is_discovery_muted(&self) -> bool {
        self.inner.rdm.is_discovery_muted()
    }

    pub fn set_discovery_muted(&self, muted: bool) {
        self.inner.rdm.set_discovery_muted(muted);
    }

    /// UART interrupt entry point.
    pub fn handle_uart_interrupt(&self, now: Instant) {
        critical_section::with(|cs| {
            let mut shared = self.inner.shared.borrow_ref_mut(cs);
            let Some(IsrShared {
                uart,
                reset,
                frame,
                buffer,
                waiter,
                ..
            }) = shared.as_mut()
            else {
                return;
            };

            if let Some(completion) = frame.check_timeout(now) {
                Self::dispatch(completion, frame, waiter);
            }
            for _ in 0..MAX_EVENT_ROUNDS {
                let events = uart.pending_events();
                if events.is_empty() {
                    break;
                }
                if let Some(step) = reset.on_uart_events(uart, events) {
                    frame.on_reset_step(step, uart, buffer);
                }
                if let Some(completion) =
                    frame.on_uart_events(uart, buffer, &self.inner.rdm, events, now)
                {
                    Self::dispatch(completion, frame, waiter);
                }
            }
        });
    }

    fn dispatch(
        completion: Completion,
        frame: &mut FrameMachine,
        waiter: &mut WaitSlot<std::thread::Thread, Result<PacketInfo, Error>>,
    ) {
        match completion {
            Completion::Sent(info) => {
                waiter.notify(Intent::Send, Ok(info));
            }
            Completion::Received(info) => {
                if waiter.notify(Intent::Receive, Ok(info)) {
                    frame.hold();
                }
            }
            Completion::ReceiveFailed(error) => {
                waiter.notify(Intent::Receive, Err(error));
            }
        }
    }

    /// Reset timer interrupt entry point.
    pub fn handle_timer_interrupt(&self, now: Instant) {
        critical_section::with(|cs| {
            let mut shared = self.inner.shared.borrow_ref_mut(cs);
            let Some(IsrShared {
                uart,
                reset,
                frame,
                buffer,
                waiter,
                ..
            }) = shared.as_mut()
            else {
                return;
            };
            if let Some(step) = reset.on_timer(uart) {
                frame.on_reset_step(step, uart, buffer);
            }
            if let Some(completion) = frame.check_timeout(now) {
                Self::dispatch(completion, frame, waiter);
            }
        });
    }

    /// Sniffer pin edge interrupt entry point.
    pub fn handle_sniffer_interrupt(&self) {
        critical_section::with(|cs| {
            let mut shared = self.inner.shared.borrow_ref_mut(cs);
            if let Some(sniffer) = shared.as_mut().and_then(|s| s.sniffer.as_mut()) {
                sniffer.handle_interrupt();
            }
        });
    }
}

#[cfg(all(test, feature = "phy-simulator"))]
mod tests {
    use super::*;
    use crate::consts::PACKET_TIMEOUT;
    use crate::phy::{SimulatorBus, SimulatorUart};
    use crate::time::Duration;

    fn port(n: u8) -> PortNumber {
        PortNumber::new(n).unwrap()
    }

    #[test]
    fn builder_clamps_or_verifies() {
        let mut builder = DriverConfigBuilder::new();
        builder.break_len(20).mab_len(2_000_000).rx_size(0);
        let config = builder.build();
        assert_eq!(config.break_len, BREAK_LEN_TX_MIN);
        assert_eq!(config.mab_len, LINE_TIMING_MAX);
        assert_eq!(config.rx_size, 1);
        assert_eq!(builder.build_verified(), Err(Error::InvalidArgument));

        let config = DriverConfigBuilder::new()
            .uid(Uid::new(0x05e0, 1))
            .reset_strategy(ResetStrategy::Timer)
            .build_verified()
            .unwrap();
        assert_eq!(config.uid, Uid::new(0x05e0, 1));
        assert_eq!(config.break_len, BREAK_LEN_DEFAULT);
    }

    #[test]
    fn install_and_uninstall() {
        crate::test_utils::prepare_test_logger();
        let bus = SimulatorBus::new();
        let registry: DriverRegistry<SimulatorUart> = DriverRegistry::new();

        assert!(!registry.is_installed(port(0)));
        let handle = registry
            .install(
                port(0),
                bus.uart("uart0"),
                None,
                vec![0; DMX_MAX_PACKET_SIZE].into(),
                DriverConfig::default(),
            )
            .unwrap();
        assert!(registry.is_installed(port(0)));
        assert!(registry.hardware().is_enabled(port(0)));
        assert_eq!(handle.number(), port(0));
        assert!(!handle.is_sending() && !handle.is_receiving());

        assert_eq!(
            registry
                .install(
                    port(0),
                    bus.uart("again"),
                    None,
                    vec![0; DMX_MAX_PACKET_SIZE].into(),
                    DriverConfig::default(),
                )
                .unwrap_err(),
            Error::PortAlreadyInstalled
        );

        let released = registry.uninstall(port(0)).unwrap();
        assert!(!released.uart.is_clock_enabled());
        assert!(!released.uart.is_interrupt_enabled());
        assert!(!registry.hardware().is_enabled(port(0)));
        assert_eq!(
            registry.uninstall(port(0)).unwrap_err(),
            Error::PortNotInstalled
        );
        assert_eq!(handle.break_len(), Err(Error::PortNotInstalled));
        assert_eq!(handle.send(&[0]), Err(Error::PortNotInstalled));
    }

    #[test]
    fn install_checks_buffer_and_strategy() {
        crate::test_utils::prepare_test_logger_with_warnings(vec![
            "UART has no native break generator and no timer was given",
        ]);
        let bus = SimulatorBus::new();
        let registry: DriverRegistry<SimulatorUart> = DriverRegistry::new();

        assert_eq!(
            registry
                .install(
                    port(1),
                    bus.uart("small"),
                    None,
                    vec![0; 64].into(),
                    DriverConfig::default(),
                )
                .unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            registry
                .install(
                    port(1),
                    bus.uart_without_break("nobreak"),
                    None,
                    vec![0; DMX_MAX_PACKET_SIZE].into(),
                    DriverConfig::default(),
                )
                .unwrap_err(),
            Error::Unsupported
        );
        assert!(!registry.is_installed(port(1)));
        assert!(!registry.hardware().is_enabled(port(1)));
    }

    #[test]
    fn parameters_are_validated() {
        let bus = SimulatorBus::new();
        let registry: DriverRegistry<SimulatorUart> = DriverRegistry::new();
        let handle = registry
            .install(
                port(2),
                bus.uart("uart2"),
                None,
                vec![0; DMX_MAX_PACKET_SIZE].into(),
                DriverConfig::default(),
            )
            .unwrap();

        assert_eq!(handle.break_len(), Ok(BREAK_LEN_DEFAULT));
        assert_eq!(handle.set_break_len(50), Err(Error::InvalidArgument));
        handle.set_break_len(300).unwrap();
        assert_eq!(handle.break_len(), Ok(300));

        assert_eq!(handle.set_mab_len(4), Err(Error::InvalidArgument));
        handle.set_mab_len(20).unwrap();
        assert_eq!(handle.mab_len(), Ok(20));

        assert_eq!(handle.set_rx_size(600), Err(Error::InvalidArgument));
        handle.set_rx_size(25).unwrap();
        assert_eq!(handle.rx_size(), Ok(25));

        assert_eq!(handle.send(&[]), Err(Error::InvalidArgument));
        assert_eq!(
            handle.send(&[0; DMX_MAX_PACKET_SIZE + 1]),
            Err(Error::BufferOverflow)
        );
    }

    #[test]
    fn send_refused_while_sending() {
        let bus = SimulatorBus::new();
        let registry: DriverRegistry<SimulatorUart> = DriverRegistry::new();
        let handle = registry
            .install(
                port(0),
                bus.uart("uart0"),
                None,
                vec![0; DMX_MAX_PACKET_SIZE].into(),
                DriverConfig::default(),
            )
            .unwrap();

        // Without interrupts nothing progresses, so the first packet stays in flight
        handle.send(&[0, 1, 2]).unwrap();
        assert!(handle.is_sending());
        assert!(handle.is_in_break());
        assert_eq!(handle.send(&[0, 1, 2]), Err(Error::OperationInProgress));
        assert_eq!(
            registry.uninstall(port(0)).unwrap_err(),
            Error::OperationInProgress
        );

        // Timing out abandons the transmission
        assert_eq!(
            handle.wait_sent(std::time::Duration::from_millis(10)),
            Err(Error::Timeout)
        );
        assert!(!handle.is_sending());
        assert!(registry.uninstall(port(0)).is_ok());
    }

    #[test]
    fn break_without_slots_does_not_block_the_port() {
        crate::test_utils::prepare_test_logger_with_warnings(vec!["Receive failed: timed out"]);
        let bus = SimulatorBus::new();
        let registry: DriverRegistry<SimulatorUart> = DriverRegistry::new();
        let handle = registry
            .install(
                port(1),
                bus.uart("uart1"),
                None,
                vec![0; DMX_MAX_PACKET_SIZE].into(),
                DriverConfig::default(),
            )
            .unwrap();

        bus.inject_packet(Some((BREAK_LEN_DEFAULT, MAB_LEN_DEFAULT)), &[]);
        for _ in 0..100 {
            handle.handle_uart_interrupt(bus.advance(Duration::from_micros(4)));
        }
        assert!(handle.is_receiving());
        assert_eq!(handle.send(&[0x00, 1]), Err(Error::OperationInProgress));

        // The line stays silent, only the packet timeout gets the port back
        handle.handle_uart_interrupt(bus.advance(PACKET_TIMEOUT));
        assert!(!handle.is_receiving());
        assert_eq!(handle.send(&[0x00, 1]), Ok(()));
        assert!(handle.is_sending());
    }

    #[test]
    fn receive_does_not_queue_behind_busy_port() {
        let bus = SimulatorBus::new();
        let registry: DriverRegistry<SimulatorUart> = DriverRegistry::new();
        let handle = registry
            .install(
                port(2),
                bus.uart("uart2"),
                None,
                vec![0; DMX_MAX_PACKET_SIZE].into(),
                DriverConfig::default(),
            )
            .unwrap();
        let mut buf = [0u8; 16];

        // Another task is inside a blocking call on this port
        let guard = handle.lock();
        assert_eq!(
            handle.receive(&mut buf, std::time::Duration::from_millis(10)),
            Err(Error::WaiterConflict)
        );
        assert!(!handle.has_waiter());
        drop(guard);

        assert_eq!(
            handle.receive(&mut buf, std::time::Duration::from_millis(10)),
            Err(Error::Timeout)
        );
        assert!(!handle.has_waiter());
    }
}
