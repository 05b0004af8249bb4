//! RDM addressing
//!
//! This module only understands as much of RDM (ANSI E1.20) as the driver needs to route and
//! classify packets: unique IDs, the message header, the checksum, and the discovery mute state.
//! Parameter data is never interpreted.
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::consts::{
    DELIMITER_BYTE, PID_DISC_MUTE, PID_DISC_UNIQUE_BRANCH, PID_DISC_UN_MUTE, PREAMBLE_BYTE,
    RDM_HEADER_SIZE, RDM_MAX_PACKET_SIZE, RDM_MIN_PACKET_SIZE, SC_RDM, SC_SUB_MESSAGE,
};

/// 48-bit RDM unique identifier (manufacturer ID + device ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Uid(#[cfg_attr(test, proptest(strategy = "0u64..=Uid::MAX_RAW"))] u64);

impl Uid {
    const MAX_RAW: u64 = 0xFFFF_FFFF_FFFF;

    /// Addresses all devices.
    pub const BROADCAST: Uid = Uid(Self::MAX_RAW);

    pub const fn new(manufacturer_id: u16, device_id: u32) -> Self {
        Self(((manufacturer_id as u64) << 32) | device_id as u64)
    }

    /// Build a UID from its raw value.  Returns `None` for values wider than 48 bits.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw > Self::MAX_RAW {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Addresses all devices of one manufacturer.
    pub const fn manufacturer_broadcast(manufacturer_id: u16) -> Self {
        Self::new(manufacturer_id, 0xFFFF_FFFF)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn manufacturer_id(self) -> u16 {
        (self.0 >> 32) as u16
    }

    #[inline(always)]
    pub const fn device_id(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_broadcast(self) -> bool {
        self.device_id() == 0xFFFF_FFFF
    }

    /// Whether a packet sent to `self` is meant for the device `uid`.
    pub fn targets(self, uid: Uid) -> bool {
        self == uid
            || self == Self::BROADCAST
            || (self.is_broadcast() && self.manufacturer_id() == uid.manufacturer_id())
    }

    pub fn from_bytes(b: &[u8; 6]) -> Self {
        let mut raw = [0u8; 8];
        raw[2..].copy_from_slice(b);
        Self(u64::from_be_bytes(raw))
    }

    pub fn to_bytes(self) -> [u8; 6] {
        let raw = self.0.to_be_bytes();
        let mut b = [0u8; 6];
        b.copy_from_slice(&raw[2..]);
        b
    }
}

impl core::fmt::Display for Uid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04x}:{:08x}", self.manufacturer_id(), self.device_id())
    }
}

impl core::str::FromStr for Uid {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (man, dev) = s.split_once(':').ok_or(crate::Error::InvalidArgument)?;
        if man.len() != 4 || dev.len() != 8 {
            return Err(crate::Error::InvalidArgument);
        }
        let man = u16::from_str_radix(man, 16).map_err(|_| crate::Error::InvalidArgument)?;
        let dev = u32::from_str_radix(dev, 16).map_err(|_| crate::Error::InvalidArgument)?;
        Ok(Uid::new(man, dev))
    }
}

/// RDM command class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[repr(u8)]
pub enum CommandClass {
    DiscoveryCommand = 0x10,
    DiscoveryResponse = 0x11,
    GetCommand = 0x20,
    GetResponse = 0x21,
    SetCommand = 0x30,
    SetResponse = 0x31,
}

impl CommandClass {
    pub fn from_u8(b: u8) -> Option<CommandClass> {
        match b {
            0x10 => Some(Self::DiscoveryCommand),
            0x11 => Some(Self::DiscoveryResponse),
            0x20 => Some(Self::GetCommand),
            0x21 => Some(Self::GetResponse),
            0x30 => Some(Self::SetCommand),
            0x31 => Some(Self::SetResponse),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn is_request(self) -> bool {
        (self as u8) & 0x01 == 0
    }
}

/// Header of an RDM message (everything up to the parameter data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct RdmHeader {
    pub destination: Uid,
    pub source: Uid,
    pub transaction_number: u8,
    /// Port ID for requests, response type for responses
    pub port_id: u8,
    pub message_count: u8,
    pub sub_device: u16,
    pub command_class: CommandClass,
    pub parameter_id: u16,
    pub parameter_data_len: u8,
}

impl RdmHeader {
    /// Total message length on the wire, including the checksum.
    #[inline]
    pub fn packet_size(&self) -> usize {
        RDM_HEADER_SIZE + usize::from(self.parameter_data_len) + 2
    }

    /// Whether this is a discovery request for one of the mute PIDs or the branch search.
    pub fn is_discovery(&self) -> bool {
        self.command_class == CommandClass::DiscoveryCommand
            && matches!(
                self.parameter_id,
                PID_DISC_UNIQUE_BRANCH | PID_DISC_MUTE | PID_DISC_UN_MUTE
            )
    }

    /// Parse the header from a received packet, starting at the start code.
    ///
    /// Only checks framing (start codes, length field).  Use [`verify_checksum()`] on the full
    /// packet for integrity.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RDM_HEADER_SIZE || buf[0] != SC_RDM || buf[1] != SC_SUB_MESSAGE {
            return None;
        }
        let message_len = usize::from(buf[2]);
        if message_len < RDM_HEADER_SIZE {
            return None;
        }
        let parameter_data_len = buf[23];
        if usize::from(parameter_data_len) + RDM_HEADER_SIZE != message_len {
            return None;
        }
        Some(Self {
            destination: Uid::from_bytes(buf[3..9].try_into().ok()?),
            source: Uid::from_bytes(buf[9..15].try_into().ok()?),
            transaction_number: buf[15],
            port_id: buf[16],
            message_count: buf[17],
            sub_device: u16::from_be_bytes([buf[18], buf[19]]),
            command_class: CommandClass::from_u8(buf[20])?,
            parameter_id: u16::from_be_bytes([buf[21], buf[22]]),
            parameter_data_len,
        })
    }

    /// Serialize a complete message into `buf`: header, `parameter_data`, checksum.
    ///
    /// Returns the message length, or `None` when `buf` is too small or the parameter data
    /// doesn't match `parameter_data_len`.
    pub fn encode(&self, parameter_data: &[u8], buf: &mut [u8]) -> Option<usize> {
        let size = self.packet_size();
        if parameter_data.len() != usize::from(self.parameter_data_len)
            || size > RDM_MAX_PACKET_SIZE
            || buf.len() < size
        {
            return None;
        }
        buf[0] = SC_RDM;
        buf[1] = SC_SUB_MESSAGE;
        buf[2] = u8::try_from(size - 2).ok()?;
        buf[3..9].copy_from_slice(&self.destination.to_bytes());
        buf[9..15].copy_from_slice(&self.source.to_bytes());
        buf[15] = self.transaction_number;
        buf[16] = self.port_id;
        buf[17] = self.message_count;
        buf[18..20].copy_from_slice(&self.sub_device.to_be_bytes());
        buf[20] = self.command_class as u8;
        buf[21..23].copy_from_slice(&self.parameter_id.to_be_bytes());
        buf[23] = self.parameter_data_len;
        buf[RDM_HEADER_SIZE..size - 2].copy_from_slice(parameter_data);
        write_checksum(&mut buf[..size]);
        Some(size)
    }
}

/// Expected total size of an RDM message from its first slots, once the length slot arrived.
pub fn expected_packet_size(buf: &[u8]) -> Option<usize> {
    match buf {
        [SC_RDM, SC_SUB_MESSAGE, len, ..] if usize::from(*len) + 2 >= RDM_MIN_PACKET_SIZE => {
            Some(usize::from(*len) + 2)
        }
        _ => None,
    }
}

/// Whether a packet received without a preceding break is a discovery response.
pub fn is_discovery_response(buf: &[u8]) -> bool {
    matches!(buf.first(), Some(&PREAMBLE_BYTE) | Some(&DELIMITER_BYTE))
}

fn sum(buf: &[u8]) -> u16 {
    buf.iter().fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}

/// Verify the 16-bit additive checksum of a complete RDM message.
pub fn verify_checksum(packet: &[u8]) -> bool {
    match packet.len() {
        n if n >= RDM_MIN_PACKET_SIZE => {
            let expected = u16::from_be_bytes([packet[n - 2], packet[n - 1]]);
            sum(&packet[..n - 2]) == expected
        }
        _ => false,
    }
}

/// Recompute the checksum in the last two bytes of a complete RDM message.
pub fn write_checksum(packet: &mut [u8]) {
    let n = packet.len();
    debug_assert!(n >= RDM_MIN_PACKET_SIZE);
    let checksum = sum(&packet[..n - 2]);
    packet[n - 2..].copy_from_slice(&checksum.to_be_bytes());
}

/// This device's RDM identity and discovery state
///
/// The context can be read from interrupt context while tasks update it.
#[derive(Debug)]
pub struct RdmContext {
    uid: critical_section::Mutex<Cell<Uid>>,
    transaction_number: AtomicU32,
    discovery_muted: AtomicBool,
}

impl RdmContext {
    pub const fn new(uid: Uid) -> Self {
        Self {
            uid: critical_section::Mutex::new(Cell::new(uid)),
            transaction_number: AtomicU32::new(0),
            discovery_muted: AtomicBool::new(false),
        }
    }

    pub fn uid(&self) -> Uid {
        critical_section::with(|cs| self.uid.borrow(cs).get())
    }

    pub fn set_uid(&self, uid: Uid) {
        critical_section::with(|cs| self.uid.borrow(cs).set(uid));
    }

    /// Transaction number the next outbound request will carry.
    pub fn transaction_number(&self) -> u32 {
        self.transaction_number.load(Ordering::Acquire)
    }

    /// Issue a transaction number for an outbound request.
    pub fn next_transaction_number(&self) -> u32 {
        self.transaction_number.fetch_add(1, Ordering::AcqRel)
    }

    pub fn is_discovery_muted(&self) -> bool {
        self.discovery_muted.load(Ordering::Acquire)
    }

    pub fn set_discovery_muted(&self, muted: bool) {
        self.discovery_muted.store(muted, Ordering::Release);
    }

    /// Stamp the next transaction number into an outbound request and fix up the checksum.
    ///
    /// Packets which are not RDM requests are left untouched.  Returns the issued number.
    pub fn stamp_request(&self, packet: &mut [u8]) -> Option<u32> {
        let header = RdmHeader::decode(packet)?;
        if !header.command_class.is_request() || packet.len() < header.packet_size() {
            return None;
        }
        let tn = self.next_transaction_number();
        packet[15] = tn as u8;
        write_checksum(&mut packet[..header.packet_size()]);
        Some(tn)
    }

    /// Apply an inbound discovery command to the mute state.
    ///
    /// Returns `true` when the packet is a DISC_UNIQUE_BRANCH this device must stay silent to
    /// because it is muted.
    pub fn apply_discovery(&self, header: &RdmHeader) -> bool {
        if header.command_class != CommandClass::DiscoveryCommand
            || !header.destination.targets(self.uid())
        {
            return false;
        }
        match header.parameter_id {
            PID_DISC_MUTE => {
                log::debug!("RDM discovery muted by {}", header.source);
                self.set_discovery_muted(true);
                false
            }
            PID_DISC_UN_MUTE => {
                log::debug!("RDM discovery unmuted by {}", header.source);
                self.set_discovery_muted(false);
                false
            }
            PID_DISC_UNIQUE_BRANCH => self.is_discovery_muted(),
            _ => false,
        }
    }
}

impl Default for RdmContext {
    fn default() -> Self {
        Self::new(Uid::default())
    }
}
