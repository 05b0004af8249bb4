//! DMX512 and RDM Constants

use crate::time::Duration;

/// Number of DMX ports this driver can manage at once.
pub const DMX_NUM_MAX: usize = 3;

/// DMX line rate in bit/s
pub const DMX_BAUD_RATE: u32 = 250_000;
/// Bits per slot on the line (1 start, 8 data, 2 stop)
pub const SLOT_BITS: u32 = 11;
/// Duration of one bit at the DMX line rate
pub const BIT_TIME: Duration = Duration::from_micros(4);
/// Duration of one slot at the DMX line rate
pub const SLOT_TIME: Duration = Duration::from_micros(44);

/// Start code plus 512 data slots
pub const DMX_MAX_PACKET_SIZE: usize = 513;

/// Default transmitted break length in microseconds
pub const BREAK_LEN_DEFAULT: u32 = 176;
/// Shortest break a receiver must accept
pub const BREAK_LEN_MIN: u32 = 88;
/// Shortest break this driver will transmit
pub const BREAK_LEN_TX_MIN: u32 = 92;
/// Longest break or mark-after-break permitted on the line
pub const LINE_TIMING_MAX: u32 = 1_000_000;

/// Default transmitted mark-after-break length in microseconds
pub const MAB_LEN_DEFAULT: u32 = 12;
/// Shortest mark-after-break a receiver must accept
pub const MAB_LEN_MIN: u32 = 8;
/// Shortest mark-after-break this driver will transmit
pub const MAB_LEN_TX_MIN: u32 = 12;

/// Null start code (dimmer data)
pub const SC_DMX: u8 = 0x00;
/// RDM start code
pub const SC_RDM: u8 = 0xCC;
/// RDM sub-start code
pub const SC_SUB_MESSAGE: u8 = 0x01;

/// Discovery response preamble byte
pub const PREAMBLE_BYTE: u8 = 0xFE;
/// Discovery response preamble separator
pub const DELIMITER_BYTE: u8 = 0xAA;
/// Encoded discovery response, excluding preamble and separator
pub const RDM_DISCOVERY_RESPONSE_SIZE: usize = 16;
/// Longest possible discovery response including 7 preamble bytes and the separator
pub const RDM_MAX_DISCOVERY_RESPONSE_SIZE: usize = RDM_DISCOVERY_RESPONSE_SIZE + 8;

/// Smallest valid RDM message (header + checksum, no parameter data)
pub const RDM_MIN_PACKET_SIZE: usize = 26;
/// Size of the RDM header up to and including the parameter data length
pub const RDM_HEADER_SIZE: usize = 24;
/// Longest RDM message including checksum
pub const RDM_MAX_PACKET_SIZE: usize = 257;

/// PID: DISC_UNIQUE_BRANCH
pub const PID_DISC_UNIQUE_BRANCH: u16 = 0x0001;
/// PID: DISC_MUTE
pub const PID_DISC_MUTE: u16 = 0x0002;
/// PID: DISC_UN_MUTE
pub const PID_DISC_UN_MUTE: u16 = 0x0003;

/// Capacity of the sniffer measurement queue
pub const SNIFFER_QUEUE_SIZE: usize = 8;

/// Default interrupt priority for the UART interrupt
pub const UART_INTR_PRIORITY: u8 = 3;
/// Sniffer edge interrupt priority, below the UART
pub const SNIFFER_INTR_PRIORITY: u8 = 1;

/// Timeout after which a started packet that never completes is abandoned.
///
/// Covers the longest permitted break and mark-after-break plus a full-size packet at line
/// rate with one slot of idle time between every pair of slots.
pub const PACKET_TIMEOUT: Duration = Duration::from_micros(
    2 * LINE_TIMING_MAX as u64 + 2 * 44 * DMX_MAX_PACKET_SIZE as u64,
);
