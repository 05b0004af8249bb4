/// Errors reported by the DMX driver
///
/// Line faults detected in interrupt context (`FramingError`, `BufferOverflow`) are recorded with
/// the packet and only surface once the waiting task is woken.  Everything else is returned
/// synchronously from the call that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Error {
    /// A driver is already installed on this port.
    PortAlreadyInstalled,
    /// No driver is installed on this port.
    PortNotInstalled,
    /// A send or receive is already in flight on this port.
    OperationInProgress,
    /// The packet does not fit into the maximum packet size.
    BufferOverflow,
    /// The peripheral reported a line error during the packet.
    FramingError,
    /// The operation did not complete within the requested time.
    Timeout,
    /// Another task is already waiting on this port.
    WaiterConflict,
    /// A parameter is out of range (port number, packet length, timing).
    InvalidArgument,
    /// The requested hardware capability is not available.
    Unsupported,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::PortAlreadyInstalled => "DMX driver already installed on this port",
            Error::PortNotInstalled => "no DMX driver installed on this port",
            Error::OperationInProgress => "a send or receive is already in progress",
            Error::BufferOverflow => "packet exceeds the maximum packet size",
            Error::FramingError => "framing error on the DMX line",
            Error::Timeout => "timed out",
            Error::WaiterConflict => "another task is already waiting on this port",
            Error::InvalidArgument => "invalid argument",
            Error::Unsupported => "not supported by this hardware",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    proptest::proptest! {
        #[test]
        fn display_is_never_empty(e: Error) {
            let s = format!("{e}");
            proptest::prop_assert!(!s.is_empty());
        }
    }
}
