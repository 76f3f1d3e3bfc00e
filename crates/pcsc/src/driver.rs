//! Contract with the low-level smart-card driver
//!
//! The driver polls reader hardware and moves bytes to and from the chip. This
//! crate only consumes it: status changes and errors are pushed into an
//! [`EventSink`], card operations go through [`CardHandle`].

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::DriverError;

/// Largest ATR a card may return
pub const MAX_ATR_LEN: usize = 33;

/// Largest short APDU response, status word included
pub const MAX_BUFFER_LEN: usize = 264;

/// Largest extended APDU response, status word included
pub const MAX_BUFFER_LEN_EXTENDED: usize = 65_548;

/// Sharing mode for card connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShareMode {
    /// Shared access to the card (default)
    #[default]
    Shared,
    /// Exclusive access to the card
    Exclusive,
    /// Direct connection to the reader, no card required
    Direct,
}

/// What to do with the card when a connection or transaction ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the card as it is
    Leave,
    /// Warm reset
    Reset,
    /// Power down
    Unpower,
    /// Eject, on readers that can
    Eject,
}

/// Transport protocol negotiated with the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// No protocol negotiated (direct connections)
    Undefined,
    /// T=0
    T0,
    /// T=1
    T1,
    /// Raw transfer
    Raw,
    /// T=15
    T15,
}

impl Protocol {
    /// PC/SC protocol identifier
    pub const fn id(self) -> u32 {
        match self {
            Self::Undefined => 0x0000,
            Self::T0 => 0x0001,
            Self::T1 => 0x0002,
            Self::Raw => 0x0004,
            Self::T15 => 0x0008,
        }
    }

    /// Protocol for a PC/SC identifier
    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            0x0000 => Some(Self::Undefined),
            0x0001 => Some(Self::T0),
            0x0002 => Some(Self::T1),
            0x0004 => Some(Self::Raw),
            0x0008 => Some(Self::T15),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undefined => "UNDEFINED",
            Self::T0 => "T0",
            Self::T1 => "T1",
            Self::Raw => "RAW",
            Self::T15 => "T15",
        })
    }
}

/// Reader attribute identifiers (`SCARD_ATTR_*`)
pub mod attributes {
    /// Reader vendor name
    pub const VENDOR_NAME: u32 = 0x0001_0100;
    /// Vendor-supplied interface device type
    pub const VENDOR_IFD_TYPE: u32 = 0x0001_0101;
    /// Vendor-supplied interface device version
    pub const VENDOR_IFD_VERSION: u32 = 0x0001_0102;
    /// Vendor-supplied interface device serial number
    pub const VENDOR_IFD_SERIAL_NO: u32 = 0x0001_0103;
    /// Reader channel identifier
    pub const CHANNEL_ID: u32 = 0x0002_0110;
    /// Maximum input size accepted by the reader
    pub const MAX_INPUT: u32 = 0x0007_a007;
    /// Answer to reset of the inserted card
    pub const ATR_STRING: u32 = 0x0009_0303;
    /// Reader display name
    pub const DEVICE_FRIENDLY_NAME: u32 = 0x7fff_0003;
}

/// Build a reader control code from a vendor function number.
///
/// Mirrors the platform `SCARD_CTL_CODE` macro.
pub const fn control_code(function: u32) -> u32 {
    if cfg!(windows) {
        (0x31 << 16) | (function << 2)
    } else {
        0x4200_0000 + function
    }
}

/// Card snapshot as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCardState {
    /// Answer to reset
    pub atr: Bytes,
    /// Active protocol
    pub protocol: Protocol,
    /// Reader the card sits in
    pub reader: String,
    /// Raw card status word
    pub status: u32,
}

/// One status report for one reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Reader name
    pub reader: String,
    /// Raw reader status word
    pub status: u32,
    /// Answer to reset of the card in the slot, empty when none
    pub atr: Bytes,
}

/// Everything the driver reports while monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A reader's status changed
    Status(StatusEvent),
    /// The driver failed independently of any one reader
    Error(DriverError),
}

/// Where the driver pushes what it observes.
///
/// Cheap to clone and usable from any thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a status change. Returns `false` once nobody listens anymore.
    pub fn status(&self, reader: impl Into<String>, status: u32, atr: impl Into<Bytes>) -> bool {
        self.send(DriverEvent::Status(StatusEvent {
            reader: reader.into(),
            status,
            atr: atr.into(),
        }))
    }

    /// Report a driver failure. Returns `false` once nobody listens anymore.
    pub fn error(&self, err: DriverError) -> bool {
        self.send(DriverEvent::Error(err))
    }

    /// Forward an event. Returns `false` once nobody listens anymore.
    pub fn send(&self, event: DriverEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Whether the receiving client is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The monitoring and connection side of a driver
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Begin reporting status changes and errors into `sink`
    fn start_monitoring(&self, sink: EventSink) -> Result<(), DriverError>;

    /// Stop reporting
    fn stop_monitoring(&self) -> Result<(), DriverError>;

    /// Connect to the card in `reader`
    async fn connect(
        &self,
        reader: &str,
        mode: ShareMode,
        preferred: Option<Protocol>,
    ) -> Result<Box<dyn CardHandle>, DriverError>;
}

/// A driver-level connection to one card.
///
/// Output buffers are optional everywhere: a caller-supplied buffer is filled
/// and the response returned as a borrowed slice of it, otherwise the driver
/// returns a freshly sized owned response.
#[async_trait]
pub trait CardHandle: Send + Sync {
    /// Protocol negotiated at connect time
    fn protocol(&self) -> Protocol;

    /// Re-establish the connection, returning the newly negotiated protocol
    async fn reconnect(
        &self,
        mode: ShareMode,
        disposition: Disposition,
    ) -> Result<Protocol, DriverError>;

    /// Close the connection
    async fn disconnect(&self, disposition: Disposition) -> Result<(), DriverError>;

    /// Send bytes to the card. `protocol` overrides the active protocol for this call only.
    async fn transmit<'b>(
        &self,
        protocol: Option<Protocol>,
        input: &[u8],
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, DriverError>;

    /// Send a control command to the reader
    async fn control<'b>(
        &self,
        code: u32,
        input: Option<&[u8]>,
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, DriverError>;

    /// Read a reader attribute
    async fn attribute_get<'b>(
        &self,
        id: u32,
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, DriverError>;

    /// Write a reader attribute
    async fn attribute_set(&self, id: u32, value: &[u8]) -> Result<(), DriverError>;

    /// Current card state
    async fn state(&self) -> Result<RawCardState, DriverError>;

    /// Lock the card for a sequence of operations
    async fn begin_transaction(&self) -> Result<Box<dyn TransactionHandle>, DriverError>;
}

/// A driver-level transaction lock
#[async_trait]
pub trait TransactionHandle: Send + Sync {
    /// Release the lock
    async fn end(&self, disposition: Disposition) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_ids() {
        for protocol in [Protocol::T0, Protocol::T1, Protocol::Raw, Protocol::T15] {
            assert_eq!(Protocol::from_id(protocol.id()), Some(protocol));
        }
        assert_eq!(Protocol::from_id(0x3), None);
        assert_eq!(Protocol::T1.to_string(), "T1");
    }

    #[test]
    fn test_control_code() {
        if cfg!(windows) {
            assert_eq!(control_code(3400), 0x0031_3520);
        } else {
            assert_eq!(control_code(3400), 0x4200_0d48);
        }
    }

    #[test]
    fn test_sink_reports_closed_receiver() {
        let (sink, rx) = EventSink::channel();
        assert!(sink.status("iReadCards", 0x20, vec![0x3b, 0x00]));
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.error(DriverError::new("NoService", "gone")));
    }
}
