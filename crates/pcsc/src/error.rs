//! Error types for PC/SC sessions

use std::fmt;
use std::str::FromStr;

use crate::flags::ReaderStatusFlags;

/// Classification tag attached to every failure reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The operation raced a card removal, or no card is in the slot
    NoSmartCard,
    /// The card was removed while a handle to it was open
    RemovedCard,
    /// The card was reset by another party
    ResetCard,
    /// The PC/SC service is not running
    NoService,
    /// The PC/SC service shut down
    ServiceStopped,
    /// The reader is no longer reachable
    ReaderUnavailable,
    /// The reader name is not known to the service
    UnknownReader,
    /// Another party holds the card in a conflicting mode
    SharingViolation,
    /// The driver gave up waiting
    Timeout,
    /// The driver call was cancelled
    Cancelled,
    /// The driver does not implement the requested operation
    Unsupported,
    /// Any other driver code, kept verbatim
    Other(String),
}

impl ErrorCode {
    /// The driver's string form of this code
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoSmartCard => "NoSmartCard",
            Self::RemovedCard => "RemovedCard",
            Self::ResetCard => "ResetCard",
            Self::NoService => "NoService",
            Self::ServiceStopped => "ServiceStopped",
            Self::ReaderUnavailable => "ReaderUnavailable",
            Self::UnknownReader => "UnknownReader",
            Self::SharingViolation => "SharingViolation",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Unsupported => "Unsupported",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "NoSmartCard" => Self::NoSmartCard,
            "RemovedCard" => Self::RemovedCard,
            "ResetCard" => Self::ResetCard,
            "NoService" => Self::NoService,
            "ServiceStopped" => Self::ServiceStopped,
            "ReaderUnavailable" => Self::ReaderUnavailable,
            "UnknownReader" => Self::UnknownReader,
            "SharingViolation" => Self::SharingViolation,
            "Timeout" => Self::Timeout,
            "Cancelled" => Self::Cancelled,
            "Unsupported" => Self::Unsupported,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A failure reported by the driver, with the driver's own classification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DriverError {
    /// Classification tag
    pub code: ErrorCode,
    /// Human readable detail from the driver
    pub message: String,
}

impl DriverError {
    /// Create a new driver error
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is a transient card absence.
    ///
    /// These happen when an operation races a physical removal. The remaining
    /// steps of the current sequence should be abandoned; the next status
    /// event decides what happens to the session.
    pub const fn is_card_absent(&self) -> bool {
        matches!(self.code, ErrorCode::NoSmartCard | ErrorCode::RemovedCard)
    }

    /// Whether the failure concerns the service or the reader rather than one card
    pub const fn is_service_failure(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::NoService | ErrorCode::ServiceStopped | ErrorCode::ReaderUnavailable
        )
    }
}

#[cfg(feature = "pcsc")]
impl From<pcsc::Error> for DriverError {
    fn from(err: pcsc::Error) -> Self {
        let code = match err {
            pcsc::Error::NoSmartcard => ErrorCode::NoSmartCard,
            pcsc::Error::RemovedCard => ErrorCode::RemovedCard,
            pcsc::Error::ResetCard => ErrorCode::ResetCard,
            pcsc::Error::NoService => ErrorCode::NoService,
            pcsc::Error::ServiceStopped => ErrorCode::ServiceStopped,
            pcsc::Error::ReaderUnavailable => ErrorCode::ReaderUnavailable,
            pcsc::Error::UnknownReader => ErrorCode::UnknownReader,
            pcsc::Error::SharingViolation => ErrorCode::SharingViolation,
            pcsc::Error::Timeout => ErrorCode::Timeout,
            pcsc::Error::Cancelled => ErrorCode::Cancelled,
            pcsc::Error::UnsupportedFeature | pcsc::Error::UnsupportedCard => {
                ErrorCode::Unsupported
            }
            other => ErrorCode::Other(format!("{other:?}")),
        };
        Self::new(code, err.to_string())
    }
}

/// Broad category of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The card went away under the operation
    CardAbsent,
    /// Any other environment failure reported by the driver
    Driver,
    /// The caller broke a usage rule; indicates a logic bug
    Precondition,
    /// The driver reported something the lifecycle does not recognise
    Anomaly,
}

/// Errors surfaced by readers and card sessions
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Driver failure, passed through untouched
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A session operation is already in flight on this reader
    #[error("a card operation is already in flight on reader {0}")]
    SessionBusy(String),

    /// No card session is established on this reader
    #[error("no card connected in reader {0}")]
    NoCard(String),

    /// The card handle was disconnected and can no longer be used
    #[error("card in reader {0} has been disconnected")]
    Disconnected(String),

    /// The reader went away for good
    #[error("reader {0} is gone")]
    ReaderGone(String),

    /// Status word combination the lifecycle does not handle
    #[error("unhandled status {status} on reader {reader}")]
    UnhandledStatus {
        /// Reader name
        reader: String,
        /// Reported status
        status: ReaderStatusFlags,
    },
}

impl Error {
    /// Category of this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Driver(err) if err.is_card_absent() => ErrorKind::CardAbsent,
            Self::Driver(_) => ErrorKind::Driver,
            Self::SessionBusy(_) | Self::Disconnected(_) => ErrorKind::Precondition,
            Self::NoCard(_) | Self::ReaderGone(_) => ErrorKind::CardAbsent,
            Self::UnhandledStatus { .. } => ErrorKind::Anomaly,
        }
    }

    /// The driver classification, if this came from the driver
    pub const fn code(&self) -> Option<&ErrorCode> {
        match self {
            Self::Driver(err) => Some(&err.code),
            _ => None,
        }
    }
}

/// Failure to parse the canonical string form of a status word
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseStatusError {
    /// Input is not wrapped in `{ ... }`
    #[error("status string must be wrapped in braces: {0:?}")]
    Malformed(String),
    /// A name that is not part of the vocabulary
    #[error("unknown status name {0:?}")]
    UnknownName(String),
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}
