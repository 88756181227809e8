use std::{io, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wrapped causes travel as their message only.
mod message {
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(error: &Arc<anyhow::Error>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(error)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<anyhow::Error>, D::Error> {
        String::deserialize(deserializer).map(|x| Arc::new(anyhow::Error::msg(x)))
    }
}

/// IO errors keep their kind, as far as it matters for reconnecting.
mod io_error {
    use std::io::{self, ErrorKind};
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Repr {
        kind: String,
        message: String,
    }

    const KINDS: &[ErrorKind] = &[
        ErrorKind::ConnectionReset,
        ErrorKind::ConnectionRefused,
        ErrorKind::ConnectionAborted,
        ErrorKind::BrokenPipe,
        ErrorKind::TimedOut,
        ErrorKind::UnexpectedEof,
        ErrorKind::NotFound,
        ErrorKind::PermissionDenied,
    ];

    pub fn serialize<S: Serializer>(error: &Arc<io::Error>, serializer: S) -> Result<S::Ok, S::Error> {
        Repr {
            kind: format!("{:?}", error.kind()),
            message: error.to_string(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<io::Error>, D::Error> {
        let repr = Repr::deserialize(deserializer)?;
        let kind = KINDS
            .iter()
            .copied()
            .find(|x| format!("{:?}", x) == repr.kind)
            .unwrap_or(ErrorKind::Other);
        Ok(Arc::new(io::Error::new(kind, repr.message)))
    }
}

/// The link to the instrument could not be opened or broke while in use.
#[derive(Error, Clone, Debug, Serialize, Deserialize)]
pub enum TransportError {
    #[error("IO Error: {0}")]
    Io(#[serde(with = "io_error")] Arc<io::Error>),
    #[error("Session is closed")]
    Closed,
    #[error("Other Error: {0}")]
    Other(#[serde(with = "message")] Arc<anyhow::Error>),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(x: anyhow::Error) -> Self {
        TransportError::Other(Arc::new(x))
    }
}

/// The instrument answered, but not in a form we understand.
#[derive(Error, Clone, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("Unexpected Response: {0}")]
    UnexpectedResponse(String),
    #[error("Invalid binary block header")]
    InvalidBinaryHeader,
    #[error("Other Error: {0}")]
    Other(#[serde(with = "message")] Arc<anyhow::Error>),
}

impl From<anyhow::Error> for ProtocolError {
    fn from(x: anyhow::Error) -> Self {
        ProtocolError::Other(Arc::new(x))
    }
}

/// A requested value lies outside of what the instrument accepts.
#[derive(Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[error("{channel}: {requested} is outside of the allowed range [{min}, {max}]")]
pub struct RangeError {
    pub channel: String,
    pub requested: f64,
    pub min: f64,
    pub max: f64,
}

/// The instrument reported a fault of its own, usually through its error queue.
#[derive(Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[error("{device}: {message}")]
pub struct DeviceError {
    pub device: String,
    pub message: String,
}

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum Error {
    #[error("Connection Error: {0}")]
    Transport(TransportError),
    #[error("Timeout")]
    Timeout,
    #[error("Protocol Error: {0}")]
    Protocol(ProtocolError),
    #[error("Range Error: {0}")]
    Range(RangeError),
    #[error("Device Error: {0}")]
    Device(DeviceError),
    #[error("Argument Error: {0}")]
    Argument(#[serde(with = "message")] Arc<anyhow::Error>),
    #[error("Storage Error: {0}")]
    Storage(#[serde(with = "message")] Arc<anyhow::Error>),
    #[error("Internal Error: {0}")]
    Internal(#[serde(with = "message")] Arc<anyhow::Error>),
}

impl Error {
    pub fn transport<T: Into<TransportError>>(err: T) -> Self {
        Self::Transport(err.into())
    }

    pub fn closed() -> Self {
        Self::Transport(TransportError::Closed)
    }

    pub fn protocol<T: Into<ProtocolError>>(err: T) -> Self {
        Self::Protocol(err.into())
    }

    pub fn unexpected_response<T: Into<String>>(reply: T) -> Self {
        Self::Protocol(ProtocolError::UnexpectedResponse(reply.into()))
    }

    pub fn timeout() -> Self {
        Self::Timeout
    }

    pub fn range<T: Into<String>>(channel: T, requested: f64, min: f64, max: f64) -> Self {
        Self::Range(RangeError {
            channel: channel.into(),
            requested,
            min,
            max,
        })
    }

    pub fn device<D: Into<String>, M: Into<String>>(device: D, message: M) -> Self {
        Self::Device(DeviceError {
            device: device.into(),
            message: message.into(),
        })
    }

    pub fn argument<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Argument(Arc::new(err.into()))
    }

    pub fn storage<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Storage(Arc::new(err.into()))
    }

    pub fn internal<T: Into<anyhow::Error>>(err: T) -> Self {
        Self::Internal(Arc::new(err.into()))
    }

    /// Errors raised while compiling a shot, before any instrument is touched.
    pub fn is_compile_time(&self) -> bool {
        matches!(self, Error::Range(_) | Error::Argument(_))
    }

    /// After these errors the state of the instrument must be considered unknown.
    pub fn resets_connection(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Timeout => true,
            Error::Protocol(_)
            | Error::Range(_)
            | Error::Device(_)
            | Error::Argument(_)
            | Error::Storage(_)
            | Error::Internal(_) => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(x: io::Error) -> Self {
        if x.kind() == io::ErrorKind::TimedOut {
            return Error::Timeout;
        }
        Error::Transport(TransportError::Io(Arc::new(x)))
    }
}
