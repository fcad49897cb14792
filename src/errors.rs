use std::io;

/// Listener admission failures. The HTTP layer renders these; variants
/// carrying a mount name are sent as a 403 redirect back to the mount
/// the client originally asked for.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionErrorValue {
    #[error("Fallback through too many mountpoints")]
    FallbackLoop,
    #[error("no source or fallback file for mount")]
    NotFound,
    #[error("server bandwidth reached")]
    ServerBandwidth { redirect: String },
    #[error("max listeners reached")]
    MountFull { redirect: String },
    #[error("Account already in use")]
    DuplicateLogin,
    #[error("no worker available")]
    NoWorkers,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct AdmissionError {
    pub value: AdmissionErrorValue,
}

impl From<AdmissionErrorValue> for AdmissionError {
    fn from(value: AdmissionErrorValue) -> Self {
        Self { value }
    }
}

/// Producer attach failures, each a direct 403 at the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum StartupErrorValue {
    #[error("Mountpoint in use")]
    MountInUse,
    #[error("too many streams connected")]
    SourceLimit,
    #[error("content type not supported")]
    UnsupportedContent,
    #[error("no worker available")]
    NoWorkers,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct StartupError {
    pub value: StartupErrorValue,
}

impl From<StartupErrorValue> for StartupError {
    fn from(value: StartupErrorValue) -> Self {
        Self { value }
    }
}

/// Errors surfaced by a format adapter while pulling stream data.
#[derive(Debug, thiserror::Error)]
pub enum FormatErrorValue {
    #[error("io error")]
    Io(io::Error),
    #[error("stream framing error: {0}")]
    Framing(String),
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct FormatError {
    pub value: FormatErrorValue,
}

impl From<io::Error> for FormatError {
    fn from(error: io::Error) -> Self {
        Self {
            value: FormatErrorValue::Io(error),
        }
    }
}

impl From<FormatErrorValue> for FormatError {
    fn from(value: FormatErrorValue) -> Self {
        Self { value }
    }
}

/// Structural queue invariant breach. Fatal to the source, never to the
/// process.
#[derive(Debug, thiserror::Error)]
pub enum QueueErrorValue {
    #[error("min-queue offset {offset} exceeds window {window}")]
    MinOffsetOverrun { offset: u64, window: u64 },
    #[error("min-queue cursor detached from tail")]
    CursorDetached,
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct QueueError {
    pub value: QueueErrorValue,
}

impl From<QueueErrorValue> for QueueError {
    fn from(value: QueueErrorValue) -> Self {
        Self { value }
    }
}
