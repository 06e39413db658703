use thiserror::Error;

/// Framing-level failures. The byte stream is no longer trustworthy after
/// any of these, so they are connection-fatal and no response is sent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid protocol id {0} (expected 0)")]
    InvalidProtocolId(u16),

    #[error("invalid MBAP length field: {0}")]
    InvalidLength(u16),
}

/// Process-level failures. Modbus exceptions are not represented here:
/// the dispatcher encodes them as normal response PDUs and the connection
/// survives.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for ServerError {
    fn from(err: toml::de::Error) -> Self {
        ServerError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ServerError {
    fn from(err: toml::ser::Error) -> Self {
        ServerError::Serialization(format!("TOML encode error: {}", err))
    }
}
