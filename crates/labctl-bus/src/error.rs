use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Inbound stream already taken")]
    InboundTaken,

    #[error("Bus closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BusError>;

impl From<labctl_core::Error> for BusError {
    fn from(e: labctl_core::Error) -> Self {
        BusError::InvalidTopic(e.to_string())
    }
}

impl From<BusError> for labctl_core::Error {
    fn from(e: BusError) -> Self {
        match e {
            BusError::InvalidTopic(msg) => labctl_core::Error::Validation(msg),
            other => labctl_core::Error::Transport(other.to_string()),
        }
    }
}
