//! Unified error handling for labctl.
//!
//! Every crate in the workspace surfaces failures through [`Error`] so the
//! control API can map them onto a stable reason code.

/// Unified error type for labctl.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The referenced device, lock, job or module does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The resource is held under a lease that blocks the operation.
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    /// A lease request conflicts with an existing lease.
    #[error("Denied: {0}")]
    Denied(String),

    /// A plugin module with the same name is already registered.
    #[error("Duplicate module: {0}")]
    DuplicateModule(String),

    /// A plugin handler failed or panicked.
    #[error("Handler fault in module '{module}': {message}")]
    HandlerFault { module: String, message: String },

    /// An entity with the same identity already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Message transport errors.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::ResourceBusy(msg.into())
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        Self::Denied(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn handler_fault(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFault {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Stable reason code reported to external callers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::ResourceBusy(_) => "IN_USE",
            Error::Denied(_) => "DENIED",
            Error::DuplicateModule(_) => "DUPLICATE_MODULE",
            Error::HandlerFault { .. } => "MODULE_ERROR",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::Validation(_) | Error::Serialization(_) => "BAD_REQUEST",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Internal(_) => "EXCEPTION",
        }
    }
}

#[macro_export]
macro_rules! not_found_err {
    ($msg:expr) => {
        $crate::error::Error::NotFound($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::NotFound(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_err {
    ($msg:expr) => {
        $crate::error::Error::Validation($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Validation(format!($fmt, $($arg)*))
    };
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Error::Validation(e.to_string())
    }
}
