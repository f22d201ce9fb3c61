//! Error handling for the pinboard control panel.

/// A specialized `Result` type for pinboard operations.
pub type Result<T> = std::result::Result<T, PanelError>;

/// The main error type for pin, task and component operations.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    /// Unknown or uncontrollable header pin
    #[error("Invalid pin: {0}")]
    InvalidPin(u8),

    /// Mode or peripheral pairing that the pin cannot honour
    #[error("Unsupported mode on pin {pin}: {reason}")]
    UnsupportedMode { pin: u8, reason: String },

    /// Pin is owned by another task and was not evicted first
    #[error("Pin {pin} is owned by {owner}")]
    OwnershipConflict { pin: u8, owner: String },

    /// The hardware boundary call itself failed
    #[error("Hardware failure: {0}")]
    HardwareFailure(String),

    /// A component's read/write/test/cleanup failed
    #[error("Component '{name}' failed: {reason}")]
    ComponentFailure { name: String, reason: String },

    /// No component driver registered under this type name
    #[error("Unknown component type: {0}")]
    UnknownComponent(String),

    /// No assigned component matches the given name or pin
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    /// Request argument out of range or malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Web server error
    #[error("Web server error: {0}")]
    WebServer(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Layout document could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PanelError {
    /// Create a new unsupported-mode error
    pub fn unsupported_mode(pin: u8, reason: impl Into<String>) -> Self {
        Self::UnsupportedMode {
            pin,
            reason: reason.into(),
        }
    }

    /// Create a new ownership conflict error
    pub fn ownership_conflict(pin: u8, owner: impl ToString) -> Self {
        Self::OwnershipConflict {
            pin,
            owner: owner.to_string(),
        }
    }

    /// Create a new hardware failure
    pub fn hardware_failure(msg: impl Into<String>) -> Self {
        Self::HardwareFailure(msg.into())
    }

    /// Create a new component failure
    pub fn component_failure(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ComponentFailure {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new configuration error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new web server error
    pub fn web_server_error(msg: impl Into<String>) -> Self {
        Self::WebServer(msg.into())
    }

    /// Short machine-readable name of the error kind, used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPin(_) => "invalid_pin",
            Self::UnsupportedMode { .. } => "unsupported_mode",
            Self::OwnershipConflict { .. } => "ownership_conflict",
            Self::HardwareFailure(_) => "hardware_failure",
            Self::ComponentFailure { .. } => "component_failure",
            Self::UnknownComponent(_) => "unknown_component",
            Self::ComponentNotFound(_) => "component_not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Config(_) => "config",
            Self::WebServer(_) => "web_server",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}
