use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Structured error type for the connection core
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    /// Detail from the underlying failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub severity: ErrorSeverity,
    /// Error category used to decide whether a failure is absorbed or surfaced
    pub category: ErrorCategory,
}

impl CoreError {
    /// Start building an error; category defaults to `Internal`
    pub fn new(code: ErrorCode) -> CoreErrorBuilder {
        CoreErrorBuilder {
            code,
            message: String::new(),
            context: None,
            severity: ErrorSeverity::Error,
            category: ErrorCategory::Internal,
        }
    }

    /// Whether the failure may be retried without user or session action
    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    /// Whether this error means the whole session is gone
    pub fn ends_session(&self) -> bool {
        self.category == ErrorCategory::SessionEnded
    }
}

/// Builder returned by [`CoreError::new`]
pub struct CoreErrorBuilder {
    code: ErrorCode,
    message: String,
    context: Option<String>,
    severity: ErrorSeverity,
    category: ErrorCategory,
}

impl CoreErrorBuilder {
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    pub fn build(self) -> CoreError {
        CoreError {
            code: self.code,
            message: self.message,
            context: self.context,
            severity: self.severity,
            category: self.category,
        }
    }
}

/// What went wrong, for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Internal,

    // Session and credential errors
    NotAuthenticated,
    SessionEnded,
    CredentialInvalid,
    RenewalFailed,
    UnauthorizedAfterRenewal,
    LoginFailed,

    // Push channel errors
    ChannelConnectFailed,
    ChannelSendFailed,
    ChannelClosed,
    ChannelBusy,
    HeartbeatTimeout,
    MalformedMessage,

    // HTTP errors
    RequestFailed,
    UnexpectedStatus,

    // Local storage errors
    StorageFailed,

    // Configuration errors
    ConfigInvalid,
    ConfigMissing,
}

/// How badly the failure affects the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Informational, nothing is impacted
    Info,
    /// Might impact functionality but operation continues
    Warning,
    /// Impacts the current operation
    Error,
    /// The session can no longer function
    Critical,
}

/// Error categories, mapped onto the recovery taxonomy of the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network blips, server restarts, timeouts
    Network,
    /// Expired or invalid credential that a single renewal may fix
    Authentication,
    /// Rejected even with a fresh credential; not retryable
    Permission,
    /// The session is over (renewal failed, logout); needs a new login
    SessionEnded,
    /// Inbound data that could not be understood
    Protocol,
    /// Misconfiguration, not retryable without changes
    Configuration,
    /// Local persistence failures
    Storage,
    /// Bugs and invariant violations
    Internal,
}

impl ErrorCategory {
    /// Transient categories; everything else needs user or session action
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network | Self::Authentication => true,
            Self::Permission
            | Self::SessionEnded
            | Self::Protocol
            | Self::Configuration
            | Self::Storage
            | Self::Internal => false,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        match &self.context {
            Some(context) => write!(f, " ({})", context),
            None => Ok(()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorCode::SessionEnded => "SESSION_ENDED",
            ErrorCode::CredentialInvalid => "CREDENTIAL_INVALID",
            ErrorCode::RenewalFailed => "RENEWAL_FAILED",
            ErrorCode::UnauthorizedAfterRenewal => "UNAUTHORIZED_AFTER_RENEWAL",
            ErrorCode::LoginFailed => "LOGIN_FAILED",
            ErrorCode::ChannelConnectFailed => "CHANNEL_CONNECT_FAILED",
            ErrorCode::ChannelSendFailed => "CHANNEL_SEND_FAILED",
            ErrorCode::ChannelClosed => "CHANNEL_CLOSED",
            ErrorCode::ChannelBusy => "CHANNEL_BUSY",
            ErrorCode::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            ErrorCode::MalformedMessage => "MALFORMED_MESSAGE",
            ErrorCode::RequestFailed => "REQUEST_FAILED",
            ErrorCode::UnexpectedStatus => "UNEXPECTED_STATUS",
            ErrorCode::StorageFailed => "STORAGE_FAILED",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::ConfigMissing => "CONFIG_MISSING",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Permission => "permission",
            ErrorCategory::SessionEnded => "session_ended",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl std::error::Error for CoreError {}

/// Failure to read the expiry claim out of an access secret
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenDecodeError {
    #[error("access secret is not a three-part token")]
    Malformed,

    #[error("claims segment is not valid base64: {0}")]
    Encoding(String),

    #[error("claims segment is not valid JSON: {0}")]
    Claims(String),

    #[error("claims carry no usable 'exp' value")]
    MissingExpiry,
}

/// Failure in the local persistence backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored data could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("integrity check failed for key '{key}'")]
    Integrity { key: String },
}

impl From<TokenDecodeError> for CoreError {
    fn from(err: TokenDecodeError) -> Self {
        CoreError::new(ErrorCode::CredentialInvalid)
            .message("Access secret could not be decoded")
            .context(err.to_string())
            .category(ErrorCategory::Authentication)
            .severity(ErrorSeverity::Warning)
            .build()
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        storage_failed(err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::new(ErrorCode::Internal)
            .message("JSON (de)serialization failed")
            .context(err.to_string())
            .category(ErrorCategory::Protocol)
            .build()
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        request_failed(err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CoreError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        channel_connect_failed(err)
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        // Timeouts are the only anyhow failures worth retrying
        let timed_out = err
            .chain()
            .any(|cause| cause.to_string().to_lowercase().contains("timed out"));
        CoreError::new(ErrorCode::Internal)
            .message(format!("{:#}", err))
            .category(if timed_out {
                ErrorCategory::Network
            } else {
                ErrorCategory::Internal
            })
            .build()
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

// Constructors for the common failures

/// No credential is held; the caller must log in first
pub fn not_authenticated() -> CoreError {
    CoreError::new(ErrorCode::NotAuthenticated)
        .message("No active session, log in first")
        .category(ErrorCategory::SessionEnded)
        .severity(ErrorSeverity::Warning)
        .build()
}

/// The session ended while the operation was pending
pub fn session_ended(reason: impl fmt::Display) -> CoreError {
    CoreError::new(ErrorCode::SessionEnded)
        .message("Session ended")
        .context(reason.to_string())
        .category(ErrorCategory::SessionEnded)
        .severity(ErrorSeverity::Critical)
        .build()
}

/// The renewal endpoint rejected the refresh secret or could not be reached
pub fn renewal_failed(reason: impl fmt::Display) -> CoreError {
    CoreError::new(ErrorCode::RenewalFailed)
        .message("Failed to renew the session credential")
        .context(reason.to_string())
        .category(ErrorCategory::SessionEnded)
        .severity(ErrorSeverity::Critical)
        .build()
}

/// A request was rejected again after a successful renewal
pub fn unauthorized_after_renewal(request: impl fmt::Display) -> CoreError {
    CoreError::new(ErrorCode::UnauthorizedAfterRenewal)
        .message("Request rejected with a freshly renewed credential")
        .context(request.to_string())
        .category(ErrorCategory::Permission)
        .severity(ErrorSeverity::Error)
        .build()
}

/// Login or registration was rejected
pub fn login_failed(reason: impl fmt::Display) -> CoreError {
    CoreError::new(ErrorCode::LoginFailed)
        .message("Authentication was rejected")
        .context(reason.to_string())
        .category(ErrorCategory::Authentication)
        .build()
}

/// The push channel could not be opened
pub fn channel_connect_failed(err: impl fmt::Display) -> CoreError {
    CoreError::new(ErrorCode::ChannelConnectFailed)
        .message("Failed to open push channel")
        .context(err.to_string())
        .category(ErrorCategory::Network)
        .build()
}

/// A frame could not be written to the push channel
pub fn channel_send_failed(err: impl fmt::Display) -> CoreError {
    CoreError::new(ErrorCode::ChannelSendFailed)
        .message("Failed to send on push channel")
        .context(err.to_string())
        .category(ErrorCategory::Network)
        .build()
}

/// The push channel was closed by the peer or the network
pub fn channel_closed(code: Option<u16>, reason: impl fmt::Display) -> CoreError {
    let message = match code {
        Some(code) => format!("Push channel closed with code {}", code),
        None => "Push channel closed".to_string(),
    };
    CoreError::new(ErrorCode::ChannelClosed)
        .message(message)
        .context(reason.to_string())
        .category(ErrorCategory::Network)
        .severity(ErrorSeverity::Warning)
        .build()
}

/// A connect was requested while another attempt is already underway
pub fn channel_busy() -> CoreError {
    CoreError::new(ErrorCode::ChannelBusy)
        .message("A connection attempt is already in progress")
        .category(ErrorCategory::Internal)
        .severity(ErrorSeverity::Info)
        .build()
}

/// No inbound traffic for too many heartbeat intervals
pub fn heartbeat_timeout(missed: u32) -> CoreError {
    CoreError::new(ErrorCode::HeartbeatTimeout)
        .message("Push channel stopped answering heartbeats")
        .context(format!("{} heartbeat intervals without inbound traffic", missed))
        .category(ErrorCategory::Network)
        .severity(ErrorSeverity::Warning)
        .build()
}

/// An inbound frame could not be parsed into a message
pub fn malformed_message(err: impl fmt::Display) -> CoreError {
    CoreError::new(ErrorCode::MalformedMessage)
        .message("Received a malformed push message")
        .context(err.to_string())
        .category(ErrorCategory::Protocol)
        .severity(ErrorSeverity::Warning)
        .build()
}

/// The HTTP request could not be completed
pub fn request_failed(err: impl fmt::Display) -> CoreError {
    CoreError::new(ErrorCode::RequestFailed)
        .message("HTTP request failed")
        .context(err.to_string())
        .category(ErrorCategory::Network)
        .build()
}

/// The server answered with a status the caller did not expect
pub fn unexpected_status(status: u16, body: &str) -> CoreError {
    CoreError::new(ErrorCode::UnexpectedStatus)
        .message(format!("Server responded with status {}", status))
        .context(body.chars().take(200).collect::<String>())
        .category(if status >= 500 {
            ErrorCategory::Network
        } else {
            ErrorCategory::Protocol
        })
        .build()
}

/// Local persistence failure
pub fn storage_failed(err: impl fmt::Display) -> CoreError {
    CoreError::new(ErrorCode::StorageFailed)
        .message("Credential storage failed")
        .context(err.to_string())
        .category(ErrorCategory::Storage)
        .build()
}

/// A configuration value that cannot be used
pub fn config_invalid(key: &str, value: &str, reason: &str) -> CoreError {
    CoreError::new(ErrorCode::ConfigInvalid)
        .message(format!("Invalid configuration value for '{}'", key))
        .context(format!("Value '{}' is invalid: {}", value, reason))
        .category(ErrorCategory::Configuration)
        .build()
}

/// A required configuration value is empty
pub fn config_missing(key: &str) -> CoreError {
    CoreError::new(ErrorCode::ConfigMissing)
        .message(format!("Required configuration key '{}' is missing", key))
        .category(ErrorCategory::Configuration)
        .build()
}
