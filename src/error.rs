//! Error types for the gateway.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Invalid function arguments: {0}")]
    InvalidToolArguments(String),

    #[error("Unknown tool_call_id: {0}")]
    UnknownToolCallId(String),

    #[error("Duplicated tool_call_id: {0}")]
    DuplicatedToolCallId(String),

    #[error("Unsupported tool_call type: \"{0}\"")]
    UnsupportedToolCallType(String),

    #[error("Unknown message role: \"{0}\"")]
    UnsupportedRole(String),

    #[error("Unsupported response_format.type: \"{0}\"")]
    UnsupportedResponseFormat(String),

    #[error("Unsupported content part type in message {0}")]
    UnsupportedContentType(usize),

    #[error("Invalid image data: {0}")]
    InvalidImageData(String),

    #[error("Error fetching image: {0}")]
    ImageFetch(String),

    #[error("Invalid request body: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
        }
    }

    /// Whether the failure was caused by the client's request rather than by
    /// the gateway or the upstream. These are reported as 400 and never retried.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidToolArguments(_)
                | Self::UnknownToolCallId(_)
                | Self::DuplicatedToolCallId(_)
                | Self::UnsupportedToolCallType(_)
                | Self::UnsupportedRole(_)
                | Self::UnsupportedResponseFormat(_)
                | Self::UnsupportedContentType(_)
                | Self::InvalidImageData(_)
                | Self::ImageFetch(_)
                | Self::InvalidRequest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
