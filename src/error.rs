//! Error categories surfaced by the conversation driver
//!
//! Every terminal failure maps onto one `BodsError` variant. The variant picks
//! the one-line header printed on stderr; the `Display` text is the detail line.
//! Tool failures are the exception: they are reported back to the model and the
//! conversation continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BodsError {
    /// Missing or malformed prompt template, settings or credentials
    #[error("{0}")]
    Config(String),

    /// Unsupported image type, oversize image, corrupt document
    #[error("{0}")]
    InputClassification(String),

    /// Mutually exclusive inference parameters
    #[error("{0}")]
    ParameterConflict(String),

    /// Network or service error; `throttled` marks retryable responses
    #[error("{message}")]
    Transport { message: String, throttled: bool },

    /// Empty event, unexpected ordering, unparsable JSON
    #[error("{0}")]
    StreamProtocol(String),

    /// Writing the response or an extracted tag file failed
    #[error("{0}")]
    Output(String),

    #[error("the request was cancelled")]
    Cancelled,
}

impl BodsError {
    pub fn transport(message: impl Into<String>) -> Self {
        let message = message.into();
        let throttled = is_throttling_message(&message);
        Self::Transport { message, throttled }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::StreamProtocol(message.into())
    }

    /// Only throttling responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { throttled: true, .. })
    }

    /// Header shown above the detail line on stderr
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Config(_) => "Could not load configuration.",
            Self::InputClassification(_) => "The input could not be used.",
            Self::ParameterConflict(_) => "Conflicting inference parameters.",
            Self::Transport { throttled: true, .. } => {
                "The service kept throttling the request."
            }
            Self::Transport { .. } => {
                "There was a problem invoking the model. Have you enabled the model and set the correct region?"
            }
            Self::StreamProtocol(_) => "The response stream was malformed.",
            Self::Output(_) => "Could not write the output.",
            Self::Cancelled => "The request was cancelled.",
        }
    }
}

/// Bedrock reports throttling as HTTP 429 with a `ThrottlingException` body,
/// or as an exception frame inside the event stream.
pub fn is_throttling_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("throttlingexception")
        || lower.contains("too many requests")
        || lower.contains("rate exceeded")
}
