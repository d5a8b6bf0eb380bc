//! Signer-cluster errors

use crate::types::CULPRIT_ERROR_CODE;
use thiserror::Error;

/// How the caller should react to a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Availability problem, the request may be repeated
    Retryable,
    /// A participant sabotaged signing; report it for slashing
    Escalate,
    /// The response cannot be trusted or understood
    Fatal,
}

#[derive(Error, Debug)]
pub enum TssError {
    #[error("signing sabotaged: {message} (culprits: {culprits:?})")]
    Culprit {
        message: String,
        culprits: Vec<String>,
    },

    #[error("signer cluster returned error {code}: {message}")]
    Request { code: i32, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

impl TssError {
    /// Build the error for a cluster error response
    pub fn from_response(code: i32, message: impl Into<String>, culprits: Vec<String>) -> Self {
        let message = message.into();
        if code == CULPRIT_ERROR_CODE {
            TssError::Culprit { message, culprits }
        } else {
            TssError::Request { code, message }
        }
    }

    pub fn classify(&self) -> FailureClass {
        match self {
            TssError::Culprit { .. } => FailureClass::Escalate,
            TssError::Request { .. } | TssError::Transport(_) => FailureClass::Retryable,
            TssError::Decode(_) | TssError::InvalidSignature(_) => FailureClass::Fatal,
        }
    }

    pub fn is_culprit(&self) -> bool {
        matches!(self, TssError::Culprit { .. })
    }
}

impl From<serde_json::Error> for TssError {
    fn from(e: serde_json::Error) -> Self {
        TssError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TssError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_culprit_code_escalates() {
        let err = TssError::from_response(100, "node 3 sent bad share", vec!["node3".into()]);
        assert!(err.is_culprit());
        assert_eq!(err.classify(), FailureClass::Escalate);
    }

    #[test]
    fn test_other_codes_are_retryable() {
        let err = TssError::from_response(-32000, "timeout", vec![]);
        assert!(matches!(err, TssError::Request { code: -32000, .. }));
        assert_eq!(err.classify(), FailureClass::Retryable);
        assert_eq!(
            TssError::Transport("refused".into()).classify(),
            FailureClass::Retryable
        );
    }

    #[test]
    fn test_bad_responses_are_fatal() {
        assert_eq!(
            TssError::InvalidSignature("mismatch".into()).classify(),
            FailureClass::Fatal
        );
    }
}
