//! Error types shared by every transport.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("os error: {0}")]
    Os(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Covers dialing, handshakes, auth-method construction and session
    /// bring-up. Keeps its cause so a host-key mismatch stays detectable
    /// through any number of wrapping layers (bastion chains).
    #[error("can't connect: {context}")]
    CantConnect {
        context: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("host key mismatch: {0}")]
    HostKeyMismatch(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("sudo required: {0}")]
    SudoRequired(String),
}

impl Error {
    pub fn cant_connect(context: impl Into<String>) -> Self {
        Error::CantConnect {
            context: context.into(),
            source: None,
        }
    }

    pub fn cant_connect_with(context: impl Into<String>, source: Error) -> Self {
        Error::CantConnect {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True when this error is, or wraps, a host-key mismatch.
    pub fn is_host_key_mismatch(&self) -> bool {
        match self {
            Error::HostKeyMismatch(_) => true,
            Error::CantConnect {
                source: Some(inner), ..
            } => inner.is_host_key_mismatch(),
            _ => false,
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::cant_connect(format!("ssh protocol: {err}"))
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::AuthFailed(err.to_string())
    }
}

impl From<russh::AgentAuthError> for Error {
    fn from(err: russh::AgentAuthError) -> Self {
        Error::AuthFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_detectable_through_wrapping() {
        let inner = Error::HostKeyMismatch("key for host changed".into());
        let wrapped = Error::cant_connect_with("bastion connect", inner);
        let rewrapped = Error::cant_connect_with("client connect", wrapped);
        assert!(rewrapped.is_host_key_mismatch());
    }

    #[test]
    fn plain_connect_error_is_not_a_mismatch() {
        let err = Error::cant_connect("dial tcp 10.0.0.1:22");
        assert!(!err.is_host_key_mismatch());
    }
}
