use cryptoki_sys::{CK_RV, CKR_DEVICE_ERROR, CKR_GENERAL_ERROR};
use thiserror::Error;

pub type RscResult<T> = Result<T, RscError>;

#[derive(Debug, Error)]
pub enum RscError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RscError {
    pub fn auth<E: std::fmt::Display>(err: E) -> Self {
        Self::Auth(err.to_string())
    }
    pub fn transport<E: std::fmt::Display>(err: E) -> Self {
        Self::Transport(err.to_string())
    }
    pub fn framing<E: std::fmt::Display>(err: E) -> Self {
        Self::Framing(err.to_string())
    }
    pub fn tls<E: std::fmt::Display>(err: E) -> Self {
        Self::Tls(err.to_string())
    }
    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }

    /// Authentication and configuration failures are final for a connection
    /// attempt; everything else may succeed on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth(_) | Self::Config(_) | Self::Tls(_))
    }

    /// Result code reported to a PKCS#11 consumer for this failure.
    pub fn ckr(&self) -> CK_RV {
        match self {
            Self::Auth(_) | Self::Config(_) | Self::Tls(_) => CKR_GENERAL_ERROR,
            _ => CKR_DEVICE_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_surface_as_device_error() {
        assert_eq!(RscError::ConnectionLost.ckr(), CKR_DEVICE_ERROR);
        assert_eq!(
            RscError::Timeout(std::time::Duration::from_secs(1)).ckr(),
            CKR_DEVICE_ERROR
        );
        assert_eq!(RscError::framing("short header").ckr(), CKR_DEVICE_ERROR);
    }

    #[test]
    fn auth_failures_are_not_retried() {
        let err = RscError::auth("bad proof");
        assert!(!err.is_retryable());
        assert_eq!(err.ckr(), CKR_GENERAL_ERROR);
        assert!(RscError::ConnectionLost.is_retryable());
    }
}
