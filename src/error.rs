//! Error taxonomy for campusfs (spec.md §7).
//!
//! Variants are policy categories, not an exhaustive enumeration of every
//! failure site; callers pick the closest category and attach context.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CampusFsError>;

#[derive(Error, Debug)]
pub enum CampusFsError {
    /// Remote 404/410, or the resolver found no match.
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote 403.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Connect/read timeout exceeded.
    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    /// Server disconnected, DNS failure, connection refused.
    #[error("network disconnected: {0}")]
    NetworkDisconnected(String),

    /// The operation was cancelled (unmount, dropped future).
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Invalid response, size mismatch, template error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Login failed at startup; fatal.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CampusFsError {
    /// Whether this error should poison the catalog's cached structure for
    /// the node it occurred at (spec.md §7 policy table). NotFound and
    /// Forbidden never poison; Network*/Cancelled poison only the
    /// in-progress Download; Protocol poisons the Download's cache entry.
    pub fn poisons_tree(&self) -> bool {
        matches!(self, CampusFsError::Protocol(_))
    }

    /// libc errno this error should surface as on a filesystem op.
    pub fn errno(&self) -> i32 {
        match self {
            CampusFsError::NotFound(_) => libc::ENOENT,
            CampusFsError::Forbidden(_) => libc::EACCES,
            CampusFsError::NetworkTimeout(_) => libc::ETIMEDOUT,
            CampusFsError::NetworkDisconnected(_) => libc::EHOSTUNREACH,
            CampusFsError::Cancelled(_) => libc::ECANCELED,
            CampusFsError::Protocol(_) => libc::EINVAL,
            CampusFsError::Auth(_) => libc::EACCES,
            CampusFsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn from_reqwest(err: reqwest::Error, context: &str) -> Self {
        if err.is_timeout() {
            CampusFsError::NetworkTimeout(format!("{context}: {err}"))
        } else if let Some(status) = err.status() {
            if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
                CampusFsError::NotFound(format!("{context}: {err}"))
            } else if status == reqwest::StatusCode::FORBIDDEN {
                CampusFsError::Forbidden(format!("{context}: {err}"))
            } else {
                CampusFsError::Protocol(format!("{context}: {status}: {err}"))
            }
        } else if err.is_connect() {
            CampusFsError::NetworkDisconnected(format!("{context}: {err}"))
        } else {
            CampusFsError::Protocol(format!("{context}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_and_forbidden_do_not_poison() {
        assert!(!CampusFsError::NotFound("x".into()).poisons_tree());
        assert!(!CampusFsError::Forbidden("x".into()).poisons_tree());
        assert!(!CampusFsError::NetworkTimeout("x".into()).poisons_tree());
        assert!(!CampusFsError::Cancelled("x".into()).poisons_tree());
    }

    #[test]
    fn protocol_errors_poison() {
        assert!(CampusFsError::Protocol("x".into()).poisons_tree());
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(CampusFsError::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(CampusFsError::Forbidden("x".into()).errno(), libc::EACCES);
        assert_eq!(
            CampusFsError::NetworkTimeout("x".into()).errno(),
            libc::ETIMEDOUT
        );
        assert_eq!(
            CampusFsError::NetworkDisconnected("x".into()).errno(),
            libc::EHOSTUNREACH
        );
        assert_eq!(
            CampusFsError::Cancelled("x".into()).errno(),
            libc::ECANCELED
        );
        assert_eq!(CampusFsError::Protocol("x".into()).errno(), libc::EINVAL);
    }
}
