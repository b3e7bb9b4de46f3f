//! Errors returned by particle systems.

/// Failure of a [`ParticleSystem`](crate::ParticleSystem) operation.
///
/// Numeric degeneracy and malformed extra parameters are not errors; they are
/// logged and recovered from where they occur.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemError {
    /// An operation that needs particles ran before `initialize` or after `clear`.
    NotInitialized,
    /// Behaviour parameters failed validation.
    InvalidParameters(String),
    /// `initialize` was called without dynamic particles.
    EmptyParticleSet,
    /// The compute device could not be created or used.
    DeviceUnavailable(String),
    /// A lock's intent queue was full; retry later or drop the request.
    LockQueueFull,
}

impl std::fmt::Display for SystemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemError::NotInitialized => write!(f, "particle system is not initialized"),
            SystemError::InvalidParameters(msg) => write!(f, "invalid parameters: {msg}"),
            SystemError::EmptyParticleSet => write!(f, "no dynamic particles supplied"),
            SystemError::DeviceUnavailable(msg) => write!(f, "compute device unavailable: {msg}"),
            SystemError::LockQueueFull => write!(f, "lock ticket queue full"),
        }
    }
}

impl std::error::Error for SystemError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let e = SystemError::InvalidParameters("gasConstant must be non-zero".into());
        assert_eq!(e.to_string(), "invalid parameters: gasConstant must be non-zero");
        let e = SystemError::DeviceUnavailable("no adapter".into());
        assert!(e.to_string().contains("no adapter"));
    }
}
