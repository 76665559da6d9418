use thiserror::Error;

/// Structured cause of a device I/O failure.
///
/// Callers that retry decide on this field, never on error text.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum IoErrorKind {
    /// The path does not exist on the device (e.g. an unsupported sysfs node). Permanent.
    NotFound,

    /// The device refused the access.
    PermissionDenied,

    /// Anything else: device busy, connection hiccup and similar possibly-transient causes.
    Other,
}

impl From<std::io::ErrorKind> for IoErrorKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Other,
        }
    }
}

/// Errors that can occur when talking to a device.
///
/// All variants are `Clone` so operation results can be memoized by the coordination layers.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A read from or write to a device path failed.
    #[error("device I/O failed on '{path}': {message}")]
    Io {
        /// The path that was being accessed.
        path: String,

        /// Structured failure cause for retry decisions.
        kind: IoErrorKind,

        /// Human-readable description of the failure.
        message: String,
    },

    /// A verified write read back a different value than was written.
    #[error("wrote '{written}' to '{path}' but read back '{observed}'")]
    VerifyMismatch {
        /// The path that was written.
        path: String,

        /// The value that was written.
        written: String,

        /// The diverging value observed on read-back.
        observed: String,
    },

    /// A command run on the device exited non-zero, timed out, or could not be started.
    #[error("command '{command}' failed: {message}")]
    Command {
        /// The command line that was run.
        command: String,

        /// Human-readable description of the failure.
        message: String,

        /// Whether the failure was the execution timeout elapsing. Timeouts are stable,
        /// non-retryable failures.
        timed_out: bool,
    },

    /// Device content did not parse as the expected type.
    #[error("content of '{path}' is not {expected}: '{content}'")]
    Parse {
        /// The path whose content was being parsed.
        path: String,

        /// What the content was expected to be.
        expected: &'static str,

        /// The content that failed to parse.
        content: String,
    },
}

impl Error {
    /// Wraps a filesystem error with the path it occurred on.
    #[must_use]
    pub fn io(path: &str, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            kind: error.kind().into(),
            message: error.to_string(),
        }
    }

    /// Structured cause of the failure, when it was an I/O failure.
    #[must_use]
    pub fn io_kind(&self) -> Option<IoErrorKind> {
        match self {
            Self::Io { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// A specialized `Result` type for device operations, returning the crate's [`Error`] type as
/// the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug, Clone);

    #[test]
    fn io_wrapping_preserves_structured_kind() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");

        let error = Error::io("/sys/devices/system/cpu/cpu9/cpufreq/scaling_governor", &missing);

        assert_eq!(error.io_kind(), Some(IoErrorKind::NotFound));
    }

    #[test]
    fn non_io_errors_have_no_io_kind() {
        let error = Error::Command {
            command: "true".to_string(),
            message: "timed out".to_string(),
            timed_out: true,
        };

        assert_eq!(error.io_kind(), None);
    }
}
