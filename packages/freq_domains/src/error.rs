use device_target::DeviceId;
use thiserror::Error;

/// Errors that can occur when controlling frequency domains.
///
/// Two kinds suffice: configuration errors (the requested governor, tunable or frequency is not
/// supported by the current device state; never retried, the caller must choose a supported
/// value) and device I/O errors (the [`Device`][Self::Device] variant, wrapping the collaborator's
/// structured error). Validation always precedes mutation.
///
/// All variants are `Clone` so operation results can be memoized.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested governor is not in the device's supported-governor list.
    #[error("governor '{governor}' not supported for device {device}; supported: {supported:?}")]
    UnsupportedGovernor {
        /// The device that rejected the governor.
        device: DeviceId,

        /// The requested governor.
        governor: String,

        /// The governors the device does support.
        supported: Vec<String>,
    },

    /// The requested governor is not supported by several devices at once.
    #[error("governor '{governor}' not supported for devices {devices:?}")]
    UnsupportedGovernorForDevices {
        /// The requested governor.
        governor: String,

        /// The online devices that do not support it.
        devices: Vec<DeviceId>,
    },

    /// A tunable name is not valid for the governor it was addressed to.
    ///
    /// Tunables accepted before this one was encountered remain written; the call is not
    /// atomic.
    #[error(
        "unexpected tunable '{tunable}' for governor '{governor}' on device {device}; valid tunables: {valid:?}"
    )]
    UnknownTunable {
        /// The device the tunable was addressed to.
        device: DeviceId,

        /// The governor the tunable was addressed to.
        governor: String,

        /// The invalid tunable name.
        tunable: String,

        /// The tunable names the governor does support.
        valid: Vec<String>,
    },

    /// The requested frequency is not in the device's available-frequency list.
    #[error("device {device} does not support frequency {frequency}; supported: {supported:?}")]
    UnsupportedFrequency {
        /// The device that rejected the frequency.
        device: DeviceId,

        /// The requested frequency.
        frequency: u64,

        /// The frequencies the device does support.
        supported: Vec<u64>,
    },

    /// The operation requires a specific governor to be active.
    #[error("device {device} requires governor '{required}' for this operation but '{active}' is set")]
    GovernorRequired {
        /// The device the operation was addressed to.
        device: DeviceId,

        /// The governor the operation requires.
        required: &'static str,

        /// The governor that is actually active.
        active: String,
    },

    /// A read, write or command to the device collaborator failed.
    #[error(transparent)]
    Device(#[from] device_target::Error),

    /// A scope failure whose restore phase also failed.
    ///
    /// The primary failure takes priority: this error displays as the primary and the restore
    /// failure stays reachable via [`suppressed()`][Self::suppressed]. Restoration failures are
    /// attached, never silently dropped.
    #[error("{primary}")]
    SuppressedRestore {
        /// The failure that takes priority (the scope body's, or the apply phase's).
        primary: Box<Error>,

        /// The restore-phase failure attached to it.
        suppressed: Box<Error>,
    },
}

impl Error {
    /// The failure that takes priority, unwrapping any suppressed-restore layering.
    #[must_use]
    pub fn primary(&self) -> &Error {
        match self {
            Self::SuppressedRestore { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// The suppressed restore-phase failure, if this error carries one.
    #[must_use]
    pub fn suppressed(&self) -> Option<&Error> {
        match self {
            Self::SuppressedRestore { suppressed, .. } => Some(suppressed),
            _ => None,
        }
    }

    /// Whether this is a configuration error, one that will repeat until the caller picks a
    /// supported value.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::UnsupportedGovernor { .. }
            | Self::UnsupportedGovernorForDevices { .. }
            | Self::UnknownTunable { .. }
            | Self::UnsupportedFrequency { .. }
            | Self::GovernorRequired { .. } => true,
            Self::Device(_) => false,
            Self::SuppressedRestore { primary, .. } => primary.is_configuration(),
        }
    }
}

/// A specialized `Result` type for frequency-domain operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
