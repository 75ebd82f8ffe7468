//! HAP wire status codes.
//!
//! These values are carried verbatim in read/write response items; 0 means
//! success and nonzero values are the protocol's error taxonomy. They are
//! compatibility constants and must not be renumbered.

use serde::{Serialize, Serializer};

/// Per-item status carried in read/write responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HapStatus {
    Success = 0,
    /// Request denied due to insufficient privileges.
    InsufficientPrivileges = -70401,
    /// Unable to communicate with the requested service (handler fault).
    ServiceCommunicationFailure = -70402,
    /// Resource is busy, try again.
    ResourceBusy = -70403,
    /// Cannot write to a read-only characteristic.
    ReadOnly = -70404,
    /// Cannot read from a write-only characteristic.
    WriteOnly = -70405,
    /// Notification is not supported for this characteristic.
    NotificationUnsupported = -70406,
    /// Out of resources to process the request.
    OutOfResource = -70407,
    /// Operation timed out.
    OperationTimedOut = -70408,
    /// The requested resource does not exist.
    UnknownResource = -70409,
    /// Received an invalid value in the request.
    InvalidValue = -70410,
    /// Insufficient authorization (additional-authorization check failed).
    InsufficientAuthorization = -70411,
}

impl HapStatus {
    /// Raw wire code.
    pub fn as_code(self) -> i32 {
        self as i32
    }

    /// Convert from a raw wire code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            -70401 => Some(Self::InsufficientPrivileges),
            -70402 => Some(Self::ServiceCommunicationFailure),
            -70403 => Some(Self::ResourceBusy),
            -70404 => Some(Self::ReadOnly),
            -70405 => Some(Self::WriteOnly),
            -70406 => Some(Self::NotificationUnsupported),
            -70407 => Some(Self::OutOfResource),
            -70408 => Some(Self::OperationTimedOut),
            -70409 => Some(Self::UnknownResource),
            -70410 => Some(Self::InvalidValue),
            -70411 => Some(Self::InsufficientAuthorization),
            _ => None,
        }
    }

    /// Whether this status indicates success.
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl Serialize for HapStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_code())
    }
}
