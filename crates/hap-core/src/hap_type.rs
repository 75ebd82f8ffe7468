//! HAP type UUIDs with short-form expansion.
//!
//! Apple-defined service and characteristic types are 128-bit UUIDs sharing
//! the base `XXXXXXXX-0000-1000-8000-0026BB765291`; only the first 32 bits
//! vary and the wire format abbreviates them to that short form with leading
//! zeros stripped.

use std::fmt;
use uuid::Uuid;

/// Low 96 bits of the Apple-defined base UUID.
const BASE_SUFFIX: u128 = 0x0000_1000_8000_0026_BB76_5291;
const BASE_MASK: u128 = (1u128 << 96) - 1;

/// A service or characteristic type UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HapType(Uuid);

impl HapType {
    /// Expand an Apple-defined short code into the full type UUID.
    pub const fn short(code: u32) -> Self {
        Self(Uuid::from_u128(((code as u128) << 96) | BASE_SUFFIX))
    }

    /// Wrap a full (vendor-defined) type UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The full UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Short code if this type uses the Apple base, None for vendor types.
    pub fn short_code(&self) -> Option<u32> {
        let raw = self.0.as_u128();
        if raw & BASE_MASK == BASE_SUFFIX {
            Some((raw >> 96) as u32)
        } else {
            None
        }
    }

    /// Wire representation: abbreviated hex for Apple types, full UUID
    /// string (uppercase) for vendor types.
    pub fn to_wire(&self) -> String {
        match self.short_code() {
            Some(code) => format!("{:X}", code),
            None => self.0.to_string().to_uppercase(),
        }
    }
}

impl fmt::Display for HapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl From<Uuid> for HapType {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Apple-defined service types the engine itself references.
pub mod service {
    use super::HapType;

    pub const ACCESSORY_INFORMATION: HapType = HapType::short(0x3E);
    pub const PROTOCOL_INFORMATION: HapType = HapType::short(0xA2);
    pub const LIGHTBULB: HapType = HapType::short(0x43);
    pub const SWITCH: HapType = HapType::short(0x49);
    pub const MOTION_SENSOR: HapType = HapType::short(0x85);
    pub const CONTACT_SENSOR: HapType = HapType::short(0x80);
    pub const STATELESS_PROGRAMMABLE_SWITCH: HapType = HapType::short(0x89);
    pub const DOORBELL: HapType = HapType::short(0x121);
    pub const CAMERA_RTP_STREAM_MANAGEMENT: HapType = HapType::short(0x110);
}

/// Apple-defined characteristic types the engine itself references.
pub mod characteristic {
    use super::HapType;

    pub const IDENTIFY: HapType = HapType::short(0x14);
    pub const MANUFACTURER: HapType = HapType::short(0x20);
    pub const MODEL: HapType = HapType::short(0x21);
    pub const NAME: HapType = HapType::short(0x23);
    pub const SERIAL_NUMBER: HapType = HapType::short(0x30);
    pub const FIRMWARE_REVISION: HapType = HapType::short(0x52);
    pub const ON: HapType = HapType::short(0x25);
    pub const BRIGHTNESS: HapType = HapType::short(0x08);
    pub const MOTION_DETECTED: HapType = HapType::short(0x22);
    pub const CONTACT_SENSOR_STATE: HapType = HapType::short(0x6A);
    pub const PROGRAMMABLE_SWITCH_EVENT: HapType = HapType::short(0x73);
    pub const BUTTON_EVENT: HapType = HapType::short(0x126);
    pub const STREAMING_STATUS: HapType = HapType::short(0x120);
    pub const SETUP_ENDPOINTS: HapType = HapType::short(0x118);
    pub const SELECTED_RTP_STREAM_CONFIGURATION: HapType = HapType::short(0x117);
    pub const SUPPORTED_VIDEO_STREAM_CONFIGURATION: HapType = HapType::short(0x114);
    pub const SUPPORTED_AUDIO_STREAM_CONFIGURATION: HapType = HapType::short(0x115);
    pub const SUPPORTED_RTP_CONFIGURATION: HapType = HapType::short(0x116);
}
