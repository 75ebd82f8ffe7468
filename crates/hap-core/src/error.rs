//! Error types for the HAP accessory engine.

use thiserror::Error;

/// Primary error type for all engine operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    #[error("TLV error: {0}")]
    Tlv(#[from] TlvError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Accessory {aid} has unassigned identifiers and cannot be served")]
    IdsUnassigned { aid: u64 },

    #[error("Accessory is not published")]
    NotPublished,
}

/// Violations of the accessory tree invariants.
///
/// These are rejected synchronously at mutation time and leave the tree
/// unchanged.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StructuralError {
    #[error("Service {service_type} (subtype {subtype:?}) already exists on this accessory")]
    DuplicateService {
        service_type: String,
        subtype: Option<String>,
    },

    #[error("Characteristic {characteristic_type} already exists on this service")]
    DuplicateCharacteristic { characteristic_type: String },

    #[error("Service limit exceeded ({limit} services per accessory)")]
    ServiceLimit { limit: usize },

    #[error("Characteristic limit exceeded ({limit} characteristics per service)")]
    CharacteristicLimit { limit: usize },

    #[error("Bridged accessory limit exceeded ({limit} accessories per bridge)")]
    BridgeLimit { limit: usize },

    #[error("Service {service_type} (subtype {subtype:?}) not found")]
    ServiceNotFound {
        service_type: String,
        subtype: Option<String>,
    },

    #[error("Bridged accessory {uuid} not found")]
    BridgedAccessoryNotFound { uuid: String },

    #[error("Accessory {uuid} is already bridged")]
    AlreadyBridged { uuid: String },

    #[error("A bridged accessory may not itself bridge other accessories")]
    NestedBridge,
}

/// Errors decoding TLV payloads.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TlvError {
    #[error("TLV: truncated header at offset {offset}")]
    TruncatedHeader { offset: usize },

    #[error("TLV: truncated value (expected {expected} bytes, got {got})")]
    TruncatedValue { expected: usize, got: usize },

    #[error("TLV: missing required tag 0x{0:02x}")]
    MissingTag(u8),

    #[error("TLV: value for tag 0x{tag:02x} has unexpected length {len}")]
    UnexpectedLength { tag: u8, len: usize },

    #[error("TLV: invalid value for tag 0x{tag:02x}: {reason}")]
    InvalidValue { tag: u8, reason: String },
}

/// Errors surfaced by the persistence backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt persisted data for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
