//! # hap-core
//!
//! Core types shared across all HAP accessory-engine crates.
//!
//! This crate provides:
//! - HAP type UUIDs with short-form expansion
//! - Characteristic value, format, and constraint types
//! - Characteristic permission bitmask and per-operation admin gates
//! - Wire status codes carried verbatim to controllers
//! - The generic TLV codec used by stream-setup payloads
//! - Common error types

pub mod error;
pub mod hap_type;
pub mod perms;
pub mod status;
pub mod tlv;
pub mod value;

pub use error::{Error, Result, StorageError, StructuralError, TlvError};
pub use hap_type::HapType;
pub use perms::{AdminGates, Operation, Perms};
pub use status::HapStatus;
pub use tlv::Tlv;
pub use value::{Constraints, Format, HapValue, Unit};
