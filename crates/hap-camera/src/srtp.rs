//! SRTP crypto-suite negotiation parameters.

use hap_core::{Tlv, TlvError};
use rand::RngCore;

// SRTP parameter sub-TLV tags
const TAG_CRYPTO_SUITE: u8 = 0x01;
const TAG_MASTER_KEY: u8 = 0x02;
const TAG_MASTER_SALT: u8 = 0x03;

/// Negotiable SRTP crypto suites. Wire values are protocol constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SrtpCryptoSuite {
    AesCm128HmacSha1_80 = 0,
    AesCm256HmacSha1_80 = 1,
    /// No SRTP: legacy peers that only speak plain RTP.
    Disabled = 2,
}

impl SrtpCryptoSuite {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AesCm128HmacSha1_80),
            1 => Some(Self::AesCm256HmacSha1_80),
            2 => Some(Self::Disabled),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Master key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::AesCm128HmacSha1_80 => 16,
            Self::AesCm256HmacSha1_80 => 32,
            Self::Disabled => 0,
        }
    }

    /// Master salt length in bytes.
    pub fn salt_len(self) -> usize {
        match self {
            Self::Disabled => 0,
            _ => 14,
        }
    }
}

/// One direction's SRTP material: suite plus master key/salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpParameters {
    pub suite: SrtpCryptoSuite,
    pub key: Vec<u8>,
    pub salt: Vec<u8>,
}

impl SrtpParameters {
    /// Generate fresh key material for a suite.
    pub fn generate(suite: SrtpCryptoSuite) -> Self {
        let mut rng = rand::thread_rng();
        let mut key = vec![0u8; suite.key_len()];
        let mut salt = vec![0u8; suite.salt_len()];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut salt);
        Self { suite, key, salt }
    }

    /// The no-SRTP compatibility variant.
    pub fn disabled() -> Self {
        Self {
            suite: SrtpCryptoSuite::Disabled,
            key: Vec::new(),
            salt: Vec::new(),
        }
    }

    /// Decode from a nested SRTP-parameter TLV blob.
    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::decode(data)?;
        let raw_suite = tlv.u8(TAG_CRYPTO_SUITE)?;
        let suite = SrtpCryptoSuite::from_u8(raw_suite).ok_or(TlvError::InvalidValue {
            tag: TAG_CRYPTO_SUITE,
            reason: format!("unknown crypto suite {}", raw_suite),
        })?;

        let (key, salt) = if suite == SrtpCryptoSuite::Disabled {
            (Vec::new(), Vec::new())
        } else {
            let key = tlv.required(TAG_MASTER_KEY)?.to_vec();
            let salt = tlv.required(TAG_MASTER_SALT)?.to_vec();
            if key.len() != suite.key_len() {
                return Err(TlvError::UnexpectedLength {
                    tag: TAG_MASTER_KEY,
                    len: key.len(),
                });
            }
            if salt.len() != suite.salt_len() {
                return Err(TlvError::UnexpectedLength {
                    tag: TAG_MASTER_SALT,
                    len: salt.len(),
                });
            }
            (key, salt)
        };

        Ok(Self { suite, key, salt })
    }

    /// Encode as a nested SRTP-parameter TLV blob.
    pub fn encode(&self) -> Vec<u8> {
        let mut tlv = Tlv::new();
        tlv.push_u8(TAG_CRYPTO_SUITE, self.suite.as_u8());
        if self.suite != SrtpCryptoSuite::Disabled {
            tlv.push(TAG_MASTER_KEY, self.key.clone());
            tlv.push(TAG_MASTER_SALT, self.salt.clone());
        }
        tlv.encode()
    }
}
