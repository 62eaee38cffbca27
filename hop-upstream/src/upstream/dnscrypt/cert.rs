//! DNSCrypt resolver certificates
//!
//! Providers publish certificates as TXT records on their provider name:
//!
//! ```text
//! 0      4          6             8           72
//! | DNSC | es-version | minor (u16) | signature | resolver pk | client magic | serial | ts-start | ts-end |
//!                                              |<------------------ signed, 52 bytes ------------------>|
//! ```
//!
//! All integers are big-endian. The signature is Ed25519 by the provider
//! key carried in the server stamp.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::{Error, Result};

const CERT_MAGIC: &[u8; 4] = b"DNSC";

/// Encryption system a certificate announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Construction {
    /// X25519-XSalsa20Poly1305, es-version 1
    XSalsa20Poly1305,

    /// X25519-XChaCha20Poly1305, es-version 2
    XChaCha20Poly1305,
}

impl Construction {
    fn from_es_version(version: u16) -> Option<Self> {
        match version {
            1 => Some(Construction::XSalsa20Poly1305),
            2 => Some(Construction::XChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn es_version(&self) -> u16 {
        match self {
            Construction::XSalsa20Poly1305 => 1,
            Construction::XChaCha20Poly1305 => 2,
        }
    }
}

/// A verified resolver certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverCertificate {
    construction: Construction,
    resolver_pk: [u8; 32],
    client_magic: [u8; 8],
    serial: u32,
    valid_from: u32,
    valid_until: u32,
}

impl ResolverCertificate {
    /// Size of an encoded certificate
    pub const LEN: usize = 124;

    /// Parse `bytes` and verify its signature against `provider_pk`
    pub fn parse(bytes: &[u8], provider_pk: &[u8; 32]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(Error::Protocol(format!(
                "certificate is {} bytes, expected {}",
                bytes.len(),
                Self::LEN
            )));
        }
        if &bytes[..4] != CERT_MAGIC {
            return Err(Error::Protocol("certificate magic mismatch".into()));
        }

        let es_version = u16::from_be_bytes([bytes[4], bytes[5]]);
        let construction = Construction::from_es_version(es_version).ok_or_else(|| {
            Error::Protocol(format!("unsupported certificate es-version {}", es_version))
        })?;

        let verifying_key = VerifyingKey::from_bytes(provider_pk)
            .map_err(|e| Error::Protocol(format!("invalid provider key: {}", e)))?;
        let signature = Signature::from_slice(&bytes[8..72])
            .map_err(|e| Error::Protocol(format!("malformed certificate signature: {}", e)))?;
        verifying_key
            .verify(&bytes[72..], &signature)
            .map_err(|_| Error::Protocol("certificate signature verification failed".into()))?;

        let mut resolver_pk = [0u8; 32];
        resolver_pk.copy_from_slice(&bytes[72..104]);
        let mut client_magic = [0u8; 8];
        client_magic.copy_from_slice(&bytes[104..112]);

        let be_u32 = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        Ok(Self {
            construction,
            resolver_pk,
            client_magic,
            serial: be_u32(112),
            valid_from: be_u32(116),
            valid_until: be_u32(120),
        })
    }

    pub fn construction(&self) -> Construction {
        self.construction
    }

    /// Short-term key of the resolver
    pub fn resolver_pk(&self) -> &[u8; 32] {
        &self.resolver_pk
    }

    /// Prefix of every query encrypted for this certificate
    pub fn client_magic(&self) -> &[u8; 8] {
        &self.client_magic
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn valid_from(&self) -> u32 {
        self.valid_from
    }

    pub fn valid_until(&self) -> u32 {
        self.valid_until
    }

    /// Whether `unix_time` falls within the validity window
    pub fn is_valid_at(&self, unix_time: u64) -> bool {
        u64::from(self.valid_from) <= unix_time && unix_time <= u64::from(self.valid_until)
    }
}
