//! DNSCrypt packet sealing and padding

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{ChaChaBox, PublicKey, SalsaBox, SecretKey};

use super::cert::Construction;
use crate::error::{Error, Result};

/// Plaintext is padded to a multiple of this many bytes
pub(crate) const PADDING_BLOCK: usize = 64;

/// Minimum padded query size over UDP
pub(crate) const MIN_UDP_QUERY_SIZE: usize = 256;

/// Key shared between the client and one resolver certificate
pub(crate) enum SharedKey {
    Salsa(SalsaBox),
    ChaCha(ChaChaBox),
}

impl SharedKey {
    pub(crate) fn new(construction: Construction, client_sk: &SecretKey, resolver_pk: &[u8; 32]) -> Self {
        let resolver_pk = PublicKey::from(*resolver_pk);
        match construction {
            Construction::XSalsa20Poly1305 => SharedKey::Salsa(SalsaBox::new(&resolver_pk, client_sk)),
            Construction::XChaCha20Poly1305 => SharedKey::ChaCha(ChaChaBox::new(&resolver_pk, client_sk)),
        }
    }

    pub(crate) fn seal(&self, nonce: &[u8; 24], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        let sealed = match self {
            SharedKey::Salsa(b) => b.encrypt(nonce, plaintext),
            SharedKey::ChaCha(b) => b.encrypt(nonce, plaintext),
        };
        sealed.map_err(|_| Error::Protocol("failed to encrypt DNSCrypt query".into()))
    }

    pub(crate) fn open(&self, nonce: &[u8; 24], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        let opened = match self {
            SharedKey::Salsa(b) => b.decrypt(nonce, ciphertext),
            SharedKey::ChaCha(b) => b.decrypt(nonce, ciphertext),
        };
        opened.map_err(|_| Error::Protocol("failed to decrypt DNSCrypt response".into()))
    }
}

/// ISO/IEC 7816-4 padding up to a multiple of [`PADDING_BLOCK`], at least `min_len`
pub(crate) fn pad(packet: &[u8], min_len: usize) -> Vec<u8> {
    let target = (packet.len() + 1).max(min_len);
    let padded_len = target.div_ceil(PADDING_BLOCK) * PADDING_BLOCK;

    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(packet);
    padded.push(0x80);
    padded.resize(padded_len, 0);
    padded
}

/// Strip padding added by [`pad`]
pub(crate) fn unpad(packet: &[u8]) -> Result<&[u8]> {
    let end = packet
        .iter()
        .rposition(|&b| b != 0)
        .ok_or_else(|| Error::Protocol("DNSCrypt response has no padding marker".into()))?;

    if packet[end] != 0x80 {
        return Err(Error::Protocol("invalid DNSCrypt padding".into()));
    }
    Ok(&packet[..end])
}
