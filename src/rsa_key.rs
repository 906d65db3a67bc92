//! Device RSA keys and their wrapped storage format.
//!
//! A device RSA key is provisioned encrypted under a session key, rewrapped
//! under the device root, and later loaded back from that wrapped form:
//!
//! | offset | size | field                                    |
//! |--------|------|------------------------------------------|
//! | 0      | 32   | HMAC-SHA256 over everything that follows |
//! | 32     | 32   | random derivation context                |
//! | 64     | 16   | random IV                                |
//! | 80     | n    | AES-128-CBC encrypted PKCS#8 key         |

use std::sync::{Arc, Weak};

use base64::Engine;
use rsa::pkcs8::DecodePrivateKey;
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest as Sha1Digest, Sha1};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::message::Span;

/// RSASSA-PSS with SHA-1; the default scheme.
pub const SIGN_RSASSA_PSS: u32 = 0x1;
/// Raw PKCS#1 block type 1 padding over a caller-supplied digest.
pub const SIGN_PKCS1_BLOCK1: u32 = 0x2;

/// Longest message accepted for PKCS#1 block 1 signatures.
const PKCS1_MAX_MESSAGE: usize = 83;

/// Wrapped keys loaded by certificate-provisioned devices instead of a real
/// wrapped key.
pub const BAKED_IN_CERTIFICATE_MAGIC: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

/// Signature padding schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    RsassaPss,
    Pkcs1Block1,
}

impl SignatureScheme {
    #[must_use]
    pub fn bit(self) -> u32 {
        match self {
            SignatureScheme::RsassaPss => SIGN_RSASSA_PSS,
            SignatureScheme::Pkcs1Block1 => SIGN_PKCS1_BLOCK1,
        }
    }
}

/// An RSA private key tagged with the signature schemes it may use.
pub struct RsaKey {
    key: RsaPrivateKey,
    allowed_schemes: u32,
}

impl std::fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKey")
            .field("bits", &(self.key.size() * 8))
            .field("allowed_schemes", &self.allowed_schemes)
            .finish()
    }
}

impl RsaKey {
    /// Parse a PKCS#8 key, optionally prefixed by `"SIGN"` and a big-endian
    /// scheme bitmask.
    pub fn from_pkcs8(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::InvalidRsaKey("very short buffer".to_string()));
        }
        let (allowed_schemes, der) = if &data[..4] == b"SIGN" {
            let schemes = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            (schemes, &data[8..])
        } else {
            (SIGN_RSASSA_PSS, data)
        };
        let key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| Error::InvalidRsaKey(format!("failed to parse PKCS#8: {}", e)))?;
        Ok(Self {
            key,
            allowed_schemes,
        })
    }

    /// Modulus size in bytes, which is also the signature size.
    #[must_use]
    pub fn modulus_size(&self) -> usize {
        self.key.size()
    }

    #[must_use]
    pub fn allowed_schemes(&self) -> u32 {
        self.allowed_schemes
    }

    #[must_use]
    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    /// Sign `message` with the given scheme.
    ///
    /// PSS hashes the message with SHA-1 first. PKCS#1 block 1 pads the
    /// message as-is, so it must already be a digest.
    pub fn sign(&self, message: &[u8], scheme: SignatureScheme) -> Result<Vec<u8>> {
        if self.allowed_schemes & scheme.bit() == 0 {
            return Err(Error::InvalidRsaKey(format!(
                "scheme {:?} not allowed (mask {:#x})",
                scheme, self.allowed_schemes
            )));
        }
        match scheme {
            SignatureScheme::RsassaPss => {
                let hash = Sha1::digest(message);
                let mut rng = OsRng;
                self.key
                    .sign_with_rng(&mut rng, Pss::new_with_salt::<Sha1>(20), &hash)
                    .map_err(Error::RsaError)
            }
            SignatureScheme::Pkcs1Block1 => {
                if message.len() > PKCS1_MAX_MESSAGE {
                    return Err(Error::SignatureFailure);
                }
                self.key
                    .sign(Pkcs1v15Sign::new_unprefixed(), message)
                    .map_err(Error::RsaError)
            }
        }
    }

    /// RSA-OAEP (SHA-1) decrypt a session key.
    pub fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.key
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(Error::RsaError)
    }
}

/// A session's handle on an RSA key.
///
/// Keys loaded by the session itself are owned. The device key held by the
/// root of trust is only borrowed: it disappears from the session once the
/// root drops it.
#[derive(Debug, Clone)]
pub enum SessionRsaKey {
    Shared(Weak<RsaKey>),
    Owned(Arc<RsaKey>),
}

impl SessionRsaKey {
    #[must_use]
    pub fn get(&self) -> Option<Arc<RsaKey>> {
        match self {
            SessionRsaKey::Shared(key) => key.upgrade(),
            SessionRsaKey::Owned(key) => Some(Arc::clone(key)),
        }
    }
}

/// A device RSA key wrapped under the device root.
#[derive(Debug, Clone)]
pub struct WrappedRsaKey {
    pub signature: [u8; 32],
    pub context: [u8; 32],
    pub iv: [u8; 16],
    pub enc_rsa_key: Vec<u8>,
}

impl WrappedRsaKey {
    /// Bytes in front of the encrypted key.
    pub const HEADER_SIZE: usize = 32 + 32 + 16;

    /// Total size of a wrapped key holding `enc_len` encrypted bytes.
    #[must_use]
    pub fn wrapped_size(enc_len: usize) -> usize {
        Self::HEADER_SIZE + enc_len
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() <= Self::HEADER_SIZE || (data.len() - Self::HEADER_SIZE) % 16 != 0 {
            return Err(Error::InvalidRsaKey(format!(
                "wrapped key has bad length {}",
                data.len()
            )));
        }
        let mut signature = [0u8; 32];
        let mut context = [0u8; 32];
        let mut iv = [0u8; 16];
        signature.copy_from_slice(&data[..32]);
        context.copy_from_slice(&data[32..64]);
        iv.copy_from_slice(&data[64..80]);
        Ok(Self {
            signature,
            context,
            iv,
            enc_rsa_key: data[Self::HEADER_SIZE..].to_vec(),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::wrapped_size(self.enc_rsa_key.len()));
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.signed_bytes());
        out
    }

    /// The region covered by the signature.
    #[must_use]
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_SIZE - 32 + self.enc_rsa_key.len());
        out.extend_from_slice(&self.context);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.enc_rsa_key);
        out
    }
}

/// The two provisioning messages that deliver a device RSA key for rewrap.
#[derive(Debug, Clone, Copy)]
pub enum RewrapRequest<'a> {
    /// Keybox devices: the key is encrypted with the session's derived key
    /// and authenticated by the server's signature over `message`.
    Keybox {
        message: &'a [u8],
        signature: &'a [u8],
        nonce: u32,
        enc_rsa_key: Span,
        enc_rsa_key_iv: Span,
    },
    /// OEM-certificate devices: the key is encrypted with a message key that
    /// is itself RSA-OAEP encrypted to the device certificate.
    SessionKey {
        nonce: u32,
        encrypted_message_key: &'a [u8],
        enc_rsa_key: &'a [u8],
        enc_rsa_key_iv: &'a [u8],
    },
}

/// Strip the trailing padding count from a decrypted key.
pub(crate) fn strip_key_padding(decrypted: &[u8]) -> Result<&[u8]> {
    let padding = decrypted
        .last()
        .map(|b| *b as usize)
        .ok_or_else(|| Error::InvalidRsaKey("empty key".to_string()))?;
    if padding > 16 || padding > decrypted.len() {
        return Err(Error::InvalidRsaKey(format!("bad padding {}", padding)));
    }
    Ok(&decrypted[..decrypted.len() - padding])
}

/// PKCS#8 key used by test builds that have no provisioned certificate.
const TEST_RSA_KEY_B64: &str = concat!(
    "MIIEvQIBADANBgkqhkiG9w0BAQEFAASCBKcwggSjAgEAAoIBAQC86ysbLTZkOOZp",
    "Wwj8Q2UqJa2xS6BcHos+dcGsuodH3rCt6ShfxlQLO3PMSRhQBSddQi0lbS7TdeRt",
    "OX4uPwFJU2YjZKpEQJP08esshnvCfV1/U6kO59uCdHpZWwVL/MvAwqmiQ/l0qJIb",
    "4fzfPfzHtlw5sd98XbHd7XjMYs7J758aWaeZ648DR+qgmql/rnKoeY+OzuBucmg4",
    "aG/1t6Cj4lmRw2QiIws5vrLRZYRJKZe5AAcQUb3j8/i4qdKYxYpmi38itqIo1C5H",
    "/RIOmgcXXUk9XgG1YA5kNoVOeFg02FYRqwR5onf3g8Q9Ukbh8tj78s49DGaW/bUH",
    "gX6EXfkPAgMBAAECggEAAWBfRIfsTQejGiJpKtlc29VBcjjAVtt8HTzjZ9xGDw5+",
    "0A2SVzxNMXXB7rubmz2mX0YTqSGmBTFnNCqGklSwMDYU2O4rVWr5CQBYO89RCIY8",
    "T6iu4yZqUYWCvLLuk3Kok2N3s/B12VU/F0fqvT+o31WjT2JN5AyUtq67whV4Nz1u",
    "AVbei791vBDW45Rlr/se3PjlsIFUNia5xUixf57SZ7bi5Npar7cTFlA9hR6g2Ga8",
    "KsUX2M9al8MqsgLNV/Xtpnx8qz7FWu+uunuOEefk2MepoWIUb1IeYPzeNI/875rj",
    "X+URIyqRq7y65P3DaV/cRwnAFGxTjzvPG82hwMHLkQKBgQDfdAAtJZ/wetXksbhu",
    "Sgm+pdSYIZfYkQ8yDfPbuBvdCgF+M40tBefU5h6ZSd/aTsfmaafr3H0vL7BBd7fZ",
    "SbCyp/ZT5FaglFV5mrcb1YnjB81kfn1SH8P4YsJxMzB6yeOiJgZBKUrXyTOxX86r",
    "/HYnk3MPoDP+LJ+W7uq4dBq9UQKBgQDYb3bCO3aEyQJD5ib68JYLFLuqRt9CC4cs",
    "gqrYKRBbksChmzJw+YLkF2dcFYQTCvVby5X3VX+iNd4khy3UcYQHgWQHvCD1I1op",
    "MhScLMBkCNr/y6HJ6GmVR0kVwJJjIZnXJy9VjRT3Ixt2d0wrClV5b/1nIZY0pa4V",
    "udV4Yog4XwKBgQCld27R/7SKDUvqh7f845KHvKDK7sVUt0Y7WJ2lrJXlfo1QeLgo",
    "COF9g9JQzKWZMRFSDBcuzx1cHcI1GIPpwWm5QitkQAft7SnGXM0PLXdnyNVNf2Up",
    "tSAXBHrb/H3/zxRjdCjZg8xKMlG3HS0bql2MPOHNRmJ5621aBR2G7WMHoQKBgCwk",
    "H35hjjxqmnGqoMyRAKjl45hIuAPKQhlL1Pgc998VQQA0nMb5vD40n7niEXuown2k",
    "OcOlxlAY2GNuxmQLerflJbeGINqeCSdZtWZcoihEvhVpPGfnZJEzZq5vBev90FhW",
    "/4pdKad1m4Y/smMcym3n7zB3YyD9oVGBAw54WfvVAoGAOQLRHKSWADxClLvBuPqd",
    "qWCkwex9O+gtoMsEGUC7Oo+Z1mKoyTUxwNUiJ3Q4V0GtgjYDyrZxt0kAj/C+aXsa",
    "bzzvdBgm2CvxHXumpLwW0N2VlS3101rfkr/bF6lOwFLcYkf62Yz9EIwgSgXzQ3i+",
    "drlmsvS23HnaP9SDXAk2k0M=",
);

/// Decode the built-in test RSA key.
pub fn test_rsa_key_der() -> Result<Zeroizing<Vec<u8>>> {
    Ok(Zeroizing::new(
        base64::engine::general_purpose::STANDARD.decode(TEST_RSA_KEY_B64)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parses_with_default_scheme() {
        let key = RsaKey::from_pkcs8(&test_rsa_key_der().expect("decode")).expect("parse");
        assert_eq!(key.modulus_size(), 256);
        assert_eq!(key.allowed_schemes(), SIGN_RSASSA_PSS);
    }

    #[test]
    fn sign_prefix_selects_schemes() {
        let der = test_rsa_key_der().expect("decode");
        let mut prefixed = b"SIGN".to_vec();
        prefixed.extend_from_slice(&SIGN_PKCS1_BLOCK1.to_be_bytes());
        prefixed.extend_from_slice(&der);
        let key = RsaKey::from_pkcs8(&prefixed).expect("parse");

        assert!(key.sign(b"message", SignatureScheme::RsassaPss).is_err());
        let digest = [0x42u8; 20];
        let signature = key
            .sign(&digest, SignatureScheme::Pkcs1Block1)
            .expect("sign");
        key.public_key()
            .verify(Pkcs1v15Sign::new_unprefixed(), &digest, &signature)
            .expect("verifies");
        assert!(matches!(
            key.sign(&[0u8; 84], SignatureScheme::Pkcs1Block1),
            Err(Error::SignatureFailure)
        ));
    }

    #[test]
    fn pss_signature_verifies() {
        let key = RsaKey::from_pkcs8(&test_rsa_key_der().expect("decode")).expect("parse");
        let signature = key.sign(b"hello", SignatureScheme::RsassaPss).expect("sign");
        let hash = Sha1::digest(b"hello");
        key.public_key()
            .verify(Pss::new::<Sha1>(), &hash, &signature)
            .expect("verifies");
    }

    #[test]
    fn shared_handle_follows_owner() {
        let owner = Arc::new(RsaKey::from_pkcs8(&test_rsa_key_der().expect("decode")).expect("parse"));
        let shared = SessionRsaKey::Shared(Arc::downgrade(&owner));
        assert!(shared.get().is_some());
        drop(owner);
        assert!(shared.get().is_none());
    }

    #[test]
    fn padding_is_bounded() {
        let mut data = vec![7u8; 32];
        data[31] = 4;
        assert_eq!(strip_key_padding(&data).expect("ok").len(), 28);
        data[31] = 17;
        assert!(strip_key_padding(&data).is_err());
    }
}
