//! Symmetric primitives shared by sessions, the root of trust and the usage table.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use rsa::rand_core::{OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

pub(crate) type HmacSha256 = Hmac<Sha256>;
type CmacAes128 = Cmac<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;
/// Length of an HMAC-SHA256 tag.
pub const SHA256_DIGEST_LENGTH: usize = 32;
/// Length of a derived mac key.
pub const MAC_KEY_SIZE: usize = 32;

/// Keys derived for one license exchange.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    pub mac_key_server: Vec<u8>,
    pub mac_key_client: Vec<u8>,
    pub encryption_key: Vec<u8>,
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys").finish_non_exhaustive()
    }
}

fn derive_block(key: &[u8], context: &[u8], counter: u8) -> Result<Vec<u8>> {
    let mut mac = <CmacAes128 as Mac>::new_from_slice(key)
        .map_err(|_| Error::context(format!("bad derivation key length {}", key.len())))?;
    mac.update(&[counter]);
    mac.update(context);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the server/client mac keys and the encryption key.
///
/// Each 128-bit block is AES-CMAC(key, counter || context). The server mac key
/// uses counters 1 and 2, the client mac key 3 and 4, both over `mac_context`.
/// The encryption key is counter 1 over `enc_context`.
pub fn derive_keys(master_key: &[u8], mac_context: &[u8], enc_context: &[u8]) -> Result<DerivedKeys> {
    if master_key.is_empty() || mac_context.is_empty() || enc_context.is_empty() {
        return Err(Error::context("empty key or derivation context"));
    }

    let mut mac_key_server = derive_block(master_key, mac_context, 1)?;
    mac_key_server.extend_from_slice(&derive_block(master_key, mac_context, 2)?);
    let mut mac_key_client = derive_block(master_key, mac_context, 3)?;
    mac_key_client.extend_from_slice(&derive_block(master_key, mac_context, 4)?);
    let encryption_key = derive_block(master_key, enc_context, 1)?;

    Ok(DerivedKeys {
        mac_key_server,
        mac_key_client,
        encryption_key,
    })
}

/// HMAC-SHA256 of `data`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; SHA256_DIGEST_LENGTH]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| Error::UnknownFailure("HMAC key rejected".to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Verify a 32-byte HMAC-SHA256 tag in constant time.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
    if signature.len() != SHA256_DIGEST_LENGTH {
        return Err(Error::SignatureFailure);
    }
    let computed = hmac_sha256(key, data)?;
    if bool::from(computed.ct_eq(signature)) {
        Ok(())
    } else {
        Err(Error::SignatureFailure)
    }
}

/// Constant-time equality for secrets.
#[must_use]
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// AES-128-CBC decrypt without padding. `data` must be block aligned.
pub fn aes128_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = data.to_vec();
    let decryptor = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| Error::DecryptFailed("invalid AES-128 key or IV length".to_string()))?;
    let len = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| Error::DecryptFailed(format!("CBC decrypt failed: {}", e)))?
        .len();
    buffer.truncate(len);
    Ok(buffer)
}

/// AES-128-CBC encrypt without padding. `data` must be block aligned.
pub fn aes128_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::context("CBC input is not block aligned"));
    }
    let mut buffer = data.to_vec();
    let len = buffer.len();
    Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|_| Error::UnknownFailure("invalid AES-128 key or IV length".to_string()))?
        .encrypt_padded_mut::<NoPadding>(&mut buffer, len)
        .map_err(|e| Error::UnknownFailure(format!("CBC encrypt failed: {}", e)))?;
    Ok(buffer)
}

/// AES-256-CBC decrypt without padding, used to unwrap entitled content keys.
pub fn aes256_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = data.to_vec();
    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| Error::DecryptFailed("invalid AES-256 key or IV length".to_string()))?;
    let len = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| Error::DecryptFailed(format!("CBC decrypt failed: {}", e)))?
        .len();
    buffer.truncate(len);
    Ok(buffer)
}

/// Increment the low 64 bits of a CTR counter block, big-endian, with wrap.
/// The high 64 bits are never modified.
pub fn ctr128_inc64(counter: &mut [u8; 16]) {
    for byte in counter[8..].iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// Fill a buffer from the OS random source.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

#[must_use]
pub fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    OsRng.fill_bytes(&mut buf);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_keys_is_deterministic_and_input_sensitive() {
        let key = [7u8; 16];
        let first = derive_keys(&key, b"mac-context", b"enc-context").expect("derive");
        let second = derive_keys(&key, b"mac-context", b"enc-context").expect("derive");

        assert_eq!(first.mac_key_server, second.mac_key_server);
        assert_eq!(first.mac_key_client, second.mac_key_client);
        assert_eq!(first.encryption_key, second.encryption_key);
        assert_eq!(first.mac_key_server.len(), 32);
        assert_eq!(first.mac_key_client.len(), 32);
        assert_eq!(first.encryption_key.len(), 16);

        let other_key = derive_keys(&[8u8; 16], b"mac-context", b"enc-context").expect("derive");
        assert_ne!(first.mac_key_server, other_key.mac_key_server);
        assert_ne!(first.encryption_key, other_key.encryption_key);

        let other_mac = derive_keys(&key, b"mac-context2", b"enc-context").expect("derive");
        assert_ne!(first.mac_key_client, other_mac.mac_key_client);
        assert_eq!(first.encryption_key, other_mac.encryption_key);

        let other_enc = derive_keys(&key, b"mac-context", b"enc-context2").expect("derive");
        assert_ne!(first.encryption_key, other_enc.encryption_key);
    }

    #[test]
    fn derive_keys_rejects_empty_context() {
        assert!(derive_keys(&[1u8; 16], b"", b"enc").is_err());
        assert!(derive_keys(&[], b"mac", b"enc").is_err());
    }

    #[test]
    fn ctr_increment_stays_in_low_half() {
        let mut counter = [0u8; 16];
        counter[..8].copy_from_slice(&[0xAA; 8]);
        counter[8..].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]);

        ctr128_inc64(&mut counter);
        assert_eq!(&counter[8..], &[0xFF; 8]);
        ctr128_inc64(&mut counter);
        assert_eq!(&counter[..8], &[0xAA; 8]);
        assert_eq!(&counter[8..], &[0u8; 8]);
    }

    #[test]
    fn hmac_verification_rejects_tampering() {
        let key = [3u8; 32];
        let tag = hmac_sha256(&key, b"message").expect("hmac");
        assert!(verify_hmac_sha256(&key, b"message", &tag).is_ok());
        assert!(matches!(
            verify_hmac_sha256(&key, b"messagf", &tag),
            Err(Error::SignatureFailure)
        ));
        assert!(matches!(
            verify_hmac_sha256(&key, b"message", &tag[..31]),
            Err(Error::SignatureFailure)
        ));
    }

    #[test]
    fn cbc_helpers_invert_each_other() {
        let key = [9u8; 16];
        let iv = [1u8; 16];
        let plain: Vec<u8> = (0u8..48).collect();
        let cipher = aes128_cbc_encrypt(&key, &iv, &plain).expect("encrypt");
        assert_ne!(cipher, plain);
        assert_eq!(aes128_cbc_decrypt(&key, &iv, &cipher).expect("decrypt"), plain);
    }
}
