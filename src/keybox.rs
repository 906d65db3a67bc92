//! Factory keybox parsing and validation.
//!
//! A keybox is a fixed 128-byte record:
//!
//! | offset | size | field                         |
//! |--------|------|-------------------------------|
//! | 0      | 32   | device id                     |
//! | 32     | 16   | device key                    |
//! | 48     | 72   | key data (opaque device token)|
//! | 120    | 4    | magic `kbox`                  |
//! | 124    | 4    | CRC-32 of bytes 0..124, BE    |

use std::io::Write;
use std::path::Path;

use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Magic bytes for keyboxes.
pub const KEYBOX_MAGIC: &[u8; 4] = b"kbox";

/// Size of a serialized keybox.
pub const KEYBOX_SIZE: usize = 128;

pub const DEVICE_ID_SIZE: usize = 32;
pub const DEVICE_KEY_SIZE: usize = 16;
pub const KEY_DATA_SIZE: usize = 72;

const MAGIC_OFFSET: usize = DEVICE_ID_SIZE + DEVICE_KEY_SIZE + KEY_DATA_SIZE;
const CRC_OFFSET: usize = MAGIC_OFFSET + 4;

/// Device root of trust delivered at manufacture.
#[derive(Clone)]
pub struct Keybox {
    raw: Zeroizing<[u8; KEYBOX_SIZE]>,
}

impl std::fmt::Debug for Keybox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keybox")
            .field("device_id", &String::from_utf8_lossy(self.device_id()))
            .finish_non_exhaustive()
    }
}

impl Keybox {
    /// Build a keybox from its parts, filling in the magic and CRC.
    ///
    /// The device id is zero-padded to 32 bytes.
    pub fn new(device_id: &[u8], device_key: &[u8; DEVICE_KEY_SIZE], key_data: &[u8; KEY_DATA_SIZE]) -> Result<Self> {
        if device_id.len() > DEVICE_ID_SIZE {
            return Err(Error::context(format!(
                "device id is {} bytes, max {}",
                device_id.len(),
                DEVICE_ID_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(KEYBOX_SIZE);
        buf.write_all(device_id)?;
        buf.resize(DEVICE_ID_SIZE, 0);
        buf.write_all(device_key)?;
        buf.write_all(key_data)?;
        buf.write_all(KEYBOX_MAGIC)?;
        let crc = crc32fast::hash(&buf);
        buf.write_all(&crc.to_be_bytes())?;

        let mut raw = Zeroizing::new([0u8; KEYBOX_SIZE]);
        raw.copy_from_slice(&buf);
        Ok(Self { raw })
    }

    /// Parse a keybox without validating it.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != KEYBOX_SIZE {
            return Err(Error::context(format!(
                "keybox is {} bytes, expected {}",
                data.len(),
                KEYBOX_SIZE
            )));
        }
        let mut raw = Zeroizing::new([0u8; KEYBOX_SIZE]);
        raw.copy_from_slice(data);
        Ok(Self { raw })
    }

    /// Load a keybox from a file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = Zeroizing::new(std::fs::read(path)?);
        Self::from_bytes(&data)
    }

    /// Check the magic, then the CRC.
    pub fn validate(&self) -> Result<()> {
        if &self.raw[MAGIC_OFFSET..CRC_OFFSET] != KEYBOX_MAGIC {
            return Err(Error::BadMagic);
        }
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&self.raw[CRC_OFFSET..]);
        if crc32fast::hash(&self.raw[..CRC_OFFSET]) != u32::from_be_bytes(stored) {
            return Err(Error::BadCrc);
        }
        Ok(())
    }

    #[must_use]
    pub fn device_id(&self) -> &[u8] {
        &self.raw[..DEVICE_ID_SIZE]
    }

    #[must_use]
    pub fn device_key(&self) -> &[u8] {
        &self.raw[DEVICE_ID_SIZE..DEVICE_ID_SIZE + DEVICE_KEY_SIZE]
    }

    #[must_use]
    pub fn key_data(&self) -> &[u8] {
        &self.raw[DEVICE_ID_SIZE + DEVICE_KEY_SIZE..MAGIC_OFFSET]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEYBOX_SIZE] {
        &self.raw
    }

    /// Save the keybox to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.raw.as_slice())?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_keybox() -> Keybox {
    let mut key_data = [0u8; KEY_DATA_SIZE];
    for (i, b) in key_data.iter_mut().enumerate() {
        *b = i as u8;
    }
    Keybox::new(b"TestDevice0001", &[0x11; DEVICE_KEY_SIZE], &key_data).expect("keybox")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_keybox_validates() {
        let keybox = test_keybox();
        keybox.validate().expect("valid");
        assert_eq!(&keybox.device_id()[..14], b"TestDevice0001");
        assert_eq!(&keybox.device_id()[14..], &[0u8; 18]);
        assert_eq!(keybox.device_key(), &[0x11; 16]);
        assert_eq!(keybox.key_data().len(), KEY_DATA_SIZE);
    }

    #[test]
    fn corruption_is_classified() {
        let mut bytes = *test_keybox().as_bytes();
        bytes[0] ^= 1;
        assert!(matches!(
            Keybox::from_bytes(&bytes).expect("parse").validate(),
            Err(Error::BadCrc)
        ));

        let mut bytes = *test_keybox().as_bytes();
        bytes[MAGIC_OFFSET] = b'x';
        assert!(matches!(
            Keybox::from_bytes(&bytes).expect("parse").validate(),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn wrong_size_is_rejected() {
        assert!(Keybox::from_bytes(&[0u8; 127]).is_err());
    }
}
