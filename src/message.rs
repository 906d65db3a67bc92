//! Offset/length spans into a signed license message.
//!
//! Callers describe fields of a message as [`Span`]s. A [`Message`] resolves a
//! span into a sub-slice only after checking it lies within the message, so no
//! field access can escape the buffer.

use crate::error::{Error, Result};
use crate::key_table::LicenseType;

const MAC_KEY_IV_SIZE: usize = 16;

/// A field location inside a message buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub length: usize,
}

impl Span {
    pub const EMPTY: Span = Span {
        offset: 0,
        length: 0,
    };

    #[must_use]
    pub const fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// A message buffer that hands out range-checked fields.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    bytes: &'a [u8],
}

impl<'a> Message<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::context("message is empty"));
        }
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Resolve a field that must be present.
    pub fn field(&self, span: Span) -> Result<&'a [u8]> {
        if span.is_empty() {
            return Err(Error::context("required field is empty"));
        }
        self.slice(span)
    }

    /// Resolve a field that may be absent. An empty span yields an empty slice.
    pub fn optional_field(&self, span: Span) -> Result<&'a [u8]> {
        if span.is_empty() {
            return Ok(&[]);
        }
        self.slice(span)
    }

    fn slice(&self, span: Span) -> Result<&'a [u8]> {
        let end = span
            .offset
            .checked_add(span.length)
            .ok_or_else(|| Error::context("field span overflows"))?;
        self.bytes.get(span.offset..end).ok_or_else(|| {
            Error::context(format!(
                "field {}..{} outside message of {} bytes",
                span.offset,
                end,
                self.bytes.len()
            ))
        })
    }

    /// Reject a mac-key IV that sits directly in front of the encrypted mac
    /// keys, or that duplicates the block preceding them.
    pub(crate) fn check_mac_key_iv(&self, iv: Span, enc_mac_keys: Span) -> Result<()> {
        if enc_mac_keys.is_empty() {
            return Ok(());
        }
        if iv.length != MAC_KEY_IV_SIZE {
            return Err(Error::context(format!(
                "mac key IV is {} bytes, expected {}",
                iv.length, MAC_KEY_IV_SIZE
            )));
        }
        let iv_bytes = self.field(iv)?;
        let Some(preceding_offset) = enc_mac_keys.offset.checked_sub(MAC_KEY_IV_SIZE) else {
            return Ok(());
        };
        if iv.offset == preceding_offset {
            return Err(Error::context("mac key IV adjacent to encrypted mac keys"));
        }
        let preceding = self.slice(Span::new(preceding_offset, MAC_KEY_IV_SIZE))?;
        if iv_bytes == preceding {
            return Err(Error::context("mac key IV repeats preceding block"));
        }
        Ok(())
    }
}

/// One wrapped content key in a license.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyObject {
    pub key_id: Span,
    pub key_data_iv: Span,
    pub key_data: Span,
    pub key_control_iv: Span,
    pub key_control: Span,
}

/// Field layout of a license response handed to
/// [`crate::engine::Engine::load_keys`].
#[derive(Debug, Clone, Copy)]
pub struct LoadKeysRequest<'a> {
    pub enc_mac_keys_iv: Span,
    pub enc_mac_keys: Span,
    pub keys: &'a [KeyObject],
    pub pst: Span,
    pub srm_restriction_data: Span,
    pub license_type: LicenseType,
}

impl LoadKeysRequest<'_> {
    /// Range-check every field against `message`.
    pub fn validate(&self, message: &Message<'_>) -> Result<()> {
        if self.keys.is_empty() {
            return Err(Error::context("no keys in license"));
        }
        message.optional_field(self.enc_mac_keys_iv)?;
        message.optional_field(self.enc_mac_keys)?;
        message.optional_field(self.pst)?;
        message.optional_field(self.srm_restriction_data)?;
        for (i, key) in self.keys.iter().enumerate() {
            for span in [
                key.key_id,
                key.key_data,
                key.key_data_iv,
                key.key_control,
                key.key_control_iv,
            ] {
                message
                    .field(span)
                    .map_err(|e| Error::context(format!("key {}: {}", i, e)))?;
            }
        }
        message.check_mac_key_iv(self.enc_mac_keys_iv, self.enc_mac_keys)
    }
}

/// A content key wrapped by an entitlement key.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntitledContentKeyObject {
    pub entitlement_key_id: Span,
    pub content_key_id: Span,
    pub content_key_data_iv: Span,
    pub content_key_data: Span,
}

impl EntitledContentKeyObject {
    pub fn validate(&self, message: &Message<'_>) -> Result<()> {
        message.field(self.entitlement_key_id)?;
        message.field(self.content_key_id)?;
        message.field(self.content_key_data_iv)?;
        message.field(self.content_key_data)?;
        Ok(())
    }
}

/// A renewed control block. An empty `key_id` applies the block to every
/// key, in which case the block is sent in the clear.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyRefreshObject {
    pub key_id: Span,
    pub key_control_iv: Span,
    pub key_control: Span,
}

impl KeyRefreshObject {
    pub fn validate(&self, message: &Message<'_>) -> Result<()> {
        message.optional_field(self.key_id)?;
        message.field(self.key_control)?;
        message.optional_field(self.key_control_iv)?;
        Ok(())
    }
}
