//! Key control blocks and the content keys they govern.
//!
//! A key control block is a 16-byte big-endian record delivered encrypted
//! alongside every content key:
//!
//! | offset | field        |
//! |--------|--------------|
//! | 0      | verification |
//! | 4      | duration     |
//! | 8      | nonce        |
//! | 12     | control bits |

use zeroize::Zeroizing;

use crate::cenc::BufferType;
use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// Size of an encoded key control block.
pub const KEY_CONTROL_SIZE: usize = 16;

/// Control bit masks.
pub mod bits {
    pub const OBSERVE_DATA_PATH: u32 = 1 << 31;
    pub const OBSERVE_HDCP: u32 = 1 << 30;
    pub const OBSERVE_CGMS: u32 = 1 << 29;
    pub const REQUIRE_ANTI_ROLLBACK_HARDWARE: u32 = 1 << 28;
    pub const ALLOW_HASH_VERIFICATION: u32 = 1 << 24;
    pub const SHARED_LICENSE: u32 = 1 << 23;
    pub const SRM_VERSION_REQUIRED: u32 = 1 << 22;
    pub const DISABLE_ANALOG_OUTPUT: u32 = 1 << 21;
    pub const SECURITY_PATCH_LEVEL_SHIFT: u32 = 15;
    pub const SECURITY_PATCH_LEVEL_MASK: u32 = 0x3F << SECURITY_PATCH_LEVEL_SHIFT;
    pub const REPLAY_SHIFT: u32 = 13;
    pub const REPLAY_MASK: u32 = 0x3 << REPLAY_SHIFT;
    pub const NONCE_REQUIRED: u32 = 1 << REPLAY_SHIFT;
    pub const NONCE_OR_ENTRY: u32 = 2 << REPLAY_SHIFT;
    pub const HDCP_VERSION_SHIFT: u32 = 9;
    pub const HDCP_VERSION_MASK: u32 = 0xF << HDCP_VERSION_SHIFT;
    pub const ALLOW_ENCRYPT: u32 = 1 << 8;
    pub const ALLOW_DECRYPT: u32 = 1 << 7;
    pub const ALLOW_SIGN: u32 = 1 << 6;
    pub const ALLOW_VERIFY: u32 = 1 << 5;
    pub const DATA_PATH_SECURE: u32 = 1 << 4;
    pub const NONCE_ENABLED: u32 = 1 << 3;
    pub const HDCP_REQUIRED: u32 = 1 << 2;
    pub const CGMS_MASK: u32 = 0x03;
}

/// Required HDCP level meaning "no digital output at all".
pub const HDCP_NO_DIGITAL_OUTPUT: u8 = 0xff;

/// Replay protection requested by a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayControl {
    /// No replay policy; the nonce is checked only if nonce-enabled is set.
    None,
    /// Online license: fresh nonce, no usage entry.
    NonceRequired,
    /// Offline license: usage entry required, nonce on first load only.
    NonceOrEntry,
}

/// Operation a key is about to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUse {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    /// CENC sample decryption; allowed by any key that got this far.
    Cenc,
}

impl KeyUse {
    fn allow_bit(self) -> u32 {
        match self {
            KeyUse::Encrypt => bits::ALLOW_ENCRYPT,
            KeyUse::Decrypt => bits::ALLOW_DECRYPT,
            KeyUse::Sign => bits::ALLOW_SIGN,
            KeyUse::Verify => bits::ALLOW_VERIFY,
            KeyUse::Cenc => 0,
        }
    }
}

/// Verification tags and the control-block generation each one selects.
const TAGS: &[(&[u8; 4], u8)] = &[
    (b"kctl", 0),
    (b"kc09", 9),
    (b"kc10", 10),
    (b"kc11", 11),
    (b"kc12", 12),
    (b"kc13", 13),
    (b"kc14", 14),
    (b"kc15", 15),
];

/// Oldest generation that defines each control bit. Bits not listed are
/// understood by every generation.
const BIT_GENERATIONS: &[(u32, u8)] = &[
    (bits::HDCP_VERSION_MASK, 9),
    (bits::REPLAY_MASK, 9),
    (bits::REQUIRE_ANTI_ROLLBACK_HARDWARE, 10),
    (bits::SECURITY_PATCH_LEVEL_MASK, 11),
    (bits::SRM_VERSION_REQUIRED, 13),
    (bits::ALLOW_HASH_VERIFICATION, 13),
];

/// Parsed usage policy for one content key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyControlBlock {
    verification: [u8; 4],
    generation: u8,
    duration: u32,
    nonce: u32,
    control_bits: u32,
}

impl KeyControlBlock {
    /// Parse and validate a decrypted control block.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < KEY_CONTROL_SIZE {
            return Err(Error::context(format!(
                "key control block is {} bytes",
                data.len()
            )));
        }
        let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);

        let mut verification = [0u8; 4];
        verification.copy_from_slice(&data[..4]);
        let generation = TAGS
            .iter()
            .find(|(tag, _)| **tag == verification)
            .map(|(_, generation)| *generation)
            .ok_or_else(|| {
                Error::context(format!(
                    "unknown key control verification {:?}",
                    String::from_utf8_lossy(&verification)
                ))
            })?;

        let block = Self {
            verification,
            generation,
            duration: word(4),
            nonce: word(8),
            control_bits: word(12),
        };
        block.validate()?;
        Ok(block)
    }

    fn validate(&self) -> Result<()> {
        for (mask, since) in BIT_GENERATIONS {
            if self.control_bits & mask != 0 && self.generation < *since {
                return Err(Error::context(format!(
                    "control bits {:#010x} need kc{:02}, block is {}",
                    self.control_bits & mask,
                    since,
                    String::from_utf8_lossy(&self.verification)
                )));
            }
        }
        Ok(())
    }

    /// Encode as the 16-byte wire record.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_CONTROL_SIZE] {
        let mut out = [0u8; KEY_CONTROL_SIZE];
        out[..4].copy_from_slice(&self.verification);
        out[4..8].copy_from_slice(&self.duration.to_be_bytes());
        out[8..12].copy_from_slice(&self.nonce.to_be_bytes());
        out[12..].copy_from_slice(&self.control_bits.to_be_bytes());
        out
    }

    #[must_use]
    pub fn verification(&self) -> &[u8; 4] {
        &self.verification
    }

    #[must_use]
    pub fn duration(&self) -> u32 {
        self.duration
    }

    #[must_use]
    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    #[must_use]
    pub fn control_bits(&self) -> u32 {
        self.control_bits
    }

    #[must_use]
    pub fn has(&self, mask: u32) -> bool {
        self.control_bits & mask != 0
    }

    #[must_use]
    pub fn replay_control(&self) -> ReplayControl {
        match self.control_bits & bits::REPLAY_MASK {
            bits::NONCE_REQUIRED => ReplayControl::NonceRequired,
            bits::NONCE_OR_ENTRY => ReplayControl::NonceOrEntry,
            _ => ReplayControl::None,
        }
    }

    #[must_use]
    pub fn hdcp_version(&self) -> u8 {
        ((self.control_bits & bits::HDCP_VERSION_MASK) >> bits::HDCP_VERSION_SHIFT) as u8
    }

    #[must_use]
    pub fn minimum_patch_level(&self) -> u8 {
        ((self.control_bits & bits::SECURITY_PATCH_LEVEL_MASK) >> bits::SECURITY_PATCH_LEVEL_SHIFT)
            as u8
    }

    /// Restrict the key to a local display (used when the SRM is stale).
    pub fn require_local_display(&mut self) {
        self.control_bits |= bits::HDCP_REQUIRED | bits::HDCP_VERSION_MASK;
    }

    /// Apply a renewal: only duration, nonce and control bits change.
    pub fn refresh_from(&mut self, other: &KeyControlBlock) {
        self.duration = other.duration;
        self.nonce = other.nonce;
        self.control_bits = other.control_bits;
    }

    pub fn set_duration(&mut self, duration: u32) {
        self.duration = duration;
    }

    /// Enforce this block's policy for one use of its key.
    ///
    /// `check_replay` is invoked only when the block carries a replay policy
    /// and must fail if the session's usage entry is missing or inactive.
    pub fn check_use(
        &self,
        use_: KeyUse,
        ctx: &PolicyContext<'_>,
        check_replay: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        let allow = use_.allow_bit();
        if allow != 0 && !self.has(allow) {
            return Err(Error::UnknownFailure(format!("key does not allow {:?}", use_)));
        }
        if self.has(bits::DATA_PATH_SECURE)
            && !ctx.config.closed_platform
            && ctx.buffer_type == BufferType::Clear
        {
            return Err(Error::DecryptFailed("secure key with clear buffer".to_string()));
        }
        if self.has(bits::REPLAY_MASK) {
            check_replay()?;
        }
        if self.duration > 0 && u64::from(self.duration) < ctx.elapsed_secs {
            return Err(Error::KeyExpired);
        }
        if !ctx.config.local_display_only && self.has(bits::HDCP_REQUIRED) {
            let required = if ctx.config.revoked_device_attached {
                HDCP_NO_DIGITAL_OUTPUT
            } else {
                self.hdcp_version()
            };
            let current = ctx.config.current_hdcp_capability().level();
            if required > current || current == 0 {
                return Err(Error::InsufficientHdcp);
            }
        }
        if self.has(bits::DISABLE_ANALOG_OUTPUT)
            && (ctx.config.analog_display_active() || ctx.buffer_type == BufferType::Clear)
        {
            return Err(Error::AnalogOutput);
        }
        if self.has(bits::CGMS_MASK) {
            if ctx.buffer_type == BufferType::Clear {
                return Err(Error::AnalogOutput);
            }
            if ctx.config.analog_display_active() && !ctx.config.cgms_a_active() {
                return Err(Error::AnalogOutput);
            }
        }
        Ok(())
    }
}

/// Platform and session facts consulted by [`KeyControlBlock::check_use`].
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub config: &'a EngineConfig,
    pub buffer_type: BufferType,
    /// Seconds since the session's keys were loaded.
    pub elapsed_secs: u64,
}

/// Content key material unwrapped through an entitlement key.
#[derive(Debug, Clone)]
pub struct EntitledContentKey {
    pub key_id: Vec<u8>,
    pub key: Zeroizing<Vec<u8>>,
}

/// A key installed in a session.
///
/// For entitlement licenses, `value` holds the 256-bit entitlement key and
/// `entitled` the content key most recently unwrapped with it.
#[derive(Debug, Clone)]
pub struct Key {
    value: Zeroizing<Vec<u8>>,
    control: KeyControlBlock,
    ctr_mode: bool,
    entitled: Option<EntitledContentKey>,
}

impl Key {
    pub fn new(value: Vec<u8>, control: KeyControlBlock) -> Self {
        Self {
            value: Zeroizing::new(value),
            control,
            ctr_mode: true,
            entitled: None,
        }
    }

    /// The key used for decryption and generic crypto.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        match &self.entitled {
            Some(content) => &content.key,
            None => &self.value,
        }
    }

    /// The wrapping key of an entitlement key.
    #[must_use]
    pub fn entitlement_key(&self) -> &[u8] {
        &self.value
    }

    #[must_use]
    pub fn entitled(&self) -> Option<&EntitledContentKey> {
        self.entitled.as_ref()
    }

    pub fn set_entitled(&mut self, content: EntitledContentKey) {
        self.entitled = Some(content);
    }

    #[must_use]
    pub fn control(&self) -> &KeyControlBlock {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut KeyControlBlock {
        &mut self.control
    }

    #[must_use]
    pub fn ctr_mode(&self) -> bool {
        self.ctr_mode
    }

    pub fn set_ctr_mode(&mut self, ctr_mode: bool) {
        self.ctr_mode = ctr_mode;
    }
}

#[cfg(test)]
pub(crate) fn control_block(tag: &[u8; 4], duration: u32, nonce: u32, control_bits: u32) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..4].copy_from_slice(tag);
    out[4..8].copy_from_slice(&duration.to_be_bytes());
    out[8..12].copy_from_slice(&nonce.to_be_bytes());
    out[12..].copy_from_slice(&control_bits.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(config: &EngineConfig, buffer_type: BufferType, elapsed_secs: u64) -> PolicyContext<'_> {
        PolicyContext {
            config,
            buffer_type,
            elapsed_secs,
        }
    }

    #[test]
    fn parses_big_endian_fields() {
        let block = KeyControlBlock::parse(&control_block(b"kc15", 60, 0xDEADBEEF, bits::ALLOW_DECRYPT))
            .expect("valid block");
        assert_eq!(block.duration(), 60);
        assert_eq!(block.nonce(), 0xDEADBEEF);
        assert!(block.has(bits::ALLOW_DECRYPT));
        assert_eq!(block.to_bytes(), control_block(b"kc15", 60, 0xDEADBEEF, bits::ALLOW_DECRYPT));
    }

    #[test]
    fn rejects_unknown_tags() {
        for tag in [b"kc08", b"kc16", b"xxxx"] {
            assert!(KeyControlBlock::parse(&control_block(tag, 0, 0, 0)).is_err());
        }
        for tag in [b"kctl", b"kc09", b"kc12", b"kc15"] {
            assert!(KeyControlBlock::parse(&control_block(tag, 0, 0, 0)).is_ok());
        }
    }

    #[test]
    fn rejects_bits_newer_than_tag() {
        let patch = 2 << bits::SECURITY_PATCH_LEVEL_SHIFT;
        assert!(KeyControlBlock::parse(&control_block(b"kc10", 0, 0, patch)).is_err());
        let block = KeyControlBlock::parse(&control_block(b"kc11", 0, 0, patch)).expect("kc11");
        assert_eq!(block.minimum_patch_level(), 2);
    }

    #[test]
    fn policy_checks_allow_bits_and_expiry() {
        let config = EngineConfig::default();
        let block = KeyControlBlock::parse(&control_block(b"kc15", 2, 0, bits::ALLOW_DECRYPT))
            .expect("valid block");
        let mut no_replay = || Ok(());

        assert!(block
            .check_use(KeyUse::Decrypt, &ctx(&config, BufferType::Clear, 2), &mut no_replay)
            .is_ok());
        assert!(block
            .check_use(KeyUse::Encrypt, &ctx(&config, BufferType::Clear, 0), &mut no_replay)
            .is_err());
        assert!(matches!(
            block.check_use(KeyUse::Decrypt, &ctx(&config, BufferType::Clear, 3), &mut no_replay),
            Err(Error::KeyExpired)
        ));
    }

    #[test]
    fn policy_enforces_hdcp_and_secure_path() {
        let config = EngineConfig::default();
        let mut no_replay = || Ok(());

        let hdcp2 = bits::HDCP_REQUIRED | (2 << bits::HDCP_VERSION_SHIFT);
        let block = KeyControlBlock::parse(&control_block(b"kc15", 0, 0, hdcp2)).expect("valid");
        assert!(matches!(
            block.check_use(KeyUse::Cenc, &ctx(&config, BufferType::Secure, 0), &mut no_replay),
            Err(Error::InsufficientHdcp)
        ));

        let local = EngineConfig {
            local_display_only: true,
            ..EngineConfig::default()
        };
        assert!(block
            .check_use(KeyUse::Cenc, &ctx(&local, BufferType::Secure, 0), &mut no_replay)
            .is_ok());

        let secure = KeyControlBlock::parse(&control_block(b"kc15", 0, 0, bits::DATA_PATH_SECURE))
            .expect("valid");
        assert!(matches!(
            secure.check_use(KeyUse::Cenc, &ctx(&config, BufferType::Clear, 0), &mut no_replay),
            Err(Error::DecryptFailed(_))
        ));
        assert!(secure
            .check_use(KeyUse::Cenc, &ctx(&config, BufferType::Secure, 0), &mut no_replay)
            .is_ok());
    }

    #[test]
    fn policy_consults_replay_callback() {
        let config = EngineConfig::default();
        let block = KeyControlBlock::parse(&control_block(b"kc15", 0, 0, bits::NONCE_OR_ENTRY))
            .expect("valid");
        let mut inactive = || Err(Error::LicenseInactive);
        assert!(matches!(
            block.check_use(KeyUse::Cenc, &ctx(&config, BufferType::Secure, 0), &mut inactive),
            Err(Error::LicenseInactive)
        ));
    }

    #[test]
    fn analog_restrictions_reject_clear_buffers() {
        let config = EngineConfig {
            local_display_only: true,
            ..EngineConfig::default()
        };
        let mut no_replay = || Ok(());
        let block = KeyControlBlock::parse(&control_block(b"kc15", 0, 0, bits::DISABLE_ANALOG_OUTPUT))
            .expect("valid");
        assert!(matches!(
            block.check_use(KeyUse::Cenc, &ctx(&config, BufferType::Clear, 0), &mut no_replay),
            Err(Error::AnalogOutput)
        ));
        assert!(block
            .check_use(KeyUse::Cenc, &ctx(&config, BufferType::Secure, 0), &mut no_replay)
            .is_ok());
    }
}
