//! Per-session state: derived keys, loaded licenses, the selected key and the
//! bound usage entry.
//!
//! A [`SessionContext`] is only ever touched through the engine, which holds
//! the session registry lock for the duration of each call.

use std::sync::{Arc, Weak};
use std::time::Duration;

use zeroize::{Zeroize, Zeroizing};

use crate::cenc::{
    decrypt_cbc, decrypt_ctr, decrypt_ctr_pattern, BufferType, CencSample, CipherMode, DecryptHash,
};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::crypto::{
    aes128_cbc_decrypt, aes128_cbc_encrypt, aes256_cbc_decrypt, derive_keys, hmac_sha256,
    random_bytes, verify_hmac_sha256, DerivedKeys, AES_BLOCK_SIZE, MAC_KEY_SIZE,
    SHA256_DIGEST_LENGTH,
};
use crate::error::{Error, Result};
use crate::key::{bits, Key, KeyControlBlock, KeyUse, PolicyContext, ReplayControl, KEY_CONTROL_SIZE};
use crate::key_table::{LicenseType, SessionKeyTable};
use crate::message::{EntitledContentKeyObject, KeyObject, KeyRefreshObject, LoadKeysRequest, Message};
use crate::nonce::NonceTable;
use crate::rsa_key::{
    strip_key_padding, RewrapRequest, RsaKey, SessionRsaKey, SignatureScheme, WrappedRsaKey,
    SIGN_RSASSA_PSS,
};
use crate::usage::{LoadStatus, UsageTable, UsageTableEntry};

/// Magic prefix of SRM restriction data in a license.
const SRM_MAGIC: &[u8; 8] = b"HDCPDATA";

/// Algorithms accepted by the generic crypto operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericAlgorithm {
    /// AES-128-CBC over block-aligned input (encrypt and decrypt).
    AesCbc128NoPadding,
    /// HMAC-SHA256 (sign and verify).
    HmacSha256,
}

/// Outcome of the SRM check of the most recent license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SrmStatus {
    /// No license carried SRM restriction data.
    #[default]
    NoVersion,
    Valid,
    /// The platform SRM is older than required or a revoked device is attached.
    Invalid,
}

/// Replay state of the session, used when installing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UsageBinding {
    NoEntry,
    /// Entry created in this session; the license is new.
    New,
    /// Entry restored from storage; the license was loaded before.
    Loaded,
}

/// One open session.
#[derive(Debug)]
pub struct SessionContext {
    id: u32,
    clock: Arc<dyn Clock>,
    nonces: NonceTable,
    keys: Option<SessionKeyTable>,
    derived: DerivedKeys,
    timer_start: Option<Duration>,
    srm_status: SrmStatus,
    current_key_id: Option<Vec<u8>>,
    usage_entry: Option<UsageTableEntry>,
    usage_entry_loaded: bool,
    rsa_key: Option<SessionRsaKey>,
    decrypt_hash: DecryptHash,
}

impl SessionContext {
    pub fn new(id: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            id,
            clock,
            nonces: NonceTable::new(),
            keys: None,
            derived: DerivedKeys::default(),
            timer_start: None,
            srm_status: SrmStatus::NoVersion,
            current_key_id: None,
            usage_entry: None,
            usage_entry_loaded: false,
            rsa_key: None,
            decrypt_hash: DecryptHash::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn keys(&self) -> Option<&SessionKeyTable> {
        self.keys.as_ref()
    }

    #[must_use]
    pub fn srm_status(&self) -> SrmStatus {
        self.srm_status
    }

    #[must_use]
    pub fn usage_entry(&self) -> Option<&UsageTableEntry> {
        self.usage_entry.as_ref()
    }

    pub fn add_nonce(&mut self, nonce: u32) {
        self.nonces.add(nonce);
    }

    #[must_use]
    pub fn has_nonce(&self, nonce: u32) -> bool {
        self.nonces.contains(nonce)
    }

    fn start_timer(&mut self) {
        self.timer_start = Some(self.clock.monotonic());
    }

    /// Seconds since the last successful license load or renewal.
    #[must_use]
    pub fn elapsed_secs(&self) -> u64 {
        self.timer_start
            .map(|start| self.clock.monotonic().saturating_sub(start).as_secs())
            .unwrap_or(0)
    }

    fn usage_binding(&self) -> UsageBinding {
        match (&self.usage_entry, self.usage_entry_loaded) {
            (None, _) => UsageBinding::NoEntry,
            (Some(_), false) => UsageBinding::New,
            (Some(_), true) => UsageBinding::Loaded,
        }
    }

    /// Replace the session keys with ones derived from `master_key`.
    pub fn derive_keys(&mut self, master_key: &[u8], mac_context: &[u8], enc_context: &[u8]) -> Result<()> {
        self.derived = derive_keys(master_key, mac_context, enc_context)?;
        Ok(())
    }

    /// Derive session keys from a session key RSA-OAEP encrypted to this
    /// session's RSA key.
    pub fn rsa_derive_keys(
        &mut self,
        enc_session_key: &[u8],
        mac_context: &[u8],
        enc_context: &[u8],
    ) -> Result<()> {
        let rsa_key = self
            .rsa_key
            .as_ref()
            .and_then(SessionRsaKey::get)
            .ok_or_else(|| Error::UnknownFailure("no RSA key loaded in session".to_string()))?;
        if rsa_key.allowed_schemes() != SIGN_RSASSA_PSS {
            return Err(Error::InvalidRsaKey(format!(
                "key with schemes {:#x} cannot derive session keys",
                rsa_key.allowed_schemes()
            )));
        }
        if enc_session_key.len() != rsa_key.modulus_size() {
            return Err(Error::UnknownFailure(format!(
                "encrypted session key is {} bytes, modulus is {}",
                enc_session_key.len(),
                rsa_key.modulus_size()
            )));
        }
        let session_key = rsa_key
            .decrypt_oaep(enc_session_key)
            .map_err(|e| Error::UnknownFailure(format!("session key decrypt: {}", e)))?;
        if session_key.len() != AES_BLOCK_SIZE {
            return Err(Error::UnknownFailure(format!(
                "session key is {} bytes",
                session_key.len()
            )));
        }
        self.derive_keys(&session_key, mac_context, enc_context)
    }

    /// HMAC-SHA256 of `message` with the client mac key.
    pub fn generate_signature(&self, message: &[u8], out: &mut [u8]) -> Result<usize> {
        if out.len() < SHA256_DIGEST_LENGTH {
            return Err(Error::ShortBuffer {
                required: SHA256_DIGEST_LENGTH,
            });
        }
        if message.is_empty() {
            return Err(Error::context("nothing to sign"));
        }
        if self.derived.mac_key_client.len() != MAC_KEY_SIZE {
            return Err(Error::UnknownFailure("no client mac key".to_string()));
        }
        let signature = hmac_sha256(&self.derived.mac_key_client, message)?;
        out[..SHA256_DIGEST_LENGTH].copy_from_slice(&signature);
        Ok(SHA256_DIGEST_LENGTH)
    }

    fn validate_message(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != SHA256_DIGEST_LENGTH {
            return Err(Error::SignatureFailure);
        }
        if self.derived.mac_key_server.len() != MAC_KEY_SIZE {
            error!("Session {} has no server mac key", self.id);
            return Err(Error::SignatureFailure);
        }
        verify_hmac_sha256(&self.derived.mac_key_server, message, signature)
            .map_err(|_| Error::SignatureFailure)
    }

    fn check_srm(data: &[u8], config: &EngineConfig, srm_version: Option<u16>) -> Result<SrmStatus> {
        if data.len() < SRM_MAGIC.len() + 4 || &data[..SRM_MAGIC.len()] != SRM_MAGIC {
            return Err(Error::context("bad SRM restriction data"));
        }
        let minimum = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        match srm_version {
            Some(current) if u32::from(current) >= minimum && !config.revoked_device_attached => {
                Ok(SrmStatus::Valid)
            }
            current => {
                warn!(
                    "SRM check failed: current {:?}, minimum {}, revoked device {}",
                    current, minimum, config.revoked_device_attached
                );
                Ok(SrmStatus::Invalid)
            }
        }
    }

    fn check_nonce(&mut self, nonce: u32) -> Result<()> {
        if self.nonces.check(nonce) {
            Ok(())
        } else {
            warn!("Session {}: nonce {:08x} not outstanding", self.id, nonce);
            Err(Error::InvalidNonce)
        }
    }

    fn check_nonce_or_entry(&mut self, control: &KeyControlBlock) -> Result<()> {
        match control.replay_control() {
            ReplayControl::NonceRequired => {
                self.check_nonce(control.nonce())?;
                if self.usage_binding() != UsageBinding::NoEntry {
                    return Err(Error::context("online license loaded with a usage entry"));
                }
                Ok(())
            }
            ReplayControl::NonceOrEntry => match self.usage_binding() {
                UsageBinding::NoEntry => Err(Error::context("offline license needs a usage entry")),
                UsageBinding::Loaded => Ok(()),
                UsageBinding::New => self.check_nonce(control.nonce()),
            },
            ReplayControl::None if control.has(bits::NONCE_ENABLED) => self.check_nonce(control.nonce()),
            ReplayControl::None => Ok(()),
        }
    }

    fn unwrap_key(
        &mut self,
        config: &EngineConfig,
        message: &Message<'_>,
        object: &KeyObject,
        srm_status: SrmStatus,
    ) -> Result<(Vec<u8>, Key)> {
        let key_id = message.field(object.key_id)?;
        let value = Zeroizing::new(
            aes128_cbc_decrypt(
                &self.derived.encryption_key,
                message.field(object.key_data_iv)?,
                message.field(object.key_data)?,
            )
            .map_err(|e| Error::UnknownFailure(format!("key data: {}", e)))?,
        );
        let control_key = value
            .get(..AES_BLOCK_SIZE)
            .ok_or_else(|| Error::UnknownFailure(format!("content key is {} bytes", value.len())))?;
        let control_bytes = aes128_cbc_decrypt(
            control_key,
            message.field(object.key_control_iv)?,
            message.field(object.key_control)?,
        )
        .map_err(|e| Error::UnknownFailure(format!("key control: {}", e)))?;
        let mut control = KeyControlBlock::parse(&control_bytes)?;

        if control.has(bits::REQUIRE_ANTI_ROLLBACK_HARDWARE) && !config.anti_rollback_hardware {
            return Err(Error::UnknownFailure(
                "key requires anti-rollback hardware".to_string(),
            ));
        }
        if control.minimum_patch_level() > config.security_patch_level {
            return Err(Error::UnknownFailure(format!(
                "key requires security patch level {}, platform has {}",
                control.minimum_patch_level(),
                config.security_patch_level
            )));
        }
        self.check_nonce_or_entry(&control)?;
        if control.has(bits::SRM_VERSION_REQUIRED) {
            match srm_status {
                SrmStatus::NoVersion => {
                    return Err(Error::context("key requires SRM data the license lacks"))
                }
                SrmStatus::Invalid => control.require_local_display(),
                SrmStatus::Valid => {}
            }
        }
        Ok((key_id.to_vec(), Key::new(value.to_vec(), control)))
    }

    /// Install the keys of a signed license.
    ///
    /// Nothing is committed unless every key unwraps and passes its checks.
    /// Outstanding nonces matched by this call are retired either way.
    pub fn load_keys(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        srm_version: Option<u16>,
        message: &Message<'_>,
        signature: &[u8],
        request: &LoadKeysRequest<'_>,
    ) -> Result<()> {
        self.validate_message(message.bytes(), signature)?;
        if let Some(table) = &self.keys {
            if table.license_type() != request.license_type {
                return Err(Error::context(format!(
                    "session holds {:?} keys, license is {:?}",
                    table.license_type(),
                    request.license_type
                )));
            }
        }

        let staged = self.stage_license(config, usage, srm_version, message, request);
        self.nonces.flush();
        let (keys, srm_status, mac_keys, entry) = staged?;

        let table = self
            .keys
            .get_or_insert_with(|| SessionKeyTable::new(request.license_type));
        let count = keys.len();
        for (key_id, key) in keys {
            table.insert(key_id, key)?;
        }
        self.start_timer();
        self.srm_status = srm_status;
        if let Some((server, client)) = mac_keys {
            self.derived.mac_key_server = server.to_vec();
            self.derived.mac_key_client = client.to_vec();
        }
        if entry.is_some() {
            self.usage_entry = entry;
        }
        self.derived.encryption_key.zeroize();
        self.derived.encryption_key.clear();
        debug!("Session {}: loaded {} keys", self.id, count);
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn stage_license(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        srm_version: Option<u16>,
        message: &Message<'_>,
        request: &LoadKeysRequest<'_>,
    ) -> Result<(
        Vec<(Vec<u8>, Key)>,
        SrmStatus,
        Option<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>)>,
        Option<UsageTableEntry>,
    )> {
        let srm_data = message.optional_field(request.srm_restriction_data)?;
        let srm_status = if srm_data.is_empty() {
            self.srm_status
        } else {
            Self::check_srm(srm_data, config, srm_version)?
        };

        let mut keys: Vec<(Vec<u8>, Key)> = Vec::with_capacity(request.keys.len());
        for object in request.keys {
            let (key_id, key) = self.unwrap_key(config, message, object, srm_status)?;
            let loaded = self
                .keys
                .as_ref()
                .is_some_and(|table| table.find_by_license_id(&key_id).is_some());
            if loaded || keys.iter().any(|(id, _)| *id == key_id) {
                return Err(Error::context(format!(
                    "duplicate key id {}",
                    hex::encode(&key_id)
                )));
            }
            keys.push((key_id, key));
        }

        let mac_keys = if request.enc_mac_keys.is_empty() {
            None
        } else {
            let plain = Zeroizing::new(
                aes128_cbc_decrypt(
                    &self.derived.encryption_key,
                    message.field(request.enc_mac_keys_iv)?,
                    message.field(request.enc_mac_keys)?,
                )
                .map_err(|e| Error::UnknownFailure(format!("mac keys: {}", e)))?,
            );
            if plain.len() != 2 * MAC_KEY_SIZE {
                return Err(Error::UnknownFailure(format!(
                    "mac keys are {} bytes",
                    plain.len()
                )));
            }
            Some((
                Zeroizing::new(plain[..MAC_KEY_SIZE].to_vec()),
                Zeroizing::new(plain[MAC_KEY_SIZE..].to_vec()),
            ))
        };

        let pst = message.optional_field(request.pst)?;
        let (server, client) = match &mac_keys {
            Some((server, client)) => (server.as_slice(), client.as_slice()),
            None => (
                self.derived.mac_key_server.as_slice(),
                self.derived.mac_key_client.as_slice(),
            ),
        };
        let entry = match (self.usage_binding(), &self.usage_entry) {
            (UsageBinding::NoEntry, _) | (_, None) => {
                if !pst.is_empty() {
                    return Err(Error::context("license has a PST but no usage entry is bound"));
                }
                None
            }
            (UsageBinding::Loaded, Some(bound)) => {
                if !bound.verify_pst(pst) {
                    return Err(Error::WrongPst);
                }
                if !bound.verify_mac_keys(server, client) {
                    return Err(Error::WrongKeys);
                }
                if bound.is_inactive() {
                    return Err(Error::LicenseInactive);
                }
                Some(bound.clone())
            }
            (UsageBinding::New, Some(bound)) => {
                let mut entry = bound.clone();
                entry.set_pst(pst, usage.now())?;
                entry
                    .set_mac_keys(server, client)
                    .map_err(|e| Error::UnknownFailure(e.to_string()))?;
                Some(entry)
            }
        };

        Ok((keys, srm_status, mac_keys, entry))
    }

    /// Unwrap content keys with the session's entitlement keys.
    pub fn load_entitled_content_keys(
        &mut self,
        message: &Message<'_>,
        objects: &[EntitledContentKeyObject],
    ) -> Result<()> {
        if objects.is_empty() {
            return Ok(());
        }
        for object in objects {
            object.validate(message)?;
        }
        let table = self
            .keys
            .as_mut()
            .filter(|table| table.license_type() == LicenseType::Entitlement)
            .ok_or_else(|| Error::context("session holds no entitlement keys"))?;
        for object in objects {
            let entitlement_id = message.field(object.entitlement_key_id)?;
            let entitlement_key = table
                .find_by_license_id(entitlement_id)
                .ok_or(Error::KeyNotEntitled)?
                .entitlement_key();
            let content_key = aes256_cbc_decrypt(
                entitlement_key,
                message.field(object.content_key_data_iv)?,
                message.field(object.content_key_data)?,
            )
            .map_err(|e| Error::UnknownFailure(format!("entitled key: {}", e)))?;
            table.set_content_key(
                entitlement_id,
                message.field(object.content_key_id)?,
                content_key,
            )?;
        }
        Ok(())
    }

    /// Apply a signed license renewal and restart the session timer.
    pub fn refresh_keys(
        &mut self,
        message: &Message<'_>,
        signature: &[u8],
        objects: &[KeyRefreshObject],
    ) -> Result<()> {
        if objects.is_empty() {
            return Err(Error::context("no keys to refresh"));
        }
        for object in objects {
            object.validate(message)?;
        }
        self.validate_message(message.bytes(), signature)?;

        let result = objects
            .iter()
            .try_for_each(|object| self.refresh_key(message, object));
        self.nonces.flush();
        result?;
        self.start_timer();
        debug!("Session {}: refreshed {} keys", self.id, objects.len());
        Ok(())
    }

    fn refresh_key(&mut self, message: &Message<'_>, object: &KeyRefreshObject) -> Result<()> {
        let table = self
            .keys
            .as_mut()
            .ok_or_else(|| Error::context("no keys loaded"))?;
        let key_id = message.optional_field(object.key_id)?;
        let control_bytes = message.field(object.key_control)?;

        if key_id.is_empty() {
            let control = KeyControlBlock::parse(control_bytes)?;
            if control.has(bits::NONCE_ENABLED) && !self.nonces.check(control.nonce()) {
                return Err(Error::InvalidNonce);
            }
            table.update_duration(control.duration());
            return Ok(());
        }

        let key = table.find_mut(key_id).ok_or(Error::NoContentKey)?;
        let iv = message.optional_field(object.key_control_iv)?;
        let control = if iv.is_empty() {
            KeyControlBlock::parse(control_bytes)?
        } else {
            let control_key = key.value().get(..AES_BLOCK_SIZE).ok_or_else(|| {
                Error::UnknownFailure(format!("content key is {} bytes", key.value().len()))
            })?;
            let plain = aes128_cbc_decrypt(control_key, iv, control_bytes)
                .map_err(|e| Error::UnknownFailure(format!("key control: {}", e)))?;
            KeyControlBlock::parse(&plain)?
        };
        if control.has(bits::NONCE_ENABLED) && !self.nonces.check(control.nonce()) {
            return Err(Error::InvalidNonce);
        }
        key.control_mut().refresh_from(&control);
        Ok(())
    }

    /// Make `key_id` the key for subsequent decrypt and generic crypto calls.
    pub fn select_key(&mut self, key_id: &[u8], mode: CipherMode) -> Result<()> {
        let elapsed = self.elapsed_secs();
        let key = self
            .keys
            .as_mut()
            .ok_or_else(|| Error::context("no keys loaded"))?
            .find_mut(key_id)
            .ok_or(Error::NoContentKey)?;
        key.set_ctr_mode(mode == CipherMode::Ctr);
        let duration = key.control().duration();
        self.current_key_id = Some(key_id.to_vec());
        trace!("Session {}: selected key {} ({:?})", self.id, hex::encode(key_id), mode);
        if duration > 0 && u64::from(duration) < elapsed {
            return Err(Error::KeyExpired);
        }
        Ok(())
    }

    /// Report a key's duration and control bits as a 16-byte block.
    pub fn query_key_control(&self, key_id: &[u8], out: &mut [u8]) -> Result<usize> {
        if out.len() < KEY_CONTROL_SIZE {
            return Err(Error::ShortBuffer {
                required: KEY_CONTROL_SIZE,
            });
        }
        let control = self
            .keys
            .as_ref()
            .and_then(|table| table.find(key_id))
            .ok_or(Error::NoContentKey)?
            .control();
        let block = &mut out[..KEY_CONTROL_SIZE];
        block.fill(0);
        block[4..8].copy_from_slice(&control.duration().to_be_bytes());
        block[12..].copy_from_slice(&control.control_bits().to_be_bytes());
        Ok(KEY_CONTROL_SIZE)
    }

    fn current_key(&self) -> Option<&Key> {
        let key_id = self.current_key_id.as_deref()?;
        self.keys.as_ref()?.find(key_id)
    }

    /// Enforce the selected key's policy for one use.
    fn check_key_use(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        use_: KeyUse,
        buffer_type: BufferType,
    ) -> Result<()> {
        let ctx = PolicyContext {
            config,
            buffer_type,
            elapsed_secs: self.elapsed_secs(),
        };
        let key = self
            .current_key_id
            .as_deref()
            .and_then(|id| self.keys.as_ref()?.find(id))
            .ok_or(Error::NoContentKey)?;
        let usage_entry = &mut self.usage_entry;
        let mut check_replay = || match usage_entry.as_mut() {
            Some(entry) => entry.check_for_use(usage),
            None => Err(Error::UnknownFailure(
                "key requires a usage entry".to_string(),
            )),
        };
        let result = key.control().check_use(use_, &ctx, &mut check_replay);
        if let Err(e) = &result {
            warn!("Session {}: key use {:?} refused: {}", self.id, use_, e);
        }
        result
    }

    /// Decrypt one subsample into `output`, which is `None` for direct
    /// destinations and otherwise exactly as long as the sample data.
    pub fn decrypt_cenc(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        sample: &CencSample<'_>,
        buffer_type: BufferType,
        mut output: Option<&mut [u8]>,
    ) -> Result<()> {
        let result = self.choose_decrypt(config, usage, sample, buffer_type, output.as_deref_mut());
        if self.decrypt_hash.is_computing() {
            let allowed = self
                .current_key()
                .map(|key| key.control().has(bits::ALLOW_HASH_VERIFICATION))
                .unwrap_or(false);
            let decrypted = output.as_deref().unwrap_or(&[]);
            self.decrypt_hash
                .update(allowed, decrypted, sample.subsample_flags);
        }
        result
    }

    fn choose_decrypt(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        sample: &CencSample<'_>,
        buffer_type: BufferType,
        output: Option<&mut [u8]>,
    ) -> Result<()> {
        if !sample.is_encrypted {
            if let Some(out) = output {
                out.copy_from_slice(sample.data);
            }
            return Ok(());
        }

        self.check_key_use(config, usage, KeyUse::Cenc, buffer_type)?;
        let key = self.current_key().ok_or(Error::NoContentKey)?;
        if key.value().len() != AES_BLOCK_SIZE {
            return Err(Error::DecryptFailed(format!(
                "content key is {} bytes",
                key.value().len()
            )));
        }
        let Some(out) = output else {
            return Ok(());
        };
        out.copy_from_slice(sample.data);

        if !key.ctr_mode() {
            if sample.block_offset > 0 {
                return Err(Error::context("CBC sample with a block offset"));
            }
            return decrypt_cbc(key.value(), &sample.iv, sample.pattern, out);
        }
        if sample.pattern.skip > 0 {
            decrypt_ctr_pattern(key.value(), &sample.iv, sample.block_offset, sample.pattern, out)
        } else {
            decrypt_ctr(key.value(), &sample.iv, sample.block_offset, out)
        }
    }

    fn selected_key_for(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        use_: KeyUse,
        algorithm: GenericAlgorithm,
        expected: GenericAlgorithm,
        key_size: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if self.current_key().is_none() {
            return Err(Error::NoContentKey);
        }
        self.check_key_use(config, usage, use_, BufferType::Clear)?;
        if algorithm != expected {
            return Err(Error::context(format!(
                "{:?} does not support {:?}",
                use_, algorithm
            )));
        }
        let key = self.current_key().ok_or(Error::NoContentKey)?;
        if key.value().len() != key_size {
            return Err(Error::UnknownFailure(format!(
                "{:?} needs a {} byte key, selected key is {}",
                use_,
                key_size,
                key.value().len()
            )));
        }
        Ok(Zeroizing::new(key.value().to_vec()))
    }

    #[allow(clippy::too_many_arguments)]
    fn generic_cipher(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        use_: KeyUse,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> Result<usize> {
        if out.len() < input.len() {
            return Err(Error::ShortBuffer {
                required: input.len(),
            });
        }
        let key = self.selected_key_for(
            config,
            usage,
            use_,
            algorithm,
            GenericAlgorithm::AesCbc128NoPadding,
            AES_BLOCK_SIZE,
        )?;
        if input.is_empty() || input.len() % AES_BLOCK_SIZE != 0 {
            return Err(Error::context(format!(
                "generic input of {} bytes is not block aligned",
                input.len()
            )));
        }
        if iv.len() != AES_BLOCK_SIZE {
            return Err(Error::context("generic IV must be 16 bytes"));
        }
        let result = if use_ == KeyUse::Encrypt {
            aes128_cbc_encrypt(&key, iv, input)?
        } else {
            aes128_cbc_decrypt(&key, iv, input)?
        };
        out[..result.len()].copy_from_slice(&result);
        Ok(result.len())
    }

    /// AES-128-CBC encrypt with the selected key.
    pub fn generic_encrypt(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> Result<usize> {
        self.generic_cipher(config, usage, KeyUse::Encrypt, input, iv, algorithm, out)
    }

    /// AES-128-CBC decrypt with the selected key.
    pub fn generic_decrypt(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> Result<usize> {
        self.generic_cipher(config, usage, KeyUse::Decrypt, input, iv, algorithm, out)
    }

    /// HMAC-SHA256 with the selected key.
    pub fn generic_sign(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        input: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> Result<usize> {
        if out.len() < SHA256_DIGEST_LENGTH {
            return Err(Error::ShortBuffer {
                required: SHA256_DIGEST_LENGTH,
            });
        }
        let key = self.selected_key_for(
            config,
            usage,
            KeyUse::Sign,
            algorithm,
            GenericAlgorithm::HmacSha256,
            MAC_KEY_SIZE,
        )?;
        let signature = hmac_sha256(&key, input)?;
        out[..SHA256_DIGEST_LENGTH].copy_from_slice(&signature);
        Ok(SHA256_DIGEST_LENGTH)
    }

    /// Check an HMAC-SHA256 signature with the selected key.
    pub fn generic_verify(
        &mut self,
        config: &EngineConfig,
        usage: &mut UsageTable,
        input: &[u8],
        algorithm: GenericAlgorithm,
        signature: &[u8],
    ) -> Result<()> {
        if signature.len() != SHA256_DIGEST_LENGTH {
            return Err(Error::context(format!(
                "signature is {} bytes",
                signature.len()
            )));
        }
        let key = self.selected_key_for(
            config,
            usage,
            KeyUse::Verify,
            algorithm,
            GenericAlgorithm::HmacSha256,
            MAC_KEY_SIZE,
        )?;
        verify_hmac_sha256(&key, input, signature)
    }

    /// Give the session a view of the device certificate key.
    pub fn use_device_rsa_key(&mut self, key: Weak<RsaKey>) {
        self.rsa_key = Some(SessionRsaKey::Shared(key));
    }

    /// Unwrap a device RSA key produced by
    /// [`rewrap_device_rsa_key`](Self::rewrap_device_rsa_key).
    pub fn load_wrapped_rsa_key(&mut self, device_key: &[u8], wrapped: &[u8]) -> Result<()> {
        let wrapped = WrappedRsaKey::from_bytes(wrapped)?;
        self.derive_keys(device_key, &wrapped.context, &wrapped.context)?;
        let decrypted = Zeroizing::new(
            aes128_cbc_decrypt(&self.derived.encryption_key, &wrapped.iv, &wrapped.enc_rsa_key)
                .map_err(|e| Error::InvalidRsaKey(e.to_string()))?,
        );
        let pkcs8 = strip_key_padding(&decrypted)?;
        verify_hmac_sha256(
            &self.derived.mac_key_server,
            &wrapped.signed_bytes(),
            &wrapped.signature,
        )
        .map_err(|_| Error::SignatureFailure)?;
        let key = RsaKey::from_pkcs8(pkcs8).map_err(|e| Error::InvalidRsaKey(e.to_string()))?;
        debug!("Session {}: loaded {}-byte RSA key", self.id, key.modulus_size());
        self.rsa_key = Some(SessionRsaKey::Owned(Arc::new(key)));
        Ok(())
    }

    /// Decrypt a provisioned RSA key and wrap it under the device key.
    ///
    /// `out` must hold [`WrappedRsaKey::wrapped_size`] of the encrypted key.
    pub fn rewrap_device_rsa_key(
        &mut self,
        device_key: &[u8],
        request: &RewrapRequest<'_>,
        out: &mut [u8],
    ) -> Result<usize> {
        let decrypted = match *request {
            RewrapRequest::Keybox {
                message,
                signature,
                nonce,
                enc_rsa_key,
                enc_rsa_key_iv,
            } => {
                let message = Message::new(message)?;
                let enc = message.field(enc_rsa_key)?;
                let iv = message.field(enc_rsa_key_iv)?;
                let nonce_ok = self.check_nonce(nonce);
                self.nonces.flush();
                nonce_ok?;
                let decrypted = Zeroizing::new(
                    aes128_cbc_decrypt(&self.derived.encryption_key, iv, enc)
                        .map_err(|e| Error::InvalidRsaKey(e.to_string()))?,
                );
                strip_key_padding(&decrypted)?;
                self.validate_message(message.bytes(), signature)?;
                decrypted
            }
            RewrapRequest::SessionKey {
                nonce,
                encrypted_message_key,
                enc_rsa_key,
                enc_rsa_key_iv,
            } => {
                let nonce_ok = self.check_nonce(nonce);
                self.nonces.flush();
                nonce_ok?;
                let rsa_key = self
                    .rsa_key
                    .as_ref()
                    .and_then(SessionRsaKey::get)
                    .ok_or_else(|| Error::InvalidRsaKey("no certificate key".to_string()))?;
                let message_key = rsa_key
                    .decrypt_oaep(encrypted_message_key)
                    .map_err(|e| Error::UnknownFailure(format!("message key: {}", e)))?;
                if message_key.len() != AES_BLOCK_SIZE {
                    return Err(Error::UnknownFailure(format!(
                        "message key is {} bytes",
                        message_key.len()
                    )));
                }
                self.derived.encryption_key = message_key.to_vec();
                Zeroizing::new(
                    aes128_cbc_decrypt(&self.derived.encryption_key, enc_rsa_key_iv, enc_rsa_key)
                        .map_err(|e| Error::InvalidRsaKey(e.to_string()))?,
                )
            }
        };

        let required = WrappedRsaKey::wrapped_size(decrypted.len());
        if out.len() < required {
            return Err(Error::ShortBuffer { required });
        }
        let key = RsaKey::from_pkcs8(strip_key_padding(&decrypted)?)
            .map_err(|e| Error::InvalidRsaKey(e.to_string()))?;

        let mut wrapped = WrappedRsaKey {
            signature: [0u8; 32],
            context: [0u8; 32],
            iv: [0u8; 16],
            enc_rsa_key: Vec::new(),
        };
        random_bytes(&mut wrapped.context);
        random_bytes(&mut wrapped.iv);
        self.derive_keys(device_key, &wrapped.context, &wrapped.context)?;
        wrapped.enc_rsa_key = aes128_cbc_encrypt(&self.derived.encryption_key, &wrapped.iv, &decrypted)?;
        wrapped.signature = hmac_sha256(&self.derived.mac_key_server, &wrapped.signed_bytes())?;

        let bytes = wrapped.to_bytes();
        out[..bytes.len()].copy_from_slice(&bytes);
        self.rsa_key = Some(SessionRsaKey::Owned(Arc::new(key)));
        debug!("Session {}: rewrapped RSA key ({} bytes)", self.id, bytes.len());
        Ok(bytes.len())
    }

    /// Sign with the session's RSA key.
    pub fn generate_rsa_signature(
        &self,
        message: &[u8],
        scheme: SignatureScheme,
        out: &mut [u8],
    ) -> Result<usize> {
        let key = self
            .rsa_key
            .as_ref()
            .and_then(SessionRsaKey::get)
            .ok_or_else(|| Error::InvalidRsaKey("no RSA key loaded".to_string()))?;
        if out.len() < key.modulus_size() {
            return Err(Error::ShortBuffer {
                required: key.modulus_size(),
            });
        }
        if message.is_empty() {
            return Err(Error::context("nothing to sign"));
        }
        let signature = key.sign(message, scheme)?;
        out[..signature.len()].copy_from_slice(&signature);
        Ok(signature.len())
    }

    fn bound_entry(&mut self) -> Result<&mut UsageTableEntry> {
        self.usage_entry
            .as_mut()
            .ok_or_else(|| Error::context("no usage entry bound to session"))
    }

    /// Allocate a fresh usage entry for this session.
    pub fn create_usage_entry(&mut self, usage: &mut UsageTable) -> Result<u32> {
        if self.usage_entry.is_some() {
            return Err(Error::context("session already has a usage entry"));
        }
        let entry = usage.create_new_entry(self.id)?;
        let index = entry.index();
        self.usage_entry = Some(entry);
        self.usage_entry_loaded = false;
        Ok(index)
    }

    /// Restore a saved usage entry. The session adopts the entry's mac keys.
    pub fn load_usage_entry(
        &mut self,
        usage: &mut UsageTable,
        index: u32,
        storage_key: &[u8],
        data: &[u8],
    ) -> Result<LoadStatus> {
        if self.usage_entry.is_some() {
            return Err(Error::context("session already has a usage entry"));
        }
        let (entry, status) = usage.load_entry(self.id, index, storage_key, data)?;
        self.derived.mac_key_server = entry.mac_key_server().to_vec();
        self.derived.mac_key_client = entry.mac_key_client().to_vec();
        self.usage_entry = Some(entry);
        self.usage_entry_loaded = true;
        Ok(status)
    }

    pub fn update_usage_entry(
        &mut self,
        usage: &mut UsageTable,
        storage_key: &[u8],
        header_out: &mut [u8],
        entry_out: &mut [u8],
    ) -> Result<(usize, usize)> {
        let entry = self.bound_entry()?;
        usage.update_entry(entry, storage_key, header_out, entry_out)
    }

    pub fn deactivate_usage_entry(&mut self, usage: &mut UsageTable) -> Result<()> {
        self.bound_entry()?.deactivate(usage);
        Ok(())
    }

    pub fn report_usage(&mut self, usage: &mut UsageTable, pst: &[u8], out: &mut [u8]) -> Result<usize> {
        self.bound_entry()?.report_usage(usage, pst, out)
    }

    pub fn move_usage_entry(&mut self, usage: &mut UsageTable, new_index: u32) -> Result<()> {
        let entry = self.bound_entry()?;
        usage.move_entry(entry, new_index)
    }

    pub fn copy_old_usage_entry(&mut self, usage: &UsageTable, pst: &[u8]) -> Result<()> {
        self.bound_entry()?.copy_old_usage_entry(usage, pst)
    }

    /// Unbind the usage entry slot; called when the session closes.
    pub fn release_usage_entry(&mut self, usage: &mut UsageTable) {
        if let Some(entry) = self.usage_entry.take() {
            usage.release_entry(entry.index());
        }
    }

    pub fn set_decrypt_hash(&mut self, frame_number: u32, hash: &[u8]) -> Result<()> {
        self.decrypt_hash.set_expected(frame_number, hash)
    }

    pub fn hash_error_code(&self) -> Result<()> {
        self.decrypt_hash.error_code()
    }
}


#[cfg(test)]
mod tests {
    use super::test_license::{build, TestKey};
    use super::*;
    use crate::cenc::{Pattern, FIRST_SUBSAMPLE, LAST_SUBSAMPLE};
    use crate::clock::ManualClock;
    use crate::key::control_block;
    use crate::message::Span;

    const DEVICE_KEY: [u8; 16] = [0x11; 16];
    const CONTENT_KEY: [u8; 16] = [0x3C; 16];

    fn session(clock: &ManualClock) -> (SessionContext, UsageTable) {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let mut session = SessionContext::new(1, Arc::clone(&clock));
        session
            .derive_keys(&DEVICE_KEY, b"mac context", b"enc context")
            .expect("derive");
        (session, UsageTable::new(clock, 0))
    }

    fn load(
        session: &mut SessionContext,
        usage: &mut UsageTable,
        config: &EngineConfig,
        keys: &[TestKey<'_>],
    ) -> Result<()> {
        let license = build(&session.derived.encryption_key, keys, b"", b"", None);
        let signature = license.sign(&session.derived.mac_key_server);
        let message = Message::new(&license.message)?;
        session.load_keys(
            config,
            usage,
            None,
            &message,
            &signature,
            &license.request(LicenseType::Content),
        )
    }

    fn content_key(id: &[u8], duration: u32, nonce: u32, control_bits: u32) -> TestKey<'_> {
        TestKey {
            id,
            value: CONTENT_KEY.to_vec(),
            control: control_block(b"kc15", duration, nonce, control_bits),
        }
    }

    #[test]
    fn load_keys_rejects_bad_signature() {
        let clock = ManualClock::new(1_000);
        let (mut session, mut usage) = session(&clock);
        let license = build(
            &session.derived.encryption_key,
            &[content_key(b"k1", 0, 0, bits::ALLOW_DECRYPT)],
            b"",
            b"",
            None,
        );
        let mut signature = license.sign(&session.derived.mac_key_server);
        signature[0] ^= 1;
        let message = Message::new(&license.message).expect("message");
        assert!(matches!(
            session.load_keys(
                &EngineConfig::default(),
                &mut usage,
                None,
                &message,
                &signature,
                &license.request(LicenseType::Content),
            ),
            Err(Error::SignatureFailure)
        ));
        assert!(session.keys().is_none());
    }

    #[test]
    fn failed_key_installs_nothing() {
        let clock = ManualClock::new(1_000);
        let (mut session, mut usage) = session(&clock);
        let keys = [
            content_key(b"good", 0, 0, bits::ALLOW_DECRYPT),
            content_key(b"bad", 0, 0x1234, bits::NONCE_ENABLED),
        ];
        assert!(matches!(
            load(&mut session, &mut usage, &EngineConfig::default(), &keys),
            Err(Error::InvalidNonce)
        ));
        assert!(session.keys().is_none());
        assert!(matches!(
            session.select_key(b"good", CipherMode::Ctr),
            Err(Error::InvalidContext(_))
        ));
    }

    #[test]
    fn duplicate_key_ids_are_rejected() {
        let clock = ManualClock::new(1_000);
        let (mut session, mut usage) = session(&clock);
        let config = EngineConfig::default();
        let twice = [
            content_key(b"k1", 0, 0, bits::ALLOW_DECRYPT),
            content_key(b"k1", 0, 0, bits::ALLOW_DECRYPT),
        ];
        assert!(matches!(
            load(&mut session, &mut usage, &config, &twice),
            Err(Error::InvalidContext(_))
        ));
        assert!(session.keys().is_none());

        load(&mut session, &mut usage, &config, &twice[..1]).expect("first load");
        session
            .derive_keys(&DEVICE_KEY, b"mac context", b"enc context")
            .expect("derive");
        let again = [
            content_key(b"k2", 0, 0, bits::ALLOW_DECRYPT),
            content_key(b"k1", 0, 0, bits::ALLOW_DECRYPT),
        ];
        assert!(matches!(
            load(&mut session, &mut usage, &config, &again),
            Err(Error::InvalidContext(_))
        ));
        let table = session.keys().expect("table");
        assert!(table.find_by_license_id(b"k1").is_some());
        assert!(table.find_by_license_id(b"k2").is_none());
    }

    #[test]
    fn nonce_is_retired_after_load() {
        let clock = ManualClock::new(1_000);
        let (mut session, mut usage) = session(&clock);
        session.add_nonce(0xCAFE);
        let keys = [content_key(b"k1", 0, 0xCAFE, bits::NONCE_REQUIRED)];
        load(&mut session, &mut usage, &EngineConfig::default(), &keys).expect("first load");
        assert!(!session.has_nonce(0xCAFE));

        session
            .derive_keys(&DEVICE_KEY, b"mac context", b"enc context")
            .expect("derive");
        assert!(matches!(
            load(&mut session, &mut usage, &EngineConfig::default(), &keys),
            Err(Error::InvalidNonce)
        ));
    }

    #[test]
    fn entitlement_license_rejects_content_load() {
        let clock = ManualClock::new(1_000);
        let (mut session, mut usage) = session(&clock);
        let entitlement = TestKey {
            id: b"ent",
            value: vec![0x77; 32],
            control: control_block(b"kc15", 0, 0, bits::ALLOW_DECRYPT),
        };
        let license = build(&session.derived.encryption_key, &[entitlement], b"", b"", None);
        let signature = license.sign(&session.derived.mac_key_server);
        let message = Message::new(&license.message).expect("message");
        let config = EngineConfig::default();
        session
            .load_keys(
                &config,
                &mut usage,
                None,
                &message,
                &signature,
                &license.request(LicenseType::Entitlement),
            )
            .expect("entitlement load");

        // The encryption key is discarded after a load; derive again.
        session
            .derive_keys(&DEVICE_KEY, b"mac context", b"enc context")
            .expect("derive");
        assert!(matches!(
            load(&mut session, &mut usage, &config, &[content_key(b"k", 0, 0, 0)]),
            Err(Error::InvalidContext(_))
        ));

        let iv = [0x09; 16];
        let mut ent_message = b"ent".to_vec();
        ent_message.extend_from_slice(b"content");
        ent_message.extend_from_slice(&iv);
        let encrypted = aes256_encrypt(&[0x77; 32], &iv, &CONTENT_KEY);
        ent_message.extend_from_slice(&encrypted);
        let message = Message::new(&ent_message).expect("message");
        let object = EntitledContentKeyObject {
            entitlement_key_id: Span::new(0, 3),
            content_key_id: Span::new(3, 7),
            content_key_data_iv: Span::new(10, 16),
            content_key_data: Span::new(26, 16),
        };
        session
            .load_entitled_content_keys(&message, &[object])
            .expect("entitled");
        session.select_key(b"content", CipherMode::Ctr).expect("select");
        assert_eq!(session.current_key().expect("key").value(), &CONTENT_KEY);

        let unknown = EntitledContentKeyObject {
            entitlement_key_id: Span::new(3, 3),
            ..object
        };
        assert!(matches!(
            session.load_entitled_content_keys(&message, &[unknown]),
            Err(Error::KeyNotEntitled)
        ));
    }

    fn aes256_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
        use aes::cipher::block_padding::NoPadding;
        use aes::cipher::{BlockEncryptMut, KeyIvInit};
        let mut buffer = data.to_vec();
        let len = buffer.len();
        cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .expect("key")
            .encrypt_padded_mut::<NoPadding>(&mut buffer, len)
            .expect("encrypt");
        buffer
    }

    #[test]
    fn patch_level_gate() {
        let clock = ManualClock::new(1_000);
        let (mut session, mut usage) = session(&clock);
        let config = EngineConfig {
            security_patch_level: 2,
            ..EngineConfig::default()
        };
        let too_new = [content_key(
            b"k",
            0,
            0,
            bits::ALLOW_DECRYPT | (3 << bits::SECURITY_PATCH_LEVEL_SHIFT),
        )];
        assert!(matches!(
            load(&mut session, &mut usage, &config, &too_new),
            Err(Error::UnknownFailure(_))
        ));
        let current = [content_key(
            b"k",
            0,
            0,
            bits::ALLOW_DECRYPT | (2 << bits::SECURITY_PATCH_LEVEL_SHIFT),
        )];
        load(&mut session, &mut usage, &config, &current).expect("patch level 2");
    }

    #[test]
    fn refresh_all_updates_every_duration() {
        let clock = ManualClock::new(1_000);
        let (mut session, mut usage) = session(&clock);
        let keys = [
            content_key(b"a", 5, 0, bits::ALLOW_DECRYPT),
            content_key(b"b", 5, 0, bits::ALLOW_DECRYPT),
        ];
        load(&mut session, &mut usage, &EngineConfig::default(), &keys).expect("load");

        let renewal = control_block(b"kc15", 100, 0, 0);
        let message_bytes = renewal.to_vec();
        let message = Message::new(&message_bytes).expect("message");
        let signature = hmac_sha256(&session.derived.mac_key_server, &message_bytes).expect("hmac");
        let object = KeyRefreshObject {
            key_id: Span::EMPTY,
            key_control_iv: Span::EMPTY,
            key_control: Span::new(0, 16),
        };
        clock.advance(Duration::from_secs(10));
        assert!(matches!(
            session.select_key(b"a", CipherMode::Ctr),
            Err(Error::KeyExpired)
        ));
        session
            .refresh_keys(&message, &signature, &[object])
            .expect("refresh");
        session.select_key(b"a", CipherMode::Ctr).expect("renewed");

        let mut out = [0u8; 16];
        session.query_key_control(b"b", &mut out).expect("query");
        assert_eq!(&out[4..8], &100u32.to_be_bytes());
        assert_eq!(&out[..4], &[0u8; 4]);
        assert!(matches!(
            session.query_key_control(b"b", &mut out[..8]),
            Err(Error::ShortBuffer { required: 16 })
        ));
    }

    #[test]
    fn decrypt_clear_and_encrypted_samples() {
        let clock = ManualClock::new(1_000);
        let (mut session, mut usage) = session(&clock);
        let config = EngineConfig::default();
        let plain: Vec<u8> = (0..40u8).collect();
        let iv = [7u8; 16];
        let sample = CencSample {
            data: &plain,
            is_encrypted: false,
            iv,
            block_offset: 0,
            pattern: Pattern::default(),
            subsample_flags: FIRST_SUBSAMPLE | LAST_SUBSAMPLE,
        };
        let mut out = vec![0u8; plain.len()];
        session
            .decrypt_cenc(&config, &mut usage, &sample, BufferType::Clear, Some(&mut out))
            .expect("clear copy needs no key");
        assert_eq!(out, plain);

        let encrypted = CencSample {
            is_encrypted: true,
            ..sample
        };
        assert!(matches!(
            session.decrypt_cenc(&config, &mut usage, &encrypted, BufferType::Clear, Some(&mut out)),
            Err(Error::NoContentKey)
        ));

        load(
            &mut session,
            &mut usage,
            &config,
            &[content_key(b"k", 0, 0, bits::ALLOW_DECRYPT)],
        )
        .expect("load");
        let mut cipher = plain.clone();
        decrypt_ctr(&CONTENT_KEY, &iv, 0, &mut cipher).expect("encrypt");
        let encrypted = CencSample {
            data: &cipher,
            ..encrypted
        };
        session.select_key(b"k", CipherMode::Ctr).expect("select");
        session
            .decrypt_cenc(&config, &mut usage, &encrypted, BufferType::Clear, Some(&mut out))
            .expect("decrypt");
        assert_eq!(out, plain);

        session.select_key(b"k", CipherMode::Cbc).expect("select");
        let offset = CencSample {
            block_offset: 3,
            ..encrypted
        };
        assert!(matches!(
            session.decrypt_cenc(&config, &mut usage, &offset, BufferType::Clear, Some(&mut out)),
            Err(Error::InvalidContext(_))
        ));
    }

    #[test]
    fn generic_ops_respect_allow_bits() {
        let clock = ManualClock::new(1_000);
        let (mut session, mut usage) = session(&clock);
        let config = EngineConfig::default();
        let keys = [
            content_key(b"enc", 0, 0, bits::ALLOW_ENCRYPT),
            TestKey {
                id: b"mac",
                value: vec![0x42; 32],
                control: control_block(b"kc15", 0, 0, bits::ALLOW_SIGN | bits::ALLOW_VERIFY),
            },
        ];
        load(&mut session, &mut usage, &config, &keys).expect("load");

        let iv = [0u8; 16];
        let data = [0xAB; 32];
        let mut out = [0u8; 32];
        session.select_key(b"enc", CipherMode::Cbc).expect("select");
        session
            .generic_encrypt(&config, &mut usage, &data, &iv, GenericAlgorithm::AesCbc128NoPadding, &mut out)
            .expect("encrypt");
        assert_eq!(out.to_vec(), aes128_cbc_encrypt(&CONTENT_KEY, &iv, &data).expect("reference"));
        assert!(session
            .generic_decrypt(&config, &mut usage, &out.clone(), &iv, GenericAlgorithm::AesCbc128NoPadding, &mut out)
            .is_err());
        assert!(matches!(
            session.generic_encrypt(&config, &mut usage, &data[..5], &iv, GenericAlgorithm::AesCbc128NoPadding, &mut out),
            Err(Error::InvalidContext(_))
        ));

        session.select_key(b"mac", CipherMode::Cbc).expect("select");
        let mut signature = [0u8; 32];
        session
            .generic_sign(&config, &mut usage, b"payload", GenericAlgorithm::HmacSha256, &mut signature)
            .expect("sign");
        session
            .generic_verify(&config, &mut usage, b"payload", GenericAlgorithm::HmacSha256, &signature)
            .expect("verify");
        assert!(matches!(
            session.generic_verify(&config, &mut usage, b"other", GenericAlgorithm::HmacSha256, &signature),
            Err(Error::SignatureFailure)
        ));
        assert!(matches!(
            session.generic_sign(&config, &mut usage, b"payload", GenericAlgorithm::AesCbc128NoPadding, &mut signature),
            Err(Error::InvalidContext(_))
        ));
    }

    #[test]
    fn srm_restriction_data_is_checked() {
        let config = EngineConfig::default();
        assert!(SessionContext::check_srm(b"HDCPDAT", &config, Some(3)).is_err());
        let mut data = SRM_MAGIC.to_vec();
        data.extend_from_slice(&3u32.to_be_bytes());
        assert_eq!(
            SessionContext::check_srm(&data, &config, Some(3)).expect("srm"),
            SrmStatus::Valid
        );
        assert_eq!(
            SessionContext::check_srm(&data, &config, Some(2)).expect("srm"),
            SrmStatus::Invalid
        );
        assert_eq!(
            SessionContext::check_srm(&data, &config, None).expect("srm"),
            SrmStatus::Invalid
        );
    }
}
