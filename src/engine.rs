//! The content-protection engine.
//!
//! [`Engine`] owns the root of trust, the usage table and the registry of open
//! sessions, and exposes every external operation over integer session
//! handles. Locks are always taken in the order sessions, root, usage.
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cenc::{CencSample, CipherMode, Destination};
use crate::clock::{Clock, OfflineTime, SystemClock};
use crate::config::{EngineConfig, HdcpCapability, ProvisioningMethod, SecurityLevel};
use crate::crypto::{aes128_cbc_decrypt, aes128_cbc_encrypt, random_u32, AES_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::message::{EntitledContentKeyObject, KeyRefreshObject, LoadKeysRequest, Message};
use crate::nonce::NonceLimiter;
use crate::root::AuthenticationRoot;
use crate::rsa_key::{RewrapRequest, SignatureScheme, WrappedRsaKey, BAKED_IN_CERTIFICATE_MAGIC};
use crate::session::{GenericAlgorithm, SessionContext};
use crate::usage::{EntryStatus, LoadStatus, OldEntryTimes, UsageTable};

/// Size of the blob produced by [`Engine::export_time_state`].
pub const TIME_STATE_SIZE: usize = 32;
const TIME_STATE_MAGIC: &[u8; 8] = b"OFFLTIME";

#[derive(Debug, Default)]
struct SessionRegistry {
    sessions: HashMap<u32, SessionContext>,
    next_id: u32,
}

/// Device-side content-protection engine.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    initialized: AtomicBool,
    registry: Mutex<SessionRegistry>,
    root: RwLock<AuthenticationRoot>,
    usage: Mutex<UsageTable>,
    nonce_limiter: Mutex<NonceLimiter>,
    srm_version: Mutex<Option<u16>>,
}

impl Engine {
    /// Create an engine using the host clocks.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: RwLock::new(AuthenticationRoot::new(config.provisioning_method)),
            usage: Mutex::new(UsageTable::new(Arc::clone(&clock), config.max_usage_entries)),
            nonce_limiter: Mutex::new(NonceLimiter::new(config.nonce_flood_count)),
            srm_version: Mutex::new(config.srm_version),
            registry: Mutex::new(SessionRegistry {
                sessions: HashMap::new(),
                next_id: 1,
            }),
            initialized: AtomicBool::new(false),
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn close_all(&self, registry: &mut SessionRegistry) {
        let mut usage = self.usage.lock();
        for (_, mut session) in registry.sessions.drain() {
            session.release_usage_entry(&mut usage);
        }
    }

    /// Start the engine. A second call logs a warning and closes every
    /// session.
    pub fn initialize(&self) -> Result<()> {
        let mut registry = self.registry.lock();
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("Engine initialized twice, resetting sessions");
            self.close_all(&mut registry);
        }
        if let Some(path) = self.keybox_to_restore() {
            if let Err(e) = self.root.write().restore_keybox(path) {
                warn!("Stored keybox {} not usable: {}", path.display(), e);
            }
        }
        info!(
            "Engine initialized: {} {:?}",
            self.config.security_level.as_str(),
            self.config.provisioning_method
        );
        Ok(())
    }

    /// Close every session and drop any test keybox.
    pub fn terminate(&self) -> Result<()> {
        let mut registry = self.registry.lock();
        self.close_all(&mut registry);
        self.root.write().use_production_keybox();
        self.initialized.store(false, Ordering::SeqCst);
        debug!("Engine terminated");
        Ok(())
    }

    /// Open a new session and return its handle.
    ///
    /// Returns an error if the maximum number of sessions has been reached.
    pub fn open_session(&self) -> Result<u32> {
        self.ensure_initialized()?;
        let mut registry = self.registry.lock();
        if registry.sessions.len() >= self.config.max_sessions {
            return Err(Error::TooManySessions {
                max: self.config.max_sessions,
            });
        }

        let id = registry.next_id;
        registry.next_id = registry.next_id.wrapping_add(1).max(1);
        let mut session = SessionContext::new(id, Arc::clone(&self.clock));
        if self.config.provisioning_method == ProvisioningMethod::OemCertificate {
            if let Some(key) = self.root.read().shared_rsa_key() {
                session.use_device_rsa_key(key);
            }
        }
        registry.sessions.insert(id, session);
        debug!("Opened session {} ({} open)", id, registry.sessions.len());
        Ok(id)
    }

    /// Close a session and unbind its usage entry.
    pub fn close_session(&self, session_id: u32) -> Result<()> {
        self.ensure_initialized()?;
        let mut registry = self.registry.lock();
        let mut session = registry
            .sessions
            .remove(&session_id)
            .ok_or(Error::InvalidSession(session_id))?;
        session.release_usage_entry(&mut self.usage.lock());
        debug!("Closed session {}", session_id);
        Ok(())
    }

    #[must_use]
    pub fn number_of_open_sessions(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    fn with_session<T>(
        &self,
        session_id: u32,
        f: impl FnOnce(&mut SessionContext) -> Result<T>,
    ) -> Result<T> {
        self.ensure_initialized()?;
        let mut registry = self.registry.lock();
        let session = registry
            .sessions
            .get_mut(&session_id)
            .ok_or(Error::InvalidSession(session_id))?;
        f(session)
    }

    fn valid_root(&self) -> Result<()> {
        self.root.read().validate().map_err(|e| {
            warn!("Root of trust invalid: {}", e);
            Error::KeyboxInvalid
        })
    }

    fn keybox_to_restore(&self) -> Option<&Path> {
        if self.config.provisioning_method != ProvisioningMethod::Keybox {
            return None;
        }
        self.config
            .keybox_path
            .as_deref()
            .filter(|path| path.exists())
    }

    fn require_keybox(&self, what: &'static str) -> Result<()> {
        if self.config.provisioning_method == ProvisioningMethod::Keybox {
            Ok(())
        } else {
            Err(Error::NotImplemented(what))
        }
    }

    // Provisioning and the root of trust.

    /// Validate and install a production keybox, writing it to
    /// [`EngineConfig::keybox_path`] when one is configured.
    pub fn install_keybox(&self, keybox: &[u8]) -> Result<()> {
        self.require_keybox("install_keybox")?;
        self.root
            .write()
            .install_keybox(keybox, self.config.keybox_path.as_deref())
    }

    /// Shadow the production keybox with a test keybox until
    /// [`terminate`](Self::terminate).
    pub fn load_test_keybox(&self, keybox: &[u8]) -> Result<()> {
        self.require_keybox("load_test_keybox")?;
        self.root.write().load_test_keybox(keybox)
    }

    /// Report whether the root of trust is usable.
    ///
    /// Certificate devices always pass; keybox devices report
    /// [`Error::BadMagic`] or [`Error::BadCrc`].
    pub fn is_keybox_valid(&self) -> Result<()> {
        match self.config.provisioning_method {
            ProvisioningMethod::Keybox => self.root.read().validate(),
            ProvisioningMethod::DrmCertificate | ProvisioningMethod::OemCertificate => Ok(()),
        }
    }

    fn copy_out(data: &[u8], out: &mut [u8]) -> Result<usize> {
        if out.len() < data.len() {
            return Err(Error::ShortBuffer {
                required: data.len(),
            });
        }
        out[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    /// Copy the keybox device id into `out`.
    pub fn get_device_id(&self, out: &mut [u8]) -> Result<usize> {
        self.require_keybox("get_device_id")?;
        let root = self.root.read();
        Self::copy_out(root.device_id()?, out)
    }

    /// Copy the keybox key data (device token) into `out`.
    pub fn get_key_data(&self, out: &mut [u8]) -> Result<usize> {
        self.require_keybox("get_key_data")?;
        let root = self.root.read();
        Self::copy_out(root.key_data()?, out)
    }

    /// Install the device certificate private key (PKCS#8, optionally with
    /// a `SIGN` scheme prefix).
    pub fn load_device_certificate_key(&self, pkcs8: &[u8]) -> Result<()> {
        self.root.write().load_device_rsa_key(pkcs8)
    }

    /// Install the built-in test RSA key as the device certificate key.
    pub fn load_test_rsa_key(&self) -> Result<()> {
        self.root.write().load_test_rsa_key()
    }

    // Nonces and key derivation.

    /// Issue a fresh nonce to a session.
    ///
    /// Nonces are never zero and never collide with one outstanding in any
    /// open session. Issuance is rate-limited engine-wide.
    pub fn generate_nonce(&self, session_id: u32) -> Result<u32> {
        self.ensure_initialized()?;
        let mut registry = self.registry.lock();
        if !registry.sessions.contains_key(&session_id) {
            return Err(Error::InvalidSession(session_id));
        }
        if !self.nonce_limiter.lock().try_acquire(self.clock.monotonic()) {
            warn!("Nonce flood: more than {} nonces per second", self.config.nonce_flood_count);
            return Err(Error::InvalidNonce);
        }

        let nonce = loop {
            let candidate = random_u32();
            if candidate != 0 && !registry.sessions.values().any(|s| s.has_nonce(candidate)) {
                break candidate;
            }
        };
        registry
            .sessions
            .get_mut(&session_id)
            .ok_or(Error::InvalidSession(session_id))?
            .add_nonce(nonce);
        trace!("Session {}: nonce {:08x}", session_id, nonce);
        Ok(nonce)
    }

    /// Derive encryption and MAC context from a license request.
    ///
    /// Context format follows the ENCRYPTION/AUTHENTICATION labels with the
    /// derived key length in bits appended.
    #[must_use]
    pub fn derive_context(message: &[u8]) -> (Vec<u8>, Vec<u8>) {
        fn enc_context(msg: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(11 + msg.len() + 4);
            out.extend_from_slice(b"ENCRYPTION");
            out.push(0);
            out.extend_from_slice(msg);
            out.extend_from_slice(&(16u32 * 8).to_be_bytes());
            out
        }

        fn mac_context(msg: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(15 + msg.len() + 4);
            out.extend_from_slice(b"AUTHENTICATION");
            out.push(0);
            out.extend_from_slice(msg);
            out.extend_from_slice(&(32u32 * 8 * 2).to_be_bytes());
            out
        }

        (enc_context(message), mac_context(message))
    }

    /// Derive session keys from the keybox device key.
    pub fn generate_derived_keys(
        &self,
        session_id: u32,
        mac_context: &[u8],
        enc_context: &[u8],
    ) -> Result<()> {
        self.require_keybox("generate_derived_keys")?;
        self.valid_root()?;
        self.with_session(session_id, |session| {
            let root = self.root.read();
            session.derive_keys(root.device_key()?, mac_context, enc_context)
        })
    }

    /// Derive session keys from a session key encrypted to the session's RSA
    /// key.
    pub fn derive_keys_from_session_key(
        &self,
        session_id: u32,
        enc_session_key: &[u8],
        mac_context: &[u8],
        enc_context: &[u8],
    ) -> Result<()> {
        self.valid_root()?;
        self.with_session(session_id, |session| {
            session.rsa_derive_keys(enc_session_key, mac_context, enc_context)
        })
    }

    /// Sign a license request with the client mac key.
    pub fn generate_signature(&self, session_id: u32, message: &[u8], out: &mut [u8]) -> Result<usize> {
        self.with_session(session_id, |session| session.generate_signature(message, out))
    }

    // License keys.

    /// Verify a license and install its keys.
    ///
    /// Fields are located by the spans in `request`, each range-checked
    /// against `message`. A failed load installs none of its keys.
    pub fn load_keys(
        &self,
        session_id: u32,
        message: &[u8],
        signature: &[u8],
        request: &LoadKeysRequest<'_>,
    ) -> Result<()> {
        self.valid_root()?;
        self.with_session(session_id, |session| {
            let message = Message::new(message)?;
            if signature.is_empty() {
                return Err(Error::context("license signature is empty"));
            }
            request.validate(&message)?;
            let srm_version = *self.srm_version.lock();
            let mut usage = self.usage.lock();
            session.load_keys(&self.config, &mut usage, srm_version, &message, signature, request)
        })
    }

    /// Unwrap content keys with previously loaded entitlement keys.
    pub fn load_entitled_content_keys(
        &self,
        session_id: u32,
        message: &[u8],
        keys: &[EntitledContentKeyObject],
    ) -> Result<()> {
        self.with_session(session_id, |session| {
            if keys.is_empty() {
                return Ok(());
            }
            let message = Message::new(message)?;
            session.load_entitled_content_keys(&message, keys)
        })
    }

    /// Apply a signed license renewal.
    pub fn refresh_keys(
        &self,
        session_id: u32,
        message: &[u8],
        signature: &[u8],
        keys: &[KeyRefreshObject],
    ) -> Result<()> {
        self.valid_root()?;
        self.with_session(session_id, |session| {
            let message = Message::new(message)?;
            if signature.is_empty() {
                return Err(Error::context("renewal signature is empty"));
            }
            session.refresh_keys(&message, signature, keys)
        })
    }

    /// Select the key used by later decrypt and generic crypto calls.
    pub fn select_key(&self, session_id: u32, key_id: &[u8], mode: CipherMode) -> Result<()> {
        self.with_session(session_id, |session| {
            if key_id.is_empty() {
                return Err(Error::context("key id is empty"));
            }
            session.select_key(key_id, mode)
        })
    }

    /// Write a key's duration and control bits into `out` (16 bytes).
    pub fn query_key_control(&self, session_id: u32, key_id: &[u8], out: &mut [u8]) -> Result<usize> {
        self.with_session(session_id, |session| session.query_key_control(key_id, out))
    }

    // Bulk decrypt.

    fn check_input_size(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::context("no input data"));
        }
        if self.config.max_buffer_size > 0 && data.len() > self.config.max_buffer_size {
            warn!(
                "Input of {} bytes exceeds limit {}",
                data.len(),
                self.config.max_buffer_size
            );
            return Err(Error::BufferTooLarge);
        }
        Ok(())
    }

    /// Decrypt one subsample with the selected key into `destination`.
    pub fn decrypt_cenc(
        &self,
        session_id: u32,
        sample: &CencSample<'_>,
        destination: &mut Destination<'_>,
    ) -> Result<()> {
        self.check_input_size(sample.data)?;
        let buffer_type = destination.buffer_type();
        let output = destination.window(sample.data.len(), self.config.max_output_size)?;
        self.valid_root()?;
        self.with_session(session_id, |session| {
            let mut usage = self.usage.lock();
            session.decrypt_cenc(&self.config, &mut usage, sample, buffer_type, output)
        })
    }

    /// Copy clear data to a destination buffer.
    pub fn copy_buffer(
        &self,
        session_id: u32,
        data: &[u8],
        destination: &mut Destination<'_>,
        subsample_flags: u8,
    ) -> Result<()> {
        self.with_session(session_id, |_| {
            self.check_input_size(data)?;
            if let Some(output) = destination.window(data.len(), self.config.max_output_size)? {
                output.copy_from_slice(data);
            }
            trace!(
                "Session {}: copied {} bytes (flags {:#x})",
                session_id,
                data.len(),
                subsample_flags
            );
            Ok(())
        })
    }

    /// Arm CRC verification of the next decrypted frame.
    pub fn set_decrypt_hash(&self, session_id: u32, frame_number: u32, hash: &[u8]) -> Result<()> {
        self.with_session(session_id, |session| session.set_decrypt_hash(frame_number, hash))
    }

    /// Report the first frame whose decrypt hash did not match.
    pub fn get_hash_error_code(&self, session_id: u32) -> Result<()> {
        self.with_session(session_id, |session| session.hash_error_code())
    }

    // Generic crypto.

    pub fn generic_encrypt(
        &self,
        session_id: u32,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> Result<usize> {
        self.with_session(session_id, |session| {
            let mut usage = self.usage.lock();
            session.generic_encrypt(&self.config, &mut usage, input, iv, algorithm, out)
        })
    }

    pub fn generic_decrypt(
        &self,
        session_id: u32,
        input: &[u8],
        iv: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> Result<usize> {
        self.with_session(session_id, |session| {
            let mut usage = self.usage.lock();
            session.generic_decrypt(&self.config, &mut usage, input, iv, algorithm, out)
        })
    }

    pub fn generic_sign(
        &self,
        session_id: u32,
        input: &[u8],
        algorithm: GenericAlgorithm,
        out: &mut [u8],
    ) -> Result<usize> {
        self.with_session(session_id, |session| {
            let mut usage = self.usage.lock();
            session.generic_sign(&self.config, &mut usage, input, algorithm, out)
        })
    }

    pub fn generic_verify(
        &self,
        session_id: u32,
        input: &[u8],
        algorithm: GenericAlgorithm,
        signature: &[u8],
    ) -> Result<()> {
        self.with_session(session_id, |session| {
            let mut usage = self.usage.lock();
            session.generic_verify(&self.config, &mut usage, input, algorithm, signature)
        })
    }

    // RSA provisioning.

    /// Decrypt a provisioned device RSA key and rewrap it under the device
    /// key. Returns the size of the wrapped key written to `out`.
    pub fn rewrap_device_rsa_key(
        &self,
        session_id: u32,
        request: &RewrapRequest<'_>,
        out: &mut [u8],
    ) -> Result<usize> {
        let enc_len = match request {
            RewrapRequest::Keybox { enc_rsa_key, .. } => enc_rsa_key.length,
            RewrapRequest::SessionKey { enc_rsa_key, .. } => enc_rsa_key.len(),
        };
        let required = WrappedRsaKey::wrapped_size(enc_len);
        if out.len() < required {
            return Err(Error::ShortBuffer { required });
        }
        if matches!(request, RewrapRequest::Keybox { .. }) {
            self.require_keybox("rewrap_device_rsa_key")?;
        }
        self.valid_root()?;
        self.with_session(session_id, |session| {
            let root = self.root.read();
            session.rewrap_device_rsa_key(root.device_key()?, request, out)
        })
    }

    /// Load a wrapped device RSA key into a session.
    ///
    /// Devices with a baked-in certificate take the magic marker instead and
    /// share the root's key.
    pub fn load_device_rsa_key(&self, session_id: u32, wrapped: &[u8]) -> Result<()> {
        if self.config.provisioning_method == ProvisioningMethod::DrmCertificate {
            if wrapped != BAKED_IN_CERTIFICATE_MAGIC {
                return Err(Error::InvalidRsaKey(
                    "expected the baked-in certificate marker".to_string(),
                ));
            }
            return self.with_session(session_id, |session| {
                let key = self
                    .root
                    .read()
                    .shared_rsa_key()
                    .ok_or_else(|| Error::InvalidRsaKey("no certificate key".to_string()))?;
                session.use_device_rsa_key(key);
                Ok(())
            });
        }
        self.valid_root()?;
        self.with_session(session_id, |session| {
            let root = self.root.read();
            session.load_wrapped_rsa_key(root.device_key()?, wrapped)
        })
    }

    /// Sign with the session's RSA key.
    pub fn generate_rsa_signature(
        &self,
        session_id: u32,
        message: &[u8],
        scheme: SignatureScheme,
        out: &mut [u8],
    ) -> Result<usize> {
        self.with_session(session_id, |session| {
            session.generate_rsa_signature(message, scheme, out)
        })
    }

    // Usage table.

    fn require_usage_table(&self) -> Result<()> {
        self.ensure_initialized()?;
        if self.config.supports_usage_table {
            Ok(())
        } else {
            Err(Error::NotImplemented("usage table"))
        }
    }

    /// Start an empty usage table and write its header.
    pub fn create_usage_table_header(&self, out: &mut [u8]) -> Result<usize> {
        self.require_usage_table()?;
        let root = self.root.read();
        self.usage.lock().create_header(root.device_key()?, out)
    }

    /// Restore the usage table from a saved header.
    pub fn load_usage_table_header(&self, header: &[u8]) -> Result<LoadStatus> {
        self.require_usage_table()?;
        let root = self.root.read();
        self.usage.lock().load_header(root.device_key()?, header)
    }

    /// Truncate the usage table and write the new header.
    pub fn shrink_usage_table_header(&self, new_size: u32, out: &mut [u8]) -> Result<usize> {
        self.require_usage_table()?;
        let root = self.root.read();
        self.usage.lock().shrink_header(new_size, root.device_key()?, out)
    }

    /// Bind a new usage entry to the session and return its index.
    pub fn create_new_usage_entry(&self, session_id: u32) -> Result<u32> {
        self.require_usage_table()?;
        self.with_session(session_id, |session| {
            session.create_usage_entry(&mut self.usage.lock())
        })
    }

    /// Restore a saved usage entry into the session.
    pub fn load_usage_entry(&self, session_id: u32, index: u32, entry: &[u8]) -> Result<LoadStatus> {
        self.require_usage_table()?;
        self.with_session(session_id, |session| {
            let root = self.root.read();
            let key = root.device_key()?;
            session.load_usage_entry(&mut self.usage.lock(), index, key, entry)
        })
    }

    /// Seal the usage table header and the session's entry.
    ///
    /// Returns the `(header, entry)` sizes written.
    pub fn update_usage_entry(
        &self,
        session_id: u32,
        header_out: &mut [u8],
        entry_out: &mut [u8],
    ) -> Result<(usize, usize)> {
        self.require_usage_table()?;
        self.with_session(session_id, |session| {
            let root = self.root.read();
            let key = root.device_key()?;
            session.update_usage_entry(&mut self.usage.lock(), key, header_out, entry_out)
        })
    }

    pub fn deactivate_usage_entry(&self, session_id: u32) -> Result<()> {
        self.require_usage_table()?;
        self.with_session(session_id, |session| {
            session.deactivate_usage_entry(&mut self.usage.lock())
        })
    }

    /// Write a signed usage report for `pst` into `out`.
    pub fn report_usage(&self, session_id: u32, pst: &[u8], out: &mut [u8]) -> Result<usize> {
        self.require_usage_table()?;
        self.with_session(session_id, |session| {
            session.report_usage(&mut self.usage.lock(), pst, out)
        })
    }

    /// Relocate the session's usage entry.
    pub fn move_entry(&self, session_id: u32, new_index: u32) -> Result<()> {
        self.require_usage_table()?;
        self.with_session(session_id, |session| {
            session.move_usage_entry(&mut self.usage.lock(), new_index)
        })
    }

    /// Record an entry of the legacy PST-keyed usage table.
    pub fn create_old_usage_entry(
        &self,
        times: OldEntryTimes,
        status: EntryStatus,
        mac_key_server: &[u8],
        mac_key_client: &[u8],
        pst: &[u8],
    ) -> Result<()> {
        self.require_usage_table()?;
        self.usage
            .lock()
            .create_old_usage_entry(times, status, mac_key_server, mac_key_client, pst)
    }

    /// Import a legacy entry into the session's new usage entry.
    pub fn copy_old_usage_entry(&self, session_id: u32, pst: &[u8]) -> Result<()> {
        self.require_usage_table()?;
        self.with_session(session_id, |session| {
            session.copy_old_usage_entry(&self.usage.lock(), pst)
        })
    }

    pub fn delete_old_usage_table(&self) -> Result<()> {
        self.require_usage_table()?;
        self.usage.lock().delete_old_usage_table();
        Ok(())
    }

    /// The usage table master generation, for integrators that mirror it in
    /// rollback-proof storage.
    #[must_use]
    pub fn usage_master_generation(&self) -> Option<i64> {
        self.usage.lock().master_generation()
    }

    pub fn restore_usage_master_generation(&self, generation: i64) {
        self.usage.lock().restore_master_generation(generation);
    }

    // Offline time.

    /// Seal the rollback-corrected clock state under the device key.
    pub fn export_time_state(&self, out: &mut [u8]) -> Result<usize> {
        if out.len() < TIME_STATE_SIZE {
            return Err(Error::ShortBuffer {
                required: TIME_STATE_SIZE,
            });
        }
        let root = self.root.read();
        let mut clear = [0u8; TIME_STATE_SIZE];
        clear[..8].copy_from_slice(TIME_STATE_MAGIC);
        clear[8..8 + OfflineTime::ENCODED_LEN]
            .copy_from_slice(&self.usage.lock().offline_time().to_bytes());
        let sealed = aes128_cbc_encrypt(root.device_key()?, &[0u8; AES_BLOCK_SIZE], &clear)?;
        out[..TIME_STATE_SIZE].copy_from_slice(&sealed);
        Ok(TIME_STATE_SIZE)
    }

    /// Restore clock state produced by [`export_time_state`](Self::export_time_state).
    pub fn import_time_state(&self, data: &[u8]) -> Result<()> {
        if data.len() != TIME_STATE_SIZE {
            return Err(Error::context(format!(
                "time state is {} bytes, expected {}",
                data.len(),
                TIME_STATE_SIZE
            )));
        }
        let root = self.root.read();
        let clear = aes128_cbc_decrypt(root.device_key()?, &[0u8; AES_BLOCK_SIZE], data)?;
        if &clear[..8] != TIME_STATE_MAGIC {
            return Err(Error::context("time state has bad magic"));
        }
        let mut encoded = [0u8; OfflineTime::ENCODED_LEN];
        encoded.copy_from_slice(&clear[8..8 + OfflineTime::ENCODED_LEN]);
        self.usage
            .lock()
            .set_offline_time(OfflineTime::from_bytes(&encoded));
        Ok(())
    }

    // SRM.

    /// Install a newer SRM. The version is the big-endian u16 at offset 2.
    pub fn load_srm(&self, srm: &[u8]) -> Result<()> {
        if !self.config.srm_update_supported {
            return Err(Error::NotImplemented("SRM update"));
        }
        if srm.len() < 4 {
            return Err(Error::context(format!("SRM of {} bytes", srm.len())));
        }
        let version = u16::from_be_bytes([srm[2], srm[3]]);
        let mut current = self.srm_version.lock();
        if let Some(installed) = *current {
            if version < installed {
                return Err(Error::context(format!(
                    "SRM version {} older than installed {}",
                    version, installed
                )));
            }
        }
        *current = Some(version);
        debug!("SRM version {} installed", version);
        Ok(())
    }

    pub fn remove_srm(&self) -> Result<()> {
        if !self.config.srm_update_supported {
            return Err(Error::NotImplemented("SRM update"));
        }
        *self.srm_version.lock() = None;
        Ok(())
    }

    pub fn get_current_srm_version(&self) -> Result<u16> {
        (*self.srm_version.lock()).ok_or(Error::NotImplemented("SRM"))
    }

    // Capabilities.

    #[must_use]
    pub fn api_version(&self) -> u32 {
        self.config.api_version
    }

    #[must_use]
    pub fn security_level(&self) -> SecurityLevel {
        self.config.security_level
    }

    /// Current and maximum HDCP capability.
    #[must_use]
    pub fn hdcp_capability(&self) -> (HdcpCapability, HdcpCapability) {
        (self.config.current_hdcp_capability(), self.config.max_hdcp)
    }

    #[must_use]
    pub fn is_local_display_only(&self) -> bool {
        self.config.local_display_only
    }

    #[must_use]
    pub fn is_closed_platform(&self) -> bool {
        self.config.closed_platform
    }

    #[must_use]
    pub fn provisioning_method(&self) -> ProvisioningMethod {
        self.config.provisioning_method
    }

    #[must_use]
    pub fn supports_usage_table(&self) -> bool {
        self.config.supports_usage_table
    }

    #[must_use]
    pub fn is_anti_rollback_hw_present(&self) -> bool {
        self.config.anti_rollback_hardware
    }

    #[must_use]
    pub fn security_patch_level(&self) -> u8 {
        self.config.security_patch_level
    }

    #[must_use]
    pub fn max_number_of_sessions(&self) -> usize {
        self.config.max_sessions
    }

    #[must_use]
    pub fn resource_rating_tier(&self) -> u32 {
        self.config.resource_rating_tier
    }

    #[must_use]
    pub fn is_srm_update_supported(&self) -> bool {
        self.config.srm_update_supported
    }
}
