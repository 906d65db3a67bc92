//! The device root of trust.

use std::path::Path;
use std::sync::{Arc, Weak};

use crate::config::ProvisioningMethod;
use crate::error::{Error, Result};
use crate::keybox::Keybox;
use crate::rsa_key::{test_rsa_key_der, RsaKey};

/// Holds the keybox (production and optional test override) or the device
/// certificate key, depending on how the device is provisioned.
#[derive(Debug)]
pub struct AuthenticationRoot {
    method: ProvisioningMethod,
    keybox: Option<Keybox>,
    test_keybox: Option<Keybox>,
    rsa_key: Option<Arc<RsaKey>>,
}

impl AuthenticationRoot {
    pub fn new(method: ProvisioningMethod) -> Self {
        Self {
            method,
            keybox: None,
            test_keybox: None,
            rsa_key: None,
        }
    }

    #[must_use]
    pub fn provisioning_method(&self) -> ProvisioningMethod {
        self.method
    }

    fn active_keybox(&self) -> Option<&Keybox> {
        self.test_keybox.as_ref().or(self.keybox.as_ref())
    }

    /// Validate the active root.
    ///
    /// Keybox devices report [`Error::BadMagic`] and [`Error::BadCrc`]
    /// separately. Certificate devices need a loaded key.
    pub fn validate(&self) -> Result<()> {
        match self.method {
            ProvisioningMethod::Keybox => self
                .active_keybox()
                .ok_or(Error::KeyboxInvalid)?
                .validate(),
            ProvisioningMethod::DrmCertificate | ProvisioningMethod::OemCertificate => {
                if self.rsa_key.is_some() {
                    Ok(())
                } else {
                    Err(Error::InvalidRsaKey("no device certificate key".to_string()))
                }
            }
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Validate a production keybox and install it. With a `persist_path`
    /// the keybox is written there first; a failed write installs nothing.
    pub fn install_keybox(&mut self, data: &[u8], persist_path: Option<&Path>) -> Result<()> {
        let keybox = Keybox::from_bytes(data)?;
        keybox.validate()?;
        if let Some(path) = persist_path {
            keybox.save(path)?;
            debug!("Persisted keybox to {}", path.display());
        }
        debug!("Installed keybox for device {:?}", keybox);
        self.keybox = Some(keybox);
        Ok(())
    }

    /// Reload a keybox written by [`install_keybox`](Self::install_keybox).
    pub fn restore_keybox(&mut self, path: &Path) -> Result<()> {
        let keybox = Keybox::from_path(path)?;
        keybox.validate()?;
        self.keybox = Some(keybox);
        Ok(())
    }

    /// Shadow the production keybox with a test keybox until
    /// [`use_production_keybox`](Self::use_production_keybox).
    pub fn load_test_keybox(&mut self, data: &[u8]) -> Result<()> {
        let keybox = Keybox::from_bytes(data)?;
        keybox.validate()?;
        self.test_keybox = Some(keybox);
        Ok(())
    }

    pub fn use_production_keybox(&mut self) {
        self.test_keybox = None;
    }

    fn valid_keybox(&self) -> Result<&Keybox> {
        let keybox = self.active_keybox().ok_or(Error::KeyboxInvalid)?;
        keybox.validate().map_err(|_| Error::KeyboxInvalid)?;
        Ok(keybox)
    }

    /// Key used to derive session keys and to protect persisted state.
    pub fn device_key(&self) -> Result<&[u8]> {
        Ok(self.valid_keybox()?.device_key())
    }

    pub fn device_id(&self) -> Result<&[u8]> {
        Ok(self.valid_keybox()?.device_id())
    }

    pub fn key_data(&self) -> Result<&[u8]> {
        Ok(self.valid_keybox()?.key_data())
    }

    /// Install the device certificate key.
    pub fn load_device_rsa_key(&mut self, pkcs8: &[u8]) -> Result<()> {
        self.rsa_key = Some(Arc::new(RsaKey::from_pkcs8(pkcs8)?));
        Ok(())
    }

    /// Install the built-in test RSA key as the device certificate key.
    pub fn load_test_rsa_key(&mut self) -> Result<()> {
        let der = test_rsa_key_der()?;
        self.load_device_rsa_key(&der)
    }

    /// A non-owning handle on the device certificate key.
    #[must_use]
    pub fn shared_rsa_key(&self) -> Option<Weak<RsaKey>> {
        self.rsa_key.as_ref().map(Arc::downgrade)
    }

    /// Drop every secret.
    pub fn clear(&mut self) {
        self.keybox = None;
        self.test_keybox = None;
        self.rsa_key = None;
    }
}
