//! Per-session key storage.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::key::{EntitledContentKey, Key};

/// Kind of license a session's keys came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseType {
    Content,
    Entitlement,
}

/// Keys of one session. The variant is fixed by the first license load.
#[derive(Debug, Clone)]
pub enum SessionKeyTable {
    /// Content keys addressed by key id.
    Content(HashMap<Vec<u8>, Key>),
    /// Entitlement keys addressed by entitlement id, plus the content ids
    /// that currently resolve to each of them.
    Entitlement {
        keys: HashMap<Vec<u8>, Key>,
        content_ids: HashMap<Vec<u8>, Vec<u8>>,
    },
}

impl SessionKeyTable {
    pub fn new(license_type: LicenseType) -> Self {
        match license_type {
            LicenseType::Content => SessionKeyTable::Content(HashMap::new()),
            LicenseType::Entitlement => SessionKeyTable::Entitlement {
                keys: HashMap::new(),
                content_ids: HashMap::new(),
            },
        }
    }

    #[must_use]
    pub fn license_type(&self) -> LicenseType {
        match self {
            SessionKeyTable::Content(_) => LicenseType::Content,
            SessionKeyTable::Entitlement { .. } => LicenseType::Entitlement,
        }
    }

    fn keys(&self) -> &HashMap<Vec<u8>, Key> {
        match self {
            SessionKeyTable::Content(keys) | SessionKeyTable::Entitlement { keys, .. } => keys,
        }
    }

    fn keys_mut(&mut self) -> &mut HashMap<Vec<u8>, Key> {
        match self {
            SessionKeyTable::Content(keys) | SessionKeyTable::Entitlement { keys, .. } => keys,
        }
    }

    /// Insert a key under its license key id. An id already in the table is
    /// rejected.
    pub fn insert(&mut self, key_id: Vec<u8>, key: Key) -> Result<()> {
        match self.keys_mut().entry(key_id) {
            Entry::Occupied(entry) => Err(Error::context(format!(
                "duplicate key id {}",
                hex::encode(entry.key())
            ))),
            Entry::Vacant(entry) => {
                entry.insert(key);
                Ok(())
            }
        }
    }

    /// Look up the key that decrypts content labelled `key_id`.
    ///
    /// Entitlement tables resolve content ids through their entitlement key.
    #[must_use]
    pub fn find(&self, key_id: &[u8]) -> Option<&Key> {
        match self {
            SessionKeyTable::Content(keys) => keys.get(key_id),
            SessionKeyTable::Entitlement { keys, content_ids } => {
                content_ids.get(key_id).and_then(|id| keys.get(id))
            }
        }
    }

    pub fn find_mut(&mut self, key_id: &[u8]) -> Option<&mut Key> {
        match self {
            SessionKeyTable::Content(keys) => keys.get_mut(key_id),
            SessionKeyTable::Entitlement { keys, content_ids } => match content_ids.get(key_id) {
                Some(id) => keys.get_mut(id),
                None => None,
            },
        }
    }

    /// Look up by the id the license used, ignoring entitlement indirection.
    #[must_use]
    pub fn find_by_license_id(&self, key_id: &[u8]) -> Option<&Key> {
        self.keys().get(key_id)
    }

    pub fn find_by_license_id_mut(&mut self, key_id: &[u8]) -> Option<&mut Key> {
        self.keys_mut().get_mut(key_id)
    }

    pub fn remove(&mut self, key_id: &[u8]) -> Option<Key> {
        match self {
            SessionKeyTable::Content(keys) => keys.remove(key_id),
            SessionKeyTable::Entitlement { keys, content_ids } => {
                content_ids.retain(|_, entitlement_id| entitlement_id.as_slice() != key_id);
                keys.remove(key_id)
            }
        }
    }

    /// Apply one duration to every key (renewal of the whole license).
    pub fn update_duration(&mut self, duration: u32) {
        for key in self.keys_mut().values_mut() {
            key.control_mut().set_duration(duration);
        }
    }

    /// Apply `f` to every key.
    pub fn for_each_key_mut(&mut self, mut f: impl FnMut(&mut Key)) {
        for key in self.keys_mut().values_mut() {
            f(key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Bind an unwrapped content key to its entitlement key.
    ///
    /// Any content id previously served by that entitlement key stops
    /// resolving.
    pub fn set_content_key(
        &mut self,
        entitlement_id: &[u8],
        content_key_id: &[u8],
        content_key: Vec<u8>,
    ) -> Result<()> {
        let SessionKeyTable::Entitlement { keys, content_ids } = self else {
            return Err(Error::context("session does not hold entitlement keys"));
        };
        let key = keys.get_mut(entitlement_id).ok_or(Error::KeyNotEntitled)?;

        if let Some(previous) = key.entitled() {
            content_ids.remove(&previous.key_id);
        }
        key.set_entitled(EntitledContentKey {
            key_id: content_key_id.to_vec(),
            key: Zeroizing::new(content_key),
        });
        content_ids.insert(content_key_id.to_vec(), entitlement_id.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{bits, control_block, KeyControlBlock};

    fn key(value: u8) -> Key {
        let control = KeyControlBlock::parse(&control_block(b"kc15", 10, 0, bits::ALLOW_DECRYPT))
            .expect("valid");
        Key::new(vec![value; 32], control)
    }

    #[test]
    fn entitlement_indirection_resolves_content_ids() {
        let mut table = SessionKeyTable::new(LicenseType::Entitlement);
        table.insert(b"ent".to_vec(), key(1)).expect("insert");

        assert!(table.find(b"ent").is_none());
        table
            .set_content_key(b"ent", b"content-a", vec![2u8; 16])
            .expect("entitled");
        assert_eq!(table.find(b"content-a").expect("found").value(), &[2u8; 16]);

        table
            .set_content_key(b"ent", b"content-b", vec![3u8; 16])
            .expect("entitled");
        assert!(table.find(b"content-a").is_none());
        assert_eq!(table.find(b"content-b").expect("found").value(), &[3u8; 16]);
    }

    #[test]
    fn unknown_entitlement_is_not_entitled() {
        let mut table = SessionKeyTable::new(LicenseType::Entitlement);
        assert!(matches!(
            table.set_content_key(b"missing", b"c", vec![0u8; 16]),
            Err(Error::KeyNotEntitled)
        ));

        let mut content = SessionKeyTable::new(LicenseType::Content);
        assert!(matches!(
            content.set_content_key(b"ent", b"c", vec![0u8; 16]),
            Err(Error::InvalidContext(_))
        ));
    }

    #[test]
    fn update_duration_touches_every_key() {
        let mut table = SessionKeyTable::new(LicenseType::Content);
        table.insert(b"a".to_vec(), key(1)).expect("insert");
        table.insert(b"b".to_vec(), key(2)).expect("insert");
        table.update_duration(99);

        assert_eq!(table.find(b"a").expect("a").control().duration(), 99);
        assert_eq!(table.find(b"b").expect("b").control().duration(), 99);
        assert!(table.remove(b"a").is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_key_id_is_rejected() {
        let mut table = SessionKeyTable::new(LicenseType::Content);
        table.insert(b"a".to_vec(), key(1)).expect("insert");
        assert!(matches!(
            table.insert(b"a".to_vec(), key(2)),
            Err(Error::InvalidContext(_))
        ));
        assert_eq!(table.find(b"a").expect("a").value(), &[1u8; 32]);
    }
}
