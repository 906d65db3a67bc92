//! The usage table: persistent anti-replay and usage-reporting state.
//!
//! The engine keeps one [`UsageTable`] holding the per-entry generation
//! numbers and the master generation. Each open session may own one
//! [`UsageTableEntry`]. Nothing is written to disk here: callers receive
//! encrypted, signed blobs from [`UsageTable::update_entry`] and hand them
//! back on the next boot.
//!
//! Both blob kinds share a framing:
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 32   | HMAC-SHA256 (device key) of bytes 32.. |
//! | 32     | 32   | IV (first 16 bytes used)               |
//! | 64     | 8    | magic, encrypted from here on          |
//! | 72     | ..   | payload, zero padded to a block        |

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::clock::{Clock, OfflineTime};
use crate::crypto::{
    aes128_cbc_decrypt, aes128_cbc_encrypt, hmac_sha256, random_bytes, secure_eq,
    verify_hmac_sha256, AES_BLOCK_SIZE, MAC_KEY_SIZE, SHA256_DIGEST_LENGTH,
};
use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// Longest provider session token.
pub const MAX_PST_LENGTH: usize = 255;

const MAGIC_LENGTH: usize = 8;
const ENTRY_MAGIC: &[u8; MAGIC_LENGTH] = b"USEENTRY";
const HEADER_MAGIC: &[u8; MAGIC_LENGTH] = b"USEHEADR";
/// Signature plus IV slot.
const ENCRYPTION_OFFSET: usize = SHA256_DIGEST_LENGTH + SHA256_DIGEST_LENGTH;
const PAYLOAD_OFFSET: usize = ENCRYPTION_OFFSET + MAGIC_LENGTH;

/// generation, three times, status, two mac keys, index, pst length, pst
const STORED_ENTRY_SIZE: usize = 8 * 4 + 1 + MAC_KEY_SIZE * 2 + 4 + 1 + MAX_PST_LENGTH;
const HEADER_FIXED_SIZE: usize = PAYLOAD_OFFSET + 8 + 8;

/// Clock security level written into reports.
const CLOCK_SECURE_TIMER: u8 = 1;
const SHA1_DIGEST_LENGTH: usize = 20;
const REPORT_FIXED_SIZE: usize = 48;

fn round_to_block(size: usize) -> usize {
    size.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE
}

/// Size of a serialized usage entry.
#[must_use]
pub fn signed_entry_size() -> usize {
    round_to_block(PAYLOAD_OFFSET + STORED_ENTRY_SIZE)
}

/// Size of a serialized header for a table of `count` entries.
#[must_use]
pub fn signed_header_size(count: usize) -> usize {
    round_to_block(HEADER_FIXED_SIZE + count * 8)
}

/// [`signed_header_size`] for a count read from storage.
fn checked_header_size(count: usize) -> Option<usize> {
    count
        .checked_mul(8)?
        .checked_add(HEADER_FIXED_SIZE)?
        .checked_next_multiple_of(AES_BLOCK_SIZE)
}

/// Size of a usage report for a token of `pst_len` bytes.
#[must_use]
pub fn report_size(pst_len: usize) -> usize {
    REPORT_FIXED_SIZE + pst_len
}

/// Lifecycle of a usage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryStatus {
    Unused = 0,
    Active = 1,
    /// Written by older tables; treated like the other inactive states.
    Inactive = 2,
    InactiveUsed = 3,
    InactiveUnused = 4,
}

impl TryFrom<u8> for EntryStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EntryStatus::Unused),
            1 => Ok(EntryStatus::Active),
            2 => Ok(EntryStatus::Inactive),
            3 => Ok(EntryStatus::InactiveUsed),
            4 => Ok(EntryStatus::InactiveUnused),
            _ => Err(Error::UnknownFailure(format!(
                "usage entry has bad status {}",
                value
            ))),
        }
    }
}

impl From<EntryStatus> for u8 {
    fn from(status: EntryStatus) -> Self {
        status as u8
    }
}

/// Outcome of loading persisted usage state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded,
    /// The blob was exactly one generation away from the expected value.
    GenerationSkewWarning,
}

fn check_skew(stored: i64, expected: i64) -> Result<LoadStatus> {
    if stored == expected {
        return Ok(LoadStatus::Loaded);
    }
    warn!("Generation skew: {} -> {}", stored, expected);
    if stored.saturating_add(1) < expected || stored.saturating_sub(1) > expected {
        return Err(Error::GenerationSkew);
    }
    Ok(LoadStatus::GenerationSkewWarning)
}

/// Encrypt and sign a clear blob in place. The magic and payload must
/// already be written at [`ENCRYPTION_OFFSET`].
fn seal(key: &[u8], clear: &[u8], out: &mut [u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::context("device key is empty"));
    }
    let mut iv = [0u8; AES_BLOCK_SIZE];
    random_bytes(&mut iv);
    let encrypted = aes128_cbc_encrypt(key, &iv, &clear[ENCRYPTION_OFFSET..])?;

    out.fill(0);
    out[SHA256_DIGEST_LENGTH..SHA256_DIGEST_LENGTH + AES_BLOCK_SIZE].copy_from_slice(&iv);
    out[ENCRYPTION_OFFSET..clear.len()].copy_from_slice(&encrypted);
    let signature = hmac_sha256(key, &out[SHA256_DIGEST_LENGTH..clear.len()])?;
    out[..SHA256_DIGEST_LENGTH].copy_from_slice(&signature);
    Ok(())
}

/// Verify and decrypt a sealed blob, checking its magic.
fn unseal(key: &[u8], data: &[u8], magic: &[u8; MAGIC_LENGTH]) -> Result<Vec<u8>> {
    if key.is_empty() {
        return Err(Error::context("device key is empty"));
    }
    verify_hmac_sha256(
        key,
        &data[SHA256_DIGEST_LENGTH..],
        &data[..SHA256_DIGEST_LENGTH],
    )?;
    let iv = &data[SHA256_DIGEST_LENGTH..SHA256_DIGEST_LENGTH + AES_BLOCK_SIZE];
    // Trailing bytes beyond a block boundary were never encrypted.
    let body_len = (data.len() - ENCRYPTION_OFFSET) / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
    let clear = aes128_cbc_decrypt(key, iv, &data[ENCRYPTION_OFFSET..ENCRYPTION_OFFSET + body_len])?;
    if &clear[..MAGIC_LENGTH] != magic {
        return Err(Error::BadMagic);
    }
    Ok(clear[MAGIC_LENGTH..].to_vec())
}

/// Cursor over the fixed-layout payloads.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let out = self
            .data
            .get(self.offset..self.offset + len)
            .ok_or(Error::ShortBuffer {
                required: self.offset + len,
            })?;
        self.offset += len;
        Ok(out)
    }

    fn i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredUsageEntry {
    generation: i64,
    time_of_license_received: i64,
    time_of_first_decrypt: i64,
    time_of_last_decrypt: i64,
    status: EntryStatus,
    mac_key_server: [u8; MAC_KEY_SIZE],
    mac_key_client: [u8; MAC_KEY_SIZE],
    index: u32,
    pst: Vec<u8>,
}

impl StoredUsageEntry {
    fn new(index: u32, generation: i64) -> Self {
        Self {
            generation,
            time_of_license_received: 0,
            time_of_first_decrypt: 0,
            time_of_last_decrypt: 0,
            status: EntryStatus::Unused,
            mac_key_server: [0u8; MAC_KEY_SIZE],
            mac_key_client: [0u8; MAC_KEY_SIZE],
            index,
            pst: Vec::new(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.generation.to_be_bytes());
        out.extend_from_slice(&self.time_of_license_received.to_be_bytes());
        out.extend_from_slice(&self.time_of_first_decrypt.to_be_bytes());
        out.extend_from_slice(&self.time_of_last_decrypt.to_be_bytes());
        out.push(self.status.into());
        out.extend_from_slice(&self.mac_key_server);
        out.extend_from_slice(&self.mac_key_client);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.push(self.pst.len() as u8);
        let mut pst = [0u8; MAX_PST_LENGTH];
        pst[..self.pst.len()].copy_from_slice(&self.pst);
        out.extend_from_slice(&pst);
    }

    fn read(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let generation = reader.i64()?;
        let time_of_license_received = reader.i64()?;
        let time_of_first_decrypt = reader.i64()?;
        let time_of_last_decrypt = reader.i64()?;
        let status_byte = reader.u8()?;
        let mut mac_key_server = [0u8; MAC_KEY_SIZE];
        mac_key_server.copy_from_slice(reader.take(MAC_KEY_SIZE)?);
        let mut mac_key_client = [0u8; MAC_KEY_SIZE];
        mac_key_client.copy_from_slice(reader.take(MAC_KEY_SIZE)?);
        let index = reader.u32()?;
        let pst_len = reader.u8()? as usize;
        let pst = reader.take(MAX_PST_LENGTH)?[..pst_len].to_vec();
        Ok(Self {
            generation,
            time_of_license_received,
            time_of_first_decrypt,
            time_of_last_decrypt,
            status: EntryStatus::try_from(status_byte)?,
            mac_key_server,
            mac_key_client,
            index,
            pst,
        })
    }
}

/// A usage entry bound to one open session.
#[derive(Debug, Clone)]
pub struct UsageTableEntry {
    data: StoredUsageEntry,
    recent_decrypt: bool,
    forbid_report: bool,
}

impl UsageTableEntry {
    fn new(index: u32, generation: i64) -> Self {
        Self {
            data: StoredUsageEntry::new(index, generation),
            recent_decrypt: false,
            forbid_report: true,
        }
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.data.index
    }

    #[must_use]
    pub fn generation(&self) -> i64 {
        self.data.generation
    }

    #[must_use]
    pub fn status(&self) -> EntryStatus {
        self.data.status
    }

    #[must_use]
    pub fn pst(&self) -> &[u8] {
        &self.data.pst
    }

    #[must_use]
    pub fn is_inactive(&self) -> bool {
        matches!(
            self.data.status,
            EntryStatus::Inactive | EntryStatus::InactiveUsed | EntryStatus::InactiveUnused
        )
    }

    #[must_use]
    pub fn mac_key_server(&self) -> &[u8] {
        &self.data.mac_key_server
    }

    #[must_use]
    pub fn mac_key_client(&self) -> &[u8] {
        &self.data.mac_key_client
    }

    /// Bind a provider session token on first license load.
    pub fn set_pst(&mut self, pst: &[u8], now: i64) -> Result<()> {
        if pst.len() > MAX_PST_LENGTH {
            return Err(Error::BufferTooLarge);
        }
        if pst.is_empty() {
            return Err(Error::context("empty provider session token"));
        }
        self.data.pst = pst.to_vec();
        self.data.time_of_license_received = now;
        Ok(())
    }

    #[must_use]
    pub fn verify_pst(&self, pst: &[u8]) -> bool {
        !pst.is_empty() && pst.len() <= MAX_PST_LENGTH && pst == self.data.pst.as_slice()
    }

    #[must_use]
    pub fn verify_mac_keys(&self, server: &[u8], client: &[u8]) -> bool {
        secure_eq(server, &self.data.mac_key_server) && secure_eq(client, &self.data.mac_key_client)
    }

    pub fn set_mac_keys(&mut self, server: &[u8], client: &[u8]) -> Result<()> {
        if server.len() != MAC_KEY_SIZE || client.len() != MAC_KEY_SIZE {
            return Err(Error::UnknownFailure("usage entry mac keys have bad size".to_string()));
        }
        self.data.mac_key_server.copy_from_slice(server);
        self.data.mac_key_client.copy_from_slice(client);
        Ok(())
    }

    /// Record a decrypt. The first one activates the entry.
    pub fn check_for_use(&mut self, table: &mut UsageTable) -> Result<()> {
        if self.is_inactive() {
            return Err(Error::LicenseInactive);
        }
        self.recent_decrypt = true;
        if self.data.status == EntryStatus::Unused {
            self.data.status = EntryStatus::Active;
            self.data.time_of_first_decrypt = table.now();
            self.data.generation += 1;
            table.increment_generation();
            debug!("Usage entry {} activated", self.data.index);
        }
        Ok(())
    }

    /// Mark the entry inactive. Repeated calls only bump generations.
    pub fn deactivate(&mut self, table: &mut UsageTable) {
        self.data.status = match self.data.status {
            EntryStatus::Unused => EntryStatus::InactiveUnused,
            EntryStatus::Active => EntryStatus::InactiveUsed,
            other => other,
        };
        self.forbid_report = true;
        self.data.generation += 1;
        table.increment_generation();
    }

    fn update_and_increment(&mut self, table: &mut UsageTable) {
        if self.recent_decrypt {
            self.data.time_of_last_decrypt = table.now();
            self.recent_decrypt = false;
        }
        self.data.generation += 1;
        table.increment_generation();
        self.forbid_report = false;
    }

    /// Write a usage report signed with the entry's client mac key.
    ///
    /// Requires an [`UsageTable::update_entry`] since the last decrypt or
    /// deactivation.
    pub fn report_usage(&self, table: &mut UsageTable, pst: &[u8], out: &mut [u8]) -> Result<usize> {
        if self.forbid_report || self.recent_decrypt {
            return Err(Error::EntryNeedsUpdate);
        }
        if !self.verify_pst(pst) {
            return Err(Error::WrongPst);
        }
        let required = report_size(pst.len());
        if out.len() < required {
            return Err(Error::ShortBuffer { required });
        }

        let now = table.now();
        let report = &mut out[..required];
        report.fill(0);
        report[20] = self.data.status.into();
        report[21] = CLOCK_SECURE_TIMER;
        report[22] = self.data.pst.len() as u8;
        report[24..32].copy_from_slice(&(now - self.data.time_of_license_received).to_be_bytes());
        report[32..40].copy_from_slice(&(now - self.data.time_of_first_decrypt).to_be_bytes());
        report[40..48].copy_from_slice(&(now - self.data.time_of_last_decrypt).to_be_bytes());
        report[REPORT_FIXED_SIZE..].copy_from_slice(&self.data.pst);

        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.data.mac_key_client)
            .map_err(|_| Error::UnknownFailure("report key rejected".to_string()))?;
        mac.update(&report[SHA1_DIGEST_LENGTH..]);
        report[..SHA1_DIGEST_LENGTH].copy_from_slice(&mac.finalize().into_bytes());
        Ok(required)
    }

    /// Import status, times and mac keys from a legacy PST-keyed entry.
    pub fn copy_old_usage_entry(&mut self, table: &UsageTable, pst: &[u8]) -> Result<()> {
        let old = table.old_entries.get(pst).ok_or(Error::WrongPst)?;
        self.data.time_of_license_received = old.time_of_license_received;
        self.data.time_of_first_decrypt = old.time_of_first_decrypt;
        self.data.time_of_last_decrypt = old.time_of_last_decrypt;
        self.data.status = old.status;
        self.data.mac_key_server = old.mac_key_server;
        self.data.mac_key_client = old.mac_key_client;
        self.data.pst = pst[..pst.len().min(MAX_PST_LENGTH)].to_vec();
        Ok(())
    }

    fn save(&self, key: &[u8], out: &mut [u8]) -> Result<()> {
        let size = signed_entry_size();
        let mut clear = vec![0u8; ENCRYPTION_OFFSET];
        clear.extend_from_slice(ENTRY_MAGIC);
        self.data.write(&mut clear);
        clear.resize(size, 0);
        seal(key, &clear, &mut out[..size])
    }

    fn load(key: &[u8], index: u32, data: &[u8]) -> Result<Self> {
        let size = signed_entry_size();
        if data.len() < size {
            return Err(Error::ShortBuffer { required: size });
        }
        if data.len() > size {
            warn!("Usage entry buffer is large: {} > {}", data.len(), size);
        }
        let payload = unseal(key, &data[..size], ENTRY_MAGIC)?;
        let stored = StoredUsageEntry::read(&payload)?;
        if stored.index != index {
            return Err(Error::InvalidSession(index));
        }
        Ok(Self {
            data: stored,
            recent_decrypt: false,
            forbid_report: true,
        })
    }
}

/// A usage entry from the legacy table keyed by provider session token.
#[derive(Debug, Clone)]
pub struct OldUsageEntry {
    time_of_license_received: i64,
    time_of_first_decrypt: i64,
    time_of_last_decrypt: i64,
    status: EntryStatus,
    mac_key_server: [u8; MAC_KEY_SIZE],
    mac_key_client: [u8; MAC_KEY_SIZE],
}

/// Elapsed times carried by a legacy entry, in seconds before now.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldEntryTimes {
    pub since_license_received: i64,
    pub since_first_decrypt: i64,
    pub since_last_decrypt: i64,
}

/// Table-wide usage state shared by all sessions.
#[derive(Debug)]
pub struct UsageTable {
    clock: Arc<dyn Clock>,
    offline_time: OfflineTime,
    max_entries: usize,
    header_loaded: bool,
    master_generation: Option<i64>,
    generations: Vec<i64>,
    bound: Vec<Option<u32>>,
    old_entries: HashMap<Vec<u8>, OldUsageEntry>,
}

impl UsageTable {
    pub fn new(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self {
            clock,
            offline_time: OfflineTime::default(),
            max_entries,
            header_loaded: false,
            master_generation: None,
            generations: Vec::new(),
            bound: Vec::new(),
            old_entries: HashMap::new(),
        }
    }

    /// Rollback-corrected wall time.
    pub fn now(&mut self) -> i64 {
        self.offline_time.now(self.clock.as_ref())
    }

    #[must_use]
    pub fn offline_time(&self) -> OfflineTime {
        self.offline_time
    }

    pub fn set_offline_time(&mut self, time: OfflineTime) {
        self.offline_time = time;
    }

    /// The master generation, if one has been created or restored.
    ///
    /// Integrators persist this in storage that cannot be rolled back and
    /// feed it to [`restore_master_generation`](Self::restore_master_generation)
    /// after a restart.
    #[must_use]
    pub fn master_generation(&self) -> Option<i64> {
        self.master_generation
    }

    pub fn restore_master_generation(&mut self, generation: i64) {
        self.master_generation = Some(generation);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    #[must_use]
    pub fn header_loaded(&self) -> bool {
        self.header_loaded
    }

    /// Session currently holding slot `index`.
    #[must_use]
    pub fn bound_session(&self, index: u32) -> Option<u32> {
        self.bound.get(index as usize).copied().flatten()
    }

    fn increment_generation(&mut self) {
        if let Some(master) = self.master_generation.as_mut() {
            *master += 1;
        }
    }

    fn master(&self) -> Result<i64> {
        self.master_generation
            .ok_or_else(|| Error::UnknownFailure("master generation not available".to_string()))
    }

    fn save_header(&self, key: &[u8], out: &mut [u8]) -> Result<usize> {
        let size = signed_header_size(self.generations.len());
        let mut clear = vec![0u8; ENCRYPTION_OFFSET];
        clear.extend_from_slice(HEADER_MAGIC);
        clear.extend_from_slice(&self.master()?.to_be_bytes());
        clear.extend_from_slice(&(self.generations.len() as u64).to_be_bytes());
        for generation in &self.generations {
            clear.extend_from_slice(&generation.to_be_bytes());
        }
        clear.resize(size, 0);
        seal(key, &clear, &mut out[..size])?;
        Ok(size)
    }

    /// Start an empty table. Fails while any slot is bound to a session.
    pub fn create_header(&mut self, key: &[u8], out: &mut [u8]) -> Result<usize> {
        let required = signed_header_size(0);
        if out.len() < required {
            return Err(Error::ShortBuffer { required });
        }
        if let Some(index) = self.bound.iter().position(Option::is_some) {
            error!("Cannot create usage table header: entry {} in use", index);
            return Err(Error::InvalidSession(index as u32));
        }
        if self.master_generation.is_none() {
            let mut seed = [0u8; 8];
            random_bytes(&mut seed);
            self.master_generation = Some((u64::from_be_bytes(seed) >> 2) as i64);
        }
        self.bound.clear();
        self.generations.clear();
        self.header_loaded = true;
        self.save_header(key, out)
    }

    /// Restore a header produced by an earlier [`update_entry`](Self::update_entry).
    pub fn load_header(&mut self, key: &[u8], data: &[u8]) -> Result<LoadStatus> {
        let expected = self.master()?;
        if data.len() < signed_header_size(0) {
            return Err(Error::ShortBuffer {
                required: signed_header_size(0),
            });
        }
        if self.max_entries > 0 && data.len() > signed_header_size(self.max_entries) {
            error!(
                "Usage table header too big: {} > {}",
                data.len(),
                signed_header_size(self.max_entries)
            );
            return Err(Error::InsufficientResources);
        }

        let payload = unseal(key, data, HEADER_MAGIC)?;
        let mut reader = Reader::new(&payload);
        let stored_master = reader.i64()?;
        let count = usize::try_from(reader.i64()?)
            .map_err(|_| Error::context("usage table header has a bad entry count"))?;
        let required = checked_header_size(count).ok_or_else(|| {
            error!("Usage table header claims {} entries", count);
            Error::InsufficientResources
        })?;
        if data.len() < required {
            return Err(Error::ShortBuffer { required });
        }
        let status = check_skew(stored_master, expected)?;
        let generations = (0..count)
            .map(|_| reader.i64())
            .collect::<Result<Vec<_>>>()?;

        self.bound = vec![None; count];
        self.generations = generations;
        self.header_loaded = true;
        Ok(status)
    }

    /// Allocate the next slot and bind it to `session`.
    pub fn create_new_entry(&mut self, session: u32) -> Result<UsageTableEntry> {
        if !self.header_loaded {
            return Err(Error::UnknownFailure("usage table header not loaded".to_string()));
        }
        let master = self.master()?;
        let index = self.generations.len();
        if self.max_entries > 0 && index >= self.max_entries {
            error!("Too many usage entries: {}/{}", index, self.max_entries);
            return Err(Error::InsufficientResources);
        }
        self.generations.push(master);
        self.bound.push(Some(session));
        self.increment_generation();
        debug!("Created usage entry {} for session {}", index, session);
        Ok(UsageTableEntry::new(index as u32, master))
    }

    /// Restore entry `index` from a saved blob and bind it to `session`.
    pub fn load_entry(
        &mut self,
        session: u32,
        index: u32,
        key: &[u8],
        data: &[u8],
    ) -> Result<(UsageTableEntry, LoadStatus)> {
        if !self.header_loaded {
            return Err(Error::UnknownFailure("usage table header not loaded".to_string()));
        }
        let slot = index as usize;
        if slot >= self.generations.len() {
            return Err(Error::UnknownFailure(format!("usage entry {} out of range", index)));
        }
        if self.bound[slot].is_some() {
            error!("Usage entry {} used by another session", index);
            return Err(Error::InvalidSession(index));
        }
        if self.max_entries > 0 && slot >= self.max_entries {
            return Err(Error::InsufficientResources);
        }

        let entry = UsageTableEntry::load(key, index, data)?;
        let status = check_skew(entry.generation(), self.generations[slot])?;
        self.bound[slot] = Some(session);
        Ok((entry, status))
    }

    /// Advance the entry and seal both the header and the entry.
    ///
    /// Returns the `(header, entry)` byte counts written.
    pub fn update_entry(
        &mut self,
        entry: &mut UsageTableEntry,
        key: &[u8],
        header_out: &mut [u8],
        entry_out: &mut [u8],
    ) -> Result<(usize, usize)> {
        let header_size = signed_header_size(self.generations.len());
        let entry_size = signed_entry_size();
        if entry_out.len() < entry_size {
            return Err(Error::ShortBuffer {
                required: entry_size,
            });
        }
        if header_out.len() < header_size {
            return Err(Error::ShortBuffer {
                required: header_size,
            });
        }
        let slot = entry.index() as usize;
        if slot >= self.generations.len() {
            return Err(Error::UnknownFailure(format!("usage entry {} out of range", slot)));
        }

        entry.update_and_increment(self);
        self.generations[slot] = entry.generation();
        entry.save(key, entry_out)?;
        self.save_header(key, header_out)?;
        Ok((header_size, entry_size))
    }

    /// Relocate an entry to an unbound slot.
    pub fn move_entry(&mut self, entry: &mut UsageTableEntry, new_index: u32) -> Result<()> {
        let target = new_index as usize;
        if target >= self.generations.len() {
            return Err(Error::context(format!(
                "move target {} beyond table of {}",
                new_index,
                self.generations.len()
            )));
        }
        if self.bound[target].is_some() {
            return Err(Error::EntryInUse);
        }
        let master = self.master()?;
        let source = entry.index() as usize;
        self.bound[target] = self.bound.get_mut(source).and_then(Option::take);
        entry.data.index = new_index;
        entry.data.generation = master;
        self.generations[target] = master;
        self.increment_generation();
        debug!("Moved usage entry {} -> {}", source, new_index);
        Ok(())
    }

    /// Truncate the table to `new_size` entries and seal the new header.
    pub fn shrink_header(&mut self, new_size: u32, key: &[u8], out: &mut [u8]) -> Result<usize> {
        let new_size = new_size as usize;
        if new_size > self.generations.len() {
            return Err(Error::UnknownFailure(format!(
                "cannot shrink table of {} to {}",
                self.generations.len(),
                new_size
            )));
        }
        let required = signed_header_size(new_size);
        if out.len() < required {
            return Err(Error::ShortBuffer { required });
        }
        if self.bound[new_size..].iter().any(Option::is_some) {
            return Err(Error::EntryInUse);
        }
        self.generations.truncate(new_size);
        self.bound.truncate(new_size);
        self.increment_generation();
        self.save_header(key, out)
    }

    /// Unbind a slot when its session closes.
    pub fn release_entry(&mut self, index: u32) {
        if let Some(slot) = self.bound.get_mut(index as usize) {
            *slot = None;
        }
    }

    /// Record a legacy entry, with times given relative to now.
    pub fn create_old_usage_entry(
        &mut self,
        times: OldEntryTimes,
        status: EntryStatus,
        mac_key_server: &[u8],
        mac_key_client: &[u8],
        pst: &[u8],
    ) -> Result<()> {
        if mac_key_server.len() != MAC_KEY_SIZE || mac_key_client.len() != MAC_KEY_SIZE {
            return Err(Error::context("legacy mac keys have bad size"));
        }
        let now = self.now();
        let mut entry = OldUsageEntry {
            time_of_license_received: now - times.since_license_received,
            time_of_first_decrypt: now - times.since_first_decrypt,
            time_of_last_decrypt: now - times.since_last_decrypt,
            status,
            mac_key_server: [0u8; MAC_KEY_SIZE],
            mac_key_client: [0u8; MAC_KEY_SIZE],
        };
        entry.mac_key_server.copy_from_slice(mac_key_server);
        entry.mac_key_client.copy_from_slice(mac_key_client);
        self.old_entries.insert(pst.to_vec(), entry);
        Ok(())
    }

    pub fn delete_old_usage_table(&mut self) {
        self.old_entries.clear();
    }
}

/// A parsed usage report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub signature: [u8; SHA1_DIGEST_LENGTH],
    pub status: EntryStatus,
    pub clock_security_level: u8,
    pub seconds_since_license_received: i64,
    pub seconds_since_first_decrypt: i64,
    pub seconds_since_last_decrypt: i64,
    pub pst: Vec<u8>,
}

impl UsageReport {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < REPORT_FIXED_SIZE {
            return Err(Error::ShortBuffer {
                required: REPORT_FIXED_SIZE,
            });
        }
        let pst_len = data[22] as usize;
        if data.len() < report_size(pst_len) {
            return Err(Error::ShortBuffer {
                required: report_size(pst_len),
            });
        }
        let mut reader = Reader::new(&data[24..]);
        let mut signature = [0u8; SHA1_DIGEST_LENGTH];
        signature.copy_from_slice(&data[..SHA1_DIGEST_LENGTH]);
        Ok(Self {
            signature,
            status: EntryStatus::try_from(data[20])?,
            clock_security_level: data[21],
            seconds_since_license_received: reader.i64()?,
            seconds_since_first_decrypt: reader.i64()?,
            seconds_since_last_decrypt: reader.i64()?,
            pst: data[REPORT_FIXED_SIZE..report_size(pst_len)].to_vec(),
        })
    }

    /// Check the report signature with the client mac key.
    pub fn verify(data: &[u8], mac_key_client: &[u8]) -> Result<()> {
        let report = Self::parse(data)?;
        let len = report_size(report.pst.len());
        let mut mac = <HmacSha1 as Mac>::new_from_slice(mac_key_client)
            .map_err(|_| Error::SignatureFailure)?;
        mac.update(&data[SHA1_DIGEST_LENGTH..len]);
        mac.verify_slice(&report.signature)
            .map_err(|_| Error::SignatureFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    const KEY: [u8; 16] = [0x5A; 16];

    fn table(clock: &ManualClock) -> UsageTable {
        let mut table = UsageTable::new(Arc::new(clock.clone()), 0);
        let mut header = vec![0u8; signed_header_size(0)];
        table.create_header(&KEY, &mut header).expect("header");
        table
    }

    fn save(table: &mut UsageTable, entry: &mut UsageTableEntry) -> (Vec<u8>, Vec<u8>) {
        let mut header = vec![0u8; signed_header_size(table.len())];
        let mut blob = vec![0u8; signed_entry_size()];
        table
            .update_entry(entry, &KEY, &mut header, &mut blob)
            .expect("update");
        (header, blob)
    }

    #[test]
    fn sizes_are_block_aligned() {
        assert_eq!(signed_entry_size() % 16, 0);
        assert_eq!(signed_header_size(0) % 16, 0);
        assert_eq!(signed_header_size(3) % 16, 0);
        assert!(signed_header_size(3) >= HEADER_FIXED_SIZE + 24);
    }

    fn sealed_header(master: i64, count: i64) -> Vec<u8> {
        let size = signed_header_size(0);
        let mut clear = vec![0u8; ENCRYPTION_OFFSET];
        clear.extend_from_slice(HEADER_MAGIC);
        clear.extend_from_slice(&master.to_be_bytes());
        clear.extend_from_slice(&count.to_be_bytes());
        clear.resize(size, 0);
        let mut out = vec![0u8; size];
        seal(&KEY, &clear, &mut out).expect("seal");
        out
    }

    #[test]
    fn header_entry_count_is_bounded() {
        let clock = ManualClock::new(1_000);
        let mut table = table(&clock);
        let master = table.master_generation().expect("master");

        assert!(matches!(
            table.load_header(&KEY, &sealed_header(master, -1)),
            Err(Error::InvalidContext(_))
        ));
        assert!(matches!(
            table.load_header(&KEY, &sealed_header(master, i64::MAX)),
            Err(Error::InsufficientResources) | Err(Error::InvalidContext(_))
        ));
        assert!(matches!(
            table.load_header(&KEY, &sealed_header(master, 2)),
            Err(Error::ShortBuffer { required }) if required == signed_header_size(2)
        ));
        assert_eq!(
            table.load_header(&KEY, &sealed_header(master, 0)).expect("empty header"),
            LoadStatus::Loaded
        );
        assert_eq!(checked_header_size(3), Some(signed_header_size(3)));
    }

    #[test]
    fn entry_round_trips_through_blob() {
        let clock = ManualClock::new(1_000);
        let mut table = table(&clock);
        let mut entry = table.create_new_entry(1).expect("entry");
        entry.set_pst(b"pst-1", table.now()).expect("pst");
        entry.set_mac_keys(&[1u8; 32], &[2u8; 32]).expect("keys");
        let (_, blob) = save(&mut table, &mut entry);
        table.release_entry(0);

        let (loaded, status) = table.load_entry(7, 0, &KEY, &blob).expect("load");
        assert_eq!(status, LoadStatus::Loaded);
        assert_eq!(loaded.pst(), b"pst-1");
        assert!(loaded.verify_mac_keys(&[1u8; 32], &[2u8; 32]));
        assert_eq!(table.bound_session(0), Some(7));
    }

    #[test]
    fn tampered_blob_fails_signature() {
        let clock = ManualClock::new(1_000);
        let mut table = table(&clock);
        let mut entry = table.create_new_entry(1).expect("entry");
        let (_, mut blob) = save(&mut table, &mut entry);
        table.release_entry(0);
        blob[100] ^= 1;
        assert!(matches!(
            table.load_entry(1, 0, &KEY, &blob),
            Err(Error::SignatureFailure)
        ));
        assert!(matches!(
            table.load_entry(1, 0, &KEY, &blob[..100]),
            Err(Error::ShortBuffer { .. })
        ));
    }

    #[test]
    fn stale_entry_generation_is_classified() {
        let clock = ManualClock::new(1_000);
        let mut table = table(&clock);
        let mut entry = table.create_new_entry(1).expect("entry");
        let (_, old_blob) = save(&mut table, &mut entry);
        let (_, _) = save(&mut table, &mut entry);
        table.release_entry(0);

        let (_, status) = table.load_entry(1, 0, &KEY, &old_blob).expect("one behind");
        assert_eq!(status, LoadStatus::GenerationSkewWarning);
        table.release_entry(0);

        let (mut entry, _) = table.load_entry(1, 0, &KEY, &old_blob).expect("reload");
        save(&mut table, &mut entry);
        save(&mut table, &mut entry);
        table.release_entry(0);
        assert!(matches!(
            table.load_entry(1, 0, &KEY, &old_blob),
            Err(Error::GenerationSkew)
        ));
    }

    #[test]
    fn header_generation_skew() {
        let clock = ManualClock::new(1_000);
        let mut table = table(&clock);
        let mut entry = table.create_new_entry(1).expect("entry");
        let (header, _) = save(&mut table, &mut entry);

        assert_eq!(table.load_header(&KEY, &header).expect("current"), LoadStatus::Loaded);

        table.increment_generation();
        assert_eq!(
            table.load_header(&KEY, &header).expect("one behind"),
            LoadStatus::GenerationSkewWarning
        );

        table.increment_generation();
        assert!(matches!(
            table.load_header(&KEY, &header),
            Err(Error::GenerationSkew)
        ));
    }

    #[test]
    fn move_and_shrink_respect_bound_slots() {
        let clock = ManualClock::new(1_000);
        let mut table = table(&clock);
        let mut first = table.create_new_entry(1).expect("entry");
        let _second = table.create_new_entry(2).expect("entry");

        assert!(matches!(table.move_entry(&mut first, 1), Err(Error::EntryInUse)));
        assert!(matches!(table.move_entry(&mut first, 5), Err(Error::InvalidContext(_))));

        let mut header = vec![0u8; signed_header_size(2)];
        assert!(matches!(
            table.shrink_header(1, &KEY, &mut header),
            Err(Error::EntryInUse)
        ));

        table.release_entry(1);
        table.move_entry(&mut first, 1).expect("move");
        assert_eq!(first.index(), 1);
        assert_eq!(table.bound_session(0), None);
        assert_eq!(table.bound_session(1), Some(1));

        assert!(matches!(
            table.shrink_header(1, &KEY, &mut header),
            Err(Error::EntryInUse)
        ));
        assert_eq!(table.shrink_header(2, &KEY, &mut header).expect("no-op shrink"), signed_header_size(2));
    }

    #[test]
    fn report_requires_update_and_tracks_status() {
        let clock = ManualClock::new(1_000);
        let mut table = table(&clock);
        let mut entry = table.create_new_entry(1).expect("entry");
        entry.set_pst(b"offline", table.now()).expect("pst");
        entry.set_mac_keys(&[1u8; 32], &[9u8; 32]).expect("keys");

        let mut report = vec![0u8; report_size(7)];
        assert!(matches!(
            entry.report_usage(&mut table, b"offline", &mut report),
            Err(Error::EntryNeedsUpdate)
        ));

        clock.advance(Duration::from_secs(10));
        entry.check_for_use(&mut table).expect("use");
        assert_eq!(entry.status(), EntryStatus::Active);
        assert!(matches!(
            entry.report_usage(&mut table, b"offline", &mut report),
            Err(Error::EntryNeedsUpdate)
        ));
        save(&mut table, &mut entry);

        clock.advance(Duration::from_secs(5));
        assert!(matches!(
            entry.report_usage(&mut table, b"other!!", &mut report),
            Err(Error::WrongPst)
        ));
        assert!(matches!(
            entry.report_usage(&mut table, b"offline", &mut report[..10]),
            Err(Error::ShortBuffer { required: 55 })
        ));
        let len = entry.report_usage(&mut table, b"offline", &mut report).expect("report");
        UsageReport::verify(&report[..len], &[9u8; 32]).expect("signed");
        let parsed = UsageReport::parse(&report[..len]).expect("parse");
        assert_eq!(parsed.status, EntryStatus::Active);
        assert_eq!(parsed.seconds_since_license_received, 15);
        assert_eq!(parsed.seconds_since_first_decrypt, 5);
        assert_eq!(parsed.pst, b"offline");

        entry.deactivate(&mut table);
        entry.deactivate(&mut table);
        assert_eq!(entry.status(), EntryStatus::InactiveUsed);
        assert!(matches!(entry.check_for_use(&mut table), Err(Error::LicenseInactive)));
    }

    #[test]
    fn header_is_required_for_new_entries() {
        let clock = ManualClock::new(0);
        let mut table = UsageTable::new(Arc::new(clock), 1);
        assert!(table.create_new_entry(1).is_err());
        let mut header = vec![0u8; signed_header_size(0)];
        table.create_header(&KEY, &mut header).expect("header");
        table.create_new_entry(1).expect("first");
        assert!(matches!(
            table.create_new_entry(2),
            Err(Error::InsufficientResources)
        ));
        assert!(matches!(
            table.create_header(&KEY, &mut header),
            Err(Error::InvalidSession(0))
        ));
    }

    #[test]
    fn legacy_entries_copy_by_pst() {
        let clock = ManualClock::new(5_000);
        let mut table = table(&clock);
        table
            .create_old_usage_entry(
                OldEntryTimes {
                    since_license_received: 100,
                    since_first_decrypt: 50,
                    since_last_decrypt: 10,
                },
                EntryStatus::Active,
                &[3u8; 32],
                &[4u8; 32],
                b"legacy",
            )
            .expect("old entry");

        let mut entry = table.create_new_entry(1).expect("entry");
        assert!(matches!(
            entry.copy_old_usage_entry(&table, b"missing"),
            Err(Error::WrongPst)
        ));
        entry.copy_old_usage_entry(&table, b"legacy").expect("copy");
        assert_eq!(entry.status(), EntryStatus::Active);
        assert_eq!(entry.pst(), b"legacy");
        assert!(entry.verify_mac_keys(&[3u8; 32], &[4u8; 32]));

        table.delete_old_usage_table();
        assert!(entry.copy_old_usage_entry(&table, b"legacy").is_err());
    }
}
