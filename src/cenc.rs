//! Common-encryption sample decryption.
//!
//! All routines decrypt in place: the caller copies the ciphertext into the
//! destination window first. CBC snapshots every ciphertext block before
//! overwriting it, so a chain value is never read from plaintext.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;

use crate::crypto::{ctr128_inc64, AES_BLOCK_SIZE};
use crate::error::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Subsample flag: first subsample of a frame.
pub const FIRST_SUBSAMPLE: u8 = 0x1;
/// Subsample flag: last subsample of a frame.
pub const LAST_SUBSAMPLE: u8 = 0x2;

/// Kind of memory decrypted output is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    /// Host-readable memory.
    Clear,
    /// Protected memory, addressed by handle and offset.
    Secure,
    /// Straight to the display; output is dropped here.
    Direct,
}

/// Cipher mode recorded when a key is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Ctr,
    Cbc,
}

/// Where decrypted output goes.
#[derive(Debug)]
pub enum Destination<'a> {
    Clear(&'a mut [u8]),
    Secure { buffer: &'a mut [u8], offset: usize },
    Direct,
}

impl<'a> Destination<'a> {
    #[must_use]
    pub fn buffer_type(&self) -> BufferType {
        match self {
            Destination::Clear(_) => BufferType::Clear,
            Destination::Secure { .. } => BufferType::Secure,
            Destination::Direct => BufferType::Direct,
        }
    }

    /// Check the destination can take `data_length` bytes and return the
    /// window to write them to. Direct destinations have no window.
    pub(crate) fn window(
        &mut self,
        data_length: usize,
        max_output_size: usize,
    ) -> Result<Option<&mut [u8]>> {
        let max_length = match self {
            Destination::Clear(buffer) => buffer.len(),
            Destination::Secure { buffer, offset } => buffer
                .len()
                .checked_sub(*offset)
                .ok_or_else(|| Error::context("secure offset beyond buffer"))?,
            Destination::Direct => 0,
        };
        if max_output_size > 0 && (max_output_size < max_length || max_output_size < data_length) {
            error!(
                "Output too large: {} (buffer {}), limit {}",
                data_length, max_length, max_output_size
            );
            return Err(Error::OutputTooLarge);
        }
        match self {
            Destination::Direct => Ok(None),
            _ if max_length < data_length => Err(Error::ShortBuffer {
                required: data_length,
            }),
            Destination::Clear(buffer) => Ok(Some(&mut buffer[..data_length])),
            Destination::Secure { buffer, offset } => {
                Ok(Some(&mut buffer[*offset..*offset + data_length]))
            }
        }
    }
}

/// Encrypt/skip block counts for pattern encryption. `skip == 0` means
/// every block is encrypted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pattern {
    pub encrypt: usize,
    pub skip: usize,
}

/// Position in a pattern; starts at zero for every subsample.
struct PatternCursor {
    pattern: Pattern,
    offset: usize,
}

impl PatternCursor {
    fn new(pattern: Pattern) -> Self {
        Self { pattern, offset: 0 }
    }

    /// Whether the next block is left in the clear.
    fn next_is_skip(&mut self) -> bool {
        let length = self.pattern.encrypt + self.pattern.skip;
        if length == 0 {
            return false;
        }
        let skip = self.offset >= self.pattern.encrypt;
        self.offset = (self.offset + 1) % length;
        skip
    }
}

/// One subsample handed to [`crate::engine::Engine::decrypt_cenc`].
#[derive(Debug, Clone, Copy)]
pub struct CencSample<'a> {
    pub data: &'a [u8],
    pub is_encrypted: bool,
    pub iv: [u8; AES_BLOCK_SIZE],
    /// Bytes of the current counter block already consumed (CTR only).
    pub block_offset: usize,
    pub pattern: Pattern,
    pub subsample_flags: u8,
}

fn cipher(key: &[u8]) -> Result<Aes128> {
    Aes128::new_from_slice(key)
        .map_err(|_| Error::DecryptFailed(format!("content key has wrong size: {}", key.len())))
}

/// AES-128-CBC with an optional pattern. Trailing partial blocks and skipped
/// blocks stay as they are.
pub fn decrypt_cbc(key: &[u8], iv: &[u8; AES_BLOCK_SIZE], pattern: Pattern, data: &mut [u8]) -> Result<()> {
    let aes = cipher(key)?;
    let mut cursor = PatternCursor::new(pattern);
    let mut chain = *iv;

    for block in data.chunks_mut(AES_BLOCK_SIZE) {
        if cursor.next_is_skip() || block.len() < AES_BLOCK_SIZE {
            continue;
        }
        let mut next_chain = [0u8; AES_BLOCK_SIZE];
        next_chain.copy_from_slice(block);

        let mut decrypted = aes::Block::clone_from_slice(block);
        aes.decrypt_block(&mut decrypted);
        for ((out, plain), prev) in block.iter_mut().zip(decrypted.iter()).zip(chain.iter()) {
            *out = plain ^ prev;
        }
        chain = next_chain;
    }
    Ok(())
}

/// AES-128-CTR with an encrypt/skip pattern, one counter block at a time.
pub fn decrypt_ctr_pattern(
    key: &[u8],
    iv: &[u8; AES_BLOCK_SIZE],
    block_offset: usize,
    pattern: Pattern,
    data: &mut [u8],
) -> Result<()> {
    if block_offset >= AES_BLOCK_SIZE {
        return Err(Error::context(format!("block offset {} out of range", block_offset)));
    }
    let aes = cipher(key)?;
    let mut cursor = PatternCursor::new(pattern);
    let mut counter = *iv;
    let mut block_offset = block_offset;
    let mut l = 0;

    while l < data.len() {
        let size = (data.len() - l).min(AES_BLOCK_SIZE - block_offset);
        if !cursor.next_is_skip() {
            let mut keystream = aes::Block::from(counter);
            aes.encrypt_block(&mut keystream);
            for (out, ks) in data[l..l + size]
                .iter_mut()
                .zip(keystream[block_offset..].iter())
            {
                *out ^= ks;
            }
            ctr128_inc64(&mut counter);
        }
        l += size;
        block_offset = 0;
    }
    Ok(())
}

/// AES-128-CTR where only the low 64 bits of the counter advance.
///
/// Runs are handed to the stream cipher in chunks that never cross a wrap
/// of the low half; at a wrap the counter restarts at `high || 0`.
pub fn decrypt_ctr(key: &[u8], iv: &[u8; AES_BLOCK_SIZE], block_offset: usize, data: &mut [u8]) -> Result<()> {
    if block_offset >= AES_BLOCK_SIZE {
        return Err(Error::context(format!("block offset {} out of range", block_offset)));
    }
    let mut counter = *iv;
    let mut l = 0;

    if block_offset > 0 {
        let aes = cipher(key)?;
        let mut keystream = aes::Block::from(counter);
        aes.encrypt_block(&mut keystream);
        let size = data.len().min(AES_BLOCK_SIZE - block_offset);
        for (out, ks) in data[..size].iter_mut().zip(keystream[block_offset..].iter()) {
            *out ^= ks;
        }
        ctr128_inc64(&mut counter);
        l = size;
    }

    while l < data.len() {
        let remaining = data.len() - l;
        let length = if counter[8] == 0xFF {
            let mut low = [0u8; 8];
            low.copy_from_slice(&counter[8..]);
            let blocks_before_wrap = u128::from(u64::MAX - u64::from_be_bytes(low)) + 1;
            let bytes_before_wrap = blocks_before_wrap * AES_BLOCK_SIZE as u128;
            bytes_before_wrap.min(remaining as u128) as usize
        } else {
            remaining
        };

        let mut ctr = Aes128Ctr::new_from_slices(key, &counter)
            .map_err(|_| Error::DecryptFailed(format!("content key has wrong size: {}", key.len())))?;
        ctr.try_apply_keystream(&mut data[l..l + length])
            .map_err(|e| Error::DecryptFailed(format!("CTR keystream exhausted: {}", e)))?;
        l += length;

        if l < data.len() {
            counter[8..].fill(0);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashFailure {
    NotAllowed,
    BadFrame(u32),
}

/// Running CRC-32 over decrypted frames, for conformance testing.
#[derive(Debug, Clone, Default)]
pub struct DecryptHash {
    computing: bool,
    frame_number: u32,
    expected: u32,
    hasher: crc32fast::Hasher,
    failure: Option<HashFailure>,
}

impl DecryptHash {
    /// Arm verification of `frame_number` against a 4-byte little-endian CRC.
    pub fn set_expected(&mut self, frame_number: u32, hash: &[u8]) -> Result<()> {
        if hash.len() < 4 {
            return Err(Error::ShortBuffer { required: 4 });
        }
        if hash.len() > 4 {
            return Err(Error::BufferTooLarge);
        }
        self.computing = true;
        self.frame_number = frame_number;
        self.expected = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        Ok(())
    }

    #[must_use]
    pub fn is_computing(&self) -> bool {
        self.computing
    }

    /// Fold one subsample of output into the running hash.
    pub fn update(&mut self, allowed: bool, output: &[u8], subsample_flags: u8) {
        if !self.computing {
            return;
        }
        if !allowed {
            error!("Decrypt hash requested but the key does not allow it");
            self.failure = Some(HashFailure::NotAllowed);
            self.computing = false;
            self.frame_number = 0;
            return;
        }
        if subsample_flags & FIRST_SUBSAMPLE != 0 {
            self.hasher = crc32fast::Hasher::new();
        }
        self.hasher.update(output);
        if subsample_flags & LAST_SUBSAMPLE != 0 {
            let actual = std::mem::take(&mut self.hasher).finalize();
            if actual != self.expected {
                error!(
                    "CRC for frame {} is {:08x}, should be {:08x}",
                    self.frame_number, actual, self.expected
                );
                if self.failure.is_none() {
                    self.failure = Some(HashFailure::BadFrame(self.frame_number));
                }
            }
            self.computing = false;
        }
    }

    /// The first failure seen, if any.
    pub fn error_code(&self) -> Result<()> {
        match self.failure {
            None => Ok(()),
            Some(HashFailure::NotAllowed) => Err(Error::UnknownFailure(
                "decrypt hash not allowed by key".to_string(),
            )),
            Some(HashFailure::BadFrame(frame)) => Err(Error::BadHash(frame)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes128_cbc_encrypt;

    const KEY: [u8; 16] = [0x3C; 16];
    const IV: [u8; 16] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0, 0, 0, 0, 0, 0, 0, 1,
    ];

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn cbc_round_trips_with_partial_tail() {
        for len in [16, 64, 64 + 5] {
            let plain = plaintext(len);
            let aligned = len / 16 * 16;
            let mut data = aes128_cbc_encrypt(&KEY, &IV, &plain[..aligned]).expect("encrypt");
            data.extend_from_slice(&plain[aligned..]);

            decrypt_cbc(&KEY, &IV, Pattern::default(), &mut data).expect("decrypt");
            assert_eq!(data, plain, "length {}", len);
        }
    }

    #[test]
    fn cbc_pattern_chains_only_encrypted_blocks() {
        let plain = plaintext(48);
        let mut encrypted_blocks = plain[..16].to_vec();
        encrypted_blocks.extend_from_slice(&plain[32..]);
        let encrypted = aes128_cbc_encrypt(&KEY, &IV, &encrypted_blocks).expect("encrypt");

        let mut data = encrypted[..16].to_vec();
        data.extend_from_slice(&plain[16..32]);
        data.extend_from_slice(&encrypted[16..]);

        let pattern = Pattern { encrypt: 1, skip: 1 };
        decrypt_cbc(&KEY, &IV, pattern, &mut data).expect("decrypt");
        assert_eq!(data, plain);
    }

    #[test]
    fn ctr_round_trips() {
        for len in [16, 64, 64 + 5] {
            let plain = plaintext(len);
            let mut data = plain.clone();
            decrypt_ctr(&KEY, &IV, 0, &mut data).expect("encrypt");
            assert_ne!(data, plain);
            decrypt_ctr(&KEY, &IV, 0, &mut data).expect("decrypt");
            assert_eq!(data, plain, "length {}", len);
        }
    }

    #[test]
    fn ctr_matches_blockwise_emulation_across_wrap() {
        let mut iv = IV;
        iv[8..].copy_from_slice(&[0xFF; 8]);
        iv[15] = 0xFE;

        for offset in [0, 5] {
            let plain = plaintext(70);
            let mut stream = plain.clone();
            decrypt_ctr(&KEY, &iv, offset, &mut stream).expect("ctr");
            let mut emulated = plain.clone();
            decrypt_ctr_pattern(&KEY, &iv, offset, Pattern::default(), &mut emulated)
                .expect("emulated");
            assert_eq!(stream, emulated, "offset {}", offset);
        }
    }

    #[test]
    fn ctr_wrap_keeps_high_half() {
        let mut iv = IV;
        iv[8..].copy_from_slice(&[0xFF; 8]);

        let mut data = vec![0u8; 32];
        decrypt_ctr(&KEY, &iv, 0, &mut data).expect("ctr");

        let aes = Aes128::new_from_slice(&KEY).expect("key");
        let mut wrapped = IV;
        wrapped[8..].fill(0);
        let mut expected = aes::Block::from(wrapped);
        aes.encrypt_block(&mut expected);
        assert_eq!(&data[16..], expected.as_slice());
    }

    #[test]
    fn ctr_pattern_skips_clear_blocks() {
        let plain = plaintext(64);
        let mut data = plain.clone();
        let pattern = Pattern { encrypt: 1, skip: 1 };
        decrypt_ctr_pattern(&KEY, &IV, 0, pattern, &mut data).expect("encrypt");
        assert_ne!(&data[..16], &plain[..16]);
        assert_eq!(&data[16..32], &plain[16..32]);
        assert_ne!(&data[32..48], &plain[32..48]);
        assert_eq!(&data[48..], &plain[48..]);

        let mut whole = plain.clone();
        decrypt_ctr(&KEY, &IV, 0, &mut whole).expect("ctr");
        // Block 2 uses the second counter value, as skipped blocks do not
        // consume keystream.
        assert_eq!(&data[32..48], &whole[16..32]);
    }

    #[test]
    fn destination_checks_sizes() {
        let mut small = [0u8; 8];
        let mut dest = Destination::Clear(&mut small);
        assert!(matches!(dest.window(16, 0), Err(Error::ShortBuffer { required: 16 })));

        let mut big = [0u8; 64];
        let mut dest = Destination::Secure {
            buffer: &mut big,
            offset: 16,
        };
        assert_eq!(dest.window(32, 0).expect("fits").map(|w| w.len()), Some(32));
        assert!(matches!(dest.window(32, 40), Err(Error::OutputTooLarge)));

        let mut dest = Destination::Direct;
        assert!(dest.window(1024, 0).expect("direct").is_none());
    }

    #[test]
    fn decrypt_hash_reports_first_bad_frame() {
        let frame = b"frame-bytes";
        let crc = crc32fast::hash(frame).to_le_bytes();

        let mut hash = DecryptHash::default();
        assert!(matches!(hash.set_expected(1, &crc[..3]), Err(Error::ShortBuffer { .. })));
        hash.set_expected(1, &crc).expect("armed");
        hash.update(true, &frame[..5], FIRST_SUBSAMPLE);
        hash.update(true, &frame[5..], LAST_SUBSAMPLE);
        hash.error_code().expect("matches");

        let mut reversed = crc;
        reversed.reverse();
        assert_ne!(reversed, crc);
        let mut swapped = DecryptHash::default();
        swapped.set_expected(1, &reversed).expect("armed");
        swapped.update(true, frame, FIRST_SUBSAMPLE | LAST_SUBSAMPLE);
        assert!(matches!(swapped.error_code(), Err(Error::BadHash(1))));

        hash.set_expected(2, &[0, 0, 0, 0]).expect("armed");
        hash.update(true, frame, FIRST_SUBSAMPLE | LAST_SUBSAMPLE);
        hash.set_expected(3, &[0, 0, 0, 0]).expect("armed");
        hash.update(true, frame, FIRST_SUBSAMPLE | LAST_SUBSAMPLE);
        assert!(matches!(hash.error_code(), Err(Error::BadHash(2))));
    }
}
