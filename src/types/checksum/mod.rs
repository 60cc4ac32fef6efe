#![forbid(unsafe_code)]

/// Incremental checksum over a sequence of byte slices.
pub trait Checksum {
    /// Clears any bytes absorbed so far.
    fn reset(&mut self);
    /// Absorbs `bytes`.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything absorbed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) checksum backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of one log frame, binding the payload to its group and sequence.
pub fn frame_crc32(group: u32, seq: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&group.to_be_bytes());
    hasher.update(&seq.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Checksum of a standalone byte slice.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut c = Crc32Fast::default();
    c.update(bytes);
    c.finalize()
}
