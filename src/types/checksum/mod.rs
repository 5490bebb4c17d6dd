#![forbid(unsafe_code)]

//! Checksums guarding commit-log frames.

/// Incremental checksum over a byte stream.
pub trait Checksum {
    /// Feeds more bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) backed by `crc32fast`.
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
    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a commit-log frame. The declared payload length is mixed in so a
/// frame whose length prefix was torn cannot validate against a shorter payload.
pub fn frame_crc32(payload_len: u32, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&payload_len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_crc_depends_on_length_and_payload() {
        let payload = b"{\"txn\":1}";
        let base = frame_crc32(payload.len() as u32, payload);
        assert_eq!(base, frame_crc32(payload.len() as u32, payload));
        assert_ne!(base, frame_crc32(payload.len() as u32 + 1, payload));
        assert_ne!(base, frame_crc32(payload.len() as u32, b"{\"txn\":2}"));
    }
}
