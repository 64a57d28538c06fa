use hex::ToHex;
use sha2::Digest;

pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTooLarge {
    pub observed_bytes: u64,
    pub limit_bytes: u64,
}

impl std::fmt::Display for FileTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "file size {} bytes exceeds limit of {} bytes",
            self.observed_bytes, self.limit_bytes
        )
    }
}

impl std::error::Error for FileTooLarge {}

/// Rejects a request whose declared length already exceeds the global ceiling.
pub fn check_content_length(
    content_length: Option<u64>,
    global_max_bytes: u64,
) -> Result<(), FileTooLarge> {
    match content_length {
        Some(len) if len > global_max_bytes => Err(FileTooLarge {
            observed_bytes: len,
            limit_bytes: global_max_bytes,
        }),
        _ => Ok(()),
    }
}

/// Incremental SHA-256 + byte counter with a hard ceiling.
///
/// The ceiling is checked after every chunk so callers can stop reading the
/// body as soon as [`HashingStream::update`] fails.
#[derive(Debug)]
pub struct HashingStream {
    hasher: sha2::Sha256,
    size_bytes: u64,
    limit_bytes: u64,
    buffer: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedPayload {
    pub sha256_hex: String,
    pub size_bytes: u64,
    pub bytes: Vec<u8>,
}

impl HashingStream {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            hasher: sha2::Sha256::new(),
            size_bytes: 0,
            limit_bytes,
            buffer: Vec::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) -> Result<(), FileTooLarge> {
        self.hasher.update(chunk);
        self.size_bytes = self.size_bytes.saturating_add(chunk.len() as u64);

        if self.size_bytes > self.limit_bytes {
            return Err(FileTooLarge {
                observed_bytes: self.size_bytes,
                limit_bytes: self.limit_bytes,
            });
        }

        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn finish(self) -> StreamedPayload {
        StreamedPayload {
            sha256_hex: self.hasher.finalize().encode_hex::<String>(),
            size_bytes: self.size_bytes,
            bytes: self.buffer,
        }
    }
}
