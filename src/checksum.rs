//! Upload checksums.
//!
//! The engine verifies uploads with SHA-256 digests: the whole file before
//! finalizing, and - when resuming - the prefix that the server already
//! holds, to detect a local file that changed under a partial upload. Both
//! digests come out of a single read pass.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Read size per hashing step.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Digests of a local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChecksums {
    /// Lowercase hex SHA-256 of the whole file.
    pub sha256: String,
    /// File size in bytes at hashing time.
    pub size: u64,
    /// Digest of `file[0..prefix]` when a prefix was requested and the file
    /// is at least that long; `None` otherwise.
    pub prefix_sha256: Option<String>,
}

/// Hashes a file, optionally capturing the digest of its first `prefix`
/// bytes on the way.
///
/// A requested prefix longer than the file leaves `prefix_sha256` empty,
/// which resumption code treats as a divergent partial upload.
///
/// # Errors
///
/// Returns any I/O error from opening or reading the file.
pub async fn checksum_file(path: &Path, prefix: Option<u64>) -> io::Result<FileChecksums> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut prefix_sha256 = None;
    let mut hashed: u64 = 0;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        let end = hashed + n as u64;
        match prefix {
            Some(p) if prefix_sha256.is_none() && p >= hashed && p <= end => {
                let split = usize::try_from(p - hashed).unwrap_or(n);
                hasher.update(&chunk[..split]);
                prefix_sha256 = Some(hex::encode(hasher.clone().finalize()));
                hasher.update(&chunk[split..]);
            }
            _ => hasher.update(chunk),
        }
        hashed = end;
    }

    let sha256 = hex::encode(hasher.finalize());
    // A zero-length prefix of an empty file never passes through the loop.
    if prefix == Some(0) && prefix_sha256.is_none() {
        prefix_sha256 = Some(sha256.clone());
    }

    Ok(FileChecksums {
        sha256,
        size: hashed,
        prefix_sha256,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn hex_sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn temp_file_with(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_whole_file_digest() {
        let file = temp_file_with(b"abc");
        let sums = checksum_file(file.path(), None).await.unwrap();
        assert_eq!(sums.sha256, hex_sha256(b"abc"));
        assert_eq!(sums.size, 3);
        assert_eq!(sums.prefix_sha256, None);
    }

    #[tokio::test]
    async fn test_prefix_digest() {
        let file = temp_file_with(b"abc");
        let sums = checksum_file(file.path(), Some(1)).await.unwrap();
        assert_eq!(sums.sha256, hex_sha256(b"abc"));
        assert_eq!(sums.prefix_sha256.as_deref(), Some(hex_sha256(b"a").as_str()));
    }

    #[tokio::test]
    async fn test_prefix_equal_to_size() {
        let file = temp_file_with(b"abc");
        let sums = checksum_file(file.path(), Some(3)).await.unwrap();
        assert_eq!(sums.prefix_sha256.as_deref(), Some(sums.sha256.as_str()));
    }

    #[tokio::test]
    async fn test_prefix_longer_than_file_is_none() {
        let file = temp_file_with(b"abc");
        let sums = checksum_file(file.path(), Some(10)).await.unwrap();
        assert_eq!(sums.prefix_sha256, None);
    }

    #[tokio::test]
    async fn test_zero_prefix_of_empty_file() {
        let file = temp_file_with(b"");
        let sums = checksum_file(file.path(), Some(0)).await.unwrap();
        assert_eq!(sums.size, 0);
        assert_eq!(sums.prefix_sha256.as_deref(), Some(sums.sha256.as_str()));
    }

    #[tokio::test]
    async fn test_prefix_across_read_boundary() {
        // 100_000 patterned bytes; the 70_000 prefix point falls inside the
        // second read of the 64 KiB buffer.
        #[allow(clippy::cast_possible_truncation)]
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let file = temp_file_with(&data);

        let sums = checksum_file(file.path(), Some(70_000)).await.unwrap();
        assert_eq!(sums.size, 100_000);
        assert_eq!(sums.sha256, hex_sha256(&data));
        assert_eq!(
            sums.prefix_sha256.as_deref(),
            Some(hex_sha256(&data[..70_000]).as_str())
        );
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = checksum_file(&dir.path().join("absent"), None).await;
        assert!(result.is_err());
    }
}
