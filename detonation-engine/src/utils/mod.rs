use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::models::task::SampleRef;

/// Hex-encoded SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Spools submitted byte streams to local disk and hands out content-hashed
/// references. Storage beyond the run's lifetime belongs to the external
/// store collaborator.
pub struct SampleSpool {
    dir: PathBuf,
}

impl SampleSpool {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create spool directory {:?}", dir))?;
        Ok(Self { dir })
    }

    pub async fn save(&self, data: &[u8], file_name: Option<String>) -> Result<SampleRef> {
        let sha256 = sha256_hex(data);
        let path = self.dir.join(Uuid::new_v4().to_string());

        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to spool sample to {:?}", path))?;

        debug!(sha256 = %sha256, size = data.len(), path = ?path, "Sample spooled");

        Ok(SampleRef {
            sha256,
            size: data.len() as u64,
            path,
            file_name,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_spool_save_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SampleSpool::new(dir.path()).unwrap();

        let sample = spool
            .save(b"MZ\x90\x00payload", Some("dropper.exe".to_string()))
            .await
            .unwrap();

        assert_eq!(sample.size, 11);
        assert_eq!(sample.sha256, sha256_hex(b"MZ\x90\x00payload"));
        let spooled = tokio::fs::read(&sample.path).await.unwrap();
        assert_eq!(spooled, b"MZ\x90\x00payload");
    }
}
