//! Streaming content fingerprints.

use crate::config::MigrationConfig;
use crate::{Result, TierError};
use async_trait::async_trait;
use blake3::Hasher as Blake3Hasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Hash used for content fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintAlgorithm {
    Blake3,
    Sha256,
}

impl FingerprintAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintAlgorithm::Blake3 => "blake3",
            FingerprintAlgorithm::Sha256 => "sha256",
        }
    }
}

/// A hex digest tagged with its algorithm, written as `algorithm:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint {
    pub algorithm: FingerprintAlgorithm,
    pub digest: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.digest)
    }
}

impl FromStr for Fingerprint {
    type Err = TierError;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, digest) = s.split_once(':').ok_or_else(|| TierError::Validation {
            field: "fingerprint".to_string(),
            message: format!("missing algorithm tag in {:?}", s),
        })?;
        let algorithm = match algorithm {
            "blake3" => FingerprintAlgorithm::Blake3,
            "sha256" => FingerprintAlgorithm::Sha256,
            other => {
                return Err(TierError::Validation {
                    field: "fingerprint".to_string(),
                    message: format!("unknown algorithm {:?}", other),
                })
            }
        };
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TierError::Validation {
                field: "fingerprint".to_string(),
                message: format!("digest is not hex: {:?}", digest),
            });
        }
        Ok(Self {
            algorithm,
            digest: digest.to_lowercase(),
        })
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = TierError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

/// Computes content fingerprints of files.
#[async_trait]
pub trait Fingerprinter: Send + Sync {
    fn algorithm(&self) -> FingerprintAlgorithm;

    async fn fingerprint(&self, path: &Path) -> Result<Fingerprint>;
}

/// Reads the file in 8 MiB chunks on the blocking pool.
#[derive(Debug, Clone, Copy)]
pub struct StreamingFingerprinter {
    algorithm: FingerprintAlgorithm,
}

impl StreamingFingerprinter {
    pub fn new(algorithm: FingerprintAlgorithm) -> Self {
        Self { algorithm }
    }
}

#[async_trait]
impl Fingerprinter for StreamingFingerprinter {
    fn algorithm(&self) -> FingerprintAlgorithm {
        self.algorithm
    }

    async fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        let path = path.to_path_buf();
        let algorithm = self.algorithm;
        tokio::task::spawn_blocking(move || fingerprint_file(&path, algorithm))
            .await
            .map_err(|e| TierError::Other(format!("Fingerprint task failed: {}", e)))?
    }
}

/// Blocking fingerprint of one file.
pub fn fingerprint_file(path: &Path, algorithm: FingerprintAlgorithm) -> Result<Fingerprint> {
    let mut file = std::fs::File::open(path).map_err(|e| TierError::io_with_path(e, path))?;
    let mut buffer = vec![0u8; MigrationConfig::COPY_CHUNK_SIZE];

    let digest = match algorithm {
        FingerprintAlgorithm::Blake3 => {
            let mut hasher = Blake3Hasher::new();
            loop {
                let n = file
                    .read(&mut buffer)
                    .map_err(|e| TierError::io_with_path(e, path))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hasher.finalize().to_hex().to_string()
        }
        FingerprintAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file
                    .read(&mut buffer)
                    .map_err(|e| TierError::io_with_path(e, path))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hex::encode(hasher.finalize())
        }
    };

    Ok(Fingerprint { algorithm, digest })
}
