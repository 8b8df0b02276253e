//! Content fingerprinting.
//!
//! One algorithm is selected at construction time and stays fixed for the
//! lifetime of the deployment; every stored digest in a given database was
//! produced by the same algorithm. Files are hashed by streaming 64 KiB
//! chunks, links by their `"{path} -> {target}"` representation, directories
//! by the composition rule in [`crate::merkle`].

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};

pub const CHUNK_SIZE: usize = 65536;

/// Digest algorithm, chosen once per deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(HashAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            _ => Err(anyhow::anyhow!(
                "Invalid hash algorithm '{}'. Valid options are: sha1, sha256",
                s
            )),
        }
    }
}

/// Incremental hasher over the selected algorithm.
pub struct Hasher {
    inner: HasherInner,
}

enum HasherInner {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let inner = match algorithm {
            HashAlgorithm::Sha1 => HasherInner::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => HasherInner::Sha256(Sha256::new()),
        };
        Hasher { inner }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.inner {
            HasherInner::Sha1(h) => h.update(bytes),
            HasherInner::Sha256(h) => h.update(bytes),
        }
    }

    /// Consume the hasher and return the lowercase hex digest.
    pub fn finish(self) -> String {
        match self.inner {
            HasherInner::Sha1(h) => format!("{:x}", h.finalize()),
            HasherInner::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Fingerprinting front end used by the Merkle engine.
#[derive(Clone, Copy, Debug)]
pub struct FileHasher {
    algorithm: HashAlgorithm,
}

impl FileHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        FileHasher { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash a regular file by streaming its contents in 64 KiB chunks.
    pub fn hash_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open {} for hashing", path.display()))?;

        let mut hasher = Hasher::new(self.algorithm);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let bytes_read = file
                .read(&mut buffer)
                .with_context(|| format!("Read error while hashing {}", path.display()))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(hasher.finish())
    }

    /// Hash a symbolic link by its logical path and raw (unresolved) target.
    ///
    /// `logical_path` is the store key, which may differ from the on-disk
    /// location when the baseline is mounted somewhere else.
    pub fn hash_link(&self, logical_path: &str, fs_path: impl AsRef<Path>) -> Result<String> {
        let fs_path = fs_path.as_ref();
        let target = std::fs::read_link(fs_path)
            .with_context(|| format!("Failed to readlink {}", fs_path.display()))?;
        Ok(self.hash_string(&format!("{} -> {}", logical_path, target.display())))
    }

    /// Hash the UTF-8 bytes of a string.
    pub fn hash_string(&self, data: &str) -> String {
        let mut hasher = Hasher::new(self.algorithm);
        hasher.update(data.as_bytes());
        hasher.finish()
    }
}
