// src/store/hash.rs

//! BLAKE3 fingerprints and file hashing.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::Result;

/// Hex-encoded BLAKE3 digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Sentinel recorded for a declared file that does not exist.
    pub const MISSING: &'static str = "missing";

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Fingerprint(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn of_str(text: &str) -> Self {
        Self::of_bytes(text.as_bytes())
    }

    pub fn missing() -> Self {
        Fingerprint(Self::MISSING.to_string())
    }

    pub fn is_missing(&self) -> bool {
        self.0 == Self::MISSING
    }

    /// Hash an ordered sequence of labelled parts.
    ///
    /// Labels and values are length-prefixed so that no two different
    /// sequences can produce the same byte stream.
    pub fn combine<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut hasher = Hasher::new();
        for (label, value) in parts {
            for piece in [label, value] {
                hasher.update(&(piece.len() as u64).to_le_bytes());
                hasher.update(piece.as_bytes());
            }
        }
        Fingerprint(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate a hex digest read back from disk.
    pub fn parse(s: &str) -> Option<Self> {
        let ok = s == Self::MISSING
            || (s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()));
        ok.then(|| Fingerprint(s.to_string()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash the contents of a file; `None` if it does not exist.
pub fn hash_file(path: &Path) -> Result<Option<Fingerprint>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.is_dir() {
        return Ok(None);
    }
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(Fingerprint(hasher.finalize().to_hex().to_string())))
}

/// Fingerprint of a declared file, using the `missing` sentinel.
pub fn file_fingerprint(path: &Path) -> Result<Fingerprint> {
    Ok(hash_file(path)?.unwrap_or_else(Fingerprint::missing))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
}

fn stamp(path: &Path) -> Option<Stamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some(Stamp {
        len: meta.len(),
        modified: meta.modified().ok(),
    })
}

/// Per-run cache of file hashes, keyed by path and validated by size and
/// modification time so a file rewritten mid-run is hashed again.
#[derive(Debug, Default)]
pub struct FileHashCache {
    hashes: HashMap<PathBuf, (Stamp, Fingerprint)>,
}

impl FileHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint of `path`, computing and caching it if necessary.
    pub fn get_or_compute(&mut self, path: &Path) -> Result<Fingerprint> {
        let Some(current) = stamp(path) else {
            self.hashes.remove(path);
            return Ok(Fingerprint::missing());
        };
        if let Some((cached, hash)) = self.hashes.get(path) {
            if *cached == current {
                return Ok(hash.clone());
            }
        }

        debug!(path = %path.display(), "cache miss: hashing file");
        let hash = file_fingerprint(path)?;
        self.hashes.insert(path.to_path_buf(), (current, hash.clone()));
        Ok(hash)
    }

    /// Forget the cached hash for a file (e.g. after a build wrote it).
    pub fn invalidate(&mut self, path: &Path) {
        if self.hashes.remove(path).is_some() {
            debug!(path = %path.display(), "invalidated file hash");
        }
    }
}
