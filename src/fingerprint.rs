//! Fingerprints: order-independent summaries of a set of named elements.
//!
//! A fingerprint captures the inputs of a build (sources, dependencies,
//! tool versions) as `name -> value` elements. Comparing the fingerprint
//! recorded after a successful build with one freshly computed over the
//! current inputs is a fast way to decide between reuse and rebuild.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::error::{PlanError, Result};
use crate::platform;
use crate::util::checksum;

/// Bumped each time the computation of fingerprints changes, so files
/// written with a different meaning refuse to load.
pub const FINGERPRINT_VERSION: &str = "1.2";

/// Differences between two fingerprints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintDiff {
    /// Keys present in both with different values.
    pub updated: BTreeSet<String>,
    /// Keys present only in the fingerprint compared against.
    pub new: BTreeSet<String>,
    /// Keys present only in this fingerprint.
    pub obsolete: BTreeSet<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FingerprintFile {
    fingerprint_version: String,
    elements: BTreeMap<String, String>,
}

/// An unordered map of string elements plus a version envelope and one
/// host-identifying element.
///
/// Two fingerprints are equal iff their element maps are equal; the order
/// in which elements were added never matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    elements: BTreeMap<String, String>,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new()
    }
}

impl Fingerprint {
    /// A fresh fingerprint, pre-seeded with the local OS version and the
    /// library's fingerprint version.
    pub fn new() -> Self {
        let mut fingerprint = Self {
            elements: BTreeMap::new(),
        };
        fingerprint.add("os_version", platform::os_version());
        fingerprint.add("fingerprint_version", FINGERPRINT_VERSION);
        fingerprint
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.elements.insert(name.into(), value.into());
    }

    /// Record a file as `(basename, sha256 of content)`.
    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(PlanError::with_origin(
                format!("file {} does not exist", path.display()),
                "fingerprint.add_file",
            ));
        }
        let digest = checksum::sha256_file(path)?;
        self.add(basename(path), digest);
        Ok(())
    }

    /// Record a directory as `(basename, state digest)`.
    ///
    /// The state digest reflects each file's metadata, not its content: a
    /// tree scan answers "did anything change" without reading every file.
    pub fn add_dir(&mut self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            return Err(PlanError::with_origin(
                format!("directory {} does not exist", path.display()),
                "fingerprint.add_dir",
            ));
        }
        let digest = checksum::filetree_state(path)?;
        self.add(basename(path), digest);
        Ok(())
    }

    pub fn elements(&self) -> &BTreeMap<String, String> {
        &self.elements
    }

    /// Hex sha256 digest over the element map, fed in sorted key order.
    /// Equal fingerprints produce bit-identical digests.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.elements {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Differences against `other`, or `None` when the fingerprints are
    /// equal. `new` holds keys only in `other`, `obsolete` keys only in
    /// `self`, `updated` keys in both with different values.
    pub fn compare_to(&self, other: &Fingerprint) -> Option<FingerprintDiff> {
        let self_keys: BTreeSet<&String> = self.elements.keys().collect();
        let other_keys: BTreeSet<&String> = other.elements.keys().collect();

        let obsolete: BTreeSet<String> = self_keys
            .difference(&other_keys)
            .map(|k| k.to_string())
            .collect();
        let new: BTreeSet<String> = other_keys
            .difference(&self_keys)
            .map(|k| k.to_string())
            .collect();
        let updated: BTreeSet<String> = self_keys
            .intersection(&other_keys)
            .filter(|k| self.elements[**k] != other.elements[**k])
            .map(|k| k.to_string())
            .collect();

        if updated.is_empty() && new.is_empty() && obsolete.is_empty() {
            None
        } else {
            Some(FingerprintDiff {
                updated,
                new,
                obsolete,
            })
        }
    }

    /// Save as JSON under a versioned envelope.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let data = FingerprintFile {
            fingerprint_version: FINGERPRINT_VERSION.to_string(),
            elements: self.elements.clone(),
        };
        let content = serde_json::to_string_pretty(&data).map_err(|e| {
            PlanError::with_origin(
                format!("cannot serialize fingerprint: {}", e),
                "fingerprint.save_to_file",
            )
        })?;
        std::fs::write(path, content).map_err(|e| {
            PlanError::with_origin(
                format!("cannot write {}: {}", path.display(), e),
                "fingerprint.save_to_file",
            )
        })
    }

    /// Load a fingerprint saved by [`save_to_file`](Self::save_to_file).
    ///
    /// Returns `None`, never an error, when the file is missing, is not a
    /// fingerprint file, or carries an unsupported version.
    pub fn load_from_file(path: &Path) -> Option<Fingerprint> {
        if !path.is_file() {
            return None;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                error!("cannot read fingerprint file {}: {}", path.display(), e);
                return None;
            }
        };
        let data: FingerprintFile = match serde_json::from_str(&content) {
            Ok(data) => data,
            Err(e) => {
                error!(
                    "{} is not a properly formatted fingerprint file ({})",
                    path.display(),
                    e
                );
                return None;
            }
        };
        if data.fingerprint_version != FINGERPRINT_VERSION {
            info!(
                "unsupported fingerprint version: {}",
                data.fingerprint_version
            );
            return None;
        }
        Some(Fingerprint {
            elements: data.elements,
        })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.elements {
            writeln!(f, "{}: {}", key, value)?;
        }
        Ok(())
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
