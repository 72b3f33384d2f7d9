//! Storage layer: durable snapshot files.
//!
//! A snapshot is a JSON envelope around an arbitrary serde payload. The
//! envelope carries a format version, a kind tag, a creation timestamp and a
//! blake3 checksum of the payload, all of which are verified on load.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot holds {found}, expected {expected}")]
    KindMismatch { expected: String, found: String },
    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub format_version: u32,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    kind: String,
    created_at: DateTime<Utc>,
    checksum: String,
    /// Kept as the exact serialized text so the checksum covers the bytes on
    /// disk.
    payload: Box<RawValue>,
}

fn checksum(payload: &RawValue) -> String {
    blake3::hash(payload.get().as_bytes()).to_hex().to_string()
}

/// Serializes `payload` into a snapshot string.
pub fn encode<T: Serialize>(kind: &str, payload: &T) -> Result<String, StorageError> {
    let payload = RawValue::from_string(serde_json::to_string(payload)?)?;
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        kind: kind.to_string(),
        created_at: Utc::now(),
        checksum: checksum(&payload),
        payload,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parses a snapshot string produced by [`encode`].
pub fn decode<T: DeserializeOwned>(
    kind: &str,
    text: &str,
) -> Result<(T, SnapshotInfo), StorageError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.format_version != FORMAT_VERSION {
        return Err(StorageError::UnsupportedVersion(envelope.format_version));
    }
    if envelope.kind != kind {
        return Err(StorageError::KindMismatch {
            expected: kind.to_string(),
            found: envelope.kind,
        });
    }
    if checksum(&envelope.payload) != envelope.checksum {
        return Err(StorageError::ChecksumMismatch);
    }
    let payload = serde_json::from_str(envelope.payload.get())?;
    let info = SnapshotInfo {
        format_version: envelope.format_version,
        kind: envelope.kind,
        created_at: envelope.created_at,
        checksum: envelope.checksum,
    };
    Ok((payload, info))
}

/// Writes a snapshot to `path`.
///
/// The snapshot is written to a temp file in the same directory and renamed
/// over `path`, so readers never observe a half-written file.
pub fn save<T: Serialize>(path: &Path, kind: &str, payload: &T) -> Result<(), StorageError> {
    let text = encode(kind, payload)?;
    let io_err = |source: std::io::Error| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(text.as_bytes()).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    debug!("wrote {} snapshot ({} bytes) to {:?}", kind, text.len(), path);
    Ok(())
}

/// Reads and verifies a snapshot written by [`save`].
pub fn load<T: DeserializeOwned>(path: &Path, kind: &str) -> Result<(T, SnapshotInfo), StorageError> {
    let text = std::fs::read_to_string(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode(kind, &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        weights: Vec<f32>,
    }

    fn sample() -> Sample {
        Sample {
            name: "alpha".into(),
            weights: vec![0.1, -0.25, 1.0 / 3.0],
        }
    }

    #[test]
    fn save_then_load_returns_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.json");
        save(&path, "sample", &sample()).unwrap();

        let (loaded, info): (Sample, _) = load(&path, "sample").unwrap();
        assert_eq!(loaded, sample());
        assert_eq!(info.format_version, FORMAT_VERSION);
        assert_eq!(info.kind, "sample");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let text = encode("sample", &sample()).unwrap();
        let tampered = text.replace("alpha", "omega");
        let err = decode::<Sample>("sample", &tampered).unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let text = encode("sample", &sample()).unwrap();
        let err = decode::<Sample>("other", &text).unwrap_err();
        assert!(matches!(err, StorageError::KindMismatch { .. }));
    }

    #[test]
    fn future_version_is_rejected() {
        let text = encode("sample", &sample()).unwrap();
        let bumped = text.replacen(
            &format!("\"format_version\":{FORMAT_VERSION}"),
            &format!("\"format_version\":{}", FORMAT_VERSION + 1),
            1,
        );
        let err = decode::<Sample>("sample", &bumped).unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedVersion(v) if v == FORMAT_VERSION + 1));
    }

    /// Deterministic pseudo-random weights with full f32 precision.
    fn lcg_weights(n: usize) -> Vec<f32> {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn full_precision_floats_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let payload = Sample {
            name: "embedding".into(),
            weights: lcg_weights(1536),
        };
        save(&path, "vector_index", &payload).unwrap();
        let (loaded, info): (Sample, _) = load(&path, "vector_index").unwrap();
        assert_eq!(loaded, payload);
        assert_eq!(info.kind, "vector_index");
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load::<Sample>(&dir.path().join("absent.json"), "sample").unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
    }

    #[test]
    fn save_overwrites_existing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        save(&path, "sample", &sample()).unwrap();
        let second = Sample {
            name: "beta".into(),
            weights: vec![],
        };
        save(&path, "sample", &second).unwrap();
        let (loaded, _): (Sample, _) = load(&path, "sample").unwrap();
        assert_eq!(loaded, second);
    }
}
