//! Signed capture records.

use crate::canonical::canonical_json;
use crate::signer::{SignError, Signer, Verifier};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use stereo_depth::{DisparityField, SparseDepth};
use thiserror::Error;

pub const UNSIGNED_NO_KEY: &str = "UNSIGNED_NO_PRIVATE_KEY";
pub const SIGNATURE_ERROR_PREFIX: &str = "SIGNATURE_ERROR_";
pub const JPEG_QUALITY: u8 = 95;
/// Highest `_<n>` suffix tried before `save` gives up.
const MAX_NAME_SUFFIX: u32 = 999;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to encode JPEG: {0}")]
    Jpeg(#[from] image::ImageError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Signed payload. Field names and order are part of the record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureData {
    /// Unix seconds.
    pub timestamp: u64,
    /// Base64 JPEG of the rectified left frame.
    pub base_image: String,
    /// Base64 JPEG of the auxiliary view composite.
    pub depth_image: String,
    pub depth_data: SparseDepth,
}

impl CaptureData {
    pub fn new(
        timestamp: u64,
        base: &RgbImage,
        composite: &RgbImage,
        disparity: &DisparityField,
    ) -> Result<Self, RecordError> {
        Ok(Self {
            timestamp,
            base_image: jpeg_base64(base)?,
            depth_image: jpeg_base64(composite)?,
            depth_data: SparseDepth::encode(disparity),
        })
    }
}

pub fn jpeg_base64(img: &RgbImage) -> Result<String, RecordError> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY).encode_image(img)?;
    Ok(STANDARD.encode(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsignedReason {
    NoSigningKey,
}

/// Outcome of signing, stored on the wire as a single string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Attestation {
    /// Hex signature.
    Signed(String),
    Unsigned(UnsignedReason),
    /// Signing was attempted and failed; holds the error message.
    Failed(String),
}

impl Attestation {
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed(_))
    }
}

impl From<Attestation> for String {
    fn from(a: Attestation) -> Self {
        match a {
            Attestation::Signed(sig) => sig,
            Attestation::Unsigned(UnsignedReason::NoSigningKey) => UNSIGNED_NO_KEY.to_owned(),
            Attestation::Failed(msg) => format!("{SIGNATURE_ERROR_PREFIX}{msg}"),
        }
    }
}

impl From<String> for Attestation {
    fn from(s: String) -> Self {
        if s == UNSIGNED_NO_KEY {
            Self::Unsigned(UnsignedReason::NoSigningKey)
        } else if let Some(msg) = s.strip_prefix(SIGNATURE_ERROR_PREFIX) {
            Self::Failed(msg.to_owned())
        } else {
            Self::Signed(s)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub data: CaptureData,
    pub signature: Attestation,
}

impl CaptureRecord {
    /// Sign the canonical form of `data`. Signing failures are recorded in
    /// the attestation rather than returned.
    pub fn seal(data: CaptureData, signer: Option<&dyn Signer>) -> Result<Self, RecordError> {
        let signature = match signer {
            None => {
                warn!("no signing key configured, capture {} is unsigned", data.timestamp);
                Attestation::Unsigned(UnsignedReason::NoSigningKey)
            }
            Some(signer) => {
                let message = canonical_json(&data)?;
                match signer.sign(message.as_bytes()) {
                    Ok(sig) => Attestation::Signed(sig),
                    Err(e) => {
                        warn!("signing capture {} failed: {e}", data.timestamp);
                        Attestation::Failed(e.to_string())
                    }
                }
            }
        };
        Ok(Self { data, signature })
    }

    pub fn file_name(&self) -> String {
        format!("depth_capture_{}.json", self.data.timestamp)
    }

    pub fn to_json(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Write `depth_capture_<timestamp>.json` into `dir`. Existing files are
    /// never replaced: a taken name gets a `_1`, `_2`, ... suffix.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, RecordError> {
        let json = self.to_json()?;
        let (path, mut file) = self.create_unique(dir)?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|source| RecordError::Io {
                path: path.clone(),
                source,
            })?;
        info!(
            "saved {} ({} depth points, {})",
            path.display(),
            self.data.depth_data.valid_pixels,
            if self.signature.is_signed() { "signed" } else { "unsigned" }
        );
        Ok(path)
    }

    fn create_unique(&self, dir: &Path) -> Result<(PathBuf, File), RecordError> {
        let stem = self.file_name();
        let stem = stem.trim_end_matches(".json");
        for n in 0..=MAX_NAME_SUFFIX {
            let path = match n {
                0 => dir.join(format!("{stem}.json")),
                n => dir.join(format!("{stem}_{n}.json")),
            };
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(RecordError::Io { path, source }),
            }
        }
        Err(RecordError::Io {
            path: dir.join(self.file_name()),
            source: std::io::Error::new(ErrorKind::AlreadyExists, "every suffixed record name is taken"),
        })
    }

    pub fn load(path: &Path) -> Result<Self, RecordError> {
        let text = std::fs::read_to_string(path).map_err(|source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid(SignError),
    Unsigned,
    /// The record carries a signing failure instead of a signature.
    SigningFailed(String),
}

/// Re-canonicalize the record payload and check its signature.
pub fn verify_record(record: &CaptureRecord, verifier: &dyn Verifier) -> Result<Verification, RecordError> {
    Ok(match &record.signature {
        Attestation::Unsigned(_) => Verification::Unsigned,
        Attestation::Failed(msg) => Verification::SigningFailed(msg.clone()),
        Attestation::Signed(sig) => {
            let message = canonical_json(&record.data)?;
            match verifier.verify(message.as_bytes(), sig) {
                Ok(()) => Verification::Valid,
                Err(e) => Verification::Invalid(e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::HmacSigner;
    use image::Rgb;

    struct BrokenSigner;

    impl Signer for BrokenSigner {
        fn sign(&self, _: &[u8]) -> Result<String, SignError> {
            Err(SignError::InvalidKey("hardware token missing".into()))
        }
    }

    fn data() -> CaptureData {
        let img = RgbImage::from_fn(16, 8, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 77]));
        let mut field = DisparityField::invalid(16, 8, 0, 16);
        field.set(3, 2, 4.5);
        field.set(10, 7, 12.0625);
        CaptureData::new(1_700_000_000, &img, &img, &field).unwrap()
    }

    #[test]
    fn unsigned_record_matches_wire_schema() {
        let record = CaptureRecord::seal(data(), None).unwrap();
        let json = record.to_json().unwrap();
        assert!(json.starts_with(r#"{"data":{"timestamp":1700000000,"baseImage":""#), "{json}");
        assert!(json.ends_with(r#","signature":"UNSIGNED_NO_PRIVATE_KEY"}"#));
        assert!(!json.contains('\n') && !json.contains(": "));

        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        let keys: Vec<&String> = v["data"].as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(v["data"]["depthData"]["valid_pixels"], 2);
        assert_eq!(v["data"]["depthData"]["shape"], serde_json::json!([8, 16]));
        assert_eq!(record.file_name(), "depth_capture_1700000000.json");
    }

    #[test]
    fn images_are_standard_base64_jpeg() {
        let d = data();
        let bytes = STANDARD.decode(&d.base_image).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (16, 8));
    }

    #[test]
    fn signed_record_verifies_and_detects_tampering() {
        let signer = HmacSigner::from_secret("0xdeadbeef").unwrap();
        let record = CaptureRecord::seal(data(), Some(&signer)).unwrap();
        assert!(record.signature.is_signed());

        let parsed = CaptureRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(verify_record(&parsed, &signer).unwrap(), Verification::Valid);

        let mut tampered = parsed;
        tampered.data.depth_data.values[0] = 5.0;
        assert_eq!(
            verify_record(&tampered, &signer).unwrap(),
            Verification::Invalid(SignError::Mismatch)
        );
    }

    #[test]
    fn signing_failure_is_recorded_not_fabricated() {
        let record = CaptureRecord::seal(data(), Some(&BrokenSigner)).unwrap();
        let wire: String = record.signature.clone().into();
        assert_eq!(wire, "SIGNATURE_ERROR_invalid signing key: hardware token missing");
        let signer = HmacSigner::new(b"k").unwrap();
        assert!(matches!(
            verify_record(&record, &signer).unwrap(),
            Verification::SigningFailed(_)
        ));
    }

    #[test]
    fn attestation_wire_forms_round_trip() {
        for a in [
            Attestation::Signed("ab01".into()),
            Attestation::Unsigned(UnsignedReason::NoSigningKey),
            Attestation::Failed("boom".into()),
        ] {
            assert_eq!(Attestation::from(String::from(a.clone())), a);
        }
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let record = CaptureRecord::seal(data(), None).unwrap();
        let path = record.save(dir.path()).unwrap();
        assert!(path.ends_with("depth_capture_1700000000.json"));
        assert_eq!(CaptureRecord::load(&path).unwrap(), record);
    }

    #[test]
    fn same_timestamp_records_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = CaptureRecord::seal(data(), None).unwrap();
        let mut second_data = data();
        second_data.depth_data.valid_pixels += 1;
        let second = CaptureRecord::seal(second_data, None).unwrap();

        let a = first.save(dir.path()).unwrap();
        let b = second.save(dir.path()).unwrap();
        let c = first.save(dir.path()).unwrap();
        assert!(a.ends_with("depth_capture_1700000000.json"));
        assert!(b.ends_with("depth_capture_1700000000_1.json"));
        assert!(c.ends_with("depth_capture_1700000000_2.json"));
        assert_eq!(CaptureRecord::load(&a).unwrap(), first);
        assert_eq!(CaptureRecord::load(&b).unwrap(), second);
    }
}
