//! Calibration bundle: everything the depth session needs from a calibration,
//! stored as one JSON document.
//!
//! Matrices are row-major `f64` arrays. Remap tables are base64 (standard
//! alphabet) of little-endian `f32` bytes, so a save/load cycle is exact.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use stereo_core::{CameraModel, ImageSize, Real, RectificationGeometry, Roi, StereoExtrinsics, Vec3};
use stereo_depth::{RectificationMaps, RemapError, RemapTable};
use thiserror::Error;

pub const BUNDLE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed bundle JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported bundle version {found} (expected {BUNDLE_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("matrix {name} has {got} entries, expected {expected}")]
    MatrixShape {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("remap table {name} is not valid base64: {source}")]
    Base64 {
        name: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("remap table {name} byte length {len} is not a multiple of 4")]
    MapBytes { name: &'static str, len: usize },
    #[error("remap table size {table:?} does not match image size {image:?}")]
    MapSize { table: ImageSize, image: ImageSize },
    #[error(transparent)]
    Remap(#[from] RemapError),
}

/// Rectification geometry with row-major matrices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryRecord {
    pub alpha: Real,
    pub r1: Vec<Real>,
    pub r2: Vec<Real>,
    pub p1: Vec<Real>,
    pub p2: Vec<Real>,
    pub q: Vec<Real>,
    pub roi_left: Roi,
    pub roi_right: Roi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicsRecord {
    /// Row-major 3x3.
    pub rotation: Vec<Real>,
    pub translation: [Real; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPair {
    pub left: CameraModel,
    pub right: CameraModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedMap {
    pub width: u32,
    pub height: u32,
    pub map_x: String,
    pub map_y: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedMaps {
    pub left: EncodedMap,
    pub right: EncodedMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBundle {
    pub version: u32,
    pub image_size: ImageSize,
    pub geometry: GeometryRecord,
    pub maps: EncodedMaps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cameras: Option<CameraPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extrinsics: Option<ExtrinsicsRecord>,
}

fn row_major<const R: usize, const C: usize>(m: &SMatrix<Real, R, C>) -> Vec<Real> {
    (0..R).flat_map(|r| (0..C).map(move |c| m[(r, c)])).collect()
}

fn from_row_major<const R: usize, const C: usize>(
    name: &'static str,
    values: &[Real],
) -> Result<SMatrix<Real, R, C>, BundleError> {
    if values.len() != R * C {
        return Err(BundleError::MatrixShape {
            name,
            expected: R * C,
            got: values.len(),
        });
    }
    Ok(SMatrix::from_fn(|r, c| values[r * C + c]))
}

fn encode_f32(values: &[f32]) -> String {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

fn decode_f32(name: &'static str, text: &str) -> Result<Vec<f32>, BundleError> {
    let bytes = STANDARD
        .decode(text)
        .map_err(|source| BundleError::Base64 { name, source })?;
    if bytes.len() % 4 != 0 {
        return Err(BundleError::MapBytes { name, len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl EncodedMap {
    pub fn encode(table: &RemapTable) -> Self {
        Self {
            width: table.width(),
            height: table.height(),
            map_x: encode_f32(table.map_x()),
            map_y: encode_f32(table.map_y()),
        }
    }

    fn decode(&self, name_x: &'static str, name_y: &'static str) -> Result<RemapTable, BundleError> {
        let map_x = decode_f32(name_x, &self.map_x)?;
        let map_y = decode_f32(name_y, &self.map_y)?;
        Ok(RemapTable::from_parts(self.width, self.height, map_x, map_y)?)
    }
}

impl CalibrationBundle {
    pub fn new(
        geometry: &RectificationGeometry,
        maps: &RectificationMaps,
        cameras: Option<CameraPair>,
        extrinsics: Option<&StereoExtrinsics>,
    ) -> Self {
        Self {
            version: BUNDLE_VERSION,
            image_size: geometry.image_size,
            geometry: GeometryRecord {
                alpha: geometry.alpha,
                r1: row_major(&geometry.r1),
                r2: row_major(&geometry.r2),
                p1: row_major(&geometry.p1),
                p2: row_major(&geometry.p2),
                q: row_major(&geometry.q),
                roi_left: geometry.roi_left,
                roi_right: geometry.roi_right,
            },
            maps: EncodedMaps {
                left: EncodedMap::encode(&maps.left),
                right: EncodedMap::encode(&maps.right),
            },
            cameras,
            extrinsics: extrinsics.map(|e| ExtrinsicsRecord {
                rotation: row_major(&e.rotation),
                translation: [e.translation.x, e.translation.y, e.translation.z],
            }),
        }
    }

    /// Parse and check the version.
    pub fn from_json(text: &str) -> Result<Self, BundleError> {
        let bundle: Self = serde_json::from_str(text)?;
        if bundle.version != BUNDLE_VERSION {
            return Err(BundleError::UnsupportedVersion { found: bundle.version });
        }
        Ok(bundle)
    }

    pub fn to_json(&self) -> Result<String, BundleError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, BundleError> {
        let text = fs::read_to_string(path).map_err(|source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), BundleError> {
        fs::write(path, self.to_json()?).map_err(|source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn geometry(&self) -> Result<RectificationGeometry, BundleError> {
        let g = &self.geometry;
        let r1 = from_row_major("r1", &g.r1)?;
        let r2 = from_row_major("r2", &g.r2)?;
        let p1 = from_row_major("p1", &g.p1)?;
        let p2 = from_row_major("p2", &g.p2)?;
        let q = from_row_major("q", &g.q)?;
        Ok(RectificationGeometry {
            image_size: self.image_size,
            alpha: g.alpha,
            r1,
            r2,
            p1,
            p2,
            q,
            roi_left: g.roi_left,
            roi_right: g.roi_right,
        })
    }

    pub fn extrinsics(&self) -> Result<Option<StereoExtrinsics>, BundleError> {
        let Some(e) = &self.extrinsics else {
            return Ok(None);
        };
        let rotation = from_row_major("rotation", &e.rotation)?;
        let t = e.translation;
        Ok(Some(StereoExtrinsics::new(rotation, Vec3::new(t[0], t[1], t[2]))))
    }

    /// Decode both remap tables; their size must match the bundle image size.
    pub fn maps(&self) -> Result<RectificationMaps, BundleError> {
        let maps = RectificationMaps {
            left: self.maps.left.decode("left.map_x", "left.map_y")?,
            right: self.maps.right.decode("right.map_x", "right.map_y")?,
        };
        for table in [&maps.left, &maps.right] {
            let size = ImageSize::new(table.width(), table.height());
            if size != self.image_size {
                return Err(BundleError::MapSize {
                    table: size,
                    image: self.image_size,
                });
            }
        }
        Ok(maps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereo_core::{BrownConrady5, FxFyCxCySkew};
    use stereo_linear::prelude::*;

    fn camera(fx: Real, k1: Real) -> CameraModel {
        CameraModel::new(
            ImageSize::new(48, 32),
            FxFyCxCySkew {
                fx,
                fy: fx,
                cx: 23.5,
                cy: 15.5,
                skew: 0.0,
            },
            BrownConrady5 {
                k1,
                iters: 20,
                ..Default::default()
            },
        )
    }

    fn bundle() -> (CalibrationBundle, RectificationGeometry, RectificationMaps) {
        let (l, r) = (camera(40.0, -0.05), camera(41.0, -0.03));
        let extr = StereoExtrinsics::new(
            nalgebra::Rotation3::from_euler_angles(0.01, 0.02, -0.005).into_inner(),
            Vec3::new(-60.0, 0.5, 0.2),
        );
        let geometry = stereo_rectify(&l, &r, &extr, &RectifyOptions::default()).unwrap();
        let maps = RectificationMaps::build(&l, &r, &geometry).unwrap();
        let b = CalibrationBundle::new(&geometry, &maps, Some(CameraPair { left: l, right: r }), Some(&extr));
        (b, geometry, maps)
    }

    #[test]
    fn json_round_trip_is_exact() {
        let (b, geometry, maps) = bundle();
        let back = CalibrationBundle::from_json(&b.to_json().unwrap()).unwrap();
        assert_eq!(back, b);
        assert_eq!(back.geometry().unwrap(), geometry);
        assert_eq!(back.maps().unwrap(), maps);
        let extr = back.extrinsics().unwrap().unwrap();
        assert_eq!(extr.translation, Vec3::new(-60.0, 0.5, 0.2));
    }

    #[test]
    fn matrices_are_row_major() {
        let (b, geometry, _) = bundle();
        assert_eq!(b.geometry.p2[3], geometry.p2[(0, 3)]);
        assert_eq!(b.geometry.q[3], geometry.q[(0, 3)]);
        assert_eq!(b.geometry.q.len(), 16);
    }

    #[test]
    fn optional_sections_are_omitted() {
        let (mut b, _, _) = bundle();
        b.cameras = None;
        b.extrinsics = None;
        let v: serde_json::Value = serde_json::from_str(&b.to_json().unwrap()).unwrap();
        assert!(v.get("cameras").is_none());
        assert!(v.get("extrinsics").is_none());
        assert_eq!(v["version"], 1);
    }

    #[test]
    fn rejects_unknown_version_and_bad_maps() {
        let (mut b, _, _) = bundle();
        b.version = 2;
        let err = CalibrationBundle::from_json(&serde_json::to_string(&b).unwrap()).unwrap_err();
        assert!(matches!(err, BundleError::UnsupportedVersion { found: 2 }));

        let (mut b, _, _) = bundle();
        b.maps.left.map_x = "@@@".into();
        assert!(matches!(b.maps(), Err(BundleError::Base64 { name: "left.map_x", .. })));

        let (mut b, _, _) = bundle();
        b.geometry.q.pop();
        assert!(matches!(b.geometry(), Err(BundleError::MatrixShape { name: "q", .. })));
    }

    #[test]
    fn save_and_load() {
        let (b, _, _) = bundle();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo_bundle.json");
        b.save(&path).unwrap();
        assert_eq!(CalibrationBundle::load(&path).unwrap(), b);
        assert!(matches!(
            CalibrationBundle::load(&dir.path().join("missing.json")),
            Err(BundleError::Io { .. })
        ));
    }
}
