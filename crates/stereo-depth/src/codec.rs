//! Sparse encoding of disparity fields for capture records.

use crate::disparity::DisparityField;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DTYPE_F32: &str = "float32";

/// Largest disparity a decoded field may carry, in pixels.
pub const MAX_DECODED_DISPARITY: f64 = 16384.0;

/// Largest `rows * cols` a decoded field may allocate.
pub const MAX_DECODED_PIXELS: u64 = 1 << 26;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("unsupported dtype {0:?}")]
    UnsupportedDtype(String),
    #[error("index arrays disagree: {ys} rows, {xs} cols, {values} values")]
    LengthMismatch { ys: usize, xs: usize, values: usize },
    #[error("entry {entry} at ({x}, {y}) lies outside {cols}x{rows}")]
    IndexOutOfRange {
        entry: usize,
        x: u32,
        y: u32,
        cols: u32,
        rows: u32,
    },
    #[error("entry {entry} holds disparity {value}, outside (0, {max}]", max = MAX_DECODED_DISPARITY)]
    ValueOutOfRange { entry: usize, value: f64 },
    #[error("shape {rows}x{cols} exceeds {max} pixels", max = MAX_DECODED_PIXELS)]
    ShapeTooLarge { rows: u32, cols: u32 },
}

/// Positive disparities as parallel coordinate/value arrays plus summary
/// statistics of the full field.
///
/// `shape` is `[rows, cols]`. Values are `f32` disparities widened to `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseDepth {
    pub shape: [u32; 2],
    pub dtype: String,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub valid_pixels: usize,
    pub indices_y: Vec<u32>,
    pub indices_x: Vec<u32>,
    pub values: Vec<f64>,
}

impl SparseDepth {
    pub fn encode(field: &DisparityField) -> Self {
        let mut indices_y = Vec::new();
        let mut indices_x = Vec::new();
        let mut values = Vec::new();
        let (mut min, mut max, mut total) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for y in 0..field.height {
            for x in 0..field.width {
                let v = field.get(x, y);
                let wide = v as f64;
                min = min.min(wide);
                max = max.max(wide);
                total += wide;
                if v > 0.0 {
                    indices_y.push(y);
                    indices_x.push(x);
                    values.push(wide);
                }
            }
        }
        let n = field.data.len();
        let (min, max, mean) = if n == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (min, max, total / n as f64)
        };
        Self {
            shape: [field.height, field.width],
            dtype: DTYPE_F32.to_owned(),
            min,
            max,
            mean,
            valid_pixels: values.len(),
            indices_y,
            indices_x,
            values,
        }
    }

    pub fn rows(&self) -> u32 {
        self.shape[0]
    }

    pub fn cols(&self) -> u32 {
        self.shape[1]
    }

    /// Scatter the values into a zero-filled field.
    ///
    /// The search range is not part of the encoding; the decoded field uses
    /// `min_disparity = 0` and the smallest multiple of 16 above the largest
    /// value. Values must be finite and in `(0, MAX_DECODED_DISPARITY]`; the
    /// `min`/`max`/`mean` statistics are informational and not trusted.
    pub fn decode(&self) -> Result<DisparityField, CodecError> {
        if self.dtype != DTYPE_F32 {
            return Err(CodecError::UnsupportedDtype(self.dtype.clone()));
        }
        let (ys, xs, values) = (self.indices_y.len(), self.indices_x.len(), self.values.len());
        if ys != xs || xs != values {
            return Err(CodecError::LengthMismatch { ys, xs, values });
        }
        let (rows, cols) = (self.rows(), self.cols());
        if u64::from(rows) * u64::from(cols) > MAX_DECODED_PIXELS {
            return Err(CodecError::ShapeTooLarge { rows, cols });
        }
        let mut top = 0.0_f64;
        for (entry, &value) in self.values.iter().enumerate() {
            if !(value > 0.0 && value <= MAX_DECODED_DISPARITY) {
                return Err(CodecError::ValueOutOfRange { entry, value });
            }
            top = top.max(value);
        }
        let num_disparities = (top as i32 / 16 + 1) * 16;
        let mut field = DisparityField::zeros(cols, rows, 0, num_disparities);
        for (entry, ((&y, &x), &v)) in self
            .indices_y
            .iter()
            .zip(&self.indices_x)
            .zip(&self.values)
            .enumerate()
        {
            if y >= rows || x >= cols {
                return Err(CodecError::IndexOutOfRange {
                    entry,
                    x,
                    y,
                    cols,
                    rows,
                });
            }
            field.set(x, y, v as f32);
        }
        Ok(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sample_field() -> DisparityField {
        let mut rng = StdRng::seed_from_u64(42);
        let mut field = DisparityField::invalid(23, 17, 0, 96);
        for v in field.data.iter_mut() {
            *v = match rng.gen_range(0..4) {
                0 => -1.0,
                1 => 0.0,
                _ => rng.gen_range(1..96 * 16) as f32 / 16.0 + rng.gen::<f32>() * 1e-3,
            };
        }
        field
    }

    #[test]
    fn round_trip_is_exact() {
        let field = sample_field();
        let sparse = SparseDepth::encode(&field);
        let json = serde_json::to_string(&sparse).unwrap();
        let back: SparseDepth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sparse);

        let decoded = back.decode().unwrap();
        assert_eq!((decoded.width, decoded.height), (23, 17));
        for (orig, dec) in field.data.iter().zip(&decoded.data) {
            if *orig > 0.0 {
                assert_eq!(orig.to_bits(), dec.to_bits());
            } else {
                assert_eq!(*dec, 0.0);
            }
        }
    }

    #[test]
    fn statistics_cover_the_whole_field() {
        let mut field = DisparityField::zeros(2, 2, 0, 16);
        field.data = vec![-1.0, 0.0, 2.5, 4.5];
        let s = SparseDepth::encode(&field);
        assert_eq!(s.shape, [2, 2]);
        assert_eq!(s.dtype, "float32");
        assert_eq!((s.min, s.max, s.mean), (-1.0, 4.5, 1.5));
        assert_eq!(s.valid_pixels, 2);
        assert_eq!(s.indices_y, vec![1, 1]);
        assert_eq!(s.indices_x, vec![0, 1]);
        assert_eq!(s.values, vec![2.5, 4.5]);
    }

    #[test]
    fn json_keys_match_record_schema() {
        let s = SparseDepth::encode(&DisparityField::zeros(1, 1, 0, 16));
        let v = serde_json::to_value(&s).unwrap();
        let mut keys: Vec<&str> = v.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["dtype", "indices_x", "indices_y", "max", "mean", "min", "shape", "valid_pixels", "values"]
        );
    }

    #[test]
    fn decode_rejects_bad_input() {
        let mut s = SparseDepth::encode(&DisparityField::zeros(3, 2, 0, 16));
        s.indices_y.push(1);
        s.indices_x.push(3);
        s.values.push(1.0);
        assert!(matches!(
            s.decode(),
            Err(CodecError::IndexOutOfRange { entry: 0, x: 3, .. })
        ));
        s.values.pop();
        assert!(matches!(s.decode(), Err(CodecError::LengthMismatch { values: 0, .. })));
        s.dtype = "uint8".into();
        assert_eq!(s.decode(), Err(CodecError::UnsupportedDtype("uint8".into())));
    }

    #[test]
    fn decode_rejects_values_outside_the_disparity_range() {
        let mut field = DisparityField::zeros(4, 2, 0, 16);
        field.set(1, 1, 2.5);
        let good = SparseDepth::encode(&field);

        for (value, entry) in [(3.0e9, 0), (f64::NAN, 0), (f64::INFINITY, 0), (-2.0, 0), (0.0, 0)] {
            let mut s = good.clone();
            s.values[0] = value;
            s.max = value;
            match s.decode() {
                Err(CodecError::ValueOutOfRange { entry: e, .. }) => assert_eq!(e, entry),
                other => panic!("value {value}: {other:?}"),
            }
        }

        let mut s = good.clone();
        s.max = 3.0e9;
        let decoded = s.decode().unwrap();
        assert_eq!(decoded.num_disparities, 16);

        let mut s = good;
        s.values[0] = MAX_DECODED_DISPARITY;
        assert_eq!(s.decode().unwrap().num_disparities, 16400);
    }

    #[test]
    fn decode_rejects_oversized_shapes_before_allocating() {
        let mut s = SparseDepth::encode(&DisparityField::zeros(1, 1, 0, 16));
        s.shape = [u32::MAX, u32::MAX];
        assert_eq!(
            s.decode(),
            Err(CodecError::ShapeTooLarge {
                rows: u32::MAX,
                cols: u32::MAX
            })
        );
    }
}
