use super::base_reader::BaseRecordReader;
use super::numpy;
use super::timestep::{Field, TimestepRecord};
use super::unpickle::{self, Value};
use crate::error::ConvertError;
use ndarray::{Array1, Array3, Ix1, Ix3};
use std::fs;
use std::path::Path;

/// Reads timestep snapshots pickled as a dict.
///
/// `position`, `direction` and `velocity` are numpy arrays or lists of
/// numbers; bool, integer and float dtypes are all widened to f64. The image
/// (`image`, or `base_rgb` as producers name it) is a uint8 numpy array or a
/// `[height][width][channel]` list of ints in `0..=255`. Extra keys are ignored.
#[derive(Debug, Clone)]
pub struct PickleRecordReader {
    extension: String,
}

impl PickleRecordReader {
    pub fn new() -> Self {
        Self::with_extension("pkl")
    }

    pub fn with_extension(extension: &str) -> Self {
        PickleRecordReader {
            extension: extension.trim_start_matches('.').to_string(),
        }
    }
}

impl Default for PickleRecordReader {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseRecordReader for PickleRecordReader {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn read(&self, path: &Path) -> Result<TimestepRecord, ConvertError> {
        let bytes = fs::read(path).map_err(|err| ConvertError::malformed(path, err.to_string()))?;
        let value =
            unpickle::loads(&bytes).map_err(|err| ConvertError::malformed(path, err.to_string()))?;
        record(&value).map_err(|reason| ConvertError::malformed(path, reason))
    }
}

fn record(value: &Value) -> Result<TimestepRecord, String> {
    if !matches!(value, Value::Dict(_)) {
        return Err(format!("record is a {}, expected a dict", value.kind()));
    }
    let field = |key: &str| value.get(key).ok_or_else(|| format!("missing key `{}`", key));
    let image = value
        .get("image")
        .or_else(|| value.get("base_rgb"))
        .ok_or_else(|| "missing key `image` (or `base_rgb`)".to_string())?;
    Ok(TimestepRecord {
        position: vector(field("position")?, Field::Position)?,
        direction: vector(field("direction")?, Field::Direction)?,
        velocity: vector(field("velocity")?, Field::Velocity)?,
        image: frame(image)?,
    })
}

fn vector(value: &Value, field: Field) -> Result<Array1<f64>, String> {
    let values = match (value.as_sequence(), numpy::decode(value)) {
        (Some(items), _) => items
            .iter()
            .enumerate()
            .map(|(i, item)| number(item).map_err(|err| format!("{}[{}]: {}", field, i, err)))
            .collect::<Result<Array1<f64>, String>>()?,
        (None, Some(array)) => {
            let array = array.map_err(|err| format!("{}: {}", field, err))?;
            let shape = array.shape();
            array
                .to_f64()?
                .into_dimensionality::<Ix1>()
                .map_err(|_| format!("{} has shape {}, expected one dimension", field, shape))?
        }
        (None, None) => {
            return Err(format!(
                "{} is a {}, expected a list or numpy array",
                field,
                value.kind()
            ))
        }
    };
    if let Some(i) = values.iter().position(|v| !v.is_finite()) {
        return Err(format!("{}[{}] is not finite ({})", field, i, values[i]));
    }
    Ok(values)
}

fn number(value: &Value) -> Result<f64, String> {
    match value {
        Value::Int(v) => Ok(*v as f64),
        Value::Float(v) => Ok(*v),
        Value::Bool(v) => Ok(f64::from(u8::from(*v))),
        _ => match numpy::decode(value) {
            Some(scalar) => {
                let values = scalar?.to_f64()?;
                match values.ndim() {
                    0 => values
                        .iter()
                        .next()
                        .copied()
                        .ok_or_else(|| "empty numpy scalar".to_string()),
                    _ => Err("expected a number, found an array".to_string()),
                }
            }
            None => Err(format!("expected a number, found {}", value.kind())),
        },
    }
}

fn frame(value: &Value) -> Result<Array3<u8>, String> {
    let image = match (value.as_sequence(), numpy::decode(value)) {
        (Some(rows), _) => frame_from_lists(rows)?,
        (None, Some(array)) => {
            let array = array.map_err(|err| format!("image: {}", err))?;
            let shape = array.shape();
            array
                .into_u8()
                .map_err(|err| format!("image {}", err))?
                .into_dimensionality::<Ix3>()
                .map_err(|_| format!("image has shape {}, expected height x width x channels", shape))?
        }
        (None, None) => {
            return Err(format!(
                "image is a {}, expected a list or numpy array",
                value.kind()
            ))
        }
    };
    if image.is_empty() {
        let (height, width, channels) = image.dim();
        return Err(format!(
            "image is empty ({}x{}x{})",
            height, width, channels
        ));
    }
    Ok(image)
}

// Flattens a nested list into an HWC frame, rejecting ragged rows and pixels.
fn frame_from_lists(rows: &[Value]) -> Result<Array3<u8>, String> {
    let mut width = None;
    let mut channels = None;
    let mut samples = Vec::new();
    for (y, row) in rows.iter().enumerate() {
        let row = row
            .as_sequence()
            .ok_or_else(|| format!("image row {} is a {}, expected a list", y, row.kind()))?;
        let expected = *width.get_or_insert(row.len());
        if row.len() != expected {
            return Err(format!(
                "image row {} has {} pixels, expected {}",
                y,
                row.len(),
                expected
            ));
        }
        for (x, pixel) in row.iter().enumerate() {
            let pixel = pixel.as_sequence().ok_or_else(|| {
                format!("image pixel ({}, {}) is a {}, expected a list", y, x, pixel.kind())
            })?;
            let expected = *channels.get_or_insert(pixel.len());
            if pixel.len() != expected {
                return Err(format!(
                    "image pixel ({}, {}) has {} channels, expected {}",
                    y,
                    x,
                    pixel.len(),
                    expected
                ));
            }
            for sample in pixel {
                let sample = match sample {
                    Value::Int(v) => u8::try_from(*v).map_err(|_| {
                        format!("image pixel ({}, {}) value {} is outside 0..=255", y, x, v)
                    })?,
                    other => {
                        return Err(format!(
                            "image pixel ({}, {}) holds a {}, expected an int",
                            y,
                            x,
                            other.kind()
                        ))
                    }
                };
                samples.push(sample);
            }
        }
    }
    let shape = (rows.len(), width.unwrap_or(0), channels.unwrap_or(0));
    Array3::from_shape_vec(shape, samples).map_err(|err| err.to_string())
}
