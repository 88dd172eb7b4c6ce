//! Rebuilds numpy arrays and scalars from their pickled reconstruction calls.
//!
//! numpy pickles an array either as `_reconstruct(...)` followed by a `BUILD`
//! state `(version, shape, dtype, fortran_order, data)`, or (protocol 5) as
//! `_frombuffer(data, dtype, shape, order)`. Scalars are `scalar(dtype, data)`.

use super::unpickle::Value;
use crate::misc::shape::Shape;
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bool,
    Int,
    UInt,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DType {
    kind: Kind,
    size: usize,
    big_endian: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumpyArray {
    shape: Vec<usize>,
    dtype: DType,
    fortran_order: bool,
    data: Vec<u8>,
}

/// Rebuilds `value` if it is a pickled numpy array or scalar; scalars come
/// back zero-dimensional. `None` means `value` is something else entirely.
pub fn decode(value: &Value) -> Option<Result<NumpyArray, String>> {
    match value {
        Value::Build { object, state } if is_reconstruct(object) => Some(from_state(state)),
        Value::Reduce { callable, args } if is_numpy(callable, "_frombuffer") => {
            Some(from_buffer(args))
        }
        Value::Reduce { callable, args } if is_numpy(callable, "scalar") => Some(from_scalar(args)),
        _ => None,
    }
}

impl DType {
    fn parse(descr: &str, byte_order: &str) -> Result<Self, String> {
        // a descr may carry its own byte order, e.g. "<f8"
        let (byte_order, code) = match descr.chars().next() {
            Some(c @ ('<' | '>' | '|' | '=')) => (c, &descr[1..]),
            _ => (byte_order.chars().next().unwrap_or('='), descr),
        };
        let unsupported = || format!("unsupported numpy dtype `{}`", descr);
        let kind = match code.chars().next() {
            Some('b') => Kind::Bool,
            Some('i') => Kind::Int,
            Some('u') => Kind::UInt,
            Some('f') => Kind::Float,
            _ => return Err(unsupported()),
        };
        let size: usize = code[1..].parse().map_err(|_| unsupported())?;
        let valid = match kind {
            Kind::Bool => size == 1,
            Kind::Int | Kind::UInt => matches!(size, 1 | 2 | 4 | 8),
            Kind::Float => matches!(size, 4 | 8),
        };
        if !valid {
            return Err(unsupported());
        }
        let big_endian = match byte_order {
            '>' => true,
            '=' => cfg!(target_endian = "big"),
            _ => false,
        };
        Ok(DType {
            kind,
            size,
            big_endian,
        })
    }

    pub fn is_u8(&self) -> bool {
        self.kind == Kind::UInt && self.size == 1
    }

    fn bits(&self, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        if self.big_endian {
            buf[8 - bytes.len()..].copy_from_slice(bytes);
            u64::from_be_bytes(buf)
        } else {
            buf[..bytes.len()].copy_from_slice(bytes);
            u64::from_le_bytes(buf)
        }
    }

    fn to_f64(self, bytes: &[u8]) -> f64 {
        let bits = self.bits(bytes);
        match self.kind {
            Kind::Bool => f64::from(u8::from(bits != 0)),
            Kind::UInt => bits as f64,
            Kind::Int => {
                let shift = 64 - 8 * self.size as u32;
                ((bits << shift) as i64 >> shift) as f64
            }
            Kind::Float if self.size == 4 => f64::from(f32::from_bits(bits as u32)),
            Kind::Float => f64::from_bits(bits),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.size * 8;
        match self.kind {
            Kind::Bool => write!(f, "bool"),
            Kind::Int => write!(f, "int{}", bits),
            Kind::UInt => write!(f, "uint{}", bits),
            Kind::Float => write!(f, "float{}", bits),
        }
    }
}

impl NumpyArray {
    fn new(shape: Vec<usize>, dtype: DType, fortran_order: bool, data: Vec<u8>) -> Result<Self, String> {
        let expected = shape.iter().product::<usize>() * dtype.size;
        if data.len() != expected {
            return Err(format!(
                "{} array of shape {} holds {} bytes, expected {}",
                dtype,
                Shape::from(shape.as_slice()),
                data.len(),
                expected
            ));
        }
        Ok(NumpyArray {
            shape,
            dtype,
            fortran_order,
            data,
        })
    }

    pub fn shape(&self) -> Shape {
        Shape::from(self.shape.as_slice())
    }

    /// Values widened to f64, in logical (row-major) order.
    pub fn to_f64(&self) -> Result<ArrayD<f64>, String> {
        let values = self
            .data
            .chunks_exact(self.dtype.size)
            .map(|bytes| self.dtype.to_f64(bytes))
            .collect();
        self.shaped(values)
    }

    pub fn into_u8(mut self) -> Result<ArrayD<u8>, String> {
        if !self.dtype.is_u8() {
            return Err(format!("dtype is {}, expected uint8", self.dtype));
        }
        let data = std::mem::take(&mut self.data);
        self.shaped(data)
    }

    fn shaped<T: Clone>(&self, values: Vec<T>) -> Result<ArrayD<T>, String> {
        let shape = IxDyn(&self.shape);
        let array = if self.fortran_order {
            ArrayD::from_shape_vec(shape.f(), values)
        } else {
            ArrayD::from_shape_vec(shape, values)
        };
        array
            .map(|array| array.as_standard_layout().into_owned())
            .map_err(|err| err.to_string())
    }
}

fn is_numpy(value: &Value, function: &str) -> bool {
    matches!(value, Value::Global { module, name } if module.starts_with("numpy") && name == function)
}

fn is_reconstruct(object: &Value) -> bool {
    matches!(object, Value::Reduce { callable, .. } if is_numpy(callable, "_reconstruct"))
}

fn from_state(state: &Value) -> Result<NumpyArray, String> {
    let items = state
        .as_sequence()
        .ok_or_else(|| format!("ndarray state is a {}, expected a tuple", state.kind()))?;
    // the leading version number is missing from very old pickles
    let items = match items.len() {
        5 => &items[1..],
        4 => items,
        n => return Err(format!("ndarray state has {} items, expected 5", n)),
    };
    NumpyArray::new(
        shape(&items[0])?,
        dtype(&items[1])?,
        truthy(&items[2])?,
        raw_bytes(&items[3])?,
    )
}

fn from_buffer(args: &Value) -> Result<NumpyArray, String> {
    match args.as_sequence() {
        Some([data, dtype_value, shape_value, order]) => NumpyArray::new(
            shape(shape_value)?,
            dtype(dtype_value)?,
            order.as_str() == Some("F"),
            raw_bytes(data)?,
        ),
        _ => Err("unexpected _frombuffer arguments".to_string()),
    }
}

fn from_scalar(args: &Value) -> Result<NumpyArray, String> {
    match args.as_sequence() {
        Some([dtype_value, data]) => {
            NumpyArray::new(Vec::new(), dtype(dtype_value)?, false, raw_bytes(data)?)
        }
        _ => Err("unexpected numpy scalar arguments".to_string()),
    }
}

// `numpy.dtype(descr, align, copy)`, usually built with a state whose second
// item is the byte order.
fn dtype(value: &Value) -> Result<DType, String> {
    let (object, state) = match value {
        Value::Build { object, state } => (&**object, Some(&**state)),
        other => (other, None),
    };
    let descr = match object {
        Value::Reduce { callable, args } if is_numpy(callable, "dtype") => args
            .as_sequence()
            .and_then(|args| args.first())
            .and_then(Value::as_str),
        _ => None,
    }
    .ok_or_else(|| format!("expected a numpy dtype, found {}", value.kind()))?;
    let byte_order = state
        .and_then(Value::as_sequence)
        .and_then(|state| state.get(1))
        .and_then(Value::as_str)
        .unwrap_or("=");
    DType::parse(descr, byte_order)
}

fn shape(value: &Value) -> Result<Vec<usize>, String> {
    let dims = value
        .as_sequence()
        .ok_or_else(|| format!("array shape is a {}, expected a tuple", value.kind()))?;
    dims.iter()
        .map(|dim| match dim {
            Value::Int(n) => usize::try_from(*n).map_err(|_| format!("negative array extent {}", n)),
            other => Err(format!("array extent is a {}, expected an int", other.kind())),
        })
        .collect()
}

fn truthy(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Int(n) => Ok(*n != 0),
        other => Err(format!("expected a bool, found {}", other.kind())),
    }
}

// Protocols 3+ carry raw bytes; protocol 2 spells them as
// `_codecs.encode(latin1_text, "latin1")`.
fn raw_bytes(value: &Value) -> Result<Vec<u8>, String> {
    match value {
        Value::Bytes(bytes) => Ok(bytes.clone()),
        Value::Reduce { callable, args } if is_codecs_encode(callable) => {
            match args.as_sequence() {
                Some([Value::String(text), Value::String(encoding)])
                    if matches!(encoding.as_str(), "latin1" | "latin-1") =>
                {
                    text.chars()
                        .map(|c| u8::try_from(u32::from(c)).map_err(|_| "non latin-1 data".to_string()))
                        .collect()
                }
                _ => Err("unexpected _codecs.encode arguments".to_string()),
            }
        }
        other => Err(format!("array data is a {}, expected bytes", other.kind())),
    }
}

fn is_codecs_encode(value: &Value) -> bool {
    matches!(value, Value::Global { module, name } if module == "_codecs" && name == "encode")
}
