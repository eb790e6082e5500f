use ndarray::{ArrayD, IxDyn};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TensorError {
    #[error("setting an array element with a sequence: inhomogeneous shape after {depth} dimensions, expected {expected} but found {found}")]
    Inhomogeneous {
        depth: usize,
        expected: usize,
        found: usize,
    },
    #[error("could not convert value to float: {0}")]
    NotNumeric(String),
    #[error("invalid tensor shape: {0}")]
    Shape(String),
}

/// Builds a dense f32 array from arbitrarily nested JSON lists.
///
/// The shape is taken from the first element at each depth and every sibling
/// must agree with it. An empty list yields a zero-length axis and ends the
/// shape there, so `[]` becomes an array of shape `[0]`.
pub fn from_nested_json(value: &Value) -> Result<ArrayD<f32>, TensorError> {
    let shape = infer_shape(value);
    let mut data = Vec::with_capacity(shape.iter().product());
    flatten(value, &shape, 0, &mut data)?;

    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| TensorError::Shape(e.to_string()))
}

fn infer_shape(value: &Value) -> Vec<usize> {
    let mut shape = Vec::new();
    let mut current = value;
    while let Value::Array(items) = current {
        shape.push(items.len());
        match items.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    shape
}

fn flatten(
    value: &Value,
    shape: &[usize],
    depth: usize,
    data: &mut Vec<f32>,
) -> Result<(), TensorError> {
    match (value, shape.get(depth)) {
        (Value::Array(items), Some(&expected)) => {
            if items.len() != expected {
                return Err(TensorError::Inhomogeneous {
                    depth,
                    expected,
                    found: items.len(),
                });
            }
            for item in items {
                flatten(item, shape, depth + 1, data)?;
            }
            Ok(())
        }
        (Value::Array(items), None) => Err(TensorError::Inhomogeneous {
            depth,
            expected: 0,
            found: items.len(),
        }),
        (Value::Number(n), None) => {
            let v = n
                .as_f64()
                .ok_or_else(|| TensorError::NotNumeric(n.to_string()))?;
            data.push(v as f32);
            Ok(())
        }
        (Value::Bool(b), None) => {
            data.push(if *b { 1.0 } else { 0.0 });
            Ok(())
        }
        (Value::Number(_) | Value::Bool(_), Some(&expected)) => Err(TensorError::Inhomogeneous {
            depth,
            expected,
            found: 0,
        }),
        (other, _) => Err(TensorError::NotNumeric(other.to_string())),
    }
}

/// Formats a shape the way it is reported back to callers, e.g. `[5, 64, 64]`.
pub fn shape_string(shape: &[usize]) -> String {
    format!("{:?}", shape)
}
