//! Tensor values exchanged between the caller, partitions and kernels.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IrError;

/// Container name used for tensors kept alive across steps by the session.
pub const TENSOR_HANDLE_CONTAINER: &str = "_tensor_handle";

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Int64,
    Bool,
    String,
    Resource,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Float => "float",
            DataType::Int64 => "int64",
            DataType::Bool => "bool",
            DataType::String => "string",
            DataType::Resource => "resource",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Float | DataType::Int64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a value owned by some container, e.g. a tensor retained by the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub container: String,
    pub name: String,
    pub device: String,
}

impl ResourceHandle {
    pub fn new(
        container: impl Into<String>,
        name: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        ResourceHandle {
            container: container.into(),
            name: name.into(),
            device: device.into(),
        }
    }

    /// Handle to a tensor stored in the session tensor table.
    pub fn session_tensor(name: impl Into<String>, device: impl Into<String>) -> Self {
        Self::new(TENSOR_HANDLE_CONTAINER, name, device)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    Float(Vec<f64>),
    Int64(Vec<i64>),
    Bool(Vec<bool>),
    String(Vec<String>),
    Resource(Vec<ResourceHandle>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::Float(v) => v.len(),
            TensorData::Int64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::String(v) => v.len(),
            TensorData::Resource(v) => v.len(),
        }
    }

    fn dtype(&self) -> DataType {
        match self {
            TensorData::Float(_) => DataType::Float,
            TensorData::Int64(_) => DataType::Int64,
            TensorData::Bool(_) => DataType::Bool,
            TensorData::String(_) => DataType::String,
            TensorData::Resource(_) => DataType::Resource,
        }
    }
}

/// Dense host tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Builds a tensor after checking that `data` holds exactly `shape.product()` elements.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, IrError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(IrError::ShapeMismatch(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Tensor { shape, data })
    }

    pub fn from_f64(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, IrError> {
        Self::new(shape, TensorData::Float(values))
    }

    pub fn from_i64(shape: Vec<usize>, values: Vec<i64>) -> Result<Self, IrError> {
        Self::new(shape, TensorData::Int64(values))
    }

    pub fn scalar_f64(value: f64) -> Self {
        Tensor {
            shape: Vec::new(),
            data: TensorData::Float(vec![value]),
        }
    }

    pub fn scalar_i64(value: i64) -> Self {
        Tensor {
            shape: Vec::new(),
            data: TensorData::Int64(vec![value]),
        }
    }

    pub fn scalar_bool(value: bool) -> Self {
        Tensor {
            shape: Vec::new(),
            data: TensorData::Bool(vec![value]),
        }
    }

    pub fn scalar_string(value: impl Into<String>) -> Self {
        Tensor {
            shape: Vec::new(),
            data: TensorData::String(vec![value.into()]),
        }
    }

    pub fn resource(handle: ResourceHandle) -> Self {
        Tensor {
            shape: Vec::new(),
            data: TensorData::Resource(vec![handle]),
        }
    }

    /// Zero-element tensor of the given type, used as the payload of control-only transfers.
    pub fn empty(dtype: DataType) -> Self {
        let data = match dtype {
            DataType::Float => TensorData::Float(Vec::new()),
            DataType::Int64 => TensorData::Int64(Vec::new()),
            DataType::Bool => TensorData::Bool(Vec::new()),
            DataType::String => TensorData::String(Vec::new()),
            DataType::Resource => TensorData::Resource(Vec::new()),
        };
        Tensor {
            shape: vec![0],
            data,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            TensorData::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match &self.data {
            TensorData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// First element of a float tensor.
    pub fn scalar_value_f64(&self) -> Option<f64> {
        self.as_f64().and_then(|v| v.first().copied())
    }

    pub fn scalar_value_i64(&self) -> Option<i64> {
        self.as_i64().and_then(|v| v.first().copied())
    }

    pub fn scalar_value_bool(&self) -> Option<bool> {
        self.as_bool().and_then(|v| v.first().copied())
    }

    pub fn resource_handle(&self) -> Option<&ResourceHandle> {
        match &self.data {
            TensorData::Resource(v) => v.first(),
            _ => None,
        }
    }

    /// Approximate host memory held by the tensor payload.
    pub fn allocated_bytes(&self) -> usize {
        match &self.data {
            TensorData::Float(v) => v.len() * std::mem::size_of::<f64>(),
            TensorData::Int64(v) => v.len() * std::mem::size_of::<i64>(),
            TensorData::Bool(v) => v.len(),
            TensorData::String(v) => v.iter().map(String::len).sum(),
            TensorData::Resource(v) => v
                .iter()
                .map(|h| h.container.len() + h.name.len() + h.device.len())
                .sum(),
        }
    }
}

/// Element-wise arithmetic shared by kernels and constant folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    /// Maps an op type name to its arithmetic, if it is one.
    pub fn from_op_name(op: &str) -> Option<Self> {
        match op {
            "Add" => Some(BinaryOp::Add),
            "Sub" => Some(BinaryOp::Sub),
            "Mul" => Some(BinaryOp::Mul),
            _ => None,
        }
    }

    fn apply_f64(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
        }
    }

    fn apply_i64(self, a: i64, b: i64) -> i64 {
        match self {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
        }
    }
}

/// Applies `op` element-wise. Scalars broadcast against tensors of any shape.
pub fn binary_op(op: BinaryOp, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, IrError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(IrError::ShapeMismatch(format!(
            "{:?} operands have different types: {} vs {}",
            op,
            lhs.dtype(),
            rhs.dtype()
        )));
    }
    let shape = broadcast_shape(lhs, rhs)?;
    let data = match (&lhs.data, &rhs.data) {
        (TensorData::Float(a), TensorData::Float(b)) => {
            TensorData::Float(zip_broadcast(a, b, |x, y| op.apply_f64(x, y)))
        }
        (TensorData::Int64(a), TensorData::Int64(b)) => {
            TensorData::Int64(zip_broadcast(a, b, |x, y| op.apply_i64(x, y)))
        }
        _ => {
            return Err(IrError::Unsupported(format!(
                "{:?} is not defined for {}",
                op,
                lhs.dtype()
            )))
        }
    };
    Tensor::new(shape, data)
}

fn broadcast_shape(lhs: &Tensor, rhs: &Tensor) -> Result<Vec<usize>, IrError> {
    if lhs.shape == rhs.shape {
        Ok(lhs.shape.clone())
    } else if lhs.num_elements() == 1 && lhs.shape.len() <= rhs.shape.len() {
        Ok(rhs.shape.clone())
    } else if rhs.num_elements() == 1 && rhs.shape.len() <= lhs.shape.len() {
        Ok(lhs.shape.clone())
    } else {
        Err(IrError::ShapeMismatch(format!(
            "{:?} vs {:?}",
            lhs.shape, rhs.shape
        )))
    }
}

fn zip_broadcast<T: Copy>(a: &[T], b: &[T], f: impl Fn(T, T) -> T) -> Vec<T> {
    match (a.len(), b.len()) {
        (1, n) if n != 1 => b.iter().map(|&y| f(a[0], y)).collect(),
        (n, 1) if n != 1 => a.iter().map(|&x| f(x, b[0])).collect(),
        _ => a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape_checked() {
        assert!(Tensor::from_f64(vec![2, 2], vec![1.0, 2.0, 3.0]).is_err());
        let t = Tensor::from_f64(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.num_elements(), 4);
        assert_eq!(t.dtype(), DataType::Float);
        assert_eq!(t.allocated_bytes(), 32);
    }

    #[test]
    fn test_scalar_add() {
        let out = binary_op(
            BinaryOp::Add,
            &Tensor::scalar_f64(2.0),
            &Tensor::scalar_f64(3.0),
        )
        .unwrap();
        assert_eq!(out.scalar_value_f64(), Some(5.0));
        assert!(out.shape().is_empty());
    }

    #[test]
    fn test_scalar_broadcast() {
        let v = Tensor::from_i64(vec![3], vec![1, 2, 3]).unwrap();
        let out = binary_op(BinaryOp::Mul, &v, &Tensor::scalar_i64(10)).unwrap();
        assert_eq!(out.as_i64(), Some(&[10, 20, 30][..]));
        assert_eq!(out.shape(), &[3]);
    }

    #[test]
    fn test_binary_type_mismatch() {
        let err = binary_op(
            BinaryOp::Sub,
            &Tensor::scalar_f64(1.0),
            &Tensor::scalar_i64(1),
        )
        .unwrap_err();
        assert!(matches!(err, IrError::ShapeMismatch(_)));
    }

    #[test]
    fn test_binary_on_bool_unsupported() {
        let err = binary_op(
            BinaryOp::Add,
            &Tensor::scalar_bool(true),
            &Tensor::scalar_bool(false),
        )
        .unwrap_err();
        assert!(matches!(err, IrError::Unsupported(_)));
    }

    #[test]
    fn test_resource_handle_accessor() {
        let t = Tensor::resource(ResourceHandle::session_tensor("a;1", "CPU:0"));
        assert_eq!(t.dtype(), DataType::Resource);
        assert_eq!(t.resource_handle().unwrap().container, TENSOR_HANDLE_CONTAINER);
    }
}
