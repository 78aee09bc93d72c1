//! Op definitions: input arity, output type inference and statefulness.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::attr::AttrValue;
use crate::error::IrError;
use crate::tensor::DataType;

/// Inputs to output type inference for one node.
pub struct InferenceContext<'a> {
    pub node: &'a str,
    pub op: &'a str,
    pub attrs: &'a BTreeMap<String, AttrValue>,
    pub input_types: &'a [DataType],
}

impl InferenceContext<'_> {
    /// Reads a required `DataType` attribute.
    pub fn type_attr(&self, key: &str) -> Result<DataType, IrError> {
        self.attrs
            .get(key)
            .and_then(AttrValue::as_type)
            .ok_or_else(|| IrError::InvalidAttr {
                node: self.node.to_string(),
                message: format!("missing type attribute '{}'", key),
            })
    }

    /// All inputs must share one type; returns it.
    pub fn uniform_input_type(&self) -> Result<DataType, IrError> {
        let first = self.input_types.first().copied().ok_or_else(|| IrError::ArityMismatch {
            node: self.node.to_string(),
            op: self.op.to_string(),
            expected: "at least 1".into(),
            actual: 0,
        })?;
        for (index, t) in self.input_types.iter().enumerate() {
            if *t != first {
                return Err(IrError::TypeMismatch {
                    node: self.node.to_string(),
                    index,
                    expected: first.to_string(),
                    actual: t.to_string(),
                });
            }
        }
        Ok(first)
    }

    fn expect_input(&self, index: usize, expected: DataType) -> Result<(), IrError> {
        match self.input_types.get(index) {
            Some(t) if *t == expected => Ok(()),
            Some(t) => Err(IrError::TypeMismatch {
                node: self.node.to_string(),
                index,
                expected: expected.to_string(),
                actual: t.to_string(),
            }),
            None => Err(IrError::ArityMismatch {
                node: self.node.to_string(),
                op: self.op.to_string(),
                expected: format!("at least {}", index + 1),
                actual: self.input_types.len(),
            }),
        }
    }
}

pub type TypeInferenceFn =
    Arc<dyn Fn(&InferenceContext<'_>) -> Result<Vec<DataType>, IrError> + Send + Sync>;

#[derive(Clone)]
pub struct OpDef {
    pub name: String,
    pub min_inputs: usize,
    /// `None` means variadic.
    pub max_inputs: Option<usize>,
    pub is_stateful: bool,
    pub infer: TypeInferenceFn,
}

impl fmt::Debug for OpDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpDef")
            .field("name", &self.name)
            .field("min_inputs", &self.min_inputs)
            .field("max_inputs", &self.max_inputs)
            .field("is_stateful", &self.is_stateful)
            .finish()
    }
}

impl OpDef {
    pub fn new<F>(name: impl Into<String>, num_inputs: usize, infer: F) -> Self
    where
        F: Fn(&InferenceContext<'_>) -> Result<Vec<DataType>, IrError> + Send + Sync + 'static,
    {
        OpDef {
            name: name.into(),
            min_inputs: num_inputs,
            max_inputs: Some(num_inputs),
            is_stateful: false,
            infer: Arc::new(infer),
        }
    }

    pub fn variadic(mut self, min_inputs: usize) -> Self {
        self.min_inputs = min_inputs;
        self.max_inputs = None;
        self
    }

    pub fn stateful(mut self) -> Self {
        self.is_stateful = true;
        self
    }

    /// Checks arity and runs type inference.
    pub fn output_types(&self, ctx: &InferenceContext<'_>) -> Result<Vec<DataType>, IrError> {
        let n = ctx.input_types.len();
        let too_many = self.max_inputs.is_some_and(|max| n > max);
        if n < self.min_inputs || too_many {
            let expected = match self.max_inputs {
                Some(max) if max == self.min_inputs => max.to_string(),
                Some(max) => format!("{}..={}", self.min_inputs, max),
                None => format!("at least {}", self.min_inputs),
            };
            return Err(IrError::ArityMismatch {
                node: ctx.node.to_string(),
                op: self.name.clone(),
                expected,
                actual: n,
            });
        }
        (self.infer)(ctx)
    }
}

/// Registry of known op types, shared by graph construction and the planner.
#[derive(Debug, Clone, Default)]
pub struct OpRegistry {
    ops: HashMap<String, OpDef>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the ops the local runtime knows how to execute.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for op in builtin_ops() {
            reg.ops.insert(op.name.clone(), op);
        }
        reg
    }

    pub fn register(&mut self, op: OpDef) -> Result<(), IrError> {
        if self.ops.contains_key(&op.name) {
            return Err(IrError::DuplicateOp { op: op.name });
        }
        self.ops.insert(op.name.clone(), op);
        Ok(())
    }

    pub fn lookup(&self, op: &str) -> Option<&OpDef> {
        self.ops.get(op)
    }

    pub fn is_stateful(&self, op: &str) -> bool {
        self.ops.get(op).is_some_and(|d| d.is_stateful)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn numeric_binary(ctx: &InferenceContext<'_>) -> Result<Vec<DataType>, IrError> {
    let t = ctx.uniform_input_type()?;
    if !t.is_numeric() {
        return Err(IrError::TypeMismatch {
            node: ctx.node.to_string(),
            index: 0,
            expected: "numeric".into(),
            actual: t.to_string(),
        });
    }
    Ok(vec![t])
}

fn builtin_ops() -> Vec<OpDef> {
    vec![
        OpDef::new("Const", 0, |ctx| {
            let value = ctx
                .attrs
                .get("value")
                .and_then(AttrValue::as_tensor)
                .ok_or_else(|| IrError::InvalidAttr {
                    node: ctx.node.to_string(),
                    message: "Const requires a tensor 'value' attribute".into(),
                })?;
            Ok(vec![value.dtype()])
        }),
        OpDef::new("Placeholder", 0, |ctx| Ok(vec![ctx.type_attr("dtype")?])),
        OpDef::new("Identity", 1, |ctx| Ok(vec![ctx.input_types[0]])),
        OpDef::new("Add", 2, numeric_binary),
        OpDef::new("Sub", 2, numeric_binary),
        OpDef::new("Mul", 2, numeric_binary),
        OpDef::new("NoOp", 0, |_| Ok(Vec::new())),
        OpDef::new("Switch", 2, |ctx| {
            ctx.expect_input(1, DataType::Bool)?;
            let t = ctx.input_types[0];
            Ok(vec![t, t])
        }),
        OpDef::new("Merge", 1, |ctx| {
            let t = ctx.uniform_input_type()?;
            Ok(vec![t, DataType::Int64])
        })
        .variadic(1),
        OpDef::new("Counter", 0, |_| Ok(vec![DataType::Int64])).stateful(),
        OpDef::new("GetSessionHandle", 1, |_| Ok(vec![DataType::Resource])),
        OpDef::new("DebugIdentity", 1, |ctx| Ok(vec![ctx.input_types[0]])),
        OpDef::new("_Arg", 0, |ctx| Ok(vec![ctx.type_attr("T")?])),
        OpDef::new("_Retval", 1, |_| Ok(Vec::new())),
        OpDef::new("_Send", 1, |_| Ok(Vec::new())),
        OpDef::new("_Recv", 0, |ctx| Ok(vec![ctx.type_attr("tensor_type")?])),
        OpDef::new("CollectiveReduce", 1, numeric_unary).stateful(),
    ]
}

fn numeric_unary(ctx: &InferenceContext<'_>) -> Result<Vec<DataType>, IrError> {
    let t = ctx.input_types[0];
    if !t.is_numeric() {
        return Err(IrError::TypeMismatch {
            node: ctx.node.to_string(),
            index: 0,
            expected: "numeric".into(),
            actual: t.to_string(),
        });
    }
    Ok(vec![t])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn ctx<'a>(
        op: &'a str,
        attrs: &'a BTreeMap<String, AttrValue>,
        input_types: &'a [DataType],
    ) -> InferenceContext<'a> {
        InferenceContext {
            node: "n",
            op,
            attrs,
            input_types,
        }
    }

    #[test]
    fn test_builtins_registered() {
        let reg = OpRegistry::with_builtins();
        for op in ["Const", "Add", "_Send", "_Recv", "Merge", "Counter"] {
            assert!(reg.lookup(op).is_some(), "{op} missing");
        }
        assert!(reg.is_stateful("Counter"));
        assert!(!reg.is_stateful("Add"));
    }

    #[test]
    fn test_add_inference() {
        let reg = OpRegistry::with_builtins();
        let attrs = BTreeMap::new();
        let add = reg.lookup("Add").unwrap();
        let out = add
            .output_types(&ctx("Add", &attrs, &[DataType::Float, DataType::Float]))
            .unwrap();
        assert_eq!(out, vec![DataType::Float]);

        let err = add
            .output_types(&ctx("Add", &attrs, &[DataType::Float, DataType::Int64]))
            .unwrap_err();
        assert!(matches!(err, IrError::TypeMismatch { index: 1, .. }));

        let err = add
            .output_types(&ctx("Add", &attrs, &[DataType::Float]))
            .unwrap_err();
        assert!(matches!(err, IrError::ArityMismatch { actual: 1, .. }));
    }

    #[test]
    fn test_const_uses_value_type() {
        let reg = OpRegistry::with_builtins();
        let mut attrs = BTreeMap::new();
        attrs.insert("value".to_string(), AttrValue::Tensor(Tensor::scalar_i64(4)));
        let out = reg
            .lookup("Const")
            .unwrap()
            .output_types(&ctx("Const", &attrs, &[]))
            .unwrap();
        assert_eq!(out, vec![DataType::Int64]);
    }

    #[test]
    fn test_merge_is_variadic() {
        let reg = OpRegistry::with_builtins();
        let attrs = BTreeMap::new();
        let out = reg
            .lookup("Merge")
            .unwrap()
            .output_types(&ctx("Merge", &attrs, &[DataType::Float; 3]))
            .unwrap();
        assert_eq!(out, vec![DataType::Float, DataType::Int64]);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut reg = OpRegistry::with_builtins();
        let err = reg
            .register(OpDef::new("Add", 2, |_| Ok(vec![])))
            .unwrap_err();
        assert!(matches!(err, IrError::DuplicateOp { .. }));
        reg.register(OpDef::new("Square", 1, |ctx| Ok(vec![ctx.input_types[0]])))
            .unwrap();
        assert!(reg.lookup("Square").is_some());
    }
}
