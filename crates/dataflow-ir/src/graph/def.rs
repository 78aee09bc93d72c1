//! Serializable graph definitions supplied by callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attr::AttrValue;
use crate::error::IrError;
use crate::tensor::{DataType, Tensor};

/// One operation in a `GraphDef`.
///
/// `inputs` uses the textual convention `"x"` / `"x:1"` for data inputs and
/// `"^x"` for control dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        NodeDef {
            name: name.into(),
            op: op.into(),
            inputs: Vec::new(),
            device: String::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_control_input(mut self, node: impl AsRef<str>) -> Self {
        self.inputs.push(format!("^{}", node.as_ref()));
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// `Const` node holding `value`.
    pub fn constant(name: impl Into<String>, value: Tensor) -> Self {
        let dtype = value.dtype();
        NodeDef::new(name, "Const")
            .with_attr("value", value)
            .with_attr("dtype", dtype)
    }

    /// `Placeholder` node of the given type.
    pub fn placeholder(name: impl Into<String>, dtype: DataType) -> Self {
        NodeDef::new(name, "Placeholder").with_attr("dtype", dtype)
    }

    /// Two-input op such as `Add`.
    pub fn binary(
        name: impl Into<String>,
        op: impl Into<String>,
        lhs: impl Into<String>,
        rhs: impl Into<String>,
    ) -> Self {
        NodeDef::new(name, op).with_input(lhs).with_input(rhs)
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }
}

/// A reusable subroutine stored in the graph's library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub input_types: Vec<DataType>,
    pub output_types: Vec<DataType>,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    /// Output name to `node:slot` inside the body.
    #[serde(default)]
    pub returns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionLibrary {
    #[serde(default)]
    pub functions: Vec<FunctionDef>,
}

/// Lookup view over a function library.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionLibraryDefinition {
    functions: BTreeMap<String, FunctionDef>,
}

impl FunctionLibraryDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_library(library: &FunctionLibrary) -> Result<Self, IrError> {
        let mut lib = Self::new();
        lib.add_library(library)?;
        Ok(lib)
    }

    /// Adds every function; redefining a name with an identical body is a no-op.
    pub fn add_library(&mut self, library: &FunctionLibrary) -> Result<(), IrError> {
        for f in &library.functions {
            self.add_function(f.clone())?;
        }
        Ok(())
    }

    pub fn add_function(&mut self, function: FunctionDef) -> Result<(), IrError> {
        match self.functions.get(&function.name) {
            Some(existing) if *existing != function => Err(IrError::FunctionConflict {
                name: function.name,
            }),
            Some(_) => Ok(()),
            None => {
                self.functions.insert(function.name.clone(), function);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn to_library(&self) -> FunctionLibrary {
        FunctionLibrary {
            functions: self.functions.values().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub library: FunctionLibrary,
    #[serde(default)]
    pub version: u32,
}

impl GraphDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: NodeDef) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_node(&mut self, node: NodeDef) {
        self.nodes.push(node);
    }

    pub fn find_node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn to_json(&self) -> Result<String, IrError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, IrError> {
        Ok(serde_json::from_str(json)?)
    }
}
