//! Parsing of `node:slot` tensor names and `^node` control inputs.

use std::fmt;

use crate::error::IrError;

/// A reference to one output of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId {
    pub node: String,
    pub index: usize,
}

impl TensorId {
    pub fn new(node: impl Into<String>, index: usize) -> Self {
        TensorId {
            node: node.into(),
            index,
        }
    }

    /// Parses `"node"` (slot 0) or `"node:3"`.
    pub fn parse(name: &str) -> Result<Self, IrError> {
        if name.is_empty() {
            return Err(invalid(name, "empty name"));
        }
        if name.starts_with('^') {
            return Err(invalid(name, "control input is not a tensor"));
        }
        match name.rsplit_once(':') {
            Some((node, slot)) => {
                if node.is_empty() {
                    return Err(invalid(name, "empty node name"));
                }
                let index = slot
                    .parse::<usize>()
                    .map_err(|_| invalid(name, "output index is not a non-negative integer"))?;
                Ok(TensorId::new(node, index))
            }
            None => Ok(TensorId::new(name, 0)),
        }
    }

    /// Canonical `node:slot` form, used for rendezvous keys and map lookups.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.node, self.index)
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == 0 {
            f.write_str(&self.node)
        } else {
            write!(f, "{}:{}", self.node, self.index)
        }
    }
}

fn invalid(name: &str, reason: &str) -> IrError {
    IrError::InvalidTensorName {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// One entry of a `NodeDef` input list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRef {
    Data(TensorId),
    Control(String),
}

impl InputRef {
    pub fn parse(input: &str) -> Result<Self, IrError> {
        match input.strip_prefix('^') {
            Some(node) if !node.is_empty() => Ok(InputRef::Control(node.to_string())),
            Some(_) => Err(invalid(input, "empty control input")),
            None => TensorId::parse(input).map(InputRef::Data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_slot() {
        let id = TensorId::parse("a").unwrap();
        assert_eq!(id, TensorId::new("a", 0));
        assert_eq!(id.canonical(), "a:0");
        assert_eq!(id.to_string(), "a");
    }

    #[test]
    fn test_parse_explicit_slot() {
        let id = TensorId::parse("scope/split:2").unwrap();
        assert_eq!(id.node, "scope/split");
        assert_eq!(id.index, 2);
        assert_eq!(id.to_string(), "scope/split:2");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TensorId::parse("").is_err());
        assert!(TensorId::parse("a:b").is_err());
        assert!(TensorId::parse(":1").is_err());
        assert!(TensorId::parse("^a").is_err());
    }

    #[test]
    fn test_input_ref_control() {
        assert_eq!(
            InputRef::parse("^init").unwrap(),
            InputRef::Control("init".into())
        );
        assert!(InputRef::parse("^").is_err());
        assert_eq!(
            InputRef::parse("x:1").unwrap(),
            InputRef::Data(TensorId::new("x", 1))
        );
    }
}
