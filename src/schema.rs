//! Callset and operation schemas.
//!
//! A callset groups the operations a remote exposes under one wire id. Each
//! operation carries an ordered argument schema and an ordered reply schema;
//! a field's wire tag is its 1-based position in its schema.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::types::FieldType;

/// One named, typed field of an argument or reply schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub tag: u8,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub name: String,
    pub id: u16,
    #[serde(default)]
    pub args: Vec<FieldSpec>,
    #[serde(default)]
    pub reply: Vec<FieldSpec>,
}

impl OperationSpec {
    pub fn new(name: impl Into<String>, id: u16) -> Self {
        OperationSpec {
            name: name.into(),
            id,
            args: Vec::new(),
            reply: Vec::new(),
        }
    }

    /// Append a required argument.
    pub fn arg(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        push_field(&mut self.args, name.into(), ty, true);
        self
    }

    pub fn optional_arg(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        push_field(&mut self.args, name.into(), ty, false);
        self
    }

    /// Append a required reply field.
    pub fn returns(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        push_field(&mut self.reply, name.into(), ty, true);
        self
    }

    pub fn optional_return(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        push_field(&mut self.reply, name.into(), ty, false);
        self
    }

    pub fn arg_field(&self, name: &str) -> Option<&FieldSpec> {
        self.args.iter().find(|f| f.name == name)
    }

    pub fn reply_field(&self, name: &str) -> Option<&FieldSpec> {
        self.reply.iter().find(|f| f.name == name)
    }

    fn validate(&self) -> Result<()> {
        validate_fields(&self.name, "argument", &self.args)?;
        validate_fields(&self.name, "reply", &self.reply)
    }
}

fn push_field(fields: &mut Vec<FieldSpec>, name: String, ty: FieldType, required: bool) {
    // Overflowing the tag space is reported by validate() as tag 0.
    let tag = u8::try_from(fields.len() + 1).unwrap_or(0);
    fields.push(FieldSpec {
        name,
        tag,
        ty,
        required,
    });
}

fn validate_fields(operation: &str, kind: &str, fields: &[FieldSpec]) -> Result<()> {
    let mut names = HashSet::new();
    let mut tags = HashSet::new();
    for field in fields {
        if field.tag == 0 {
            return Err(RpcError::schema(format!(
                "{} field {} of {} has reserved tag 0",
                kind, field.name, operation
            )));
        }
        if !names.insert(field.name.as_str()) {
            return Err(RpcError::schema(format!(
                "duplicate {} field {} in {}",
                kind, field.name, operation
            )));
        }
        if !tags.insert(field.tag) {
            return Err(RpcError::schema(format!(
                "duplicate {} tag {} in {}",
                kind, field.tag, operation
            )));
        }
    }
    Ok(())
}

/// Static definition of a callset, before it is bound to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallsetDef {
    pub name: String,
    pub id: u16,
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

impl CallsetDef {
    pub fn new(name: impl Into<String>, id: u16) -> Self {
        CallsetDef {
            name: name.into(),
            id,
            operations: Vec::new(),
        }
    }

    pub fn operation(mut self, operation: OperationSpec) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn find(&self, name: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn find_by_id(&self, id: u16) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Parse a definition from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        let def: CallsetDef = serde_json::from_str(json)
            .map_err(|e| RpcError::schema(format!("invalid callset JSON: {}", e)))?;
        def.validate()?;
        Ok(def)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RpcError::schema("callset name is empty"));
        }
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for op in &self.operations {
            if !names.insert(op.name.as_str()) {
                return Err(RpcError::schema(format!(
                    "duplicate operation {} in {}",
                    op.name, self.name
                )));
            }
            if !ids.insert(op.id) {
                return Err(RpcError::schema(format!(
                    "duplicate operation id {} in {}",
                    op.id, self.name
                )));
            }
            op.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assigns_tags() {
        let op = OperationSpec::new("add", 1)
            .arg("a", FieldType::Int32)
            .arg("b", FieldType::Int32)
            .returns("sum", FieldType::Int32);
        assert_eq!(op.arg_field("a").map(|f| f.tag), Some(1));
        assert_eq!(op.arg_field("b").map(|f| f.tag), Some(2));
        assert_eq!(op.reply_field("sum").map(|f| f.tag), Some(1));
        assert!(op.arg_field("b").unwrap().required);
    }

    #[test]
    fn test_duplicate_operation_rejected() {
        let def = CallsetDef::new("Dup", 9)
            .operation(OperationSpec::new("ping", 1))
            .operation(OperationSpec::new("ping", 2));
        assert!(matches!(def.validate(), Err(RpcError::Schema(_))));

        let def = CallsetDef::new("Dup", 9)
            .operation(OperationSpec::new("ping", 1))
            .operation(OperationSpec::new("pong", 1));
        assert!(matches!(def.validate(), Err(RpcError::Schema(_))));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let def = CallsetDef::new("Dup", 9).operation(
            OperationSpec::new("ping", 1)
                .arg("x", FieldType::Bool)
                .optional_arg("x", FieldType::Int8),
        );
        assert!(matches!(def.validate(), Err(RpcError::Schema(_))));
    }

    #[test]
    fn test_callset_from_json() {
        let json = r#"{
            "name": "EchoCallset",
            "id": 7,
            "operations": [
                {
                    "name": "echo",
                    "id": 1,
                    "args": [{"name": "text", "tag": 1, "type": {"kind": "string"}, "required": true}],
                    "reply": [{"name": "text", "tag": 1, "type": {"kind": "string"}, "required": true}]
                }
            ]
        }"#;
        let def = CallsetDef::from_json(json).unwrap();
        assert_eq!(def.id, 7);
        let echo = def.find("echo").unwrap();
        assert_eq!(echo.args[0].ty, FieldType::string());
        assert_eq!(def.find_by_id(1).map(|op| op.name.as_str()), Some("echo"));
    }
}
