//! Data-driven description of the canonical record shape.
//!
//! Every other representation of a question (the avro schema used on the bus, the
//! JSON copy, the parquet columns, the transform from the upstream API) is derived
//! from a [`RecordDescriptor`], so the field list lives in exactly one place.

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::error::DescriptorError;

pub const QUESTION_ID: &str = "question_id";
pub const TITLE: &str = "title";
pub const CREATION_DATE: &str = "creation_date";
pub const OWNER: &str = "owner";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Boolean,
    Int,
    Long,
    String,
    Array(Box<FieldKind>),
    Record(RecordDescriptor),
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Boolean => "boolean",
            FieldKind::Int => "int",
            FieldKind::Long => "long",
            FieldKind::String => "string",
            FieldKind::Array(_) => "array",
            FieldKind::Record(_) => "record",
        }
    }

    fn avro_type(&self) -> Value {
        match self {
            FieldKind::Array(items) => json!({"type": "array", "items": items.avro_type()}),
            FieldKind::Record(record) => record.avro_schema(),
            scalar => Value::String(scalar.type_name().to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
    pub nullable: bool,
}

impl FieldDescriptor {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            nullable: false,
        }
    }

    pub fn nullable(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordDescriptor {
    pub name: &'static str,
    pub namespace: Option<&'static str>,
    pub fields: Vec<FieldDescriptor>,
}

impl RecordDescriptor {
    /// The Stack Exchange question as published on the main topic.
    pub fn question() -> Self {
        let owner = RecordDescriptor {
            name: "Owner",
            namespace: None,
            fields: vec![
                FieldDescriptor::nullable("account_id", FieldKind::Long),
                FieldDescriptor::nullable("user_id", FieldKind::Long),
                FieldDescriptor::nullable("reputation", FieldKind::Int),
                FieldDescriptor::nullable("user_type", FieldKind::String),
                FieldDescriptor::nullable("display_name", FieldKind::String),
                FieldDescriptor::nullable("profile_image", FieldKind::String),
                FieldDescriptor::nullable("link", FieldKind::String),
            ],
        };

        RecordDescriptor {
            name: "StackExQuestion",
            namespace: Some("stackex"),
            fields: vec![
                FieldDescriptor::required(QUESTION_ID, FieldKind::Long),
                FieldDescriptor::required(TITLE, FieldKind::String),
                FieldDescriptor::required("link", FieldKind::String),
                FieldDescriptor::required("score", FieldKind::Int),
                FieldDescriptor::required(CREATION_DATE, FieldKind::Long),
                FieldDescriptor::required("answer_count", FieldKind::Int),
                FieldDescriptor::required("is_answered", FieldKind::Boolean),
                FieldDescriptor::required("view_count", FieldKind::Int),
                FieldDescriptor::required("tags", FieldKind::Array(Box::new(FieldKind::String))),
                FieldDescriptor::nullable("last_activity_date", FieldKind::Long),
                FieldDescriptor::nullable("content_license", FieldKind::String),
                FieldDescriptor::nullable(OWNER, FieldKind::Record(owner)),
            ],
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Checks names and uniqueness, recursing into nested records.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !is_avro_name(self.name) {
            return Err(DescriptorError::InvalidName(self.name.to_owned()));
        }
        if self.fields.is_empty() {
            return Err(DescriptorError::NoFields(self.name.to_owned()));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !is_avro_name(field.name) {
                return Err(DescriptorError::InvalidName(field.name.to_owned()));
            }
            if !seen.insert(field.name) {
                return Err(DescriptorError::DuplicateField(field.name.to_owned()));
            }
            validate_kind(&field.kind)?;
        }
        Ok(())
    }

    /// Renders the avro schema. Nullable fields become `["null", T]` unions
    /// defaulting to null.
    pub fn avro_schema(&self) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|field| {
                if field.nullable {
                    json!({
                        "name": field.name,
                        "type": ["null", field.kind.avro_type()],
                        "default": null,
                    })
                } else {
                    json!({"name": field.name, "type": field.kind.avro_type()})
                }
            })
            .collect();

        let mut schema = json!({
            "type": "record",
            "name": self.name,
            "fields": fields,
        });
        if let Some(namespace) = self.namespace {
            schema["namespace"] = Value::String(namespace.to_owned());
        }
        schema
    }
}

fn validate_kind(kind: &FieldKind) -> Result<(), DescriptorError> {
    match kind {
        FieldKind::Array(items) => validate_kind(items),
        FieldKind::Record(record) => record.validate(),
        _ => Ok(()),
    }
}

fn is_avro_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
