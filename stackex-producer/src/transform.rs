use serde_json::{Map, Value};
use stackex_common::record::{Datum, Record};
use stackex_common::schema::{FieldKind, RecordDescriptor};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("upstream item is a JSON {0}, not an object")]
    NotAnObject(&'static str),
    #[error("required field {field} is absent from the upstream item")]
    MissingField { field: String },
    #[error("field {field} expected {expected}, found {found}")]
    IncompatibleType {
        field: String,
        expected: &'static str,
        found: String,
    },
}

/// Maps one raw upstream item onto the canonical record shape.
///
/// Raw keys the descriptor does not name are ignored, absent or null nullable
/// values stay absent and an empty nested object counts as absent.
pub fn transform(descriptor: &RecordDescriptor, raw: &Value) -> Result<Record, ValidationError> {
    match raw {
        Value::Object(object) => transform_object(descriptor, object, ""),
        other => Err(ValidationError::NotAnObject(json_type_name(other))),
    }
}

fn transform_object(
    descriptor: &RecordDescriptor,
    object: &Map<String, Value>,
    parent: &str,
) -> Result<Record, ValidationError> {
    let mut record = Record::new();
    for field in &descriptor.fields {
        let path = if parent.is_empty() {
            field.name.to_owned()
        } else {
            format!("{parent}.{}", field.name)
        };

        match (object.get(field.name), field.nullable) {
            (None | Some(Value::Null), true) => {}
            (None | Some(Value::Null), false) => {
                return Err(ValidationError::MissingField { field: path })
            }
            (Some(value), nullable) => {
                if let Some(datum) = convert(&field.kind, value, &path)? {
                    record.set(field.name, datum);
                } else if !nullable {
                    return Err(ValidationError::MissingField { field: path });
                }
            }
        }
    }
    Ok(record)
}

/// Returns `None` for an empty nested object.
fn convert(kind: &FieldKind, value: &Value, path: &str) -> Result<Option<Datum>, ValidationError> {
    let incompatible = || ValidationError::IncompatibleType {
        field: path.to_owned(),
        expected: kind.type_name(),
        found: describe(value),
    };

    let datum = match kind {
        FieldKind::Boolean => Datum::Boolean(value.as_bool().ok_or_else(incompatible)?),
        FieldKind::Long => Datum::Long(value.as_i64().ok_or_else(incompatible)?),
        FieldKind::Int => {
            let wide = value.as_i64().ok_or_else(incompatible)?;
            Datum::Int(i32::try_from(wide).map_err(|_| incompatible())?)
        }
        FieldKind::String => Datum::String(value.as_str().ok_or_else(incompatible)?.to_owned()),
        FieldKind::Array(items) => {
            let values = value.as_array().ok_or_else(incompatible)?;
            let mut converted = Vec::with_capacity(values.len());
            for (index, item) in values.iter().enumerate() {
                let item_path = format!("{path}[{index}]");
                match convert(items, item, &item_path)? {
                    Some(datum) => converted.push(datum),
                    None => {
                        return Err(ValidationError::IncompatibleType {
                            field: item_path,
                            expected: items.type_name(),
                            found: describe(item),
                        })
                    }
                }
            }
            Datum::Array(converted)
        }
        FieldKind::Record(nested) => {
            let object = value.as_object().ok_or_else(incompatible)?;
            if object.is_empty() {
                return Ok(None);
            }
            Datum::Record(transform_object(nested, object, path)?)
        }
    };
    Ok(Some(datum))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Number(number) if number.is_i64() || number.is_u64() => {
            format!("integer {number}")
        }
        other => json_type_name(other).to_owned(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(number) if number.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
