use apache_avro::types::Value as AvroValue;
use apache_avro::{from_avro_datum, to_avro_datum, Schema};
use serde_json::{Map, Value as JsonValue};

use crate::error::{DecodeError, DescriptorError, SchemaViolation};
use crate::record::{Datum, Record};
use crate::schema::{FieldDescriptor, FieldKind, RecordDescriptor};

/// Binary avro codec for one active record descriptor.
///
/// The schema is parsed once when the codec is built. Encoding is strict: ints are
/// not widened, unknown fields are refused and required fields must be present.
#[derive(Debug, Clone)]
pub struct AvroCodec {
    descriptor: RecordDescriptor,
    schema: Schema,
}

impl AvroCodec {
    pub fn new(descriptor: RecordDescriptor) -> Result<Self, DescriptorError> {
        descriptor.validate()?;
        let schema = Schema::parse(&descriptor.avro_schema())
            .map_err(|e| DescriptorError::Parse(e.to_string()))?;
        Ok(Self { descriptor, schema })
    }

    pub fn descriptor(&self) -> &RecordDescriptor {
        &self.descriptor
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn encode(&self, record: &Record) -> Result<Vec<u8>, SchemaViolation> {
        let value = encode_record(&self.descriptor, record, "")?;
        to_avro_datum(&self.schema, value).map_err(|e| SchemaViolation::Rejected(e.to_string()))
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Record, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }

        let mut reader = payload;
        let value = from_avro_datum(&self.schema, &mut reader, None)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        if !reader.is_empty() {
            return Err(DecodeError::TrailingBytes {
                remaining: reader.len(),
            });
        }

        decode_record(&self.descriptor, value, "")
    }

    /// Logical JSON form of a record: every descriptor field is present, absent
    /// nullable fields render as `null`.
    pub fn to_json(&self, record: &Record) -> JsonValue {
        record_to_json(&self.descriptor, record)
    }
}

fn field_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}.{name}")
    }
}

fn encode_record(
    descriptor: &RecordDescriptor,
    record: &Record,
    parent: &str,
) -> Result<AvroValue, SchemaViolation> {
    if let Some(unknown) = record.names().find(|name| descriptor.field(name).is_none()) {
        return Err(SchemaViolation::UnknownField {
            field: field_path(parent, unknown),
        });
    }

    let mut fields = Vec::with_capacity(descriptor.fields.len());
    for field in &descriptor.fields {
        let path = field_path(parent, field.name);
        let value = match (record.get(field.name), field.nullable) {
            (None, true) => AvroValue::Union(0, Box::new(AvroValue::Null)),
            (None, false) => return Err(SchemaViolation::MissingField { field: path }),
            (Some(datum), true) => {
                AvroValue::Union(1, Box::new(encode_datum(&field.kind, datum, &path)?))
            }
            (Some(datum), false) => encode_datum(&field.kind, datum, &path)?,
        };
        fields.push((field.name.to_owned(), value));
    }

    Ok(AvroValue::Record(fields))
}

fn encode_datum(kind: &FieldKind, datum: &Datum, path: &str) -> Result<AvroValue, SchemaViolation> {
    match (kind, datum) {
        (FieldKind::Boolean, Datum::Boolean(value)) => Ok(AvroValue::Boolean(*value)),
        (FieldKind::Int, Datum::Int(value)) => Ok(AvroValue::Int(*value)),
        (FieldKind::Long, Datum::Long(value)) => Ok(AvroValue::Long(*value)),
        (FieldKind::String, Datum::String(value)) => Ok(AvroValue::String(value.clone())),
        (FieldKind::Array(items), Datum::Array(values)) => values
            .iter()
            .enumerate()
            .map(|(index, value)| encode_datum(items, value, &format!("{path}[{index}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(AvroValue::Array),
        (FieldKind::Record(nested), Datum::Record(record)) => encode_record(nested, record, path),
        (kind, datum) => Err(SchemaViolation::TypeMismatch {
            field: path.to_owned(),
            expected: kind.type_name(),
            found: datum.type_name(),
        }),
    }
}

fn decode_record(
    descriptor: &RecordDescriptor,
    value: AvroValue,
    parent: &str,
) -> Result<Record, DecodeError> {
    let values = match value {
        AvroValue::Record(values) => values,
        other => {
            return Err(DecodeError::SchemaMismatch {
                field: parent.to_owned(),
                found: avro_type_name(&other).to_owned(),
            })
        }
    };

    let mut record = Record::new();
    for (name, value) in values {
        let path = field_path(parent, &name);
        let Some(field) = descriptor.field(&name) else {
            return Err(DecodeError::SchemaMismatch {
                field: path,
                found: "unknown field".to_owned(),
            });
        };
        if let Some(datum) = decode_field(field, value, &path)? {
            record.set(name, datum);
        }
    }

    Ok(record)
}

fn decode_field(
    field: &FieldDescriptor,
    value: AvroValue,
    path: &str,
) -> Result<Option<Datum>, DecodeError> {
    match (field.nullable, value) {
        (true, AvroValue::Union(_, inner)) => match *inner {
            AvroValue::Null => Ok(None),
            inner => decode_datum(&field.kind, inner, path).map(Some),
        },
        (true, AvroValue::Null) => Ok(None),
        (_, value) => decode_datum(&field.kind, value, path).map(Some),
    }
}

fn decode_datum(kind: &FieldKind, value: AvroValue, path: &str) -> Result<Datum, DecodeError> {
    match (kind, value) {
        (FieldKind::Boolean, AvroValue::Boolean(value)) => Ok(Datum::Boolean(value)),
        (FieldKind::Int, AvroValue::Int(value)) => Ok(Datum::Int(value)),
        (FieldKind::Long, AvroValue::Long(value)) => Ok(Datum::Long(value)),
        (FieldKind::String, AvroValue::String(value)) => Ok(Datum::String(value)),
        (FieldKind::Array(items), AvroValue::Array(values)) => values
            .into_iter()
            .enumerate()
            .map(|(index, value)| decode_datum(items, value, &format!("{path}[{index}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Datum::Array),
        (FieldKind::Record(nested), value) => decode_record(nested, value, path).map(Datum::Record),
        (_, value) => Err(DecodeError::SchemaMismatch {
            field: path.to_owned(),
            found: avro_type_name(&value).to_owned(),
        }),
    }
}

fn avro_type_name(value: &AvroValue) -> &'static str {
    match value {
        AvroValue::Null => "null",
        AvroValue::Boolean(_) => "boolean",
        AvroValue::Int(_) => "int",
        AvroValue::Long(_) => "long",
        AvroValue::Float(_) => "float",
        AvroValue::Double(_) => "double",
        AvroValue::Bytes(_) => "bytes",
        AvroValue::String(_) => "string",
        AvroValue::Array(_) => "array",
        AvroValue::Map(_) => "map",
        AvroValue::Record(_) => "record",
        AvroValue::Union(_, _) => "union",
        AvroValue::Enum(_, _) => "enum",
        _ => "other",
    }
}

fn record_to_json(descriptor: &RecordDescriptor, record: &Record) -> JsonValue {
    let mut object = Map::with_capacity(descriptor.fields.len());
    for field in &descriptor.fields {
        let value = match (record.get(field.name), &field.kind) {
            (Some(Datum::Record(nested)), FieldKind::Record(nested_descriptor)) => {
                record_to_json(nested_descriptor, nested)
            }
            (Some(datum), _) => datum_to_json(datum),
            (None, _) => JsonValue::Null,
        };
        object.insert(field.name.to_owned(), value);
    }
    JsonValue::Object(object)
}

fn datum_to_json(datum: &Datum) -> JsonValue {
    match datum {
        Datum::Null => JsonValue::Null,
        Datum::Boolean(value) => JsonValue::Bool(*value),
        Datum::Int(value) => JsonValue::from(*value),
        Datum::Long(value) => JsonValue::from(*value),
        Datum::String(value) => JsonValue::String(value.clone()),
        Datum::Array(values) => JsonValue::Array(values.iter().map(datum_to_json).collect()),
        Datum::Record(record) => JsonValue::Object(
            record
                .names()
                .filter_map(|name| Some((name.to_owned(), datum_to_json(record.get(name)?))))
                .collect(),
        ),
    }
}
