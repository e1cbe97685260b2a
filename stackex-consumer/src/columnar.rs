use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Int32Array, Int64Array, ListArray, StringArray, StructArray};
use arrow::buffer::{NullBuffer, OffsetBuffer};
use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use stackex_common::record::{Datum, Record};
use stackex_common::schema::{FieldDescriptor, FieldKind, RecordDescriptor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ColumnarError {
    #[error("column {field} expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Parquet(#[from] ParquetError),
}

/// Writes records as snappy-compressed Parquet with columns derived from the descriptor.
pub struct ParquetEncoder {
    descriptor: RecordDescriptor,
    schema: SchemaRef,
}

impl ParquetEncoder {
    pub fn new(descriptor: RecordDescriptor) -> Self {
        let schema = Arc::new(Schema::new(fields_of(&descriptor)));
        Self { descriptor, schema }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn encode(&self, records: &[&Record]) -> Result<Vec<u8>, ColumnarError> {
        let columns = self
            .descriptor
            .fields
            .iter()
            .map(|field| {
                let values: Vec<Option<&Datum>> =
                    records.iter().map(|record| record.get(field.name)).collect();
                build_column(&field.kind, &values, field.name)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let batch = RecordBatch::try_new(self.schema.clone(), columns)?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, self.schema.clone(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;

        Ok(buffer)
    }

    pub fn encode_one(&self, record: &Record) -> Result<Vec<u8>, ColumnarError> {
        self.encode(&[record])
    }
}

fn fields_of(descriptor: &RecordDescriptor) -> Fields {
    descriptor
        .fields
        .iter()
        .map(|field: &FieldDescriptor| Field::new(field.name, data_type(&field.kind), field.nullable))
        .collect()
}

fn data_type(kind: &FieldKind) -> DataType {
    match kind {
        FieldKind::Boolean => DataType::Boolean,
        FieldKind::Int => DataType::Int32,
        FieldKind::Long => DataType::Int64,
        FieldKind::String => DataType::Utf8,
        FieldKind::Array(items) => DataType::List(item_field(items)),
        FieldKind::Record(nested) => DataType::Struct(fields_of(nested)),
    }
}

fn item_field(items: &FieldKind) -> Arc<Field> {
    Arc::new(Field::new("item", data_type(items), true))
}

fn mismatch(kind: &FieldKind, datum: &Datum, path: &str) -> ColumnarError {
    ColumnarError::TypeMismatch {
        field: path.to_owned(),
        expected: kind.type_name(),
        found: datum.type_name(),
    }
}

/// Builds one column from per-row values, `None` meaning null.
fn build_column(
    kind: &FieldKind,
    values: &[Option<&Datum>],
    path: &str,
) -> Result<ArrayRef, ColumnarError> {
    let array: ArrayRef = match kind {
        FieldKind::Boolean => Arc::new(
            values
                .iter()
                .map(|value| match value {
                    None => Ok(None),
                    Some(Datum::Boolean(v)) => Ok(Some(*v)),
                    Some(other) => Err(mismatch(kind, other, path)),
                })
                .collect::<Result<BooleanArray, _>>()?,
        ),
        FieldKind::Int => Arc::new(
            values
                .iter()
                .map(|value| match value {
                    None => Ok(None),
                    Some(Datum::Int(v)) => Ok(Some(*v)),
                    Some(other) => Err(mismatch(kind, other, path)),
                })
                .collect::<Result<Int32Array, _>>()?,
        ),
        FieldKind::Long => Arc::new(
            values
                .iter()
                .map(|value| match value {
                    None => Ok(None),
                    Some(Datum::Long(v)) => Ok(Some(*v)),
                    Some(other) => Err(mismatch(kind, other, path)),
                })
                .collect::<Result<Int64Array, _>>()?,
        ),
        FieldKind::String => Arc::new(
            values
                .iter()
                .map(|value| match value {
                    None => Ok(None),
                    Some(Datum::String(v)) => Ok(Some(v.as_str())),
                    Some(other) => Err(mismatch(kind, other, path)),
                })
                .collect::<Result<StringArray, _>>()?,
        ),
        FieldKind::Array(items) => {
            let mut lengths = Vec::with_capacity(values.len());
            let mut validity = Vec::with_capacity(values.len());
            let mut flattened = Vec::new();
            for value in values {
                match value {
                    None => {
                        lengths.push(0);
                        validity.push(false);
                    }
                    Some(Datum::Array(elements)) => {
                        lengths.push(elements.len());
                        validity.push(true);
                        flattened.extend(elements.iter().map(Some));
                    }
                    Some(other) => return Err(mismatch(kind, other, path)),
                }
            }

            let child = build_column(items, &flattened, &format!("{path}.item"))?;
            Arc::new(ListArray::try_new(
                item_field(items),
                OffsetBuffer::from_lengths(lengths),
                child,
                Some(NullBuffer::from(validity)),
            )?)
        }
        FieldKind::Record(nested) => {
            let mut validity = Vec::with_capacity(values.len());
            let mut rows = Vec::with_capacity(values.len());
            for value in values {
                match value {
                    None => {
                        validity.push(false);
                        rows.push(None);
                    }
                    Some(Datum::Record(record)) => {
                        validity.push(true);
                        rows.push(Some(record));
                    }
                    Some(other) => return Err(mismatch(kind, other, path)),
                }
            }

            let children = nested
                .fields
                .iter()
                .map(|field| {
                    let column: Vec<Option<&Datum>> = rows
                        .iter()
                        .map(|row| row.and_then(|record| record.get(field.name)))
                        .collect();
                    build_column(&field.kind, &column, &format!("{path}.{}", field.name))
                })
                .collect::<Result<Vec<_>, _>>()?;

            Arc::new(StructArray::try_new(
                fields_of(nested),
                children,
                Some(NullBuffer::from(validity)),
            )?)
        }
    };
    Ok(array)
}
