//! Parquet encoding/decoding for mart partitions and admin views.
//!
//! Mart files are the export contract: self-describing Parquet with the
//! schema embedded and column statistics, one file per `month=` partition.
//! Writer properties are fixed so identical rows always encode to identical
//! bytes; content hashes and export no-op detection depend on it.
//!
//! Schemas (all marts start with `month`, then the grouping key):
//!
//! | Mart | Extra columns |
//! |------|---------------|
//! | `department` | `department` |
//! | `organization_month` | `organization_id`, `organization_name`, `avg_length_of_stay_hours` |
//! | `payer` | `payer_id`, `payer_name`, `coverage_ratio` |
//!
//! followed by `encounter_count`, `distinct_patients`, `total_claim_cost`,
//! `total_payer_coverage`.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array as _, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde_json::Value;

use crate::conformed::ConformedEntity;
use crate::entity::EntityType;
use crate::error::{PipelineError, Result};
use crate::mart::{AggregateRow, Mart};

/// Arrow schema of a mart's partition files.
#[must_use]
pub fn mart_schema(mart: Mart) -> Arc<Schema> {
    let mut fields = vec![
        Field::new("month", DataType::Utf8, false),
        Field::new(mart.key_column(), DataType::Utf8, false),
    ];
    if let Some(name) = mart.name_column() {
        fields.push(Field::new(name, DataType::Utf8, true));
    }
    fields.extend([
        Field::new("encounter_count", DataType::Int64, false),
        Field::new("distinct_patients", DataType::Int64, false),
        Field::new("total_claim_cost", DataType::Float64, false),
        Field::new("total_payer_coverage", DataType::Float64, false),
    ]);
    if let Some(derived) = mart.derived_column() {
        fields.push(Field::new(derived, DataType::Float64, true));
    }
    Arc::new(Schema::new(fields))
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("strata-pipeline".to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

fn write_single_batch(schema: Arc<Schema>, batch: &RecordBatch) -> Result<Bytes> {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let props = writer_properties();
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(props)).map_err(|e| {
        PipelineError::Parquet {
            message: format!("parquet writer init failed: {e}"),
        }
    })?;
    writer.write(batch).map_err(|e| PipelineError::Parquet {
        message: format!("parquet write failed: {e}"),
    })?;
    writer.close().map_err(|e| PipelineError::Parquet {
        message: format!("parquet close failed: {e}"),
    })?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// Builds the record batch for a mart partition.
///
/// # Errors
///
/// Returns an error if the batch cannot be assembled.
pub fn mart_batch(mart: Mart, rows: &[AggregateRow]) -> Result<RecordBatch> {
    let schema = mart_schema(mart);
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.month.as_str()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.key.as_str()))),
    ];
    if mart.name_column().is_some() {
        columns.push(Arc::new(StringArray::from(
            rows.iter().map(|r| r.name.as_deref()).collect::<Vec<_>>(),
        )));
    }
    columns.extend([
        Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.encounter_count))) as ArrayRef,
        Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.distinct_patients))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.total_claim_cost))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.total_payer_coverage))),
    ]);
    if mart.derived_column().is_some() {
        columns.push(Arc::new(Float64Array::from(
            rows.iter().map(|r| r.derived).collect::<Vec<_>>(),
        )));
    }
    RecordBatch::try_new(schema, columns).map_err(|e| PipelineError::Parquet {
        message: format!("record batch build failed: {e}"),
    })
}

/// Encodes a mart partition.
///
/// # Errors
///
/// Returns an error if the batch cannot be built or the Parquet write fails.
pub fn write_mart(mart: Mart, rows: &[AggregateRow]) -> Result<Bytes> {
    let batch = mart_batch(mart, rows)?;
    write_single_batch(mart_schema(mart), &batch)
}

/// Decodes every record batch of a Parquet file.
///
/// # Errors
///
/// Returns an error if the payload is not valid Parquet.
pub fn read_batches(bytes: &Bytes) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes.clone())
        .map_err(|e| PipelineError::Parquet {
            message: format!("parquet reader init failed: {e}"),
        })?
        .build()
        .map_err(|e| PipelineError::Parquet {
            message: format!("parquet reader build failed: {e}"),
        })?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| PipelineError::Parquet {
            message: format!("parquet read batch failed: {e}"),
        })?;
        batches.push(batch);
    }
    Ok(batches)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str, kind: &str) -> Result<&'a T> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| PipelineError::Parquet {
            message: format!("missing column '{name}': {e}"),
        })?;

    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| PipelineError::Parquet {
            message: format!("column '{name}' is not {kind}"),
        })
}

fn col_string<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    column(batch, name, "StringArray")
}

fn col_i64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    column(batch, name, "Int64Array")
}

fn col_f64<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    column(batch, name, "Float64Array")
}

/// Decodes a mart partition file.
///
/// # Errors
///
/// Returns an error if the payload is invalid or columns are missing.
pub fn read_mart(mart: Mart, bytes: &Bytes) -> Result<Vec<AggregateRow>> {
    let mut out = Vec::new();
    for batch in read_batches(bytes)? {
        let month = col_string(&batch, "month")?;
        let key = col_string(&batch, mart.key_column())?;
        let name = mart.name_column().map(|c| col_string(&batch, c)).transpose()?;
        let encounters = col_i64(&batch, "encounter_count")?;
        let patients = col_i64(&batch, "distinct_patients")?;
        let claim = col_f64(&batch, "total_claim_cost")?;
        let coverage = col_f64(&batch, "total_payer_coverage")?;
        let derived = mart.derived_column().map(|c| col_f64(&batch, c)).transpose()?;

        for row in 0..batch.num_rows() {
            out.push(AggregateRow {
                month: month.value(row).to_string(),
                key: key.value(row).to_string(),
                name: name.and_then(|col| (!col.is_null(row)).then(|| col.value(row).to_string())),
                encounter_count: encounters.value(row),
                distinct_patients: patients.value(row),
                total_claim_cost: claim.value(row),
                total_payer_coverage: coverage.value(row),
                derived: derived.and_then(|col| (!col.is_null(row)).then(|| col.value(row))),
            });
        }
    }
    Ok(out)
}

/// Arrow schema of an entity type's admin view. Every column is text.
#[must_use]
pub fn entity_view_schema(entity_type: EntityType) -> Arc<Schema> {
    let mut fields = vec![
        Field::new("natural_key", DataType::Utf8, false),
        Field::new("partition", DataType::Utf8, false),
        Field::new("valid_from", DataType::Utf8, false),
        Field::new("ingested_at", DataType::Utf8, false),
    ];
    fields.extend(
        entity_type
            .attribute_columns()
            .iter()
            .map(|c| Field::new(*c, DataType::Utf8, true)),
    );
    Arc::new(Schema::new(fields))
}

/// Renders conformed entities as a record batch for inspection.
///
/// # Errors
///
/// Returns an error if the batch cannot be assembled.
pub fn entity_batch(entity_type: EntityType, entities: &[ConformedEntity]) -> Result<RecordBatch> {
    let attributes: Vec<_> = entities.iter().map(|e| e.attributes.columns()).collect();
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(entities.iter().map(|e| e.natural_key.as_str()))),
        Arc::new(StringArray::from_iter_values(entities.iter().map(|e| e.partition().to_string()))),
        Arc::new(StringArray::from_iter_values(entities.iter().map(|e| e.valid_from.to_rfc3339()))),
        Arc::new(StringArray::from_iter_values(entities.iter().map(|e| e.ingested_at.to_rfc3339()))),
    ];
    for column in entity_type.attribute_columns() {
        let values: Vec<Option<String>> = attributes
            .iter()
            .map(|map| match map.get(*column) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            })
            .collect();
        columns.push(Arc::new(StringArray::from(values)));
    }
    RecordBatch::try_new(entity_view_schema(entity_type), columns).map_err(|e| PipelineError::Parquet {
        message: format!("record batch build failed: {e}"),
    })
}
