//! Consolidated-dataset persistence.
//!
//! Each dataset is one Parquet file plus a small JSON metadata record.
//! Both are written to a staging path and renamed over the previous file,
//! so the dashboard process reading these files never observes partial
//! output.

use crate::error::{EtlError, Result};
use crate::merge::{Dataset, NewRow};
use crate::schema::{CamelCategory, IndicatorValue, PygValue, Segment};
use arrow::array::{Array, ArrayRef, Date32Array, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{Duration, NaiveDate, Utc};
use log::info;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Processing metadata written alongside each Parquet file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub generated_at: String,
    pub latest_period: Option<NaiveDate>,
    pub rows: usize,
    pub entities: usize,
}

impl DatasetMeta {
    fn describe<V>(dataset: &Dataset<V>) -> Self {
        DatasetMeta {
            generated_at: Utc::now().to_rfc3339(),
            latest_period: dataset.latest_period(),
            rows: dataset.len(),
            entities: dataset.entity_count(),
        }
    }
}

fn date32(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

fn from_date32(days: i32) -> NaiveDate {
    NaiveDate::default() + Duration::days(days as i64)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".staging");
    PathBuf::from(name)
}

fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

/// Write a record batch and its metadata atomically: both land at staging
/// paths first and are renamed into place only once fully written.
fn write_atomic(path: &Path, batch: RecordBatch, meta: &DatasetMeta) -> Result<()> {
    let staging = staging_path(path);
    let file = File::create(&staging)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;

    let meta_file = meta_path(path);
    let meta_staging = staging_path(&meta_file);
    serde_json::to_writer_pretty(File::create(&meta_staging)?, meta)?;

    std::fs::rename(&staging, path)?;
    std::fs::rename(&meta_staging, &meta_file)?;
    info!(
        "wrote {} ({} rows, {} entities)",
        path.display(),
        meta.rows,
        meta.entities
    );
    Ok(())
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| column_error(name, path))
}

fn date_column<'a>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a Date32Array> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<Date32Array>())
        .ok_or_else(|| column_error(name, path))
}

fn float_column<'a>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a Float64Array> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<Float64Array>())
        .ok_or_else(|| column_error(name, path))
}

fn column_error(name: &str, path: &Path) -> EtlError {
    EtlError::format(
        path.display().to_string(),
        format!("missing or mistyped column '{}'", name),
    )
}

fn identity_fields() -> Vec<Field> {
    vec![
        Field::new("period", DataType::Date32, false),
        Field::new("segment", DataType::Utf8, false),
        Field::new("entity", DataType::Utf8, false),
    ]
}

struct IdentityColumns {
    periods: Date32Array,
    segments: StringArray,
    entities: StringArray,
}

fn identity_columns<'a, V: 'a>(
    rows: impl Iterator<Item = crate::merge::ResolvedRow<'a, V>>,
) -> IdentityColumns {
    let mut periods = Vec::new();
    let mut segments = Vec::new();
    let mut entities = Vec::new();
    for row in rows {
        periods.push(date32(row.period));
        segments.push(row.segment.as_str().to_string());
        entities.push(row.entity.to_string());
    }
    IdentityColumns {
        periods: Date32Array::from(periods),
        segments: StringArray::from(segments),
        entities: StringArray::from(entities),
    }
}

pub fn write_balance(dataset: &Dataset<f64>, path: &Path) -> Result<()> {
    let mut fields = identity_fields();
    fields.push(Field::new("account_code", DataType::Utf8, false));
    fields.push(Field::new("value", DataType::Float64, false));
    let schema = Arc::new(Schema::new(fields));

    let identity = identity_columns(dataset.iter());
    let codes: StringArray = dataset.iter().map(|r| Some(r.code.to_string())).collect();
    let values = Float64Array::from(dataset.iter().map(|r| *r.value).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(identity.periods) as ArrayRef,
            Arc::new(identity.segments),
            Arc::new(identity.entities),
            Arc::new(codes),
            Arc::new(values),
        ],
    )?;
    write_atomic(path, batch, &DatasetMeta::describe(dataset))
}

pub fn read_balance(path: &Path) -> Result<Dataset<f64>> {
    let mut dataset = Dataset::new();
    for batch in read_batches(path)? {
        let periods = date_column(&batch, "period", path)?;
        let segments = string_column(&batch, "segment", path)?;
        let entities = string_column(&batch, "entity", path)?;
        let codes = string_column(&batch, "account_code", path)?;
        let values = float_column(&batch, "value", path)?;

        let mut rows = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            rows.push(NewRow {
                entity: entities.value(i).to_string(),
                segment: Segment::from_label(segments.value(i)),
                period: from_date32(periods.value(i)),
                code: codes.value(i).to_string(),
                value: values.value(i),
            });
        }
        dataset.merge(rows);
    }
    Ok(dataset)
}

pub fn write_pyg(dataset: &Dataset<PygValue>, path: &Path) -> Result<()> {
    let mut fields = identity_fields();
    fields.push(Field::new("account_code", DataType::Utf8, false));
    fields.push(Field::new("cumulative", DataType::Float64, false));
    fields.push(Field::new("monthly", DataType::Float64, false));
    fields.push(Field::new("trailing_12m", DataType::Float64, true));
    let schema = Arc::new(Schema::new(fields));

    let identity = identity_columns(dataset.iter());
    let codes: StringArray = dataset.iter().map(|r| Some(r.code.to_string())).collect();
    let cumulative =
        Float64Array::from(dataset.iter().map(|r| r.value.cumulative).collect::<Vec<_>>());
    let monthly = Float64Array::from(dataset.iter().map(|r| r.value.monthly).collect::<Vec<_>>());
    let trailing =
        Float64Array::from(dataset.iter().map(|r| r.value.trailing_12m).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(identity.periods) as ArrayRef,
            Arc::new(identity.segments),
            Arc::new(identity.entities),
            Arc::new(codes),
            Arc::new(cumulative),
            Arc::new(monthly),
            Arc::new(trailing),
        ],
    )?;
    write_atomic(path, batch, &DatasetMeta::describe(dataset))
}

pub fn read_pyg(path: &Path) -> Result<Dataset<PygValue>> {
    let mut dataset = Dataset::new();
    for batch in read_batches(path)? {
        let periods = date_column(&batch, "period", path)?;
        let segments = string_column(&batch, "segment", path)?;
        let entities = string_column(&batch, "entity", path)?;
        let codes = string_column(&batch, "account_code", path)?;
        let cumulative = float_column(&batch, "cumulative", path)?;
        let monthly = float_column(&batch, "monthly", path)?;
        let trailing = float_column(&batch, "trailing_12m", path)?;

        let mut rows = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            rows.push(NewRow {
                entity: entities.value(i).to_string(),
                segment: Segment::from_label(segments.value(i)),
                period: from_date32(periods.value(i)),
                code: codes.value(i).to_string(),
                value: PygValue {
                    cumulative: cumulative.value(i),
                    monthly: monthly.value(i),
                    trailing_12m: if trailing.is_null(i) {
                        None
                    } else {
                        Some(trailing.value(i))
                    },
                },
            });
        }
        dataset.merge(rows);
    }
    Ok(dataset)
}

pub fn write_indicators(dataset: &Dataset<IndicatorValue>, path: &Path) -> Result<()> {
    let mut fields = identity_fields();
    fields.push(Field::new("indicator_code", DataType::Utf8, false));
    fields.push(Field::new("category", DataType::Utf8, false));
    fields.push(Field::new("value_ratio", DataType::Float64, false));
    let schema = Arc::new(Schema::new(fields));

    let identity = identity_columns(dataset.iter());
    let codes: StringArray = dataset.iter().map(|r| Some(r.code.to_string())).collect();
    let categories: StringArray = dataset
        .iter()
        .map(|r| Some(r.value.category.as_str().to_string()))
        .collect();
    let ratios = Float64Array::from(dataset.iter().map(|r| r.value.ratio).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(identity.periods) as ArrayRef,
            Arc::new(identity.segments),
            Arc::new(identity.entities),
            Arc::new(codes),
            Arc::new(categories),
            Arc::new(ratios),
        ],
    )?;
    write_atomic(path, batch, &DatasetMeta::describe(dataset))
}

pub fn read_indicators(path: &Path) -> Result<Dataset<IndicatorValue>> {
    let mut dataset = Dataset::new();
    for batch in read_batches(path)? {
        let periods = date_column(&batch, "period", path)?;
        let segments = string_column(&batch, "segment", path)?;
        let entities = string_column(&batch, "entity", path)?;
        let codes = string_column(&batch, "indicator_code", path)?;
        let categories = string_column(&batch, "category", path)?;
        let ratios = float_column(&batch, "value_ratio", path)?;

        let mut rows = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            let category = CamelCategory::from_str_opt(categories.value(i))
                .ok_or_else(|| column_error("category", path))?;
            rows.push(NewRow {
                entity: entities.value(i).to_string(),
                segment: Segment::from_label(segments.value(i)),
                period: from_date32(periods.value(i)),
                code: codes.value(i).to_string(),
                value: IndicatorValue {
                    category,
                    ratio: ratios.value(i),
                },
            });
        }
        dataset.merge(rows);
    }
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use tempfile::tempdir;

    fn eom(y: i32, m: u32) -> NaiveDate {
        crate::dates::last_day_of_month(y, m)
    }

    #[test]
    fn test_date32_roundtrip() {
        for date in [eom(1990, 1), eom(2023, 6), eom(2025, 12)] {
            assert_eq!(from_date32(date32(date)), date);
        }
        assert_eq!(date32(NaiveDate::default()), 0);
    }

    #[test]
    fn test_balance_roundtrip_and_meta() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("balance.parquet");

        let mut ds: Dataset<f64> = Dataset::new();
        ds.merge(vec![
            NewRow {
                entity: "ANDINA LTDA".to_string(),
                segment: Segment::One,
                period: eom(2023, 6),
                code: "1".to_string(),
                value: 1_000_000.0,
            },
            NewRow {
                entity: "Mutualista Ambato".to_string(),
                segment: Segment::MutualistaOne,
                period: eom(2023, 6),
                code: "14".to_string(),
                value: 250_000.0,
            },
        ]);
        write_balance(&ds, &path)?;

        let restored = read_balance(&path)?;
        assert_eq!(restored.len(), 2);
        assert!(restored.contains_entity("Mutualista Ambato"));
        let row = restored
            .iter()
            .find(|r| r.code == "14")
            .expect("row survives roundtrip");
        assert_eq!(row.segment, Segment::MutualistaOne);
        assert_eq!(*row.value, 250_000.0);

        let meta: DatasetMeta =
            serde_json::from_reader(File::open(dir.path().join("balance.meta.json"))?)?;
        assert_eq!(meta.rows, 2);
        assert_eq!(meta.entities, 2);
        assert_eq!(meta.latest_period, Some(eom(2023, 6)));
        Ok(())
    }

    #[test]
    fn test_pyg_roundtrip_preserves_nullable_trailing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("pyg.parquet");

        let mut ds: Dataset<PygValue> = Dataset::new();
        ds.merge(vec![
            NewRow {
                entity: "A".to_string(),
                segment: Segment::Two,
                period: eom(2023, 1),
                code: "51".to_string(),
                value: PygValue {
                    cumulative: 100.0,
                    monthly: 100.0,
                    trailing_12m: None,
                },
            },
            NewRow {
                entity: "A".to_string(),
                segment: Segment::Two,
                period: eom(2023, 12),
                code: "51".to_string(),
                value: PygValue {
                    cumulative: 900.0,
                    monthly: 50.0,
                    trailing_12m: Some(900.0),
                },
            },
        ]);
        write_pyg(&ds, &path)?;

        let restored = read_pyg(&path)?;
        let by_month: Vec<Option<f64>> =
            restored.iter().map(|r| r.value.trailing_12m).collect();
        assert_eq!(by_month, vec![None, Some(900.0)]);
        Ok(())
    }

    #[test]
    fn test_indicator_roundtrip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("indicadores.parquet");

        let mut ds: Dataset<IndicatorValue> = Dataset::new();
        ds.merge(vec![NewRow {
            entity: "ANDINA LTDA".to_string(),
            segment: Segment::One,
            period: eom(2024, 3),
            code: "ROE".to_string(),
            value: IndicatorValue {
                category: CamelCategory::Earnings,
                ratio: 0.081,
            },
        }]);
        write_indicators(&ds, &path)?;

        let restored = read_indicators(&path)?;
        let row = restored.iter().next().expect("one row");
        assert_eq!(row.code, "ROE");
        assert_eq!(row.value.category, CamelCategory::Earnings);
        assert_eq!(row.value.ratio, 0.081);
        assert_eq!(row.period.year(), 2024);
        Ok(())
    }

    #[test]
    fn test_replace_leaves_no_staging_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("balance.parquet");

        let mut ds: Dataset<f64> = Dataset::new();
        ds.merge(vec![NewRow {
            entity: "A".to_string(),
            segment: Segment::One,
            period: eom(2023, 1),
            code: "1".to_string(),
            value: 1.0,
        }]);
        write_balance(&ds, &path)?;
        // Second write replaces the first in place.
        write_balance(&ds, &path)?;

        let names: Vec<String> = std::fs::read_dir(dir.path())?
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".staging")), "{names:?}");
        Ok(())
    }
}
