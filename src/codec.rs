//! Parquet encoding of manifest snapshots.
//!
//! The artifact has one row per object with the columns `internal_location`
//! (string), `sha256` (string), `size` (int64) and `creation_date`
//! (timestamp). Readers accept any representation Arrow can cast to those
//! types, so manifests written by other tools (large strings, nanosecond
//! timestamps, unsigned sizes) load unchanged.

use crate::error::{ManifestLoadError, PublishError};
use crate::manifest::{is_valid_key, Column, ContentHash, ManifestEntry, ManifestSnapshot};
use arrow::array::{Array, ArrayRef, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::sync::Arc;

/// File-level metadata key identifying the manifest format version.
pub const MANIFEST_VERSION_KEY: &str = "SOURMASH-MANIFEST-VERSION";
/// Manifest format version written by this crate.
pub const MANIFEST_VERSION: &str = "1.0";

const ZSTD_LEVEL: i32 = 19;

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, None)
}

/// Arrow schema of the manifest artifact.
pub fn manifest_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(Column::Key.name(), DataType::Utf8, false),
        Field::new(Column::Sha256.name(), DataType::Utf8, true),
        Field::new(Column::Size.name(), DataType::Int64, false),
        Field::new(Column::CreationDate.name(), timestamp_type(), true),
    ]))
}

/// Decodes a Parquet manifest.
///
/// Fails if a required column is missing, a key or size is null, a key is
/// not a safe relative path, or a hash is malformed. Null hashes and
/// creation dates are allowed. Duplicate keys are preserved; callers resolve
/// them with [`ManifestSnapshot::unique_by_key`].
pub fn decode_manifest(data: Bytes) -> Result<ManifestSnapshot, ManifestLoadError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)?;

    for column in Column::ALL {
        if builder.schema().field_with_name(column.name()).is_err() {
            return Err(ManifestLoadError::MissingColumn(column.name().to_string()));
        }
    }

    let reader = builder.build()?;
    let mut entries = Vec::new();
    for batch in reader {
        decode_batch(&batch?, entries.len(), &mut entries)?;
    }
    Ok(ManifestSnapshot::new(entries))
}

fn column_as(
    batch: &RecordBatch,
    column: Column,
    data_type: &DataType,
) -> Result<ArrayRef, ManifestLoadError> {
    let array = batch
        .column_by_name(column.name())
        .ok_or_else(|| ManifestLoadError::MissingColumn(column.name().to_string()))?;
    Ok(cast(array.as_ref(), data_type)?)
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, column: Column) -> Result<&'a T, ManifestLoadError> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        ManifestLoadError::MissingColumn(format!("{} (unexpected type)", column.name()))
    })
}

fn decode_batch(
    batch: &RecordBatch,
    first_row: usize,
    entries: &mut Vec<ManifestEntry>,
) -> Result<(), ManifestLoadError> {
    let keys = column_as(batch, Column::Key, &DataType::Utf8)?;
    let hashes = column_as(batch, Column::Sha256, &DataType::Utf8)?;
    let sizes = column_as(batch, Column::Size, &DataType::Int64)?;
    let dates = column_as(batch, Column::CreationDate, &timestamp_type())?;

    let keys = downcast::<StringArray>(&keys, Column::Key)?;
    let hashes = downcast::<StringArray>(&hashes, Column::Sha256)?;
    let sizes = downcast::<Int64Array>(&sizes, Column::Size)?;
    let dates = downcast::<TimestampMicrosecondArray>(&dates, Column::CreationDate)?;

    for i in 0..batch.num_rows() {
        let row = first_row + i;
        if keys.is_null(i) {
            return Err(ManifestLoadError::NullValue {
                column: Column::Key.name(),
                row,
            });
        }
        let key = keys.value(i);
        if !is_valid_key(key) {
            return Err(ManifestLoadError::InvalidKey(key.to_string()));
        }

        let content_hash = if hashes.is_null(i) {
            None
        } else {
            let value = hashes.value(i);
            Some(
                ContentHash::parse(value).ok_or_else(|| ManifestLoadError::InvalidHash {
                    key: key.to_string(),
                    value: value.to_string(),
                })?,
            )
        };

        if sizes.is_null(i) {
            return Err(ManifestLoadError::NullValue {
                column: Column::Size.name(),
                row,
            });
        }
        let size = sizes.value(i);
        let size_bytes = u64::try_from(size).map_err(|_| ManifestLoadError::NegativeSize {
            key: key.to_string(),
            size,
        })?;

        let created_at = if dates.is_null(i) {
            None
        } else {
            DateTime::<Utc>::from_timestamp_micros(dates.value(i))
        };

        entries.push(ManifestEntry {
            key: key.to_string(),
            content_hash,
            size_bytes: Some(size_bytes),
            created_at,
        });
    }
    Ok(())
}

/// Encodes a snapshot as a zstd-compressed Parquet manifest.
///
/// Every entry must carry a size; a missing size would produce a row the
/// reader rejects.
pub fn encode_manifest(snapshot: &ManifestSnapshot) -> Result<Vec<u8>, PublishError> {
    let entries = snapshot.entries();

    let keys: StringArray = entries.iter().map(|e| Some(e.key.as_str())).collect();
    let hashes: StringArray = entries
        .iter()
        .map(|e| e.content_hash.as_ref().map(|h| h.as_str()))
        .collect();
    let sizes = entries
        .iter()
        .map(|e| {
            let size = e.size_bytes.ok_or_else(|| {
                PublishError::Encode(format!("entry '{}' has no size", e.key))
            })?;
            i64::try_from(size)
                .map_err(|_| PublishError::Encode(format!("size of '{}' overflows int64", e.key)))
        })
        .collect::<Result<Vec<i64>, _>>()?;
    let dates: TimestampMicrosecondArray = entries
        .iter()
        .map(|e| e.created_at.map(|t| t.timestamp_micros()))
        .collect();

    let schema = manifest_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(keys) as ArrayRef,
            Arc::new(hashes),
            Arc::new(Int64Array::from(sizes)),
            Arc::new(dates),
        ],
    )?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(ZSTD_LEVEL)?))
        .set_key_value_metadata(Some(vec![KeyValue::new(
            MANIFEST_VERSION_KEY.to_string(),
            MANIFEST_VERSION.to_string(),
        )]))
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::hash;
    use chrono::TimeZone;

    fn write_batch(batch: RecordBatch) -> Bytes {
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        Bytes::from(buffer)
    }

    #[test]
    fn test_published_manifest_loads_back() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let snapshot = ManifestSnapshot::new(vec![
            ManifestEntry::new("sigs/a.sig")
                .with_hash(hash('1'))
                .with_size(10)
                .with_created_at(created),
            ManifestEntry::new("sigs/b.sig").with_size(20),
        ]);

        let bytes = encode_manifest(&snapshot).unwrap();
        let loaded = decode_manifest(Bytes::from(bytes)).unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_missing_column_is_rejected() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("internal_location", DataType::Utf8, false),
            Field::new("size", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["a"])) as ArrayRef,
                Arc::new(Int64Array::from(vec![1])),
            ],
        )
        .unwrap();

        let err = decode_manifest(write_batch(batch)).unwrap_err();
        assert!(matches!(err, ManifestLoadError::MissingColumn(c) if c == "sha256"));
    }

    #[test]
    fn test_malformed_hash_is_rejected() {
        let batch = RecordBatch::try_new(
            manifest_schema(),
            vec![
                Arc::new(StringArray::from(vec!["a"])) as ArrayRef,
                Arc::new(StringArray::from(vec![Some("ABCDEF")])),
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(TimestampMicrosecondArray::from(vec![None::<i64>])),
            ],
        )
        .unwrap();

        let err = decode_manifest(write_batch(batch)).unwrap_err();
        assert!(matches!(err, ManifestLoadError::InvalidHash { .. }));
    }

    #[test]
    fn test_traversal_key_is_rejected() {
        let batch = RecordBatch::try_new(
            manifest_schema(),
            vec![
                Arc::new(StringArray::from(vec!["../outside"])) as ArrayRef,
                Arc::new(StringArray::from(vec![None::<&str>])),
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(TimestampMicrosecondArray::from(vec![None::<i64>])),
            ],
        )
        .unwrap();

        let err = decode_manifest(write_batch(batch)).unwrap_err();
        assert!(matches!(err, ManifestLoadError::InvalidKey(_)));
    }

    #[test]
    fn test_nanosecond_timestamps_and_large_strings_are_accepted() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("internal_location", DataType::LargeUtf8, false),
            Field::new("sha256", DataType::LargeUtf8, true),
            Field::new("size", DataType::Int64, false),
            Field::new(
                "creation_date",
                DataType::Timestamp(TimeUnit::Nanosecond, None),
                true,
            ),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(arrow::array::LargeStringArray::from(vec!["sigs/x.sig"])) as ArrayRef,
                Arc::new(arrow::array::LargeStringArray::from(vec![hash('e').as_str()])),
                Arc::new(Int64Array::from(vec![42])),
                Arc::new(arrow::array::TimestampNanosecondArray::from(vec![
                    1_700_000_000_000_000_000i64,
                ])),
            ],
        )
        .unwrap();

        let loaded = decode_manifest(write_batch(batch)).unwrap();
        let entry = &loaded.entries()[0];
        assert_eq!(entry.key, "sigs/x.sig");
        assert_eq!(entry.size_bytes, Some(42));
        assert_eq!(entry.created_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_garbage_is_not_a_manifest() {
        let err = decode_manifest(Bytes::from_static(b"not parquet at all")).unwrap_err();
        assert!(matches!(err, ManifestLoadError::Parquet(_)));
    }
}
