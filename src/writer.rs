//! Parquet part-files, one per chunk.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use arrow_array::{Array, ArrayRef, BooleanArray, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field, Schema, SchemaRef};
use clap::ValueEnum;
use log::debug;
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::{Compression, GzipLevel, ZstdLevel},
    file::{
        properties::WriterProperties,
        reader::{FileReader, SerializedFileReader},
    },
};

use crate::{error::WriteError, record::DocumentRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum PartCompression {
    #[default]
    Snappy,
    Zstd,
    Gzip,
    None,
}

impl PartCompression {
    fn codec(self) -> Compression {
        match self {
            PartCompression::Snappy => Compression::SNAPPY,
            PartCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            PartCompression::Gzip => Compression::GZIP(GzipLevel::default()),
            PartCompression::None => Compression::UNCOMPRESSED,
        }
    }
}

/// Column layout shared by every part-file.
pub fn schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(Schema::new(vec![
                Field::new("valid", DataType::Boolean, false),
                Field::new("title", DataType::Utf8, true),
                Field::new("abstract", DataType::Utf8, true),
                Field::new("citations", DataType::Utf8, false),
                Field::new("pmid", DataType::Utf8, true),
                Field::new("pmc", DataType::Utf8, true),
                Field::new("doi", DataType::Utf8, true),
                Field::new("journal", DataType::Utf8, true),
                Field::new("processing_date", DataType::Utf8, false),
            ]))
        })
        .clone()
}

/// Zero-padded so lexical order of file names is chunk order.
pub fn part_file_name(index: usize) -> String {
    format!("part_{:05}.parquet", index)
}

#[derive(Debug, Clone)]
pub struct PartWriter {
    output_dir: PathBuf,
    props: WriterProperties,
}

impl PartWriter {
    pub fn new(output_dir: &Path, compression: PartCompression) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            props: WriterProperties::builder()
                .set_compression(compression.codec())
                .build(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Writes (or overwrites) the part-file for chunk `index`.
    pub fn write_part(&self, index: usize, records: &[DocumentRecord]) -> Result<PathBuf, WriteError> {
        let path = self.output_dir.join(part_file_name(index));
        let batch = to_record_batch(records)?;

        let file = File::create(&path).map_err(|source| WriteError::Create {
            path: path.clone(),
            source,
        })?;
        let parquet_error = |source| WriteError::Parquet {
            path: path.clone(),
            source,
        };
        let mut writer =
            ArrowWriter::try_new(file, batch.schema(), Some(self.props.clone())).map_err(parquet_error)?;
        writer.write(&batch).map_err(parquet_error)?;
        writer.close().map_err(parquet_error)?;

        debug!("Wrote {} rows to {}", records.len(), path.display());
        Ok(path)
    }
}

fn to_record_batch(records: &[DocumentRecord]) -> Result<RecordBatch, ArrowError> {
    let optional = |field: fn(&DocumentRecord) -> Option<&str>| -> ArrayRef {
        Arc::new(records.iter().map(field).collect::<StringArray>())
    };
    let required = |field: fn(&DocumentRecord) -> &str| -> ArrayRef {
        Arc::new(StringArray::from_iter_values(records.iter().map(field)))
    };

    let columns: Vec<ArrayRef> = vec![
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.valid).collect::<Vec<bool>>(),
        )),
        optional(|r| r.title.as_deref()),
        optional(|r| r.abstract_text.as_deref()),
        required(|r| r.citations.as_str()),
        optional(|r| r.pmid.as_deref()),
        optional(|r| r.pmc.as_deref()),
        optional(|r| r.doi.as_deref()),
        optional(|r| r.journal.as_deref()),
        required(|r| r.processing_date.as_str()),
    ];
    RecordBatch::try_new(schema(), columns)
}

/// Reads a part-file back into records.
pub fn read_part(path: &Path) -> Result<Vec<DocumentRecord>, WriteError> {
    let file = File::open(path).map_err(|source| WriteError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let parquet_error = |source| WriteError::Parquet {
        path: path.to_path_buf(),
        source,
    };
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(parquet_error)?
        .build()
        .map_err(parquet_error)?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let valid = column::<BooleanArray>(&batch, "valid", path)?;
        let title = column::<StringArray>(&batch, "title", path)?;
        let abstract_text = column::<StringArray>(&batch, "abstract", path)?;
        let citations = column::<StringArray>(&batch, "citations", path)?;
        let pmid = column::<StringArray>(&batch, "pmid", path)?;
        let pmc = column::<StringArray>(&batch, "pmc", path)?;
        let doi = column::<StringArray>(&batch, "doi", path)?;
        let journal = column::<StringArray>(&batch, "journal", path)?;
        let processing_date = column::<StringArray>(&batch, "processing_date", path)?;

        for i in 0..batch.num_rows() {
            records.push(DocumentRecord {
                valid: valid.value(i),
                title: value_at(title, i),
                abstract_text: value_at(abstract_text, i),
                citations: citations.value(i).to_string(),
                pmid: value_at(pmid, i),
                pmc: value_at(pmc, i),
                doi: value_at(doi, i),
                journal: value_at(journal, i),
                processing_date: processing_date.value(i).to_string(),
            });
        }
    }
    Ok(records)
}

/// Row count from the file footer, without decoding any pages.
pub fn count_rows(path: &Path) -> Result<usize, WriteError> {
    let file = File::open(path).map_err(|source| WriteError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = SerializedFileReader::new(file).map_err(|source| WriteError::Parquet {
        path: path.to_path_buf(),
        source,
    })?;
    let rows = reader.metadata().file_metadata().num_rows();
    Ok(usize::try_from(rows).unwrap_or_default())
}

fn column<'b, T: Array + 'static>(
    batch: &'b RecordBatch,
    name: &str,
    path: &Path,
) -> Result<&'b T, WriteError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| WriteError::Schema {
            path: path.to_path_buf(),
            detail: format!("column '{}' is missing or has the wrong type", name),
        })
}

fn value_at(array: &StringArray, i: usize) -> Option<String> {
    array.is_valid(i).then(|| array.value(i).to_string())
}
