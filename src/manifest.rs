//! Reads the list of archive members to convert.
//!
//! Accepts either a plain list (one member path per line) or the PMC
//! `file_list.csv` layout, detected by an `Article File` header.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::Deserialize;

use crate::error::ManifestError;

const ARTICLE_FILE_COL: &str = "Article File";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<String>,
    /// Rows dropped because the file list flags them as retracted.
    pub retracted: usize,
}

#[derive(Debug, Deserialize)]
struct FileListRow {
    #[serde(rename = "Article File")]
    article_file: String,
    #[serde(rename = "Retracted", default)]
    retracted: Option<String>,
}

pub fn read_manifest(path: &Path, include_retracted: bool) -> Result<Manifest, ManifestError> {
    let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let header = content.lines().map(str::trim).find(|line| !line.is_empty());
    let manifest = match header {
        Some(line) if line.contains(ARTICLE_FILE_COL) => {
            debug!("Manifest {} looks like a CSV file list", path.display());
            parse_file_list(path, &content, include_retracted)?
        }
        _ => Manifest {
            entries: content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            retracted: 0,
        },
    };

    if manifest.entries.is_empty() {
        return Err(ManifestError::Empty(path.to_path_buf()));
    }
    info!(
        "Loaded {} entries from manifest {} ({} retracted excluded)",
        manifest.entries.len(),
        path.display(),
        manifest.retracted
    );
    Ok(manifest)
}

fn parse_file_list(
    path: &Path,
    content: &str,
    include_retracted: bool,
) -> Result<Manifest, ManifestError> {
    let csv_error = |source| ManifestError::Csv {
        path: PathBuf::from(path),
        source,
    };

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers = rdr.headers().map_err(csv_error)?;
    if !headers.iter().any(|h| h == ARTICLE_FILE_COL) {
        return Err(ManifestError::MissingColumn(path.to_path_buf()));
    }

    let mut entries = Vec::new();
    let mut retracted = 0;
    for row in rdr.deserialize::<FileListRow>() {
        let row = row.map_err(csv_error)?;
        if row.article_file.is_empty() {
            continue;
        }
        let is_retracted = row
            .retracted
            .as_deref()
            .is_some_and(|flag| flag.eq_ignore_ascii_case("yes"));
        if is_retracted && !include_retracted {
            retracted += 1;
            continue;
        }
        entries.push(row.article_file);
    }
    Ok(Manifest { entries, retracted })
}
