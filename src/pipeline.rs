//! End-to-end run: manifest, archive, chunked extraction, part-files.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use log::{error, info, warn};

use crate::{
    archive::{MemberSource, TarArchive},
    batch::{build_pool, BatchRunner},
    config::PipelineConfig,
    error::PipelineError,
    jats::{FieldExtractor, JatsExtractor},
    manifest::read_manifest,
    memory_usage,
    writer::{count_rows, PartWriter},
};

#[derive(Debug, Default)]
pub struct RunSummary {
    pub entries: usize,
    pub valid: usize,
    pub invalid: usize,
    pub retracted: usize,
    pub chunks: usize,
    pub empty_chunks: usize,
    pub part_files: Vec<PathBuf>,
    pub failed_chunks: Vec<usize>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// True when every non-empty chunk reached disk.
    pub fn succeeded(&self) -> bool {
        self.failed_chunks.is_empty()
    }

    fn log(&self) {
        info!("-------------------- FINAL SUMMARY --------------------");
        info!("Total execution time: {}", format_elapsed(self.elapsed));
        info!("Entries processed: {}", self.entries);
        info!("Valid records: {}", self.valid);
        info!("Invalid records: {}", self.invalid);
        if self.retracted > 0 {
            info!("Retracted entries excluded: {}", self.retracted);
        }
        info!(
            "Part-files written: {} of {} chunks ({} empty)",
            self.part_files.len(),
            self.chunks,
            self.empty_chunks
        );
        if !self.failed_chunks.is_empty() {
            error!("Chunks that failed to write: {:?}", self.failed_chunks);
        }
        info!("-------------------------------------------------------");
    }
}

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FATAL: u8 = 1;
pub const EXIT_CHUNK_FAILURES: u8 = 2;

/// Process exit status for a finished run: pre-flight failures are fatal,
/// chunk write failures are reported separately from full success.
pub fn exit_status(result: &Result<RunSummary, PipelineError>) -> u8 {
    match result {
        Err(_) => EXIT_FATAL,
        Ok(summary) if !summary.succeeded() => EXIT_CHUNK_FAILURES,
        Ok(_) => EXIT_SUCCESS,
    }
}

/// Creates `dir` if needed and checks a file can be created inside it.
pub fn prepare_output_dir(dir: &Path) -> Result<(), PipelineError> {
    let output_error = |source| PipelineError::OutputDir {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(output_error)?;
    tempfile::Builder::new()
        .prefix(".write-check")
        .tempfile_in(dir)
        .map_err(output_error)?;
    Ok(())
}

/// Converts the archive named by `config`. Errors returned here are the
/// pre-flight kind; chunk write failures are reported in the summary.
pub fn run(config: &PipelineConfig) -> Result<RunSummary, PipelineError> {
    let start = Instant::now();
    info!(
        "Processing files from {} and saving as {} chunks",
        config.tar.display(),
        config.chunks.max(1)
    );

    let manifest = read_manifest(&config.filelist, config.include_retracted)?;
    prepare_output_dir(&config.output_dir)?;
    let archive = TarArchive::open(&config.tar)?;
    info!(
        "Staged {} members of {} in {}",
        archive.member_count(),
        archive.archive_path().display(),
        archive.staging_dir().display()
    );
    memory_usage::log_memory_usage("after staging archive");

    let result = process_entries(&manifest.entries, &archive, &JatsExtractor, config);

    if config.keep_extracted || archive.reused() {
        info!("Keeping extracted files in {}", archive.staging_dir().display());
    } else if let Err(e) = archive.cleanup() {
        warn!(
            "Failed to remove extracted files in {}: {}",
            archive.staging_dir().display(),
            e
        );
    }

    let mut summary = result?;
    summary.retracted = manifest.retracted;
    summary.elapsed = start.elapsed();
    memory_usage::log_memory_usage("final");
    summary.log();
    Ok(summary)
}

/// The chunk loop on its own, for any member source and extractor.
pub fn process_entries<S, E>(
    entries: &[String],
    source: &S,
    extractor: &E,
    config: &PipelineConfig,
) -> Result<RunSummary, PipelineError>
where
    S: MemberSource + ?Sized,
    E: FieldExtractor + ?Sized,
{
    prepare_output_dir(&config.output_dir)?;
    let pool = build_pool(config.threads)?;
    let writer = PartWriter::new(&config.output_dir, config.compression);
    let runner = BatchRunner::new(
        entries,
        source,
        extractor,
        &pool,
        config.chunks,
        config.show_progress,
    );

    let mut summary = RunSummary {
        entries: entries.len(),
        chunks: runner.chunk_count(),
        ..RunSummary::default()
    };
    info!(
        "Extracting {} entries on {} threads into {} chunks, writing to {}",
        entries.len(),
        pool.current_num_threads(),
        summary.chunks,
        writer.output_dir().display()
    );

    for chunk in runner {
        let label = format!("Chunk {}/{}", chunk.index + 1, summary.chunks);
        summary.invalid += chunk.invalid;
        summary.valid += chunk.records.len() - chunk.invalid;

        if chunk.records.is_empty() {
            info!("{}: no entries, skipping part-file", label);
            summary.empty_chunks += 1;
            continue;
        }

        let write_start = Instant::now();
        match writer.write_part(chunk.index, &chunk.records) {
            Ok(path) => match count_rows(&path) {
                Ok(rows) if rows == chunk.records.len() => {
                    info!(
                        "{}: wrote {} rows to {} in {}",
                        label,
                        rows,
                        path.display(),
                        format_elapsed(write_start.elapsed())
                    );
                    summary.part_files.push(path);
                }
                Ok(rows) => {
                    error!(
                        "{}: {} holds {} rows but the chunk had {} entries",
                        label,
                        path.display(),
                        rows,
                        chunk.records.len()
                    );
                    summary.failed_chunks.push(chunk.index);
                }
                Err(e) => {
                    error!("{}: written file could not be read back: {}", label, e);
                    summary.failed_chunks.push(chunk.index);
                }
            },
            Err(e) => {
                error!("{}: {}. Continuing with the next chunk.", label, e);
                summary.failed_chunks.push(chunk.index);
            }
        }
        memory_usage::log_memory_usage(&label);
    }

    Ok(summary)
}

/// `h:mm:ss.mmm`, dropping the hour field for runs under an hour.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, minutes, seconds) => format!("{}:{:02}.{:03}", minutes, seconds, millis),
        (hours, minutes, seconds) => {
            format!("{}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::build_tar_gz;
    use crate::batch::tests::{names, EchoSource, SlowEarlyExtractor};
    use crate::error::ManifestError;
    use crate::writer::{part_file_name, read_part};
    use std::path::Path;

    fn config(output_dir: &Path, chunks: usize) -> PipelineConfig {
        PipelineConfig {
            threads: 4,
            chunks,
            output_dir: output_dir.to_path_buf(),
            show_progress: false,
            ..PipelineConfig::new(Path::new("unused.txt"), Path::new("unused.tar.gz"))
        }
    }

    fn titles(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .flat_map(|p| read_part(p).unwrap())
            .map(|r| r.title.unwrap_or_default())
            .collect()
    }

    #[test]
    fn rows_across_part_files_equal_entries() {
        let dir = tempfile::tempdir().unwrap();
        let entries = names("doc-", 7);
        let summary =
            process_entries(&entries, &EchoSource, &SlowEarlyExtractor, &config(dir.path(), 3)).unwrap();

        assert!(summary.succeeded());
        assert_eq!(summary.part_files.len(), 3);
        let total: usize = summary.part_files.iter().map(|p| count_rows(p).unwrap()).sum();
        assert_eq!(total, 7);
        assert_eq!(titles(&summary.part_files), entries);
        assert_eq!(summary.valid, 7);
    }

    #[test]
    fn single_chunk_holds_everything_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = names("doc-", 5);
        entries.insert(2, "missing-x".into());
        let summary =
            process_entries(&entries, &EchoSource, &SlowEarlyExtractor, &config(dir.path(), 1)).unwrap();

        assert_eq!(summary.part_files, vec![dir.path().join(part_file_name(0))]);
        let records = read_part(&summary.part_files[0]).unwrap();
        assert_eq!(records.len(), 6);
        assert!(!records[2].valid);
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.valid, 5);
    }

    #[test]
    fn more_chunks_than_entries_writes_only_non_empty_parts() {
        let dir = tempfile::tempdir().unwrap();
        let entries = names("doc-", 3);
        let summary =
            process_entries(&entries, &EchoSource, &SlowEarlyExtractor, &config(dir.path(), 8)).unwrap();

        assert!(summary.succeeded());
        assert_eq!(summary.chunks, 8);
        assert_eq!(summary.empty_chunks, 5);
        assert_eq!(summary.part_files.len(), 3);
        for path in &summary.part_files {
            assert_eq!(count_rows(path).unwrap(), 1);
        }
        assert_eq!(titles(&summary.part_files), entries);
    }

    #[test]
    fn failed_chunk_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        // A directory squatting on the part-file name makes that write fail.
        fs::create_dir_all(dir.path().join(part_file_name(1))).unwrap();

        let entries = names("doc-", 6);
        let summary =
            process_entries(&entries, &EchoSource, &SlowEarlyExtractor, &config(dir.path(), 3)).unwrap();

        assert!(!summary.succeeded());
        assert_eq!(summary.failed_chunks, vec![1]);
        assert_eq!(
            summary.part_files,
            vec![
                dir.path().join(part_file_name(0)),
                dir.path().join(part_file_name(2))
            ]
        );
        assert_eq!(summary.valid, 6);
    }

    #[test]
    fn unusable_output_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let entries = names("doc-", 2);
        let err = process_entries(
            &entries,
            &EchoSource,
            &SlowEarlyExtractor,
            &config(&blocker.join("out"), 1),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::OutputDir { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn existing_but_unwritable_output_dir_is_fatal() {
        let entries = names("doc-", 2);
        let err = process_entries(
            &entries,
            &EchoSource,
            &SlowEarlyExtractor,
            &config(Path::new("/proc/self"), 1),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::OutputDir { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unwritable_output_dir_stops_the_run_before_staging() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("bundle.tar.gz");
        build_tar_gz(&tar_path, &[("d/PMC1.xml", b"<article/>")]);
        let filelist = dir.path().join("list.txt");
        fs::write(&filelist, "d/PMC1.xml\n").unwrap();

        let run_config = PipelineConfig {
            output_dir: PathBuf::from("/proc/self"),
            show_progress: false,
            ..PipelineConfig::new(&filelist, &tar_path)
        };
        let result = run(&run_config);
        assert!(matches!(result, Err(PipelineError::OutputDir { .. })));
        assert_eq!(exit_status(&result), EXIT_FATAL);
        assert!(!TarArchive::staging_dir_for(&tar_path).exists());
    }

    #[test]
    fn write_check_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/out");
        prepare_output_dir(&out).unwrap();
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn exit_status_distinguishes_fatal_and_chunk_failures() {
        let ok: Result<RunSummary, PipelineError> = Ok(RunSummary::default());
        assert_eq!(exit_status(&ok), EXIT_SUCCESS);

        let partial = Ok(RunSummary {
            failed_chunks: vec![3],
            ..RunSummary::default()
        });
        assert_eq!(exit_status(&partial), EXIT_CHUNK_FAILURES);

        let fatal = Err(PipelineError::Manifest(ManifestError::Empty(PathBuf::from(
            "list.txt",
        ))));
        assert_eq!(exit_status(&fatal), EXIT_FATAL);
    }

    #[test]
    fn elapsed_formatting_always_shows_milliseconds() {
        assert_eq!(format_elapsed(Duration::from_millis(1_250)), "0:01.250");
        assert_eq!(format_elapsed(Duration::from_millis(125_040)), "2:05.040");
        assert_eq!(format_elapsed(Duration::from_secs(3_725)), "1:02:05.000");
    }
}
