//! Splits the manifest into chunks and extracts each chunk on a bounded pool.

use std::{ops::Range, time::Instant};

use indicatif::{
    MultiProgress, ParallelProgressIterator, ProgressBar, ProgressDrawTarget, ProgressStyle,
};
use log::{debug, info};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::{
    archive::MemberSource,
    extractor::extract_document,
    jats::FieldExtractor,
    record::DocumentRecord,
};

/// Contiguous, near-equal slices of `0..len`.
///
/// Sizes differ by at most one; the first `len % chunks` slices take the extra
/// entry. A chunk count of 0 or 1 yields a single slice, and asking for more
/// chunks than entries yields trailing empty slices.
pub fn chunk_bounds(len: usize, chunks: usize) -> Vec<Range<usize>> {
    let chunks = chunks.max(1);
    let base = len / chunks;
    let extra = len % chunks;
    let mut start = 0;
    (0..chunks)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

pub fn build_pool(threads: usize) -> Result<ThreadPool, ThreadPoolBuildError> {
    ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("extract-{}", i))
        .build()
}

#[derive(Debug)]
pub struct ChunkOutput {
    pub index: usize,
    /// In manifest order.
    pub records: Vec<DocumentRecord>,
    pub invalid: usize,
}

/// Lazily runs one chunk per call to `next`. Not restartable.
pub struct BatchRunner<'a, S: ?Sized, E: ?Sized> {
    entries: &'a [String],
    source: &'a S,
    extractor: &'a E,
    pool: &'a ThreadPool,
    pending: std::iter::Enumerate<std::vec::IntoIter<Range<usize>>>,
    chunk_count: usize,
    multi: MultiProgress,
    overall: ProgressBar,
}

impl<'a, S, E> BatchRunner<'a, S, E>
where
    S: MemberSource + ?Sized,
    E: FieldExtractor + ?Sized,
{
    pub fn new(
        entries: &'a [String],
        source: &'a S,
        extractor: &'a E,
        pool: &'a ThreadPool,
        chunks: usize,
        show_progress: bool,
    ) -> Self {
        let bounds = chunk_bounds(entries.len(), chunks);
        let chunk_count = bounds.len();
        let multi = if show_progress {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        let overall = multi.add(ProgressBar::new(entries.len() as u64));
        overall.set_style(progress_style(
            "[{elapsed_precise}] Overall: [{bar:40.green/blue}] {pos}/{len} ({eta}) {msg}",
        ));
        Self {
            entries,
            source,
            extractor,
            pool,
            pending: bounds.into_iter().enumerate(),
            chunk_count,
            multi,
            overall,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    fn run_chunk(&self, index: usize, range: Range<usize>) -> ChunkOutput {
        let members = &self.entries[range];
        let start = Instant::now();
        debug!(
            "Chunk {}/{}: dispatching {} entries to {} workers",
            index + 1,
            self.chunk_count,
            members.len(),
            self.pool.current_num_threads()
        );

        let bar = self.multi.add(ProgressBar::new(members.len() as u64));
        bar.set_style(progress_style(
            "[{elapsed_precise}] {msg}: [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec})",
        ));
        bar.set_message(format!("Chunk {}/{}", index + 1, self.chunk_count));

        let (source, extractor, overall) = (self.source, self.extractor, &self.overall);
        let outcomes: Vec<_> = self.pool.install(|| {
            members
                .par_iter()
                .progress_with(bar.clone())
                .map(|member| {
                    let outcome = extract_document(source, extractor, member);
                    overall.inc(1);
                    outcome
                })
                .collect()
        });
        bar.finish_and_clear();
        self.multi.remove(&bar);

        let invalid = outcomes.iter().filter(|o| !o.is_valid()).count();
        let records: Vec<DocumentRecord> = outcomes.into_iter().map(|o| o.into_record()).collect();
        info!(
            "Chunk {}/{}: extracted {} records ({} invalid) in {:.2}s",
            index + 1,
            self.chunk_count,
            records.len(),
            invalid,
            start.elapsed().as_secs_f64()
        );
        ChunkOutput {
            index,
            records,
            invalid,
        }
    }
}

impl<'a, S, E> Iterator for BatchRunner<'a, S, E>
where
    S: MemberSource + ?Sized,
    E: FieldExtractor + ?Sized,
{
    type Item = ChunkOutput;

    fn next(&mut self) -> Option<ChunkOutput> {
        let Some((index, range)) = self.pending.next() else {
            self.overall.finish_and_clear();
            return None;
        };
        Some(self.run_chunk(index, range))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.pending.size_hint()
    }
}

fn progress_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .expect("Failed to create progress bar template")
        .progress_chars("=> ")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{ExtractionError, MemberError};
    use crate::jats::ArticleFields;
    use std::{thread, time::Duration};

    /// Serves the member name itself as the document bytes; names starting
    /// with `missing` are absent.
    pub(crate) struct EchoSource;

    impl MemberSource for EchoSource {
        fn read_member(&self, member: &str) -> Result<Vec<u8>, MemberError> {
            if member.starts_with("missing") {
                Err(MemberError::NotFound)
            } else {
                Ok(member.as_bytes().to_vec())
            }
        }
    }

    /// Uses the document text as its title. Documents named `doc-<n>` sleep
    /// longer the smaller `n` is, so earlier entries finish last. Documents
    /// starting with `bad` fail to parse.
    pub(crate) struct SlowEarlyExtractor;

    impl FieldExtractor for SlowEarlyExtractor {
        fn extract(&self, xml: &[u8]) -> Result<ArticleFields, ExtractionError> {
            let text = String::from_utf8_lossy(xml).into_owned();
            if text.starts_with("bad") {
                return Err(ExtractionError::EmptyDocument);
            }
            if let Some(n) = text.strip_prefix("doc-").and_then(|n| n.parse::<u64>().ok()) {
                thread::sleep(Duration::from_millis(20u64.saturating_sub(n)));
            }
            Ok(ArticleFields {
                title: Some(text),
                abstract_text: Some("abstract".into()),
                ..ArticleFields::default()
            })
        }
    }

    pub(crate) fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn bounds_are_contiguous_and_near_equal() {
        let bounds = chunk_bounds(10, 3);
        assert_eq!(bounds, vec![0..4, 4..7, 7..10]);

        let bounds = chunk_bounds(9, 3);
        assert_eq!(bounds, vec![0..3, 3..6, 6..9]);
    }

    #[test]
    fn zero_or_one_chunk_means_no_partitioning() {
        assert_eq!(chunk_bounds(5, 0), vec![0..5]);
        assert_eq!(chunk_bounds(5, 1), vec![0..5]);
    }

    #[test]
    fn more_chunks_than_entries_leaves_trailing_empty_chunks() {
        let bounds = chunk_bounds(2, 4);
        assert_eq!(bounds, vec![0..1, 1..2, 2..2, 2..2]);
        assert_eq!(bounds.iter().map(|r| r.len()).sum::<usize>(), 2);
    }

    #[test]
    fn output_order_matches_input_despite_completion_order() {
        let entries = names("doc-", 20);
        let pool = build_pool(8).unwrap();
        let runner = BatchRunner::new(&entries, &EchoSource, &SlowEarlyExtractor, &pool, 2, false);
        assert_eq!(runner.chunk_count(), 2);

        let chunks: Vec<ChunkOutput> = runner.collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[1].index, 1);

        let titles: Vec<String> = chunks
            .iter()
            .flat_map(|c| c.records.iter())
            .map(|r| r.title.clone().unwrap())
            .collect();
        assert_eq!(titles, entries);
    }

    #[test]
    fn failures_never_drop_records() {
        let entries: Vec<String> = vec![
            "doc-1".into(),
            "missing-1".into(),
            "bad-1".into(),
            "doc-2".into(),
            "missing-2".into(),
        ];
        let pool = build_pool(3).unwrap();
        let chunks: Vec<ChunkOutput> =
            BatchRunner::new(&entries, &EchoSource, &SlowEarlyExtractor, &pool, 2, false).collect();

        assert_eq!(chunks[0].records.len(), 3);
        assert_eq!(chunks[1].records.len(), 2);
        assert_eq!(chunks[0].invalid, 2);
        assert_eq!(chunks[1].invalid, 1);

        let validity: Vec<bool> = chunks
            .iter()
            .flat_map(|c| c.records.iter().map(|r| r.valid))
            .collect();
        assert_eq!(validity, vec![true, false, false, true, false]);
    }

    #[test]
    fn empty_chunks_are_yielded_without_error() {
        let entries = names("doc-", 2);
        let pool = build_pool(2).unwrap();
        let chunks: Vec<ChunkOutput> =
            BatchRunner::new(&entries, &EchoSource, &SlowEarlyExtractor, &pool, 5, false).collect();
        assert_eq!(chunks.len(), 5);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.records.len()).collect();
        assert_eq!(sizes, vec![1, 1, 0, 0, 0]);
    }
}
