//! Greeting extraction for large bodies.
//!
//! Bodies above the threshold are split into overlapping windows and each
//! window is parsed as a separate task. A candidate whose name runs into the
//! end of a non-final window may be cut off, so it is dropped; the next
//! window starts `overlap` bytes earlier and sees it whole.

use crate::content_parser::{dedupe_by_name, ContentParseResult, ContentParser};
use crate::error::{GuardError, Stage};
use crate::language::LanguageDetector;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub type ParseJob = Box<dyn FnOnce() -> ContentParseResult + Send + 'static>;

/// Submit/await interface for running parse work.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run(&self, job: ParseJob) -> Result<ContentParseResult, GuardError>;
}

/// Runs the job on the calling task.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

#[async_trait]
impl TaskExecutor for InlineExecutor {
    async fn run(&self, job: ParseJob) -> Result<ContentParseResult, GuardError> {
        Ok(job())
    }
}

/// Runs the job on tokio's blocking thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingPoolExecutor;

#[async_trait]
impl TaskExecutor for BlockingPoolExecutor {
    async fn run(&self, job: ParseJob) -> Result<ContentParseResult, GuardError> {
        tokio::task::spawn_blocking(job).await.map_err(|e| {
            GuardError::parsing(Stage::ContentParsing, format!("chunk task failed: {e}"))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    pub threshold_bytes: usize,
    pub chunk_size: usize,
    pub overlap: usize,
    pub max_in_flight: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            threshold_bytes: 32 * 1024,
            chunk_size: 16 * 1024,
            overlap: 512,
            max_in_flight: 4,
        }
    }
}

pub struct ChunkedParser {
    parser: Arc<ContentParser>,
    executor: Arc<dyn TaskExecutor>,
    settings: ChunkSettings,
    permits: Arc<Semaphore>,
}

impl ChunkedParser {
    pub fn new(
        parser: Arc<ContentParser>,
        executor: Arc<dyn TaskExecutor>,
        settings: ChunkSettings,
    ) -> Self {
        Self {
            parser,
            executor,
            settings,
            permits: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
        }
    }

    pub fn parser(&self) -> &Arc<ContentParser> {
        &self.parser
    }

    pub async fn parse(&self, text: &str) -> Result<ContentParseResult, GuardError> {
        if text.len() <= self.settings.threshold_bytes {
            return Ok(self.parser.parse(text));
        }

        let language = LanguageDetector::resolve(self.parser.selector(), text);
        let windows = chunk_windows(text, self.settings.chunk_size, self.settings.overlap);
        log::debug!(
            "Parsing {} byte body in {} chunks ({language})",
            text.len(),
            windows.len()
        );

        let last = windows.len().saturating_sub(1);
        let handles: Vec<(usize, usize, bool, JoinHandle<Result<ContentParseResult, GuardError>>)> =
            windows
                .into_iter()
                .enumerate()
                .map(|(index, (start, end))| {
                    let chunk = text[start..end].to_string();
                    let parser = Arc::clone(&self.parser);
                    let executor = Arc::clone(&self.executor);
                    let permits = Arc::clone(&self.permits);
                    let handle = tokio::spawn(async move {
                        let _permit = permits.acquire_owned().await.map_err(|e| {
                            GuardError::parsing(Stage::ContentParsing, format!("chunk queue closed: {e}"))
                        })?;
                        executor
                            .run(Box::new(move || parser.parse_with_language(&chunk, language)))
                            .await
                    });
                    (start, end - start, index == last, handle)
                })
                .collect();

        let mut greetings = Vec::new();
        for (offset, chunk_len, is_last, handle) in handles {
            let result = handle.await.map_err(|e| {
                GuardError::parsing(Stage::ContentParsing, format!("chunk task failed: {e}"))
            })??;
            for mut candidate in result.greetings {
                if !is_last && candidate.name_end() >= chunk_len {
                    continue;
                }
                candidate.position += offset;
                greetings.push(candidate);
            }
        }

        Ok(ContentParseResult {
            greetings: dedupe_by_name(greetings),
            has_content: true,
            language: Some(language),
        })
    }
}

/// Byte ranges of overlapping windows, each aligned to char boundaries.
pub fn chunk_windows(text: &str, chunk_size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let len = text.len();
    if len == 0 {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let mut end = floor_boundary(text, (start + chunk_size).min(len));
        if end <= start {
            end = ceil_boundary(text, start + 1);
        }
        windows.push((start, end));
        if end >= len {
            break;
        }
        let next = ceil_boundary(text, end.saturating_sub(overlap));
        start = if next > start { next } else { end };
    }
    windows
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index.min(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageSelector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn parser() -> Arc<ContentParser> {
        Arc::new(ContentParser::new(LanguageSelector::Auto, &[]).unwrap())
    }

    fn small_settings() -> ChunkSettings {
        ChunkSettings {
            threshold_bytes: 100,
            chunk_size: 200,
            overlap: 60,
            max_in_flight: 2,
        }
    }

    fn filler(bytes: usize) -> String {
        "The report is attached below. "
            .chars()
            .cycle()
            .take(bytes)
            .collect()
    }

    #[test]
    fn test_windows_cover_text_with_overlap() {
        let text = "a".repeat(500);
        let windows = chunk_windows(&text, 200, 60);
        assert_eq!(windows, vec![(0, 200), (140, 340), (280, 480), (420, 500)]);
        assert!(chunk_windows("", 200, 60).is_empty());
    }

    #[test]
    fn test_windows_respect_char_boundaries() {
        let text = "äöü".repeat(100);
        for (start, end) in chunk_windows(&text, 101, 33) {
            assert!(text.is_char_boundary(start));
            assert!(text.is_char_boundary(end));
            assert!(end > start);
        }
    }

    #[tokio::test]
    async fn test_small_body_parsed_directly() {
        let chunked = ChunkedParser::new(parser(), Arc::new(InlineExecutor), small_settings());
        let result = chunked.parse("Hi John, quick one.").await.unwrap();
        assert_eq!(result.greetings.len(), 1);
        assert_eq!(result.greetings[0].extracted_name, "John");
    }

    #[tokio::test]
    async fn test_boundary_greetings_match_plain_parse() {
        let chunked = ChunkedParser::new(parser(), Arc::new(BlockingPoolExecutor), small_settings());
        let plain = parser();

        for offset in 150..260 {
            let mut text = String::from("Hi John,\n");
            text.push_str(&filler(offset - text.len()));
            text.push_str("\nHello Maria,\n");
            text.push_str(&filler(300));

            let expected: Vec<(String, usize)> = plain
                .parse(&text)
                .greetings
                .into_iter()
                .map(|c| (c.extracted_name, c.position))
                .collect();
            let actual: Vec<(String, usize)> = chunked
                .parse(&text)
                .await
                .unwrap()
                .greetings
                .into_iter()
                .map(|c| (c.extracted_name, c.position))
                .collect();

            assert_eq!(expected.len(), 2, "offset {offset}");
            assert_eq!(actual, expected, "offset {offset}");
        }
    }

    struct GaugeExecutor {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for GaugeExecutor {
        async fn run(&self, job: ParseJob) -> Result<ContentParseResult, GuardError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            let result = job();
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(result)
        }
    }

    #[tokio::test]
    async fn test_in_flight_chunks_bounded() {
        let gauge = Arc::new(GaugeExecutor {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let chunked = ChunkedParser::new(parser(), gauge.clone(), small_settings());
        let text = format!("Hi John,\n{}", filler(2000));
        let result = chunked.parse(&text).await.unwrap();

        assert_eq!(result.greetings.len(), 1);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak {peak}");
    }
}
