//! Bounded terminal output buffer.

use std::sync::Arc;

use tokio::sync::RwLock;

/// Maximum number of characters retained in the terminal buffer.
pub const OUTPUT_CAP: usize = 10_000;

/// Append-only text buffer that keeps only the most recent characters.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    chars: usize,
    cap: usize,
    /// Characters appended over the buffer's lifetime.
    written: u64,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    /// Creates an empty buffer capped at [`OUTPUT_CAP`] characters.
    pub fn new() -> Self {
        Self::with_cap(OUTPUT_CAP)
    }

    fn with_cap(cap: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            cap,
            written: 0,
        }
    }

    /// Appends a chunk, dropping the oldest characters beyond the cap.
    pub fn append(&mut self, chunk: &str) {
        let count = chunk.chars().count();
        self.text.push_str(chunk);
        self.chars += count;
        self.written += count as u64;

        if self.chars > self.cap {
            let excess = self.chars - self.cap;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map(|(idx, _)| idx)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.chars = self.cap;
        }
    }

    /// Appends `text` on a new line.
    pub fn append_block(&mut self, text: &str) {
        self.append("\n");
        self.append(text);
    }

    /// Resets the buffer to empty.
    pub fn clear(&mut self) {
        self.text.clear();
        self.chars = 0;
    }

    /// Returns the retained text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the number of retained characters.
    pub fn len(&self) -> usize {
        self.chars
    }

    /// Returns the retained text appended after `cursor`, and the cursor
    /// for the next read. Text already dropped by the cap or by a clear is
    /// skipped.
    pub fn read_since(&self, cursor: u64) -> (String, u64) {
        let retained_from = self.written - self.chars as u64;
        let skip = cursor.saturating_sub(retained_from) as usize;
        let text = self.text.chars().skip(skip).collect();
        (text, self.written)
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }
}

/// Shared handle to the session's terminal buffer.
///
/// Writers (the output pump, the installer) and readers (the projection)
/// each hold a clone; every append is visible to the next read.
#[derive(Debug, Clone, Default)]
pub struct OutputAggregator {
    buffer: Arc<RwLock<OutputBuffer>>,
}

impl OutputAggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of process output.
    pub async fn append(&self, chunk: &str) {
        self.buffer.write().await.append(chunk);
    }

    /// Appends a block of captured output on a new line.
    pub async fn append_block(&self, text: &str) {
        self.buffer.write().await.append_block(text);
    }

    /// Clears the buffer.
    pub async fn clear(&self) {
        self.buffer.write().await.clear();
    }

    /// Returns a copy of the retained text.
    pub async fn contents(&self) -> String {
        self.buffer.read().await.as_str().to_string()
    }

    /// Returns the number of retained characters.
    pub async fn len(&self) -> usize {
        self.buffer.read().await.len()
    }

    /// See [`OutputBuffer::read_since`].
    pub async fn read_since(&self, cursor: u64) -> (String, u64) {
        self.buffer.read().await.read_since(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_appends_are_kept_whole() {
        let mut buffer = OutputBuffer::new();

        buffer.append("> vite\n");
        buffer.append("ready in 300ms\n");

        assert_eq!(buffer.as_str(), "> vite\nready in 300ms\n");
        assert_eq!(buffer.len(), 22);
    }

    #[test]
    fn keeps_last_cap_characters() {
        let mut buffer = OutputBuffer::new();
        let mut full = String::new();

        for i in 0..2_500 {
            let line = format!("line {}\n", i);
            full.push_str(&line);
            buffer.append(&line);
            assert!(buffer.len() <= OUTPUT_CAP);
        }

        let expected: String = full.chars().skip(full.chars().count() - OUTPUT_CAP).collect();
        assert_eq!(buffer.len(), OUTPUT_CAP);
        assert_eq!(buffer.as_str(), expected);
    }

    #[test]
    fn single_oversized_chunk_is_truncated_from_front() {
        let mut buffer = OutputBuffer::new();
        let chunk = format!("{}{}", "a".repeat(500), "b".repeat(OUTPUT_CAP));

        buffer.append(&chunk);

        assert_eq!(buffer.as_str(), "b".repeat(OUTPUT_CAP));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let mut buffer = OutputBuffer::with_cap(4);

        buffer.append("héllo");
        assert_eq!(buffer.as_str(), "éllo");
        assert_eq!(buffer.len(), 4);

        buffer.append("✓");
        assert_eq!(buffer.as_str(), "llo✓");
    }

    #[test]
    fn append_block_starts_new_line() {
        let mut buffer = OutputBuffer::new();

        buffer.append_block("added 12 packages");

        assert_eq!(buffer.as_str(), "\nadded 12 packages");
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut buffer = OutputBuffer::new();
        buffer.append("some output");

        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.as_str(), "");
    }

    #[test]
    fn read_since_returns_only_new_text() {
        let mut buffer = OutputBuffer::with_cap(8);
        buffer.append("abc");
        let (first, cursor) = buffer.read_since(0);
        assert_eq!(first, "abc");

        buffer.append("defghij");
        let (second, cursor) = buffer.read_since(cursor);
        assert_eq!(second, "defghij");
        assert_eq!(buffer.as_str(), "cdefghij");

        buffer.clear();
        buffer.append("k");
        assert_eq!(buffer.read_since(cursor).0, "k");
    }

    #[test]
    fn read_since_skips_trimmed_text() {
        let mut buffer = OutputBuffer::with_cap(4);
        buffer.append("ab");
        let (_, cursor) = buffer.read_since(0);

        buffer.append("cdefgh");

        assert_eq!(buffer.read_since(cursor).0, "efgh");
    }

    #[tokio::test]
    async fn aggregator_clones_share_one_buffer() {
        let writer = OutputAggregator::new();
        let reader = writer.clone();

        writer.append("compiled").await;

        assert_eq!(reader.contents().await, "compiled");
        assert_eq!(reader.len().await, 8);
    }
}
