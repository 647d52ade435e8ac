//! Word-grouped, paced delivery of streaming deltas.
//!
//! Backends emit token-sized deltas; delivering each one as its own frame
//! wastes the client's render budget. The pacer regroups deltas on word
//! boundaries and, when the producer outruns the configured floor, spaces
//! frames out to the floor interval. A producer slower than the floor is
//! passed through untouched.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::types::StreamFrame;

/// Words per emitted frame.
const WORDS_PER_CHUNK: usize = 3;

/// Regroups deltas into word chunks and paces emission.
pub struct ChunkPacer {
    tx: mpsc::Sender<StreamFrame>,
    min_interval: Duration,
    pending: String,
    last_emit: Option<Instant>,
}

impl ChunkPacer {
    /// Build a pacer writing frames to `tx` with the given floor interval.
    #[must_use]
    pub fn new(tx: mpsc::Sender<StreamFrame>, min_interval: Duration) -> Self {
        Self {
            tx,
            min_interval,
            pending: String::new(),
            last_emit: None,
        }
    }

    /// Feed a producer delta, emitting any complete word groups.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when the receiver is gone (client disconnect).
    pub async fn push(&mut self, delta: &str) -> Result<()> {
        self.pending.push_str(delta);
        while let Some(cut) = group_boundary(&self.pending, WORDS_PER_CHUNK) {
            let chunk: String = self.pending.drain(..cut).collect();
            self.emit(chunk).await?;
        }
        Ok(())
    }

    /// Flush whatever remains (called once the producer finishes).
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when the receiver is gone.
    pub async fn finish(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            self.emit(chunk).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, chunk: String) -> Result<()> {
        if let Some(last) = self.last_emit {
            let since = last.elapsed();
            if since < self.min_interval {
                tokio::time::sleep(self.min_interval - since).await;
            }
        }
        self.last_emit = Some(Instant::now());
        self.tx
            .send(StreamFrame::delta(chunk))
            .await
            .map_err(|_| Error::Cancelled)
    }
}

/// Byte index after the trailing whitespace of the `words`-th word, if the
/// buffer holds that many complete words.
fn group_boundary(buffer: &str, words: usize) -> Option<usize> {
    let mut seen = 0;
    let mut in_word = false;
    let mut boundary = None;
    for (idx, ch) in buffer.char_indices() {
        if ch.is_whitespace() {
            if in_word {
                seen += 1;
                in_word = false;
            }
            if seen >= words {
                boundary = Some(idx + ch.len_utf8());
            }
        } else {
            if boundary.is_some() {
                // First non-whitespace after the group: cut here.
                return boundary;
            }
            in_word = true;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_boundary_counts_complete_words() {
        // Two complete words only once the third starts.
        assert_eq!(group_boundary("one two", 2), None);
        assert_eq!(group_boundary("one two ", 2), None);
        let cut = group_boundary("one two three", 2).unwrap();
        assert_eq!(&"one two three"[..cut], "one two ");
    }

    #[tokio::test]
    async fn test_pacer_groups_words() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut pacer = ChunkPacer::new(tx, Duration::ZERO);
        for delta in ["hel", "lo ", "wor", "ld ", "again ", "and ", "more"] {
            pacer.push(delta).await.unwrap();
        }
        pacer.finish().await.unwrap();
        drop(pacer);

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame.delta);
        }
        let joined = frames.concat();
        assert_eq!(joined, "hello world again and more");
        // Word-grouped, not character-grouped.
        assert!(frames.len() < 7, "frames: {frames:?}");
        for frame in &frames[..frames.len() - 1] {
            assert!(frame.ends_with(' '), "frame {frame:?} splits a word");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_enforces_floor_for_fast_producers() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut pacer = ChunkPacer::new(tx, Duration::from_millis(80));
        let feeder = tokio::spawn(async move {
            pacer
                .push("one two three four five six seven ")
                .await
                .unwrap();
            pacer.finish().await.unwrap();
        });

        let start = Instant::now();
        let mut stamps = Vec::new();
        while let Some(_frame) = rx.recv().await {
            stamps.push(start.elapsed());
        }
        feeder.await.unwrap();
        assert!(stamps.len() >= 2);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(80));
        }
    }
}
