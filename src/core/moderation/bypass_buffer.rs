// Multi-line bypass detection.
//
// Keeps a short sliding window of recent short messages per
// (guild, user, channel) and looks for toxic meaning that only appears once
// consecutive fragments are read together ("kys" / "you").

use super::moderation_models::{BufferKey, BypassMatch, MessageFragment};
use super::pattern_detectors::has_toxic_coherence;
use super::text_normalizer::{normalize, normalized_word_count, similarity};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

/// Fragments with more words than this are not treated as split-bypass pieces.
pub const MAX_FRAGMENT_WORDS: usize = 5;
/// How many of the most recent fragments are paired up.
const RECENT_FRAGMENTS: usize = 4;
/// Size of the fallback window tested when no pair matched.
const FALLBACK_FRAGMENTS: usize = 3;

pub const DEFAULT_BUFFER_WINDOW_MS: i64 = 30_000;
pub const DEFAULT_MAX_FRAGMENTS: usize = 5;

pub struct BypassBuffer {
    buffers: DashMap<BufferKey, VecDeque<MessageFragment>>,
    window: Duration,
    max_fragments: usize,
}

impl BypassBuffer {
    pub fn new(window: Duration, max_fragments: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            window,
            max_fragments: max_fragments.max(1),
        }
    }

    /// Append a fragment after pruning expired ones; evicts the oldest on overflow.
    pub fn add(&self, key: BufferKey, text: &str, origin_id: u64, now: DateTime<Utc>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let mut buffer = self.buffers.entry(key).or_default();
        Self::prune(&mut buffer, self.window, now);

        buffer.push_back(MessageFragment {
            text: text.to_string(),
            word_count: normalized_word_count(text),
            timestamp: now,
            origin_id,
        });

        while buffer.len() > self.max_fragments {
            buffer.pop_front();
        }
    }

    /// Look for toxic coherence across the most recent short fragments and
    /// consume them on a match.
    ///
    /// Every unordered pair among the last few short fragments is tested in
    /// order; the first coherent pair wins. Failing that, the last three short
    /// fragments are tested together. A match empties the buffer while the
    /// entry is still locked, so a concurrent message on the same key cannot
    /// match the same fragments again. A miss leaves the buffer untouched.
    pub fn take_match(&self, key: BufferKey, now: DateTime<Utc>) -> Option<BypassMatch> {
        let mut buffer = self.buffers.get_mut(&key)?;
        Self::prune(&mut buffer, self.window, now);

        let found = Self::find(&buffer)?;
        buffer.clear();
        Some(found)
    }

    fn find(buffer: &VecDeque<MessageFragment>) -> Option<BypassMatch> {
        if buffer.len() < 2 {
            return None;
        }

        let start = buffer.len().saturating_sub(RECENT_FRAGMENTS);
        let short: Vec<&MessageFragment> = buffer
            .iter()
            .skip(start)
            .filter(|f| (1..=MAX_FRAGMENT_WORDS).contains(&f.word_count))
            .collect();

        if short.len() < 2 {
            return None;
        }

        for i in 0..short.len() - 1 {
            for j in i + 1..short.len() {
                let pair = [short[i], short[j]];
                if let Some(found) = Self::coherent(&pair) {
                    tracing::debug!(
                        combined = %found.combined_text,
                        similarity = found.similarity,
                        "Multi-line bypass detected"
                    );
                    return Some(found);
                }
            }
        }

        if short.len() >= FALLBACK_FRAGMENTS {
            let last = &short[short.len() - FALLBACK_FRAGMENTS..];
            if let Some(found) = Self::coherent(last) {
                tracing::debug!(combined = %found.combined_text, "Multi-line bypass detected (3 fragments)");
                return Some(found);
            }
        }

        None
    }

    pub fn clear(&self, key: BufferKey) {
        self.buffers.remove(&key);
    }

    pub fn clear_guild(&self, guild_id: u64) {
        self.buffers.retain(|key, _| key.guild_id != guild_id);
    }

    pub fn len(&self, key: BufferKey) -> usize {
        self.buffers.get(&key).map(|b| b.len()).unwrap_or(0)
    }

    /// Drop expired fragments everywhere and forget empty buffers.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.buffers.len();
        let window = self.window;
        self.buffers.retain(|_, buffer| {
            Self::prune(buffer, window, now);
            !buffer.is_empty()
        });
        before - self.buffers.len()
    }

    fn prune(buffer: &mut VecDeque<MessageFragment>, window: Duration, now: DateTime<Utc>) {
        buffer.retain(|f| now - f.timestamp < window);
    }

    fn coherent(fragments: &[&MessageFragment]) -> Option<BypassMatch> {
        let combined_text = fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        if !has_toxic_coherence(&normalize(&combined_text)) {
            return None;
        }

        Some(BypassMatch {
            message_ids: fragments.iter().map(|f| f.origin_id).collect(),
            message_count: fragments.len(),
            word_count: fragments.iter().map(|f| f.word_count).sum(),
            similarity: similarity(&fragments[0].text, &fragments[1].text),
            combined_text,
        })
    }
}

impl Default for BypassBuffer {
    fn default() -> Self {
        Self::new(
            Duration::milliseconds(DEFAULT_BUFFER_WINDOW_MS),
            DEFAULT_MAX_FRAGMENTS,
        )
    }
}
