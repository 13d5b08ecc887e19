//! Token-budgeted windowing and embedding with progressive shrink when the
//! backend rejects an input.

use crate::config::EmbeddingConfig;
use crate::error::{EmbedError, Result};
use crate::llm::LlmClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Words accumulated between tokenizer probes
const PROBE_INTERVAL: usize = 10;

/// Shrink ratios tried against a rejecting backend, in order
const SHRINK_RATIOS: &[f64] = &[1.0, 0.85, 0.70, 0.55];

/// Safety factor applied when pre-cutting to the token target
const PRECUT_FACTOR: f64 = 0.95;

/// Estimated tokens per word for the fast path on long inputs
const ESTIMATE_TOKENS_PER_WORD: f64 = 1.3;

/// One windowed slice of an input text, ready to persist
#[derive(Debug, Clone)]
pub struct Window {
    pub index: usize,
    /// Offset of the window within the normalized text
    pub start: usize,
    /// One past the window end
    pub end: usize,
    pub text: String,
    pub vector: Vec<f32>,
}

/// Process-wide token count cache keyed by an 8-byte SHA-256 prefix
struct TokenCache {
    capacity: usize,
    inner: RwLock<TokenCacheInner>,
}

#[derive(Default)]
struct TokenCacheInner {
    map: HashMap<u64, (usize, u64)>,
    seq: u64,
}

impl TokenCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(TokenCacheInner::default()),
        }
    }

    fn key(text: &str) -> u64 {
        let digest = Sha256::digest(text.as_bytes());
        u64::from_be_bytes(digest[..8].try_into().expect("8-byte prefix"))
    }

    fn get(&self, text: &str) -> Option<usize> {
        let key = Self::key(text);
        self.inner.read().expect("token cache poisoned").map.get(&key).map(|(n, _)| *n)
    }

    fn insert(&self, text: &str, count: usize) {
        let key = Self::key(text);
        let mut inner = self.inner.write().expect("token cache poisoned");
        inner.seq += 1;
        let seq = inner.seq;
        inner.map.insert(key, (count, seq));

        if inner.map.len() > self.capacity {
            // evict the older half by insertion order
            let mut seqs: Vec<u64> = inner.map.values().map(|(_, s)| *s).collect();
            seqs.sort_unstable();
            let cutoff = seqs[seqs.len() / 2];
            inner.map.retain(|_, (_, s)| *s > cutoff);
        }
    }

    fn len(&self) -> usize {
        self.inner.read().expect("token cache poisoned").map.len()
    }
}

/// Splits text into token-bounded windows and embeds them
pub struct Embedder {
    llm: Arc<dyn LlmClient>,
    config: EmbeddingConfig,
    token_cache: Arc<TokenCache>,
}

impl Embedder {
    pub fn new(llm: Arc<dyn LlmClient>, config: EmbeddingConfig) -> Self {
        let token_cache = Arc::new(TokenCache::new(config.token_cache_capacity));
        Self { llm, config, token_cache }
    }

    /// Tokens allowed per window after the safety margin; never below 1
    pub fn effective_target(&self) -> usize {
        self.config
            .soft_token_limit
            .min(self.config.target_tokens)
            .saturating_sub(self.config.safety_margin)
            .max(1)
    }

    /// Token count with caching. Short inputs are tokenized synchronously;
    /// long inputs return a word-count estimate and validate in the
    /// background under a short timeout.
    pub async fn count_tokens(&self, text: &str) -> Result<usize> {
        if let Some(cached) = self.token_cache.get(text) {
            return Ok(cached);
        }

        if text.len() < self.config.sync_tokenize_char_limit {
            let count = self.llm.count_tokens(text).await?;
            self.token_cache.insert(text, count);
            return Ok(count);
        }

        let estimate =
            (text.split_whitespace().count() as f64 * ESTIMATE_TOKENS_PER_WORD).ceil() as usize;

        let llm = Arc::clone(&self.llm);
        let cache = Arc::clone(&self.token_cache);
        let owned = text.to_string();
        let deadline = Duration::from_secs(self.config.background_tokenize_timeout_secs);
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, llm.count_tokens(&owned)).await {
                Ok(Ok(count)) => cache.insert(&owned, count),
                Ok(Err(e)) => debug!("Background tokenize failed: {e}"),
                Err(_) => debug!("Background tokenize timed out"),
            }
        });

        Ok(estimate.max(1))
    }

    /// Truncate text until it tokenizes at or below the effective target
    pub async fn ensure_token_limit(&self, text: &str) -> Result<String> {
        let target = self.effective_target();
        let mut current = text.to_string();

        loop {
            let tokens = self.count_tokens(&current).await?;
            if tokens <= target {
                return Ok(current);
            }
            let keep =
                ((current.chars().count() as f64) * (target as f64 / tokens as f64) * PRECUT_FACTOR)
                    .floor() as usize;
            if keep == 0 {
                return Ok(current.chars().take(1).collect());
            }
            current = current.chars().take(keep).collect();
        }
    }

    /// Split into gapless windows of at most the effective target tokens.
    /// Returns `(start, end, text)` triples; offsets leave a one-byte gap
    /// between consecutive windows.
    async fn window_texts(&self, text: &str) -> Result<Vec<(usize, usize, String)>> {
        let target = self.effective_target();
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let mut windows = Vec::new();
        let mut current_pos = 0usize;
        let mut i = 0usize;

        while i < words.len() {
            let mut taken: Vec<&str> = Vec::new();
            let mut j = i;

            while j < words.len() {
                taken.push(words[j]);
                j += 1;

                let probe_due = taken.len() % PROBE_INTERVAL == 0 || j == words.len();
                if !probe_due {
                    continue;
                }

                let tokens = self.count_tokens(&taken.join(" ")).await?;
                if tokens <= target {
                    continue;
                }

                // overflow: backtrack by the probe interval, then re-add
                // words one at a time until the target is met again
                let backtrack = PROBE_INTERVAL.min(taken.len());
                taken.truncate(taken.len() - backtrack);
                j -= backtrack;

                while j < words.len() {
                    taken.push(words[j]);
                    j += 1;
                    let tokens = self.count_tokens(&taken.join(" ")).await?;
                    if tokens > target {
                        if taken.len() == 1 {
                            // a single word over the target is still its own window
                            break;
                        }
                        taken.pop();
                        j -= 1;
                        break;
                    }
                }
                break;
            }

            if taken.is_empty() {
                // backtracked everything; emit the offending word alone
                taken.push(words[j]);
                j += 1;
            }

            let window_text = taken.join(" ");
            let end = current_pos + window_text.len();
            windows.push((current_pos, end, window_text));
            current_pos = end + 1;
            i = j;
        }

        Ok(windows)
    }

    /// Embed one window text, shrinking the input progressively while the
    /// backend rejects it
    async fn embed_with_shrink(&self, text: &str) -> Result<(Vec<f32>, String)> {
        let target = self.effective_target();
        let original_chars: Vec<char> = text.chars().collect();
        let mut last_error = String::new();

        for ratio in SHRINK_RATIOS {
            let keep = ((original_chars.len() as f64) * ratio).floor().max(1.0) as usize;
            let candidate: String = original_chars[..keep.min(original_chars.len())]
                .iter()
                .collect();

            // re-tokenize and pre-cut to the target before each attempt
            let tokens = self.count_tokens(&candidate).await?;
            let candidate = if tokens > target {
                let keep = ((candidate.chars().count() as f64) * (target as f64 / tokens as f64)
                    * PRECUT_FACTOR)
                    .floor()
                    .max(1.0) as usize;
                candidate.chars().take(keep).collect()
            } else {
                candidate
            };

            match tokio::time::timeout(
                Duration::from_secs(self.config.embed_timeout_secs),
                self.llm.embed(&candidate),
            )
            .await
            {
                Ok(Ok(vector)) => return Ok((vector, candidate)),
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!("Embedding rejected at ratio {ratio}: {last_error}");
                }
                Err(_) => {
                    last_error = "embedding timed out".to_string();
                    warn!("Embedding timed out at ratio {ratio}");
                }
            }
        }

        Err(EmbedError::ShrinkExhausted(last_error).into())
    }

    /// Window and embed one text
    pub async fn create_windows(&self, text: &str) -> Result<Vec<Window>> {
        let spans = self.window_texts(text).await?;

        let mut windows = Vec::with_capacity(spans.len());
        for (index, (start, end, window_text)) in spans.into_iter().enumerate() {
            let (vector, final_text) = self.embed_with_shrink(&window_text).await?;
            windows.push(Window { index, start, end, text: final_text, vector });
        }
        Ok(windows)
    }

    /// Window every chunk first, embed all window texts in one batched call,
    /// then redistribute vectors back per chunk preserving order
    pub async fn create_windows_batch(&self, chunks: &[String]) -> Result<Vec<Vec<Window>>> {
        let mut per_chunk_spans = Vec::with_capacity(chunks.len());
        let mut flat_texts = Vec::new();

        for chunk in chunks {
            let spans = self.window_texts(chunk).await?;
            for (_, _, text) in &spans {
                flat_texts.push(text.clone());
            }
            per_chunk_spans.push(spans);
        }

        if flat_texts.is_empty() {
            return Ok(vec![Vec::new(); chunks.len()]);
        }

        let vectors = self.llm.embed_batch(&flat_texts).await?;
        if vectors.len() != flat_texts.len() {
            return Err(EmbedError::BatchSizeMismatch {
                sent: flat_texts.len(),
                received: vectors.len(),
            }
            .into());
        }

        let mut vectors = vectors.into_iter();
        let mut result = Vec::with_capacity(chunks.len());
        for spans in per_chunk_spans {
            let mut windows = Vec::with_capacity(spans.len());
            for (index, (start, end, text)) in spans.into_iter().enumerate() {
                let vector = vectors.next().expect("length checked above");
                windows.push(Window { index, start, end, text, vector });
            }
            result.push(windows);
        }
        Ok(result)
    }

    #[cfg(test)]
    fn cached_entries(&self) -> usize {
        self.token_cache.len()
    }
}
