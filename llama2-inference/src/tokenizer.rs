//! SentencePiece-style byte-level BPE tokenizer.
//!
//! Loads the vocabulary and per-token merge scores from a binary file,
//! encodes text by greedy highest-score pairwise merging, and decodes token
//! IDs back to text with the leading-space rule after BOS.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Beginning-of-sequence token ID.
pub const BOS_TOKEN_ID: usize = 1;
/// End-of-sequence token ID.
pub const EOS_TOKEN_ID: usize = 2;

// Sentinel below any real merge score.
const NO_MERGE_SCORE: f32 = -1e10;

pub struct Tokenizer {
    /// Vocabulary: each token is a byte sequence, not necessarily valid UTF-8.
    vocab: Vec<Vec<u8>>,
    /// Merge scores, higher is better.
    merge_scores: Vec<f32>,
    /// Byte string to token ID, built once at load. On duplicate entries the
    /// first occurrence wins.
    word_ids: HashMap<Vec<u8>, usize>,
    /// Longest token in bytes, from the file header.
    max_token_length: u32,
}

impl Tokenizer {
    /// Loads a tokenizer from its binary vocabulary file.
    ///
    /// The format is little-endian: a u32 `max_token_length` header, then for
    /// each of `vocab_size` entries an f32 score, a u32 byte length, and the
    /// token bytes. A short read anywhere is a format error.
    pub fn from_file(path: &Path, vocab_size: usize) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open tokenizer file: {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let max_token_length = reader
            .read_u32::<LittleEndian>()
            .context("Failed to read max token length")?;

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut merge_scores = Vec::with_capacity(vocab_size);
        let mut word_ids = HashMap::with_capacity(vocab_size);

        for i in 0..vocab_size {
            let score = reader
                .read_f32::<LittleEndian>()
                .with_context(|| format!("Failed to read score for token {i}"))?;
            let len = reader
                .read_u32::<LittleEndian>()
                .with_context(|| format!("Failed to read length for token {i}"))?
                as usize;

            let mut word = vec![0u8; len];
            reader
                .read_exact(&mut word)
                .with_context(|| format!("Failed to read {len} bytes for token {i}"))?;

            word_ids.entry(word.clone()).or_insert(i);
            vocab.push(word);
            merge_scores.push(score);
        }

        Ok(Self {
            vocab,
            merge_scores,
            word_ids,
            max_token_length,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Encodes a string into token IDs.
    ///
    /// Every input byte must exist as a single-byte vocabulary entry; the
    /// byte stream is then reduced by repeatedly merging the adjacent pair
    /// whose concatenation is in the vocabulary with the highest score.
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        let mut tokens = Vec::with_capacity(text.len());
        for &byte in text.as_bytes() {
            let id = self
                .word_ids
                .get(&[byte][..])
                .ok_or_else(|| anyhow::anyhow!("No vocabulary entry for byte {byte:#04x}"))?;
            tokens.push(*id);
        }

        let mut merged = Vec::with_capacity(self.max_token_length as usize);
        loop {
            let mut best_score = NO_MERGE_SCORE;
            let mut best: Option<(usize, usize)> = None;

            for i in 0..tokens.len().saturating_sub(1) {
                merged.clear();
                merged.extend_from_slice(&self.vocab[tokens[i]]);
                merged.extend_from_slice(&self.vocab[tokens[i + 1]]);

                if let Some(&id) = self.word_ids.get(merged.as_slice()) {
                    if self.merge_scores[id] > best_score {
                        best_score = self.merge_scores[id];
                        best = Some((id, i));
                    }
                }
            }

            let Some((id, idx)) = best else { break };
            tokens[idx] = id;
            tokens.remove(idx + 1);
        }

        Ok(tokens)
    }

    /// Decodes one token given its predecessor.
    ///
    /// Following BOS the sentencepiece decoder strips a leading whitespace
    /// from the next piece; out-of-range IDs decode to the empty string.
    pub fn decode(&self, prev_token: usize, token: usize) -> Cow<'_, str> {
        let Some(word) = self.vocab.get(token) else {
            return Cow::Borrowed("");
        };

        let mut bytes: &[u8] = word;
        if prev_token == BOS_TOKEN_ID && bytes.first() == Some(&b' ') {
            bytes = &bytes[1..];
        }

        match std::str::from_utf8(bytes) {
            Ok(valid) => Cow::Borrowed(valid),
            Err(_) => {
                // SAFETY: byte-fallback tokens carry partial UTF-8 sequences
                // that only become valid once adjacent tokens are
                // concatenated downstream; the exact bytes must survive the
                // round trip unchanged.
                let raw = unsafe { String::from_utf8_unchecked(bytes.to_vec()) };
                Cow::Owned(raw)
            }
        }
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab.len())
            .field("max_token_length", &self.max_token_length)
            .finish_non_exhaustive()
    }
}
