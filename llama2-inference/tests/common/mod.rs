//! Shared fixtures: synthetic checkpoint and vocabulary files.
#![allow(dead_code)]

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use tempfile::NamedTempFile;

/// Header fields of a synthetic checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointSpec {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
}

impl CheckpointSpec {
    /// A small but fully featured model: two layers, grouped-query attention
    /// (two query heads sharing one KV head), even head size.
    pub fn small() -> Self {
        Self {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 1,
            vocab_size: 16,
            seq_len: 8,
        }
    }

    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Weight block lengths in stream order, legacy rotary tables included.
    pub fn weight_blocks(&self, shared_classifier: bool) -> Vec<usize> {
        let (d, h, l, v, s) = (
            self.dim,
            self.hidden_dim,
            self.n_layers,
            self.vocab_size,
            self.seq_len,
        );
        let kv = self.kv_dim();
        let mut blocks = vec![
            v * d,     // token embedding
            l * d,     // attention rmsnorm
            l * d * d, // wq
            l * d * kv, // wk
            l * d * kv, // wv
            l * d * d, // wo
            l * d,     // ffn rmsnorm
            l * d * h, // w1
            l * h * d, // w2
            l * d * h, // w3
            d,         // final rmsnorm
            s * (self.head_size() / 2), // legacy rope (real)
            s * (self.head_size() / 2), // legacy rope (imag)
        ];
        if !shared_classifier {
            blocks.push(v * d);
        }
        blocks
    }
}

/// Deterministic pseudo-random floats in [-0.5, 0.5).
pub fn lcg_floats(count: usize, mut seed: u64) -> Vec<f32> {
    (0..count)
        .map(|_| {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((seed >> 40) as f32 / (1u64 << 24) as f32) - 0.5
        })
        .collect()
}

/// Writes a checkpoint with LCG-generated weights. A negative `vocab_size`
/// is emitted when the classifier is not shared, per the format's sign trick.
pub fn write_checkpoint(
    spec: &CheckpointSpec,
    shared_classifier: bool,
    seed: u64,
) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;

    file.write_i32::<LittleEndian>(spec.dim as i32)?;
    file.write_i32::<LittleEndian>(spec.hidden_dim as i32)?;
    file.write_i32::<LittleEndian>(spec.n_layers as i32)?;
    file.write_i32::<LittleEndian>(spec.n_heads as i32)?;
    file.write_i32::<LittleEndian>(spec.n_kv_heads as i32)?;
    let vocab = spec.vocab_size as i32;
    file.write_i32::<LittleEndian>(if shared_classifier { vocab } else { -vocab })?;
    file.write_i32::<LittleEndian>(spec.seq_len as i32)?;

    let total: usize = spec.weight_blocks(shared_classifier).iter().sum();
    for value in lcg_floats(total, seed) {
        file.write_f32::<LittleEndian>(value)?;
    }

    file.flush()?;
    Ok(file)
}

/// Writes a vocabulary file from (score, word) entries.
pub fn write_vocab(entries: &[(f32, &[u8])]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;

    let max_len = entries.iter().map(|(_, w)| w.len()).max().unwrap_or(0);
    file.write_u32::<LittleEndian>(max_len as u32)?;

    for (score, word) in entries {
        file.write_f32::<LittleEndian>(*score)?;
        file.write_u32::<LittleEndian>(word.len() as u32)?;
        file.write_all(word)?;
    }

    file.flush()?;
    Ok(file)
}

/// A 16-entry vocabulary matching `CheckpointSpec::small`: the three
/// specials and the letters a through m.
pub fn small_vocab() -> Vec<(f32, &'static [u8])> {
    let mut entries: Vec<(f32, &'static [u8])> =
        vec![(0.0, b"<unk>"), (0.0, b"<s>"), (0.0, b"</s>")];
    for letter in [
        &b"a"[..],
        b"b",
        b"c",
        b"d",
        b"e",
        b"f",
        b"g",
        b"h",
        b"i",
        b"j",
        b"k",
        b"l",
        b"m",
    ] {
        entries.push((0.0, letter));
    }
    entries
}
