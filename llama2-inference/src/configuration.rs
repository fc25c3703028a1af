use std::io::Cursor;

use crate::utils::MemoryMapper;
use anyhow::{Context, Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};

/// Size of the checkpoint header in bytes (7 i32 fields).
const HEADER_SIZE: usize = 28;

/// Model hyperparameters, immutable after load.
#[derive(Debug, Clone)]
pub struct Config {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    /// Whether the classifier aliases the token embedding table. Encoded in
    /// the header as the sign of `vocab_size`.
    pub shared_classifier: bool,
}

impl Config {
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Width of one key/value row; smaller than `dim` under grouped-query
    /// attention.
    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Number of query heads sharing each key/value head.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }
}

/// Raw header fields as stored on disk.
#[derive(Debug, Clone, Copy)]
struct RawConfig {
    dim: i32,
    hidden_dim: i32,
    n_layers: i32,
    n_heads: i32,
    n_kv_heads: i32,
    vocab_size: i32,
    seq_len: i32,
}

impl TryFrom<RawConfig> for Config {
    type Error = Error;

    fn try_from(raw: RawConfig) -> Result<Config> {
        validate_config(&raw).with_context(|| "Invalid model configuration")?;

        Ok(Config {
            dim: raw.dim as usize,
            hidden_dim: raw.hidden_dim as usize,
            n_layers: raw.n_layers as usize,
            n_heads: raw.n_heads as usize,
            n_kv_heads: raw.n_kv_heads as usize,
            vocab_size: raw.vocab_size.unsigned_abs() as usize,
            seq_len: raw.seq_len as usize,
            shared_classifier: raw.vocab_size > 0,
        })
    }
}

/// Reads and validates the model configuration from the checkpoint header.
///
/// The header is 7 consecutive i32 values in little-endian order. A negative
/// `vocab_size` signals that the classifier weights are stored separately at
/// the end of the weight stream; its magnitude is the actual vocabulary size.
pub fn read_config(mapper: &mut MemoryMapper) -> Result<Config> {
    let data = mapper
        .get_bytes(HEADER_SIZE)
        .context("Failed to read checkpoint header")?;
    let mut cursor = Cursor::new(data);

    macro_rules! read_i32 {
        ($field:literal) => {
            cursor
                .read_i32::<LittleEndian>()
                .with_context(|| format!("Failed to read {}", $field))?
        };
    }

    let raw = RawConfig {
        dim: read_i32!("dimension"),
        hidden_dim: read_i32!("hidden dimension"),
        n_layers: read_i32!("number of layers"),
        n_heads: read_i32!("number of heads"),
        n_kv_heads: read_i32!("number of KV heads"),
        vocab_size: read_i32!("vocabulary size"),
        seq_len: read_i32!("sequence length"),
    };

    raw.try_into()
}

fn validate_config(raw: &RawConfig) -> Result<()> {
    let dimensions = [
        ("dim", raw.dim),
        ("hidden_dim", raw.hidden_dim),
        ("n_layers", raw.n_layers),
        ("n_heads", raw.n_heads),
        ("n_kv_heads", raw.n_kv_heads),
        ("seq_len", raw.seq_len),
    ];
    for (name, value) in dimensions {
        if value <= 0 {
            anyhow::bail!("Invalid {}: must be positive, got {}", name, value);
        }
    }

    // vocab_size uses its sign to flag an unshared classifier; only zero is
    // impossible.
    if raw.vocab_size == 0 {
        anyhow::bail!("Invalid vocab_size: must be non-zero");
    }

    if raw.n_kv_heads > raw.n_heads {
        anyhow::bail!(
            "Invalid n_kv_heads: {} exceeds n_heads {}",
            raw.n_kv_heads,
            raw.n_heads
        );
    }
    if raw.dim % raw.n_heads != 0 {
        anyhow::bail!(
            "Invalid dim: {} is not divisible by n_heads {}",
            raw.dim,
            raw.n_heads
        );
    }
    if raw.n_heads % raw.n_kv_heads != 0 {
        anyhow::bail!(
            "Invalid n_heads: {} is not divisible by n_kv_heads {}",
            raw.n_heads,
            raw.n_kv_heads
        );
    }

    let head_size = raw.dim / raw.n_heads;
    if head_size % 2 != 0 {
        anyhow::bail!(
            "Invalid head size: {} must be even for rotary embedding",
            head_size
        );
    }

    Ok(())
}
