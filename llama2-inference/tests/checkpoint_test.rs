//! Integration tests for checkpoint loading and the forward pass.

mod common;

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use common::{write_checkpoint, CheckpointSpec};
use llama2_inference::Transformer;
use std::io::Write;

#[test]
fn loads_shared_classifier_checkpoint() -> Result<()> {
    let spec = CheckpointSpec::small();
    let file = write_checkpoint(&spec, true, 1)?;

    let mut transformer = Transformer::from_checkpoint(file.path())?;
    let config = &transformer.config;
    assert_eq!(config.dim, spec.dim);
    assert_eq!(config.hidden_dim, spec.hidden_dim);
    assert_eq!(config.n_layers, spec.n_layers);
    assert_eq!(config.n_heads, spec.n_heads);
    assert_eq!(config.n_kv_heads, spec.n_kv_heads);
    assert_eq!(config.vocab_size, spec.vocab_size);
    assert_eq!(config.seq_len, spec.seq_len);
    assert!(config.shared_classifier);

    let logits = transformer.forward(0, 0);
    assert_eq!(logits.len(), spec.vocab_size);
    assert!(logits.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn negative_vocab_size_selects_separate_classifier() -> Result<()> {
    let spec = CheckpointSpec::small();
    let file = write_checkpoint(&spec, false, 2)?;

    let mut transformer = Transformer::from_checkpoint(file.path())?;
    assert!(!transformer.config.shared_classifier);
    assert_eq!(transformer.config.vocab_size, spec.vocab_size);

    let logits = transformer.forward(3, 0);
    assert_eq!(logits.len(), spec.vocab_size);
    assert!(logits.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn forward_is_deterministic_across_loads() -> Result<()> {
    let spec = CheckpointSpec::small();
    let file = write_checkpoint(&spec, true, 3)?;

    let mut a = Transformer::from_checkpoint(file.path())?;
    let mut b = Transformer::from_checkpoint(file.path())?;

    for (pos, token) in [5, 3, 7, 1, 4].into_iter().enumerate() {
        let la = a.forward(token, pos).to_vec();
        let lb = b.forward(token, pos).to_vec();
        assert_eq!(la, lb, "logits diverged at position {pos}");
    }
    Ok(())
}

#[test]
fn logits_depend_on_the_cached_prefix() -> Result<()> {
    let spec = CheckpointSpec::small();
    let file = write_checkpoint(&spec, true, 4)?;

    // Same token at position 1, different position-0 history.
    let mut a = Transformer::from_checkpoint(file.path())?;
    a.forward(5, 0);
    let la = a.forward(9, 1).to_vec();

    let mut b = Transformer::from_checkpoint(file.path())?;
    b.forward(6, 0);
    let lb = b.forward(9, 1).to_vec();

    assert_ne!(la, lb, "KV cache had no effect on the next position");
    Ok(())
}

#[test]
fn full_attention_width_also_loads() -> Result<()> {
    // n_kv_heads == n_heads: plain multi-head attention, kv_dim == dim.
    let spec = CheckpointSpec {
        n_kv_heads: 2,
        ..CheckpointSpec::small()
    };
    let file = write_checkpoint(&spec, true, 5)?;

    let mut transformer = Transformer::from_checkpoint(file.path())?;
    for pos in 0..spec.seq_len {
        let logits = transformer.forward(pos % spec.vocab_size, pos);
        assert!(logits.iter().all(|v| v.is_finite()));
    }
    Ok(())
}

#[test]
fn rejects_truncated_checkpoint() -> Result<()> {
    let spec = CheckpointSpec::small();
    let file = write_checkpoint(&spec, true, 6)?;

    let bytes = std::fs::read(file.path())?;
    let mut truncated = tempfile::NamedTempFile::new()?;
    truncated.write_all(&bytes[..bytes.len() / 2])?;
    truncated.flush()?;

    assert!(Transformer::from_checkpoint(truncated.path()).is_err());
    Ok(())
}

#[test]
fn rejects_trailing_bytes() -> Result<()> {
    let spec = CheckpointSpec::small();
    let file = write_checkpoint(&spec, true, 7)?;

    // Original content plus one stray float, as an oversized weight layout
    // would produce.
    let mut content = std::fs::read(file.path())?;
    content.write_f32::<LittleEndian>(0.5)?;
    let mut padded = tempfile::NamedTempFile::new()?;
    padded.write_all(&content)?;
    padded.flush()?;

    let err = Transformer::from_checkpoint(padded.path()).unwrap_err();
    assert!(
        err.to_string().contains("trailing"),
        "unexpected error: {err}"
    );
    Ok(())
}

#[test]
fn rejects_invalid_header() -> Result<()> {
    // Zero dim in an otherwise plausible header.
    let mut file = tempfile::NamedTempFile::new()?;
    for value in [0i32, 16, 2, 2, 1, 16, 8] {
        file.write_i32::<LittleEndian>(value)?;
    }
    file.flush()?;

    assert!(Transformer::from_checkpoint(file.path()).is_err());
    Ok(())
}

#[test]
#[should_panic(expected = "out of range")]
fn forward_panics_on_out_of_range_token() {
    let spec = CheckpointSpec::small();
    let file = write_checkpoint(&spec, true, 8).unwrap();
    let mut transformer = Transformer::from_checkpoint(file.path()).unwrap();
    transformer.forward(spec.vocab_size, 0);
}
