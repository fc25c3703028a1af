//! Transformer weights, per-generation run state, and the forward pass.
//!
//! Weights are flat slices borrowed from the memory-mapped checkpoint and
//! indexed arithmetically; per-layer views are cheap subslices, not copies.
//! The forward pass runs one token at one position and leaves the
//! unnormalized next-token distribution in the logits buffer.

use std::fs::File;
use std::path::Path;

use crate::configuration::{read_config, Config};
use crate::kernels::{accumulate, matmul, rmsnorm, rmsnorm_inplace, softmax};
use crate::utils::MemoryMapper;
use anyhow::{Context, Result};
use rayon::prelude::*;

/// Base for the rotary embedding frequencies.
const ROPE_BASE_FREQ: f32 = 10000.0;

pub struct Transformer {
    pub config: Config,
    weights: TransformerWeights,
    state: RunState,
    _mapper: MemoryMapper,
}

impl Transformer {
    /// Loads a model from a checkpoint file: header, then the packed f32
    /// weight stream.
    pub fn from_checkpoint(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open checkpoint: {}", path.display()))?;
        let mut mapper = MemoryMapper::new(file)?;

        let config = read_config(&mut mapper)?;
        let weights = TransformerWeights::load(&mut mapper, &config)?;

        if mapper.remaining() > 0 {
            anyhow::bail!(
                "Checkpoint has {} trailing bytes; incompatible weight layout",
                mapper.remaining()
            );
        }

        let state = RunState::new(&config);

        Ok(Self {
            config,
            weights,
            state,
            // Keep the mapping alive for as long as the weight slices.
            _mapper: mapper,
        })
    }

    /// One forward pass for `token` at `pos`, conditioned on the KV cache
    /// rows written at positions `0..pos`. Returns the logits buffer; the
    /// caller may transform it in place when sampling.
    ///
    /// An out-of-range token or position is a caller bug, not an I/O
    /// condition, and fails fast.
    pub fn forward(&mut self, token: usize, pos: usize) -> &mut [f32] {
        let config = &self.config;
        assert!(
            token < config.vocab_size,
            "token {token} out of range for vocabulary of {}",
            config.vocab_size
        );
        assert!(
            pos < config.seq_len,
            "position {pos} exceeds maximum sequence length {}",
            config.seq_len
        );

        let dim = config.dim;
        let hidden_dim = config.hidden_dim;
        let seq_len = config.seq_len;
        let n_heads = config.n_heads;
        let head_size = config.head_size();
        let kv_dim = config.kv_dim();
        let kv_mul = config.kv_mul();

        let w = &self.weights;
        let s = &mut self.state;

        // Token embedding.
        s.x.copy_from_slice(&w.token_embedding[token * dim..(token + 1) * dim]);

        for l in 0..config.n_layers {
            rmsnorm(&mut s.xb, &s.x, &w.rms_attention[l * dim..(l + 1) * dim]);

            // Q/K/V projections for this position are independent; dispatch
            // them together on the shared pool.
            {
                let (q, k, v) = (&mut s.q, &mut s.k, &mut s.v);
                let xb = &s.xb;
                rayon::join(
                    || matmul(q, xb, &w.wq[l * dim * dim..(l + 1) * dim * dim]),
                    || {
                        rayon::join(
                            || matmul(k, xb, &w.wk[l * dim * kv_dim..(l + 1) * dim * kv_dim]),
                            || matmul(v, xb, &w.wv[l * dim * kv_dim..(l + 1) * dim * kv_dim]),
                        )
                    },
                );
            }

            // Rotate adjacent (even, odd) pairs of q, and of k within the
            // key/value width, by the position-dependent angle.
            for i in (0..dim).step_by(2) {
                let head_dim = i % head_size;
                let freq = 1.0 / ROPE_BASE_FREQ.powf(head_dim as f32 / head_size as f32);
                let (sin, cos) = (pos as f32 * freq).sin_cos();

                let (q0, q1) = (s.q[i], s.q[i + 1]);
                s.q[i] = q0 * cos - q1 * sin;
                s.q[i + 1] = q0 * sin + q1 * cos;

                if i < kv_dim {
                    let (k0, k1) = (s.k[i], s.k[i + 1]);
                    s.k[i] = k0 * cos - k1 * sin;
                    s.k[i + 1] = k0 * sin + k1 * cos;
                }
            }

            // Save key and value for this position into the cache.
            let loff = l * seq_len * kv_dim;
            let cache_row = loff + pos * kv_dim;
            s.key_cache[cache_row..cache_row + kv_dim].copy_from_slice(&s.k);
            s.value_cache[cache_row..cache_row + kv_dim].copy_from_slice(&s.v);

            // Attention over all positions up to and including `pos`, one
            // head per pool task: each head owns disjoint slices of att and
            // xb, so there is nothing to synchronize but the join.
            let att_scale = (head_size as f32).sqrt();
            {
                let q = &s.q;
                let key_cache = &s.key_cache;
                let value_cache = &s.value_cache;

                s.att
                    .par_chunks_mut(seq_len)
                    .zip(s.xb.par_chunks_mut(head_size))
                    .zip((0..n_heads).into_par_iter())
                    .for_each(|((att_head, xb_head), h)| {
                        let q_head = &q[h * head_size..(h + 1) * head_size];
                        // Integer division selects the key/value head shared
                        // by this group of query heads.
                        let kv_head = h / kv_mul;

                        for (t, score) in att_head[..=pos].iter_mut().enumerate() {
                            let k_row = loff + t * kv_dim + kv_head * head_size;
                            let k_head = &key_cache[k_row..k_row + head_size];
                            *score = q_head
                                .iter()
                                .zip(k_head)
                                .map(|(&qv, &kv)| qv * kv)
                                .sum::<f32>()
                                / att_scale;
                        }

                        softmax(&mut att_head[..=pos]);

                        xb_head.fill(0.0);
                        for (t, &weight) in att_head[..=pos].iter().enumerate() {
                            let v_row = loff + t * kv_dim + kv_head * head_size;
                            let v_head = &value_cache[v_row..v_row + head_size];
                            xb_head
                                .iter_mut()
                                .zip(v_head)
                                .for_each(|(out, &vv)| *out += weight * vv);
                        }
                    });
            }

            // Attention output projection, then the residual connection.
            matmul(&mut s.xb2, &s.xb, &w.wo[l * dim * dim..(l + 1) * dim * dim]);
            accumulate(&mut s.x, &s.xb2);

            rmsnorm(&mut s.xb, &s.x, &w.rms_ffn[l * dim..(l + 1) * dim]);

            // Gate and up projections are independent as well.
            {
                let (hb, hb2) = (&mut s.hb, &mut s.hb2);
                let xb = &s.xb;
                let w1 = &w.w1[l * dim * hidden_dim..(l + 1) * dim * hidden_dim];
                let w3 = &w.w3[l * dim * hidden_dim..(l + 1) * dim * hidden_dim];
                rayon::join(|| matmul(hb, xb, w1), || matmul(hb2, xb, w3));
            }

            // SwiGLU: silu(w1(x)) scaled elementwise by w3(x).
            s.hb.iter_mut().zip(s.hb2.iter()).for_each(|(gate, &up)| {
                *gate = *gate / (1.0 + (-f64::from(*gate)).exp() as f32) * up;
            });

            // FFN down projection and the second residual connection.
            matmul(
                &mut s.xb,
                &s.hb,
                &w.w2[l * dim * hidden_dim..(l + 1) * dim * hidden_dim],
            );
            accumulate(&mut s.x, &s.xb);
        }

        rmsnorm_inplace(&mut s.x, w.rms_final);

        matmul(&mut s.logits, &s.x, w.wcls());
        &mut s.logits[..]
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("classifier", &self.weights.classifier)
            .finish_non_exhaustive()
    }
}

/// Classifier weight ownership: either an alias of the token embedding table
/// or a separate tensor at the tail of the weight stream. Never two views of
/// the same buffer.
enum Classifier {
    SharedWithEmbedding,
    Separate(&'static [f32]),
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classifier::SharedWithEmbedding => f.write_str("SharedWithEmbedding"),
            Classifier::Separate(weights) => {
                f.debug_tuple("Separate").field(&weights.len()).finish()
            }
        }
    }
}

/// All learned parameters, as flat row-major slices into the checkpoint map.
struct TransformerWeights {
    /// (vocab_size, dim)
    token_embedding: &'static [f32],
    /// (n_layers, dim)
    rms_attention: &'static [f32],
    /// (n_layers, dim)
    rms_ffn: &'static [f32],
    /// (dim,)
    rms_final: &'static [f32],
    /// (n_layers, dim, dim)
    wq: &'static [f32],
    /// (n_layers, kv_dim, dim)
    wk: &'static [f32],
    /// (n_layers, kv_dim, dim)
    wv: &'static [f32],
    /// (n_layers, dim, dim)
    wo: &'static [f32],
    /// (n_layers, hidden_dim, dim)
    w1: &'static [f32],
    /// (n_layers, dim, hidden_dim)
    w2: &'static [f32],
    /// (n_layers, hidden_dim, dim)
    w3: &'static [f32],
    classifier: Classifier,
}

impl TransformerWeights {
    /// Reads the weight stream in checkpoint order. The two legacy rotary
    /// frequency tables are skipped; rotation is computed analytically per
    /// step.
    fn load(mapper: &mut MemoryMapper, config: &Config) -> Result<Self> {
        let Config {
            dim,
            hidden_dim,
            n_layers,
            vocab_size,
            seq_len,
            ..
        } = *config;
        let kv_dim = config.kv_dim();
        let head_size = config.head_size();

        macro_rules! read_f32_weights {
            ($size:expr, $field:literal) => {
                // SAFETY: the mmap is stored in the Transformer next to these
                // slices and outlives every use of them.
                unsafe {
                    std::mem::transmute::<&[f32], &'static [f32]>(
                        mapper
                            .get_f32_slice($size)
                            .with_context(|| format!("Failed to read {}", $field))?,
                    )
                }
            };
        }

        let token_embedding = read_f32_weights!(vocab_size * dim, "token embedding table");
        let rms_attention = read_f32_weights!(n_layers * dim, "attention normalization weights");
        let wq = read_f32_weights!(n_layers * dim * dim, "query projections");
        let wk = read_f32_weights!(n_layers * dim * kv_dim, "key projections");
        let wv = read_f32_weights!(n_layers * dim * kv_dim, "value projections");
        let wo = read_f32_weights!(n_layers * dim * dim, "attention output projections");
        let rms_ffn = read_f32_weights!(n_layers * dim, "FFN normalization weights");
        let w1 = read_f32_weights!(n_layers * dim * hidden_dim, "FFN gate projections");
        let w2 = read_f32_weights!(n_layers * hidden_dim * dim, "FFN down projections");
        let w3 = read_f32_weights!(n_layers * dim * hidden_dim, "FFN up projections");
        let rms_final = read_f32_weights!(dim, "final normalization weights");

        // The format still carries precomputed rotary frequency tables.
        let legacy_rope_len = seq_len * (head_size / 2);
        mapper
            .skip(2 * legacy_rope_len * std::mem::size_of::<f32>())
            .context("Failed to skip legacy RoPE frequency tables")?;

        let classifier = if config.shared_classifier {
            Classifier::SharedWithEmbedding
        } else {
            Classifier::Separate(read_f32_weights!(vocab_size * dim, "classifier weights"))
        };

        Ok(Self {
            token_embedding,
            rms_attention,
            rms_ffn,
            rms_final,
            wq,
            wk,
            wv,
            wo,
            w1,
            w2,
            w3,
            classifier,
        })
    }

    fn wcls(&self) -> &[f32] {
        match self.classifier {
            Classifier::SharedWithEmbedding => self.token_embedding,
            Classifier::Separate(weights) => weights,
        }
    }
}

/// Scratch buffers and the KV cache for one generation session. Allocated
/// once from the config, reused across positions, dropped with the session.
#[derive(Debug)]
struct RunState {
    /// (dim,) activation at the current position
    x: Vec<f32>,
    /// (dim,) activation inside a residual branch
    xb: Vec<f32>,
    /// (dim,) second residual-branch buffer
    xb2: Vec<f32>,
    /// (hidden_dim,) FFN gate buffer
    hb: Vec<f32>,
    /// (hidden_dim,) FFN up buffer
    hb2: Vec<f32>,
    /// (dim,) query
    q: Vec<f32>,
    /// (kv_dim,) key
    k: Vec<f32>,
    /// (kv_dim,) value
    v: Vec<f32>,
    /// (n_heads, seq_len) attention scores
    att: Vec<f32>,
    /// (vocab_size,) output logits
    logits: Vec<f32>,
    /// (n_layers, seq_len, kv_dim)
    key_cache: Vec<f32>,
    /// (n_layers, seq_len, kv_dim)
    value_cache: Vec<f32>,
}

impl RunState {
    fn new(config: &Config) -> Self {
        let kv_dim = config.kv_dim();
        Self {
            x: vec![0.0; config.dim],
            xb: vec![0.0; config.dim],
            xb2: vec![0.0; config.dim],
            hb: vec![0.0; config.hidden_dim],
            hb2: vec![0.0; config.hidden_dim],
            q: vec![0.0; config.dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; config.n_heads * config.seq_len],
            logits: vec![0.0; config.vocab_size],
            key_cache: vec![0.0; config.n_layers * config.seq_len * kv_dim],
            value_cache: vec![0.0; config.n_layers * config.seq_len * kv_dim],
        }
    }
}
