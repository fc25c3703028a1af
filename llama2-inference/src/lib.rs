//! CPU inference engine for LLaMA-2 family checkpoints.
//!
//! Loads a binary checkpoint and a tokenizer vocabulary, then generates text
//! token by token: one transformer forward pass per position, sampling from
//! the resulting logits. One request at a time, 32-bit floats, parallelism
//! confined to the inside of a forward step.

pub mod configuration;
pub mod generation;
pub mod kernels;
pub mod sampler;
pub mod tokenizer;
pub mod transformer;
mod utils;

pub use crate::configuration::Config;
pub use crate::generation::{chat, generate};
pub use crate::sampler::Sampler;
pub use crate::tokenizer::{Tokenizer, BOS_TOKEN_ID, EOS_TOKEN_ID};
pub use crate::transformer::Transformer;

use anyhow::{Context, Result};
use log::debug;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Everything one inference run needs, assembled by the host (CLI flags,
/// typically) through [`InferenceConfigBuilder`].
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub checkpoint_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub temperature: f32,
    pub topp: f32,
    /// Step budget; 0 means run to the model's maximum sequence length.
    pub steps: usize,
    pub mode: String,
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    pub seed: u64,
    /// Worker pool size; `None` keeps the pool's own default.
    pub threads: Option<usize>,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    checkpoint_path: Option<String>,
    tokenizer_path: Option<String>,
    temperature: Option<f32>,
    topp: Option<f32>,
    steps: Option<usize>,
    mode: Option<String>,
    prompt: Option<String>,
    system_prompt: Option<String>,
    seed: Option<u64>,
    threads: Option<usize>,
}

impl InferenceConfigBuilder {
    pub fn checkpoint_path(mut self, path: Option<&String>) -> Self {
        self.checkpoint_path = path.cloned();
        self
    }
    pub fn tokenizer_path(mut self, path: Option<&String>) -> Self {
        self.tokenizer_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn topp(mut self, topp: Option<f32>) -> Self {
        self.topp = topp;
        self
    }
    pub fn steps(mut self, steps: Option<usize>) -> Self {
        self.steps = steps;
        self
    }
    pub fn mode(mut self, mode: Option<&String>) -> Self {
        self.mode = mode.cloned();
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn system_prompt(mut self, system_prompt: Option<&String>) -> Self {
        self.system_prompt = system_prompt.cloned();
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    pub fn build(self) -> Result<InferenceConfig, String> {
        Ok(InferenceConfig {
            checkpoint_path: self
                .checkpoint_path
                .map(PathBuf::from)
                .ok_or("checkpoint_path is required")?,
            tokenizer_path: self
                .tokenizer_path
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tokenizer.bin")),
            temperature: self.temperature.unwrap_or(1.0),
            topp: self.topp.unwrap_or(0.9),
            steps: self.steps.unwrap_or(256),
            mode: self.mode.unwrap_or_else(|| "generate".to_string()),
            prompt: self.prompt,
            system_prompt: self.system_prompt,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
            }),
            threads: self.threads,
        })
    }
}

/// Runs inference: load, wire up, dispatch on mode.
pub fn run_inference(inference_config: InferenceConfig) -> Result<()> {
    debug!("{inference_config:#?}");

    if let Some(threads) = inference_config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to size the worker pool")?;
    }

    let mut transformer = Transformer::from_checkpoint(&inference_config.checkpoint_path)?;
    debug!("{transformer:#?}");

    let config = transformer.config.clone();
    let tokenizer = Tokenizer::from_file(&inference_config.tokenizer_path, config.vocab_size)?;
    debug!("{tokenizer:#?}");

    let mut sampler = Sampler::new(
        config.vocab_size,
        inference_config.temperature,
        inference_config.topp,
        inference_config.seed,
    );

    // 0 and anything past the context window both run to seq_len.
    let steps = match inference_config.steps {
        0 => config.seq_len,
        s => s.min(config.seq_len),
    };

    let mut out = io::stdout().lock();
    let prompt = inference_config.prompt.as_deref();
    let system_prompt = inference_config.system_prompt.as_deref();

    match inference_config.mode.as_str() {
        "generate" => generate(
            &mut transformer,
            &tokenizer,
            &mut sampler,
            &mut out,
            prompt,
            steps,
        ),
        "chat" => chat(
            &mut transformer,
            &tokenizer,
            &mut sampler,
            &mut out,
            prompt,
            system_prompt,
            steps,
        ),
        _ => anyhow::bail!("Unknown mode: {}", inference_config.mode),
    }
}
