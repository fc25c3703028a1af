//! Drivers for the two inference modes: one-shot generation and the
//! interactive chat loop.

use crate::sampler::Sampler;
use crate::tokenizer::{Tokenizer, BOS_TOKEN_ID, EOS_TOKEN_ID};
use crate::transformer::Transformer;
use anyhow::Result;
use log::info;
use std::io::{self, Write};
use std::time::Instant;

const B_INST: &str = "[INST]";
const E_INST: &str = "[/INST]";
const B_SYS: &str = "<<SYS>>\n";
const E_SYS: &str = "\n<</SYS>>\n\n";

/// Generates up to `steps` tokens continuing `prompt`, streaming the decoded
/// text to `out`.
///
/// Prompt tokens are teacher-forced; generation starts after the last prompt
/// token and stops at a sequence delimiter (BOS or EOS) or the step budget.
pub fn generate(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    out: &mut dyn Write,
    prompt: Option<&str>,
    steps: usize,
) -> Result<()> {
    let prompt_tokens = tokenizer.encode(prompt.unwrap_or(""))?;

    let first = prompt_tokens.first().copied().unwrap_or(BOS_TOKEN_ID);
    let mut state = GenerationState::new(first);
    let mut metrics = TokenMetrics::new();

    while state.pos < steps {
        let logits = transformer.forward(state.token, state.pos);

        let next = if state.pos + 1 < prompt_tokens.len() {
            // Still inside the prompt.
            prompt_tokens[state.pos + 1]
        } else {
            metrics.start_generation();
            let next = sampler.sample(logits);
            metrics.increment_token();
            next
        };

        write!(out, "{}", tokenizer.decode(state.token, next))?;
        out.flush()?;

        if next == BOS_TOKEN_ID || next == EOS_TOKEN_ID {
            break;
        }
        state.advance(next);
    }

    metrics.report_and_reset();
    writeln!(out)?;
    Ok(())
}

/// Who wrote a message in a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Checks the dialog role sequence: a system message, then user/assistant
/// alternation, ending with the user message the model is asked to answer.
pub fn validate_dialog_roles(dialog: &[Message]) -> Result<()> {
    if dialog.is_empty() {
        anyhow::bail!("Dialog is empty");
    }

    for (i, message) in dialog.iter().enumerate() {
        let expected = match i {
            0 => Role::System,
            odd if odd % 2 == 1 => Role::User,
            _ => Role::Assistant,
        };
        if message.role != expected {
            anyhow::bail!(
                "Expected roles System/User/Assistant/User/..., got {:?} at position {}",
                message.role,
                i
            );
        }
    }

    if dialog.last().map(|m| m.role) != Some(Role::User) {
        anyhow::bail!("Last message before generation must come from the user");
    }
    Ok(())
}

/// Interactive chat: alternating user and assistant turns sharing one KV
/// cache, so each turn only feeds its own tokens.
pub fn chat(
    transformer: &mut Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    out: &mut dyn Write,
    cli_user_prompt: Option<&str>,
    system_prompt: Option<&str>,
    steps: usize,
) -> Result<()> {
    let stdin = io::stdin();
    let seq_len = transformer.config.seq_len;

    let mut dialog = vec![Message {
        role: Role::System,
        content: system_prompt.unwrap_or("").to_string(),
    }];
    let mut state = GenerationState::new(BOS_TOKEN_ID);
    let mut metrics = TokenMetrics::new();
    let mut user_turn = true;
    let mut next_token = BOS_TOKEN_ID;
    let mut assistant_reply = String::new();
    let mut turn_budget = steps;

    loop {
        // Context window exhausted: start over with a fresh conversation.
        if state.pos >= seq_len {
            metrics.report_and_reset();
            writeln!(out)?;
            dialog.truncate(1);
            state.reset(BOS_TOKEN_ID);
            user_turn = true;
        }

        if user_turn {
            let user_prompt = read_user_prompt(&stdin, out, state.pos, cli_user_prompt)?;
            if user_prompt.is_empty() && !(state.pos == 0 && cli_user_prompt.is_some()) {
                break;
            }

            dialog.push(Message {
                role: Role::User,
                content: user_prompt.clone(),
            });
            validate_dialog_roles(&dialog)?;

            let rendered = render_user_turn(state.pos == 0, system_prompt, &user_prompt);
            let mut prompt_tokens = vec![BOS_TOKEN_ID];
            prompt_tokens.extend(tokenizer.encode(&rendered)?);

            for &token in &prompt_tokens {
                if state.pos >= seq_len {
                    break;
                }
                let logits = transformer.forward(token, state.pos);
                next_token = sampler.sample(logits);
                state.advance(token);
            }

            assistant_reply.clear();
            turn_budget = steps;
            user_turn = false;
        } else if next_token == BOS_TOKEN_ID || next_token == EOS_TOKEN_ID || turn_budget == 0 {
            // Assistant turn finished.
            metrics.report_and_reset();
            writeln!(out)?;
            dialog.push(Message {
                role: Role::Assistant,
                content: std::mem::take(&mut assistant_reply),
            });
            user_turn = true;
        } else {
            metrics.start_generation();

            let piece = tokenizer.decode(state.token, next_token).into_owned();
            write!(out, "{piece}")?;
            out.flush()?;
            assistant_reply.push_str(&piece);

            let logits = transformer.forward(next_token, state.pos);
            let sampled = sampler.sample(logits);
            metrics.increment_token();
            state.advance(next_token);
            next_token = sampled;
            turn_budget -= 1;
        }
    }

    metrics.report_and_reset();
    Ok(())
}

fn read_user_prompt(
    stdin: &io::Stdin,
    out: &mut dyn Write,
    pos: usize,
    cli_user_prompt: Option<&str>,
) -> Result<String> {
    match (pos, cli_user_prompt) {
        (0, Some(prompt)) => Ok(prompt.to_string()),
        // A one-shot CLI prompt ends the session after the first exchange.
        (_, Some(_)) => Ok(String::new()),
        _ => {
            write!(out, "> ")?;
            out.flush()?;
            let mut input = String::new();
            stdin.read_line(&mut input)?;
            Ok(input.trim().to_string())
        }
    }
}

/// Renders one user turn in the LLaMA-2 chat format. The system prompt rides
/// inside the first user turn.
fn render_user_turn(first_turn: bool, system_prompt: Option<&str>, user_prompt: &str) -> String {
    match (first_turn, system_prompt) {
        (true, Some(sys)) => format!(
            "{B_INST} {B_SYS}{sys}{E_SYS}{} {E_INST}",
            user_prompt.trim()
        ),
        _ => format!("{B_INST} {} {E_INST}", user_prompt.trim()),
    }
}

/// Tokens-per-second accounting for one generation stretch. Reports one line
/// through the logger so timing lands on stderr, away from the text stream.
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self {
            start_time: None,
            generated_count: 0,
        }
    }

    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report_and_reset(&mut self) {
        if let Some(start_time) = self.start_time.take() {
            let elapsed = start_time.elapsed().as_secs_f64();
            if self.generated_count > 0 && elapsed > 0.0 {
                info!(
                    "Generated {} tokens in {:.2}s, {:.2} tok/s",
                    self.generated_count,
                    elapsed,
                    self.generated_count as f64 / elapsed
                );
            }
        }
        self.generated_count = 0;
    }
}

/// Cursor through one generation: the token last fed to the model and the
/// next position to fill.
struct GenerationState {
    pos: usize,
    token: usize,
}

impl GenerationState {
    fn new(initial_token: usize) -> Self {
        Self {
            pos: 0,
            token: initial_token,
        }
    }

    fn reset(&mut self, initial_token: usize) {
        self.pos = 0;
        self.token = initial_token;
    }

    fn advance(&mut self, token: usize) {
        self.token = token;
        self.pos += 1;
    }
}
