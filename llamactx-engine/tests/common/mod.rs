//! Deterministic in-process backend for integration tests
//!
//! Vocabulary layout:
//! - 0: BOS, 1: EOS (both render as nothing)
//! - 2: "\n"
//! - 3..=97: printable ASCII (' '..='~')
//! - 98..=353: raw bytes, used for every other character's UTF-8 encoding
//!
//! Each decode that requests logits consumes the next scripted logits vector;
//! with the script empty the model favours EOS (or returns flat logits in flat
//! mode). Decodes enforce both `n_ctx` and `n_batch`.

#![allow(dead_code)]

use llamactx_engine::{
    ContextConfig, DecodeSession, InferenceContext, LlamaCtxError, LoadedModel, Result, TokenBatch,
    TokenId,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub const BOS: TokenId = TokenId(0);
pub const EOS: TokenId = TokenId(1);
pub const NL: TokenId = TokenId(2);
const ASCII_BASE: i32 = 3;
const BYTE_BASE: i32 = 98;
pub const N_VOCAB: usize = 354;

/// Token of a printable ASCII character.
pub fn tok(c: char) -> TokenId {
    assert!((' '..='~').contains(&c), "not printable ASCII: {:?}", c);
    TokenId(ASCII_BASE + (c as i32 - ' ' as i32))
}

pub fn toks(s: &str) -> Vec<TokenId> {
    s.chars().map(tok).collect()
}

/// Logits that make `token` the clear argmax.
pub fn favour(token: TokenId) -> Vec<f32> {
    let mut logits = vec![0.0; N_VOCAB];
    logits[token.0 as usize] = 10.0;
    logits
}

/// Holds decodes until opened.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Default)]
struct GateState {
    open: bool,
    entered: usize,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.entered += 1;
        self.cv.notify_all();
        while !state.open {
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Block until `n` decodes have reached the gate.
    pub fn wait_until_entered(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        while state.entered < n {
            state = self.cv.wait(state).unwrap();
        }
    }

    pub fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.cv.notify_all();
    }
}

/// Shared view into a [`MockModel`] that stays with the test after the
/// model is moved into a context.
#[derive(Clone, Default)]
pub struct Probe {
    script: Arc<Mutex<VecDeque<Vec<f32>>>>,
    batches: Arc<Mutex<Vec<TokenBatch>>>,
    events: Arc<Mutex<Vec<&'static str>>>,
    fail_next: Arc<AtomicBool>,
    short_logits_next: Arc<AtomicBool>,
    flat: Arc<AtomicBool>,
    gate: Option<Arc<Gate>>,
}

impl Probe {
    /// Queue tokens the model will favour, one per decode.
    pub fn script(&self, tokens: &[TokenId]) {
        let mut script = self.script.lock().unwrap();
        script.extend(tokens.iter().map(|&t| favour(t)));
    }

    pub fn push_logits(&self, logits: Vec<f32>) {
        assert_eq!(logits.len(), N_VOCAB);
        self.script.lock().unwrap().push_back(logits);
    }

    /// Make the next decode fail with a generic evaluation error.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Make the next decode succeed but leave fewer logits than the
    /// vocabulary, so the step fails after the cache has been written.
    pub fn short_logits_next(&self) {
        self.short_logits_next.store(true, Ordering::SeqCst);
    }

    /// Return all-zero logits once the script runs out.
    pub fn set_flat(&self, flat: bool) {
        self.flat.store(flat, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<TokenBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn gate(&self) -> Arc<Gate> {
        self.gate.clone().expect("probe was built without a gate")
    }

    fn next_logits(&self) -> Vec<f32> {
        if let Some(logits) = self.script.lock().unwrap().pop_front() {
            return logits;
        }
        if self.flat.load(Ordering::SeqCst) {
            vec![0.0; N_VOCAB]
        } else {
            favour(EOS)
        }
    }
}

pub struct MockModel {
    probe: Probe,
    vocab_only: bool,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            probe: Probe::default(),
            vocab_only: false,
        }
    }

    /// Decodes wait at a [`Gate`] until the test opens it.
    pub fn gated() -> Self {
        let mut model = Self::new();
        model.probe.gate = Some(Arc::new(Gate::default()));
        model
    }

    pub fn vocab_only() -> Self {
        Self {
            probe: Probe::default(),
            vocab_only: true,
        }
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }

    /// Wrap into a context and keep the probe.
    pub fn into_context(self, config: ContextConfig) -> (InferenceContext, Probe) {
        let probe = self.probe();
        let ctx = InferenceContext::from_model(Arc::new(self), config).unwrap();
        (ctx, probe)
    }
}

impl Drop for MockModel {
    fn drop(&mut self) {
        self.probe.events.lock().unwrap().push("model dropped");
    }
}

impl LoadedModel for MockModel {
    fn n_vocab(&self) -> usize {
        N_VOCAB
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        for c in text.chars() {
            match c {
                '\n' => tokens.push(NL),
                ' '..='~' => tokens.push(tok(c)),
                _ => {
                    let mut buf = [0u8; 4];
                    for &b in c.encode_utf8(&mut buf).as_bytes() {
                        tokens.push(TokenId(BYTE_BASE + b as i32));
                    }
                }
            }
        }
        Ok(tokens)
    }

    fn token_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        let id = token.0;
        let piece = match id {
            0 | 1 => Vec::new(),
            2 => b"\n".to_vec(),
            _ if id < BYTE_BASE => vec![(id - ASCII_BASE) as u8 + b' '],
            _ => vec![(id - BYTE_BASE) as u8],
        };
        Ok(piece)
    }

    fn token_bos(&self) -> TokenId {
        BOS
    }

    fn token_eos(&self) -> TokenId {
        EOS
    }

    fn token_nl(&self) -> TokenId {
        NL
    }

    fn supports_evaluation(&self) -> bool {
        !self.vocab_only
    }

    fn new_session(&self, config: &ContextConfig) -> Result<Box<dyn DecodeSession + '_>> {
        Ok(Box::new(MockSession {
            probe: self.probe(),
            capacity: config.n_ctx as usize,
            n_batch: config.n_batch as usize,
            used: 0,
            logits: Vec::new(),
        }))
    }
}

struct MockSession {
    probe: Probe,
    capacity: usize,
    n_batch: usize,
    used: usize,
    logits: Vec<f32>,
}

impl DecodeSession for MockSession {
    fn decode(&mut self, batch: &TokenBatch) -> Result<()> {
        if let Some(gate) = &self.probe.gate {
            gate.pass();
        }
        self.probe.batches.lock().unwrap().push(batch.clone());

        if self.probe.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LlamaCtxError::Evaluation("injected failure".into()));
        }
        if batch.base_position() != self.used {
            return Err(LlamaCtxError::Evaluation(
                format!(
                    "batch starts at {} but the cache holds {} tokens",
                    batch.base_position(),
                    self.used
                )
                .into(),
            ));
        }
        if batch.len() > self.n_batch {
            return Err(LlamaCtxError::Evaluation(
                format!("batch of {} exceeds n_batch {}", batch.len(), self.n_batch).into(),
            ));
        }
        if self.used + batch.len() > self.capacity {
            return Err(LlamaCtxError::NoCacheSlot);
        }

        self.used += batch.len();
        if batch.items().iter().any(|item| item.logits) {
            self.logits = self.probe.next_logits();
            if self.probe.short_logits_next.swap(false, Ordering::SeqCst) {
                self.logits.truncate(N_VOCAB / 2);
            }
        }
        Ok(())
    }

    fn discard_from(&mut self, position: usize) -> Result<()> {
        self.used = self.used.min(position);
        Ok(())
    }

    fn logits_ith(&self, _index: usize) -> &[f32] {
        &self.logits
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.probe.events.lock().unwrap().push("session dropped");
    }
}

pub fn config() -> ContextConfig {
    ContextConfig {
        seed: Some(42),
        ..Default::default()
    }
}
