//! Evaluation worker thread
//!
//! The backend execution session is not `Send`, so it is created on, and
//! never leaves, a dedicated worker thread. Evaluations reach the worker
//! through a bounded FIFO queue and run one at a time, which makes the worker
//! the only writer of the position cursor.

use super::batch::TokenBatch;
use super::{ConcurrencyPolicy, ContextConfig};
use crate::backend::{DecodeSession, LoadedModel};
use crate::error::{LlamaCtxError, Result};
use crate::sampling::{EvaluateOptions, Sampler};
use crate::token::TokenId;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::oneshot;

/// One queued evaluation. Inputs are owned, so later changes on the caller
/// side do not reach the worker.
struct EvalJob {
    tokens: Vec<TokenId>,
    options: EvaluateOptions,
    cancelled: Arc<AtomicBool>,
    reply: oneshot::Sender<Result<TokenId>>,
}

impl EvalJob {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.reply.is_closed()
    }
}

/// Result of a submitted evaluation.
///
/// Await it from async code or call [`PendingEvaluation::wait`] from a plain
/// thread. Dropping it before the worker picks the job up discards the job.
#[derive(Debug)]
pub struct PendingEvaluation {
    rx: oneshot::Receiver<Result<TokenId>>,
    cancelled: Arc<AtomicBool>,
}

impl PendingEvaluation {
    fn new() -> (Self, oneshot::Sender<Result<TokenId>>) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            rx,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        (pending, tx)
    }

    /// An evaluation that failed before reaching the queue.
    pub(super) fn failed(err: LlamaCtxError) -> Self {
        let (pending, tx) = Self::new();
        let _ = tx.send(Err(err));
        pending
    }

    /// Discard the evaluation if the worker has not started it yet.
    ///
    /// A decode that is already running completes; its result is still
    /// delivered.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Block the current thread until the result is ready.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> Result<TokenId> {
        let Self { rx, cancelled } = self;
        match rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(closed_error(&cancelled)),
        }
    }
}

/// Error for a reply channel that closed without a result.
fn closed_error(cancelled: &AtomicBool) -> LlamaCtxError {
    if cancelled.load(Ordering::Acquire) {
        LlamaCtxError::Cancelled
    } else {
        LlamaCtxError::evaluation("evaluation worker stopped")
    }
}

impl Future for PendingEvaluation {
    type Output = Result<TokenId>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.rx).poll(cx);
        match polled {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed_error(&self.cancelled))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle to the worker thread that owns the execution session.
pub(super) struct EvalWorker {
    queue: Option<Sender<EvalJob>>,
    thread: Option<JoinHandle<()>>,
    cursor: Arc<AtomicUsize>,
    outstanding: Arc<AtomicUsize>,
    policy: ConcurrencyPolicy,
}

impl EvalWorker {
    /// Start the worker and wait until it has created its session.
    pub(super) fn spawn(model: Arc<dyn LoadedModel>, config: ContextConfig) -> Result<Self> {
        let (queue_tx, queue_rx) = crossbeam_channel::bounded::<EvalJob>(config.queue_capacity);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let cursor = Arc::new(AtomicUsize::new(0));
        let outstanding = Arc::new(AtomicUsize::new(0));
        let policy = config.policy;

        let thread = thread::Builder::new()
            .name("llamactx-eval".into())
            .spawn({
                let cursor = Arc::clone(&cursor);
                let outstanding = Arc::clone(&outstanding);
                move || eval_loop(model, config, queue_rx, ready_tx, cursor, outstanding)
            })
            .map_err(|e| LlamaCtxError::Evaluation(e.into()))?;

        let startup = ready_rx.recv().unwrap_or_else(|_| {
            Err(LlamaCtxError::evaluation(
                "evaluation worker exited during startup",
            ))
        });
        if let Err(e) = startup {
            let _ = thread.join();
            return Err(e);
        }

        Ok(Self {
            queue: Some(queue_tx),
            thread: Some(thread),
            cursor,
            outstanding,
            policy,
        })
    }

    pub(super) fn submit(
        &self,
        tokens: Vec<TokenId>,
        options: EvaluateOptions,
    ) -> PendingEvaluation {
        let Some(queue) = &self.queue else {
            return PendingEvaluation::failed(LlamaCtxError::evaluation(
                "context is shutting down",
            ));
        };

        match self.policy {
            ConcurrencyPolicy::Reject => {
                if let Err(outstanding) = self.outstanding.compare_exchange(
                    0,
                    1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    return PendingEvaluation::failed(LlamaCtxError::ConcurrentEvaluation {
                        outstanding,
                    });
                }
            }
            ConcurrencyPolicy::Queue => {
                self.outstanding.fetch_add(1, Ordering::AcqRel);
            }
        }

        let (pending, reply) = PendingEvaluation::new();
        let job = EvalJob {
            tokens,
            options,
            cancelled: Arc::clone(&pending.cancelled),
            reply,
        };

        match queue.try_send(job) {
            Ok(()) => pending,
            Err(TrySendError::Full(_)) => {
                let outstanding = self.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
                PendingEvaluation::failed(LlamaCtxError::ConcurrentEvaluation { outstanding })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                PendingEvaluation::failed(LlamaCtxError::evaluation("evaluation worker stopped"))
            }
        }
    }

    pub(super) fn position(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub(super) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Drop for EvalWorker {
    /// Close the queue, let the worker finish every queued job, then join it.
    fn drop(&mut self) {
        drop(self.queue.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("Evaluation worker panicked");
        }
    }
}

fn eval_loop(
    model: Arc<dyn LoadedModel>,
    config: ContextConfig,
    jobs: Receiver<EvalJob>,
    ready: Sender<Result<()>>,
    cursor: Arc<AtomicUsize>,
    outstanding: Arc<AtomicUsize>,
) {
    let mut session = match model.new_session(&config) {
        Ok(session) => session,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let n_vocab = model.n_vocab();
    let n_batch = config.n_batch as usize;
    let mut sampler = Sampler::new(config.seed);

    // Ends once the queue is closed and drained
    for job in jobs.iter() {
        if job.is_cancelled() {
            tracing::debug!(
                "Discarding cancelled evaluation ({} tokens)",
                job.tokens.len()
            );
            outstanding.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        let step = EvalStep {
            n_vocab,
            n_batch,
            tokens: &job.tokens,
            options: &job.options,
        };
        let result = step.run(session.as_mut(), &cursor, &mut sampler);
        if let Err(e) = &result {
            tracing::warn!("Evaluation failed: {}", e);
        }

        outstanding.fetch_sub(1, Ordering::AcqRel);
        let _ = job.reply.send(result);
    }

    // Session goes before the model reference
    drop(session);
    tracing::debug!(
        "Evaluation worker stopped at position {}",
        cursor.load(Ordering::Acquire)
    );
}

/// One evaluation as the worker runs it.
struct EvalStep<'a> {
    n_vocab: usize,
    n_batch: usize,
    tokens: &'a [TokenId],
    options: &'a EvaluateOptions,
}

impl EvalStep<'_> {
    /// Decode the tokens at the cursor, sample, then advance the cursor.
    ///
    /// Either the whole step succeeds and the cursor moves past every token,
    /// or the cache is cut back to the cursor and the cursor stays put.
    fn run(
        &self,
        session: &mut dyn DecodeSession,
        cursor: &AtomicUsize,
        sampler: &mut Sampler,
    ) -> Result<TokenId> {
        let base = cursor.load(Ordering::Acquire);
        let batches = TokenBatch::split_for_sequence(self.tokens, base, self.n_batch)?;

        let started = Instant::now();
        match self.decode_and_sample(session, sampler, &batches) {
            Ok(token) => {
                cursor.store(base + self.tokens.len(), Ordering::Release);
                tracing::debug!(
                    "Evaluated {} tokens at position {} in {} batches, {:.1}ms",
                    self.tokens.len(),
                    base,
                    batches.len(),
                    started.elapsed().as_secs_f64() * 1000.0
                );
                Ok(token)
            }
            Err(e) => {
                if let Err(discard) = session.discard_from(base) {
                    tracing::warn!("Failed to discard cache from {}: {}", base, discard);
                }
                Err(e)
            }
        }
    }

    fn decode_and_sample(
        &self,
        session: &mut dyn DecodeSession,
        sampler: &mut Sampler,
        batches: &[TokenBatch],
    ) -> Result<TokenId> {
        for batch in batches {
            session.decode(batch)?;
        }
        let last = batches
            .last()
            .ok_or_else(|| LlamaCtxError::invalid("token sequence is empty"))?;

        let logits = session.logits_ith(last.logits_index());
        let logits = logits.get(..self.n_vocab).ok_or_else(|| {
            LlamaCtxError::evaluation(format!(
                "backend returned {} logits for a vocabulary of {}",
                logits.len(),
                self.n_vocab
            ))
        })?;

        sampler.sample(logits, self.options)
    }
}
