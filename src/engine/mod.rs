//! Dialog engine abstraction.
//!
//! The relay treats the text-generation engine as an external collaborator
//! behind the [`DialogEngine`] trait: construction is "create", [`query`]
//! streams fragments through a callback invoked synchronously on the calling
//! thread, [`reset`] clears dialog state, and dropping the engine is "free".
//!
//! [`query`]: DialogEngine::query
//! [`reset`]: DialogEngine::reset

pub mod ipc;
pub mod mock;
pub mod process;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boundary marker attached to each streamed fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SentenceCode {
    /// First fragment of a generation turn.
    Begin,
    /// Fragment in the middle of a turn.
    Continue,
    /// Final fragment — the dialog turn is complete.
    End,
    /// Generation stopped before the turn completed.
    Abort,
}

/// Granularity the engine should use when invoking the fragment callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompletionMode {
    /// Stream fragments as they are produced until the turn is complete.
    #[default]
    Complete,
    /// One callback per finished sentence.
    Sentence,
}

/// Errors surfaced by engine implementations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start engine process: {0}")]
    Startup(String),
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error("engine reported failure: {0}")]
    Engine(String),
    #[error("query cancelled or deadline exceeded")]
    Cancelled,
}

/// Cooperative cancellation handle passed alongside every query call.
///
/// Implementations poll [`is_cancelled`] between fragments and bail out with
/// [`EngineError::Cancelled`]. A token built with [`with_deadline`] doubles as
/// a query timeout.
///
/// [`is_cancelled`]: CancelToken::is_cancelled
/// [`with_deadline`]: CancelToken::with_deadline
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that only cancels when [`cancel`](CancelToken::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that additionally cancels once `timeout` has elapsed.
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Request cancellation. Clones of this token observe the flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

/// A stateful streaming text-generation engine.
///
/// The handle is exclusively owned by one session; the single-threaded server
/// loop enforces that structurally, so no locking is required here.
pub trait DialogEngine {
    /// Run one generation turn for `prompt`.
    ///
    /// `on_fragment` is invoked zero or more times, synchronously, on the
    /// calling thread, in production order. Returning `Ok(())` means the
    /// query call completed; it does not imply any fragments were produced.
    fn query(
        &mut self,
        prompt: &str,
        mode: CompletionMode,
        cancel: &CancelToken,
        on_fragment: &mut dyn FnMut(&str, SentenceCode),
    ) -> Result<(), EngineError>;

    /// Clear the engine's dialog state.
    fn reset(&mut self) -> Result<(), EngineError>;
}
