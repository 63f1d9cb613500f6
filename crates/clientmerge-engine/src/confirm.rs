//! Operator confirmation flow.
//!
//! Applying a plan needs an [`ApplyPermit`], and the only way to get one is
//! to walk a [`ConfirmationFlow`] through review and two affirmative answers.
//! Every prompt happens before the executor opens a transaction.

use std::io::{self, BufRead, Write};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    AwaitingDryRunReview,
    AwaitingFirstConfirm,
    AwaitingSecondConfirm,
    Applying,
    Done,
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot {action} while {state:?}")]
pub struct FlowError {
    pub state: ConfirmationState,
    pub action: &'static str,
}

/// Proof that the operator confirmed twice. Not cloneable; consumed by the
/// executor.
#[derive(Debug)]
pub struct ApplyPermit {
    _private: (),
}

/// Result of recording one operator answer.
#[derive(Debug)]
pub enum Advance {
    NextPrompt,
    Proceed(ApplyPermit),
    Cancelled,
}

#[derive(Debug)]
pub struct ConfirmationFlow {
    state: ConfirmationState,
}

impl Default for ConfirmationFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfirmationFlow {
    pub fn new() -> Self {
        Self {
            state: ConfirmationState::AwaitingDryRunReview,
        }
    }

    pub fn state(&self) -> ConfirmationState {
        self.state
    }

    fn reject(&self, action: &'static str) -> FlowError {
        FlowError {
            state: self.state,
            action,
        }
    }

    /// The operator has seen the rendered plan.
    pub fn review_complete(&mut self) -> Result<(), FlowError> {
        match self.state {
            ConfirmationState::AwaitingDryRunReview => {
                self.state = ConfirmationState::AwaitingFirstConfirm;
                Ok(())
            }
            _ => Err(self.reject("complete review")),
        }
    }

    pub fn answer(&mut self, affirmative: bool) -> Result<Advance, FlowError> {
        match (self.state, affirmative) {
            (ConfirmationState::AwaitingFirstConfirm, true) => {
                self.state = ConfirmationState::AwaitingSecondConfirm;
                Ok(Advance::NextPrompt)
            }
            (ConfirmationState::AwaitingSecondConfirm, true) => {
                self.state = ConfirmationState::Applying;
                Ok(Advance::Proceed(ApplyPermit { _private: () }))
            }
            (
                ConfirmationState::AwaitingFirstConfirm | ConfirmationState::AwaitingSecondConfirm,
                false,
            ) => {
                self.state = ConfirmationState::Cancelled;
                Ok(Advance::Cancelled)
            }
            _ => Err(self.reject("record an answer")),
        }
    }

    /// Abort without side effects. Allowed from any state before `Applying`.
    pub fn cancel(&mut self) -> Result<(), FlowError> {
        match self.state {
            ConfirmationState::Applying | ConfirmationState::Done => Err(self.reject("cancel")),
            _ => {
                self.state = ConfirmationState::Cancelled;
                Ok(())
            }
        }
    }

    pub fn finish(&mut self) -> Result<(), FlowError> {
        match self.state {
            ConfirmationState::Applying => {
                self.state = ConfirmationState::Done;
                Ok(())
            }
            _ => Err(self.reject("finish")),
        }
    }
}

/// Source of operator answers.
pub trait Confirmer {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool>;
}

/// Only a literal `yes` counts; case and surrounding whitespace are ignored.
pub fn is_affirmative(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

/// Prompts on a writer and reads one line per answer. End of input declines.
pub struct LineConfirmer<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LineConfirmer<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Confirmer for LineConfirmer<R, W> {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        write!(self.output, "{prompt}")?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        Ok(is_affirmative(&line))
    }
}
