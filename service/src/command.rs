//! Accumulation of framed lines into whole commands, and their execution.

use crate::interp::{CommandContext, CommandError, Flow, Interpreter};
use crate::stats::ServerState;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("command exceeds the limit of {limit} bytes")]
    CommandTooLong { limit: usize },
    #[error("stream ended inside a command, {pending} bytes pending")]
    Truncated { pending: usize },
}

/// The text of a command seen so far.
///
/// A command can span several lines when a brace or a quote is left open, so lines are appended
/// until the interpreter says the text is whole.
pub struct PendingCommand {
    text: Vec<u8>,
    limit: usize,
}

impl PendingCommand {
    pub fn new(limit: usize) -> Self {
        Self {
            text: Vec::new(),
            limit,
        }
    }

    pub fn append(&mut self, line: &[u8]) -> Result<(), ProtocolError> {
        if self.text.len() + line.len() > self.limit {
            return Err(ProtocolError::CommandTooLong { limit: self.limit });
        }
        self.text.extend_from_slice(line);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// A command is only complete at the end of a line.
    pub fn is_complete<I: Interpreter + ?Sized>(&self, interp: &I) -> bool {
        self.text.last() == Some(&b'\n') && interp.is_complete(&String::from_utf8_lossy(&self.text))
    }

    /// Takes the accumulated text without its final newline and leaves the accumulator empty.
    pub fn take(&mut self) -> String {
        let mut text = std::mem::take(&mut self.text);
        if text.last() == Some(&b'\n') {
            text.pop();
        }
        match String::from_utf8(text) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

/// The outcome of a single command, as seen by the batching loop.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// The client asked for a frame right now.
    Break,
    /// The command failed. The session goes on.
    Failed(CommandError),
}

/// Runs `script` and records how long it took.
pub fn execute<I: Interpreter + ?Sized>(
    interp: &mut I,
    script: &str,
    ctx: &mut CommandContext<'_>,
    state: &mut ServerState,
) -> Dispatch {
    let started = Instant::now();
    let result = interp.eval(script, ctx);
    state.record_command(started.elapsed(), result.is_err());
    match result {
        Ok(Flow::Continue) => Dispatch::Continue,
        Ok(Flow::Break) => Dispatch::Break,
        Err(err) => Dispatch::Failed(err),
    }
}
