//! The command language.
//!
//! Commands are Tcl flavoured: whitespace separated words, `{...}` for literal groups that may
//! span lines, `"..."` for groups with backslash escapes, and `;` or a newline between commands.
//! There is no variable or command substitution, each command is looked up by its first word in
//! a table of handlers.

use crate::framer::{FrameError, PayloadReader};
use crate::response::Response;
use crate::scene::Scene;
use std::collections::HashMap;
use thiserror::Error;

/// What the batching loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop reading input and produce a frame right away.
    Break,
}

/// A command that ran but failed. The message is sent back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CommandError(pub String);

impl CommandError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Everything a command handler may touch.
pub struct CommandContext<'a> {
    pub scene: &'a mut Scene,
    pub payload: &'a mut dyn PayloadReader,
    /// Responses produced by the command, sent out after it finishes.
    pub replies: Vec<Response<'static>>,
    /// Notes that accompany an error report.
    pub diagnostics: Vec<String>,
    /// Set when the input stream itself failed under the command. The session can't go on.
    pub input_failure: Option<FrameError>,
}

impl<'a> CommandContext<'a> {
    pub fn new(scene: &'a mut Scene, payload: &'a mut dyn PayloadReader) -> Self {
        Self {
            scene,
            payload,
            replies: Vec::new(),
            diagnostics: Vec::new(),
            input_failure: None,
        }
    }

    pub fn reply(&mut self, response: Response<'static>) {
        self.replies.push(response);
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.diagnostics.push(note.into());
    }

    /// Records a failure of the input stream and returns the error for the command.
    pub fn input_failed(&mut self, err: FrameError) -> CommandError {
        let error = CommandError(format!("while reading data stream: {}", err));
        self.input_failure = Some(err);
        error
    }
}

pub trait Interpreter {
    /// Does the text form whole commands, i.e. are all braces and quotes closed?
    fn is_complete(&self, script: &str) -> bool;

    fn eval(&mut self, script: &str, ctx: &mut CommandContext<'_>) -> Result<Flow, CommandError>;
}

pub type Handler = fn(&mut CommandContext<'_>, &[String]) -> Result<Flow, CommandError>;

pub struct Shell {
    commands: HashMap<String, Handler>,
}

impl Shell {
    /// A shell without any commands.
    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, handler: Handler) {
        self.commands.insert(name.to_string(), handler);
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }
}

impl Default for Shell {
    /// A shell with the built-in vocabulary, see `builtins`.
    fn default() -> Self {
        let mut shell = Self::empty();
        crate::builtins::register(&mut shell);
        shell
    }
}

impl Interpreter for Shell {
    fn is_complete(&self, script: &str) -> bool {
        is_complete(script)
    }

    fn eval(&mut self, script: &str, ctx: &mut CommandContext<'_>) -> Result<Flow, CommandError> {
        for words in parse(script)? {
            let handler = match self.commands.get(&words[0]) {
                Some(handler) => *handler,
                None => {
                    return Err(CommandError(format!(
                        "invalid command name \"{}\"",
                        words[0]
                    )))
                }
            };
            match handler(ctx, &words) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Break) => return Ok(Flow::Break),
                Err(err) => {
                    ctx.note(format!("while executing \"{}\"", words.join(" ")));
                    return Err(err);
                }
            }
        }
        Ok(Flow::Continue)
    }
}

/// Checks that every brace and quote opened in `script` is closed and the text does not end in
/// a line continuation.
pub fn is_complete(script: &str) -> bool {
    let mut depth = 0usize;
    let mut quoted = false;
    let mut word_start = true;
    let mut chars = script.chars().peekable();
    while let Some(c) = chars.next() {
        let at_start = word_start;
        word_start = false;
        match c {
            '\\' => match chars.next() {
                None => return false,
                Some('\n') if chars.peek().is_none() => return false,
                Some(_) => {}
            },
            // Quotes and braces only group at the start of a word.
            '"' if depth == 0 && (quoted || at_start) => quoted = !quoted,
            '{' if !quoted && (depth > 0 || at_start) => depth += 1,
            '}' if !quoted && depth > 0 => depth -= 1,
            c if depth == 0 && !quoted && is_separator(c) => word_start = true,
            _ => {}
        }
    }
    depth == 0 && !quoted
}

/// Splits a script into commands, each a list of words. Empty commands and comments are skipped.
pub fn parse(script: &str) -> Result<Vec<Vec<String>>, CommandError> {
    let chars: Vec<char> = script.chars().collect();
    let mut commands = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' || c == ';' {
            if !words.is_empty() {
                commands.push(std::mem::take(&mut words));
            }
            i += 1;
        } else if c.is_whitespace() {
            i += 1;
        } else if c == '\\' && chars.get(i + 1) == Some(&'\n') {
            // A continuation between words is just a separator.
            i += 2;
        } else if c == '#' && words.is_empty() {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '{' {
            let (word, next) = braced_word(&chars, i)?;
            words.push(word);
            i = next;
        } else if c == '"' {
            let (word, next) = quoted_word(&chars, i)?;
            words.push(word);
            i = next;
        } else {
            let (word, next) = bare_word(&chars, i);
            words.push(word);
            i = next;
        }
    }
    if !words.is_empty() {
        commands.push(words);
    }
    Ok(commands)
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ';'
}

fn braced_word(chars: &[char], start: usize) -> Result<(String, usize), CommandError> {
    let mut depth = 1;
    let mut word = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if i + 1 < chars.len() => {
                // Kept verbatim, the escaped character can't close the group.
                word.push(c);
                word.push(chars[i + 1]);
                i += 2;
                continue;
            }
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let next = i + 1;
                    if next < chars.len() && !is_separator(chars[next]) {
                        return Err(CommandError::new("extra characters after close-brace"));
                    }
                    return Ok((word, next));
                }
            }
            _ => {}
        }
        word.push(c);
        i += 1;
    }
    Err(CommandError::new("missing close-brace"))
}

fn quoted_word(chars: &[char], start: usize) -> Result<(String, usize), CommandError> {
    let mut word = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i = backslash(chars, i, &mut word),
            '"' => {
                let next = i + 1;
                if next < chars.len() && !is_separator(chars[next]) {
                    return Err(CommandError::new("extra characters after close-quote"));
                }
                return Ok((word, next));
            }
            c => {
                word.push(c);
                i += 1;
            }
        }
    }
    Err(CommandError::new("missing \""))
}

fn bare_word(chars: &[char], start: usize) -> (String, usize) {
    let mut word = String::new();
    let mut i = start;
    while i < chars.len() && !is_separator(chars[i]) {
        if chars[i] == '\\' {
            if chars.get(i + 1) == Some(&'\n') {
                break;
            }
            i = backslash(chars, i, &mut word);
        } else {
            word.push(chars[i]);
            i += 1;
        }
    }
    (word, i)
}

/// Handles the escape starting at `chars[i]`, returns the index after it.
fn backslash(chars: &[char], i: usize, word: &mut String) -> usize {
    match chars.get(i + 1) {
        None => {
            word.push('\\');
            i + 1
        }
        Some('n') => {
            word.push('\n');
            i + 2
        }
        Some('t') => {
            word.push('\t');
            i + 2
        }
        Some('r') => {
            word.push('\r');
            i + 2
        }
        Some('\n') => {
            // Continuation line: the newline and leading blanks collapse into a single space.
            let mut j = i + 2;
            while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t') {
                j += 1;
            }
            word.push(' ');
            j
        }
        Some(&c) => {
            word.push(c);
            i + 2
        }
    }
}
