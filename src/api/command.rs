//! Parsing of the `process_audio` command line.
//!
//! ```text
//! <uuid> <start|stop> [<path-to-executable> <arg>...]
//! ```
//!
//! Tokens are separated by whitespace.  Single or double quotes group a
//! token that contains spaces (`'my filter'`); quotes themselves are removed.

use std::path::PathBuf;

use thiserror::Error;

use crate::dsp::DspProcessConfig;

/// Usage line printed after every malformed command.
pub const API_SYNTAX: &str = "<uuid> [start|stop] full_path_to_app";

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

/// Malformed command.  Every variant is answered with the usage line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Empty command!")]
    Empty,

    #[error("Too few arguments for a command!")]
    TooFewArguments,

    #[error("Too few arguments for a command, dsp app missing!")]
    MissingExecutable,

    #[error("Unknown action [{0}]!")]
    UnknownAction(String),

    #[error("Unterminated quote in command!")]
    UnterminatedQuote,
}

// ---------------------------------------------------------------------------
// ApiCommand
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start with the given process, or with the configured default when
    /// `None`.
    Start(Option<DspProcessConfig>),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCommand {
    pub session_id: String,
    pub action: Action,
}

impl ApiCommand {
    /// Parse one command line.
    ///
    /// ```
    /// use external_dsp::api::{Action, ApiCommand};
    ///
    /// let cmd = ApiCommand::parse("abc-123 START /usr/bin/sox -t raw -").unwrap();
    /// assert_eq!(cmd.session_id, "abc-123");
    /// match cmd.action {
    ///     Action::Start(Some(dsp)) => assert_eq!(dsp.arguments, vec!["-t", "raw", "-"]),
    ///     other => panic!("unexpected {other:?}"),
    /// }
    /// ```
    pub fn parse(line: &str) -> Result<Self, ApiError> {
        let tokens = split_args(line)?;

        let mut tokens = tokens.into_iter();
        let session_id = tokens.next().ok_or(ApiError::Empty)?;
        let action = tokens.next().ok_or(ApiError::TooFewArguments)?;

        let action = if action.eq_ignore_ascii_case("stop") {
            Action::Stop
        } else if action.eq_ignore_ascii_case("start") {
            match tokens.next() {
                Some(exe) => Action::Start(Some(DspProcessConfig::new(
                    PathBuf::from(exe),
                    tokens.collect(),
                ))),
                None => Action::Start(None),
            }
        } else {
            return Err(ApiError::UnknownAction(action));
        };

        Ok(Self { session_id, action })
    }
}

/// Split `line` into whitespace-separated tokens, honouring quotes.
pub fn split_args(line: &str) -> Result<Vec<String>, ApiError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err(ApiError::UnterminatedQuote);
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
