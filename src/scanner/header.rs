//! Module header parser
//!
//! Consumes the token stream from [`super::tokens::Tokenizer`] and extracts the
//! exposing list. States only move forward; nothing is ever backtracked.

use super::tokens::Token;
use super::{ExposedNames, ScanError, is_module_name};

/// The kind of module declared by the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Plain,
    Port,
    Effect,
}

/// Outcome of feeding one token to the parser.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Done(ExposedNames),
}

#[derive(Debug)]
enum State {
    /// `prefix` is the kind announced by the word right before `module`, if any.
    AwaitingModuleKeyword { prefix: Option<ModuleKind> },
    AwaitingExposingKeyword { name_seen: bool },
    AwaitingOpenParen,
    CollectingExposedNames {
        depth: usize,
        entries: Vec<String>,
        current: String,
    },
}

#[derive(Debug)]
pub struct HeaderParser {
    state: State,
    kind: Option<ModuleKind>,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderParser {
    pub fn new() -> Self {
        Self {
            state: State::AwaitingModuleKeyword { prefix: None },
            kind: None,
        }
    }

    /// The module kind, once the `module` keyword has been seen.
    pub fn module_kind(&self) -> Option<ModuleKind> {
        self.kind
    }

    pub fn feed(&mut self, token: Token) -> Result<Step, ScanError> {
        match &mut self.state {
            State::AwaitingModuleKeyword { prefix } => match &token {
                Token::Word(w) if w == "module" => {
                    let kind = prefix.unwrap_or(ModuleKind::Plain);
                    if kind == ModuleKind::Effect {
                        return Err(ScanError::EffectModule);
                    }
                    self.kind = Some(kind);
                    self.state = State::AwaitingExposingKeyword { name_seen: false };
                }
                Token::Word(w) if w == "port" => *prefix = Some(ModuleKind::Port),
                Token::Word(w) if w == "effect" => *prefix = Some(ModuleKind::Effect),
                // Imports before any module declaration: leave it to the compiler.
                Token::Word(w) if w == "import" => return Ok(Step::Done(ExposedNames::none())),
                _ => *prefix = None,
            },

            // Exactly one module name, then `exposing`. Anything else means the
            // header is malformed (e.g. `module Main` followed by imports).
            State::AwaitingExposingKeyword { name_seen } => match &token {
                Token::Word(w) if !*name_seen && is_module_name(w) => *name_seen = true,
                Token::Word(w) if *name_seen && w == "exposing" => self.state = State::AwaitingOpenParen,
                _ => return Ok(Step::Done(ExposedNames::none())),
            },

            State::AwaitingOpenParen => {
                if token == Token::LParen {
                    self.state = State::CollectingExposedNames {
                        depth: 1,
                        entries: Vec::new(),
                        current: String::new(),
                    };
                }
            }

            State::CollectingExposedNames {
                depth,
                entries,
                current,
            } => match token {
                Token::Word(w) => {
                    if *depth == 1 && !current.is_empty() {
                        current.push(' ');
                    }
                    current.push_str(&w);
                }
                Token::DotDot => current.push_str(".."),
                Token::Equals => current.push('='),
                Token::Comma if *depth == 1 => entries.push(std::mem::take(current)),
                Token::Comma => current.push(','),
                Token::LParen => {
                    *depth += 1;
                    current.push('(');
                }
                Token::RParen => {
                    *depth -= 1;
                    if *depth == 0 {
                        entries.push(std::mem::take(current));
                        return Ok(Step::Done(ExposedNames::from_entries(std::mem::take(entries))));
                    }
                    current.push(')');
                }
            },
        }
        Ok(Step::Continue)
    }

    /// End of input before the exposing list closed.
    ///
    /// Malformed headers are not an error: whatever was collected is returned
    /// and the compiler gets to report the real problem.
    pub fn finish(self) -> ExposedNames {
        match self.state {
            State::CollectingExposedNames {
                mut entries, current, ..
            } => {
                entries.push(current);
                ExposedNames::from_entries(entries)
            }
            _ => ExposedNames::none(),
        }
    }
}
