//! Tokenizer for module headers
//!
//! Works one character at a time so it can sit directly on top of a byte
//! stream. Only the handful of token kinds the header parser cares about are
//! produced; everything else collapses into `Word`.

// ============================================================================
// TOKEN TYPES
// ============================================================================

/// Tokens produced while scanning a module header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Any run of characters that is not whitespace, punctuation or a comment
    Word(String),
    LParen, // (
    RParen, // )
    Comma,  // ,
    Equals, // =
    DotDot, // ..
}

// ============================================================================
// TOKENIZER STATE
// ----------------------------------------------------------------------------
// [Initial] --'{'--> [MaybeBlockCommentOpen] --'-'--> [BlockComment(1)]
//     |                                                   | '{-' level+1
//     |                                                   | '-}' level-1 (0 → Initial)
//     +--'-'--> [MaybeLineCommentOpen] --'-'--> [LineComment] --'\n'--> [Initial]
//     +--'.'--> [MaybeRangeDots] --'.'--> emit DotDot
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    MaybeBlockCommentOpen,
    BlockComment { level: usize, previous: Option<char> },
    MaybeLineCommentOpen,
    LineComment,
    MaybeRangeDots,
}

/// Incremental tokenizer.
///
/// Feed characters with [`Tokenizer::push`]; completed tokens are appended to
/// the caller's buffer. Call [`Tokenizer::finish`] at end of input to flush a
/// pending word.
#[derive(Debug)]
pub struct Tokenizer {
    state: State,
    word: String,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            state: State::Initial,
            word: String::new(),
        }
    }

    /// Consume one character.
    pub fn push(&mut self, c: char, out: &mut Vec<Token>) {
        match self.state {
            State::Initial => self.initial(c, out),

            State::MaybeBlockCommentOpen => {
                if c == '-' {
                    self.state = State::BlockComment {
                        level: 1,
                        previous: None,
                    };
                } else {
                    self.resume_with('{', c, out);
                }
            }

            State::BlockComment { level, previous } => {
                self.state = match (previous, c) {
                    (Some('{'), '-') => State::BlockComment {
                        level: level + 1,
                        previous: None,
                    },
                    (Some('-'), '}') if level <= 1 => State::Initial,
                    (Some('-'), '}') => State::BlockComment {
                        level: level - 1,
                        previous: None,
                    },
                    _ => State::BlockComment {
                        level,
                        previous: Some(c),
                    },
                };
            }

            State::MaybeLineCommentOpen => {
                if c == '-' {
                    self.state = State::LineComment;
                } else {
                    self.resume_with('-', c, out);
                }
            }

            State::LineComment => {
                if c == '\n' {
                    self.state = State::Initial;
                }
            }

            State::MaybeRangeDots => {
                if c == '.' {
                    self.flush(out);
                    out.push(Token::DotDot);
                    self.state = State::Initial;
                } else {
                    // A lone dot is part of a qualified name like `Http.Helpers`.
                    self.resume_with('.', c, out);
                }
            }
        }
    }

    /// Flush whatever is pending at end of input.
    pub fn finish(&mut self, out: &mut Vec<Token>) {
        match self.state {
            State::MaybeBlockCommentOpen => self.word.push('{'),
            State::MaybeLineCommentOpen => self.word.push('-'),
            State::MaybeRangeDots => self.word.push('.'),
            State::Initial | State::BlockComment { .. } | State::LineComment => {}
        }
        self.state = State::Initial;
        self.flush(out);
    }

    fn initial(&mut self, c: char, out: &mut Vec<Token>) {
        match c {
            '(' => self.punctuation(Token::LParen, out),
            ')' => self.punctuation(Token::RParen, out),
            ',' => self.punctuation(Token::Comma, out),
            '=' => self.punctuation(Token::Equals, out),
            '{' => {
                self.flush(out);
                self.state = State::MaybeBlockCommentOpen;
            }
            '-' => {
                self.flush(out);
                self.state = State::MaybeLineCommentOpen;
            }
            '.' => self.state = State::MaybeRangeDots,
            _ if c.is_whitespace() => self.flush(out),
            _ => self.word.push(c),
        }
    }

    /// Leave a "maybe" state: the held character was ordinary text after all.
    fn resume_with(&mut self, held: char, c: char, out: &mut Vec<Token>) {
        self.state = State::Initial;
        self.word.push(held);
        self.initial(c, out);
    }

    fn punctuation(&mut self, token: Token, out: &mut Vec<Token>) {
        self.flush(out);
        out.push(token);
    }

    fn flush(&mut self, out: &mut Vec<Token>) {
        if !self.word.is_empty() {
            out.push(Token::Word(std::mem::take(&mut self.word)));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(source: &str) -> Vec<Token> {
        let mut tokenizer = Tokenizer::new();
        let mut out = Vec::new();
        for c in source.chars() {
            tokenizer.push(c, &mut out);
        }
        tokenizer.finish(&mut out);
        out
    }

    fn word(s: &str) -> Token {
        Token::Word(s.to_string())
    }

    #[test]
    fn test_words_and_punctuation() {
        let tokens = tokenize("module Main exposing (one, two)");
        assert_eq!(
            tokens,
            vec![
                word("module"),
                word("Main"),
                word("exposing"),
                Token::LParen,
                word("one"),
                Token::Comma,
                word("two"),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn test_qualified_name_stays_one_word() {
        assert_eq!(tokenize("Http.Helpers"), vec![word("Http.Helpers")]);
    }

    #[test]
    fn test_range_dots() {
        assert_eq!(
            tokenize("Type(..)"),
            vec![word("Type"), Token::LParen, Token::DotDot, Token::RParen]
        );
    }

    #[test]
    fn test_nested_block_comments() {
        let tokens = tokenize("a{- {- {- x -} -} -}b");
        assert_eq!(tokens, vec![word("a"), word("b")]);
    }

    #[test]
    fn test_empty_block_comment() {
        assert_eq!(tokenize("a{--}b"), vec![word("a"), word("b")]);
    }

    #[test]
    fn test_brace_dash_brace_does_not_close() {
        // `{-}` opens a comment; the `}` right after the opener does not close it.
        assert_eq!(tokenize("a{-}b-}c"), vec![word("a"), word("c")]);
    }

    #[test]
    fn test_line_comment() {
        assert_eq!(tokenize("a -- b c\nd"), vec![word("a"), word("d")]);
    }

    #[test]
    fn test_lone_dash_and_brace_are_text() {
        assert_eq!(tokenize("a - b"), vec![word("a"), word("-"), word("b")]);
        assert_eq!(tokenize("{ x"), vec![word("{"), word("x")]);
    }

    #[test]
    fn test_pending_state_flushed_at_end() {
        assert_eq!(tokenize("a."), vec![word("a.")]);
        assert_eq!(tokenize("a -"), vec![word("a"), word("-")]);
    }

    #[test]
    fn test_crlf_is_whitespace() {
        assert_eq!(tokenize("a\r\nb"), vec![word("a"), word("b")]);
    }
}
