/// Coolc error types
/// Supports lexer, parser, semantic, and runtime errors. The message
/// text of semantic errors is a compatibility contract: the driver
/// prints exactly `"<file>", line <N>: <message>` and exits non-zero.

use std::fmt;

// ---------------------------------------------------------------------------
// Source location
// ---------------------------------------------------------------------------

/// One-based source line. Line 0 means "no line" (whole-program errors
/// such as a missing Main are printed without a location prefix).
pub type Line = u32;

pub const NO_LINE: Line = 0;

// ---------------------------------------------------------------------------
// Lexer errors
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq)]
pub enum LexerError {
    UnterminatedComment { line: Line },
    UnterminatedString { line: Line },
    StringContainsNull { line: Line },
    StringTooLong { line: Line },
    UnexpectedCharacter { ch: char, line: Line },
}

impl LexerError {
    pub fn line(&self) -> Line {
        match self {
            LexerError::UnterminatedComment { line }
            | LexerError::UnterminatedString { line }
            | LexerError::StringContainsNull { line }
            | LexerError::StringTooLong { line }
            | LexerError::UnexpectedCharacter { line, .. } => *line,
        }
    }
}

impl fmt::Display for LexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexerError::UnterminatedComment { .. } => write!(f, "EOF in comment"),
            LexerError::UnterminatedString { .. } => write!(f, "Unterminated string constant"),
            LexerError::StringContainsNull { .. } => write!(f, "String contains null character."),
            LexerError::StringTooLong { .. } => write!(f, "String constant too long"),
            LexerError::UnexpectedCharacter { ch, .. } => write!(f, "'{}'", ch),
        }
    }
}

// ---------------------------------------------------------------------------
// Parser errors
// ---------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct ParserError {
    pub found: String,
    pub line: Line,
}

impl fmt::Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error at or near {}", self.found)
    }
}

impl std::error::Error for ParserError {}

// ---------------------------------------------------------------------------
// Semantic errors
// ---------------------------------------------------------------------------

/// A fully formatted semantic diagnostic. `message` may span several
/// lines for inheritance cycles; every other error is a single line.
#[derive(Debug, Clone)]
pub struct SemantError {
    pub file: String,
    pub line: Line,
    pub message: String,
}

impl fmt::Display for SemantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line != NO_LINE {
            write!(f, "\"{}\", line {}: {}", self.file, self.line, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for SemantError {}

// ---------------------------------------------------------------------------
// CompileError — top-level wrapper for the driver
// ---------------------------------------------------------------------------
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("\"{file}\", line {line}: {error}")]
    Lexer {
        file: String,
        line: Line,
        error: LexerError,
    },
    #[error("\"{file}\", line {line}: {error}")]
    Parser {
        file: String,
        line: Line,
        error: ParserError,
    },
    #[error("{0}")]
    Semant(#[from] SemantError),
    #[error("Cannot read '{file}': {reason}")]
    Io { file: String, reason: String },
}
