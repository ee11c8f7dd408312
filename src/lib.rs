/// Cool Compiler Library
///
/// Module layout:
///   - lexer / parser / ast — front-end (tokens, recursive descent,
///     owned AST with interned types)
///   - errors   — phase error types and the driver wrapper
///   - semant   — class hierarchy, type inference, GC stack budgeting
///   - klass    — per-class layout metadata (tags, fields, dispatch)
///   - data     — data-segment builder (tables, prototypes, constants)
///   - ir       — SSA IR: operands, instructions, CFG/dominance, SSA
///     construction, scalar optimisations
///   - codegen  — the emitter contract and runtime helper symbols
///   - runtime  — object model, allocators, markers, collectors,
///     stack walkers, runtime helper ABI

// ── Front-end ────────────────────────────────────────────────────────────────
pub mod ast;
pub mod errors;
pub mod lexer;
pub mod parser;
pub mod semant;

// ── Middle-end / back-end ────────────────────────────────────────────────────
pub mod codegen;
pub mod data;
pub mod ir;
pub mod klass;

// ── Runtime ──────────────────────────────────────────────────────────────────
pub mod runtime;

// ── Re-exports for convenience ───────────────────────────────────────────────
pub use ast::{Program, TypeTable};
pub use errors::CompileError;
pub use klass::KlassBuilder;
pub use lexer::Lexer;
pub use parser::Parser;
pub use semant::{Analysis, Semant};

use errors::NO_LINE;

/// Front half of the pipeline: lex and parse one source file.
pub fn parse_source(
    file: &str,
    source: &str,
    types: &mut TypeTable,
) -> Result<Program, CompileError> {
    let tokens = Lexer::new(source).tokenize().map_err(|e| CompileError::Lexer {
        file: file.to_string(),
        line: e.line(),
        error: e,
    })?;

    Parser::new(tokens, file, types).parse().map_err(|e| CompileError::Parser {
        file: file.to_string(),
        line: e.line,
        error: e,
    })
}

/// Parse every source file and run semantic analysis over the merged
/// program.
pub fn check_sources(sources: &[(String, String)]) -> Result<Analysis, CompileError> {
    let mut types = TypeTable::new();

    let mut programs = Vec::with_capacity(sources.len().max(1));
    for (file, source) in sources {
        programs.push(parse_source(file, source, &mut types)?);
    }
    if programs.is_empty() {
        return Err(CompileError::Semant(errors::SemantError {
            file: String::new(),
            line: NO_LINE,
            message: "Class Main is not defined.".to_string(),
        }));
    }

    Semant::new(types).analyze(programs).map_err(CompileError::Semant)
}
