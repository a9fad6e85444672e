// Flint: a small statically typed imperative language with a bytecode
// compiler and a stack virtual machine.
//
// The pipeline: source text is tokenized (lexer), parsed into an AST
// (parser), simplified (optimizer), name- and type-checked into a typed
// program (analyzer), lowered to a fixed-width bytecode module (lowerer),
// and executed by a switch-dispatched interpreter (vm) over a
// reference-counted heap (memory).

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod util;

pub mod analyzer;
pub mod ast;
pub mod bytecode;
pub mod config;
pub mod jit;
pub mod lexer;
pub mod lowerer;
pub mod memory;
pub mod optimizer;
pub mod parser;
pub mod token;
pub mod value;
pub mod vm;

use thiserror::Error;

// Any static error on the way from source text to a bytecode module.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] lexer::LexError),
    #[error(transparent)]
    Parse(#[from] parser::ParseError),
    #[error(transparent)]
    Semantic(#[from] analyzer::SemanticError),
    #[error(transparent)]
    Lower(#[from] lowerer::LowerError),
}

/// Compile source text into an executable bytecode module.
pub fn compile(source: &str) -> Result<bytecode::Module, CompileError> {
    let tokens = lexer::Lexer::new(source).tokenize()?;
    let program = parser::Parser::new(tokens).parse()?;
    let program = optimizer::optimize(program);
    let typed = analyzer::analyze(&program)?;
    Ok(lowerer::lower(&typed)?)
}
