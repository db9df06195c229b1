// Rule script language: syntax tree, parser, value helpers and interpreter.

pub mod ast;
pub(crate) mod interpreter;
pub mod parser;
pub mod value;

pub use parser::parse_program;
