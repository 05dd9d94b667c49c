//! Library half of the `mdnet` CLI: argument parsing and crop preparation

pub mod crop;
pub mod parser;
