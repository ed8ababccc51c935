//! The cot language frontend: lexing, parsing, checking, and lowering to
//! the named-local IR consumed by `cot-codegen`.

pub mod ast;
pub mod checker;
pub mod lexer;
pub mod lower;
pub mod parser;

use cot_codegen::Diagnostics;
use cot_codegen::error::CodegenResult;
use cot_codegen::ir;

pub use crate::checker::CheckedModule;

/// Run the whole frontend over one source buffer.
///
/// Returns the checked module and its lowered IR functions. Source errors
/// accumulate in `diag`; callers must consult `diag.has_errors()` before
/// letting the pipeline continue into codegen.
pub fn compile_source(src: &str, diag: &Diagnostics) -> CodegenResult<(CheckedModule, Vec<ir::Function>)> {
    let module = parser::parse(src, diag);
    let checked = checker::check(module, diag);
    if diag.has_errors() {
        // Lowering assumes a clean type cache.
        return Ok((checked, Vec::new()));
    }
    let funcs = lower::lower(&checked, diag)?;
    Ok((checked, funcs))
}
