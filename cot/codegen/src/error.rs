//! Error types and the diagnostics sink shared across the pipeline.

use crate::srcloc::SourceLoc;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The kinds of failure the compiler core can report.
///
/// `Source` diagnostics accumulate and are reported at the end of the current
/// compilation unit; everything else aborts the pipeline on first occurrence.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// A defect in the program being compiled. Most of these are caught by
    /// the checker; the lowerer re-reports only what slips through.
    #[error("{loc}: {message}")]
    Source {
        /// Where in the source the defect was found.
        loc: SourceLoc,
        /// Human-readable description.
        message: String,
    },

    /// An internal consistency check failed. This is a compiler bug.
    #[error("internal invariant violated in {phase} of `{func}`: {message}")]
    InternalInvariant {
        /// The pipeline phase that detected the violation.
        phase: &'static str,
        /// The function being compiled.
        func: String,
        /// What went wrong.
        message: String,
    },

    /// The register allocator ran out of registers and spill candidates.
    /// The scheduler is supposed to bound pressure, so this is a compiler bug.
    #[error("register allocation exhausted in `{func}`: {message}")]
    CapacityExhausted {
        /// The function being compiled.
        func: String,
        /// What the allocator was trying to do.
        message: String,
    },

    /// An AST form the lowerer is not built to handle.
    #[error("{loc}: unsupported construct: {message}")]
    Unsupported {
        /// Where in the source the construct appears.
        loc: SourceLoc,
        /// Which construct.
        message: String,
    },

    /// Writing the object file failed.
    #[error("object write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A compiler result.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// Severity of an accumulated diagnostic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    /// A hard error; the pipeline stops before codegen.
    Error,
    /// Advisory only.
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Error => f.write_str("error"),
            Self::Warning => f.write_str("warning"),
        }
    }
}

/// One accumulated diagnostic.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    /// Error or warning.
    pub severity: Severity,
    /// Source position the diagnostic refers to.
    pub loc: SourceLoc,
    /// Rendered message.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}: {}", self.loc, self.severity, self.message)
    }
}

/// Process-wide diagnostics sink.
///
/// Source errors accumulate here while the frontend runs; the driver checks
/// `has_errors` before letting the pipeline proceed to codegen. Cheap to
/// clone; all clones share the same buffer.
#[derive(Clone, Default)]
pub struct Diagnostics {
    entries: Rc<RefCell<Vec<Diagnostic>>>,
}

impl Diagnostics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error at `loc`.
    pub fn error(&self, loc: SourceLoc, message: impl Into<String>) {
        self.report(Severity::Error, loc, message);
    }

    /// Record a warning at `loc`.
    pub fn warning(&self, loc: SourceLoc, message: impl Into<String>) {
        self.report(Severity::Warning, loc, message);
    }

    /// Record a diagnostic.
    pub fn report(&self, severity: Severity, loc: SourceLoc, message: impl Into<String>) {
        let d = Diagnostic {
            severity,
            loc,
            message: message.into(),
        };
        log::debug!("diagnostic: {d}");
        self.entries.borrow_mut().push(d);
    }

    /// Has at least one hard error been recorded?
    pub fn has_errors(&self) -> bool {
        self.entries
            .borrow()
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Total number of recorded diagnostics.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Take all recorded diagnostics, leaving the sink empty.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.entries.borrow_mut())
    }
}
