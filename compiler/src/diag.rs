// diag.rs — Error taxonomy and unified diagnostics model
//
// Every fallible operation in the compiler returns `CompileError`. Errors are
// never recovered from: the pipeline driver aborts the run and turns the error
// into a `Diagnostic` naming the operation and the pass that failed.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::template::TemplateError;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0401`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable codes, grouped by component.
pub mod codes {
    use super::DiagCode;

    // E01xx — type model
    pub const E0101: DiagCode = DiagCode("E0101"); // value outside type range
    pub const E0102: DiagCode = DiagCode("E0102"); // struct field set mismatch
    pub const E0103: DiagCode = DiagCode("E0103"); // struct layout conflict
    pub const E0104: DiagCode = DiagCode("E0104"); // unknown type id
    pub const E0105: DiagCode = DiagCode("E0105"); // malformed type descriptor

    // E02xx — compilation context
    pub const E0201: DiagCode = DiagCode("E0201"); // unknown buffer
    pub const E0202: DiagCode = DiagCode("E0202"); // duplicate buffer
    pub const E0203: DiagCode = DiagCode("E0203"); // global definition conflict
    pub const E0204: DiagCode = DiagCode("E0204"); // context (de)serialization
    pub const E0205: DiagCode = DiagCode("E0205"); // buffer name is not a C identifier

    // E03xx — templates
    pub const E0301: DiagCode = DiagCode("E0301");

    // E04xx — liveness
    pub const E0401: DiagCode = DiagCode("E0401"); // double allocation
    pub const E0402: DiagCode = DiagCode("E0402"); // double free
    pub const E0403: DiagCode = DiagCode("E0403"); // alias cycle

    // E05xx — tiling
    pub const E0501: DiagCode = DiagCode("E0501"); // ambiguous tiling metadata
    pub const E0502: DiagCode = DiagCode("E0502"); // tile count mismatch
    pub const E0503: DiagCode = DiagCode("E0503"); // tiling oracle failure
    pub const E0504: DiagCode = DiagCode("E0504"); // missing level constraint

    // E06xx — closures and futures
    pub const E0601: DiagCode = DiagCode("E0601"); // missing future state
}

// ── Compile error ────────────────────────────────────────────────────────

/// A fatal defect detected while lowering one operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("value {value} cannot be represented as {ty}")]
    TypeValidation { ty: String, value: String },

    #[error("struct {ty} expects fields {expected:?}, got {found:?}")]
    StructFieldMismatch {
        ty: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("struct type '{name}' redeclared with an incompatible layout")]
    StructLayoutConflict { name: String },

    #[error("unknown type id {0}")]
    UnknownType(u32),

    #[error("type {ty} is malformed: {reason}")]
    InvalidType { ty: String, reason: String },

    #[error("buffer '{name}' not found")]
    UnknownBuffer { name: String },

    #[error("buffer '{name}' already exists in {scope} scope")]
    DuplicateBuffer { name: String, scope: String },

    #[error("buffer name '{name}' is not a C identifier")]
    InvalidIdentifier { name: String },

    #[error("global definition '{name}' already exists with different code")]
    DefinitionConflict { name: String },

    #[error("context serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("buffer '{buffer}' allocated twice (in '{operation}')")]
    DoubleAllocation { buffer: String, operation: String },

    #[error("buffer '{buffer}' freed while not live (in '{operation}')")]
    DoubleFree { buffer: String, operation: String },

    #[error("circular alias dependency among {buffers:?}")]
    AliasCycle { buffers: Vec<String> },

    #[error("{count} fragments of '{operation}' carry tiling constraints, expected at most one")]
    AmbiguousTiling { operation: String, count: usize },

    #[error("'{name}' of '{operation}' has {found} tiles, schedule has {expected}")]
    TileCountMismatch {
        operation: String,
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("tiling of '{operation}' failed: {message}")]
    Solver { operation: String, message: String },

    #[error("buffer '{buffer}' has no constraint for memory level '{level}'")]
    MissingLevelConstraint { buffer: String, level: String },

    #[error("future '{buffer}' has no state reference")]
    MissingFutureState { buffer: String },
}

impl CompileError {
    /// The stable code for this error.
    pub fn code(&self) -> DiagCode {
        match self {
            CompileError::TypeValidation { .. } => codes::E0101,
            CompileError::StructFieldMismatch { .. } => codes::E0102,
            CompileError::StructLayoutConflict { .. } => codes::E0103,
            CompileError::UnknownType(_) => codes::E0104,
            CompileError::InvalidType { .. } => codes::E0105,
            CompileError::UnknownBuffer { .. } => codes::E0201,
            CompileError::DuplicateBuffer { .. } => codes::E0202,
            CompileError::DefinitionConflict { .. } => codes::E0203,
            CompileError::Serialization(_) => codes::E0204,
            CompileError::InvalidIdentifier { .. } => codes::E0205,
            CompileError::Template(_) => codes::E0301,
            CompileError::DoubleAllocation { .. } => codes::E0401,
            CompileError::DoubleFree { .. } => codes::E0402,
            CompileError::AliasCycle { .. } => codes::E0403,
            CompileError::AmbiguousTiling { .. } => codes::E0501,
            CompileError::TileCountMismatch { .. } => codes::E0502,
            CompileError::Solver { .. } => codes::E0503,
            CompileError::MissingLevelConstraint { .. } => codes::E0504,
            CompileError::MissingFutureState { .. } => codes::E0601,
        }
    }

    /// Remediation hint for errors that usually come from a malformed schedule.
    fn hint(&self) -> Option<&'static str> {
        match self {
            CompileError::DoubleAllocation { .. } | CompileError::DoubleFree { .. } => {
                Some("check the users list of the buffer against the operation order")
            }
            CompileError::AmbiguousTiling { .. } => {
                Some("attach the tile constraint to exactly one fragment")
            }
            CompileError::MissingFutureState { .. } => {
                Some("link the future to its state buffer before scheduling")
            }
            _ => None,
        }
    }
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by the pipeline driver.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub message: String,
    pub hint: Option<String>,
    /// Operation and pass the diagnostic was raised in, when known.
    pub origin: Option<(String, &'static str)>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, or origin.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            message: message.into(),
            hint: None,
            origin: None,
        }
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach the operation and pass the diagnostic originates from.
    pub fn with_origin(mut self, operation: impl Into<String>, pass: &'static str) -> Self {
        self.origin = Some((operation.into(), pass));
        self
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(err: &CompileError) -> Self {
        let diag = Diagnostic::new(DiagLevel::Error, err.to_string()).with_code(err.code());
        match err.hint() {
            Some(hint) => diag.with_hint(hint),
            None => diag,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: ", level, code)?;
        } else {
            write!(f, "{}: ", level)?;
        }
        if let Some((operation, pass)) = &self.origin {
            write!(f, "{} ({}): ", operation, pass)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code_and_origin() {
        let d = Diagnostic::new(DiagLevel::Warning, "unused buffer")
            .with_code(DiagCode("W0001"))
            .with_origin("conv_0", "memory_management");
        assert_eq!(
            format!("{d}"),
            "warning[W0001]: conv_0 (memory_management): unused buffer"
        );
    }

    #[test]
    fn liveness_errors_carry_hint() {
        let err = CompileError::DoubleFree {
            buffer: "t0".into(),
            operation: "add_1".into(),
        };
        let d = Diagnostic::from(&err);
        assert_eq!(d.code, Some(codes::E0402));
        assert!(d.hint.is_some());
        assert!(d.message.contains("t0"));
        assert!(d.message.contains("add_1"));
    }

    #[test]
    fn alias_cycle_lists_buffers() {
        let err = CompileError::AliasCycle {
            buffers: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "circular alias dependency among [\"a\", \"b\"]");
        assert!(Diagnostic::from(&err).hint.is_none());
    }
}
