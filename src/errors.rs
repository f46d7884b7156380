// File: src/errors.rs
//
// Error types and diagnostic formatting for Canidae.
// Compile errors halt the batch with exit 65; runtime errors (including
// uncaught exceptions) terminate with exit 70. The exact textual shapes
// here are part of the language's compatibility contract, so they are
// produced in one place and tested.

use crate::value::Value;
use std::fmt;

/// Process exit code for syntax / compile-time errors.
pub const EXIT_COMPILE_ERROR: i32 = 65;
/// Process exit code for runtime errors and uncaught exceptions.
pub const EXIT_RUNTIME_ERROR: i32 = 70;

/// Built-in exception categories attached to runtime errors.
///
/// Each maps to one of the `ExceptionType` globals, so `catch (TypeError)`
/// can intercept VM-generated failures exactly like user raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    TypeError,
    NameError,
    IndexError,
    ValueError,
    ImportError,
}

impl ErrorKind {
    pub fn type_name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::NameError => "NameError",
            ErrorKind::IndexError => "IndexError",
            ErrorKind::ValueError => "ValueError",
            ErrorKind::ImportError => "ImportError",
        }
    }
}

/// Where a compile error points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAt {
    /// A concrete token; the lexeme is quoted in the message.
    Token(String),
    /// End of input.
    End,
    /// No token context (scanner errors such as an unterminated string).
    Bare,
}

/// A single compile-time diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: usize,
    pub at: ErrorAt,
    pub message: String,
}

impl CompileError {
    pub fn new(line: usize, at: ErrorAt, message: impl Into<String>) -> Self {
        Self { line, at, message: message.into() }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.at {
            ErrorAt::Token(lexeme) => {
                write!(f, "[line {}] Error at '{}': {}", self.line, lexeme, self.message)
            }
            ErrorAt::End => write!(f, "[line {}] Error at end: {}", self.line, self.message),
            ErrorAt::Bare => write!(f, "[line {}] Error: {}", self.line, self.message),
        }
    }
}

/// A runtime failure travelling through the VM.
///
/// `raised` records whether the failure went through the raise machinery
/// (user `raise`, comparison type errors, assignment to an undeclared
/// variable); it selects the uncaught report format but has no effect on
/// `try`/`catch`, which intercepts both classes uniformly.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub raised: bool,
    /// The exception value for explicit raises; preserves identity and
    /// attributes across the unwind.
    pub value: Option<Value>,
}

impl RuntimeError {
    /// A VM-level error: plain report format when uncaught.
    pub fn plain(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), raised: false, value: None }
    }

    /// A VM-generated error routed through the raise machinery.
    pub fn raised(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), raised: true, value: None }
    }

    /// An explicit `raise` carrying the exception value itself.
    pub fn from_value(value: Value, kind: ErrorKind, message: String) -> Self {
        Self { kind, message, raised: true, value: Some(value) }
    }
}

/// One line of a stack trace: source line plus frame descriptor.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: usize,
    pub descriptor: String,
}

/// A runtime error that escaped every handler, with its captured trace.
///
/// Two report shapes exist:
///
/// ```text
/// <message>                      <message or exception repr>
/// [line 2] in script             Raised at:
///                                \t[line 2] in script
/// ```
///
/// The left form is used for plain VM errors, the right for raised
/// exceptions.
#[derive(Debug, Clone)]
pub struct RuntimeReport {
    pub first_line: String,
    pub raised: bool,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.first_line)?;
        if self.raised {
            writeln!(f, "Raised at:")?;
            for frame in &self.trace {
                writeln!(f, "\t[line {}] in {}", frame.line, frame.descriptor)?;
            }
        } else {
            for frame in &self.trace {
                writeln!(f, "[line {}] in {}", frame.line, frame.descriptor)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn compile_error_formats() {
        let at_token = CompileError::new(1, ErrorAt::Token(";".to_string()), "Expect expression.");
        assert_eq!(at_token.to_string(), "[line 1] Error at ';': Expect expression.");

        let bare = CompileError::new(3, ErrorAt::Bare, "Unterminated string.");
        assert_eq!(bare.to_string(), "[line 3] Error: Unterminated string.");

        let at_end = CompileError::new(7, ErrorAt::End, "Expect ';' after value.");
        assert_eq!(at_end.to_string(), "[line 7] Error at end: Expect ';' after value.");
    }

    #[test]
    fn plain_report_has_untabbed_trace() {
        let report = RuntimeReport {
            first_line: "Array index 3 exceeds max index of array (2).".to_string(),
            raised: false,
            trace: vec![TraceFrame { line: 2, descriptor: "script".to_string() }],
        };
        assert_eq!(
            report.to_string(),
            "Array index 3 exceeds max index of array (2).\n[line 2] in script\n"
        );
    }

    #[test]
    fn raised_report_has_raised_at_header() {
        let report = RuntimeReport {
            first_line: "<exception Error: boom>".to_string(),
            raised: true,
            trace: vec![
                TraceFrame { line: 2, descriptor: "blow_up()".to_string() },
                TraceFrame { line: 5, descriptor: "script".to_string() },
            ],
        };
        assert_eq!(
            report.to_string(),
            "<exception Error: boom>\nRaised at:\n\t[line 2] in blow_up()\n\t[line 5] in script\n"
        );
    }
}
