use std::fmt;

/// Error codes for compiler diagnostics.
///
/// Format: E#### where the first digit is the phase:
/// - E5xxx: Ownership and effect checking
/// - E9xxx: Internal compiler errors
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub enum ErrorCode {
    // Ownership and Effect Errors (E5xxx)
    /// Conflicting borrow request
    E5001,
    /// Illegal projection or mutation for a reference's capability
    E5002,
    /// Effect used without a handler or declared capability
    E5003,
    /// Continuation resumed more often than its contract allows
    E5004,
    /// Multi-shot continuation moves a captured binding
    E5005,
    /// Recursive continuation cannot be bounded
    E5006,
    /// Use of a moved binding
    E5007,
    /// Reference outlives the storage it points into
    E5008,
    /// Concurrent continuation captures a non-sendable binding
    E5009,
    /// `resume` outside a handler clause
    E5010,
    /// Mutation through an immutable binding or reference
    E5011,

    // Internal Errors (E9xxx)
    /// Internal compiler error (malformed input)
    E9001,
    /// Too many errors
    E9002,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::E5001 => "E5001",
            ErrorCode::E5002 => "E5002",
            ErrorCode::E5003 => "E5003",
            ErrorCode::E5004 => "E5004",
            ErrorCode::E5005 => "E5005",
            ErrorCode::E5006 => "E5006",
            ErrorCode::E5007 => "E5007",
            ErrorCode::E5008 => "E5008",
            ErrorCode::E5009 => "E5009",
            ErrorCode::E5010 => "E5010",
            ErrorCode::E5011 => "E5011",
            ErrorCode::E9001 => "E9001",
            ErrorCode::E9002 => "E9002",
        }
    }

    /// Check if this is an internal compiler error.
    pub fn is_internal(&self) -> bool {
        matches!(self, ErrorCode::E9001 | ErrorCode::E9002)
    }

    /// Fatal errors abort code generation for the whole unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCode::E5006 | ErrorCode::E9001)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
