//! Engine Error Types
//!
//! One crate-wide taxonomy; every operation either succeeds with a typed
//! result or fails with a typed error. Per-cell failures inside plan
//! evaluation do not use this type directly: they travel through streams as
//! `CellValue::Error(CellError)` so an area read can still emit well-formed
//! cells for the rest of the area.

use std::io;
use thiserror::Error;

use crate::ident::{CubeId, IdentifierType, RuleId};

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------
    /// Invalid element, dimension or cube name
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Malformed cell path (wrong arity or unknown coordinate)
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Position outside the dense 0..n-1 range
    #[error("invalid position {position} (dimension has {size} elements)")]
    InvalidPosition { position: u32, size: u32 },

    /// Identifier does not name a live object
    #[error("unknown id: {0}")]
    UnknownId(IdentifierType),

    /// Unknown dimension
    #[error("unknown dimension: {0}")]
    UnknownDimension(String),

    /// Unknown cube
    #[error("unknown cube: {0}")]
    UnknownCube(String),

    /// Value kind does not match the cell kind
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------
    /// Name already taken within the dimension or database
    #[error("name in use: {0}")]
    NameInUse(String),

    /// Insertion would create a cycle in the element hierarchy
    #[error("circular reference in element hierarchy under '{0}'")]
    CircularReference(String),

    /// Structural change attempted while a cube lock references the dimension
    #[error("dimension '{0}' is used in a locked cube")]
    DimensionLocked(String),

    /// Element lookup by name failed
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// Requested lock area overlaps an existing lock
    #[error("lock conflict on cube {0}")]
    LockConflict(CubeId),

    /// Rule id does not exist on the cube
    #[error("no such rule: {0}")]
    NoSuchRule(RuleId),

    // ------------------------------------------------------------------
    // Policy
    // ------------------------------------------------------------------
    /// Caller lacks the required right
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Engine is running in read-only mode
    #[error("engine is read-only")]
    ReadOnly,

    /// Splash refused by policy
    #[error("splash rejected: {0}")]
    SplashRejected(String),

    /// Operation would touch more cells than the configured limit
    #[error("cell limit exceeded: {touched} > {limit}")]
    CellLimit { touched: usize, limit: usize },

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------
    /// Rule references itself through other rule cells
    #[error("circular rule reference")]
    RuleCircular,

    /// Division by zero outside stream context
    #[error("division by zero")]
    DivisionByZero,

    /// Wrong number of arguments for a rule function
    #[error("function '{name}' expects {expected} arguments, got {got}")]
    FunctionArity {
        name: String,
        expected: usize,
        got: usize,
    },

    /// Value cannot be converted to the requested kind
    #[error("unsupported conversion: {0}")]
    UnsupportedConversion(String),

    /// Rule text failed to parse
    #[error("rule parse error: {0}")]
    ParseError(String),

    // ------------------------------------------------------------------
    // Resource
    // ------------------------------------------------------------------
    /// Memory budget exhausted (rollback spill, cache admission)
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Persistent file failed integrity or format checks
    #[error("corrupt file: {0}")]
    FileCorrupt(String),

    /// File could not be opened
    #[error("cannot open file: {0}")]
    FileOpen(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------
    /// Request observed the cooperative stop flag
    #[error("cancelled")]
    Cancelled,

    /// Operation exceeded its deadline
    #[error("timeout")]
    Timeout,

    /// Engine is shutting down
    #[error("shutdown in progress")]
    Shutdown,

    /// Capability not built into this engine (e.g. the GPU bin-path backend)
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Per-cell error marker carried inside streams.
///
/// Deliberately small and `Copy`: a partially erroneous area query stores one
/// of these per failing cell while the rest of the area evaluates normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CellError {
    /// Division by zero during rule evaluation
    DivisionByZero,
    /// Rule recursion detected for this cell
    RuleCircular,
    /// Value conversion failed (e.g. string in numeric context)
    UnsupportedConversion,
    /// Internal evaluation failure
    Internal,
}

impl CellError {
    /// Stable wire code, matching the order above.
    pub fn code(self) -> u32 {
        match self {
            CellError::DivisionByZero => 1,
            CellError::RuleCircular => 2,
            CellError::UnsupportedConversion => 3,
            CellError::Internal => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(CellError::DivisionByZero),
            2 => Some(CellError::RuleCircular),
            3 => Some(CellError::UnsupportedConversion),
            4 => Some(CellError::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for CellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellError::DivisionByZero => write!(f, "division by zero"),
            CellError::RuleCircular => write!(f, "circular rule reference"),
            CellError::UnsupportedConversion => write!(f, "unsupported conversion"),
            CellError::Internal => write!(f, "internal evaluation error"),
        }
    }
}
