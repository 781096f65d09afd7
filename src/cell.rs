//! Cell Values
//!
//! The value of a single cube cell. Numeric cells are IEEE doubles; string
//! cells are interned by the string storage; the `Error` variant lets a
//! partially erroneous area query keep streaming well-formed cells.

use serde::{Deserialize, Serialize};

use crate::error::CellError;

/// Value of a single cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    /// No stored value; treated as 0.0 in numeric context
    Empty,
    /// Numeric cell
    Numeric(f64),
    /// String cell
    Str(String),
    /// Per-cell evaluation error
    Error(CellError),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, CellValue::Numeric(_) | CellValue::Empty)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, CellValue::Str(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }

    /// Numeric reading of the cell; empty counts as 0, strings and errors as
    /// NaN-free 0.0 (callers that must distinguish test the kind first).
    pub fn as_f64(&self) -> f64 {
        match self {
            CellValue::Numeric(v) => *v,
            _ => 0.0,
        }
    }

    /// Scale a numeric value, preserving empty and error markers.
    pub fn scaled(&self, factor: f64) -> CellValue {
        match self {
            CellValue::Numeric(v) => CellValue::Numeric(v * factor),
            other => other.clone(),
        }
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Numeric(v)
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Str(s)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Str(s.to_string())
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Numeric(v) => write!(f, "{v}"),
            CellValue::Str(s) => write!(f, "{s}"),
            CellValue::Error(e) => write!(f, "#ERR:{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_reading() {
        assert_eq!(CellValue::Numeric(2.5).as_f64(), 2.5);
        assert_eq!(CellValue::Empty.as_f64(), 0.0);
        assert_eq!(CellValue::Str("x".into()).as_f64(), 0.0);
    }

    #[test]
    fn test_scaling_preserves_markers() {
        assert_eq!(CellValue::Numeric(3.0).scaled(2.0), CellValue::Numeric(6.0));
        assert_eq!(CellValue::Empty.scaled(2.0), CellValue::Empty);
        let err = CellValue::Error(CellError::DivisionByZero);
        assert_eq!(err.scaled(2.0), err);
    }
}
