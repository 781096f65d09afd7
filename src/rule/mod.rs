//! Cell Rules
//!
//! Rules are formulas over cells: a target area on the left, an expression
//! on the right. At read time a rule cell replaces the stored or consolidated
//! value; rules form an ordered list per cube and the first matching rule
//! wins.
//!
//! ```text
//! ['Total'] = ['Jan'] + ['Feb']
//! ['Forecast', ] = ['Actual', ] * 1.1
//! ```
//!
//! An empty coordinate slot is a wildcard: the rule covers every element of
//! that dimension and the requested coordinate is substituted into source
//! references.

pub mod eval;
pub mod parser;

use serde::{Deserialize, Serialize};

use crate::cell::CellValue;
use crate::dimension::ElementId;
use crate::ident::RuleId;

/// Arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Comparison operators; comparisons evaluate to 0/1 doubles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Built-in rule functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Func {
    /// isempty(x): 1 when the referenced cell is empty
    IsEmpty,
    Abs,
    Min,
    Max,
    Round,
}

impl Func {
    pub fn arity(self) -> usize {
        match self {
            Func::IsEmpty | Func::Abs | Func::Round => 1,
            Func::Min | Func::Max => 2,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "isempty" => Some(Func::IsEmpty),
            "abs" => Some(Func::Abs),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            "round" => Some(Func::Round),
            _ => None,
        }
    }
}

/// Expression tree. `R` is the source-reference payload: element names as
/// parsed, element ids once compiled against the cube's dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr<R> {
    Constant(CellValue),
    /// Reference to a cell; wildcard slots take the requested coordinate
    Source(R),
    Neg(Box<Expr<R>>),
    Arith {
        op: ArithOp,
        lhs: Box<Expr<R>>,
        rhs: Box<Expr<R>>,
    },
    Cmp {
        op: CmpOp,
        lhs: Box<Expr<R>>,
        rhs: Box<Expr<R>>,
    },
    If {
        cond: Box<Expr<R>>,
        then: Box<Expr<R>>,
        otherwise: Box<Expr<R>>,
    },
    Call {
        func: Func,
        args: Vec<Expr<R>>,
    },
}

impl<R> Expr<R> {
    /// Rewrite every source reference, e.g. to resolve names into ids.
    pub fn map_sources<S, E, F>(self, f: &mut F) -> Result<Expr<S>, E>
    where
        F: FnMut(R) -> Result<S, E>,
    {
        Ok(match self {
            Expr::Constant(v) => Expr::Constant(v),
            Expr::Source(r) => Expr::Source(f(r)?),
            Expr::Neg(e) => Expr::Neg(Box::new(e.map_sources(f)?)),
            Expr::Arith { op, lhs, rhs } => Expr::Arith {
                op,
                lhs: Box::new(lhs.map_sources(f)?),
                rhs: Box::new(rhs.map_sources(f)?),
            },
            Expr::Cmp { op, lhs, rhs } => Expr::Cmp {
                op,
                lhs: Box::new(lhs.map_sources(f)?),
                rhs: Box::new(rhs.map_sources(f)?),
            },
            Expr::If {
                cond,
                then,
                otherwise,
            } => Expr::If {
                cond: Box::new(cond.map_sources(f)?),
                then: Box::new(then.map_sources(f)?),
                otherwise: Box::new(otherwise.map_sources(f)?),
            },
            Expr::Call { func, args } => Expr::Call {
                func,
                args: args
                    .into_iter()
                    .map(|a| a.map_sources(f))
                    .collect::<Result<_, _>>()?,
            },
        })
    }

    /// Collect every source reference, for dependency tracking.
    pub fn sources(&self) -> Vec<&R> {
        let mut out = Vec::new();
        self.collect_sources(&mut out);
        out
    }

    fn collect_sources<'a>(&'a self, out: &mut Vec<&'a R>) {
        match self {
            Expr::Constant(_) => {}
            Expr::Source(r) => out.push(r),
            Expr::Neg(e) => e.collect_sources(out),
            Expr::Arith { lhs, rhs, .. } | Expr::Cmp { lhs, rhs, .. } => {
                lhs.collect_sources(out);
                rhs.collect_sources(out);
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_sources(out);
                then.collect_sources(out);
                otherwise.collect_sources(out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.collect_sources(out);
                }
            }
        }
    }
}

/// Per-dimension coordinate reference: a concrete element or a wildcard.
pub type CoordRef<T> = Vec<Option<T>>;

/// Rule as parsed: names not yet resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRule {
    pub target: CoordRef<String>,
    pub expr: Expr<CoordRef<String>>,
}

/// Rule compiled against a cube: names resolved to element ids.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: RuleId,
    pub text: String,
    pub target: CoordRef<ElementId>,
    pub expr: Expr<CoordRef<ElementId>>,
}

impl CompiledRule {
    /// Does the rule's target cover this key?
    pub fn matches(&self, key: &[ElementId]) -> bool {
        key.len() == self.target.len()
            && self
                .target
                .iter()
                .zip(key.iter())
                .all(|(slot, id)| slot.map_or(true, |t| t == *id))
    }

    /// Element ids the rule mentions per dimension, for deletion cascades.
    pub fn references_element(&self, ordinal: usize, id: ElementId) -> bool {
        if self.target.get(ordinal).copied().flatten() == Some(id) {
            return true;
        }
        self.expr
            .sources()
            .iter()
            .any(|coords| coords.get(ordinal).copied().flatten() == Some(id))
    }
}
