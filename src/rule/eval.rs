//! Rule Evaluation
//!
//! Per-cell evaluation of a compiled expression tree against a requested
//! key. Numeric semantics: IEEE doubles, empty cells read as 0 except under
//! `isempty`, division by zero yields the error marker rather than infinity,
//! comparisons return 0/1 doubles. Errors propagate outward through every
//! operator.

use crate::cell::CellValue;
use crate::dimension::ElementId;
use crate::error::CellError;
use crate::ident::IdentifierType;
use crate::rule::{ArithOp, CmpOp, CoordRef, Expr, Func};

/// Resolves cell references during evaluation. The engine's implementation
/// answers with consolidation and rule overlays applied, and carries the
/// per-thread recursion guard.
pub trait CellResolver {
    fn cell(&self, key: &[IdentifierType]) -> CellValue;
}

/// Evaluate `expr` for the cell at `key`.
pub fn evaluate(
    expr: &Expr<CoordRef<ElementId>>,
    key: &[IdentifierType],
    resolver: &dyn CellResolver,
) -> CellValue {
    match expr {
        Expr::Constant(v) => v.clone(),
        Expr::Source(coords) => resolver.cell(&substitute(coords, key)),
        Expr::Neg(inner) => match evaluate(inner, key, resolver) {
            CellValue::Error(e) => CellValue::Error(e),
            v => match numeric(&v) {
                Ok(n) => CellValue::Numeric(-n),
                Err(e) => CellValue::Error(e),
            },
        },
        Expr::Arith { op, lhs, rhs } => {
            let l = evaluate(lhs, key, resolver);
            if let CellValue::Error(e) = l {
                return CellValue::Error(e);
            }
            let r = evaluate(rhs, key, resolver);
            if let CellValue::Error(e) = r {
                return CellValue::Error(e);
            }
            let (l, r) = match (numeric(&l), numeric(&r)) {
                (Ok(l), Ok(r)) => (l, r),
                (Err(e), _) | (_, Err(e)) => return CellValue::Error(e),
            };
            match op {
                ArithOp::Add => CellValue::Numeric(l + r),
                ArithOp::Sub => CellValue::Numeric(l - r),
                ArithOp::Mul => CellValue::Numeric(l * r),
                ArithOp::Div => {
                    if r == 0.0 {
                        CellValue::Error(CellError::DivisionByZero)
                    } else {
                        CellValue::Numeric(l / r)
                    }
                }
            }
        }
        Expr::Cmp { op, lhs, rhs } => {
            let l = evaluate(lhs, key, resolver);
            if let CellValue::Error(e) = l {
                return CellValue::Error(e);
            }
            let r = evaluate(rhs, key, resolver);
            if let CellValue::Error(e) = r {
                return CellValue::Error(e);
            }
            CellValue::Numeric(if compare(*op, &l, &r) { 1.0 } else { 0.0 })
        }
        Expr::If {
            cond,
            then,
            otherwise,
        } => match evaluate(cond, key, resolver) {
            CellValue::Error(e) => CellValue::Error(e),
            v => {
                let truthy = match numeric(&v) {
                    Ok(n) => n != 0.0,
                    Err(e) => return CellValue::Error(e),
                };
                if truthy {
                    evaluate(then, key, resolver)
                } else {
                    evaluate(otherwise, key, resolver)
                }
            }
        },
        Expr::Call { func, args } => {
            if *func == Func::IsEmpty {
                // the one context where empty is observable rather than 0
                let v = evaluate(&args[0], key, resolver);
                return match v {
                    CellValue::Error(e) => CellValue::Error(e),
                    CellValue::Empty => CellValue::Numeric(1.0),
                    _ => CellValue::Numeric(0.0),
                };
            }
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                match evaluate(arg, key, resolver) {
                    CellValue::Error(e) => return CellValue::Error(e),
                    v => match numeric(&v) {
                        Ok(n) => values.push(n),
                        Err(e) => return CellValue::Error(e),
                    },
                }
            }
            let result = match func {
                Func::Abs => values[0].abs(),
                Func::Round => values[0].round(),
                Func::Min => values[0].min(values[1]),
                Func::Max => values[0].max(values[1]),
                Func::IsEmpty => unreachable!("handled above"),
            };
            CellValue::Numeric(result)
        }
    }
}

/// Build the full source key: concrete coordinates from the reference,
/// wildcards from the requested key.
fn substitute(coords: &CoordRef<ElementId>, key: &[IdentifierType]) -> Vec<IdentifierType> {
    coords
        .iter()
        .zip(key.iter())
        .map(|(slot, requested)| slot.unwrap_or(*requested))
        .collect()
}

fn numeric(value: &CellValue) -> Result<f64, CellError> {
    match value {
        CellValue::Numeric(v) => Ok(*v),
        CellValue::Empty => Ok(0.0),
        CellValue::Str(_) => Err(CellError::UnsupportedConversion),
        CellValue::Error(e) => Err(*e),
    }
}

fn compare(op: CmpOp, l: &CellValue, r: &CellValue) -> bool {
    match (l, r) {
        (CellValue::Str(a), CellValue::Str(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        },
        _ => {
            let a = l.as_f64();
            let b = r.as_f64();
            match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::parser::parse_rule;
    use std::collections::HashMap;

    struct FixedResolver {
        cells: HashMap<Vec<IdentifierType>, CellValue>,
    }

    impl CellResolver for FixedResolver {
        fn cell(&self, key: &[IdentifierType]) -> CellValue {
            self.cells.get(key).cloned().unwrap_or(CellValue::Empty)
        }
    }

    fn compile(text: &str, names: &[(&str, ElementId)]) -> Expr<CoordRef<ElementId>> {
        let table: HashMap<&str, ElementId> = names.iter().copied().collect();
        let mut resolve = |coords: CoordRef<String>| -> Result<CoordRef<ElementId>, ()> {
            Ok(coords
                .into_iter()
                .map(|slot| slot.map(|name| table[name.as_str()]))
                .collect())
        };
        parse_rule(text).unwrap().expr.map_sources(&mut resolve).unwrap()
    }

    #[test]
    fn test_arithmetic_over_cells() {
        let expr = compile("['t'] = ['a'] * 10", &[("a", 0), ("t", 3)]);
        let resolver = FixedResolver {
            cells: [(vec![0], CellValue::Numeric(1.0))].into_iter().collect(),
        };
        assert_eq!(evaluate(&expr, &[3], &resolver), CellValue::Numeric(10.0));
    }

    #[test]
    fn test_division_by_zero_marks_error() {
        let expr = compile("['t'] = 1 / ['a']", &[("a", 0), ("t", 1)]);
        let resolver = FixedResolver {
            cells: HashMap::new(),
        };
        assert_eq!(
            evaluate(&expr, &[1], &resolver),
            CellValue::Error(CellError::DivisionByZero)
        );
    }

    #[test]
    fn test_empty_reads_as_zero_except_isempty() {
        let expr = compile("['t'] = ['a'] + 5", &[("a", 0), ("t", 1)]);
        let resolver = FixedResolver {
            cells: HashMap::new(),
        };
        assert_eq!(evaluate(&expr, &[1], &resolver), CellValue::Numeric(5.0));

        let expr = compile("['t'] = isempty(['a'])", &[("a", 0), ("t", 1)]);
        assert_eq!(evaluate(&expr, &[1], &resolver), CellValue::Numeric(1.0));
    }

    #[test]
    fn test_comparison_returns_unit_doubles() {
        let expr = compile("['t'] = ['a'] > 3", &[("a", 0), ("t", 1)]);
        let resolver = FixedResolver {
            cells: [(vec![0], CellValue::Numeric(4.0))].into_iter().collect(),
        };
        assert_eq!(evaluate(&expr, &[1], &resolver), CellValue::Numeric(1.0));
    }

    #[test]
    fn test_wildcard_substitution() {
        // ['x', ] = ['y', ] : second coordinate flows from the requested key
        let expr = compile("['x', ] = ['y', ]", &[("x", 0), ("y", 1)]);
        let resolver = FixedResolver {
            cells: [(vec![1, 7], CellValue::Numeric(42.0))]
                .into_iter()
                .collect(),
        };
        assert_eq!(
            evaluate(&expr, &[0, 7], &resolver),
            CellValue::Numeric(42.0)
        );
    }

    #[test]
    fn test_if_branches() {
        let expr = compile(
            "['t'] = if(['a'] >= 10, ['a'], 0 - ['a'])",
            &[("a", 0), ("t", 1)],
        );
        let resolver = FixedResolver {
            cells: [(vec![0], CellValue::Numeric(3.0))].into_iter().collect(),
        };
        assert_eq!(evaluate(&expr, &[1], &resolver), CellValue::Numeric(-3.0));
    }
}
