//! Rules end to end: creation, overlay precedence, wildcard targets,
//! recursion detection, and lifecycle.

use cubist::cell::CellValue;
use cubist::dimension::ElementKind;
use cubist::engine::{Engine, SYSTEM_SESSION};
use cubist::error::{CellError, EngineError};
use cubist::splash::SplashMode;
use cubist::{Config, DimSelector};
use tempfile::TempDir;

fn test_engine() -> (Engine, TempDir) {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = temp.path().to_path_buf();
    config.engine.pool_size = 4;
    (Engine::new(config).unwrap(), temp)
}

fn hierarchy(engine: &Engine) -> (u32, u32, [u32; 4]) {
    let d1 = engine.create_dimension("D1").unwrap();
    let a = engine.add_element(d1, "a", ElementKind::Numeric).unwrap();
    let b = engine.add_element(d1, "b", ElementKind::Numeric).unwrap();
    let c = engine.add_element(d1, "c", ElementKind::Numeric).unwrap();
    let t = engine.add_element(d1, "T", ElementKind::Numeric).unwrap();
    engine
        .add_children(d1, t, &[(a, 1.0), (b, 1.0), (c, 1.0)])
        .unwrap();
    let cube = engine.create_cube("K", &[d1]).unwrap();
    (d1, cube, [a, b, c, t])
}

fn write(engine: &Engine, cube: u32, key: &[u32], value: f64) {
    engine
        .cell_replace(
            cube,
            key,
            CellValue::Numeric(value),
            SplashMode::Equal,
            SYSTEM_SESSION,
        )
        .unwrap();
}

/// The rule beats the consolidation at its target cell.
#[test]
fn test_rule_overrides_consolidation() {
    let (engine, _temp) = test_engine();
    let (_d1, cube, [a, b, c, t]) = hierarchy(&engine);
    write(&engine, cube, &[a], 1.0);
    write(&engine, cube, &[b], 2.0);
    write(&engine, cube, &[c], 3.0);
    let rule = engine.rule_create(cube, "['T'] = ['a'] * 10").unwrap();

    let result = engine.cell_value(cube, &[t]).unwrap();
    assert_eq!(result.value, CellValue::Numeric(10.0));
    assert_eq!(result.rule, Some(rule));
    // other cells unaffected
    assert_eq!(
        engine.cell_value(cube, &[a]).unwrap().value,
        CellValue::Numeric(1.0)
    );
}

/// Rule cells appear in area queries, replacing the consolidated value.
#[test]
fn test_rule_in_area_query() {
    let (engine, _temp) = test_engine();
    let (_d1, cube, [a, b, _c, t]) = hierarchy(&engine);
    write(&engine, cube, &[a], 1.0);
    write(&engine, cube, &[b], 2.0);
    let rule = engine.rule_create(cube, "['T'] = ['a'] * 10").unwrap();

    let rows = engine.cell_area(cube, &vec![DimSelector::All]).unwrap();
    let t_row = rows.iter().find(|(k, _, _)| k == &vec![t]).unwrap();
    assert_eq!(t_row.1, CellValue::Numeric(10.0));
    assert_eq!(t_row.2, Some(rule));
}

/// First matching rule wins when targets overlap.
#[test]
fn test_first_match_wins() {
    let (engine, _temp) = test_engine();
    let (_d1, cube, [a, _b, _c, t]) = hierarchy(&engine);
    write(&engine, cube, &[a], 1.0);
    engine.rule_create(cube, "['T'] = 111").unwrap();
    engine.rule_create(cube, "['T'] = 222").unwrap();

    assert_eq!(
        engine.cell_value(cube, &[t]).unwrap().value,
        CellValue::Numeric(111.0)
    );
}

/// Rules can read consolidated sources.
#[test]
fn test_rule_reads_consolidation() {
    let (engine, _temp) = test_engine();
    let d1 = engine.create_dimension("D1").unwrap();
    let a = engine.add_element(d1, "a", ElementKind::Numeric).unwrap();
    let b = engine.add_element(d1, "b", ElementKind::Numeric).unwrap();
    let t = engine.add_element(d1, "T", ElementKind::Numeric).unwrap();
    let f = engine.add_element(d1, "forecast", ElementKind::Numeric).unwrap();
    engine.add_children(d1, t, &[(a, 1.0), (b, 1.0)]).unwrap();
    let cube = engine.create_cube("K", &[d1]).unwrap();

    write(&engine, cube, &[a], 2.0);
    write(&engine, cube, &[b], 3.0);
    engine
        .rule_create(cube, "['forecast'] = ['T'] * 1.5")
        .unwrap();
    assert_eq!(
        engine.cell_value(cube, &[f]).unwrap().value,
        CellValue::Numeric(7.5)
    );
}

/// Wildcard slots cover the whole dimension and substitute the requested
/// coordinate into sources.
#[test]
fn test_wildcard_rule() {
    let (engine, _temp) = test_engine();
    let d1 = engine.create_dimension("version").unwrap();
    let actual = engine.add_element(d1, "actual", ElementKind::Numeric).unwrap();
    let plan = engine.add_element(d1, "plan", ElementKind::Numeric).unwrap();
    let d2 = engine.create_dimension("month").unwrap();
    let jan = engine.add_element(d2, "Jan", ElementKind::Numeric).unwrap();
    let feb = engine.add_element(d2, "Feb", ElementKind::Numeric).unwrap();
    let cube = engine.create_cube("K", &[d1, d2]).unwrap();

    write(&engine, cube, &[actual, jan], 100.0);
    write(&engine, cube, &[actual, feb], 200.0);
    engine
        .rule_create(cube, "['plan', ] = ['actual', ] * 1.1")
        .unwrap();

    assert_eq!(
        engine.cell_value(cube, &[plan, jan]).unwrap().value,
        CellValue::Numeric(100.0 * 1.1)
    );
    assert_eq!(
        engine.cell_value(cube, &[plan, feb]).unwrap().value,
        CellValue::Numeric(200.0 * 1.1)
    );
}

/// Mutually recursive rules resolve to the circular-reference marker.
#[test]
fn test_rule_recursion_guard() {
    let (engine, _temp) = test_engine();
    let d1 = engine.create_dimension("D1").unwrap();
    engine.add_element(d1, "x", ElementKind::Numeric).unwrap();
    engine.add_element(d1, "y", ElementKind::Numeric).unwrap();
    let x = engine.element_id(d1, "x").unwrap();
    let cube = engine.create_cube("K", &[d1]).unwrap();

    engine.rule_create(cube, "['x'] = ['y'] + 1").unwrap();
    engine.rule_create(cube, "['y'] = ['x'] + 1").unwrap();
    assert_eq!(
        engine.cell_value(cube, &[x]).unwrap().value,
        CellValue::Error(CellError::RuleCircular)
    );
}

/// Division by zero inside a rule yields the error marker, and the rest of
/// the area still evaluates.
#[test]
fn test_division_by_zero_is_per_cell() {
    let (engine, _temp) = test_engine();
    let (_d1, cube, [a, b, _c, t]) = hierarchy(&engine);
    write(&engine, cube, &[b], 2.0);
    engine.rule_create(cube, "['a'] = 1 / ['c']").unwrap();

    assert_eq!(
        engine.cell_value(cube, &[a]).unwrap().value,
        CellValue::Error(CellError::DivisionByZero)
    );
    // b is untouched by the rule
    assert_eq!(
        engine.cell_value(cube, &[b]).unwrap().value,
        CellValue::Numeric(2.0)
    );
    // the consolidation over the erroneous base cell carries the marker
    assert_eq!(
        engine.cell_value(cube, &[t]).unwrap().value,
        CellValue::Error(CellError::DivisionByZero)
    );
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_rule_list_modify_delete() {
    let (engine, _temp) = test_engine();
    let (_d1, cube, [_a, _b, _c, t]) = hierarchy(&engine);
    let rule = engine.rule_create(cube, "['T'] = 1").unwrap();
    assert_eq!(engine.rule_list(cube).unwrap().len(), 1);

    engine.rule_modify(cube, rule, "['T'] = 2").unwrap();
    assert_eq!(
        engine.cell_value(cube, &[t]).unwrap().value,
        CellValue::Numeric(2.0)
    );

    engine.rule_delete(cube, rule).unwrap();
    assert!(engine.rule_list(cube).unwrap().is_empty());
    assert_eq!(engine.cell_value(cube, &[t]).unwrap().value, CellValue::Empty);

    assert!(matches!(
        engine.rule_delete(cube, rule),
        Err(EngineError::NoSuchRule(_))
    ));
}

#[test]
fn test_rule_parse_errors_surface() {
    let (engine, _temp) = test_engine();
    let (_d1, cube, _) = hierarchy(&engine);
    assert!(matches!(
        engine.rule_create(cube, "['T'] = nosuch(1)"),
        Err(EngineError::ParseError(_))
    ));
    assert!(matches!(
        engine.rule_create(cube, "['missing'] = 1"),
        Err(EngineError::ElementNotFound(_))
    ));
    assert!(engine.rule_list(cube).unwrap().is_empty());
}

/// Deleting an element drops the rules that reference it.
#[test]
fn test_element_deletion_drops_referencing_rules() {
    let (engine, _temp) = test_engine();
    let (d1, cube, [a, _b, _c, _t]) = hierarchy(&engine);
    engine.rule_create(cube, "['T'] = ['a'] * 10").unwrap();
    engine.delete_element(d1, a).unwrap();
    assert!(engine.rule_list(cube).unwrap().is_empty());
}
