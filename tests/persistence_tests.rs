//! Persistence: journal replay after a crash, snapshot round trips, and
//! journal archival on save.

use cubist::cell::CellValue;
use cubist::dimension::ElementKind;
use cubist::engine::{Engine, SYSTEM_SESSION};
use cubist::splash::SplashMode;
use cubist::{Config, DimSelector};
use std::path::PathBuf;
use tempfile::TempDir;

fn config_for(path: PathBuf) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = path;
    config.engine.pool_size = 2;
    config
}

fn build_hierarchy(engine: &Engine) -> (u32, u32) {
    let d1 = engine.create_dimension("D1").unwrap();
    let a = engine.add_element(d1, "a", ElementKind::Numeric).unwrap();
    let b = engine.add_element(d1, "b", ElementKind::Numeric).unwrap();
    let t = engine.add_element(d1, "T", ElementKind::Numeric).unwrap();
    engine.add_children(d1, t, &[(a, 1.0), (b, 1.0)]).unwrap();
    let cube = engine.create_cube("K", &[d1]).unwrap();
    (d1, cube)
}

/// Every mutation is journaled; reopening without a snapshot replays the
/// journal into the same state.
#[test]
fn test_journal_replay_without_snapshot() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().to_path_buf();
    {
        let engine = Engine::new(config_for(path.clone())).unwrap();
        let (_d1, cube) = build_hierarchy(&engine);
        engine
            .cell_replace(cube, &[0], CellValue::Numeric(1.0), SplashMode::Equal, SYSTEM_SESSION)
            .unwrap();
        engine
            .cell_replace(cube, &[1], CellValue::Numeric(2.0), SplashMode::Equal, SYSTEM_SESSION)
            .unwrap();
        // no save: journal only
    }
    {
        let engine = Engine::new(config_for(path)).unwrap();
        let cube = engine.cube_id("K").unwrap();
        let d1 = engine.dimension_id("D1").unwrap();
        let t = engine.element_id(d1, "T").unwrap();
        assert_eq!(
            engine.cell_value(cube, &[t]).unwrap().value,
            CellValue::Numeric(3.0)
        );
    }
}

/// Save then load is the identity on core state.
#[test]
fn test_save_load_round_trip() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().to_path_buf();
    {
        let engine = Engine::new(config_for(path.clone())).unwrap();
        let (d1, cube) = build_hierarchy(&engine);
        let label = engine.add_element(d1, "label", ElementKind::Str).unwrap();
        engine
            .cell_replace(cube, &[0], CellValue::Numeric(1.5), SplashMode::Equal, SYSTEM_SESSION)
            .unwrap();
        engine
            .cell_replace(
                cube,
                &[label],
                CellValue::Str("note".into()),
                SplashMode::Equal,
                SYSTEM_SESSION,
            )
            .unwrap();
        engine.rule_create(cube, "['b'] = ['a'] * 2").unwrap();
        engine.save().unwrap();
    }
    {
        let engine = Engine::new(config_for(path)).unwrap();
        let d1 = engine.dimension_id("D1").unwrap();
        let cube = engine.cube_id("K").unwrap();
        let a = engine.element_id(d1, "a").unwrap();
        let b = engine.element_id(d1, "b").unwrap();
        let t = engine.element_id(d1, "T").unwrap();
        let label = engine.element_id(d1, "label").unwrap();

        assert_eq!(
            engine.cell_value(cube, &[a]).unwrap().value,
            CellValue::Numeric(1.5)
        );
        assert_eq!(
            engine.cell_value(cube, &[label]).unwrap().value,
            CellValue::Str("note".into())
        );
        // the rule survived the round trip
        assert_eq!(
            engine.cell_value(cube, &[b]).unwrap().value,
            CellValue::Numeric(3.0)
        );
        assert_eq!(
            engine.cell_value(cube, &[t]).unwrap().value,
            CellValue::Numeric(4.5)
        );
        assert_eq!(engine.rule_list(cube).unwrap().len(), 1);
        // element metadata intact
        assert_eq!(engine.element_info(d1, t).unwrap().kind, ElementKind::Consolidated);
    }
}

/// Mutations after a save replay on top of the snapshot.
#[test]
fn test_snapshot_plus_journal_tail() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().to_path_buf();
    {
        let engine = Engine::new(config_for(path.clone())).unwrap();
        let (_d1, cube) = build_hierarchy(&engine);
        engine
            .cell_replace(cube, &[0], CellValue::Numeric(1.0), SplashMode::Equal, SYSTEM_SESSION)
            .unwrap();
        engine.save().unwrap();
        // post-save mutations live only in the journal
        engine
            .cell_replace(cube, &[0], CellValue::Numeric(9.0), SplashMode::Equal, SYSTEM_SESSION)
            .unwrap();
        engine
            .cell_replace(cube, &[1], CellValue::Numeric(2.0), SplashMode::Equal, SYSTEM_SESSION)
            .unwrap();
    }
    {
        let engine = Engine::new(config_for(path)).unwrap();
        let cube = engine.cube_id("K").unwrap();
        assert_eq!(
            engine.cell_value(cube, &[0]).unwrap().value,
            CellValue::Numeric(9.0)
        );
        assert_eq!(
            engine.cell_value(cube, &[1]).unwrap().value,
            CellValue::Numeric(2.0)
        );
    }
}

/// Structural operations replay: deletes, renames, children.
#[test]
fn test_structural_journal_replay() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().to_path_buf();
    {
        let engine = Engine::new(config_for(path.clone())).unwrap();
        let (d1, cube) = build_hierarchy(&engine);
        let c = engine.add_element(d1, "c", ElementKind::Numeric).unwrap();
        let t = engine.element_id(d1, "T").unwrap();
        engine.add_children(d1, t, &[(c, 2.0)]).unwrap();
        engine.rename_element(d1, c, "gamma").unwrap();
        engine.delete_element(d1, 1).unwrap(); // deletes b
        engine
            .cell_replace(cube, &[c], CellValue::Numeric(4.0), SplashMode::Equal, SYSTEM_SESSION)
            .unwrap();
    }
    {
        let engine = Engine::new(config_for(path)).unwrap();
        let d1 = engine.dimension_id("D1").unwrap();
        let cube = engine.cube_id("K").unwrap();
        let t = engine.element_id(d1, "T").unwrap();
        let gamma = engine.element_id(d1, "gamma").unwrap();
        assert!(engine.element_id(d1, "b").is_err());
        // T = a + 2*gamma with a empty, gamma=4
        assert_eq!(
            engine.cell_value(cube, &[t]).unwrap().value,
            CellValue::Numeric(8.0)
        );
        assert_eq!(
            engine.cell_value(cube, &[gamma]).unwrap().value,
            CellValue::Numeric(4.0)
        );
    }
}

/// Splashed writes replay deterministically.
#[test]
fn test_splash_replay() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().to_path_buf();
    {
        let engine = Engine::new(config_for(path.clone())).unwrap();
        let (d1, cube) = build_hierarchy(&engine);
        let t = engine.element_id(d1, "T").unwrap();
        engine
            .cell_replace(cube, &[t], CellValue::Numeric(10.0), SplashMode::Equal, SYSTEM_SESSION)
            .unwrap();
    }
    {
        let engine = Engine::new(config_for(path)).unwrap();
        let cube = engine.cube_id("K").unwrap();
        assert_eq!(
            engine.cell_value(cube, &[0]).unwrap().value,
            CellValue::Numeric(5.0)
        );
        assert_eq!(
            engine.cell_value(cube, &[1]).unwrap().value,
            CellValue::Numeric(5.0)
        );
    }
}

/// Save archives the journal files.
#[test]
fn test_save_archives_journal() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().to_path_buf();
    let engine = Engine::new(config_for(path.clone())).unwrap();
    let (_d1, cube) = build_hierarchy(&engine);
    engine
        .cell_replace(cube, &[0], CellValue::Numeric(1.0), SplashMode::Equal, SYSTEM_SESSION)
        .unwrap();
    engine.save().unwrap();

    let names: Vec<String> = std::fs::read_dir(&path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert!(names.iter().any(|n| n.contains(".archived")));
    // a fresh journal file may exist, but it must replay to nothing new
    drop(engine);
    let engine = Engine::new(config_for(path)).unwrap();
    let cube = engine.cube_id("K").unwrap();
    assert_eq!(
        engine.cell_value(cube, &[0]).unwrap().value,
        CellValue::Numeric(1.0)
    );
}

/// Rollbacks are journaled, so replay reproduces the rolled-back state.
#[test]
fn test_rollback_survives_replay() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().to_path_buf();
    {
        let engine = Engine::new(config_for(path.clone())).unwrap();
        let (_d1, cube) = build_hierarchy(&engine);
        engine
            .cell_replace(cube, &[0], CellValue::Numeric(1.0), SplashMode::Equal, SYSTEM_SESSION)
            .unwrap();
        let session = engine.create_session();
        let lock = engine
            .lock_acquire(cube, &vec![DimSelector::Ids(vec![0])], session)
            .unwrap();
        engine
            .cell_replace(cube, &[0], CellValue::Numeric(77.0), SplashMode::Equal, session)
            .unwrap();
        engine.lock_rollback(lock, session).unwrap();
    }
    {
        let engine = Engine::new(config_for(path)).unwrap();
        let cube = engine.cube_id("K").unwrap();
        assert_eq!(
            engine.cell_value(cube, &[0]).unwrap().value,
            CellValue::Numeric(1.0)
        );
    }
}
