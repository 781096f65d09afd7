//! Snapshot Files
//!
//! One registry file (`database.csv`), one file per dimension
//! (`dimension_<id>.csv`) and one per cube (`cube_<id>.csv`), all
//! `;`-separated with `[SECTION]` blocks and `#` comments. Every snapshot
//! file carries a trailing `# crc=<hex>` footer over its body; a mismatch on
//! load fails with `FileCorrupt`. Files are written to a temporary name and
//! renamed into place so a crash mid-save never clobbers the previous
//! snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cell::CellValue;
use crate::cube::storage::MixedStorage;
use crate::cube::Cube;
use crate::dimension::{Dimension, Element, ElementKind};
use crate::error::{EngineError, Result};
use crate::ident::{CubeId, DimensionId, Key, RuleId};
use crate::persist::{escape_field, join_ids, parse_ids, split_line};

// ----------------------------------------------------------------------
// File primitives
// ----------------------------------------------------------------------

fn write_snapshot_file(path: &Path, body: &str) -> Result<()> {
    let crc = crc32fast::hash(body.as_bytes());
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, format!("{body}# crc={crc:08x}\n"))?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_snapshot_file(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| EngineError::FileOpen(format!("{}: {e}", path.display())))?;
    let Some(footer_at) = raw.rfind("# crc=") else {
        return Err(EngineError::FileCorrupt(format!(
            "{}: missing crc footer",
            path.display()
        )));
    };
    let body = &raw[..footer_at];
    let footer = raw[footer_at..].trim();
    let stored = footer
        .strip_prefix("# crc=")
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .ok_or_else(|| {
            EngineError::FileCorrupt(format!("{}: malformed crc footer", path.display()))
        })?;
    let actual = crc32fast::hash(body.as_bytes());
    if stored != actual {
        return Err(EngineError::FileCorrupt(format!(
            "{}: crc mismatch (stored {stored:08x}, computed {actual:08x})",
            path.display()
        )));
    }
    Ok(body.to_string())
}

fn dimension_path(dir: &Path, id: DimensionId) -> PathBuf {
    dir.join(format!("dimension_{id}.csv"))
}

fn cube_path(dir: &Path, id: CubeId) -> PathBuf {
    dir.join(format!("cube_{id}.csv"))
}

fn registry_path(dir: &Path) -> PathBuf {
    dir.join("database.csv")
}

fn parse_u32(field: &str, context: &str) -> Result<u32> {
    field
        .parse::<u32>()
        .map_err(|_| EngineError::FileCorrupt(format!("bad {context}: '{field}'")))
}

// ----------------------------------------------------------------------
// Dimension files
// ----------------------------------------------------------------------

pub fn save_dimension(dir: &Path, dim: &Dimension) -> Result<()> {
    let mut body = String::new();
    body.push_str("# cubist dimension snapshot\n");
    body.push_str(&format!(
        "[DIMENSION];{};{};{};{};{};{}\n",
        dim.id(),
        escape_field(dim.name()),
        dim.max_level(),
        dim.max_indent(),
        dim.max_depth(),
        dim.len()
    ));
    body.push_str("[ELEMENTS]\n");
    for id in dim.ids_by_position() {
        let element = dim.element(*id)?;
        let children = dim.children(*id);
        body.push_str(&format!(
            "{};{};{};{};{};{};{};{};{};{};{}\n",
            element.id,
            escape_field(&element.name),
            element.position,
            element.kind.code(),
            u8::from(dim.is_string_consolidation(*id)),
            dim.level(*id)?,
            dim.indent(*id)?,
            dim.depth(*id)?,
            join_ids(dim.parents(*id).iter().copied()),
            join_ids(children.iter().map(|(c, _)| *c)),
            children
                .iter()
                .map(|(_, w)| w.to_string())
                .collect::<Vec<_>>()
                .join(",")
        ));
    }
    write_snapshot_file(&dimension_path(dir, dim.id()), &body)?;
    debug!(dimension = dim.id(), "dimension snapshot written");
    Ok(())
}

pub fn load_dimension(dir: &Path, id: DimensionId) -> Result<Dimension> {
    let body = read_snapshot_file(&dimension_path(dir, id))?;
    let mut dim: Option<Dimension> = None;
    let mut children: Vec<(u32, Vec<(u32, f64)>)> = Vec::new();
    let mut in_elements = false;
    for line in body.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("[DIMENSION];") {
            let fields = split_line(rest);
            if fields.len() < 2 {
                return Err(EngineError::FileCorrupt("short dimension header".into()));
            }
            let file_id = parse_u32(&fields[0], "dimension id")?;
            dim = Some(Dimension::new(file_id, &fields[1])?);
            continue;
        }
        if line == "[ELEMENTS]" {
            in_elements = true;
            continue;
        }
        if !in_elements {
            continue;
        }
        let dim = dim
            .as_mut()
            .ok_or_else(|| EngineError::FileCorrupt("elements before header".into()))?;
        let fields = split_line(line);
        if fields.len() < 11 {
            return Err(EngineError::FileCorrupt(format!(
                "short element line: '{line}'"
            )));
        }
        let element_id = parse_u32(&fields[0], "element id")?;
        let kind = ElementKind::from_code(parse_u32(&fields[3], "element kind")?)
            .ok_or_else(|| EngineError::FileCorrupt(format!("bad kind code '{}'", fields[3])))?;
        dim.insert_raw(Element {
            id: element_id,
            name: fields[1].clone(),
            position: parse_u32(&fields[2], "element position")?,
            kind,
        });
        let child_ids: Vec<u32> = parse_ids(&fields[9])?;
        let weights: Vec<f64> = if fields[10].is_empty() {
            Vec::new()
        } else {
            fields[10]
                .split(',')
                .map(|w| {
                    w.parse::<f64>()
                        .map_err(|_| EngineError::FileCorrupt(format!("bad weight '{w}'")))
                })
                .collect::<Result<_>>()?
        };
        if child_ids.len() != weights.len() {
            return Err(EngineError::FileCorrupt(format!(
                "child/weight length mismatch for element {element_id}"
            )));
        }
        if !child_ids.is_empty() {
            children.push((element_id, child_ids.into_iter().zip(weights).collect()));
        }
    }
    let mut dim =
        dim.ok_or_else(|| EngineError::FileCorrupt("missing [DIMENSION] header".into()))?;
    for (parent, pairs) in children {
        dim.set_children_raw(parent, pairs);
    }
    dim.finish_raw_load();
    Ok(dim)
}

// ----------------------------------------------------------------------
// Cube files
// ----------------------------------------------------------------------

/// Cube snapshot contents as loaded from disk.
pub struct CubeFile {
    pub cube: Cube,
    pub cells: Vec<(Key, CellValue, Option<RuleId>)>,
    pub rules: Vec<(RuleId, String)>,
}

pub fn save_cube(
    dir: &Path,
    cube: &Cube,
    storage: &MixedStorage,
    rules: &[(RuleId, String)],
) -> Result<()> {
    let mut body = String::new();
    body.push_str("# cubist cube snapshot\n");
    body.push_str(&format!(
        "[CUBE];{};{};{}\n",
        cube.id(),
        escape_field(cube.name()),
        join_ids(cube.dimension_ids().iter().copied())
    ));
    let numeric = storage.numeric_snapshot();
    let strings = storage.string_rows();
    body.push_str(&format!("[CELLS];{}\n", numeric.len() + strings.len()));
    for (key, cell) in numeric.iter() {
        body.push_str(&format!(
            "{};1;{};{}\n",
            join_ids(key.iter().copied()),
            cell.value,
            cell.rule.map(|r| r.to_string()).unwrap_or_default()
        ));
    }
    for (key, value, rule) in strings {
        body.push_str(&format!(
            "{};2;{};{}\n",
            join_ids(key.iter().copied()),
            escape_field(&value),
            rule.map(|r| r.to_string()).unwrap_or_default()
        ));
    }
    body.push_str("[RULES]\n");
    for (id, text) in rules {
        body.push_str(&format!("{id};{}\n", escape_field(text)));
    }
    write_snapshot_file(&cube_path(dir, cube.id()), &body)?;
    debug!(cube = cube.id(), "cube snapshot written");
    Ok(())
}

pub fn load_cube(dir: &Path, id: CubeId) -> Result<CubeFile> {
    let body = read_snapshot_file(&cube_path(dir, id))?;
    let mut cube: Option<Cube> = None;
    let mut cells = Vec::new();
    let mut rules = Vec::new();
    #[derive(PartialEq)]
    enum Section {
        Preamble,
        Cells,
        Rules,
    }
    let mut section = Section::Preamble;
    for line in body.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("[CUBE];") {
            let fields = split_line(rest);
            if fields.len() < 3 {
                return Err(EngineError::FileCorrupt("short cube header".into()));
            }
            let file_id = parse_u32(&fields[0], "cube id")?;
            let dims: Vec<DimensionId> = parse_ids(&fields[2])?;
            cube = Some(Cube::new(file_id, &fields[1], dims)?);
            continue;
        }
        if line.starts_with("[CELLS]") {
            section = Section::Cells;
            continue;
        }
        if line == "[RULES]" {
            section = Section::Rules;
            continue;
        }
        match section {
            Section::Preamble => {}
            Section::Cells => {
                let fields = split_line(line);
                if fields.len() < 4 {
                    return Err(EngineError::FileCorrupt(format!("short cell line: '{line}'")));
                }
                let key: Key = parse_ids(&fields[0])?;
                let rule = if fields[3].is_empty() {
                    None
                } else {
                    Some(parse_u32(&fields[3], "cell rule id")?)
                };
                let value = match fields[1].as_str() {
                    "1" => CellValue::Numeric(fields[2].parse::<f64>().map_err(|_| {
                        EngineError::FileCorrupt(format!("bad cell value '{}'", fields[2]))
                    })?),
                    "2" => CellValue::Str(fields[2].clone()),
                    other => {
                        return Err(EngineError::FileCorrupt(format!(
                            "bad cell type code '{other}'"
                        )));
                    }
                };
                cells.push((key, value, rule));
            }
            Section::Rules => {
                let fields = split_line(line);
                if fields.len() < 2 {
                    return Err(EngineError::FileCorrupt(format!("short rule line: '{line}'")));
                }
                rules.push((parse_u32(&fields[0], "rule id")?, fields[1].clone()));
            }
        }
    }
    let cube = cube.ok_or_else(|| EngineError::FileCorrupt("missing [CUBE] header".into()))?;
    Ok(CubeFile { cube, cells, rules })
}

pub fn remove_cube_file(dir: &Path, id: CubeId) -> Result<()> {
    let path = cube_path(dir, id);
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

pub fn remove_dimension_file(dir: &Path, id: DimensionId) -> Result<()> {
    let path = dimension_path(dir, id);
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Registry file
// ----------------------------------------------------------------------

/// The database registry: which dimensions and cubes exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    pub last_saved: i64,
    pub dimensions: Vec<(DimensionId, String)>,
    pub cubes: Vec<(CubeId, String, Vec<DimensionId>)>,
}

pub fn save_registry(dir: &Path, registry: &Registry) -> Result<()> {
    let mut body = String::new();
    body.push_str("# cubist database registry\n");
    body.push_str(&format!("[DATABASE];{}\n", registry.last_saved));
    body.push_str("[DIMENSIONS]\n");
    for (id, name) in &registry.dimensions {
        body.push_str(&format!("{id};{}\n", escape_field(name)));
    }
    body.push_str("[CUBES]\n");
    for (id, name, dims) in &registry.cubes {
        body.push_str(&format!(
            "{id};{};{}\n",
            escape_field(name),
            join_ids(dims.iter().copied())
        ));
    }
    write_snapshot_file(&registry_path(dir), &body)
}

/// `None` when no snapshot exists yet (fresh database directory).
pub fn load_registry(dir: &Path) -> Result<Option<Registry>> {
    let path = registry_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let body = read_snapshot_file(&path)?;
    let mut registry = Registry::default();
    #[derive(PartialEq)]
    enum Section {
        Preamble,
        Dimensions,
        Cubes,
    }
    let mut section = Section::Preamble;
    for line in body.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("[DATABASE];") {
            registry.last_saved = rest.trim().parse::<i64>().map_err(|_| {
                EngineError::FileCorrupt(format!("bad last-saved timestamp '{rest}'"))
            })?;
            continue;
        }
        if line == "[DIMENSIONS]" {
            section = Section::Dimensions;
            continue;
        }
        if line == "[CUBES]" {
            section = Section::Cubes;
            continue;
        }
        let fields = split_line(line);
        match section {
            Section::Preamble => {}
            Section::Dimensions => {
                if fields.len() < 2 {
                    return Err(EngineError::FileCorrupt(format!(
                        "short dimension registry line: '{line}'"
                    )));
                }
                registry
                    .dimensions
                    .push((parse_u32(&fields[0], "dimension id")?, fields[1].clone()));
            }
            Section::Cubes => {
                if fields.len() < 3 {
                    return Err(EngineError::FileCorrupt(format!(
                        "short cube registry line: '{line}'"
                    )));
                }
                registry.cubes.push((
                    parse_u32(&fields[0], "cube id")?,
                    fields[1].clone(),
                    parse_ids(&fields[2])?,
                ));
            }
        }
    }
    Ok(Some(registry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dimension_round_trip() {
        let temp = TempDir::new().unwrap();
        let mut dim = Dimension::new(3, "region").unwrap();
        let a = dim.add_element("north", ElementKind::Numeric).unwrap();
        let b = dim.add_element("south", ElementKind::Numeric).unwrap();
        let s = dim.add_element("label", ElementKind::Str).unwrap();
        let t = dim.add_element("total", ElementKind::Numeric).unwrap();
        dim.add_children(t, &[(a, 1.0), (b, 2.5)]).unwrap();
        dim.add_children(t, &[(s, 1.0)]).unwrap();

        save_dimension(temp.path(), &dim).unwrap();
        let loaded = load_dimension(temp.path(), 3).unwrap();

        assert_eq!(loaded.name(), "region");
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.element_by_name("south").unwrap().id, b);
        assert_eq!(loaded.children(t), dim.children(t));
        assert_eq!(loaded.element(t).unwrap().kind, ElementKind::Consolidated);
        assert!(loaded.is_string_consolidation(t));
        assert_eq!(
            loaded.base_elements(t).unwrap(),
            dim.base_elements(t).unwrap()
        );
    }

    #[test]
    fn test_cube_round_trip() {
        let temp = TempDir::new().unwrap();
        let cube = Cube::new(7, "sales", vec![0, 1]).unwrap();
        let storage = MixedStorage::new();
        storage.set_cell(&[0, 1], CellValue::Numeric(42.0), Some(2));
        storage.set_cell(&[1, 0], CellValue::Str("west; coast".into()), None);
        let rules = vec![(1, "['total'] = ['a'] + ['b']".to_string())];

        save_cube(temp.path(), &cube, &storage, &rules).unwrap();
        let loaded = load_cube(temp.path(), 7).unwrap();

        assert_eq!(loaded.cube.name(), "sales");
        assert_eq!(loaded.cube.dimension_ids(), &[0, 1]);
        assert_eq!(loaded.cells.len(), 2);
        assert!(loaded
            .cells
            .contains(&(vec![0, 1], CellValue::Numeric(42.0), Some(2))));
        assert!(loaded
            .cells
            .contains(&(vec![1, 0], CellValue::Str("west; coast".into()), None)));
        assert_eq!(loaded.rules, rules);
    }

    #[test]
    fn test_registry_round_trip() {
        let temp = TempDir::new().unwrap();
        let registry = Registry {
            last_saved: 1_700_000_000,
            dimensions: vec![(0, "region".into()), (2, "time".into())],
            cubes: vec![(0, "sales".into(), vec![0, 2])],
        };
        save_registry(temp.path(), &registry).unwrap();
        let loaded = load_registry(temp.path()).unwrap().unwrap();
        assert_eq!(loaded, registry);
    }

    #[test]
    fn test_crc_detects_corruption() {
        let temp = TempDir::new().unwrap();
        let dim = Dimension::new(0, "d").unwrap();
        save_dimension(temp.path(), &dim).unwrap();
        let path = temp.path().join("dimension_0.csv");
        let tampered = fs::read_to_string(&path)
            .unwrap()
            .replace("cubist", "corrupt");
        fs::write(&path, tampered).unwrap();
        assert!(matches!(
            load_dimension(temp.path(), 0),
            Err(EngineError::FileCorrupt(_))
        ));
    }

    #[test]
    fn test_missing_registry_is_fresh() {
        let temp = TempDir::new().unwrap();
        assert!(load_registry(temp.path()).unwrap().is_none());
    }
}
