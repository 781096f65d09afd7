//! Dimension Model
//!
//! Elements, the parent/child consolidation multigraph, and the derived
//! structures queries depend on: topological order, level/indent/depth, and
//! the weighted base-element expansion of every consolidated element.
//!
//! Structural mutations invalidate the derived state; the next query path
//! that needs it triggers a topological sort and a post-order recomputation.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::area::Set;
use crate::error::{EngineError, Result};
use crate::ident::{DimensionId, IdentifierType};

/// Element identifier within a dimension
pub type ElementId = IdentifierType;

/// Element kind. Codes match the snapshot file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    Numeric,
    Str,
    Consolidated,
}

impl ElementKind {
    pub fn code(self) -> u32 {
        match self {
            ElementKind::Numeric => 1,
            ElementKind::Str => 2,
            ElementKind::Consolidated => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ElementKind::Numeric),
            2 => Some(ElementKind::Str),
            4 => Some(ElementKind::Consolidated),
            _ => None,
        }
    }
}

/// A dimension element. `position` is the dense client-visible ordering.
#[derive(Debug, Clone)]
pub struct Element {
    pub id: ElementId,
    pub name: String,
    pub position: u32,
    pub kind: ElementKind,
}

/// Derived structures, recomputed lazily after structural changes.
#[derive(Debug, Default)]
struct Derived {
    valid_sorted: bool,
    valid_level: bool,
    valid_base: bool,
    /// Topological order, parents before children.
    sorted: Vec<ElementId>,
    level: HashMap<ElementId, u32>,
    indent: HashMap<ElementId, u32>,
    depth: HashMap<ElementId, u32>,
    base: HashMap<ElementId, Arc<Vec<(ElementId, f64)>>>,
    max_level: u32,
    max_indent: u32,
    max_depth: u32,
}

/// Hierarchical dimension: element table plus the consolidation DAG.
pub struct Dimension {
    id: DimensionId,
    name: String,
    elements: HashMap<ElementId, Element>,
    by_name: HashMap<String, ElementId>,
    by_position: Vec<ElementId>,
    free_ids: BTreeSet<ElementId>,
    /// parent -> ordered (child, weight) pairs
    children: HashMap<ElementId, Vec<(ElementId, f64)>>,
    /// child -> ordered parents
    parents: HashMap<ElementId, Vec<ElementId>>,
    /// consolidated elements with a string or string-consolidated descendant
    string_consolidations: HashSet<ElementId>,
    /// monotonic change token, consumed by cache fingerprints
    token: u64,
    derived: Mutex<Derived>,
}

impl Dimension {
    pub fn new(id: DimensionId, name: &str) -> Result<Self> {
        check_name(name)?;
        Ok(Dimension {
            id,
            name: name.to_string(),
            elements: HashMap::new(),
            by_name: HashMap::new(),
            by_position: Vec::new(),
            free_ids: BTreeSet::new(),
            children: HashMap::new(),
            parents: HashMap::new(),
            string_consolidations: HashSet::new(),
            token: 0,
            derived: Mutex::new(Derived::default()),
        })
    }

    pub fn id(&self) -> DimensionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        self.name = name.to_string();
        self.bump_token();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Monotonic structural-change token.
    pub fn token(&self) -> u64 {
        self.token
    }

    fn bump_token(&mut self) {
        self.token += 1;
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn element(&self, id: ElementId) -> Result<&Element> {
        self.elements.get(&id).ok_or(EngineError::UnknownId(id))
    }

    pub fn element_by_name(&self, name: &str) -> Result<&Element> {
        let id = self
            .by_name
            .get(name)
            .ok_or_else(|| EngineError::ElementNotFound(name.to_string()))?;
        self.element(*id)
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.elements.contains_key(&id)
    }

    /// Element ids in position order.
    pub fn ids_by_position(&self) -> &[ElementId] {
        &self.by_position
    }

    /// All element ids as a sorted set, for resolving "all" selectors.
    pub fn all_ids(&self) -> Set {
        self.elements.keys().copied().collect()
    }

    pub fn children(&self, id: ElementId) -> &[(ElementId, f64)] {
        self.children.get(&id).map_or(&[], |v| v.as_slice())
    }

    pub fn parents(&self, id: ElementId) -> &[ElementId] {
        self.parents.get(&id).map_or(&[], |v| v.as_slice())
    }

    pub fn is_base(&self, id: ElementId) -> bool {
        self.elements
            .get(&id)
            .is_some_and(|e| e.kind != ElementKind::Consolidated)
    }

    pub fn is_string_consolidation(&self, id: ElementId) -> bool {
        self.string_consolidations.contains(&id)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Add a base element. The new id is the smallest unused id at or above
    /// the current element count; deleted ids are kept in the free set but
    /// fresh ids are preferred.
    pub fn add_element(&mut self, name: &str, kind: ElementKind) -> Result<ElementId> {
        check_name(name)?;
        if self.by_name.contains_key(name) {
            return Err(EngineError::NameInUse(name.to_string()));
        }
        if kind == ElementKind::Consolidated {
            return Err(EngineError::TypeMismatch(
                "consolidated elements are created by add_children".to_string(),
            ));
        }
        let mut id = self.elements.len() as ElementId;
        while self.elements.contains_key(&id) {
            id += 1;
        }
        self.free_ids.remove(&id);
        let position = self.by_position.len() as u32;
        self.elements.insert(
            id,
            Element {
                id,
                name: name.to_string(),
                position,
                kind,
            },
        );
        self.by_name.insert(name.to_string(), id);
        self.by_position.push(id);
        self.bump_token();
        self.invalidate_derived();
        Ok(id)
    }

    pub fn rename_element(&mut self, id: ElementId, name: &str) -> Result<()> {
        check_name(name)?;
        let old = self.element(id)?.name.clone();
        if old == name {
            return Ok(());
        }
        if self.by_name.contains_key(name) {
            return Err(EngineError::NameInUse(name.to_string()));
        }
        self.by_name.remove(&old);
        self.by_name.insert(name.to_string(), id);
        if let Some(e) = self.elements.get_mut(&id) {
            e.name = name.to_string();
        }
        self.bump_token();
        Ok(())
    }

    /// Change a base element's kind. A consolidated element first loses its
    /// children; a base element cannot become consolidated directly (only
    /// `add_children` creates consolidations).
    pub fn change_kind(&mut self, id: ElementId, kind: ElementKind) -> Result<()> {
        let current = self.element(id)?.kind;
        if current == kind {
            return Ok(());
        }
        if kind == ElementKind::Consolidated {
            return Err(EngineError::TypeMismatch(
                "consolidated elements are created by add_children".to_string(),
            ));
        }
        if current == ElementKind::Consolidated {
            self.remove_children(id, None)?;
        }
        if let Some(e) = self.elements.get_mut(&id) {
            e.kind = kind;
        }
        self.recompute_string_consolidations();
        self.bump_token();
        self.invalidate_derived();
        Ok(())
    }

    /// Move an element to a new dense position, shifting the elements in
    /// between.
    pub fn move_element(&mut self, id: ElementId, position: u32) -> Result<()> {
        let old_pos = self.element(id)?.position as usize;
        let new_pos = position as usize;
        if new_pos >= self.by_position.len() {
            return Err(EngineError::InvalidPosition {
                position,
                size: self.by_position.len() as u32,
            });
        }
        let moved = self.by_position.remove(old_pos);
        self.by_position.insert(new_pos, moved);
        let lo = old_pos.min(new_pos);
        let hi = old_pos.max(new_pos);
        for pos in lo..=hi {
            let eid = self.by_position[pos];
            if let Some(e) = self.elements.get_mut(&eid) {
                e.position = pos as u32;
            }
        }
        self.bump_token();
        Ok(())
    }

    /// Attach weighted children to a parent, converting it to a consolidated
    /// element. Duplicate (parent, child) pairs update the weight in place.
    pub fn add_children(&mut self, parent: ElementId, pairs: &[(ElementId, f64)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let parent_name = self.element(parent)?.name.clone();
        let mut seen = HashSet::new();
        for (child, _) in pairs {
            self.element(*child)?;
            if *child == parent {
                return Err(EngineError::CircularReference(parent_name));
            }
            if !seen.insert(*child) {
                return Err(EngineError::NameInUse(format!(
                    "element {child} listed twice in children"
                )));
            }
        }
        // DFS from each prospective child; reaching the parent means a cycle
        for (child, _) in pairs {
            if self.reaches(*child, parent) {
                return Err(EngineError::CircularReference(parent_name));
            }
        }

        if let Some(e) = self.elements.get_mut(&parent) {
            e.kind = ElementKind::Consolidated;
        }

        let mut has_string_child = false;
        for (child, weight) in pairs {
            let kind = self.elements[child].kind;
            has_string_child = has_string_child
                || kind == ElementKind::Str
                || self.string_consolidations.contains(child);

            let list = self.children.entry(parent).or_default();
            if let Some(entry) = list.iter_mut().find(|(c, _)| c == child) {
                entry.1 = *weight;
                continue;
            }
            list.push((*child, *weight));
            let parent_list = self.parents.entry(*child).or_default();
            if !parent_list.contains(&parent) {
                parent_list.push(parent);
            }
        }

        if has_string_child && !self.string_consolidations.contains(&parent) {
            self.mark_string_consolidation(parent);
        }

        self.bump_token();
        self.invalidate_derived();
        debug!(dimension = %self.name, parent, count = pairs.len(), "children added");
        Ok(())
    }

    /// Remove specific children (or all, when `which` is `None`). A parent
    /// left childless becomes numeric.
    pub fn remove_children(&mut self, parent: ElementId, which: Option<&[ElementId]>) -> Result<()> {
        self.element(parent)?;
        let Some(list) = self.children.get_mut(&parent) else {
            return Ok(());
        };
        let removed: Vec<ElementId> = match which {
            None => {
                let all = list.iter().map(|(c, _)| *c).collect();
                list.clear();
                all
            }
            Some(ids) => {
                let doomed: HashSet<ElementId> = ids.iter().copied().collect();
                let removed = list
                    .iter()
                    .filter(|(c, _)| doomed.contains(c))
                    .map(|(c, _)| *c)
                    .collect();
                list.retain(|(c, _)| !doomed.contains(c));
                removed
            }
        };
        if self.children.get(&parent).is_some_and(Vec::is_empty) {
            self.children.remove(&parent);
            if let Some(e) = self.elements.get_mut(&parent) {
                e.kind = ElementKind::Numeric;
            }
        }
        for child in removed {
            if let Some(parent_list) = self.parents.get_mut(&child) {
                parent_list.retain(|p| *p != parent);
                if parent_list.is_empty() {
                    self.parents.remove(&child);
                }
            }
        }
        self.recompute_string_consolidations();
        self.bump_token();
        self.invalidate_derived();
        Ok(())
    }

    /// Delete a single element: unlink every edge it participates in, shift
    /// positions above it down, and return its id to the free set. Parents
    /// left childless become numeric.
    pub fn delete_element(&mut self, id: ElementId) -> Result<()> {
        self.element(id)?;
        self.unlink_element(id);
        let pos = self.elements[&id].position as usize;
        self.by_position.remove(pos);
        for p in pos..self.by_position.len() {
            let eid = self.by_position[p];
            if let Some(e) = self.elements.get_mut(&eid) {
                e.position = p as u32;
            }
        }
        let element = self.elements.remove(&id).expect("checked above");
        self.by_name.remove(&element.name);
        self.free_ids.insert(id);
        self.recompute_string_consolidations();
        self.bump_token();
        self.invalidate_derived();
        Ok(())
    }

    /// Batched delete with a single position sweep. Semantically identical to
    /// sequential single deletes, but position renumbering runs once over the
    /// surviving elements instead of once per deleted id.
    pub fn delete_elements(&mut self, ids: &[ElementId]) -> Result<()> {
        for id in ids {
            self.element(*id)?;
        }
        let doomed: HashSet<ElementId> = ids.iter().copied().collect();
        for id in &doomed {
            self.unlink_element(*id);
        }
        self.by_position.retain(|eid| !doomed.contains(eid));
        for (p, eid) in self.by_position.iter().enumerate() {
            if let Some(e) = self.elements.get_mut(eid) {
                e.position = p as u32;
            }
        }
        for id in &doomed {
            if let Some(element) = self.elements.remove(id) {
                self.by_name.remove(&element.name);
                self.free_ids.insert(*id);
            }
        }
        self.recompute_string_consolidations();
        self.bump_token();
        self.invalidate_derived();
        Ok(())
    }

    /// Remove every element and edge.
    pub fn clear_elements(&mut self) {
        self.elements.clear();
        self.by_name.clear();
        self.by_position.clear();
        self.free_ids.clear();
        self.children.clear();
        self.parents.clear();
        self.string_consolidations.clear();
        self.bump_token();
        self.invalidate_derived();
    }

    fn unlink_element(&mut self, id: ElementId) {
        // edges where `id` is a child
        if let Some(parent_list) = self.parents.remove(&id) {
            for parent in parent_list {
                if let Some(list) = self.children.get_mut(&parent) {
                    list.retain(|(c, _)| *c != id);
                    if list.is_empty() {
                        self.children.remove(&parent);
                        if let Some(e) = self.elements.get_mut(&parent) {
                            e.kind = ElementKind::Numeric;
                        }
                    }
                }
            }
        }
        // edges where `id` is a parent
        if let Some(child_list) = self.children.remove(&id) {
            for (child, _) in child_list {
                if let Some(parent_list) = self.parents.get_mut(&child) {
                    parent_list.retain(|p| *p != id);
                    if parent_list.is_empty() {
                        self.parents.remove(&child);
                    }
                }
            }
        }
        self.string_consolidations.remove(&id);
    }

    fn reaches(&self, from: ElementId, target: ElementId) -> bool {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(list) = self.children.get(&current) {
                stack.extend(list.iter().map(|(c, _)| *c));
            }
        }
        false
    }

    fn mark_string_consolidation(&mut self, id: ElementId) {
        if !self.string_consolidations.insert(id) {
            return;
        }
        let parent_list: Vec<ElementId> = self.parents(id).to_vec();
        for parent in parent_list {
            self.mark_string_consolidation(parent);
        }
    }

    fn recompute_string_consolidations(&mut self) {
        self.string_consolidations.clear();
        let order = self.topological_order_internal();
        for id in order.iter().rev() {
            let Some(list) = self.children.get(id) else {
                continue;
            };
            let is_string = list.iter().any(|(c, _)| {
                self.elements.get(c).is_some_and(|e| e.kind == ElementKind::Str)
                    || self.string_consolidations.contains(c)
            });
            if is_string {
                self.string_consolidations.insert(*id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Derived state
    // ------------------------------------------------------------------

    fn invalidate_derived(&self) {
        let mut derived = self.derived.lock();
        derived.valid_sorted = false;
        derived.valid_level = false;
        derived.valid_base = false;
    }

    /// Kahn topological sort, parents before children. Deterministic: ties
    /// break on element id.
    fn topological_order_internal(&self) -> Vec<ElementId> {
        let mut in_degree: HashMap<ElementId, usize> = self
            .elements
            .keys()
            .map(|id| (*id, self.parents(*id).len()))
            .collect();
        let mut queue: VecDeque<ElementId> = {
            let mut roots: Vec<ElementId> = in_degree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(id, _)| *id)
                .collect();
            roots.sort_unstable();
            roots.into()
        };
        let mut order = Vec::with_capacity(self.elements.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for (child, _) in self.children(id) {
                if let Some(d) = in_degree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }
        order
    }

    fn ensure_sorted(&self, derived: &mut Derived) {
        if derived.valid_sorted {
            return;
        }
        derived.sorted = self.topological_order_internal();
        derived.valid_sorted = true;
    }

    fn ensure_level(&self, derived: &mut Derived) {
        if derived.valid_level {
            return;
        }
        self.ensure_sorted(derived);
        derived.level.clear();
        derived.indent.clear();
        derived.depth.clear();
        derived.max_level = 0;
        derived.max_indent = 0;
        derived.max_depth = 0;

        // level: longest path to a leaf, children first
        let sorted = derived.sorted.clone();
        for id in sorted.iter().rev() {
            let mut level = 0;
            for (child, _) in self.children(*id) {
                let l = derived.level.get(child).copied().unwrap_or(0);
                if level <= l {
                    level = l + 1;
                }
            }
            derived.max_level = derived.max_level.max(level);
            derived.level.insert(*id, level);
        }
        // depth: longest path from a root; indent: first-parent chain
        for id in &sorted {
            let parents = self.parents(*id);
            let mut depth = 0;
            let mut indent = 1;
            for parent in parents {
                let d = derived.depth.get(parent).copied().unwrap_or(0);
                if depth <= d {
                    depth = d + 1;
                }
            }
            if let Some(first) = parents.first() {
                indent = derived.indent.get(first).copied().unwrap_or(1) + 1;
            }
            derived.max_depth = derived.max_depth.max(depth);
            derived.max_indent = derived.max_indent.max(indent);
            derived.depth.insert(*id, depth);
            derived.indent.insert(*id, indent);
        }
        derived.valid_level = true;
    }

    fn ensure_base(&self, derived: &mut Derived) {
        if derived.valid_base {
            return;
        }
        self.ensure_sorted(derived);
        derived.base.clear();
        let sorted = derived.sorted.clone();
        for id in sorted.iter().rev() {
            let list = self.children(*id);
            if list.is_empty() {
                derived.base.insert(*id, Arc::new(vec![(*id, 1.0)]));
                continue;
            }
            let mut acc: HashMap<ElementId, f64> = HashMap::new();
            for (child, weight) in list {
                if let Some(base) = derived.base.get(child) {
                    for (b, w) in base.iter() {
                        *acc.entry(*b).or_insert(0.0) += weight * w;
                    }
                }
            }
            let mut flat: Vec<(ElementId, f64)> = acc.into_iter().collect();
            flat.sort_unstable_by_key(|(b, _)| *b);
            derived.base.insert(*id, Arc::new(flat));
        }
        derived.valid_base = true;
    }

    /// Longest path to a leaf among descendants.
    pub fn level(&self, id: ElementId) -> Result<u32> {
        self.element(id)?;
        let mut derived = self.derived.lock();
        self.ensure_level(&mut derived);
        Ok(derived.level.get(&id).copied().unwrap_or(0))
    }

    /// Longest path from a root.
    pub fn depth(&self, id: ElementId) -> Result<u32> {
        self.element(id)?;
        let mut derived = self.derived.lock();
        self.ensure_level(&mut derived);
        Ok(derived.depth.get(&id).copied().unwrap_or(0))
    }

    /// First-parent chain length from the root.
    pub fn indent(&self, id: ElementId) -> Result<u32> {
        self.element(id)?;
        let mut derived = self.derived.lock();
        self.ensure_level(&mut derived);
        Ok(derived.indent.get(&id).copied().unwrap_or(1))
    }

    pub fn max_level(&self) -> u32 {
        let mut derived = self.derived.lock();
        self.ensure_level(&mut derived);
        derived.max_level
    }

    pub fn max_indent(&self) -> u32 {
        let mut derived = self.derived.lock();
        self.ensure_level(&mut derived);
        derived.max_indent
    }

    pub fn max_depth(&self) -> u32 {
        let mut derived = self.derived.lock();
        self.ensure_level(&mut derived);
        derived.max_depth
    }

    /// Weighted base-element expansion. Leaves map to themselves with
    /// weight 1; a consolidated element sums its children's expansions with
    /// weight multiplication, duplicate leaves merging their weights.
    pub fn base_elements(&self, id: ElementId) -> Result<Arc<Vec<(ElementId, f64)>>> {
        self.element(id)?;
        let mut derived = self.derived.lock();
        self.ensure_base(&mut derived);
        Ok(derived
            .base
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Arc::new(vec![(id, 1.0)])))
    }

    /// Topological order (parents before children), mostly for persistence.
    pub fn topological_order(&self) -> Vec<ElementId> {
        let mut derived = self.derived.lock();
        self.ensure_sorted(&mut derived);
        derived.sorted.clone()
    }

    /// Snapshot of every element's base expansion; the inner vectors are
    /// shared, so this is one `Arc` clone per element.
    pub fn base_map(&self) -> HashMap<ElementId, Arc<Vec<(ElementId, f64)>>> {
        let mut derived = self.derived.lock();
        self.ensure_base(&mut derived);
        derived.base.clone()
    }

    /// Snapshot of every element's kind.
    pub fn kind_map(&self) -> HashMap<ElementId, ElementKind> {
        self.elements.iter().map(|(id, e)| (*id, e.kind)).collect()
    }

    // ------------------------------------------------------------------
    // Raw construction for snapshot loading
    // ------------------------------------------------------------------

    /// Insert an element verbatim, bypassing validation; the loader owns the
    /// consistency of the file it reads.
    pub(crate) fn insert_raw(&mut self, element: Element) {
        let pos = element.position as usize;
        self.by_name.insert(element.name.clone(), element.id);
        if pos >= self.by_position.len() {
            self.by_position.resize(pos + 1, ElementId::MAX);
        }
        self.by_position[pos] = element.id;
        self.elements.insert(element.id, element);
        self.invalidate_derived();
    }

    pub(crate) fn set_children_raw(&mut self, parent: ElementId, pairs: Vec<(ElementId, f64)>) {
        for (child, _) in &pairs {
            let list = self.parents.entry(*child).or_default();
            if !list.contains(&parent) {
                list.push(parent);
            }
        }
        if !pairs.is_empty() {
            self.children.insert(parent, pairs);
        }
        self.invalidate_derived();
    }

    pub(crate) fn finish_raw_load(&mut self) {
        self.by_position.retain(|id| *id != ElementId::MAX);
        for (pos, id) in self.by_position.iter().enumerate() {
            if let Some(e) = self.elements.get_mut(id) {
                e.position = pos as u32;
            }
        }
        let used: BTreeSet<ElementId> = self.elements.keys().copied().collect();
        self.free_ids = (0..self.elements.len() as ElementId)
            .filter(|id| !used.contains(id))
            .collect();
        self.recompute_string_consolidations();
        self.invalidate_derived();
    }
}

/// Element and dimension name validation: non-empty, no surrounding
/// whitespace, no control characters.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::InvalidName("name is empty".to_string()));
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return Err(EngineError::InvalidName(format!(
            "'{name}' begins or ends with a space"
        )));
    }
    if name.chars().any(|c| (c as u32) < 32) {
        return Err(EngineError::InvalidName(format!(
            "'{name}' contains a control character"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dim_with(names: &[&str]) -> Dimension {
        let mut d = Dimension::new(0, "test").unwrap();
        for name in names {
            d.add_element(name, ElementKind::Numeric).unwrap();
        }
        d
    }

    #[test]
    fn test_add_element_ids_and_positions() {
        let d = dim_with(&["a", "b", "c"]);
        assert_eq!(d.element_by_name("a").unwrap().id, 0);
        assert_eq!(d.element_by_name("c").unwrap().position, 2);
    }

    #[test]
    fn test_name_rules() {
        let mut d = dim_with(&["a"]);
        assert!(matches!(
            d.add_element("a", ElementKind::Numeric),
            Err(EngineError::NameInUse(_))
        ));
        assert!(matches!(
            d.add_element("", ElementKind::Numeric),
            Err(EngineError::InvalidName(_))
        ));
        assert!(matches!(
            d.add_element(" padded", ElementKind::Numeric),
            Err(EngineError::InvalidName(_))
        ));
        assert!(matches!(
            d.add_element("ctl\u{1}char", ElementKind::Numeric),
            Err(EngineError::InvalidName(_))
        ));
    }

    #[test]
    fn test_consolidation_and_levels() {
        let mut d = dim_with(&["a", "b", "c", "t"]);
        let t = d.element_by_name("t").unwrap().id;
        d.add_children(t, &[(0, 1.0), (1, 1.0), (2, 1.0)]).unwrap();
        assert_eq!(d.element(t).unwrap().kind, ElementKind::Consolidated);
        assert_eq!(d.level(t).unwrap(), 1);
        assert_eq!(d.level(0).unwrap(), 0);
        assert_eq!(d.depth(0).unwrap(), 1);
        assert_eq!(d.depth(t).unwrap(), 0);
        assert_eq!(d.indent(0).unwrap(), 2);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut d = dim_with(&["a", "b", "t"]);
        let t = 2;
        d.add_children(t, &[(0, 1.0), (1, 1.0)]).unwrap();
        // t -> a; attempting a -> t closes a cycle
        assert!(matches!(
            d.add_children(0, &[(t, 1.0)]),
            Err(EngineError::CircularReference(_))
        ));
        // self-parenting
        assert!(matches!(
            d.add_children(t, &[(t, 1.0)]),
            Err(EngineError::CircularReference(_))
        ));
    }

    #[test]
    fn test_duplicate_child_updates_weight() {
        let mut d = dim_with(&["a", "t"]);
        d.add_children(1, &[(0, 1.0)]).unwrap();
        d.add_children(1, &[(0, 3.0)]).unwrap();
        assert_eq!(d.children(1), &[(0, 3.0)]);
        let base = d.base_elements(1).unwrap();
        assert_eq!(base.as_slice(), &[(0, 3.0)]);
    }

    #[test]
    fn test_base_elements_weighted_multipath() {
        let mut d = dim_with(&["a", "b", "m", "t"]);
        // m = a + b; t = 2*m + 1*a  => base(t) = {a: 3, b: 2}
        d.add_children(2, &[(0, 1.0), (1, 1.0)]).unwrap();
        d.add_children(3, &[(2, 2.0), (0, 1.0)]).unwrap();
        let base = d.base_elements(3).unwrap();
        assert_eq!(base.as_slice(), &[(0, 3.0), (1, 2.0)]);
    }

    #[test]
    fn test_delete_element_cascades() {
        let mut d = dim_with(&["a", "b", "t"]);
        d.add_children(2, &[(0, 1.0), (1, 1.0)]).unwrap();
        d.delete_element(0).unwrap();
        assert_eq!(d.children(2), &[(1, 1.0)]);
        // positions stay dense
        assert_eq!(d.element_by_name("b").unwrap().position, 0);
        assert_eq!(d.element_by_name("t").unwrap().position, 1);
        // deleting the last child turns the parent numeric
        d.delete_element(1).unwrap();
        assert_eq!(d.element(2).unwrap().kind, ElementKind::Numeric);
    }

    #[test]
    fn test_batched_delete_matches_sequential() {
        let mut a = dim_with(&["e0", "e1", "e2", "e3", "e4"]);
        let mut b = dim_with(&["e0", "e1", "e2", "e3", "e4"]);
        a.delete_element(1).unwrap();
        a.delete_element(3).unwrap();
        b.delete_elements(&[1, 3]).unwrap();
        let pa: Vec<(ElementId, u32)> = a
            .ids_by_position()
            .iter()
            .map(|id| (*id, a.element(*id).unwrap().position))
            .collect();
        let pb: Vec<(ElementId, u32)> = b
            .ids_by_position()
            .iter()
            .map(|id| (*id, b.element(*id).unwrap().position))
            .collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_string_consolidation_propagates() {
        let mut d = Dimension::new(0, "t").unwrap();
        d.add_element("s", ElementKind::Str).unwrap();
        d.add_element("m", ElementKind::Numeric).unwrap();
        d.add_element("top", ElementKind::Numeric).unwrap();
        d.add_children(1, &[(0, 1.0)]).unwrap();
        d.add_children(2, &[(1, 1.0)]).unwrap();
        assert!(d.is_string_consolidation(1));
        assert!(d.is_string_consolidation(2));
        d.remove_children(1, None).unwrap();
        assert!(!d.is_string_consolidation(2));
    }

    #[test]
    fn test_move_element() {
        let mut d = dim_with(&["a", "b", "c"]);
        d.move_element(2, 0).unwrap();
        let order: Vec<&str> = d
            .ids_by_position()
            .iter()
            .map(|id| d.element(*id).unwrap().name.as_str())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        for (pos, id) in d.ids_by_position().iter().enumerate() {
            assert_eq!(d.element(*id).unwrap().position as usize, pos);
        }
    }

    #[test]
    fn test_token_advances_on_structural_change() {
        let mut d = dim_with(&["a"]);
        let t0 = d.token();
        d.add_element("b", ElementKind::Numeric).unwrap();
        assert!(d.token() > t0);
    }
}
