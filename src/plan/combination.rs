//! Combination Processor
//!
//! K-way ordered merge of child streams. Children are pulled in lockstep and
//! the smallest current key is emitted; when several children sit on the same
//! key, the later child wins and all of them advance past that key on the
//! following `next()`.

use std::cmp::Ordering;

use crate::cell::CellValue;
use crate::ident::{compare_keys, IdentifierType, RuleId, EMPTY_KEY};
use crate::stream::CellStream;

pub struct CombinationProcessor {
    children: Vec<Box<dyn CellStream>>,
    /// child has a current record
    live: Vec<bool>,
    /// index of the child currently emitted, if any
    current: Option<usize>,
    started: bool,
}

impl CombinationProcessor {
    pub fn new(children: Vec<Box<dyn CellStream>>) -> Self {
        let live = vec![false; children.len()];
        CombinationProcessor {
            children,
            live,
            current: None,
            started: false,
        }
    }

    /// Choose the smallest live key; ties resolve to the highest child index
    /// so later children override earlier ones.
    fn elect(&mut self) -> bool {
        let mut winner: Option<usize> = None;
        for idx in 0..self.children.len() {
            if !self.live[idx] {
                continue;
            }
            match winner {
                None => winner = Some(idx),
                Some(w) => {
                    let ord = compare_keys(self.children[idx].key(), self.children[w].key());
                    if ord != Ordering::Greater {
                        winner = Some(idx);
                    }
                }
            }
        }
        self.current = winner;
        winner.is_some()
    }
}

impl CellStream for CombinationProcessor {
    fn next(&mut self) -> bool {
        if !self.started {
            self.started = true;
            for idx in 0..self.children.len() {
                self.live[idx] = self.children[idx].next();
            }
            return self.elect();
        }
        let Some(cur) = self.current else {
            return false;
        };
        let emitted = self.children[cur].key().to_vec();
        for idx in 0..self.children.len() {
            if self.live[idx] && compare_keys(self.children[idx].key(), &emitted) == Ordering::Equal
            {
                self.live[idx] = self.children[idx].next();
            }
        }
        self.elect()
    }

    fn move_to(&mut self, key: &[IdentifierType], found: &mut bool) -> bool {
        self.started = true;
        for idx in 0..self.children.len() {
            let mut child_found = false;
            self.live[idx] = self.children[idx].move_to(key, &mut child_found);
        }
        let has = self.elect();
        *found = has
            && self
                .current
                .is_some_and(|c| compare_keys(self.children[c].key(), key) == Ordering::Equal);
        has
    }

    fn reset(&mut self) {
        for child in &mut self.children {
            child.reset();
        }
        self.live.iter_mut().for_each(|l| *l = false);
        self.current = None;
        self.started = false;
    }

    fn key(&self) -> &[IdentifierType] {
        match self.current {
            Some(c) => self.children[c].key(),
            None => EMPTY_KEY,
        }
    }

    fn value(&self) -> CellValue {
        match self.current {
            Some(c) => self.children[c].value(),
            None => CellValue::Empty,
        }
    }

    fn value_f64(&self) -> f64 {
        self.current.map_or(0.0, |c| self.children[c].value_f64())
    }

    fn rule_id(&self) -> Option<RuleId> {
        self.current.and_then(|c| self.children[c].rule_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{collect_stream, VecStream};

    fn stream(records: &[(&[IdentifierType], f64)]) -> Box<dyn CellStream> {
        Box::new(VecStream::new(
            records
                .iter()
                .map(|(k, v)| (k.to_vec(), CellValue::Numeric(*v)))
                .collect(),
        ))
    }

    #[test]
    fn test_merge_preserves_order() {
        let a = stream(&[(&[1, 1], 1.0), (&[2, 1], 3.0)]);
        let b = stream(&[(&[1, 2], 2.0), (&[3, 1], 4.0)]);
        let mut merged = CombinationProcessor::new(vec![a, b]);
        let out = collect_stream(&mut merged);
        let keys: Vec<_> = out.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![vec![1, 1], vec![1, 2], vec![2, 1], vec![3, 1]]);
    }

    #[test]
    fn test_later_child_overrides_duplicates() {
        let a = stream(&[(&[1], 1.0), (&[2], 2.0)]);
        let b = stream(&[(&[2], 20.0)]);
        let mut merged = CombinationProcessor::new(vec![a, b]);
        let out = collect_stream(&mut merged);
        assert_eq!(
            out,
            vec![
                (vec![1], CellValue::Numeric(1.0)),
                (vec![2], CellValue::Numeric(20.0)),
            ]
        );
    }

    #[test]
    fn test_move_to_across_children() {
        let a = stream(&[(&[1], 1.0), (&[4], 4.0)]);
        let b = stream(&[(&[2], 2.0)]);
        let mut merged = CombinationProcessor::new(vec![a, b]);
        let mut found = false;
        assert!(merged.move_to(&[2], &mut found));
        assert!(found);
        assert_eq!(merged.key(), &[2]);
        assert!(merged.next());
        assert_eq!(merged.key(), &[4]);
    }
}
