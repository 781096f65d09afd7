//! Persistence
//!
//! Per-database state is a directory of `;`-separated UTF-8 text files with
//! `#` comment lines and `[SECTION]` blocks: one file per dimension, one per
//! cube, a registry file, and a rotating sequence of journal files capturing
//! every mutation. Loading replays the snapshot first, then the journal
//! files in numeric order from the snapshot's last-saved timestamp.

pub mod journal;
pub mod snapshot;

use crate::error::{EngineError, Result};

/// Escape one CSV field: quote when it contains the separator, quotes, or a
/// newline; inner quotes double.
pub(crate) fn escape_field(field: &str) -> String {
    if field.contains(';') || field.contains('"') || field.contains('\n') || field.contains(',') {
        let mut out = String::with_capacity(field.len() + 2);
        out.push('"');
        for c in field.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
        out
    } else {
        field.to_string()
    }
}

/// Split a `;`-separated line honoring quoted fields.
pub(crate) fn split_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        if quoted {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    quoted = false;
                }
            } else {
                current.push(c);
            }
        } else {
            match c {
                '"' => quoted = true,
                ';' => {
                    fields.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
        }
    }
    fields.push(current);
    fields
}

/// Join a comma-separated list field.
pub(crate) fn join_ids<T: ToString>(ids: impl IntoIterator<Item = T>) -> String {
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a comma-separated list field.
pub(crate) fn parse_ids<T: std::str::FromStr>(field: &str) -> Result<Vec<T>> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split(',')
        .map(|part| {
            part.parse::<T>()
                .map_err(|_| EngineError::FileCorrupt(format!("bad list element '{part}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        for field in ["plain", "with;sep", "with\"quote", "a,b", ""] {
            let line = format!("{};tail", escape_field(field));
            let fields = split_line(&line);
            assert_eq!(fields[0], field);
            assert_eq!(fields[1], "tail");
        }
    }

    #[test]
    fn test_id_lists() {
        let joined = join_ids([1u32, 2, 3]);
        assert_eq!(joined, "1,2,3");
        let parsed: Vec<u32> = parse_ids(&joined).unwrap();
        assert_eq!(parsed, vec![1, 2, 3]);
        let empty: Vec<u32> = parse_ids("").unwrap();
        assert!(empty.is_empty());
    }
}
