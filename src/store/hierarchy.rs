//! Closure-table algebra for the chunk hierarchy.
//!
//! The closure table holds one row per ancestor/descendant pair, self-pairs
//! included, with the full path materialized. These helpers compute the row
//! sets that insert, move, and delete operations hand to the data layer;
//! they are pure so the arithmetic is testable without a backend.

use rustc_hash::FxHashSet;

use crate::errors::CoreError;
use crate::model::{Chunk, ChunkId, ClosureRow, MAX_HIERARCHY_DEPTH};

/// Closure rows for a fresh chunk inserted under `parent_ancestry`
/// (the parent's ancestor rows, self-row included; empty for a new root).
pub(crate) fn rows_for_insert(child: ChunkId, parent_ancestry: &[ClosureRow]) -> Vec<ClosureRow> {
    let mut rows = Vec::with_capacity(parent_ancestry.len() + 1);
    rows.push(ClosureRow::self_row(child));
    for ancestor_row in parent_ancestry {
        let mut path = ancestor_row.path.clone();
        path.push(child);
        rows.push(ClosureRow {
            ancestor_id: ancestor_row.ancestor_id,
            descendant_id: child,
            depth: ancestor_row.depth + 1,
            path,
        });
    }
    rows
}

/// The `(ancestor, descendant)` pairs that cross the subtree boundary:
/// old ancestors of the moved chunk × every member of its subtree. These
/// are exactly the rows a move must delete.
pub(crate) fn boundary_pairs(
    moved: ChunkId,
    old_ancestry: &[ClosureRow],
    subtree: &[ClosureRow],
) -> Vec<(ChunkId, ChunkId)> {
    let mut pairs = Vec::new();
    for ancestor_row in old_ancestry {
        if ancestor_row.ancestor_id == moved {
            continue;
        }
        for subtree_row in subtree {
            pairs.push((ancestor_row.ancestor_id, subtree_row.descendant_id));
        }
    }
    pairs
}

/// New cross-boundary rows after reparenting: the new parent's ancestry
/// (self-row included) × the moved subtree's internal rows.
pub(crate) fn rows_for_move(
    new_ancestry: &[ClosureRow],
    subtree: &[ClosureRow],
) -> Vec<ClosureRow> {
    let mut rows = Vec::with_capacity(new_ancestry.len() * subtree.len());
    for ancestor_row in new_ancestry {
        for subtree_row in subtree {
            let mut path = ancestor_row.path.clone();
            path.extend_from_slice(&subtree_row.path);
            rows.push(ClosureRow {
                ancestor_id: ancestor_row.ancestor_id,
                descendant_id: subtree_row.descendant_id,
                depth: ancestor_row.depth + 1 + subtree_row.depth,
                path,
            });
        }
    }
    rows
}

/// Height of a subtree given its internal closure rows (0 for a leaf).
pub(crate) fn subtree_height(subtree: &[ClosureRow]) -> u32 {
    subtree.iter().map(|row| row.depth).max().unwrap_or(0)
}

/// Checks the depth cap for placing a subtree of the given height under a
/// parent at `parent_indent`.
pub(crate) fn check_depth(parent_indent: u32, subtree_height: u32) -> Result<(), CoreError> {
    let deepest = parent_indent + 1 + subtree_height;
    if deepest > MAX_HIERARCHY_DEPTH {
        return Err(CoreError::validation_with(
            format!("hierarchy depth {deepest} exceeds the maximum of {MAX_HIERARCHY_DEPTH}"),
            serde_json::json!({ "max_depth": MAX_HIERARCHY_DEPTH, "attempted": deepest }),
        ));
    }
    Ok(())
}

/// True when `candidate` lies inside the subtree described by its internal
/// closure rows (used for cycle prevention before a move).
pub(crate) fn subtree_contains(subtree: &[ClosureRow], candidate: ChunkId) -> bool {
    subtree.iter().any(|row| row.descendant_id == candidate)
}

/// Orders subtree chunks parents-before-children so sequential writes
/// never leave a child visible without its parent.
pub(crate) fn topological(subtree_rows: &[ClosureRow], chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut by_depth: Vec<(u32, Chunk)> = chunks
        .into_iter()
        .map(|chunk| {
            let depth = subtree_rows
                .iter()
                .find(|row| row.descendant_id == chunk.id)
                .map(|row| row.depth)
                .unwrap_or(0);
            (depth, chunk)
        })
        .collect();
    by_depth.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then(a.1.sequence_number.cmp(&b.1.sequence_number))
            .then(a.1.id.cmp(&b.1.id))
    });
    by_depth.into_iter().map(|(_, chunk)| chunk).collect()
}

/// Validates the closure size law for a subtree: a tree of n nodes has
/// exactly one internal row per ordered ancestor/descendant pair on every
/// root-to-node chain. Used by tests and the consistency monitor.
pub(crate) fn closure_is_consistent(subtree: &[ClosureRow]) -> bool {
    let members: FxHashSet<ChunkId> = subtree.iter().map(|row| row.descendant_id).collect();
    // Every member needs a self-row, and every path must be well-formed.
    for id in &members {
        if !subtree
            .iter()
            .any(|row| row.descendant_id == *id && row.depth == 0)
        {
            return false;
        }
    }
    subtree.iter().all(|row| {
        row.path.len() as u32 == row.depth + 1
            && row.path.first() == Some(&row.ancestor_id)
            && row.path.last() == Some(&row.descendant_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::new_chunk_id;

    fn ancestry_chain(ids: &[ChunkId]) -> Vec<ClosureRow> {
        // Rows (a, last) for every prefix, as `ancestors_of(last)` returns.
        let last = *ids.last().unwrap();
        ids.iter()
            .enumerate()
            .map(|(i, a)| ClosureRow {
                ancestor_id: *a,
                descendant_id: last,
                depth: (ids.len() - 1 - i) as u32,
                path: ids[i..].to_vec(),
            })
            .collect()
    }

    #[test]
    fn insert_rows_extend_every_ancestor_path() {
        let root = new_chunk_id();
        let mid = new_chunk_id();
        let child = new_chunk_id();
        let parent_ancestry = ancestry_chain(&[root, mid]);

        let rows = rows_for_insert(child, &parent_ancestry);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], ClosureRow::self_row(child));

        let from_root = rows
            .iter()
            .find(|r| r.ancestor_id == root)
            .expect("row from root");
        assert_eq!(from_root.depth, 2);
        assert_eq!(from_root.path, vec![root, mid, child]);
    }

    #[test]
    fn move_rows_concatenate_paths_and_depths() {
        let new_root = new_chunk_id();
        let moved = new_chunk_id();
        let grandchild = new_chunk_id();

        let new_ancestry = ancestry_chain(&[new_root]);
        let subtree = vec![
            ClosureRow::self_row(moved),
            ClosureRow {
                ancestor_id: moved,
                descendant_id: grandchild,
                depth: 1,
                path: vec![moved, grandchild],
            },
        ];

        let rows = rows_for_move(&new_ancestry, &subtree);
        assert_eq!(rows.len(), 2);
        let deep = rows
            .iter()
            .find(|r| r.descendant_id == grandchild)
            .unwrap();
        assert_eq!(deep.depth, 2);
        assert_eq!(deep.path, vec![new_root, moved, grandchild]);
        assert!(closure_is_consistent(&rows));
    }

    #[test]
    fn boundary_pairs_exclude_subtree_internal_rows() {
        let root = new_chunk_id();
        let moved = new_chunk_id();
        let child = new_chunk_id();

        let old_ancestry = ancestry_chain(&[root, moved]);
        let subtree = vec![
            ClosureRow::self_row(moved),
            ClosureRow {
                ancestor_id: moved,
                descendant_id: child,
                depth: 1,
                path: vec![moved, child],
            },
        ];

        let pairs = boundary_pairs(moved, &old_ancestry, &subtree);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&(root, moved)));
        assert!(pairs.contains(&(root, child)));
    }

    #[test]
    fn depth_cap_enforced() {
        assert!(check_depth(98, 0).is_ok());
        assert!(check_depth(99, 0).is_ok());
        assert!(check_depth(100, 0).is_err());
        assert!(check_depth(97, 5).is_err());
    }

    #[test]
    fn subtree_contains_finds_descendants() {
        let a = new_chunk_id();
        let b = new_chunk_id();
        let subtree = vec![
            ClosureRow::self_row(a),
            ClosureRow {
                ancestor_id: a,
                descendant_id: b,
                depth: 1,
                path: vec![a, b],
            },
        ];
        assert!(subtree_contains(&subtree, b));
        assert!(!subtree_contains(&subtree, new_chunk_id()));
    }
}
