//! Reorders pending row operations so that foreign-key references between rows
//! of one save pass are respected.
//!
//! Row-backed and query-backed operations form separate contiguous blocks that
//! never move relative to each other. Inside a row block a pending insert moves
//! in front of the first earlier row that references it, and a pending delete
//! moves in front of the first earlier deleted row it references.

use crate::{
    op::{RowUpdateInfo, UpdateInfo},
    row::ColumnKind,
};

/// Pairwise dependency sort over one save pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyOrderer;

impl DependencyOrderer {
    /// Orders `infos` for execution, or for undoing when `rollback` is set.
    ///
    /// A rollback ordering reverses every block and then the block sequence.
    pub fn order(infos: Vec<UpdateInfo>, rollback: bool) -> Vec<UpdateInfo> {
        let mut blocks: Vec<Vec<UpdateInfo>> = Vec::new();
        for info in infos {
            match blocks.last_mut() {
                Some(block) if block[0].is_row() == info.is_row() => block.push(info),
                _ => blocks.push(vec![info]),
            }
        }

        for block in &mut blocks {
            if block[0].is_row() {
                reorder_rows(block);
            }
            if rollback {
                block.reverse();
            }
        }
        if rollback {
            blocks.reverse();
        }
        blocks.into_iter().flatten().collect()
    }
}

fn reorder_rows(al: &mut Vec<UpdateInfo>) {
    let mut prev_i = None;
    let mut i = al.len();
    while i > 1 {
        i -= 1;
        let Some(row) = al[i].as_row() else {
            continue;
        };

        let target = if row.deleting {
            (0..i).find(|&k| {
                al[k]
                    .as_row()
                    .is_some_and(|other| other.deleting && references(row, other))
            })
        } else if !row.exists {
            (0..i).find(|&k| al[k].as_row().is_some_and(|other| references(other, row)))
        } else {
            None
        };

        if let Some(k) = target {
            let moved = al.remove(i);
            al.insert(k, moved);
            // Re-examine position i unless it already moved once; breaks cycles.
            if prev_i != Some(i) {
                prev_i = Some(i);
                i += 1;
            }
        }
    }
}

/// True when a column value of `from` holds a primary-key value of `to`.
pub fn references(from: &RowUpdateInfo, to: &RowUpdateInfo) -> bool {
    if from.row == to.row {
        return false;
    }

    for p in to.table.pk_indexes() {
        let Some(pk_value) = to.values.get(p) else {
            continue;
        };
        if pk_value.is_null() {
            continue;
        }
        // pk copied from another row's pending identity
        if pk_value.ident_row().is_some_and(|owner| owner != to.row) {
            continue;
        }
        let pk_column = &to.table.columns[p];

        for (l, value) in from.values.iter().enumerate() {
            let Some(column) = from.table.columns.get(l) else {
                continue;
            };
            let foreign_ident = value.ident_row().is_some_and(|owner| owner != from.row);
            if (column.pk && !foreign_ident) || value.is_null() {
                continue;
            }

            let same = match (value.ident_row(), pk_value.ident_row()) {
                (Some(a), Some(b)) => a == b,
                (Some(_), None) | (None, Some(_)) => false,
                (None, None) if pk_column.kind == ColumnKind::Uuid => {
                    value.as_uuid().is_some() && value.as_uuid() == pk_value.as_uuid()
                }
                (None, None) => {
                    column.references.as_deref() == Some(to.table.name.as_str()) && value == pk_value
                }
            };
            if same {
                return true;
            }
        }
    }
    false
}
