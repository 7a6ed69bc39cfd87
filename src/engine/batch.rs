//! Merges compatible adjacent INSERT statements into multi-row inserts.

use hashbrown::HashSet;

use crate::op::Statement;

/// One statement sent to the executor and the input positions it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedStatement {
    /// Statement to execute.
    pub statement: Statement,
    /// Indexes into the unbatched input, in row order.
    pub members: Vec<usize>,
}

/// Adjacent-insert merger.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementBatcher;

impl StatementBatcher {
    /// Folds `statements` left to right, merging an insert into the previous
    /// output when [`can_merge`] allows it.
    pub fn batch(
        statements: Vec<Statement>,
        multi_insert_disallowed: &HashSet<String>,
    ) -> Vec<BatchedStatement> {
        let mut out: Vec<BatchedStatement> = Vec::with_capacity(statements.len());
        for (idx, stmt) in statements.into_iter().enumerate() {
            if let Some(last) = out.last_mut() {
                if can_merge(&last.statement, &stmt, multi_insert_disallowed) {
                    last.statement.rows.extend(stmt.rows);
                    last.statement.pks.extend(stmt.pks);
                    last.members.push(idx);
                    continue;
                }
            }
            out.push(BatchedStatement {
                statement: stmt,
                members: vec![idx],
            });
        }
        out
    }

    /// Every statement standalone.
    pub fn unbatched(statements: Vec<Statement>) -> Vec<BatchedStatement> {
        statements
            .into_iter()
            .enumerate()
            .map(|(idx, statement)| BatchedStatement {
                statement,
                members: vec![idx],
            })
            .collect()
    }
}

/// True when `source` may be appended to `target` as extra VALUES rows.
pub fn can_merge(target: &Statement, source: &Statement, multi_insert_disallowed: &HashSet<String>) -> bool {
    target.is_insert()
        && source.is_insert()
        && target.server == source.server
        && target.table == source.table
        && target.columns == source.columns
        && !multi_insert_disallowed.contains(&target.server)
        && target.has_explicit_pks()
        && source.has_explicit_pks()
        && target.pk_columns.len() == source.pk_columns.len()
        && target.filters == source.filters
        && !target.requery
        && !source.requery
        && !target.tracking
        && !source.tracking
        && target.transaction_id == source.transaction_id
        && target.identity_column == source.identity_column
        && target.data_type == source.data_type
}
