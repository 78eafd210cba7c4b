use std::{cmp, ops};

use crate::{Database, DbResult};

impl Database {
    /// Walk one key partition of `table` from the top, in reverse key order
    ///
    /// With a `cursor`, the walk starts strictly below the key the cursor
    /// maps to. On a `(partition, created_at, id)` key this is exactly the
    /// `created_at < c.created_at OR (created_at = c.created_at AND id < c.id)`
    /// keyset predicate.
    pub fn paginate_table_partition_rev<K, V, C, R>(
        table: &impl redb_bincode::ReadableTable<K, V>,
        prefix: ops::RangeInclusive<K>,
        cursor_to_key: impl Fn(C) -> K,
        cursor: Option<C>,
        limit: usize,
        filter_fn: impl Fn(K, V) -> DbResult<Option<R>>,
    ) -> DbResult<Vec<R>>
    where
        K: bincode::Decode + bincode::Encode + cmp::Ord,
        V: bincode::Decode + bincode::Encode,
    {
        let mut ret = vec![];

        let (prefix_start, prefix_end) = prefix.into_inner();

        let range = if let Some(cursor) = cursor {
            let end = cursor_to_key(cursor).min(prefix_end);
            table.range(&prefix_start..&end)?
        } else {
            table.range(&prefix_start..=&prefix_end)?
        };

        for entry in range.rev() {
            if limit <= ret.len() {
                break;
            }
            let (k, v) = entry?;

            if let Some(r) = filter_fn(k.value(), v.value())? {
                ret.push(r);
            }
        }

        Ok(ret)
    }

    /// Walk one key partition of `table` in key order
    ///
    /// With a `cursor`, the walk starts strictly above the key the cursor
    /// maps to.
    pub fn paginate_table_partition<K, V, C, R>(
        table: &impl redb_bincode::ReadableTable<K, V>,
        prefix: ops::RangeInclusive<K>,
        cursor_to_key: impl Fn(C) -> K,
        cursor: Option<C>,
        limit: usize,
        filter_fn: impl Fn(K, V) -> DbResult<Option<R>>,
    ) -> DbResult<Vec<R>>
    where
        K: bincode::Decode + bincode::Encode + cmp::Ord,
        V: bincode::Decode + bincode::Encode,
    {
        let mut ret = vec![];

        let (prefix_start, prefix_end) = prefix.into_inner();

        let after = cursor.map(cursor_to_key);
        if after.as_ref().is_some_and(|after| prefix_end < *after) {
            return Ok(ret);
        }
        let start = match &after {
            Some(after) if prefix_start < *after => after,
            _ => &prefix_start,
        };

        for entry in table.range(start..=&prefix_end)? {
            if limit <= ret.len() {
                break;
            }
            let (k, v) = entry?;
            let k = k.value();
            if after.as_ref() == Some(&k) {
                continue;
            }

            if let Some(r) = filter_fn(k, v.value())? {
                ret.push(r);
            }
        }

        Ok(ret)
    }
}

#[cfg(test)]
mod tests;
