use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use snafu::{OptionExt as _, ensure};
use tracing::trace;

use crate::{
    DocumentPatch, Filter, Hit, IndexExistsSnafu, IndexMapping, IndexNotFoundSnafu, IndexResult,
    LOG_TARGET, PatchOutcome, SearchHits, SearchIndex, SearchQuery, SortOrder, UnavailableSnafu,
};

#[derive(Default)]
struct State {
    indices: HashMap<String, BTreeMap<String, Value>>,
    /// Indices that fail every operation
    failing: HashSet<String>,
    /// Artificial search latency per index
    slow: HashMap<String, Duration>,
    /// What searches see on indices with delayed visibility, as of the
    /// last refresh
    snapshots: HashMap<String, BTreeMap<String, Value>>,
}

/// In-process search index
///
/// Writes to a missing index create it, like a search engine with automatic
/// index creation would. Searching a missing index is an error.
#[derive(Default)]
pub struct MemoryIndex {
    state: Mutex<State>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every operation on `index` fail (or succeed again)
    pub fn set_failing(&self, index: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(index.to_owned());
        } else {
            state.failing.remove(index);
        }
    }

    /// Delay every search on `index`
    pub fn set_search_delay(&self, index: &str, delay: Option<Duration>) {
        let mut state = self.lock();
        match delay {
            Some(delay) => state.slow.insert(index.to_owned(), delay),
            None => state.slow.remove(index),
        };
    }

    /// Let searches on `index` only see writes made before the last
    /// [`SearchIndex::refresh`]
    pub fn set_delayed_visibility(&self, index: &str, delayed: bool) {
        let mut state = self.lock();
        if delayed {
            let snapshot = state.indices.get(index).cloned().unwrap_or_default();
            state.snapshots.insert(index.to_owned(), snapshot);
        } else {
            state.snapshots.remove(index);
        }
    }

    /// Number of documents in `index`
    pub fn len(&self, index: &str) -> usize {
        self.lock().indices.get(index).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.lock().indices.get(index)?.get(id).cloned()
    }

    fn check_available(state: &State, index: &str) -> IndexResult<()> {
        ensure!(
            !state.failing.contains(index),
            UnavailableSnafu {
                message: format!("index {index} is failing"),
            }
        );
        Ok(())
    }

    fn documents_mut<'s>(state: &'s mut State, index: &str) -> &'s mut BTreeMap<String, Value> {
        state.indices.entry(index.to_owned()).or_default()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn create_index(&self, index: &str, _mapping: &IndexMapping) -> IndexResult<()> {
        let mut state = self.lock();
        Self::check_available(&state, index)?;
        ensure!(
            !state.indices.contains_key(index),
            IndexExistsSnafu { index }
        );
        state.indices.insert(index.to_owned(), BTreeMap::new());
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> IndexResult<bool> {
        let state = self.lock();
        Self::check_available(&state, index)?;
        Ok(state.indices.contains_key(index))
    }

    async fn delete_index(&self, index: &str) -> IndexResult<bool> {
        let mut state = self.lock();
        Self::check_available(&state, index)?;
        Ok(state.indices.remove(index).is_some())
    }

    async fn index_document(&self, index: &str, id: &str, doc: Value) -> IndexResult<()> {
        let mut state = self.lock();
        Self::check_available(&state, index)?;
        trace!(target: LOG_TARGET, %index, %id, "Indexing document");
        Self::documents_mut(&mut state, index).insert(id.to_owned(), doc);
        Ok(())
    }

    async fn bulk_index(&self, index: &str, docs: Vec<(String, Value)>) -> IndexResult<()> {
        let mut state = self.lock();
        Self::check_available(&state, index)?;
        trace!(target: LOG_TARGET, %index, count = docs.len(), "Bulk indexing");
        Self::documents_mut(&mut state, index).extend(docs);
        Ok(())
    }

    async fn update_document(
        &self,
        index: &str,
        id: &str,
        patch: &DocumentPatch,
    ) -> IndexResult<PatchOutcome> {
        let mut state = self.lock();
        Self::check_available(&state, index)?;
        let Some(Value::Object(existing)) = state
            .indices
            .get_mut(index)
            .and_then(|docs| docs.get_mut(id))
        else {
            return Ok(PatchOutcome::Missing);
        };

        if let Some((field, incoming)) = &patch.guard {
            if let Some(stored) = existing.get(field) {
                if compare(stored, incoming) == Some(Ordering::Greater) {
                    return Ok(PatchOutcome::Stale);
                }
            }
        }
        existing.extend(patch.doc.clone());
        Ok(PatchOutcome::Updated)
    }

    async fn delete_document(&self, index: &str, id: &str) -> IndexResult<bool> {
        let mut state = self.lock();
        Self::check_available(&state, index)?;
        Ok(state
            .indices
            .get_mut(index)
            .and_then(|docs| docs.remove(id))
            .is_some())
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> IndexResult<SearchHits> {
        let delay = self.lock().slow.get(index).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        Self::check_available(&state, index)?;
        let docs = state
            .indices
            .get(index)
            .context(IndexNotFoundSnafu { index })?;
        let docs = state.snapshots.get(index).unwrap_or(docs);

        let mut matching: Vec<(&String, &Value)> = docs
            .iter()
            .filter(|(_, doc)| query.filters.iter().all(|f| matches(doc, f)))
            .collect();

        matching.sort_by(|(a_id, a), (b_id, b)| {
            for sort in &query.sort {
                let ord = compare_field(a, b, &sort.field);
                let ord = match sort.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a_id.cmp(b_id)
        });

        Ok(SearchHits {
            total: matching.len() as u64,
            hits: matching
                .into_iter()
                .skip(query.from)
                .take(query.size)
                .map(|(id, source)| Hit {
                    id: id.clone(),
                    source: source.clone(),
                })
                .collect(),
        })
    }

    async fn refresh(&self, index: &str) -> IndexResult<()> {
        let mut state = self.lock();
        Self::check_available(&state, index)?;
        let docs = state
            .indices
            .get(index)
            .context(IndexNotFoundSnafu { index })?
            .clone();
        if let Some(snapshot) = state.snapshots.get_mut(index) {
            *snapshot = docs;
        }
        Ok(())
    }
}

fn matches(doc: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Term { field, value } => doc
            .get(field)
            .is_some_and(|v| compare(v, value) == Some(Ordering::Equal)),
        Filter::Terms { field, values } => doc.get(field).is_some_and(|v| {
            values
                .iter()
                .any(|value| compare(v, value) == Some(Ordering::Equal))
        }),
        Filter::Range { field, gte, lte } => {
            let Some(v) = doc.get(field) else {
                return false;
            };
            let above = gte
                .as_ref()
                .is_none_or(|gte| matches!(compare(v, gte), Some(Ordering::Greater | Ordering::Equal)));
            let below = lte
                .as_ref()
                .is_none_or(|lte| matches!(compare(v, lte), Some(Ordering::Less | Ordering::Equal)));
            above && below
        }
    }
}

/// Missing values sort as the smallest
fn compare_field(a: &Value, b: &Value, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => match (a.as_u64(), b.as_u64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
