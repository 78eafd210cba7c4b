use serde_json::{Map, Value, json};

/// A filtered, sorted, paged search over one index
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchQuery {
    /// All filters must match
    pub filters: Vec<Filter>,
    pub sort: Vec<SortField>,
    pub from: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals the value
    Term { field: String, value: Value },
    /// Field equals any of the values
    Terms { field: String, values: Vec<Value> },
    /// Inclusive bounds
    Range {
        field: String,
        gte: Option<Value>,
        lte: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchHits {
    /// Number of matching documents, regardless of paging
    pub total: u64,
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub source: Value,
}

/// Partial update of a document
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentPatch {
    /// Fields to overwrite
    pub doc: Map<String, Value>,
    /// Skip the patch if the stored value of this field is greater
    pub guard: Option<(String, Value)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Updated,
    /// Stored document is newer than the patch
    Stale,
    Missing,
}

impl Filter {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn terms<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::Terms {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn range(
        field: impl Into<String>,
        gte: Option<impl Into<Value>>,
        lte: Option<impl Into<Value>>,
    ) -> Self {
        Filter::Range {
            field: field.into(),
            gte: gte.map(Into::into),
            lte: lte.map(Into::into),
        }
    }

    fn to_elasticsearch(&self) -> Value {
        match self {
            Filter::Term { field, value } => json!({ "term": { field: value } }),
            Filter::Terms { field, values } => json!({ "terms": { field: values } }),
            Filter::Range { field, gte, lte } => {
                let mut bounds = Map::new();
                if let Some(gte) = gte {
                    bounds.insert("gte".into(), gte.clone());
                }
                if let Some(lte) = lte {
                    bounds.insert("lte".into(), lte.clone());
                }
                json!({ "range": { field: bounds } })
            }
        }
    }
}

impl SortField {
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort_by(mut self, sort: SortField) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn page(mut self, from: usize, size: usize) -> Self {
        self.from = from;
        self.size = size;
        self
    }

    /// Request body for `POST /{index}/_search`
    pub fn to_elasticsearch(&self) -> Value {
        let filters: Vec<Value> = self.filters.iter().map(Filter::to_elasticsearch).collect();
        let sort: Vec<Value> = self
            .sort
            .iter()
            .map(|s| {
                let order = match s.order {
                    SortOrder::Asc => "asc",
                    SortOrder::Desc => "desc",
                };
                json!({ s.field.as_str(): { "order": order } })
            })
            .collect();

        let query = if filters.is_empty() {
            json!({ "match_all": {} })
        } else {
            json!({ "bool": { "filter": filters } })
        };

        json!({
            "query": query,
            "sort": sort,
            "from": self.from,
            "size": self.size,
            "track_total_hits": true,
        })
    }
}
