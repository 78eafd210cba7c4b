use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use snafu::{ResultExt as _, ensure};
use tracing::{debug, warn};
use url::Url;

use crate::{
    BulkRejectedSnafu, DocumentPatch, Hit, HttpSnafu, IndexExistsSnafu, IndexMapping,
    IndexNotFoundSnafu, IndexResult, InvalidUrlSnafu, JsonSnafu, LOG_TARGET,
    MalformedResponseSnafu, PatchOutcome, SearchHits, SearchIndex, SearchQuery, StatusSnafu,
};

/// Applies `params.doc` unless the stored guard field is newer
const GUARDED_UPDATE_SCRIPT: &str = "\
if (params.guard_field != null \
    && ctx._source[params.guard_field] != null \
    && ctx._source[params.guard_field].compareTo(params.guard_value) > 0) { \
  ctx.op = 'noop' \
} else { \
  for (entry in params.doc.entrySet()) { ctx._source[entry.getKey()] = entry.getValue() } \
}";

/// Elasticsearch (or OpenSearch) over its REST API
#[derive(Debug, Clone)]
pub struct ElasticsearchIndex {
    client: reqwest::Client,
    base: Url,
    /// Wait for writes to become searchable before returning
    refresh: bool,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: SearchResponseHits,
}

#[derive(Deserialize)]
struct SearchResponseHits {
    total: TotalHits,
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct TotalHits {
    value: u64,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Value,
}

#[derive(Deserialize)]
struct UpdateResponse {
    result: String,
}

#[derive(Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

#[bon::bon]
impl ElasticsearchIndex {
    #[builder(finish_fn(name = "build"))]
    pub fn new(
        #[builder(into)] url: String,
        #[builder(default = false)] refresh: bool,
        #[builder(default = Duration::from_secs(10))] request_timeout: Duration,
    ) -> IndexResult<Self> {
        let mut base = Url::parse(&url).context(InvalidUrlSnafu)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context(HttpSnafu)?;
        Ok(Self {
            client,
            base,
            refresh,
        })
    }
}

impl ElasticsearchIndex {
    fn request(&self, method: Method, path: &str) -> IndexResult<RequestBuilder> {
        let url = self.base.join(path).context(InvalidUrlSnafu)?;
        Ok(self.client.request(method, url))
    }

    fn write_request(&self, method: Method, path: &str) -> IndexResult<RequestBuilder> {
        let req = self.request(method, path)?;
        Ok(if self.refresh {
            req.query(&[("refresh", "wait_for")])
        } else {
            req
        })
    }

    async fn send(req: RequestBuilder) -> IndexResult<Response> {
        req.send().await.context(HttpSnafu)
    }

    async fn ensure_success(resp: Response) -> IndexResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        StatusSnafu {
            status: status.as_u16(),
            body,
        }
        .fail()
    }

    fn bulk_body(index: &str, docs: &[(String, Value)]) -> IndexResult<String> {
        let mut body = String::new();
        for (id, doc) in docs {
            let action = json!({ "index": { "_index": index, "_id": id } });
            body.push_str(&serde_json::to_string(&action).context(JsonSnafu)?);
            body.push('\n');
            body.push_str(&serde_json::to_string(doc).context(JsonSnafu)?);
            body.push('\n');
        }
        Ok(body)
    }

    fn update_body(patch: &DocumentPatch) -> Value {
        let (guard_field, guard_value) = match &patch.guard {
            Some((field, value)) => (Value::from(field.as_str()), value.clone()),
            None => (Value::Null, Value::Null),
        };
        json!({
            "script": {
                "source": GUARDED_UPDATE_SCRIPT,
                "lang": "painless",
                "params": {
                    "doc": patch.doc,
                    "guard_field": guard_field,
                    "guard_value": guard_value,
                }
            }
        })
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn create_index(&self, index: &str, mapping: &IndexMapping) -> IndexResult<()> {
        let resp = Self::send(self.request(Method::PUT, index)?.json(&mapping.0)).await?;
        if resp.status() == StatusCode::BAD_REQUEST {
            let body = resp.text().await.unwrap_or_default();
            ensure!(
                !body.contains("resource_already_exists_exception"),
                IndexExistsSnafu { index }
            );
            return StatusSnafu { status: 400u16, body }.fail();
        }
        Self::ensure_success(resp).await?;
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> IndexResult<bool> {
        let resp = Self::send(self.request(Method::HEAD, index)?).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::ensure_success(resp).await?;
        Ok(true)
    }

    async fn delete_index(&self, index: &str) -> IndexResult<bool> {
        let resp = Self::send(self.request(Method::DELETE, index)?).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::ensure_success(resp).await?;
        Ok(true)
    }

    async fn index_document(&self, index: &str, id: &str, doc: Value) -> IndexResult<()> {
        let req = self
            .write_request(Method::PUT, &format!("{index}/_doc/{id}"))?
            .json(&doc);
        Self::ensure_success(Self::send(req).await?).await?;
        Ok(())
    }

    async fn bulk_index(&self, index: &str, docs: Vec<(String, Value)>) -> IndexResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let body = Self::bulk_body(index, &docs)?;
        let req = self
            .write_request(Method::POST, "_bulk")?
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        let resp = Self::ensure_success(Self::send(req).await?).await?;
        let resp: BulkResponse = resp.json().await.context(HttpSnafu)?;
        if resp.errors {
            let failed = resp
                .items
                .iter()
                .filter(|item| {
                    item.get("index")
                        .and_then(|i| i.get("status"))
                        .and_then(Value::as_u64)
                        .is_none_or(|status| 300 <= status)
                })
                .count();
            warn!(target: LOG_TARGET, %index, failed, total = docs.len(), "Bulk request partially failed");
            return BulkRejectedSnafu {
                failed,
                total: docs.len(),
            }
            .fail();
        }
        debug!(target: LOG_TARGET, %index, count = docs.len(), "Bulk indexed");
        Ok(())
    }

    async fn update_document(
        &self,
        index: &str,
        id: &str,
        patch: &DocumentPatch,
    ) -> IndexResult<PatchOutcome> {
        let req = self
            .write_request(Method::POST, &format!("{index}/_update/{id}"))?
            .query(&[("retry_on_conflict", "3")])
            .json(&Self::update_body(patch));
        let resp = Self::send(req).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(PatchOutcome::Missing);
        }
        let resp: UpdateResponse = Self::ensure_success(resp)
            .await?
            .json()
            .await
            .context(HttpSnafu)?;
        match resp.result.as_str() {
            "updated" => Ok(PatchOutcome::Updated),
            "noop" => Ok(PatchOutcome::Stale),
            other => MalformedResponseSnafu {
                message: format!("unexpected update result {other}"),
            }
            .fail(),
        }
    }

    async fn delete_document(&self, index: &str, id: &str) -> IndexResult<bool> {
        let req = self.write_request(Method::DELETE, &format!("{index}/_doc/{id}"))?;
        let resp = Self::send(req).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::ensure_success(resp).await?;
        Ok(true)
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> IndexResult<SearchHits> {
        let req = self
            .request(Method::POST, &format!("{index}/_search"))?
            .json(&query.to_elasticsearch());
        let resp = Self::send(req).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return IndexNotFoundSnafu { index }.fail();
        }
        let resp: SearchResponse = Self::ensure_success(resp)
            .await?
            .json()
            .await
            .context(HttpSnafu)?;
        Ok(SearchHits {
            total: resp.hits.total.value,
            hits: resp
                .hits
                .hits
                .into_iter()
                .map(|hit| Hit {
                    id: hit.id,
                    source: hit.source,
                })
                .collect(),
        })
    }

    async fn refresh(&self, index: &str) -> IndexResult<()> {
        let resp = Self::send(self.request(Method::POST, &format!("{index}/_refresh"))?).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return IndexNotFoundSnafu { index }.fail();
        }
        Self::ensure_success(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_keeps_path_prefix() -> IndexResult<()> {
        let index = ElasticsearchIndex::builder()
            .url("http://localhost:9200/es")
            .build()?;
        assert_eq!(
            index.base.join("feeds/_search").context(InvalidUrlSnafu)?.as_str(),
            "http://localhost:9200/es/feeds/_search"
        );
        Ok(())
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(ElasticsearchIndex::builder().url("not a url").build().is_err());
    }

    #[test]
    fn bulk_body_is_ndjson() -> IndexResult<()> {
        let body = ElasticsearchIndex::bulk_body(
            "feeds",
            &[
                ("1_2".to_owned(), json!({ "duration": 1 })),
                ("1_3".to_owned(), json!({ "duration": 2 })),
            ],
        )?;
        let lines: Vec<Value> = body
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()
            .context(JsonSnafu)?;
        assert_eq!(
            lines,
            vec![
                json!({ "index": { "_index": "feeds", "_id": "1_2" } }),
                json!({ "duration": 1 }),
                json!({ "index": { "_index": "feeds", "_id": "1_3" } }),
                json!({ "duration": 2 }),
            ]
        );
        assert!(body.ends_with('\n'));
        Ok(())
    }

    #[test]
    fn update_body_carries_guard() {
        let mut patch = DocumentPatch::default();
        patch.doc.insert("duration".into(), json!(7));
        patch.guard = Some(("updated_at".into(), json!("2024-01-01T00:00:00.000Z")));

        let body = ElasticsearchIndex::update_body(&patch);
        assert_eq!(body["script"]["params"]["doc"], json!({ "duration": 7 }));
        assert_eq!(body["script"]["params"]["guard_field"], "updated_at");
        assert_eq!(
            body["script"]["params"]["guard_value"],
            "2024-01-01T00:00:00.000Z"
        );

        let body = ElasticsearchIndex::update_body(&DocumentPatch::default());
        assert_eq!(body["script"]["params"]["guard_field"], Value::Null);
    }
}
