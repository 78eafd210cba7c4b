use serde_json::json;
use slumber_util_error::BoxedErrorResult;

use super::*;
use crate::{IndexError, SortField};
use crate::setup::ensure_indices;

async fn seeded() -> BoxedErrorResult<MemoryIndex> {
    let index = MemoryIndex::new();
    ensure_indices(&index, false).await?;
    index
        .bulk_index(
            "feeds",
            vec![
                ("1_9".into(), json!({"user_id": 9, "author_id": 2, "record_id": 1, "duration": 300, "created_at": "2024-03-01T00:00:00.000Z"})),
                ("2_9".into(), json!({"user_id": 9, "author_id": 3, "record_id": 2, "duration": 480, "created_at": "2024-03-02T00:00:00.000Z"})),
                ("3_9".into(), json!({"user_id": 9, "author_id": 2, "record_id": 3, "duration": 480, "created_at": "2024-03-05T00:00:00.000Z"})),
                ("3_8".into(), json!({"user_id": 8, "author_id": 2, "record_id": 3, "duration": 480, "created_at": "2024-03-05T00:00:00.000Z"})),
            ],
        )
        .await?;
    Ok(index)
}

fn ids(hits: &SearchHits) -> Vec<&str> {
    hits.hits.iter().map(|h| h.id.as_str()).collect()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn filters_sorts_and_pages() -> BoxedErrorResult<()> {
    let index = seeded().await?;
    let query = SearchQuery::new()
        .filter(Filter::term("user_id", 9u64))
        .sort_by(SortField::desc("duration"))
        .sort_by(SortField::desc("created_at"));

    let hits = index.search("feeds", &query).await?;
    assert_eq!(hits.total, 3);
    assert_eq!(ids(&hits), vec!["3_9", "2_9", "1_9"]);

    let hits = index.search("feeds", &query.clone().page(1, 1)).await?;
    assert_eq!(hits.total, 3);
    assert_eq!(ids(&hits), vec!["2_9"]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn range_and_terms_filters() -> BoxedErrorResult<()> {
    let index = seeded().await?;
    let query = SearchQuery::new()
        .filter(Filter::terms("author_id", [2u64]))
        .filter(Filter::range(
            "created_at",
            Some("2024-03-04T00:00:00.000Z"),
            Some("2024-03-10T23:59:59.999Z"),
        ))
        .sort_by(SortField::asc("user_id"))
        .page(0, 10);

    let hits = index.search("feeds", &query).await?;
    assert_eq!(ids(&hits), vec!["3_8", "3_9"]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn guarded_patch_skips_stale_updates() -> BoxedErrorResult<()> {
    let index = MemoryIndex::new();
    index
        .index_document("r", "1", json!({"duration": 1, "updated_at": "2024-03-02T00:00:00.000Z"}))
        .await?;

    let mut patch = DocumentPatch::default();
    patch.doc.insert("duration".into(), json!(2));
    patch.guard = Some(("updated_at".into(), json!("2024-03-01T00:00:00.000Z")));
    assert_eq!(index.update_document("r", "1", &patch).await?, PatchOutcome::Stale);
    assert_eq!(index.get("r", "1").expect("exists")["duration"], 1);

    patch.guard = Some(("updated_at".into(), json!("2024-03-03T00:00:00.000Z")));
    assert_eq!(index.update_document("r", "1", &patch).await?, PatchOutcome::Updated);
    assert_eq!(index.get("r", "1").expect("exists")["duration"], 2);

    assert_eq!(index.update_document("r", "2", &patch).await?, PatchOutcome::Missing);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn failing_and_missing_indices() -> BoxedErrorResult<()> {
    let index = seeded().await?;
    assert!(matches!(
        index.search("nope", &SearchQuery::new()).await,
        Err(IndexError::IndexNotFound { .. })
    ));

    index.set_failing("feeds", true);
    assert!(matches!(
        index.search("feeds", &SearchQuery::new()).await,
        Err(IndexError::Unavailable { .. })
    ));
    index.set_failing("feeds", false);

    assert!(index.delete_document("feeds", "1_9").await?);
    assert!(!index.delete_document("feeds", "1_9").await?);
    assert_eq!(index.len("feeds"), 3);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ensure_indices_is_idempotent() -> BoxedErrorResult<()> {
    let index = seeded().await?;
    ensure_indices(&index, false).await?;
    assert_eq!(index.len("feeds"), 4);

    ensure_indices(&index, true).await?;
    assert_eq!(index.len("feeds"), 0);
    assert!(index.index_exists("sleep_records").await?);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delayed_visibility_until_refresh() -> BoxedErrorResult<()> {
    let index = seeded().await?;
    index.set_delayed_visibility("feeds", true);
    let query = SearchQuery::new().filter(Filter::term("user_id", 9u64));

    assert!(index.delete_document("feeds", "1_9").await?);
    assert_eq!(index.search("feeds", &query).await?.total, 3);
    assert!(!index.delete_document("feeds", "1_9").await?);

    index.refresh("feeds").await?;
    assert_eq!(index.search("feeds", &query).await?.total, 2);

    index.set_delayed_visibility("feeds", false);
    assert!(index.delete_document("feeds", "2_9").await?);
    assert_eq!(index.search("feeds", &query).await?.total, 1);
    Ok(())
}
