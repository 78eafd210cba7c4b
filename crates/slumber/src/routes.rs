use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use slumber_core::{Cursor, FollowId, RecordId, SleepRecord, Timestamp, UserId};
use slumber_db::{DbError, FollowPage, NewRecord, RecordUpdate, clamp_page_size};
use slumber_feed::{FeedRequest, TimeWindow};
use slumber_index::documents::FeedDocument;
use snafu::OptionExt as _;

use crate::SharedState;
use crate::error::{InvalidUserHeaderSnafu, RequestError, RequestResult, UnauthorizedSnafu};

const USER_ID_HEADER: &str = "x-user-id";

const DEFAULT_FEED_LIMIT: usize = 10;
const DEFAULT_RECORDS_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

pub fn route_handler(state: SharedState) -> Router {
    Router::new()
        .route("/up", get(up))
        .route("/users", post(create_user))
        .route("/users/{id}/follow", post(follow).delete(unfollow))
        .route("/users/{id}/followers", get(followers))
        .route("/users/{id}/following", get(following))
        .route("/sleep_records", get(list_records).post(create_record))
        .route("/sleep_records/feed", get(feed))
        .route(
            "/sleep_records/{id}",
            get(get_record).patch(update_record).delete(delete_record),
        )
        .with_state(state)
}

/// The acting user, from the `X-User-ID` header
pub struct CurrentUser(pub UserId);

impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = RequestError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .context(UnauthorizedSnafu)?;
        let user_id = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<UserId>().ok())
            .context(InvalidUserHeaderSnafu)?;
        Ok(CurrentUser(user_id))
    }
}

/// Limit query parameter to `1..=MAX_LIMIT`, using `default` when absent
fn clamp_limit(limit: Option<i64>, default: usize) -> usize {
    match limit {
        None => default,
        Some(limit) => usize::try_from(limit.max(1))
            .unwrap_or(MAX_LIMIT)
            .min(MAX_LIMIT),
    }
}

fn clamp_offset(offset: Option<i64>) -> usize {
    offset
        .and_then(|offset| usize::try_from(offset).ok())
        .unwrap_or_default()
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

async fn up() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
struct CreatedUser {
    id: UserId,
}

async fn create_user(
    State(state): State<SharedState>,
) -> RequestResult<(StatusCode, Json<CreatedUser>)> {
    let id = state.db.create_user().await?;
    Ok((StatusCode::CREATED, Json(CreatedUser { id })))
}

async fn follow(
    State(state): State<SharedState>,
    CurrentUser(follower_id): CurrentUser,
    Path(followed_id): Path<UserId>,
) -> RequestResult<(StatusCode, Json<MessageResponse>)> {
    state.db.create_follow(follower_id, followed_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: format!("Now following user {followed_id}"),
        }),
    ))
}

async fn unfollow(
    State(state): State<SharedState>,
    CurrentUser(follower_id): CurrentUser,
    Path(followed_id): Path<UserId>,
) -> RequestResult<Json<MessageResponse>> {
    state.db.delete_follow(follower_id, followed_id).await?;
    Ok(Json(MessageResponse {
        message: format!("Unfollowed user {followed_id}"),
    }))
}

#[derive(Deserialize)]
struct FollowListQuery {
    cursor: Option<String>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct FollowListEntry {
    id: FollowId,
    user_id: UserId,
    created_at: Timestamp,
}

#[derive(Serialize)]
struct FollowListResponse {
    data: Vec<FollowListEntry>,
    next_cursor: Option<String>,
}

impl From<FollowPage> for FollowListResponse {
    fn from(page: FollowPage) -> Self {
        Self {
            data: page
                .items
                .into_iter()
                .map(|item| FollowListEntry {
                    id: item.follow_id,
                    user_id: item.user_id,
                    created_at: item.created_at,
                })
                .collect(),
            next_cursor: page.next_cursor,
        }
    }
}

async fn followers(
    State(state): State<SharedState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<FollowListQuery>,
) -> RequestResult<Json<FollowListResponse>> {
    let page = state
        .db
        .list_followers(
            user_id,
            Cursor::decode_opt(query.cursor.as_deref()),
            clamp_page_size(query.limit),
        )
        .await?;
    Ok(Json(page.into()))
}

async fn following(
    State(state): State<SharedState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<FollowListQuery>,
) -> RequestResult<Json<FollowListResponse>> {
    let page = state
        .db
        .list_following(
            user_id,
            Cursor::decode_opt(query.cursor.as_deref()),
            clamp_page_size(query.limit),
        )
        .await?;
    Ok(Json(page.into()))
}

#[derive(Deserialize)]
struct CreateRecordBody {
    duration: i64,
    start_at: Option<Timestamp>,
}

async fn create_record(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<CreateRecordBody>,
) -> RequestResult<(StatusCode, Json<SleepRecord>)> {
    let record = state
        .db
        .create_record(
            user_id,
            NewRecord {
                duration: body.duration,
                start_at: body.start_at,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Deserialize)]
struct UpdateRecordBody {
    duration: Option<i64>,
    start_at: Option<Timestamp>,
}

async fn update_record(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Path(record_id): Path<RecordId>,
    Json(body): Json<UpdateRecordBody>,
) -> RequestResult<Json<SleepRecord>> {
    let record = state
        .db
        .update_record(
            user_id,
            record_id,
            RecordUpdate {
                duration: body.duration,
                start_at: body.start_at,
            },
        )
        .await?;
    Ok(Json(record))
}

async fn delete_record(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Path(record_id): Path<RecordId>,
) -> RequestResult<StatusCode> {
    state.db.delete_record(user_id, record_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_record(
    State(state): State<SharedState>,
    CurrentUser(_): CurrentUser,
    Path(record_id): Path<RecordId>,
) -> RequestResult<Json<SleepRecord>> {
    Ok(Json(state.db.get_record(record_id).await?))
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct RecordsMeta {
    total_count: u64,
    limit: usize,
    offset: usize,
    page: usize,
    total_pages: u64,
}

#[derive(Serialize)]
struct RecordsResponse {
    data: Vec<SleepRecord>,
    meta: RecordsMeta,
}

async fn list_records(
    State(state): State<SharedState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<PageQuery>,
) -> RequestResult<Json<RecordsResponse>> {
    let limit = clamp_limit(query.limit, DEFAULT_RECORDS_LIMIT);
    let offset = clamp_offset(query.offset);
    let page = state.db.list_user_records(user_id, limit, offset).await?;
    Ok(Json(RecordsResponse {
        meta: RecordsMeta {
            total_count: page.total,
            limit,
            offset,
            page: offset / limit + 1,
            total_pages: page.total.div_ceil(limit as u64),
        },
        data: page.records,
    }))
}

#[derive(Deserialize)]
struct FeedQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    last_week: Option<bool>,
}

#[derive(Serialize)]
struct FeedMeta {
    total_count: u64,
    limit: usize,
    offset: usize,
    degraded: bool,
}

#[derive(Serialize)]
struct FeedResponse {
    data: Vec<FeedDocument>,
    meta: FeedMeta,
}

async fn feed(
    State(state): State<SharedState>,
    CurrentUser(viewer_id): CurrentUser,
    Query(query): Query<FeedQuery>,
) -> RequestResult<Json<FeedResponse>> {
    if !state.db.has_user(viewer_id).await? {
        return Err(DbError::UserNotFound { user_id: viewer_id }.into());
    }

    let req = FeedRequest {
        limit: clamp_limit(query.limit, DEFAULT_FEED_LIMIT),
        offset: clamp_offset(query.offset),
        window: if query.last_week.unwrap_or(true) {
            TimeWindow::last_calendar_week(Timestamp::now())
        } else {
            None
        },
    };
    let page = state.planner.get_feed(viewer_id, &req).await?;
    Ok(Json(FeedResponse {
        data: page.entries,
        meta: FeedMeta {
            total_count: page.total,
            limit: req.limit,
            offset: req.offset,
            degraded: page.degraded,
        },
    }))
}
