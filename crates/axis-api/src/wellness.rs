use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use axis_db::models::TimeBlockRow;
use axis_types::api::{Claims, CreateTimeBlockRequest, ResonanceEntry, Success, ToggleCheckInRequest};
use axis_types::models::{MAX_BLOCK_MINUTES, compute_end_time, parse_clock_time};

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiJson, ApiPath, ApiQuery, FieldErrors};

const MAX_ACTIVITY_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    pub date: NaiveDate,
}

pub async fn list_categories(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let rows = blocking(&state, |db| db.list_categories()).await?;
    let categories = rows
        .into_iter()
        .map(|r| r.into_model())
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(Success::new(categories)))
}

pub async fn list_checkins(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DateQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (uid, date) = (claims.sub.to_string(), query.date.to_string());
    let rows = blocking(&state, move |db| db.list_checkins(&uid, &date)).await?;
    let checkins = rows
        .into_iter()
        .map(|r| r.into_model())
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(Success::new(checkins)))
}

/// Creates the day's check-in as completed, or flips an existing one.
pub async fn toggle_checkin(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<ToggleCheckInRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (uid, cid, date) = (claims.sub.to_string(), req.category_id.to_string(), req.date.to_string());
    let row = blocking(&state, move |db| {
        if !db.category_exists(&cid)? {
            return Ok(None);
        }
        Ok(Some(db.toggle_checkin(&Uuid::new_v4().to_string(), &uid, &cid, &date)?))
    })
    .await?
    .ok_or(ApiError::NotFound("category"))?;

    let checkin = row.into_model()?;
    debug!(
        "{} set {} on {} to {}",
        claims.username, checkin.category_id, checkin.date, checkin.completed
    );
    Ok(Json(Success::new(checkin)))
}

/// How many other users completed each axis on a date.
pub async fn resonance(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DateQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (uid, date) = (claims.sub.to_string(), query.date.to_string());
    let rows = blocking(&state, move |db| db.resonance(&uid, &date)).await?;

    let entries: Vec<ResonanceEntry> = rows
        .into_iter()
        .filter_map(|(id, slug, count)| match id.parse() {
            Ok(category_id) => Some(ResonanceEntry { category_id, slug, count }),
            Err(e) => {
                warn!("Corrupt category id '{}': {}", id, e);
                None
            }
        })
        .collect();
    Ok(Json(Success::new(entries)))
}

pub async fn list_time_blocks(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<DateQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (uid, date) = (claims.sub.to_string(), query.date.to_string());
    let rows = blocking(&state, move |db| db.list_time_blocks(&uid, &date)).await?;
    let blocks = rows
        .into_iter()
        .map(|r| r.into_model())
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(Success::new(blocks)))
}

pub async fn create_time_block(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<CreateTimeBlockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let activity = req.activity.trim().to_string();
    let start = parse_clock_time(&req.start_time);

    let mut errors = FieldErrors::default();
    errors.check(!activity.is_empty(), "activity", "must not be empty");
    errors.check(
        activity.chars().count() <= MAX_ACTIVITY_CHARS,
        "activity",
        "at most 200 characters",
    );
    errors.check(start.is_some(), "start_time", "expected HH:MM");
    errors.check(
        (1..=MAX_BLOCK_MINUTES).contains(&req.duration_minutes),
        "duration_minutes",
        "between 1 and 1440",
    );
    errors.into_result()?;
    let start = start.ok_or_else(|| ApiError::invalid("start_time", "expected HH:MM"))?;
    let end = compute_end_time(start, req.duration_minutes);

    let row = TimeBlockRow {
        id: Uuid::new_v4().to_string(),
        user_id: claims.sub.to_string(),
        date: req.date.to_string(),
        category_id: req.category_id.map(|c| c.to_string()),
        activity,
        start_time: start.format("%H:%M").to_string(),
        duration_minutes: i64::from(req.duration_minutes),
        end_time: end.format("%H:%M").to_string(),
        status: req.status.as_str().to_string(),
    };

    let stored = blocking(&state, move |db| {
        if let Some(cid) = &row.category_id {
            if !db.category_exists(cid)? {
                return Ok(None);
            }
        }
        db.insert_time_block(&row)?;
        Ok(Some(row))
    })
    .await?
    .ok_or_else(|| ApiError::invalid("category_id", "unknown category"))?;

    Ok((StatusCode::CREATED, Json(Success::new(stored.into_model()?))))
}

pub async fn delete_time_block(
    State(state): State<AppState>,
    ApiPath(block_id): ApiPath<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (bid, uid) = (block_id.to_string(), claims.sub.to_string());
    if !blocking(&state, move |db| db.delete_time_block(&bid, &uid)).await? {
        return Err(ApiError::NotFound("time block"));
    }
    Ok(Json(Success::new(serde_json::json!({ "id": block_id }))))
}
