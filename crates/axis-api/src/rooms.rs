use std::collections::BTreeSet;

use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use axis_types::api::{AddParticipantRequest, Claims, CreateRoomRequest, RoomDetail, Success};
use axis_types::models::{Participant, ParticipantRole, Room, RoomKind};

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiJson, ApiPath, FieldErrors};

const MAX_ROOM_NAME: usize = 80;
const MAX_INITIAL_PARTICIPANTS: usize = 100;

/// Loads a live room and the caller's membership in it.
/// Missing room -> 404, non-participant -> 403.
pub(crate) async fn require_participant(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
) -> Result<(Room, Participant), ApiError> {
    let (rid, uid) = (room_id.to_string(), user_id.to_string());
    let (room, participant) = blocking(state, move |db| {
        let room = db.get_room(&rid)?;
        let participant = db.get_participant(&rid, &uid)?;
        Ok((room, participant))
    })
    .await?;

    let room = room.ok_or(ApiError::NotFound("room"))?.into_model()?;
    let participant = participant.ok_or(ApiError::Forbidden)?.into_model()?;
    Ok((room, participant))
}

pub async fn list_rooms(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let uid = claims.sub.to_string();
    let rows = blocking(&state, move |db| db.list_rooms_for_user(&uid)).await?;
    let rooms = rows
        .into_iter()
        .map(|r| r.into_model())
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(Success::new(rooms)))
}

pub async fn create_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
    let others: BTreeSet<Uuid> = req
        .participant_ids
        .into_iter()
        .filter(|id| *id != claims.sub)
        .collect();

    let mut errors = FieldErrors::default();
    errors.check(
        name.as_ref().is_none_or(|n| n.chars().count() <= MAX_ROOM_NAME),
        "name",
        "at most 80 characters",
    );
    match req.kind {
        RoomKind::Direct => {
            errors.check(others.len() == 1, "participant_ids", "a direct room has exactly one other participant")
        }
        RoomKind::Group | RoomKind::Category => {
            errors.check(name.is_some(), "name", "required for group and category rooms")
        }
        RoomKind::Support => {}
    }
    errors.check(
        others.len() <= MAX_INITIAL_PARTICIPANTS,
        "participant_ids",
        "too many participants",
    );
    errors.into_result()?;

    let member_ids: Vec<String> = others.iter().map(|id| id.to_string()).collect();
    let lookup = member_ids.clone();
    let missing: Vec<String> = blocking(&state, move |db| {
        let mut missing = Vec::new();
        for id in &lookup {
            if db.get_user_by_id(id)?.is_none() {
                missing.push(id.clone());
            }
        }
        Ok(missing)
    })
    .await?;
    if !missing.is_empty() {
        return Err(ApiError::invalid(
            "participant_ids",
            format!("unknown users: {}", missing.join(", ")),
        ));
    }

    let room_id = Uuid::new_v4();
    let (rid, kind, owner) = (room_id.to_string(), req.kind.as_str(), claims.sub.to_string());
    let stored_name = name.clone();
    let row = blocking(&state, move |db| {
        db.create_room(&rid, kind, stored_name.as_deref(), &owner, &member_ids)?;
        db.get_room(&rid)?
            .ok_or_else(|| anyhow::anyhow!("room {} vanished after insert", rid))
    })
    .await?;

    info!("{} created {} room {}", claims.username, req.kind, room_id);
    Ok((StatusCode::CREATED, Json(Success::new(row.into_model()?))))
}

pub async fn get_room(
    State(state): State<AppState>,
    ApiPath(room_id): ApiPath<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (room, _) = require_participant(&state, room_id, claims.sub).await?;
    let participants = load_participants(&state, room_id).await?;
    Ok(Json(Success::new(RoomDetail { room, participants })))
}

/// Owners and admins may delete a room. Messages are kept.
pub async fn delete_room(
    State(state): State<AppState>,
    ApiPath(room_id): ApiPath<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (room, me) = require_participant(&state, room_id, claims.sub).await?;
    if room.owner_id != claims.sub && me.role != ParticipantRole::Admin {
        return Err(ApiError::Forbidden);
    }

    let rid = room_id.to_string();
    blocking(&state, move |db| db.delete_room(&rid)).await?;
    state.dispatcher.revoke(room_id, None);

    info!("{} deleted room {}", claims.username, room_id);
    Ok(Json(Success::new(serde_json::json!({ "id": room_id }))))
}

pub async fn list_participants(
    State(state): State<AppState>,
    ApiPath(room_id): ApiPath<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, room_id, claims.sub).await?;
    Ok(Json(Success::new(load_participants(&state, room_id).await?)))
}

pub async fn add_participant(
    State(state): State<AppState>,
    ApiPath(room_id): ApiPath<Uuid>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<AddParticipantRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, me) = require_participant(&state, room_id, claims.sub).await?;
    if me.role != ParticipantRole::Admin {
        return Err(ApiError::Forbidden);
    }

    let (rid, uid, role) = (room_id.to_string(), req.user_id.to_string(), req.role.as_str());
    let added = blocking(&state, move |db| {
        if db.get_user_by_id(&uid)?.is_none() {
            return Ok(None);
        }
        if !db.add_participant(&rid, &uid, role)? {
            return Ok(Some(None));
        }
        Ok(Some(db.get_participant(&rid, &uid)?))
    })
    .await?;

    let participant = match added {
        None => return Err(ApiError::NotFound("user")),
        Some(None) => return Err(ApiError::Conflict("already a participant".into())),
        Some(Some(row)) => row.into_model()?,
    };

    info!("{} added {} to room {}", claims.username, participant.username, room_id);
    Ok((StatusCode::CREATED, Json(Success::new(participant))))
}

/// Admins may remove anyone but the owner; anyone may remove themselves.
pub async fn remove_participant(
    State(state): State<AppState>,
    ApiPath((room_id, user_id)): ApiPath<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (room, me) = require_participant(&state, room_id, claims.sub).await?;
    if user_id != claims.sub && me.role != ParticipantRole::Admin {
        return Err(ApiError::Forbidden);
    }
    if user_id == room.owner_id {
        return Err(ApiError::Conflict("the room owner cannot be removed".into()));
    }

    let (rid, uid) = (room_id.to_string(), user_id.to_string());
    if !blocking(&state, move |db| db.remove_participant(&rid, &uid)).await? {
        return Err(ApiError::NotFound("participant"));
    }
    state.dispatcher.revoke(room_id, Some(user_id));

    Ok(Json(Success::new(serde_json::json!({ "room_id": room_id, "user_id": user_id }))))
}

async fn load_participants(state: &AppState, room_id: Uuid) -> Result<Vec<Participant>, ApiError> {
    let rid = room_id.to_string();
    let rows = blocking(state, move |db| db.list_participants(&rid)).await?;
    Ok(rows
        .into_iter()
        .map(|r| r.into_model())
        .collect::<anyhow::Result<Vec<_>>>()?)
}
