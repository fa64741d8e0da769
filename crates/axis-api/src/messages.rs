use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use axis_db::models::{MessageRow, NewMessage};
use axis_db::{format_ts, parse_ts};
use axis_types::api::{Claims, EditMessageRequest, SendMessageRequest, Success};
use axis_types::events::RealtimeEvent;
use axis_types::models::{Attachment, Message, MessageKind, ReactionGroup};

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiJson, ApiPath, ApiQuery, FieldErrors};
use crate::mentions::extract_mentions;
use crate::rooms::require_participant;

pub const MAX_BODY_CHARS: usize = 4000;
const MAX_ATTACHMENTS: usize = 10;
const MAX_ATTACHMENT_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination: pass the `created_at` and `id` of the
    /// oldest message from the previous page to fetch older messages.
    pub before: Option<DateTime<Utc>>,
    pub before_id: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

pub async fn send_message(
    State(state): State<AppState>,
    ApiPath(room_id): ApiPath<Uuid>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, room_id, claims.sub).await?;
    validate_send(&req)?;

    if let Some(reply_to) = req.reply_to {
        let rid = reply_to.to_string();
        let parent = blocking(&state, move |db| db.get_message(&rid)).await?;
        if !parent.is_some_and(|p| p.room_id == room_id.to_string()) {
            return Err(ApiError::invalid("reply_to", "no such message in this room"));
        }
    }

    let message_id = Uuid::new_v4();
    // Stored timestamps carry microseconds; echo exactly what was stored
    let now = Utc::now().trunc_subsecs(6);
    let attachments: Vec<Attachment> = req
        .attachments
        .iter()
        .map(|a| Attachment {
            id: Uuid::new_v4(),
            message_id,
            file_name: a.file_name.clone(),
            size_bytes: a.size_bytes,
            mime_type: a.mime_type.clone(),
        })
        .collect();

    let handles = extract_mentions(&req.content);
    let body = req.content.clone();
    let kind = req.kind;
    let reply_to = req.reply_to;
    let sender_id = claims.sub;
    let stored_attachments = attachments.clone();

    // Resolve @handles against the room's participants and insert in one blocking hop
    blocking(&state, move |db| {
        let mentioned: Vec<Uuid> = if handles.is_empty() {
            vec![]
        } else {
            db.list_participants(&room_id.to_string())?
                .into_iter()
                .filter(|p| handles.iter().any(|h| h.eq_ignore_ascii_case(&p.username)))
                .filter_map(|p| p.user_id.parse().ok())
                .collect()
        };
        db.insert_message(&NewMessage {
            id: message_id,
            room_id,
            sender_id,
            body: &body,
            kind: kind.as_str(),
            reply_to,
            created_at: now,
            attachments: &stored_attachments,
            mentioned_user_ids: &mentioned,
        })
    })
    .await?;

    let message = Message {
        id: message_id,
        room_id,
        sender_id: claims.sub,
        sender_username: claims.username.clone(),
        body: req.content,
        kind,
        created_at: now,
        edited_at: None,
        deleted_at: None,
        reply_to,
        attachments,
        reactions: vec![],
    };

    debug!("{} posted {} in room {}", claims.username, message_id, room_id);
    state.dispatcher.broadcast(RealtimeEvent::MessageInsert {
        message: message.clone(),
    });

    Ok((StatusCode::CREATED, Json(Success::new(message))))
}

fn validate_send(req: &SendMessageRequest) -> Result<(), ApiError> {
    let mut errors = FieldErrors::default();
    let chars = req.content.chars().count();
    errors.check(
        !req.content.trim().is_empty() || !req.attachments.is_empty(),
        "content",
        "must not be empty",
    );
    errors.check(chars <= MAX_BODY_CHARS, "content", "at most 4000 characters");
    errors.check(req.kind != MessageKind::System, "type", "system messages cannot be sent by clients");
    errors.check(
        !matches!(req.kind, MessageKind::Image | MessageKind::File) || !req.attachments.is_empty(),
        "attachments",
        "image and file messages need an attachment",
    );
    errors.check(req.attachments.len() <= MAX_ATTACHMENTS, "attachments", "at most 10 attachments");
    for a in &req.attachments {
        errors.check(!a.file_name.trim().is_empty(), "attachments.file_name", "must not be empty");
        errors.check(a.mime_type.contains('/'), "attachments.mime_type", "must be a MIME type");
        errors.check(a.size_bytes <= MAX_ATTACHMENT_BYTES, "attachments.size_bytes", "at most 50 MiB");
    }
    errors.into_result()
}

pub async fn get_messages(
    State(state): State<AppState>,
    ApiPath(room_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, room_id, claims.sub).await?;

    let rid = room_id.to_string();
    let limit = query.limit.clamp(1, 200);
    // Without an id, exclude every message at exactly `before`
    let before = query
        .before
        .map(|ts| (format_ts(&ts), query.before_id.unwrap_or(Uuid::nil()).to_string()));

    let rows = blocking(&state, move |db| {
        db.get_messages(&rid, limit, before.as_ref().map(|(ts, id)| (ts.as_str(), id.as_str())))
    })
    .await?;

    Ok(Json(Success::new(hydrate(&state, rows).await?)))
}

pub async fn edit_message(
    State(state): State<AppState>,
    ApiPath((room_id, message_id)): ApiPath<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<EditMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_participant(&state, room_id, claims.sub).await?;

    let mut errors = FieldErrors::default();
    errors.check(!req.content.trim().is_empty(), "content", "must not be empty");
    errors.check(req.content.chars().count() <= MAX_BODY_CHARS, "content", "at most 4000 characters");
    errors.into_result()?;

    let existing = load_live_message(&state, room_id, message_id).await?;
    if existing.sender_id != claims.sub.to_string() {
        return Err(ApiError::Forbidden);
    }

    let (mid, body, edited_at) = (message_id.to_string(), req.content, format_ts(&Utc::now()));
    let row = blocking(&state, move |db| {
        if !db.edit_message(&mid, &body, &edited_at)? {
            return Ok(None);
        }
        db.get_message(&mid)
    })
    .await?
    .ok_or(ApiError::NotFound("message"))?;

    let message = hydrate(&state, vec![row])
        .await?
        .pop()
        .ok_or_else(|| anyhow::anyhow!("edited message {} failed to load", message_id))?;

    state.dispatcher.broadcast(RealtimeEvent::MessageUpdate {
        message: message.clone(),
    });
    Ok(Json(Success::new(message)))
}

/// Soft delete. Senders may delete their own messages; admins and
/// moderators may delete anyone's.
pub async fn delete_message(
    State(state): State<AppState>,
    ApiPath((room_id, message_id)): ApiPath<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, me) = require_participant(&state, room_id, claims.sub).await?;

    let mid = message_id.to_string();
    let existing = blocking(&state, move |db| db.get_message(&mid))
        .await?
        .filter(|m| m.room_id == room_id.to_string())
        .ok_or(ApiError::NotFound("message"))?;

    if existing.sender_id != claims.sub.to_string() && !me.role.can_moderate() {
        return Err(ApiError::Forbidden);
    }

    // Deleting twice reports the original deletion time
    if let Some(raw) = existing.deleted_at {
        let deleted_at = parse_ts(&raw)?;
        return Ok(Json(Success::new(serde_json::json!({ "id": message_id, "deleted_at": deleted_at }))));
    }

    let deleted_at = Utc::now().trunc_subsecs(6);
    let (mid, ts) = (message_id.to_string(), format_ts(&deleted_at));
    blocking(&state, move |db| db.soft_delete_message(&mid, &ts)).await?;

    state.dispatcher.broadcast(RealtimeEvent::MessageDelete {
        room_id,
        message_id,
        deleted_at,
    });
    Ok(Json(Success::new(serde_json::json!({ "id": message_id, "deleted_at": deleted_at }))))
}

/// A message that exists in `room_id` and is not deleted, else 404.
pub(crate) async fn load_live_message(
    state: &AppState,
    room_id: Uuid,
    message_id: Uuid,
) -> Result<MessageRow, ApiError> {
    let mid = message_id.to_string();
    blocking(state, move |db| db.get_message(&mid))
        .await?
        .filter(|m| m.room_id == room_id.to_string() && m.deleted_at.is_none())
        .ok_or(ApiError::NotFound("message"))
}

/// Attach reactions and attachments to message rows. Corrupt rows are
/// logged and skipped.
pub(crate) async fn hydrate(state: &AppState, rows: Vec<MessageRow>) -> Result<Vec<Message>, ApiError> {
    Ok(hydrate_each(state, rows)
        .await?
        .into_iter()
        .filter_map(|(id, message)| match message {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("Skipping corrupt message '{}': {}", id, e);
                None
            }
        })
        .collect())
}

/// Like `hydrate`, but one corrupt row fails the whole set.
pub(crate) async fn hydrate_all(state: &AppState, rows: Vec<MessageRow>) -> Result<Vec<Message>, ApiError> {
    hydrate_each(state, rows)
        .await?
        .into_iter()
        .map(|(id, message)| message.map_err(|e| ApiError::Internal(e.context(format!("corrupt message '{id}'")))))
        .collect()
}

async fn hydrate_each(
    state: &AppState,
    rows: Vec<MessageRow>,
) -> Result<Vec<(String, anyhow::Result<Message>)>, ApiError> {
    let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let (reaction_rows, attachment_rows) = blocking(state, move |db| {
        Ok((
            db.get_reactions_for_messages(&message_ids)?,
            db.get_attachments_for_messages(&message_ids)?,
        ))
    })
    .await?;

    // Group reactions by message_id -> emoji -> user_ids, keeping first-seen emoji order
    let mut reaction_map: HashMap<String, Vec<ReactionGroup>> = HashMap::new();
    for r in reaction_rows {
        let Ok(uid) = r.user_id.parse::<Uuid>() else {
            warn!("Corrupt user_id '{}' on reaction '{}'", r.user_id, r.id);
            continue;
        };
        let groups = reaction_map.entry(r.message_id).or_default();
        match groups.iter_mut().find(|g| g.emoji == r.emoji) {
            Some(group) => {
                group.user_ids.push(uid);
                group.count += 1;
            }
            None => groups.push(ReactionGroup {
                emoji: r.emoji,
                count: 1,
                user_ids: vec![uid],
            }),
        }
    }

    let mut attachment_map: HashMap<String, Vec<Attachment>> = HashMap::new();
    for a in attachment_rows {
        let message_id = a.message_id.clone();
        match a.into_model() {
            Ok(model) => attachment_map.entry(message_id).or_default().push(model),
            Err(e) => warn!("Corrupt attachment on message '{}': {}", message_id, e),
        }
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let id = row.id.clone();
            let reactions = reaction_map.remove(&id).unwrap_or_default();
            let attachments = attachment_map.remove(&id).unwrap_or_default();
            (id, message_from_row(row, reactions, attachments))
        })
        .collect())
}

fn message_from_row(
    row: MessageRow,
    reactions: Vec<ReactionGroup>,
    attachments: Vec<Attachment>,
) -> anyhow::Result<Message> {
    Ok(Message {
        id: row.id.parse()?,
        room_id: row.room_id.parse()?,
        sender_id: row.sender_id.parse()?,
        sender_username: row.sender_username,
        body: row.body,
        kind: row.kind.parse()?,
        created_at: parse_ts(&row.created_at)?,
        edited_at: row.edited_at.as_deref().map(parse_ts).transpose()?,
        deleted_at: row.deleted_at.as_deref().map(parse_ts).transpose()?,
        reply_to: row.reply_to.map(|r| r.parse()).transpose()?,
        attachments,
        reactions,
    })
}
