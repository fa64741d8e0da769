use axum::{
    Extension, Json,
    extract::State,
    response::IntoResponse,
};
use uuid::Uuid;

use axis_types::api::{Claims, Success, ToggleReactionRequest, ToggleReactionResponse};
use axis_types::events::RealtimeEvent;

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiJson, ApiPath};
use crate::messages::load_live_message;
use crate::rooms::require_participant;

const MAX_EMOJI_BYTES: usize = 32;

fn is_valid_emoji(emoji: &str) -> bool {
    !emoji.is_empty() && emoji.len() <= MAX_EMOJI_BYTES && !emoji.chars().any(char::is_whitespace)
}

/// Adds the caller's reaction, or removes it if already present.
pub async fn toggle_reaction(
    State(state): State<AppState>,
    ApiPath((room_id, message_id)): ApiPath<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    ApiJson(req): ApiJson<ToggleReactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_valid_emoji(&req.emoji) {
        return Err(ApiError::invalid("emoji", "a single emoji or shortcode"));
    }
    require_participant(&state, room_id, claims.sub).await?;
    load_live_message(&state, room_id, message_id).await?;

    let reaction_id = Uuid::new_v4();
    let (mid, uid, emoji) = (message_id.to_string(), claims.sub.to_string(), req.emoji.clone());
    let (added, _id) = blocking(&state, move |db| {
        db.toggle_reaction(&reaction_id.to_string(), &mid, &uid, &emoji)
    })
    .await?;

    if added {
        state.dispatcher.broadcast(RealtimeEvent::ReactionAdd {
            room_id,
            message_id,
            user_id: claims.sub,
            emoji: req.emoji,
        });
    } else {
        state.dispatcher.broadcast(RealtimeEvent::ReactionRemove {
            room_id,
            message_id,
            user_id: claims.sub,
            emoji: req.emoji,
        });
    }

    Ok(Json(Success::new(ToggleReactionResponse { added })))
}
