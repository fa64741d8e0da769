use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use axis_gateway::connection;
use axis_types::api::HealthResponse;

use crate::auth::{self, AppState};
use crate::middleware::require_auth;
use crate::{billing, mentions, messages, reactions, rooms, search, wellness};

/// The full HTTP surface: REST under `/api`, `/health`, and the `/gateway` WebSocket.
pub fn app(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/categories", get(wellness::list_categories))
        .route("/api/billing/webhook", post(billing::webhook))
        .route("/health", get(health))
        .route("/gateway", get(ws_upgrade));

    let chat_routes = Router::new()
        .route("/api/chat/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route(
            "/api/chat/rooms/{room_id}",
            get(rooms::get_room).delete(rooms::delete_room),
        )
        .route(
            "/api/chat/rooms/{room_id}/participants",
            get(rooms::list_participants).post(rooms::add_participant),
        )
        .route(
            "/api/chat/rooms/{room_id}/participants/{user_id}",
            delete(rooms::remove_participant),
        )
        .route(
            "/api/chat/rooms/{room_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/api/chat/rooms/{room_id}/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route(
            "/api/chat/rooms/{room_id}/messages/{message_id}/reactions",
            post(reactions::toggle_reaction),
        )
        .route("/api/chat/search", get(search::search))
        .route("/api/chat/mentions", get(mentions::list_mentions));

    let wellness_routes = Router::new()
        .route("/api/checkins", get(wellness::list_checkins))
        .route("/api/checkins/toggle", post(wellness::toggle_checkin))
        .route("/api/resonance", get(wellness::resonance))
        .route(
            "/api/time-blocks",
            get(wellness::list_time_blocks).post(wellness::create_time_block),
        )
        .route("/api/time-blocks/{block_id}", delete(wellness::delete_time_block));

    let protected_routes = chat_routes
        .merge(wellness_routes)
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".into(),
        time: chrono::Utc::now(),
    })
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let (dispatcher, db, secret) = (state.dispatcher.clone(), state.db.clone(), state.jwt_secret.clone());
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, db, secret))
}
