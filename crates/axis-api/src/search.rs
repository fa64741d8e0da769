use axum::{
    Extension, Json,
    extract::State,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use axis_types::api::{Claims, SearchHit, SearchScore, Success};
use axis_types::models::Message;

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiQuery};
use crate::messages::hydrate_all;

const MAX_TERMS: usize = 8;
const MAX_RESULTS: u32 = 50;
/// Candidates fetched per requested result before ranking.
const CANDIDATE_FACTOR: u32 = 5;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    pub room_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

/// Lowercased, deduplicated search terms with surrounding punctuation removed.
pub fn extract_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in query.split_whitespace() {
        let term = raw
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if !term.is_empty() && !terms.contains(&term) {
            terms.push(term);
            if terms.len() == MAX_TERMS {
                break;
            }
        }
    }
    terms
}

/// Distinct terms found, then total occurrences.
pub fn score(body: &str, terms: &[String]) -> SearchScore {
    let body = body.to_lowercase();
    terms.iter().fold(SearchScore::default(), |mut acc, term| {
        let hits = body.matches(term.as_str()).count() as u32;
        if hits > 0 {
            acc.terms += 1;
            acc.occurrences = acc.occurrences.saturating_add(hits);
        }
        acc
    })
}

/// Ranks by score, keeping the incoming (newest first) order among equals.
fn rank(messages: Vec<Message>, terms: &[String], limit: usize) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = messages
        .into_iter()
        .map(|message| {
            let score = score(&message.body, terms);
            SearchHit { message, score }
        })
        .filter(|hit| hit.score.terms > 0)
        .collect();
    hits.sort_by(|a, b| b.score.cmp(&a.score));
    hits.truncate(limit);
    hits
}

pub async fn search(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<SearchQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let terms = extract_terms(&query.q);
    if terms.is_empty() {
        return Err(ApiError::invalid("q", "must contain at least one search term"));
    }

    let limit = query.limit.clamp(1, MAX_RESULTS);
    let uid = claims.sub.to_string();
    let room = query.room_id.map(|r| r.to_string());
    let lookup = terms.clone();

    let rows = blocking(&state, move |db| {
        db.search_messages(&uid, room.as_deref(), &lookup, limit * CANDIDATE_FACTOR)
    })
    .await
    .map_err(search_failed)?;

    debug!("search by {} for {:?}: {} candidates", claims.username, terms, rows.len());
    let messages = hydrate_all(&state, rows).await.map_err(search_failed)?;
    Ok(Json(Success::new(rank(messages, &terms, limit as usize))))
}

/// Backend failures surface as an empty, tagged result rather than a partial one.
fn search_failed(err: ApiError) -> ApiError {
    match err {
        ApiError::Internal(source) => ApiError::EmptyResult {
            code: "search_failed",
            source,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axis_types::models::MessageKind;
    use chrono::{TimeZone, Utc};

    fn msg(body: &str, secs: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            room_id: Uuid::nil(),
            sender_id: Uuid::nil(),
            sender_username: "ana".into(),
            body: body.into(),
            kind: MessageKind::Text,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            edited_at: None,
            deleted_at: None,
            reply_to: None,
            attachments: vec![],
            reactions: vec![],
        }
    }

    #[test]
    fn terms_are_normalized() {
        assert_eq!(extract_terms("  Yoga, yoga MEDITATION! "), vec!["yoga", "meditation"]);
        assert!(extract_terms(" ?! ").is_empty());
        assert_eq!(extract_terms("a b c d e f g h i j").len(), MAX_TERMS);
    }

    #[test]
    fn distinct_terms_outrank_repetition() {
        let terms = extract_terms("sleep water");
        assert!(score("sleep and water", &terms) > score("sleep sleep sleep sleep", &terms));
        assert_eq!(score("nothing relevant", &terms), SearchScore::default());
    }

    #[test]
    fn heavy_repetition_still_loses_to_more_terms() {
        let terms = extract_terms("sleep water");
        let spam = msg(&"sleep ".repeat(12), 300);
        let both = msg("sleep then water", 100);
        assert_eq!(score(&spam.body, &terms), SearchScore { terms: 1, occurrences: 12 });

        let hits = rank(vec![spam.clone(), both.clone()], &terms, 10);
        let ids: Vec<Uuid> = hits.iter().map(|h| h.message.id).collect();
        assert_eq!(ids, vec![both.id, spam.id]);
    }

    #[test]
    fn ties_keep_recency_order() {
        let terms = extract_terms("run");
        // Candidates arrive newest first
        let newer = msg("run", 200);
        let older = msg("run", 100);
        let best = msg("run run", 50);
        let hits = rank(vec![newer.clone(), older.clone(), best.clone()], &terms, 10);
        let ids: Vec<Uuid> = hits.iter().map(|h| h.message.id).collect();
        assert_eq!(ids, vec![best.id, newer.id, older.id]);
    }
}
