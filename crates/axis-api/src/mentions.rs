use axum::{
    Extension, Json,
    extract::State,
    response::IntoResponse,
};
use serde::Deserialize;

use axis_types::api::{Claims, Success};

use crate::auth::AppState;
use crate::blocking;
use crate::error::{ApiError, ApiQuery};
use crate::messages::hydrate;

#[derive(Debug, Deserialize)]
pub struct MentionQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

fn is_handle_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// `@handle` tokens in a message body, lowercased and deduplicated in
/// order of first appearance. An `@` preceded by a word character (as in
/// an email address) does not start a mention. Trailing dots are dropped
/// so "thanks @ana." mentions `ana`.
pub fn extract_mentions(body: &str) -> Vec<String> {
    let mut handles: Vec<String> = Vec::new();
    let mut prev: Option<char> = None;
    let mut chars = body.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let starts_mention = c == '@' && !prev.is_some_and(|p| p.is_alphanumeric() || p == '_');
        prev = Some(c);
        if !starts_mention {
            continue;
        }

        let start = i + 1;
        let mut end = start;
        while let Some(&(j, n)) = chars.peek() {
            if !is_handle_char(n) {
                break;
            }
            end = j + n.len_utf8();
            prev = Some(n);
            chars.next();
        }

        let handle = body[start..end].trim_end_matches('.').to_lowercase();
        if (3..=32).contains(&handle.len()) && !handles.contains(&handle) {
            handles.push(handle);
        }
    }

    handles
}

/// Messages that mention the caller, newest first.
pub async fn list_mentions(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<MentionQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let uid = claims.sub.to_string();
    let limit = query.limit.clamp(1, 200);
    let rows = blocking(&state, move |db| db.get_mentions_for_user(&uid, limit)).await?;
    Ok(Json(Success::new(hydrate(&state, rows).await?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_handles() {
        assert_eq!(extract_mentions("hey @Ana and @bob_r"), vec!["ana", "bob_r"]);
    }

    #[test]
    fn dedups_case_insensitively() {
        assert_eq!(extract_mentions("@ana @ANA @Ana"), vec!["ana"]);
    }

    #[test]
    fn ignores_email_addresses() {
        assert!(extract_mentions("mail me at ana@example.com").is_empty());
    }

    #[test]
    fn strips_trailing_punctuation() {
        assert_eq!(extract_mentions("thanks @ana."), vec!["ana"]);
        assert_eq!(extract_mentions("(@carlos), see this"), vec!["carlos"]);
    }

    #[test]
    fn rejects_short_handles() {
        assert!(extract_mentions("@a @ @xy").is_empty());
    }
}
