use crate::error::{AppError, AppResult};
use crate::users::UserStore;
use axum::http::{HeaderMap, StatusCode};

/// Identity resolved from a caller API key.
#[derive(Clone, Debug)]
pub struct AuthResult {
    pub user_id: String,
    pub api_key_id: String,
}

#[derive(Clone)]
pub struct AuthState {
    user_store: UserStore,
}

impl AuthState {
    pub fn new(user_store: UserStore) -> Self {
        Self { user_store }
    }

    /// Authenticate a token using database API keys.
    pub async fn authenticate_token(&self, token: &str) -> Option<AuthResult> {
        if !token.starts_with("sk-") || token.len() < 12 {
            return None;
        }
        match self.user_store.validate_api_key(token).await {
            Ok(Some((api_key, user))) => Some(AuthResult {
                user_id: user.id,
                api_key_id: api_key.id,
            }),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "api key lookup failed");
                None
            }
        }
    }

    pub async fn authenticate_headers(&self, headers: &HeaderMap) -> AppResult<AuthResult> {
        let token = extract_token(headers)
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing auth"))?;
        self.authenticate_token(token)
            .await
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token"))
    }
}

/// Accepts `Authorization: Bearer`, `x-api-key` and `mj-api-secret`.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim());
    }
    ["x-api-key", "mj-api-secret"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_from_any_supported_header() {
        let mut headers = HeaderMap::new();
        assert!(extract_token(&headers).is_none());
        headers.insert("mj-api-secret", "sk-mj".parse().unwrap());
        assert_eq!(extract_token(&headers), Some("sk-mj"));
        headers.insert("authorization", "Bearer sk-bearer".parse().unwrap());
        assert_eq!(extract_token(&headers), Some("sk-bearer"));
    }
}
