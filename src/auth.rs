use std::{collections::HashSet, env};

use axum::http::HeaderMap;

use crate::errors::AppError;

const API_KEY_HEADER: &str = "x-api-key";

/// Single API-key check standing in for the out-of-scope authentication
/// collaborator (§1: "authentication ... beyond a single API-key check").
/// No rate limiting: the full policy the teacher's `ApiKeyRegistry` also
/// enforces is genuinely out of this system's scope.
#[derive(Debug, Clone)]
pub struct ApiKeyRegistry {
    valid_keys: HashSet<String>,
}

impl ApiKeyRegistry {
    pub fn from_env() -> Self {
        let keys = env::var("SERVING_API_KEYS").unwrap_or_else(|_| "dev-key".to_owned());
        Self { valid_keys: parse_keys(&keys) }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let api_key = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::Unauthorized("missing x-api-key header".to_owned()))?;

        if !self.valid_keys.contains(api_key) {
            return Err(AppError::Unauthorized("invalid api key".to_owned()));
        }
        Ok(())
    }
}

fn parse_keys(raw: &str) -> HashSet<String> {
    let mut valid_keys =
        raw.split(',').map(str::trim).filter(|key| !key.is_empty()).map(ToOwned::to_owned).collect::<HashSet<_>>();
    if valid_keys.is_empty() {
        valid_keys.insert("dev-key".to_owned());
    }
    valid_keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_key(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, key.parse().unwrap());
        headers
    }

    #[test]
    fn missing_header_is_unauthorized() {
        let registry = ApiKeyRegistry { valid_keys: HashSet::from(["dev-key".to_owned()]) };
        assert!(matches!(registry.authenticate(&HeaderMap::new()), Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn unknown_key_is_unauthorized() {
        let registry = ApiKeyRegistry { valid_keys: HashSet::from(["dev-key".to_owned()]) };
        assert!(matches!(registry.authenticate(&headers_with_key("wrong")), Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn known_key_authenticates() {
        let registry = ApiKeyRegistry { valid_keys: HashSet::from(["dev-key".to_owned()]) };
        assert!(registry.authenticate(&headers_with_key("dev-key")).is_ok());
    }

    #[test]
    fn empty_configured_value_falls_back_to_dev_key() {
        assert_eq!(parse_keys(""), HashSet::from(["dev-key".to_owned()]));
        assert_eq!(parse_keys("a, b ,c"), HashSet::from(["a".to_owned(), "b".to_owned(), "c".to_owned()]));
    }
}
