use std::time::Duration;

use axum::http::{self, HeaderMap};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AuthError;

const ADMIN_ROLES: [&str; 2] = ["admin", "super_admin"];

/// Claims carried by a bearer token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// User id
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Expiry, seconds since epoch
    pub exp: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role
            .as_deref()
            .map(|role| ADMIN_ROLES.contains(&role))
            .unwrap_or(false)
    }

    fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// View access: admins, `forms:view`, `forms:edit` or a form scoped grant
    pub fn can_access_form(&self, form_id: &str) -> bool {
        self.is_admin()
            || self.has_permission("forms:view")
            || self.has_permission("forms:edit")
            || self.has_permission(&format!("form:{}:view", form_id))
            || self.has_permission(&format!("form:{}:edit", form_id))
    }

    pub fn can_edit_form(&self, form_id: &str) -> bool {
        self.is_admin()
            || self.has_permission("forms:edit")
            || self.has_permission(&format!("form:{}:edit", form_id))
    }

    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.email.as_deref())
    }
}

/// Verifies bearer tokens for the gateway and the HTTP routes
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;

    /// Number of verified tokens held in memory
    fn cached_tokens(&self) -> u64 {
        0
    }
}

/// HS256 JWT verifier with a cache of already verified tokens
pub struct JwtVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
    cache: Cache<String, Claims>,
}

impl JwtVerifier {
    /// Without a secret every token is refused
    pub fn new(secret: Option<&str>, cache_ttl: Duration) -> Self {
        if secret.is_none() {
            warn!("No JWT secret configured - all connections will be refused");
        }
        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
            cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(cache_ttl)
                .build(),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::NotConfigured)?;

        // Cached tokens still expire on time
        if let Some(claims) = self.cache.get(token) {
            if claims.exp > chrono::Utc::now().timestamp() {
                return Ok(claims);
            }
            self.cache.invalidate(token);
            return Err(AuthError::Expired);
        }

        match decode::<Claims>(token, key, &self.validation) {
            Ok(data) => {
                debug!("JWT token validated successfully for user: {}", data.claims.sub);
                self.cache.insert(token.to_string(), data.claims.clone());
                Ok(data.claims)
            }
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => Err(AuthError::Expired),
                _ => Err(AuthError::Invalid(e.to_string())),
            },
        }
    }

    fn cached_tokens(&self) -> u64 {
        self.cache.entry_count()
    }
}

fn strip_bearer(value: &str) -> &str {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("Bearer%20"))
        .unwrap_or(value)
        .trim()
}

/// Find the bearer token: Authorization header, then `token` or `authorization`
/// query parameter, then the `auth_token` cookie.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Result<String, AuthError> {
    // 1. Authorization header
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| AuthError::Invalid("Invalid Authorization header".to_string()))?;
        let token = strip_bearer(auth_str);
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }

    // 2. Query parameters
    if let Some(query) = query {
        for pair in query.split('&') {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            if (name == "token" || name == "authorization") && !value.is_empty() {
                return Ok(strip_bearer(value).to_string());
            }
        }
    }

    // 3. Cookie
    if let Some(cookie_header) = headers.get(http::header::COOKIE) {
        let cookie_str = cookie_header
            .to_str()
            .map_err(|_| AuthError::Invalid("Invalid Cookie header".to_string()))?;
        for cookie in cookie::Cookie::split_parse(cookie_str).flatten() {
            if cookie.name() == "auth_token" && !cookie.value().is_empty() {
                return Ok(cookie.value().to_string());
            }
        }
    }

    Err(AuthError::Missing)
}

// Get the auth token from a request
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, AuthError> {
    extract_token(req.headers(), req.uri().query())
}
