use axum::{http::StatusCode, Json};

use crate::models::ErrorResponse;
use crate::services::auth_service::Claims;

fn forbidden(error: &str) -> (StatusCode, Json<ErrorResponse>) {
    let status = StatusCode::FORBIDDEN;
    (status, Json(ErrorResponse {
        code: status.as_u16(),
        status: status.to_string(),
        error: error.to_string(),
    }))
}

pub fn ensure_admin(claims: &Claims) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if claims.is_admin() {
        return Ok(());
    }
    Err(forbidden("Admin access required"))
}

pub fn ensure_self_or_admin(claims: &Claims, user_id: &str) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if claims.sub == user_id || claims.is_admin() {
        return Ok(());
    }
    Err(forbidden("Access to another user's session denied"))
}

/// View access to a form, unless permission checks are disabled
pub fn ensure_form_access(claims: &Claims, form_id: &str, enforce: bool) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if !enforce || claims.can_access_form(form_id) {
        return Ok(());
    }
    Err(forbidden(&format!("Access to form '{}' denied", form_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(role: Option<&str>, permissions: &[&str]) -> Claims {
        Claims {
            sub: "u1".to_string(),
            email: None,
            name: None,
            role: role.map(|r| r.to_string()),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            session_id: None,
            exp: 0,
        }
    }

    #[test]
    fn admin_checks() {
        assert!(ensure_admin(&claims(Some("admin"), &[])).is_ok());
        let (status, _) = ensure_admin(&claims(None, &[])).unwrap_err();
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn users_see_their_own_session() {
        assert!(ensure_self_or_admin(&claims(None, &[]), "u1").is_ok());
        assert!(ensure_self_or_admin(&claims(None, &[]), "u2").is_err());
    }

    #[test]
    fn form_access_can_be_disabled() {
        let viewer = claims(None, &[]);
        assert!(ensure_form_access(&viewer, "form_1", true).is_err());
        assert!(ensure_form_access(&viewer, "form_1", false).is_ok());
    }
}
