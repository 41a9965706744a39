//! Identity header extractors.
//!
//! Authentication happens at the gateway; downstream services receive the
//! verified identity in headers. `UserId` pulls `X-User-ID`, `AdminKey`
//! pulls `X-Admin-Key` (validated against the configured key by the
//! route handler, since only the flash-sale service knows it).

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

/// The gateway-verified user handle from `X-User-ID`.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get("X-User-ID")
            .ok_or((StatusCode::UNAUTHORIZED, "Missing X-User-ID header".to_string()))?
            .to_str()
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid X-User-ID header".to_string()))?
            .trim();

        if value.is_empty() {
            return Err((StatusCode::UNAUTHORIZED, "Empty X-User-ID header".to_string()));
        }

        Ok(Self(value.to_string()))
    }
}

/// The raw `X-Admin-Key` header; handlers compare it to their configured
/// key.
#[derive(Debug, Clone)]
pub struct AdminKey(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AdminKey
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get("X-Admin-Key")
            .ok_or((StatusCode::UNAUTHORIZED, "Missing X-Admin-Key header".to_string()))?
            .to_str()
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid X-Admin-Key header".to_string()))?;

        Ok(Self(value.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract_user(request: Request<()>) -> Result<UserId, (StatusCode, String)> {
        let (mut parts, ()) = request.into_parts();
        UserId::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn user_id_extracts_header() {
        let request = Request::builder()
            .header("X-User-ID", "user-42")
            .body(())
            .unwrap();
        let user = extract_user(request).await.unwrap();
        assert_eq!(user.0, "user-42");
    }

    #[tokio::test]
    async fn missing_user_id_is_unauthorized() {
        let request = Request::builder().body(()).unwrap();
        let err = extract_user(request).await.unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn blank_user_id_is_unauthorized() {
        let request = Request::builder()
            .header("X-User-ID", "   ")
            .body(())
            .unwrap();
        let err = extract_user(request).await.unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }
}
