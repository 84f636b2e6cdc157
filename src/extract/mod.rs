use std::sync::Arc;

use axum_core::extract::FromRequestParts;
use http::{StatusCode, request::Parts};

use crate::{Inner, Session};

/// Axum Extractor for [`Session`].
impl<S> FromRequestParts<S> for Session
where
    S: Sync + Send,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let inner_session = parts
            .extensions
            .get::<Arc<Inner>>()
            .cloned()
            .ok_or_else(|| {
                tracing::error!("session layer not found in the request extensions");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "session not found in the request",
                )
            })?;

        Ok(Session::new(inner_session))
    }
}
