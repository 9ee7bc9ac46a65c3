use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use hyper::StatusCode;

use crate::app::App;

/// Guards the admin surface with a bearer token. If no token is configured
/// the admin routes are left open, matching the rest of this process's
/// "secure by configuration, not by default" posture for operator-only
/// surfaces.
pub async fn middleware(
    State(app): State<Arc<App>>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(configured) = &app.config.admin.token else {
        return Ok(next.run(request).await);
    };

    match auth {
        Some(TypedHeader(Authorization(bearer))) if bearer.token() == configured.expose() => {
            Ok(next.run(request).await)
        }
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
