//! Route guarding for axum routers.
//!
//! ```rust,ignore
//! use fitcoach_accounts::middleware::require_route;
//!
//! let guard = auth.route_guard(RouteSettings::default());
//! let dashboard = axum::Router::new()
//!     .route("/dashboard/sessions", get(sessions))
//!     .route("/admin/tickets", get(tickets))
//!     .layer(axum::middleware::from_fn_with_state(guard, require_route));
//! ```

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};

use crate::guard::RouteGuard;

/// Forward the request if the guard admits its path, otherwise redirect.
pub async fn require_route(State(guard): State<RouteGuard>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let decision = guard.resolve(&path).await;

    match guard.location(&decision) {
        None => next.run(request).await,
        Some(location) => {
            tracing::debug!(path = %path, decision = ?decision, "Route guard redirect");
            Redirect::to(&location).into_response()
        }
    }
}
