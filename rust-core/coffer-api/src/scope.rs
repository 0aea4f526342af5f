// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Request scope middleware.
//
// Every request routed through the layer gets a fresh RequestContext in its
// extensions. Handlers lock it to reach the root mapping. Once the handler
// has produced a response the layer runs application teardown: a 5xx
// response aborts, anything else commits. A commit failure replaces the
// handler's response with the error.

use std::error::Error;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use coffer_request::{RequestContext, RequestError};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{ApiError, AppState};

/// Handle to the current request's context, inserted as a request extension.
#[derive(Clone)]
pub struct RequestScope(Arc<Mutex<RequestContext>>);

impl RequestScope {
    fn new(ctx: RequestContext) -> Self {
        Self(Arc::new(Mutex::new(ctx)))
    }

    pub async fn lock(&self) -> MutexGuard<'_, RequestContext> {
        self.0.lock().await
    }
}

pub async fn request_scope(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let scope = RequestScope::new(state.app.context());
    request.extensions_mut().insert(scope.clone());

    let response = next.run(request).await;

    let status = response.status();
    let failure = status
        .is_server_error()
        .then(|| RequestError::application(format!("handler responded {status}")));

    let mut ctx = scope.lock().await;
    let connected = ctx.is_connected();
    let torn_down = state
        .app
        .teardown(
            &mut ctx,
            failure.as_ref().map(|e| e as &(dyn Error + Send + Sync + 'static)),
        )
        .await;

    let conflict = torn_down.as_ref().is_err_and(RequestError::is_conflict);
    state
        .metrics
        .observe_teardown(connected, ctx.transaction_state(), conflict);
    debug!(
        request = %ctx.id(),
        status = status.as_u16(),
        connected,
        transaction = ?ctx.transaction_state(),
        "Request scope closed"
    );

    match torn_down {
        Ok(()) => response,
        Err(e) if failure.is_some() => {
            warn!(request = %ctx.id(), error = %e, "Teardown failed after error response");
            response
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
