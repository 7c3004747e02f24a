//! OAuth callback endpoint for connecting a Strava athlete.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use stride_strava::StravaClient;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "stride-web";

#[derive(Clone)]
pub struct AppState {
    pub strava: StravaClient,
}

impl AppState {
    pub fn new(strava: StravaClient) -> Self {
        Self { strava }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/strava/callback", get(strava_callback_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("STRIDE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let strava = StravaClient::new(stride_sync::strava_config_from_env()?)?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "callback server listening");
    axum::serve(listener, app(AppState::new(strava))).await?;
    Ok(())
}

async fn strava_callback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = query.error.as_deref() {
        warn!(error, "strava authorization denied");
        return (StatusCode::BAD_REQUEST, "Authorization failed.").into_response();
    }
    let Some(code) = query.code.as_deref().filter(|c| !c.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Authorization failed.").into_response();
    };

    match state.strava.exchange_authorization_code(code).await {
        Ok(grant) => {
            // TODO: upsert the exchanged token pair into public.strava_tokens once the
            // athlete onboarding flow is settled.
            info!(
                athlete_id = grant.athlete.as_ref().map(|a| a.id),
                expires_at = grant.expires_at,
                "authorization code exchanged"
            );
            (
                StatusCode::OK,
                "Authorization successful. You can close this tab.",
            )
                .into_response()
        }
        Err(err) => {
            warn!(error = %err, "authorization code exchange failed");
            (StatusCode::BAD_GATEWAY, "Token exchange failed.").into_response()
        }
    }
}
