//! # Health Check
//!
//! Liveness plus the relay counters, for load balancers and operators.
//!
//! ## Response Shape:
//! ```json
//! {
//!   "status": "healthy",
//!   "timestamp": "2025-01-01T12:00:00+00:00",
//!   "uptime_seconds": 3600,
//!   "service": { "name": "stt-relay", "version": "0.1.0" },
//!   "sessions": { "active": 2, "total": 40, "failed": 1 },
//!   "audio_bytes_relayed": 1536000,
//!   "providers": {
//!     "deepgram": { "credentials_configured": true, "endpoint": "wss://..." },
//!     "speechmatics": { "credentials_configured": false, "endpoint": "wss://..." }
//!   }
//! }
//! ```
//!
//! API keys are never included, only whether one is configured.

use crate::provider::ProviderKind;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

fn provider_status(state: &AppState, provider: ProviderKind) -> Value {
    let setup = provider.setup(&state.config);
    json!({
        "credentials_configured": setup.credentials.is_configured(),
        "endpoint": setup.credentials.endpoint,
        "sample_rate": setup.audio.sample_rate,
        "language": setup.audio.language
    })
}

/// `GET /health` and `GET /api/v1/health`
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions,
            "failed": metrics.failed_sessions
        },
        "audio_bytes_relayed": metrics.audio_bytes_relayed,
        "default_provider": state.config.relay.default_provider,
        "providers": {
            "deepgram": provider_status(&state, ProviderKind::Deepgram),
            "speechmatics": provider_status(&state, ProviderKind::Speechmatics)
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::test::{call_service, init_service, read_body, TestRequest};
    use actix_web::App;

    #[actix_web::test]
    async fn test_health_reports_counters_without_keys() {
        let mut config = AppConfig::default();
        config.deepgram.api_key = Some("secret-key".to_string());
        let state = AppState::new(config);
        state.record_session_end(true, 640);
        let _active = state.session_started();

        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = TestRequest::get().uri("/health").to_request();
        let resp = call_service(&app, req).await;
        assert!(resp.status().is_success());

        let body = read_body(resp).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("secret-key"));

        let health: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["sessions"]["active"], 1);
        assert_eq!(health["sessions"]["failed"], 1);
        assert_eq!(health["audio_bytes_relayed"], 640);
        assert_eq!(health["default_provider"], "speechmatics");
        assert_eq!(health["providers"]["deepgram"]["credentials_configured"], true);
        assert_eq!(health["providers"]["speechmatics"]["credentials_configured"], false);
    }
}
