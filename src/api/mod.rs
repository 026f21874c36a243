//! API endpoints for the maintenance gate service.
//!
//! This module provides the HTTP surface: the gate decision endpoint the
//! render boundary calls on every page load, and the admin endpoints for
//! settings, analytics, and private access management.

use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::policy::{GateDecision, PolicyEvaluator, RequestContext, PREVIEW_NONCE_PARAM};
use crate::core::private_access::{
    generate_token, hash_password, issue_nonce, AccessFormError, CookieDirective, PREVIEW_ACTION,
};
use crate::core::settings::{GateSettings, SettingsService};
use crate::core::{Analytics, BypassReason};
use crate::utils::get_current_timestamp;

pub struct ApiState {
    pub evaluator: PolicyEvaluator,
    pub settings: SettingsService,
    pub analytics: Analytics,
    pub analytics_enabled: bool,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/evaluate").route(web::post().to(evaluate)))
            .service(web::resource("/status").route(web::get().to(status)))
            .service(
                web::resource("/settings")
                    .route(web::get().to(get_settings))
                    .route(web::put().to(update_settings)),
            )
            .service(
                web::resource("/analytics")
                    .route(web::get().to(get_analytics))
                    .route(web::delete().to(reset_analytics)),
            )
            .service(
                web::resource("/private-token")
                    .route(web::post().to(generate_private_token))
                    .route(web::delete().to(revoke_private_token)),
            )
            .service(
                web::resource("/private-password")
                    .route(web::put().to(set_private_password))
                    .route(web::delete().to(revoke_private_password)),
            )
            .service(web::resource("/preview-nonce").route(web::get().to(preview_nonce))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Gate decision response returned to the render boundary
#[derive(Serialize)]
struct EvaluateResponse {
    request_id: Uuid,
    active: bool,
    decision: &'static str,
    reason: Option<BypassReason>,
    status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    set_cookie: Option<CookieDirective>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    form_error: Option<AccessFormError>,
}

#[derive(Serialize)]
struct StatusResponse {
    active: bool,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

#[derive(Serialize)]
struct PreviewNonceResponse {
    nonce: String,
    param: &'static str,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

fn message(text: &str) -> MessageResponse {
    MessageResponse {
        message: text.to_string(),
    }
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Gate decision endpoint. Runs the full evaluation for one request and
/// records analytics for real end-user traffic.
pub async fn evaluate(
    state: web::Data<ApiState>,
    ctx: web::Json<RequestContext>,
) -> impl Responder {
    let request_id = Uuid::new_v4();
    let ctx = ctx.into_inner();
    let settings = state.settings.load().await;
    let now = Utc::now();

    let active = state.evaluator.is_gate_active(&settings, now);
    let evaluation = state.evaluator.evaluate(&ctx, &settings, now);
    let ts = now.timestamp();

    match evaluation.decision {
        GateDecision::Bypass(reason) => {
            metrics::increment_counter!("gate_requests_bypassed");
            debug!("request {} bypassed: {}", request_id, reason);
            if state.analytics_enabled {
                if let Err(e) = state.analytics.record_bypass(&ctx, reason, ts).await {
                    warn!("request {} bypass not recorded: {}", request_id, e);
                }
            }
        }
        GateDecision::Block => {
            metrics::increment_counter!("gate_requests_blocked");
            debug!("request {} blocked", request_id);
            if state.analytics_enabled {
                if let Err(e) = state.analytics.record_blocked(&ctx, ts).await {
                    warn!("request {} block not recorded: {}", request_id, e);
                }
            }
        }
        GateDecision::Inactive | GateDecision::Preview => {}
    }

    let (decision, reason) = match evaluation.decision {
        GateDecision::Inactive => ("pass", None),
        GateDecision::Preview => ("preview", None),
        GateDecision::Bypass(reason) => ("bypass", Some(reason)),
        GateDecision::Block => ("block", None),
    };

    HttpResponse::Ok().json(EvaluateResponse {
        request_id,
        active,
        decision,
        reason,
        status_code: evaluation.status,
        set_cookie: evaluation.set_cookie,
        redirect_to: evaluation.redirect_to,
        form_error: evaluation.form_error,
    })
}

/// Whether the gate currently applies
async fn status(state: web::Data<ApiState>) -> impl Responder {
    let settings = state.settings.load().await;
    HttpResponse::Ok().json(StatusResponse {
        active: state.evaluator.is_gate_active(&settings, Utc::now()),
    })
}

/// Current settings, with secret material redacted
async fn get_settings(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(redacted(state.settings.load().await))
}

/// Replace the settings record. Secrets are managed through their own
/// endpoints and survive a settings save untouched.
async fn update_settings(
    state: web::Data<ApiState>,
    body: web::Json<GateSettings>,
) -> impl Responder {
    let current = state.settings.load().await;
    let mut incoming = body.into_inner();
    incoming.private_password_hash = current.private_password_hash;
    incoming.private_token = current.private_token;

    match state.settings.save(incoming).await {
        Ok(saved) => HttpResponse::Ok().json(redacted(saved)),
        Err(e) => {
            warn!("failed to save settings: {}", e);
            HttpResponse::InternalServerError().json(message("failed to save settings"))
        }
    }
}

/// Analytics overview
async fn get_analytics(state: web::Data<ApiState>) -> impl Responder {
    match state.analytics.get_overview(get_current_timestamp()).await {
        Ok(overview) => HttpResponse::Ok().json(overview),
        Err(e) => {
            warn!("failed to load analytics: {}", e);
            HttpResponse::InternalServerError().json(message("failed to load analytics"))
        }
    }
}

/// Clear both analytics records
async fn reset_analytics(state: web::Data<ApiState>) -> impl Responder {
    match state.analytics.reset().await {
        Ok(()) => HttpResponse::Ok().json(message("analytics reset")),
        Err(e) => {
            warn!("failed to reset analytics: {}", e);
            HttpResponse::InternalServerError().json(message("failed to reset analytics"))
        }
    }
}

/// Generate and store a fresh private access token. The token is returned
/// once and never readable again.
async fn generate_private_token(state: web::Data<ApiState>) -> impl Responder {
    let mut settings = state.settings.load().await;
    let token = generate_token();
    settings.private_token = Some(token.clone());

    match state.settings.save(settings).await {
        Ok(_) => HttpResponse::Ok().json(TokenResponse { token }),
        Err(e) => {
            warn!("failed to store private token: {}", e);
            HttpResponse::InternalServerError().json(message("failed to store private token"))
        }
    }
}

/// Revoke the private access token, invalidating issued cookies
async fn revoke_private_token(state: web::Data<ApiState>) -> impl Responder {
    let mut settings = state.settings.load().await;
    settings.private_token = None;

    match state.settings.save(settings).await {
        Ok(_) => HttpResponse::Ok().json(message("private token revoked")),
        Err(e) => {
            warn!("failed to revoke private token: {}", e);
            HttpResponse::InternalServerError().json(message("failed to revoke private token"))
        }
    }
}

/// Hash and store the private access password
async fn set_private_password(
    state: web::Data<ApiState>,
    body: web::Json<PasswordRequest>,
) -> impl Responder {
    if body.password.trim().is_empty() {
        return HttpResponse::BadRequest().json(message("password must not be empty"));
    }

    let hash = match hash_password(&body.password) {
        Ok(hash) => hash,
        Err(e) => {
            warn!("failed to hash private password: {}", e);
            return HttpResponse::InternalServerError()
                .json(message("failed to hash private password"));
        }
    };

    let mut settings = state.settings.load().await;
    settings.private_password_hash = Some(hash);

    match state.settings.save(settings).await {
        Ok(_) => HttpResponse::Ok().json(message("private password set")),
        Err(e) => {
            warn!("failed to store private password: {}", e);
            HttpResponse::InternalServerError().json(message("failed to store private password"))
        }
    }
}

/// Revoke the private access password, invalidating issued cookies
async fn revoke_private_password(state: web::Data<ApiState>) -> impl Responder {
    let mut settings = state.settings.load().await;
    settings.private_password_hash = None;

    match state.settings.save(settings).await {
        Ok(_) => HttpResponse::Ok().json(message("private password revoked")),
        Err(e) => {
            warn!("failed to revoke private password: {}", e);
            HttpResponse::InternalServerError().json(message("failed to revoke private password"))
        }
    }
}

/// Issue a preview nonce for the admin UI
async fn preview_nonce(state: web::Data<ApiState>) -> impl Responder {
    let nonce = issue_nonce(
        state.evaluator.secret(),
        PREVIEW_ACTION,
        get_current_timestamp(),
    );
    HttpResponse::Ok().json(PreviewNonceResponse {
        nonce,
        param: PREVIEW_NONCE_PARAM,
    })
}

fn redacted(mut settings: GateSettings) -> GateSettings {
    settings.private_password_hash = None;
    settings.private_token = None;
    settings
}
