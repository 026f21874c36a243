//! Access policy evaluation for the maintenance gate service.
//!
//! Given a request context and the persisted gate settings, decides
//! whether the gate page should be shown and, if not, why the request is
//! allowed through. The bypass checks run in a fixed order with the first
//! match winning; the order is a policy decision, not incidental.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::core::private_access::{
    check_private_access, verify_nonce, AccessFormError, CookieDirective, PREVIEW_ACTION,
};
use crate::core::schedule::{is_recurring_active, is_window_active};
use crate::core::settings::{normalize_path, GateMode, GateSettings};

/// Query parameter that requests a gate preview.
pub const PREVIEW_PARAM: &str = "preview";
/// Query parameter carrying the preview nonce.
pub const PREVIEW_NONCE_PARAM: &str = "preview_nonce";

/// Authenticated caller facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserContext {
    pub is_admin: bool,
    pub roles: Vec<String>,
}

/// The facts about one request the evaluator needs, supplied by the
/// hosting layer. The evaluator has no dependency on any web framework;
/// everything it consults is in here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    pub path: String,
    pub query: HashMap<String, String>,
    pub form: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub ip: String,
    pub user: Option<UserContext>,
    pub is_cli: bool,
    pub is_cron: bool,
    pub is_admin_backend: bool,
    pub is_admin_ajax: bool,
    pub is_rest: bool,
    pub is_editor_preview: bool,
}

/// Why a request was allowed through an active gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    Cli,
    Cron,
    AdminBackend,
    AdminAjaxAllowed,
    LoginPage,
    EditorPreview,
    PrivateCookie,
    PrivateToken,
    PrivatePassword,
    RestLoggedIn,
    RestAllowed,
    UserAllowed,
    IpWhitelist,
    PathWhitelist,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Cli => "cli",
            BypassReason::Cron => "cron",
            BypassReason::AdminBackend => "admin_backend",
            BypassReason::AdminAjaxAllowed => "admin_ajax_allowed",
            BypassReason::LoginPage => "login_page",
            BypassReason::EditorPreview => "editor_preview",
            BypassReason::PrivateCookie => "private_cookie",
            BypassReason::PrivateToken => "private_token",
            BypassReason::PrivatePassword => "private_password",
            BypassReason::RestLoggedIn => "rest_logged_in",
            BypassReason::RestAllowed => "rest_allowed",
            BypassReason::UserAllowed => "user_allowed",
            BypassReason::IpWhitelist => "ip_whitelist",
            BypassReason::PathWhitelist => "path_whitelist",
        }
    }
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome category for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Gate is not active; request passes through untouched.
    Inactive,
    /// Signed admin preview; render the gate page but count nothing.
    Preview,
    /// Gate is active but the request matched a bypass rule.
    Bypass(BypassReason),
    /// Gate is active and nothing matched; render the gate page.
    Block,
}

/// Full evaluation result: the decision plus any side effects the caller
/// must apply (cookie to set, redirect to issue, form error to display).
#[derive(Debug)]
pub struct Evaluation {
    pub decision: GateDecision,
    /// HTTP status the gate page should be served with, when one is shown.
    pub status: Option<u16>,
    pub set_cookie: Option<CookieDirective>,
    pub redirect_to: Option<String>,
    pub form_error: Option<AccessFormError>,
}

impl Evaluation {
    fn pass(decision: GateDecision) -> Self {
        Self {
            decision,
            status: None,
            set_cookie: None,
            redirect_to: None,
            form_error: None,
        }
    }
}

/// Render status for a blocked request: maintenance signals unavailability,
/// coming-soon is an ordinary page.
pub fn blocked_status(mode: GateMode) -> u16 {
    match mode {
        GateMode::Maintenance => 503,
        GateMode::ComingSoon => 200,
    }
}

/// The access policy evaluator. Holds the process-wide secret material
/// and the entitlement flag; everything request- or settings-shaped is
/// passed in per call.
pub struct PolicyEvaluator {
    secret: String,
    enhanced_tier: bool,
}

impl PolicyEvaluator {
    pub fn new(secret: impl Into<String>, enhanced_tier: bool) -> Self {
        Self {
            secret: secret.into(),
            enhanced_tier,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Whether the gate currently applies at all: enabled, and either
    /// unscheduled or inside an active window or recurring rule.
    pub fn is_gate_active(&self, settings: &GateSettings, now: DateTime<Utc>) -> bool {
        if !settings.enabled {
            return false;
        }
        if !settings.schedule_enabled {
            return true;
        }
        let ts = now.timestamp();
        if settings
            .schedule_windows
            .iter()
            .any(|w| is_window_active(ts, w.start, w.end))
        {
            return true;
        }
        settings.recurring_enabled
            && settings
                .recurring_rules
                .iter()
                .any(|r| is_recurring_active(r, now, &settings.site_timezone))
    }

    /// Evaluate one request against the gate.
    pub fn evaluate(
        &self,
        ctx: &RequestContext,
        settings: &GateSettings,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let ts = now.timestamp();

        // A signed preview always renders the gate page, active or not,
        // and is never counted.
        if self.is_preview(ctx, ts) {
            return Evaluation {
                decision: GateDecision::Preview,
                status: Some(200),
                set_cookie: None,
                redirect_to: None,
                form_error: None,
            };
        }

        if !self.is_gate_active(settings, now) {
            return Evaluation::pass(GateDecision::Inactive);
        }

        let path = normalize_path(&ctx.path);

        if ctx.is_cli {
            return Evaluation::pass(GateDecision::Bypass(BypassReason::Cli));
        }
        if ctx.is_cron {
            return Evaluation::pass(GateDecision::Bypass(BypassReason::Cron));
        }
        if ctx.is_admin_backend {
            return Evaluation::pass(GateDecision::Bypass(BypassReason::AdminBackend));
        }
        if ctx.is_admin_ajax && settings.allow_admin_ajax {
            return Evaluation::pass(GateDecision::Bypass(BypassReason::AdminAjaxAllowed));
        }
        if settings.login_paths.iter().any(|p| path_matches(&path, p)) {
            return Evaluation::pass(GateDecision::Bypass(BypassReason::LoginPage));
        }
        if ctx.is_editor_preview && settings.allow_editor_preview {
            return Evaluation::pass(GateDecision::Bypass(BypassReason::EditorPreview));
        }

        let guard = check_private_access(ctx, settings, &self.secret, self.enhanced_tier, ts);
        if let Some(reason) = guard.reason {
            return Evaluation {
                decision: GateDecision::Bypass(reason),
                status: None,
                set_cookie: guard.set_cookie,
                redirect_to: guard.redirect_to,
                form_error: None,
            };
        }
        let form_error = guard.error;

        if ctx.is_rest {
            if ctx.user.is_some() {
                return Evaluation::pass(GateDecision::Bypass(BypassReason::RestLoggedIn));
            }
            if settings.allow_rest {
                return Evaluation::pass(GateDecision::Bypass(BypassReason::RestAllowed));
            }
            // Anonymous REST with REST access disabled terminates here:
            // the whitelist checks below are never consulted for it.
            return self.block(settings, form_error);
        }

        if let Some(user) = &ctx.user {
            let role_allowed = user
                .roles
                .iter()
                .any(|r| settings.allowed_roles.iter().any(|a| a.eq_ignore_ascii_case(r)));
            if (settings.exclude_admin && user.is_admin) || role_allowed {
                return Evaluation::pass(GateDecision::Bypass(BypassReason::UserAllowed));
            }
        }

        if !ctx.ip.is_empty() && settings.whitelist_ips.iter().any(|w| w == &ctx.ip) {
            return Evaluation::pass(GateDecision::Bypass(BypassReason::IpWhitelist));
        }

        if settings
            .whitelist_paths
            .iter()
            .any(|p| path_matches(&path, p))
        {
            return Evaluation::pass(GateDecision::Bypass(BypassReason::PathWhitelist));
        }

        self.block(settings, form_error)
    }

    fn block(&self, settings: &GateSettings, form_error: Option<AccessFormError>) -> Evaluation {
        Evaluation {
            decision: GateDecision::Block,
            status: Some(blocked_status(settings.mode)),
            set_cookie: None,
            redirect_to: None,
            form_error,
        }
    }

    fn is_preview(&self, ctx: &RequestContext, now: i64) -> bool {
        let requested = ctx
            .query
            .get(PREVIEW_PARAM)
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);
        if !requested {
            return false;
        }
        ctx.query
            .get(PREVIEW_NONCE_PARAM)
            .map(|n| verify_nonce(&self.secret, PREVIEW_ACTION, n, now))
            .unwrap_or(false)
    }
}

/// Exact or prefix path match: `/shop` matches `/shop` and `/shop/cart`
/// but not `/shopping`.
fn path_matches(path: &str, candidate: &str) -> bool {
    if candidate == "/" {
        return true;
    }
    path == candidate || path.strip_prefix(candidate).is_some_and(|rest| rest.starts_with('/'))
}
