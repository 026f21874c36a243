//! Private access guard for the maintenance gate service.
//!
//! Grants gate bypass to holders of a shared secret: a signed access
//! cookie, a bearer token in the URL, or a password form submission. The
//! cookie is an HMAC over the currently-stored secret material, so
//! rotating the token or revoking the password invalidates every cookie
//! already issued.

use argon2::Argon2;
use once_cell::sync::Lazy;
use password_hash::rand_core::OsRng;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, Salt, SaltString};
use rand::RngCore;
use serde::Serialize;

use crate::core::policy::{BypassReason, RequestContext};
use crate::core::settings::GateSettings;
use crate::utils::{constant_time_eq, hmac_sha256_hex};

/// Name of the signed access cookie.
pub const ACCESS_COOKIE: &str = "gate_access";
/// Query parameter carrying a bearer token.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";
/// Form field carrying the submitted password.
pub const PASSWORD_FIELD: &str = "gate_password";
/// Form field carrying the CSRF nonce for the password form.
pub const NONCE_FIELD: &str = "gate_nonce";
/// Nonce action for the password form.
pub const PASSWORD_ACTION: &str = "gate_private_access";
/// Nonce action for admin gate previews.
pub const PREVIEW_ACTION: &str = "gate_preview";

const COOKIE_MAX_AGE_SECS: i64 = 7 * 86_400;
const NONCE_TICK_SECS: i64 = 43_200;
const TOKEN_BYTES: usize = 16;

/// A real Argon2 hash generated once at startup, used as a timing decoy
/// so that password submissions against a site with no password configured
/// take the same time as submissions against a real hash.
static DUMMY_HASH: Lazy<String> = Lazy::new(|| {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(b"dummy-never-matches", Salt::from(&salt))
        .expect("failed to generate dummy hash")
        .to_string()
});

/// Transient error surfaced to the gate page after a failed form
/// submission. Deliberately coarse: nonce vs password, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessFormError {
    InvalidNonce,
    InvalidPassword,
}

/// Instruction for the caller's cookie writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CookieDirective {
    pub name: String,
    pub value: String,
    pub max_age: i64,
    pub path: String,
    pub http_only: bool,
    pub same_site: String,
}

impl CookieDirective {
    fn access(value: String) -> Self {
        Self {
            name: ACCESS_COOKIE.to_string(),
            value,
            max_age: COOKIE_MAX_AGE_SECS,
            path: "/".to_string(),
            http_only: true,
            same_site: "Lax".to_string(),
        }
    }
}

/// Result of evaluating the private access mechanisms for one request.
#[derive(Debug, Default)]
pub struct GuardOutcome {
    pub reason: Option<BypassReason>,
    pub set_cookie: Option<CookieDirective>,
    pub redirect_to: Option<String>,
    pub error: Option<AccessFormError>,
}

/// Evaluate the three private access mechanisms in order: signed cookie,
/// bearer token, password form. `enhanced_tier` short-circuits the whole
/// guard off when the entitlement is absent.
pub fn check_private_access(
    ctx: &RequestContext,
    settings: &GateSettings,
    secret: &str,
    enhanced_tier: bool,
    now: i64,
) -> GuardOutcome {
    if !enhanced_tier {
        return GuardOutcome::default();
    }

    let expected_cookie = match cookie_value(secret, settings) {
        Some(value) => value,
        // No secrets configured: nothing to bypass with.
        None => return GuardOutcome::default(),
    };

    if let Some(cookie) = ctx.cookies.get(ACCESS_COOKIE) {
        if constant_time_eq(secret, cookie, &expected_cookie) {
            return GuardOutcome {
                reason: Some(BypassReason::PrivateCookie),
                ..GuardOutcome::default()
            };
        }
    }

    if let (Some(stored), Some(submitted)) = (
        settings.private_token.as_deref().filter(|t| !t.is_empty()),
        ctx.query.get(ACCESS_TOKEN_PARAM),
    ) {
        if constant_time_eq(secret, submitted, stored) {
            return GuardOutcome {
                reason: Some(BypassReason::PrivateToken),
                set_cookie: Some(CookieDirective::access(expected_cookie)),
                redirect_to: Some(redirect_without(ctx, &[ACCESS_TOKEN_PARAM])),
                error: None,
            };
        }
    }

    if let Some(password) = ctx.form.get(PASSWORD_FIELD) {
        let nonce_ok = ctx
            .form
            .get(NONCE_FIELD)
            .map(|n| verify_nonce(secret, PASSWORD_ACTION, n, now))
            .unwrap_or(false);
        if !nonce_ok {
            return GuardOutcome {
                error: Some(AccessFormError::InvalidNonce),
                ..GuardOutcome::default()
            };
        }

        if verify_password(password, settings.private_password_hash.as_deref()) {
            return GuardOutcome {
                reason: Some(BypassReason::PrivatePassword),
                set_cookie: Some(CookieDirective::access(expected_cookie)),
                redirect_to: Some(redirect_without(ctx, &[ACCESS_TOKEN_PARAM])),
                error: None,
            };
        }

        return GuardOutcome {
            error: Some(AccessFormError::InvalidPassword),
            ..GuardOutcome::default()
        };
    }

    GuardOutcome::default()
}

/// The expected access cookie value for the current secret material, or
/// `None` when neither a password nor a token is configured.
pub fn cookie_value(secret: &str, settings: &GateSettings) -> Option<String> {
    let hash = settings.private_password_hash.as_deref().unwrap_or("");
    let token = settings.private_token.as_deref().unwrap_or("");
    if hash.is_empty() && token.is_empty() {
        return None;
    }
    Some(hmac_sha256_hex(
        secret,
        &format!("private_access|{}|{}", hash, token),
    ))
}

/// Whether the request carries a currently-valid access cookie.
pub fn has_private_access_cookie(
    ctx: &RequestContext,
    settings: &GateSettings,
    secret: &str,
) -> bool {
    match (ctx.cookies.get(ACCESS_COOKIE), cookie_value(secret, settings)) {
        (Some(cookie), Some(expected)) => constant_time_eq(secret, cookie, &expected),
        _ => false,
    }
}

/// Issue a CSRF nonce bound to `action`, valid for the current 12-hour
/// tick and the next verification window.
pub fn issue_nonce(secret: &str, action: &str, now: i64) -> String {
    nonce_for_tick(secret, action, now.div_euclid(NONCE_TICK_SECS))
}

/// Verify a nonce against `action`, accepting the current and previous
/// tick.
pub fn verify_nonce(secret: &str, action: &str, nonce: &str, now: i64) -> bool {
    let tick = now.div_euclid(NONCE_TICK_SECS);
    constant_time_eq(secret, nonce, &nonce_for_tick(secret, action, tick))
        || constant_time_eq(secret, nonce, &nonce_for_tick(secret, action, tick - 1))
}

fn nonce_for_tick(secret: &str, action: &str, tick: i64) -> String {
    let digest = hmac_sha256_hex(secret, &format!("{}|{}", action, tick));
    digest[..16].to_string()
}

/// Generate a fresh private access token: 32 hex chars from the OS RNG.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Argon2-hash a private access password for storage.
pub fn hash_password(password: &str) -> Result<String, password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), Salt::from(&salt))?
        .to_string())
}

/// Verify a submitted password against the stored hash. A missing or
/// unparseable hash burns a decoy verification so the failure takes as
/// long as the real check.
pub fn verify_password(password: &str, stored_hash: Option<&str>) -> bool {
    let parsed = stored_hash
        .filter(|h| !h.is_empty())
        .and_then(|h| PasswordHash::new(h).ok());
    match parsed {
        Some(hash) => Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .is_ok(),
        None => {
            let decoy = PasswordHash::new(&DUMMY_HASH).expect("invalid dummy hash");
            let _ = Argon2::default().verify_password(password.as_bytes(), &decoy);
            false
        }
    }
}

/// The request's own URL with the given query parameters removed, used to
/// redirect after a successful token or password bypass so the secret
/// does not linger in history or referrer headers.
fn redirect_without(ctx: &RequestContext, strip: &[&str]) -> String {
    let mut pairs: Vec<(&String, &String)> = ctx
        .query
        .iter()
        .filter(|(k, _)| !strip.contains(&k.as_str()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        ctx.path.clone()
    } else {
        let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}?{}", ctx.path, query.join("&"))
    }
}
