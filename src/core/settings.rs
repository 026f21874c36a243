//! Gate settings for the maintenance gate service.
//!
//! This module defines the persisted settings record consumed by the
//! policy evaluator, together with the single canonical sanitize step
//! that validates admin input before it is stored.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::schedule::parse_minute_of_day;
use crate::core::store::{SettingsStore, StoreError};

/// Storage key for the settings record.
pub const SETTINGS_KEY: &str = "gate:settings";

/// Gate rendering mode. `ComingSoon` renders with HTTP 200, `Maintenance`
/// with HTTP 503.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    ComingSoon,
    Maintenance,
}

impl Default for GateMode {
    fn default() -> Self {
        GateMode::ComingSoon
    }
}

/// A one-off gating window. Bounds are UTC timestamps; a missing bound
/// makes the window open-ended on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    /// Zone the window was entered in; bounds are already normalized to UTC.
    #[serde(default)]
    pub timezone: String,
}

/// Recurrence frequency for a recurring rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

/// A recurring gating rule: a daily time-of-day range, optionally
/// restricted to days of the week or days of the month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringRule {
    pub frequency: Frequency,
    /// IANA zone name, or "site"/empty for the site default.
    #[serde(default)]
    pub timezone: String,
    /// "H:MM" or "HH:MM".
    pub start_time: String,
    pub end_time: String,
    /// ISO days, 1 = Monday .. 7 = Sunday. Required for weekly rules.
    #[serde(default)]
    pub days_of_week: BTreeSet<u8>,
    /// 1..=31. Required for monthly rules.
    #[serde(default)]
    pub days_of_month: BTreeSet<u8>,
}

/// The persisted gate settings record.
///
/// Every field carries a serde default so a partial stored record merges
/// with defaults on read. Mutations go through [`GateSettings::sanitized`],
/// which drops invalid entries wholesale rather than storing them partially.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    pub enabled: bool,
    pub mode: GateMode,
    pub schedule_enabled: bool,
    pub schedule_windows: Vec<ScheduleWindow>,
    pub recurring_enabled: bool,
    pub recurring_rules: Vec<RecurringRule>,
    pub allow_admin_ajax: bool,
    pub allow_rest: bool,
    pub allow_editor_preview: bool,
    /// Exempt site administrators from the gate.
    pub exclude_admin: bool,
    pub allowed_roles: Vec<String>,
    pub whitelist_ips: Vec<String>,
    pub whitelist_paths: Vec<String>,
    /// Paths recognized as the login/registration surface.
    pub login_paths: Vec<String>,
    /// Site default zone used when a rule leaves its zone unset.
    pub site_timezone: String,
    pub private_password_hash: Option<String>,
    pub private_token: Option<String>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: GateMode::default(),
            schedule_enabled: false,
            schedule_windows: Vec::new(),
            recurring_enabled: false,
            recurring_rules: Vec::new(),
            allow_admin_ajax: true,
            allow_rest: true,
            allow_editor_preview: true,
            exclude_admin: true,
            allowed_roles: Vec::new(),
            whitelist_ips: Vec::new(),
            whitelist_paths: Vec::new(),
            login_paths: vec!["/login".to_string(), "/register".to_string()],
            site_timezone: "UTC".to_string(),
            private_password_hash: None,
            private_token: None,
        }
    }
}

impl GateSettings {
    /// Validate and normalize the record. Invalid schedule windows and
    /// recurring rules are dropped, never stored half-formed; list entries
    /// are trimmed and paths normalized to a leading slash.
    pub fn sanitized(mut self) -> Self {
        self.schedule_windows
            .retain(|w| w.start.is_some() || w.end.is_some());

        self.recurring_rules = self
            .recurring_rules
            .into_iter()
            .filter_map(sanitize_rule)
            .collect();

        self.whitelist_ips = clean_list(self.whitelist_ips);
        self.allowed_roles = clean_list(self.allowed_roles);
        self.whitelist_paths = clean_paths(self.whitelist_paths);
        self.login_paths = clean_paths(self.login_paths);

        if self.site_timezone.trim().is_empty() {
            self.site_timezone = "UTC".to_string();
        }

        self
    }
}

fn sanitize_rule(mut rule: RecurringRule) -> Option<RecurringRule> {
    if parse_minute_of_day(&rule.start_time).is_none()
        || parse_minute_of_day(&rule.end_time).is_none()
    {
        warn!(
            "dropping recurring rule with unparseable time range {:?}-{:?}",
            rule.start_time, rule.end_time
        );
        return None;
    }

    match rule.frequency {
        Frequency::Daily => {
            // Day sets are meaningless for daily rules.
            rule.days_of_week.clear();
            rule.days_of_month.clear();
        }
        Frequency::Weekly => {
            rule.days_of_week.retain(|d| (1..=7).contains(d));
            rule.days_of_month.clear();
            if rule.days_of_week.is_empty() {
                warn!("dropping weekly rule without any valid days of week");
                return None;
            }
        }
        Frequency::Monthly => {
            rule.days_of_month.retain(|d| (1..=31).contains(d));
            rule.days_of_week.clear();
            if rule.days_of_month.is_empty() {
                warn!("dropping monthly rule without any valid days of month");
                return None;
            }
        }
    }

    Some(rule)
}

fn clean_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn clean_paths(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| normalize_path(&v))
        .filter(|v| !v.is_empty())
        .collect()
}

/// Normalize a request or whitelist path: leading slash, no trailing slash
/// (except the root itself), surrounding whitespace removed.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Read/replace access to the persisted settings record.
pub struct SettingsService {
    store: Arc<dyn SettingsStore>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Load the settings record, merging with defaults. A missing record or
    /// a failing store serves defaults rather than failing the request.
    pub async fn load(&self) -> GateSettings {
        match self.store.get(SETTINGS_KEY).await {
            Ok(Some(json)) => match serde_json::from_str::<GateSettings>(&json) {
                Ok(settings) => settings.sanitized(),
                Err(e) => {
                    warn!("stored settings are unreadable, serving defaults: {}", e);
                    GateSettings::default()
                }
            },
            Ok(None) => GateSettings::default(),
            Err(e) => {
                warn!("settings store unavailable, serving defaults: {}", e);
                GateSettings::default()
            }
        }
    }

    /// Sanitize and persist a full settings record, returning what was
    /// actually stored.
    pub async fn save(&self, settings: GateSettings) -> Result<GateSettings, StoreError> {
        let sanitized = settings.sanitized();
        let json = serde_json::to_string(&sanitized).map_err(StoreError::from)?;
        self.store.set(SETTINGS_KEY, &json).await?;
        Ok(sanitized)
    }
}
