//! Core functionality for the maintenance gate service.
//!
//! This module contains the framework-agnostic components of the service:
//! settings, schedule matching, policy evaluation, private access, and
//! analytics, plus the persistence collaborators they talk to.

pub mod analytics;
pub mod policy;
pub mod private_access;
pub mod schedule;
pub mod settings;
pub mod store;

pub use analytics::{Analytics, AnalyticsOverview};
pub use policy::{BypassReason, Evaluation, GateDecision, PolicyEvaluator, RequestContext};
pub use private_access::{AccessFormError, CookieDirective};
pub use settings::{GateMode, GateSettings, SettingsService};
pub use store::{MemoryStore, RedisStore, SettingsStore, TtlStore};
