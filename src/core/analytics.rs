//! Analytics for the maintenance gate service.
//!
//! Records blocked and bypassed requests into an all-time counters record
//! and a bounded 24-hour rolling record. Client IPs and request paths are
//! anonymized before storage: IPs are HMAC-hashed, paths are masked down
//! to an aggregable shape and then hashed. Every read and write prunes the
//! rolling record, so memory stays bounded regardless of traffic volume.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::policy::{BypassReason, RequestContext};
use crate::core::store::{SettingsStore, StoreError, TtlStore};
use crate::utils::hmac_sha256_hex;

/// Storage key for the all-time counters record.
pub const ALL_TIME_KEY: &str = "gate:analytics:all_time";
/// Storage key for the 24h rolling record.
pub const ROLLING_KEY: &str = "gate:analytics:24h";

const ROLLING_WINDOW_SECS: i64 = 86_400;
/// Rolling record expiry: one hour past the window, so an idle site
/// eventually drops the whole structure.
const ROLLING_TTL_SECS: u64 = 90_000;
const UNIQUE_CAP: usize = 10_000;
const PATH_CAP: usize = 400;
const TOP_PATHS: usize = 10;

const MASK_SEGMENTS: usize = 2;
const MASK_SEGMENT_MAX: usize = 24;
const MASK_PATH_MAX: usize = 80;

/// Errors that can occur during analytics operations
#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// All-time counters. Monotonic; reset only by explicit admin action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllTimeStats {
    pub blocked_total: u64,
    pub bypass_total: u64,
    pub bypass_by_reason: HashMap<String, u64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One masked path's tally in the rolling record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathEntry {
    /// Hit count.
    pub c: u64,
    /// Masked path for display.
    pub m: String,
    /// Last seen.
    pub t: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathBuckets {
    pub blocked: HashMap<String, PathEntry>,
    pub bypass: HashMap<String, PathEntry>,
}

/// The 24h rolling record. `unique` and `paths` are keyed by HMAC hashes,
/// never raw values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingStats {
    pub blocked: u64,
    pub bypass: u64,
    pub bypass_by_reason: HashMap<String, u64>,
    pub unique: HashMap<String, i64>,
    pub paths: PathBuckets,
}

impl RollingStats {
    /// Drop entries older than the window, then cap `unique` and each path
    /// bucket to the most-recently-seen entries.
    pub fn prune(&mut self, now: i64) {
        let cutoff = now - ROLLING_WINDOW_SECS;

        self.unique.retain(|_, seen| *seen >= cutoff);
        cap_by_recency(&mut self.unique, UNIQUE_CAP, |seen| *seen);

        for bucket in [&mut self.paths.blocked, &mut self.paths.bypass] {
            bucket.retain(|_, entry| entry.t >= cutoff);
            cap_by_recency(bucket, PATH_CAP, |entry| entry.t);
        }
    }
}

fn cap_by_recency<V>(map: &mut HashMap<String, V>, cap: usize, last_seen: impl Fn(&V) -> i64) {
    if map.len() <= cap {
        return;
    }
    let mut entries: Vec<(String, i64)> = map
        .iter()
        .map(|(key, value)| (key.clone(), last_seen(value)))
        .collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (key, _) in entries.into_iter().skip(cap) {
        map.remove(&key);
    }
}

/// A bypass reason tally in the overview, sorted by count.
#[derive(Debug, Clone, Serialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: u64,
}

/// A masked path tally in the overview.
#[derive(Debug, Clone, Serialize)]
pub struct PathCount {
    pub path: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct AllTimeOverview {
    pub blocked: u64,
    pub bypass: u64,
    pub by_reason: Vec<ReasonCount>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize)]
pub struct RollingOverview {
    pub blocked: u64,
    pub bypass: u64,
    pub by_reason: Vec<ReasonCount>,
    pub unique_visitors: usize,
    pub top_blocked_paths: Vec<PathCount>,
    pub top_bypass_paths: Vec<PathCount>,
}

#[derive(Debug, Serialize)]
pub struct AnalyticsOverview {
    pub all_time: AllTimeOverview,
    pub last_24h: RollingOverview,
}

/// Analytics service
pub struct Analytics {
    settings_store: Arc<dyn SettingsStore>,
    ttl_store: Arc<dyn TtlStore>,
    secret: String,
}

impl Analytics {
    pub fn new(
        settings_store: Arc<dyn SettingsStore>,
        ttl_store: Arc<dyn TtlStore>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            settings_store,
            ttl_store,
            secret: secret.into(),
        }
    }

    /// Record a blocked request. Counts the block in both records, tracks
    /// the anonymized client IP for uniqueness, and tallies the masked
    /// path.
    pub async fn record_blocked(
        &self,
        ctx: &RequestContext,
        now: i64,
    ) -> Result<(), AnalyticsError> {
        if Self::should_skip(ctx) {
            return Ok(());
        }

        let mut all_time = self.load_all_time().await;
        if all_time.created_at == 0 {
            all_time.created_at = now;
        }
        all_time.blocked_total += 1;
        all_time.updated_at = now;
        self.save_all_time(&all_time).await?;

        let mut rolling = self.load_rolling(now).await;
        rolling.blocked += 1;
        if !ctx.ip.is_empty() {
            rolling.unique.insert(self.hash(&ctx.ip), now);
        }
        self.touch_path(&mut rolling, &ctx.path, now, true);
        rolling.prune(now);
        self.save_rolling(&rolling).await
    }

    /// Record a bypassed request with its reason.
    pub async fn record_bypass(
        &self,
        ctx: &RequestContext,
        reason: BypassReason,
        now: i64,
    ) -> Result<(), AnalyticsError> {
        if Self::should_skip(ctx) {
            return Ok(());
        }

        let mut all_time = self.load_all_time().await;
        if all_time.created_at == 0 {
            all_time.created_at = now;
        }
        all_time.bypass_total += 1;
        *all_time
            .bypass_by_reason
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
        all_time.updated_at = now;
        self.save_all_time(&all_time).await?;

        let mut rolling = self.load_rolling(now).await;
        rolling.bypass += 1;
        *rolling
            .bypass_by_reason
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
        self.touch_path(&mut rolling, &ctx.path, now, false);
        rolling.prune(now);
        self.save_rolling(&rolling).await
    }

    /// Assemble the dashboard summary from both records.
    pub async fn get_overview(&self, now: i64) -> Result<AnalyticsOverview, AnalyticsError> {
        let all_time = self.load_all_time().await;
        let mut rolling = self.load_rolling(now).await;
        rolling.prune(now);
        // Write the pruned record back so reads keep the structure bounded
        // too; losing this write only delays the next prune.
        if let Err(e) = self.save_rolling(&rolling).await {
            warn!("failed to persist pruned rolling analytics: {}", e);
        }

        Ok(AnalyticsOverview {
            all_time: AllTimeOverview {
                blocked: all_time.blocked_total,
                bypass: all_time.bypass_total,
                by_reason: sorted_reasons(&all_time.bypass_by_reason),
                created_at: all_time.created_at,
                updated_at: all_time.updated_at,
            },
            last_24h: RollingOverview {
                blocked: rolling.blocked,
                bypass: rolling.bypass,
                by_reason: sorted_reasons(&rolling.bypass_by_reason),
                unique_visitors: rolling.unique.len(),
                top_blocked_paths: top_paths(&rolling.paths.blocked),
                top_bypass_paths: top_paths(&rolling.paths.bypass),
            },
        })
    }

    /// Clear both records. Explicit admin action only.
    pub async fn reset(&self) -> Result<(), AnalyticsError> {
        self.settings_store.delete(ALL_TIME_KEY).await?;
        self.ttl_store.delete(ROLLING_KEY).await?;
        Ok(())
    }

    /// Only real end-user traffic is counted.
    fn should_skip(ctx: &RequestContext) -> bool {
        ctx.is_cli || ctx.is_cron || ctx.is_admin_backend
    }

    fn hash(&self, value: &str) -> String {
        hmac_sha256_hex(&self.secret, value)
    }

    fn touch_path(&self, rolling: &mut RollingStats, path: &str, now: i64, blocked: bool) {
        let masked = mask_path(path);
        let key = self.hash(&masked);
        let bucket = if blocked {
            &mut rolling.paths.blocked
        } else {
            &mut rolling.paths.bypass
        };
        let entry = bucket.entry(key).or_insert(PathEntry {
            c: 0,
            m: masked,
            t: now,
        });
        entry.c += 1;
        entry.t = now;
    }

    async fn load_all_time(&self) -> AllTimeStats {
        match self.settings_store.get(ALL_TIME_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("all-time analytics record unreadable, starting fresh: {}", e);
                AllTimeStats::default()
            }),
            Ok(None) => AllTimeStats::default(),
            Err(e) => {
                warn!("all-time analytics read failed: {}", e);
                AllTimeStats::default()
            }
        }
    }

    async fn save_all_time(&self, stats: &AllTimeStats) -> Result<(), AnalyticsError> {
        let json = serde_json::to_string(stats)?;
        self.settings_store.set(ALL_TIME_KEY, &json).await?;
        Ok(())
    }

    async fn load_rolling(&self, now: i64) -> RollingStats {
        let mut rolling = match self.ttl_store.get(ROLLING_KEY).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("rolling analytics record unreadable, starting fresh: {}", e);
                RollingStats::default()
            }),
            Ok(None) => RollingStats::default(),
            Err(e) => {
                warn!("rolling analytics read failed: {}", e);
                RollingStats::default()
            }
        };
        rolling.prune(now);
        rolling
    }

    async fn save_rolling(&self, stats: &RollingStats) -> Result<(), AnalyticsError> {
        let json = serde_json::to_string(stats)?;
        self.ttl_store
            .set_with_ttl(ROLLING_KEY, &json, ROLLING_TTL_SECS)
            .await?;
        Ok(())
    }
}

fn sorted_reasons(by_reason: &HashMap<String, u64>) -> Vec<ReasonCount> {
    let mut reasons: Vec<ReasonCount> = by_reason
        .iter()
        .map(|(reason, count)| ReasonCount {
            reason: reason.clone(),
            count: *count,
        })
        .collect();
    reasons.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
    reasons
}

fn top_paths(bucket: &HashMap<String, PathEntry>) -> Vec<PathCount> {
    let mut paths: Vec<PathCount> = bucket
        .values()
        .map(|entry| PathCount {
            path: entry.m.clone(),
            count: entry.c,
        })
        .collect();
    paths.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
    paths.truncate(TOP_PATHS);
    paths
}

/// Mask a request path down to an aggregable, identifier-free shape:
/// keep at most the first two segments, replace numeric segments with
/// `{n}`, long hex runs with `{hash}`, UUIDs with `{uuid}`, collapse
/// embedded digits, and strip everything that is not alphanumeric,
/// `.`, `-`, `_` or a placeholder brace.
pub fn mask_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_string();
    }

    let masked: Vec<String> = segments
        .iter()
        .take(MASK_SEGMENTS)
        .map(|s| mask_segment(s))
        .collect();

    let mut out = format!("/{}", masked.join("/"));
    if segments.len() > MASK_SEGMENTS {
        out.push_str("/*");
    }
    if out.len() > MASK_PATH_MAX {
        // Masked segments are pure ASCII, so byte truncation is safe.
        out.truncate(MASK_PATH_MAX);
    }
    out
}

fn mask_segment(segment: &str) -> String {
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return "{n}".to_string();
    }
    if segment.len() >= 16 && segment.bytes().all(|b| b.is_ascii_hexdigit()) {
        return "{hash}".to_string();
    }
    if is_uuid_shape(segment) {
        return "{uuid}".to_string();
    }

    let mut out = String::new();
    let mut in_digits = false;
    for c in segment.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push_str("{n}");
                in_digits = true;
            }
        } else {
            in_digits = false;
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '{' | '}') {
                out.push(c);
            }
        }
    }
    out.truncate(MASK_SEGMENT_MAX);
    if out.is_empty() {
        "{seg}".to_string()
    } else {
        out
    }
}

fn is_uuid_shape(segment: &str) -> bool {
    if segment.len() != 36 {
        return false;
    }
    segment.bytes().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{MemoryStore, MockTtlStore};

    const NOW: i64 = 1_700_000_000;

    fn visitor(path: &str, ip: &str) -> RequestContext {
        RequestContext {
            path: path.to_string(),
            ip: ip.to_string(),
            ..RequestContext::default()
        }
    }

    fn analytics_with_memory() -> (Analytics, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let analytics = Analytics::new(store.clone(), store.clone(), "test-secret");
        (analytics, store)
    }

    #[test]
    fn masking_replaces_identifiers() {
        assert_eq!(mask_path("/products/123/reviews"), "/products/{n}/*");
        assert_eq!(mask_path("/order/66e1c0ab93fe22aa"), "/order/{hash}");
        assert_eq!(
            mask_path("/u/550e8400-e29b-41d4-a716-446655440000"),
            "/u/{uuid}"
        );
        assert_eq!(mask_path("/item42/details"), "/item{n}/details");
        assert_eq!(mask_path("/a%20b/c"), "/a{n}b/c");
        assert_eq!(mask_path("/%%%/x"), "/{seg}/x");
        assert_eq!(mask_path("/"), "/");
        assert_eq!(mask_path(""), "/");
    }

    #[test]
    fn masking_is_idempotent() {
        for path in [
            "/products/{n}",
            "/products/{n}/*",
            "/order/{hash}",
            "/u/{uuid}",
            "/item{n}/details",
            "/{seg}/x",
        ] {
            assert_eq!(mask_path(path), path, "masking {:?} changed it", path);
        }
    }

    #[test]
    fn masking_caps_segment_and_path_length() {
        let long_segment = "a".repeat(60);
        let masked = mask_path(&format!("/{}", long_segment));
        assert_eq!(masked.len(), 1 + MASK_SEGMENT_MAX);

        let two_long = format!("/{}/{}/third", "b".repeat(60), "c".repeat(60));
        let masked = mask_path(&two_long);
        assert!(masked.len() <= MASK_PATH_MAX);
        assert!(masked.starts_with("/bbbb"));
    }

    #[test]
    fn prune_drops_stale_and_caps_unique() {
        let mut rolling = RollingStats::default();
        // One stale entry, then 10_050 fresh ones with increasing recency.
        rolling
            .unique
            .insert("stale".to_string(), NOW - ROLLING_WINDOW_SECS - 1);
        for i in 0..10_050i64 {
            rolling.unique.insert(format!("ip{}", i), NOW - 10_050 + i);
        }

        rolling.prune(NOW);
        assert_eq!(rolling.unique.len(), UNIQUE_CAP);
        assert!(!rolling.unique.contains_key("stale"));
        // The 50 oldest-by-recency fresh entries are evicted.
        assert!(!rolling.unique.contains_key("ip0"));
        assert!(!rolling.unique.contains_key("ip49"));
        assert!(rolling.unique.contains_key("ip50"));
        assert!(rolling.unique.contains_key("ip10049"));
    }

    #[test]
    fn prune_caps_path_buckets() {
        let mut rolling = RollingStats::default();
        for i in 0..450i64 {
            rolling.paths.blocked.insert(
                format!("hash{}", i),
                PathEntry {
                    c: 1,
                    m: format!("/p{}", i),
                    t: NOW - 450 + i,
                },
            );
        }

        rolling.prune(NOW);
        assert_eq!(rolling.paths.blocked.len(), PATH_CAP);
        assert!(!rolling.paths.blocked.contains_key("hash0"));
        assert!(rolling.paths.blocked.contains_key("hash449"));
    }

    #[tokio::test]
    async fn records_accumulate_in_both_records() {
        let (analytics, _store) = analytics_with_memory();

        analytics
            .record_blocked(&visitor("/products/1", "10.0.0.1"), NOW)
            .await
            .unwrap();
        analytics
            .record_blocked(&visitor("/products/2", "10.0.0.1"), NOW + 1)
            .await
            .unwrap();
        analytics
            .record_bypass(&visitor("/shop", "10.0.0.2"), BypassReason::UserAllowed, NOW + 2)
            .await
            .unwrap();

        let overview = analytics.get_overview(NOW + 3).await.unwrap();
        assert_eq!(overview.all_time.blocked, 2);
        assert_eq!(overview.all_time.bypass, 1);
        assert_eq!(overview.last_24h.blocked, 2);
        assert_eq!(overview.last_24h.bypass, 1);
        // Same IP twice: one unique visitor.
        assert_eq!(overview.last_24h.unique_visitors, 1);
        assert_eq!(overview.all_time.by_reason[0].reason, "user_allowed");
        assert_eq!(overview.all_time.by_reason[0].count, 1);
        // Both blocked paths mask to the same shape.
        assert_eq!(overview.last_24h.top_blocked_paths.len(), 1);
        assert_eq!(overview.last_24h.top_blocked_paths[0].path, "/products/{n}");
        assert_eq!(overview.last_24h.top_blocked_paths[0].count, 2);
    }

    #[tokio::test]
    async fn top_paths_sort_by_count_then_path() {
        let (analytics, _store) = analytics_with_memory();
        for _ in 0..3 {
            analytics
                .record_blocked(&visitor("/beta", "10.0.0.1"), NOW)
                .await
                .unwrap();
        }
        analytics
            .record_blocked(&visitor("/alpha", "10.0.0.1"), NOW)
            .await
            .unwrap();
        analytics
            .record_blocked(&visitor("/gamma", "10.0.0.1"), NOW)
            .await
            .unwrap();

        let overview = analytics.get_overview(NOW).await.unwrap();
        let paths: Vec<&str> = overview
            .last_24h
            .top_blocked_paths
            .iter()
            .map(|p| p.path.as_str())
            .collect();
        assert_eq!(paths, vec!["/beta", "/alpha", "/gamma"]);
    }

    #[tokio::test]
    async fn raw_values_never_reach_storage() {
        let (analytics, store) = analytics_with_memory();
        analytics
            .record_blocked(&visitor("/secret-page/42", "198.51.100.9"), NOW)
            .await
            .unwrap();

        let raw = TtlStore::get(store.as_ref(), ROLLING_KEY)
            .await
            .unwrap()
            .unwrap();
        assert!(!raw.contains("198.51.100.9"));
        assert!(!raw.contains("/secret-page/42"));
        assert!(raw.contains("/secret-page/{n}"));
    }

    #[tokio::test]
    async fn non_visitor_traffic_is_not_counted() {
        let (analytics, _store) = analytics_with_memory();
        let mut ctx = visitor("/", "10.0.0.1");
        ctx.is_cron = true;
        analytics.record_blocked(&ctx, NOW).await.unwrap();

        let mut ctx = visitor("/", "10.0.0.1");
        ctx.is_admin_backend = true;
        analytics
            .record_bypass(&ctx, BypassReason::AdminBackend, NOW)
            .await
            .unwrap();

        let overview = analytics.get_overview(NOW).await.unwrap();
        assert_eq!(overview.all_time.blocked, 0);
        assert_eq!(overview.all_time.bypass, 0);
    }

    #[tokio::test]
    async fn reset_clears_both_records() {
        let (analytics, _store) = analytics_with_memory();
        analytics
            .record_blocked(&visitor("/x", "10.0.0.1"), NOW)
            .await
            .unwrap();
        analytics.reset().await.unwrap();

        let overview = analytics.get_overview(NOW).await.unwrap();
        assert_eq!(overview.all_time.blocked, 0);
        assert_eq!(overview.last_24h.blocked, 0);
    }

    #[tokio::test]
    async fn rolling_store_failure_drops_the_write() {
        let settings_store = Arc::new(MemoryStore::new());
        let mut ttl_store = MockTtlStore::new();
        ttl_store.expect_get().returning(|_| {
            Err(StoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        });
        ttl_store.expect_set_with_ttl().returning(|_, _, _| {
            Err(StoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        });

        let analytics = Analytics::new(settings_store, Arc::new(ttl_store), "test-secret");
        let result = analytics
            .record_blocked(&visitor("/x", "10.0.0.1"), NOW)
            .await;
        assert!(result.is_err());

        // The all-time record still advanced; only the rolling write failed.
        let all_time = analytics.load_all_time().await;
        assert_eq!(all_time.blocked_total, 1);
    }
}
