use crate::db::Database;
use crate::errors::EngineResult;
use crate::models::{PeriodType, VelocityCacheEntry, VelocityMetrics, VelocityTrend};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Relative change beyond which a trend counts as moving.
const TREND_THRESHOLD: f64 = 0.10;

/// Source of repository activity. Fetch logic lives outside the engine.
#[async_trait]
pub trait GithubAnalyzer: Send + Sync {
    async fn fetch_metrics(
        &self,
        project_id: &str,
        period_type: PeriodType,
        period_start: NaiveDate,
    ) -> anyhow::Result<VelocityMetrics>;
}

/// Start of the period containing `day`: the day itself, the Monday of its week,
/// or the first of its month.
pub fn period_start_for(period_type: PeriodType, day: NaiveDate) -> NaiveDate {
    match period_type {
        PeriodType::Daily => day,
        PeriodType::Weekly => day - Duration::days(i64::from(day.weekday().num_days_from_monday())),
        PeriodType::Monthly => day.with_day(1).unwrap_or(day),
    }
}

fn period_days(period_type: PeriodType, period_start: NaiveDate) -> i64 {
    match period_type {
        PeriodType::Daily => 1,
        PeriodType::Weekly => 7,
        PeriodType::Monthly => period_start
            .checked_add_months(Months::new(1))
            .map(|next| (next - period_start).num_days())
            .unwrap_or(30),
    }
}

/// Weighted activity per day of the period, rounded to two decimals.
pub fn velocity_score(metrics: &VelocityMetrics, period_type: PeriodType, period_start: NaiveDate) -> f64 {
    let weighted = f64::from(metrics.commits_count)
        + 3.0 * f64::from(metrics.prs_merged)
        + f64::from(metrics.prs_opened)
        + 2.0 * f64::from(metrics.issues_closed)
        + 0.5 * f64::from(metrics.issues_opened);
    let per_day = weighted / period_days(period_type, period_start).max(1) as f64;
    (per_day * 100.0).round() / 100.0
}

pub fn velocity_trend(current: f64, previous: Option<f64>) -> VelocityTrend {
    let Some(previous) = previous else {
        return VelocityTrend::Unknown;
    };
    if previous <= 0.0 {
        return if current > 0.0 {
            VelocityTrend::Increasing
        } else {
            VelocityTrend::Stable
        };
    }
    let change = (current - previous) / previous;
    if change > TREND_THRESHOLD {
        VelocityTrend::Increasing
    } else if change < -TREND_THRESHOLD {
        VelocityTrend::Decreasing
    } else {
        VelocityTrend::Stable
    }
}

#[derive(Clone)]
pub struct VelocityCache {
    db: Arc<Database>,
    analyzer: Option<Arc<dyn GithubAnalyzer>>,
}

impl VelocityCache {
    pub fn new(db: Arc<Database>, analyzer: Option<Arc<dyn GithubAnalyzer>>) -> Self {
        Self { db, analyzer }
    }

    pub async fn get_or_compute(
        &self,
        project_id: &str,
        period_type: PeriodType,
        period_start: NaiveDate,
    ) -> EngineResult<Option<VelocityCacheEntry>> {
        self.get_or_compute_at(project_id, period_type, period_start, Utc::now())
            .await
    }

    /// Fresh cached entry, or a new one from the analyzer. When the analyzer fails
    /// the newest known entry for the key is returned even if expired; `None` means
    /// no data has ever been recorded and velocity is unknown.
    pub async fn get_or_compute_at(
        &self,
        project_id: &str,
        period_type: PeriodType,
        period_start: NaiveDate,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<VelocityCacheEntry>> {
        let live = self.db.get_live_velocity_entry(project_id, period_type, period_start)?;
        if let Some(entry) = live.as_ref().filter(|entry| entry.is_fresh(now)) {
            return Ok(Some(entry.clone()));
        }

        let Some(analyzer) = &self.analyzer else {
            return self.db.latest_velocity_entry(project_id, period_type, period_start);
        };

        let metrics = match analyzer.fetch_metrics(project_id, period_type, period_start).await {
            Ok(metrics) => metrics,
            Err(error) => {
                tracing::warn!(
                    project_id,
                    period_type = period_type.as_str(),
                    period_start = %period_start,
                    error = %error,
                    "velocity analyzer failed, serving last known entry"
                );
                return self.db.latest_velocity_entry(project_id, period_type, period_start);
            }
        };

        let score = velocity_score(&metrics, period_type, period_start);
        let previous = self
            .db
            .previous_period_entry(project_id, period_type, period_start)?
            .map(|entry| entry.velocity_score);
        let ttl = self.db.get_settings()?.velocity_ttl(period_type);
        let entry = VelocityCacheEntry {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            period_type,
            period_start,
            metrics,
            velocity_score: score,
            velocity_trend: velocity_trend(score, previous),
            computed_at: now,
            expires_at: now + ttl,
            is_stale: false,
        };

        let published = self
            .db
            .publish_velocity_entry(live.as_ref().map(|entry| entry.id.as_str()), &entry)?;
        if published.id != entry.id {
            tracing::debug!(project_id, period_type = period_type.as_str(), "velocity computed concurrently, keeping first entry");
        }
        Ok(Some(published))
    }

    pub fn invalidate(&self, project_id: &str) -> EngineResult<usize> {
        self.db.invalidate_velocity(project_id)
    }

    pub fn prune_history(&self, before: DateTime<Utc>) -> EngineResult<usize> {
        self.db.prune_velocity_history(before)
    }
}

#[cfg(test)]
mod tests {
    use super::{period_start_for, velocity_score, velocity_trend, GithubAnalyzer, VelocityCache};
    use crate::db::test_database;
    use crate::models::{PeriodType, VelocityMetrics, VelocityTrend};
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeAnalyzer {
        calls: AtomicUsize,
        failing: AtomicBool,
        commits: u32,
    }

    impl FakeAnalyzer {
        fn new(commits: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                commits,
            })
        }
    }

    #[async_trait]
    impl GithubAnalyzer for FakeAnalyzer {
        async fn fetch_metrics(&self, _project_id: &str, _period_type: PeriodType, _period_start: NaiveDate) -> anyhow::Result<VelocityMetrics> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("github unavailable");
            }
            Ok(VelocityMetrics {
                commits_count: self.commits,
                prs_merged: 2,
                ..VelocityMetrics::default()
            })
        }
    }

    #[test]
    fn period_starts_align_to_calendar() {
        let thursday = NaiveDate::from_ymd_opt(2026, 4, 9).unwrap();
        assert_eq!(period_start_for(PeriodType::Daily, thursday), thursday);
        assert_eq!(period_start_for(PeriodType::Weekly, thursday), NaiveDate::from_ymd_opt(2026, 4, 6).unwrap());
        assert_eq!(period_start_for(PeriodType::Monthly, thursday), NaiveDate::from_ymd_opt(2026, 4, 1).unwrap());
    }

    #[test]
    fn score_and_trend() {
        let week = NaiveDate::from_ymd_opt(2026, 4, 6).unwrap();
        let metrics = VelocityMetrics {
            commits_count: 14,
            prs_merged: 7,
            ..VelocityMetrics::default()
        };
        assert_eq!(velocity_score(&metrics, PeriodType::Weekly, week), 5.0);
        assert_eq!(velocity_trend(5.0, None), VelocityTrend::Unknown);
        assert_eq!(velocity_trend(5.0, Some(4.0)), VelocityTrend::Increasing);
        assert_eq!(velocity_trend(5.0, Some(5.2)), VelocityTrend::Stable);
        assert_eq!(velocity_trend(2.0, Some(5.0)), VelocityTrend::Decreasing);
    }

    #[tokio::test]
    async fn fresh_entry_is_served_from_cache() {
        let (_dir, db) = test_database();
        let analyzer = FakeAnalyzer::new(7);
        let cache = VelocityCache::new(Arc::new(db), Some(analyzer.clone()));
        let week = NaiveDate::from_ymd_opt(2026, 4, 6).unwrap();

        let first = cache.get_or_compute("proj-1", PeriodType::Weekly, week).await.expect("first").expect("entry");
        let second = cache.get_or_compute("proj-1", PeriodType::Weekly, week).await.expect("second").expect("entry");
        assert_eq!(first.id, second.id);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_returned_when_analyzer_fails() {
        let (_dir, db) = test_database();
        let analyzer = FakeAnalyzer::new(7);
        let cache = VelocityCache::new(Arc::new(db), Some(analyzer.clone()));
        let week = NaiveDate::from_ymd_opt(2026, 4, 6).unwrap();
        let computed_at = Utc::now() - Duration::days(2);

        let original = cache
            .get_or_compute_at("proj-1", PeriodType::Weekly, week, computed_at)
            .await
            .expect("compute")
            .expect("entry");
        assert!(original.expires_at < Utc::now());

        analyzer.failing.store(true, Ordering::SeqCst);
        let served = cache
            .get_or_compute("proj-1", PeriodType::Weekly, week)
            .await
            .expect("fallback")
            .expect("stale entry");
        assert_eq!(served.id, original.id);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);

        let unknown = cache
            .get_or_compute("proj-2", PeriodType::Weekly, week)
            .await
            .expect("no data");
        assert!(unknown.is_none());
    }

    #[tokio::test]
    async fn recompute_retires_expired_entry_and_sets_trend() {
        let (_dir, db) = test_database();
        let analyzer = FakeAnalyzer::new(14);
        let cache = VelocityCache::new(Arc::new(db), Some(analyzer));
        let previous_week = NaiveDate::from_ymd_opt(2026, 3, 30).unwrap();
        let week = NaiveDate::from_ymd_opt(2026, 4, 6).unwrap();
        let long_ago = Utc::now() - Duration::days(3);

        cache.get_or_compute_at("proj-1", PeriodType::Weekly, previous_week, long_ago).await.expect("previous");
        let stale = cache
            .get_or_compute_at("proj-1", PeriodType::Weekly, week, long_ago)
            .await
            .expect("stale")
            .expect("entry");
        let fresh = cache
            .get_or_compute("proj-1", PeriodType::Weekly, week)
            .await
            .expect("fresh")
            .expect("entry");
        assert_ne!(fresh.id, stale.id);
        assert_eq!(fresh.velocity_trend, VelocityTrend::Stable);
        assert_eq!(cache.prune_history(Utc::now() + Duration::seconds(1)).expect("prune"), 1);
    }
}
