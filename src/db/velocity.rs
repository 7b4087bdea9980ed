use super::{invalid_value, parse_time, ts, Database};
use crate::errors::{EngineError, EngineResult};
use crate::models::{PeriodType, VelocityCacheEntry, VelocityMetrics, VelocityTrend};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

const VELOCITY_COLUMNS: &str = "id, project_id, period_type, period_start, commits_count, prs_opened, prs_merged,
     issues_opened, issues_closed, contributors, lines_added, lines_removed, raw_json, velocity_score,
     velocity_trend, computed_at, expires_at, is_stale";

impl Database {
    /// The live (not retired) entry for a key, whether or not it has expired.
    pub fn get_live_velocity_entry(
        &self,
        project_id: &str,
        period_type: PeriodType,
        period_start: NaiveDate,
    ) -> EngineResult<Option<VelocityCacheEntry>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {} FROM velocity_cache
             WHERE project_id = ?1 AND period_type = ?2 AND period_start = ?3 AND is_stale = 0",
            VELOCITY_COLUMNS
        );
        conn.query_row(
            &query,
            params![project_id, period_type.as_str(), period_start.to_string()],
            parse_velocity_row,
        )
        .optional()
        .map_err(EngineError::from)
    }

    /// Newest entry for a key including retired history. Used as a fallback when
    /// the analyzer cannot produce fresh numbers.
    pub fn latest_velocity_entry(
        &self,
        project_id: &str,
        period_type: PeriodType,
        period_start: NaiveDate,
    ) -> EngineResult<Option<VelocityCacheEntry>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {} FROM velocity_cache
             WHERE project_id = ?1 AND period_type = ?2 AND period_start = ?3
             ORDER BY computed_at DESC LIMIT 1",
            VELOCITY_COLUMNS
        );
        conn.query_row(
            &query,
            params![project_id, period_type.as_str(), period_start.to_string()],
            parse_velocity_row,
        )
        .optional()
        .map_err(EngineError::from)
    }

    /// Newest entry for the closest earlier period of the same type.
    pub fn previous_period_entry(
        &self,
        project_id: &str,
        period_type: PeriodType,
        period_start: NaiveDate,
    ) -> EngineResult<Option<VelocityCacheEntry>> {
        let conn = self.lock()?;
        let query = format!(
            "SELECT {} FROM velocity_cache
             WHERE project_id = ?1 AND period_type = ?2 AND period_start < ?3
             ORDER BY period_start DESC, computed_at DESC LIMIT 1",
            VELOCITY_COLUMNS
        );
        conn.query_row(
            &query,
            params![project_id, period_type.as_str(), period_start.to_string()],
            parse_velocity_row,
        )
        .optional()
        .map_err(EngineError::from)
    }

    /// Retires `retire_id` (when given) and inserts `entry` as the live row for its key.
    /// If another writer already published a live row, theirs is kept and returned.
    pub fn publish_velocity_entry(
        &self,
        retire_id: Option<&str>,
        entry: &VelocityCacheEntry,
    ) -> EngineResult<VelocityCacheEntry> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(retire_id) = retire_id {
            tx.execute(
                "UPDATE velocity_cache SET is_stale = 1 WHERE id = ?1 AND is_stale = 0",
                [retire_id],
            )?;
        }
        let metrics = &entry.metrics;
        tx.execute(
            "INSERT OR IGNORE INTO velocity_cache (
               id, project_id, period_type, period_start, commits_count, prs_opened, prs_merged,
               issues_opened, issues_closed, contributors, lines_added, lines_removed, raw_json,
               velocity_score, velocity_trend, computed_at, expires_at, is_stale
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, 0)",
            params![
                entry.id,
                entry.project_id,
                entry.period_type.as_str(),
                entry.period_start.to_string(),
                metrics.commits_count,
                metrics.prs_opened,
                metrics.prs_merged,
                metrics.issues_opened,
                metrics.issues_closed,
                metrics.contributors,
                metrics.lines_added,
                metrics.lines_removed,
                serde_json::to_string(&metrics.raw)?,
                entry.velocity_score,
                entry.velocity_trend.as_str(),
                ts(entry.computed_at),
                ts(entry.expires_at),
            ],
        )?;
        let query = format!(
            "SELECT {} FROM velocity_cache
             WHERE project_id = ?1 AND period_type = ?2 AND period_start = ?3 AND is_stale = 0",
            VELOCITY_COLUMNS
        );
        let live = tx.query_row(
            &query,
            params![entry.project_id, entry.period_type.as_str(), entry.period_start.to_string()],
            parse_velocity_row,
        )?;
        tx.commit()?;
        Ok(live)
    }

    /// Retires every live entry of a project so the next read recomputes.
    pub fn invalidate_velocity(&self, project_id: &str) -> EngineResult<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE velocity_cache SET is_stale = 1 WHERE project_id = ?1 AND is_stale = 0",
            [project_id],
        )?;
        Ok(changed)
    }

    /// Deletes retired history computed before `before`. Live rows are kept.
    pub fn prune_velocity_history(&self, before: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM velocity_cache WHERE is_stale = 1 AND computed_at < ?1",
            [ts(before)],
        )?;
        Ok(changed)
    }
}

fn parse_velocity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VelocityCacheEntry> {
    let period_raw: String = row.get(3)?;
    let raw_json: String = row.get(12)?;
    Ok(VelocityCacheEntry {
        id: row.get(0)?,
        project_id: row.get(1)?,
        period_type: parse_period_type(&row.get::<_, String>(2)?)?,
        period_start: NaiveDate::parse_from_str(&period_raw, "%Y-%m-%d")
            .map_err(|_| invalid_value("period start", &period_raw))?,
        metrics: VelocityMetrics {
            commits_count: row.get(4)?,
            prs_opened: row.get(5)?,
            prs_merged: row.get(6)?,
            issues_opened: row.get(7)?,
            issues_closed: row.get(8)?,
            contributors: row.get(9)?,
            lines_added: row.get(10)?,
            lines_removed: row.get(11)?,
            raw: serde_json::from_str(&raw_json).unwrap_or(serde_json::Value::Null),
        },
        velocity_score: row.get(13)?,
        velocity_trend: parse_trend(&row.get::<_, String>(14)?)?,
        computed_at: parse_time(&row.get::<_, String>(15)?)?,
        expires_at: parse_time(&row.get::<_, String>(16)?)?,
        is_stale: row.get::<_, i32>(17)? != 0,
    })
}

fn parse_period_type(raw: &str) -> rusqlite::Result<PeriodType> {
    match raw {
        "daily" => Ok(PeriodType::Daily),
        "weekly" => Ok(PeriodType::Weekly),
        "monthly" => Ok(PeriodType::Monthly),
        other => Err(invalid_value("period type", other)),
    }
}

fn parse_trend(raw: &str) -> rusqlite::Result<VelocityTrend> {
    match raw {
        "increasing" => Ok(VelocityTrend::Increasing),
        "stable" => Ok(VelocityTrend::Stable),
        "decreasing" => Ok(VelocityTrend::Decreasing),
        "unknown" => Ok(VelocityTrend::Unknown),
        other => Err(invalid_value("velocity trend", other)),
    }
}

#[cfg(test)]
mod tests {
    use crate::db::test_database;
    use crate::models::{PeriodType, VelocityCacheEntry, VelocityMetrics, VelocityTrend};
    use chrono::{Duration, NaiveDate, Utc};

    fn entry(score: f64, period_start: NaiveDate) -> VelocityCacheEntry {
        let now = Utc::now();
        VelocityCacheEntry {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: "proj-1".to_string(),
            period_type: PeriodType::Weekly,
            period_start,
            metrics: VelocityMetrics {
                commits_count: 12,
                ..VelocityMetrics::default()
            },
            velocity_score: score,
            velocity_trend: VelocityTrend::Unknown,
            computed_at: now,
            expires_at: now + Duration::hours(1),
            is_stale: false,
        }
    }

    #[test]
    fn publish_keeps_one_live_row_and_history() {
        let (_dir, db) = test_database();
        let week = NaiveDate::from_ymd_opt(2026, 4, 6).unwrap();
        let first = db.publish_velocity_entry(None, &entry(10.0, week)).expect("first");

        let racing = db.publish_velocity_entry(None, &entry(99.0, week)).expect("racing");
        assert_eq!(racing.id, first.id);

        let mut second = entry(20.0, week);
        second.computed_at = first.computed_at + Duration::seconds(1);
        let live = db.publish_velocity_entry(Some(&first.id), &second).expect("second");
        assert_eq!(live.id, second.id);
        assert_eq!(live.metrics.commits_count, 12);

        let latest = db
            .latest_velocity_entry("proj-1", PeriodType::Weekly, week)
            .expect("latest")
            .expect("exists");
        assert_eq!(latest.id, second.id);
        assert_eq!(db.prune_velocity_history(Utc::now() + Duration::days(1)).expect("prune"), 1);
    }

    #[test]
    fn previous_period_looks_back_only() {
        let (_dir, db) = test_database();
        let earlier = NaiveDate::from_ymd_opt(2026, 3, 30).unwrap();
        let current = NaiveDate::from_ymd_opt(2026, 4, 6).unwrap();
        db.publish_velocity_entry(None, &entry(5.0, earlier)).expect("earlier");
        db.publish_velocity_entry(None, &entry(8.0, current)).expect("current");

        let previous = db
            .previous_period_entry("proj-1", PeriodType::Weekly, current)
            .expect("previous")
            .expect("exists");
        assert_eq!(previous.period_start, earlier);
        assert!(db.previous_period_entry("proj-1", PeriodType::Weekly, earlier).expect("none").is_none());

        assert_eq!(db.invalidate_velocity("proj-1").expect("invalidate"), 2);
        assert!(db.get_live_velocity_entry("proj-1", PeriodType::Weekly, current).expect("live").is_none());
    }
}
