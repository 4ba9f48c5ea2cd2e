//! Named counters with periodic persistence.
//!
//! Counters live in one map behind a readers-writer lock; readers get a
//! snapshot copy so nothing mutable escapes. The recorder worker drives the
//! periodic work: process gauges are refreshed, a JSON snapshot row is
//! written every interval, and old rows are pruned.
//!
//! Counters whose name contains `lifetime` are rehydrated from the newest
//! snapshot row at startup, so restarts do not reset the long totals.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use procfs::{Current, WithCurrentSystemInfo};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::MetricsConfig;
use crate::error::StorageError;
use crate::qlog::InfoRecord;
use crate::rule::Match;

/// Every counter name is stored under this prefix.
pub const PREFIX: &str = "warden-";

pub const TOTAL_RULES: &str = "active-rules";
pub const TOTAL_QUERIES: &str = "total-session-queries";
pub const TOTAL_LIFETIME_QUERIES: &str = "total-lifetime-queries";
pub const TOTAL_INTERVAL_QUERIES: &str = "total-interval-queries";
pub const CACHED_QUERIES: &str = "cached-queries";
pub const BLOCKED_QUERIES: &str = "blocked-session-queries";
pub const BLOCKED_LIFETIME_QUERIES: &str = "blocked-lifetime-queries";
pub const BLOCKED_INTERVAL_QUERIES: &str = "blocked-interval-queries";
pub const CACHE_ENTRIES: &str = "cache-entries";
pub const THREADS: &str = "process-threads";
pub const USED_MEMORY: &str = "process-used-bytes";
pub const FREE_MEMORY: &str = "free-memory-bytes";
pub const SYSTEM_MEMORY: &str = "system-memory-bytes";
pub const CPU_HUNDREDS_PERCENT: &str = "cpu-hundreds-percent";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    FromTime TIMESTAMP NOT NULL,
    AtTime TIMESTAMP NOT NULL,
    MetricsJson TEXT NOT NULL,
    IntervalSeconds INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS IdxMetricsAtTime ON metrics (AtTime);
";

/// One counter value as it appears in the persisted JSON.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Metric {
    pub count: i64,
}

/// One persisted snapshot row.
#[derive(Debug, Clone)]
pub struct MetricsEntry {
    pub from_time: DateTime<Utc>,
    pub at_time: DateTime<Utc>,
    pub values: HashMap<String, Metric>,
    pub interval_seconds: i64,
}

/// Injected callback reporting the cache entry count.
pub type CacheSizeFn = Box<dyn Fn() -> u64 + Send + Sync>;

struct CpuSample {
    ticks: u64,
    at: Instant,
}

pub struct Metrics {
    values: RwLock<HashMap<String, i64>>,
    db: Option<Mutex<Connection>>,
    retention: chrono::Duration,
    cache_size: RwLock<Option<CacheSizeFn>>,
    cpu: Mutex<Option<CpuSample>>,
    last_insert: Mutex<DateTime<Utc>>,
}

impl Metrics {
    /// Create the metrics store. With persistence enabled the database at
    /// `{data_root}/metrics/metrics.db` is opened (surviving restarts) and
    /// lifetime counters are rehydrated from the newest row.
    pub fn open(data_root: &Path, config: &MetricsConfig) -> Result<Self, StorageError> {
        let db = if config.persist() {
            let dir = data_root.join("metrics");
            std::fs::create_dir_all(&dir).map_err(|source| StorageError::CreateDir {
                path: dir.clone(),
                source,
            })?;
            let connection = Connection::open(dir.join("metrics.db"))?;
            connection.execute_batch(SCHEMA)?;
            Some(Mutex::new(connection))
        } else {
            None
        };

        let metrics = Self {
            values: RwLock::new(HashMap::new()),
            db,
            retention: ChronoDuration::from_std(config.duration())
                .unwrap_or_else(|_| ChronoDuration::days(7)),
            cache_size: RwLock::new(None),
            cpu: Mutex::new(None),
            last_insert: Mutex::new(Utc::now()),
        };

        metrics.rehydrate();
        metrics.prune();
        metrics.update();
        Ok(metrics)
    }

    /// An unpersisted store, for tests and disabled configurations.
    pub fn ephemeral() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            db: None,
            retention: ChronoDuration::days(7),
            cache_size: RwLock::new(None),
            cpu: Mutex::new(None),
            last_insert: Mutex::new(Utc::now()),
        }
    }

    pub fn use_cache_size_fn(&self, function: CacheSizeFn) {
        *self.cache_size.write() = Some(function);
    }

    pub fn get(&self, name: &str) -> i64 {
        self.values
            .read()
            .get(&prefixed(name))
            .copied()
            .unwrap_or(0)
    }

    pub fn set(&self, name: &str, value: i64) {
        self.values.write().insert(prefixed(name), value);
    }

    pub fn increment(&self, name: &str, by: i64) {
        *self.values.write().entry(prefixed(name)).or_insert(0) += by;
    }

    fn clear(&self, name: &str) {
        self.set(name, 0);
    }

    /// Copy of every counter, for readers and for the snapshot row.
    pub fn snapshot(&self) -> HashMap<String, Metric> {
        self.values
            .read()
            .iter()
            .map(|(name, value)| (name.clone(), Metric { count: *value }))
            .collect()
    }

    /// Count one handled query.
    pub fn record(&self, info: &InfoRecord) {
        self.increment(TOTAL_QUERIES, 1);
        self.increment(TOTAL_LIFETIME_QUERIES, 1);
        self.increment(TOTAL_INTERVAL_QUERIES, 1);

        if info.cached {
            self.increment(CACHED_QUERIES, 1);
        }

        if info.blocked || info.rule_match == Match::Block {
            self.increment(BLOCKED_QUERIES, 1);
            self.increment(BLOCKED_LIFETIME_QUERIES, 1);
            self.increment(BLOCKED_INTERVAL_QUERIES, 1);

            if !info.match_list_short.is_empty() {
                self.increment(&format!("rules-session-matched-{}", info.match_list_short), 1);
                self.increment(
                    &format!("rules-lifetime-matched-{}", info.match_list_short),
                    1,
                );
            }
        }
    }

    /// Refresh the process-level gauges.
    pub fn update(&self) {
        if let Ok(process) = procfs::process::Process::myself() {
            if let Ok(stat) = process.stat() {
                self.set(THREADS, stat.num_threads);
                self.set(USED_MEMORY, stat.rss_bytes().get() as i64);
                self.sample_cpu(stat.utime + stat.stime);
            }
        }

        if let Ok(meminfo) = procfs::Meminfo::current() {
            self.set(FREE_MEMORY, meminfo.mem_free as i64);
            self.set(SYSTEM_MEMORY, meminfo.mem_total as i64);
        }

        if let Some(cache_size) = self.cache_size.read().as_ref() {
            self.set(CACHE_ENTRIES, cache_size() as i64);
        }
    }

    /// CPU use since the previous sample, expressed in hundreds of a
    /// percent (17 means 0.17%).
    fn sample_cpu(&self, total_ticks: u64) {
        let now = Instant::now();
        let mut sample = self.cpu.lock();
        if let Some(previous) = sample.as_ref() {
            let wall = now.duration_since(previous.at).as_secs_f64();
            if wall > 0.0 {
                let ticks = total_ticks.saturating_sub(previous.ticks) as f64;
                let seconds = ticks / procfs::ticks_per_second() as f64;
                self.set(
                    CPU_HUNDREDS_PERCENT,
                    (seconds / wall * 100.0 * 100.0).round() as i64,
                );
            }
        }
        *sample = Some(CpuSample {
            ticks: total_ticks,
            at: now,
        });
    }

    /// Persist one snapshot row covering the window since the last insert,
    /// then reset the interval counters.
    pub fn insert(&self, now: DateTime<Utc>) {
        let Some(db) = &self.db else {
            return;
        };

        let snapshot = self.snapshot();
        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(err) => {
                error!("could not serialize metrics snapshot: {err}");
                return;
            }
        };

        let mut last_insert = self.last_insert.lock();
        let interval = (now - *last_insert).num_seconds();
        let result = db.lock().execute(
            "INSERT INTO metrics (FromTime, AtTime, MetricsJson, IntervalSeconds) \
             VALUES (?1, ?2, ?3, ?4)",
            params![*last_insert, now, json, interval],
        );
        match result {
            Ok(_) => {
                *last_insert = now;
                drop(last_insert);
                self.clear(TOTAL_INTERVAL_QUERIES);
                self.clear(BLOCKED_INTERVAL_QUERIES);
            }
            Err(err) => error!("could not insert metrics snapshot: {err}"),
        }
    }

    /// Drop snapshot rows older than the retention window.
    pub fn prune(&self) {
        let Some(db) = &self.db else {
            return;
        };
        let cutoff = Utc::now() - self.retention;
        if let Err(err) = db
            .lock()
            .execute("DELETE FROM metrics WHERE AtTime <= ?1", params![cutoff])
        {
            error!("could not prune metrics: {err}");
        }
    }

    /// Snapshot rows whose window falls inside `[start, end]`, oldest
    /// first.
    pub fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricsEntry>, StorageError> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let db = db.lock();

        let mut stmt = db.prepare(
            "SELECT FromTime, AtTime, MetricsJson, IntervalSeconds FROM metrics \
             WHERE FromTime >= ?1 AND AtTime <= ?2 ORDER BY AtTime ASC",
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok((
                row.get::<_, DateTime<Utc>>(0)?,
                row.get::<_, DateTime<Utc>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (from_time, at_time, json, interval_seconds) = row?;
            let values = serde_json::from_str(&json).unwrap_or_default();
            entries.push(MetricsEntry {
                from_time,
                at_time,
                values,
                interval_seconds,
            });
        }
        Ok(entries)
    }

    /// Streaming shape of [`query`](Self::query): rows go out on the
    /// channel as they are scanned, and the channel closes when the
    /// statement is drained.
    pub fn query_stream(
        &self,
        sender: tokio::sync::mpsc::UnboundedSender<MetricsEntry>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        for entry in self.query(start, end)? {
            if sender.send(entry).is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Restore lifetime counters from the newest persisted snapshot.
    fn rehydrate(&self) {
        let Some(db) = &self.db else {
            return;
        };

        let json: Option<String> = {
            let db = db.lock();
            db.query_row(
                "SELECT MetricsJson FROM metrics ORDER BY AtTime DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .unwrap_or_else(|err| {
                if !matches!(err, rusqlite::Error::QueryReturnedNoRows) {
                    warn!("could not load previous metrics: {err}");
                }
                None
            })
        };

        let Some(json) = json else {
            return;
        };
        let Ok(values) = serde_json::from_str::<HashMap<String, Metric>>(&json) else {
            return;
        };

        let mut map = self.values.write();
        for (name, metric) in values {
            if name.contains("lifetime") {
                map.insert(name, metric.count);
            }
        }
    }
}

fn prefixed(name: &str) -> String {
    format!("{PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(blocked: bool, cached: bool) -> InfoRecord {
        InfoRecord {
            rule_match: if blocked { Match::Block } else { Match::None },
            match_list_short: if blocked { "ads".to_string() } else { String::new() },
            cached,
            ..InfoRecord::default()
        }
    }

    #[test]
    fn should_count_queries_blocks_and_cache_hits() {
        let metrics = Metrics::ephemeral();

        metrics.record(&info(false, false));
        metrics.record(&info(true, false));
        metrics.record(&info(false, true));

        assert_eq!(metrics.get(TOTAL_QUERIES), 3);
        assert_eq!(metrics.get(BLOCKED_QUERIES), 1);
        assert_eq!(metrics.get(CACHED_QUERIES), 1);
        assert_eq!(metrics.get("rules-session-matched-ads"), 1);
    }

    #[test]
    fn should_snapshot_with_prefixed_names() {
        let metrics = Metrics::ephemeral();
        metrics.increment(TOTAL_QUERIES, 5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot[&format!("{PREFIX}{TOTAL_QUERIES}")].count, 5);
    }

    #[test]
    fn should_persist_and_query_snapshot_rows() {
        let dir = TempDir::new().unwrap();
        let config = MetricsConfig::default();
        let metrics = Metrics::open(dir.path(), &config).unwrap();

        metrics.increment(TOTAL_QUERIES, 2);
        metrics.increment(TOTAL_INTERVAL_QUERIES, 2);
        metrics.insert(Utc::now());

        let entries = metrics
            .query(Utc::now() - ChronoDuration::hours(1), Utc::now())
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].values[&format!("{PREFIX}{TOTAL_QUERIES}")].count,
            2
        );

        // interval counters reset after the row is written
        assert_eq!(metrics.get(TOTAL_INTERVAL_QUERIES), 0);
        assert_eq!(metrics.get(TOTAL_QUERIES), 2);
    }

    #[test]
    fn should_rehydrate_lifetime_counters_after_restart() {
        let dir = TempDir::new().unwrap();
        let config = MetricsConfig::default();

        {
            let metrics = Metrics::open(dir.path(), &config).unwrap();
            metrics.increment(TOTAL_LIFETIME_QUERIES, 41);
            metrics.increment(TOTAL_QUERIES, 41);
            metrics.insert(Utc::now());
        }

        let metrics = Metrics::open(dir.path(), &config).unwrap();
        assert_eq!(metrics.get(TOTAL_LIFETIME_QUERIES), 41);
        // session counters start over
        assert_eq!(metrics.get(TOTAL_QUERIES), 0);
    }

    #[test]
    fn should_update_process_gauges() {
        let metrics = Metrics::ephemeral();
        metrics.use_cache_size_fn(Box::new(|| 7));
        metrics.update();

        assert!(metrics.get(THREADS) > 0);
        assert!(metrics.get(SYSTEM_MEMORY) > 0);
        assert_eq!(metrics.get(CACHE_ENTRIES), 7);
    }
}
