//! Query recording: the bounded queue, the persistent query log, and the
//! readback API.
//!
//! The engine enqueues one [`InfoRecord`] per handled query with `try_send`,
//! so a stalled disk can never block resolution; past the queue capacity
//! records are dropped. A single worker drains the queue, emits the
//! human-readable query line, feeds the metrics counters, and batches rows
//! into the database: each flush writes the batch into a buffer table and
//! moves it into `qlog` in one transaction, so a failed flush loses only
//! that batch. Old rows are pruned on a timer and the metrics snapshot row
//! is written on its configured interval.

use std::fmt::Write as _;
use std::io::Write as _;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hickory_proto::op::{Message, ResponseCode};
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::QueryLogConfig;
use crate::dnsutil::answer_values;
use crate::error::StorageError;
use crate::metrics::Metrics;
use crate::resolver::{RequestContext, ResolutionResult};
use crate::rule::Match;

/// Queue capacity between the engine and the recorder worker.
pub const QUEUE_CAPACITY: usize = 100_000;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const MAX_BATCH: usize = 1_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS qlog (
    Address TEXT,
    Consumer TEXT,
    ClientName TEXT,
    RequestDomain TEXT,
    RequestType TEXT,
    ResponseText TEXT,
    Rcode TEXT,
    Cached BOOLEAN,
    Blocked BOOLEAN,
    Match INTEGER,
    MatchList TEXT,
    MatchRule TEXT,
    Created TIMESTAMP
);
CREATE INDEX IF NOT EXISTS IdxQlogCreated ON qlog (Created);
CREATE TABLE IF NOT EXISTS buffer (
    Address TEXT,
    Consumer TEXT,
    ClientName TEXT,
    RequestDomain TEXT,
    RequestType TEXT,
    ResponseText TEXT,
    Rcode TEXT,
    Cached BOOLEAN,
    Blocked BOOLEAN,
    Match INTEGER,
    MatchList TEXT,
    MatchRule TEXT,
    Created TIMESTAMP
);
";

const QLOG_COLUMNS: &str = "Address, Consumer, ClientName, RequestDomain, RequestType, \
                            ResponseText, Rcode, Cached, Blocked, Match, MatchList, MatchRule, \
                            Created";

/// One handled query, as recorded.
#[derive(Debug, Clone)]
pub struct InfoRecord {
    pub address: String,
    pub protocol: String,
    pub client_name: String,
    pub consumer: String,
    pub request_domain: String,
    pub request_type: String,
    pub response_text: String,
    pub rcode: String,
    pub cached: bool,
    pub blocked: bool,
    pub rule_match: Match,
    pub match_list: String,
    /// Short list name for per-list metric counters; not persisted.
    pub match_list_short: String,
    pub match_rule: String,
    /// Resolver and source, for the query line; not persisted.
    pub resolver: String,
    pub source: String,
    /// Failure detail carried by SERVFAIL responses; not persisted.
    pub message: String,
    pub created: DateTime<Utc>,
}

impl Default for InfoRecord {
    fn default() -> Self {
        Self {
            address: String::new(),
            protocol: String::new(),
            client_name: String::new(),
            consumer: String::new(),
            request_domain: String::new(),
            request_type: String::new(),
            response_text: String::new(),
            rcode: String::new(),
            cached: false,
            blocked: false,
            rule_match: Match::None,
            match_list: String::new(),
            match_list_short: String::new(),
            match_rule: String::new(),
            resolver: String::new(),
            source: String::new(),
            message: String::new(),
            created: Utc::now(),
        }
    }
}

impl InfoRecord {
    pub fn new(
        address: IpAddr,
        request: &Message,
        response: &Message,
        rcon: &RequestContext,
        result: &ResolutionResult,
    ) -> Self {
        let question = request.queries().first();
        Self {
            address: address.to_string(),
            protocol: rcon.protocol.to_string(),
            consumer: result.consumer.clone(),
            request_domain: question
                .map(|q| q.name().to_utf8())
                .unwrap_or_default(),
            request_type: question
                .map(|q| q.query_type().to_string())
                .unwrap_or_default(),
            response_text: answer_values(response).join(", "),
            rcode: format!("{:?}", response.response_code()),
            cached: result.cached,
            blocked: result.blocked,
            rule_match: result.verdict,
            match_list: result
                .match_list
                .as_ref()
                .map(|list| list.canonical_name().to_string())
                .unwrap_or_default(),
            match_list_short: result
                .match_list
                .as_ref()
                .map(|list| list.short_name())
                .unwrap_or_default(),
            match_rule: result.match_rule.clone(),
            resolver: result.resolver.clone(),
            source: result.source.clone(),
            message: result.message.clone(),
            created: Utc::now(),
            ..Self::default()
        }
    }
}

/// Filter, paging, and sort parameters for query-log readback.
#[derive(Debug, Clone, Default)]
pub struct QueryLogQuery {
    pub address: Option<String>,
    pub client_name: Option<String>,
    pub request_domain: Option<String>,
    pub response_text: Option<String>,
    pub blocked: Option<bool>,
    pub rule_match: Option<Match>,
    pub cached: Option<bool>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub skip: usize,
    pub limit: usize,
    pub sort_by: Option<String>,
    pub direction: Option<String>,
}

/// Sortable columns, keyed by their lowercase request spelling.
fn sort_column(name: &str) -> Option<&'static str> {
    match name.to_lowercase().as_str() {
        "address" => Some("Address"),
        "clientname" => Some("ClientName"),
        "consumer" => Some("Consumer"),
        "requestdomain" => Some("RequestDomain"),
        "requesttype" => Some("RequestType"),
        "responsetext" => Some("ResponseText"),
        "rcode" => Some("Rcode"),
        "blocked" => Some("Blocked"),
        "match" => Some("Match"),
        "cached" => Some("Cached"),
        "created" => Some("Created"),
        _ => None,
    }
}

/// The persistent query log plus its human-readable output.
pub struct QueryLog {
    config: QueryLogConfig,
    db: Option<Mutex<Connection>>,
    file: Option<Mutex<std::fs::File>>,
    retention: ChronoDuration,
}

impl QueryLog {
    /// Open the query log under `{data_root}/qlog.db` when persistence is
    /// enabled.
    pub fn open(data_root: &Path, config: &QueryLogConfig) -> Result<Self, StorageError> {
        let db = if config.enabled() && config.persist() {
            std::fs::create_dir_all(data_root).map_err(|source| StorageError::CreateDir {
                path: data_root.to_path_buf(),
                source,
            })?;
            let connection = Connection::open(data_root.join("qlog.db"))?;
            connection.execute_batch(SCHEMA)?;
            Some(Mutex::new(connection))
        } else {
            None
        };

        let file = config.file.as_ref().and_then(|path| {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(Mutex::new(file)),
                Err(err) => {
                    warn!("could not open query log file {path:?}: {err}");
                    None
                }
            }
        });

        Ok(Self {
            config: config.clone(),
            db,
            file,
            retention: ChronoDuration::from_std(config.duration())
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
        })
    }

    /// An unpersisted query log, for tests and disabled configurations.
    pub fn ephemeral() -> Self {
        Self {
            config: QueryLogConfig::default(),
            db: None,
            file: None,
            retention: ChronoDuration::hours(24),
        }
    }

    /// Write the batch through the buffer table in one transaction. A
    /// failure rolls back and loses only this batch; the next flush starts
    /// clean.
    pub fn flush(&self, batch: &[InfoRecord]) {
        if batch.is_empty() {
            return;
        }
        let Some(db) = &self.db else {
            return;
        };
        let mut db = db.lock();

        let result = (|| -> Result<(), rusqlite::Error> {
            let tx = db.transaction()?;
            {
                let mut insert = tx.prepare_cached(&format!(
                    "INSERT INTO buffer ({QLOG_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ))?;
                for info in batch {
                    insert.execute(params![
                        info.address,
                        info.consumer,
                        info.client_name,
                        info.request_domain,
                        info.request_type,
                        info.response_text,
                        info.rcode,
                        info.cached,
                        info.blocked,
                        info.rule_match.as_u8(),
                        info.match_list,
                        info.match_rule,
                        info.created,
                    ])?;
                }
            }
            tx.execute_batch(&format!(
                "INSERT INTO qlog ({QLOG_COLUMNS}) SELECT {QLOG_COLUMNS} FROM buffer;
                 DELETE FROM buffer;"
            ))?;
            tx.commit()
        })();

        if let Err(err) = result {
            error!("could not flush query log batch: {err}");
        }
    }

    /// Drop rows older than the retention window.
    pub fn prune(&self) {
        let Some(db) = &self.db else {
            return;
        };
        let cutoff = Utc::now() - self.retention;
        if let Err(err) = db
            .lock()
            .execute("DELETE FROM qlog WHERE Created <= ?1", params![cutoff])
        {
            error!("could not prune query log: {err}");
        }
    }

    /// Emit the one-line human-readable record to stdout and the optional
    /// log file.
    pub fn log(&self, info: &InfoRecord) {
        if !self.config.stdout() && self.file.is_none() {
            return;
        }

        let line = render_line(info);
        if self.config.stdout() {
            if info.rcode == format!("{:?}", ResponseCode::ServFail) {
                error!(target: "warden::query", "{line}");
            } else {
                info!(target: "warden::query", "{line}");
            }
        }
        if let Some(file) = &self.file {
            if let Err(err) = writeln!(file.lock(), "{line}") {
                warn!("could not write query log file: {err}");
            }
        }
    }

    /// Materialized readback: the matching rows plus the total count the
    /// filter would produce without paging.
    pub fn query(
        &self,
        query: &QueryLogQuery,
    ) -> Result<(Vec<InfoRecord>, u64), StorageError> {
        let Some(db) = &self.db else {
            return Ok((Vec::new(), 0));
        };
        let db = db.lock();

        let mut or_clauses: Vec<String> = Vec::new();
        let mut where_clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        let mut like = |clauses: &mut Vec<String>, column: &str, value: &Option<String>| {
            if let Some(value) = value {
                clauses.push(format!("{column} LIKE ?"));
                values.push(Box::new(format!("%{value}%")));
            }
        };
        like(&mut or_clauses, "Address", &query.address);
        like(&mut or_clauses, "ClientName", &query.client_name);
        like(&mut or_clauses, "RequestDomain", &query.request_domain);
        like(&mut or_clauses, "ResponseText", &query.response_text);

        if let Some(blocked) = query.blocked {
            where_clauses.push("Blocked = ?".to_string());
            values.push(Box::new(blocked));
        }
        if let Some(rule_match) = query.rule_match {
            where_clauses.push("Match = ?".to_string());
            values.push(Box::new(rule_match.as_u8()));
        }
        if let Some(cached) = query.cached {
            where_clauses.push("Cached = ?".to_string());
            values.push(Box::new(cached));
        }
        if let Some(after) = query.after {
            where_clauses.push("Created > ?".to_string());
            values.push(Box::new(after));
        }
        if let Some(before) = query.before {
            where_clauses.push("Created < ?".to_string());
            values.push(Box::new(before));
        }

        let mut conditions = Vec::new();
        if !or_clauses.is_empty() {
            conditions.push(format!("({})", or_clauses.join(" OR ")));
        }
        conditions.extend(where_clauses);
        let where_sql = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let sort_by = query
            .sort_by
            .as_deref()
            .and_then(sort_column)
            .unwrap_or("Created");
        let direction = match query.direction.as_deref().map(str::to_uppercase) {
            Some(dir) if dir == "ASC" || dir == "DESC" => dir,
            _ if sort_by == "Created" => "DESC".to_string(),
            _ => "ASC".to_string(),
        };

        let mut select = format!(
            "SELECT {QLOG_COLUMNS} FROM qlog{where_sql} ORDER BY {sort_by} {direction}"
        );
        if query.limit > 0 {
            let _ = write!(select, " LIMIT {}", query.limit);
        }
        if query.skip > 0 {
            let _ = write!(select, " OFFSET {}", query.skip);
        }
        let count_sql = format!("SELECT COUNT(*) FROM qlog{where_sql}");

        let value_refs: Vec<&dyn ToSql> = values.iter().map(AsRef::as_ref).collect();

        let total: u64 = db.query_row(&count_sql, &value_refs[..], |row| row.get(0))?;

        let mut stmt = db.prepare(&select)?;
        let rows = stmt.query_map(&value_refs[..], |row| {
            Ok(InfoRecord {
                address: row.get(0)?,
                consumer: row.get(1)?,
                client_name: row.get(2)?,
                request_domain: row.get(3)?,
                request_type: row.get(4)?,
                response_text: row.get(5)?,
                rcode: row.get(6)?,
                cached: row.get(7)?,
                blocked: row.get(8)?,
                rule_match: Match::from_u8(row.get(9)?),
                match_list: row.get(10)?,
                match_rule: row.get(11)?,
                created: row.get(12)?,
                ..InfoRecord::default()
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok((records, total))
    }

    /// Streaming readback: the total count goes out once on `count_tx`,
    /// then each row on `row_tx`; both channels close when done.
    pub fn query_stream(
        &self,
        query: &QueryLogQuery,
        count_tx: mpsc::UnboundedSender<u64>,
        row_tx: mpsc::UnboundedSender<InfoRecord>,
    ) -> Result<(), StorageError> {
        let (records, total) = self.query(query)?;
        let _ = count_tx.send(total);
        drop(count_tx);
        for record in records {
            if row_tx.send(record).is_err() {
                break;
            }
        }
        Ok(())
    }
}

fn render_line(info: &InfoRecord) -> String {
    let mut line = String::with_capacity(96);
    line.push('[');
    if !info.client_name.is_empty() {
        line.push_str(&info.client_name);
        line.push('|');
    }
    let _ = write!(
        line,
        "{}/{}|{}] q:[{}|{}]->",
        info.address, info.protocol, info.consumer, info.request_domain, info.request_type
    );

    if info.rcode == format!("{:?}", ResponseCode::ServFail) {
        let _ = write!(line, "SERVFAIL:[{}]", info.message);
        return line;
    }

    if info.blocked {
        line.push_str("BLOCKED");
    } else if info.rule_match == Match::Block {
        let _ = write!(line, "RULE BLOCKED[{}|{}]", info.match_list, info.match_rule);
    } else {
        if info.cached {
            let _ = write!(line, "c:[{}]", info.resolver);
        } else {
            let _ = write!(line, "r:[{}]->s:[{}]", info.resolver, info.source);
        }
        line.push_str("->");
        if info.response_text.is_empty() {
            let _ = write!(line, "({})", info.rcode);
        } else {
            match info.response_text.split_once(", ") {
                Some((first, rest)) => {
                    let _ = write!(line, "{first} (+{})", rest.split(", ").count());
                }
                None => line.push_str(&info.response_text),
            }
        }
    }
    line
}

/// Handle to the recorder queue and its worker.
pub struct Recorder {
    sender: mpsc::Sender<InfoRecord>,
    worker: tokio::task::JoinHandle<()>,
}

impl Recorder {
    /// Start the worker that drains the queue into the query log and the
    /// metrics counters.
    pub fn start(
        qlog: Arc<QueryLog>,
        metrics: Option<Arc<Metrics>>,
        metrics_interval: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(worker(receiver, qlog, metrics, metrics_interval));
        Self { sender, worker }
    }

    /// Enqueue one record without blocking; drops the record when the
    /// queue is full.
    pub fn queue(&self, info: InfoRecord) {
        if self.sender.try_send(info).is_err() {
            debug!("recorder queue full, dropping record");
        }
    }

    /// Close the queue, let the worker drain it, flush, and prune. Returns
    /// once the worker has acknowledged by exiting.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(err) = self.worker.await {
            warn!("recorder worker ended abnormally: {err}");
        }
    }
}

async fn worker(
    mut receiver: mpsc::Receiver<InfoRecord>,
    qlog: Arc<QueryLog>,
    metrics: Option<Arc<Metrics>>,
    metrics_interval: Duration,
) {
    let mut batch: Vec<InfoRecord> = Vec::new();

    let start = tokio::time::Instant::now();
    let mut flush_tick = tokio::time::interval_at(start + FLUSH_INTERVAL, FLUSH_INTERVAL);
    let mut metrics_tick = tokio::time::interval_at(start + metrics_interval, metrics_interval);
    let mut prune_tick = tokio::time::interval_at(start + PRUNE_INTERVAL, PRUNE_INTERVAL);

    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Some(info) => {
                    qlog.log(&info);
                    if let Some(metrics) = &metrics {
                        metrics.record(&info);
                    }
                    batch.push(info);
                    if batch.len() >= MAX_BATCH {
                        qlog.flush(&batch);
                        batch.clear();
                    }
                }
                // channel closed and drained: wrap up
                None => break,
            },
            _ = flush_tick.tick() => {
                qlog.flush(&batch);
                batch.clear();
            }
            _ = metrics_tick.tick() => {
                if let Some(metrics) = &metrics {
                    metrics.update();
                    metrics.insert(Utc::now());
                }
            }
            _ = prune_tick.tick() => {
                qlog.prune();
                if let Some(metrics) = &metrics {
                    metrics.prune();
                }
            }
        }
    }

    // final flush and prune on the way out
    qlog.flush(&batch);
    qlog.prune();
    if let Some(metrics) = &metrics {
        metrics.update();
        metrics.insert(Utc::now());
        metrics.prune();
    }
}
