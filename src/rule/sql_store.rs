//! Session-scoped SQLite rule store.
//!
//! Exact rules are buffered into `rules_initial` inside one write
//! transaction during the build, moved into the indexed `rules` table on
//! finalize, and the database is reopened read-only for lookups. Complex
//! rules never reach the database; they are scanned in memory like the hash
//! store does.
//!
//! The database lives under the session directory and is discarded on the
//! next start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use tracing::{error, warn};

use crate::dnsutil::{domain_suffixes, normalize_domain};
use crate::error::StorageError;
use crate::list::{List, ListType};
use crate::rule::store::{RuleMatch, RuleStore};
use crate::rule::{Match, Rule};

const DB_NAME: &str = "rules.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS lists (
    Id INTEGER PRIMARY KEY AUTOINCREMENT,
    ShortName TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS rules (
    ListRowId INTEGER NOT NULL,
    Rule TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS IdxRulesListRule ON rules (ListRowId, Rule);
CREATE TABLE IF NOT EXISTS rules_initial (
    ListRowId INTEGER NOT NULL,
    Rule TEXT NOT NULL
);
";

/// Rule store backed by a per-session SQLite database.
pub struct SqlStore {
    db: Mutex<Connection>,
    path: PathBuf,
    complex: HashMap<String, Vec<Rule>>,
    count: usize,
    building: bool,
}

impl SqlStore {
    /// Create the session database and register the lists. The directory is
    /// created if missing.
    pub fn open(session_dir: &Path, lists: &[Arc<List>]) -> Result<Self, StorageError> {
        std::fs::create_dir_all(session_dir).map_err(|source| StorageError::CreateDir {
            path: session_dir.to_path_buf(),
            source,
        })?;

        let path = session_dir.join(DB_NAME);
        let db = Connection::open(&path)?;
        db.execute_batch(SCHEMA)?;

        for list in lists {
            db.execute(
                "INSERT OR IGNORE INTO lists (ShortName) VALUES (?1)",
                params![list.short_name()],
            )?;
        }

        Ok(Self {
            db: Mutex::new(db),
            path,
            complex: HashMap::new(),
            count: 0,
            building: false,
        })
    }

    fn exact_in_lists(&self, lists: &[&Arc<List>], suffixes: &[String]) -> Option<(String, String)> {
        if lists.is_empty() || suffixes.is_empty() {
            return None;
        }

        let short_names: Vec<String> = lists.iter().map(|l| l.short_name()).collect();
        let stmt = format!(
            "SELECT l.ShortName, r.Rule FROM rules r \
             JOIN lists l ON r.ListRowId = l.Id \
             WHERE l.ShortName IN ({}) AND r.Rule IN ({}) LIMIT 1",
            placeholders(short_names.len()),
            placeholders(suffixes.len()),
        );

        let db = self.db.lock();
        let result = db
            .prepare_cached(&stmt)
            .and_then(|mut prepared| {
                prepared
                    .query_row(
                        params_from_iter(short_names.iter().chain(suffixes.iter())),
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                    )
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        err => Err(err),
                    })
            });

        match result {
            Ok(found) => found,
            Err(err) => {
                warn!("rule lookup failed: {err}");
                None
            }
        }
    }

    fn complex_in_lists(&self, lists: &[&Arc<List>], domain: &str) -> Option<(String, String)> {
        for list in lists {
            if let Some(rules) = self.complex.get(&list.short_name()) {
                for rule in rules {
                    if rule.is_match(domain) {
                        return Some((list.short_name(), rule.text().to_string()));
                    }
                }
            }
        }
        None
    }

    fn match_in_lists(&self, lists: &[&Arc<List>], domain: &str) -> Option<(String, String)> {
        let suffixes = domain_suffixes(domain);
        self.exact_in_lists(lists, &suffixes)
            .or_else(|| self.complex_in_lists(lists, domain))
    }

    fn rollback(db: &Connection) {
        if let Err(err) = db.execute_batch("ROLLBACK;") {
            error!("could not roll back rule transaction: {err}");
        }
    }
}

impl RuleStore for SqlStore {
    fn load(&mut self, list: &Arc<List>, rule: &str) {
        let Some(rule) = Rule::parse(rule) else {
            return;
        };

        if rule.is_complex() {
            self.complex
                .entry(list.short_name())
                .or_default()
                .push(rule);
            self.count += 1;
            return;
        }

        let db = self.db.get_mut();
        if !self.building {
            if let Err(err) = db.execute_batch("BEGIN;") {
                error!("could not start rule transaction: {err}");
                return;
            }
            self.building = true;
        }

        match db.execute(
            "INSERT OR IGNORE INTO rules_initial (ListRowId, Rule) \
             VALUES ((SELECT Id FROM lists WHERE ShortName = ?1 LIMIT 1), ?2)",
            params![list.short_name(), rule.text()],
        ) {
            Ok(changed) => self.count += changed,
            Err(err) => {
                error!("could not insert rule into store: {err}");
                Self::rollback(db);
                self.building = false;
            }
        }
    }

    fn finalize(&mut self) {
        {
            let db = self.db.get_mut();

            if self.building {
                if let Err(err) = db.execute_batch("COMMIT;") {
                    error!("could not commit buffered rules: {err}");
                    Self::rollback(db);
                }
                self.building = false;
            }

            if let Err(err) = db.execute_batch(
                "BEGIN;
                 INSERT INTO rules (ListRowId, Rule)
                     SELECT ListRowId, Rule FROM rules_initial;
                 DELETE FROM rules_initial;
                 COMMIT;",
            ) {
                error!("could not move rules into the indexed table: {err}");
                Self::rollback(db);
            }
        }

        // reopen read-only for the lookup phase
        match Connection::open_with_flags(&self.path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(readonly) => {
                self.db = Mutex::new(readonly);
            }
            Err(err) => error!("could not reopen rule store read-only: {err}"),
        }
    }

    fn find_match(&self, lists: &[Arc<List>], domain: &str) -> RuleMatch {
        let domain = normalize_domain(domain);

        let mut by_short_name: HashMap<String, &Arc<List>> = HashMap::new();
        let mut allow: Vec<&Arc<List>> = Vec::new();
        let mut block: Vec<&Arc<List>> = Vec::new();
        for list in lists {
            by_short_name.insert(list.short_name(), list);
            match list.list_type {
                ListType::Allow => allow.push(list),
                ListType::Block => block.push(list),
            }
        }

        let found = self
            .match_in_lists(&allow, &domain)
            .map(|(short, rule)| (Match::Allow, short, rule))
            .or_else(|| {
                self.match_in_lists(&block, &domain)
                    .map(|(short, rule)| (Match::Block, short, rule))
            });

        match found {
            Some((verdict, short, rule)) => RuleMatch {
                verdict,
                list: by_short_name.get(&short).map(|l| Arc::clone(l)),
                rule,
            },
            None => RuleMatch::default(),
        }
    }

    fn rule_count(&self) -> usize {
        self.count
    }
}

fn placeholders(count: usize) -> String {
    let mut text = String::with_capacity(count * 3);
    for idx in 0..count {
        if idx > 0 {
            text.push_str(", ");
        }
        text.push('?');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::store::tests::{list, loaded};
    use tempfile::TempDir;

    #[test]
    fn should_match_rules_through_sql_store() {
        let dir = TempDir::new().unwrap();
        let blocked = list("blocked", ListType::Block);
        let allowed = list("allowed", ListType::Allow);

        let store = SqlStore::open(
            dir.path(),
            &[Arc::clone(&blocked), Arc::clone(&allowed)],
        )
        .unwrap();
        let store = loaded(
            store,
            &[
                (&blocked, &["ads.example.com", "example.org", "*.tracker.net"]),
                (&allowed, &["good.ads.example.com"]),
            ],
        );

        let candidates = [Arc::clone(&blocked), Arc::clone(&allowed)];

        let found = store.find_match(&candidates, "ads.example.com");
        assert_eq!(found.verdict, Match::Block);
        assert_eq!(found.rule, "ads.example.com");

        let found = store.find_match(&candidates, "cdn.banner.example.org.");
        assert_eq!(found.verdict, Match::Block);
        assert_eq!(found.rule, "example.org");

        let found = store.find_match(&candidates, "beacon.tracker.net");
        assert_eq!(found.verdict, Match::Block);
        assert_eq!(found.rule, "*.tracker.net");

        let found = store.find_match(&candidates, "good.ads.example.com");
        assert_eq!(found.verdict, Match::Allow);

        let found = store.find_match(&candidates, "plain.example.net");
        assert_eq!(found.verdict, Match::None);
    }

    #[test]
    fn should_remain_queryable_after_finalize_moves_rows() {
        let dir = TempDir::new().unwrap();
        let blocked = list("blocked", ListType::Block);

        let mut store = SqlStore::open(dir.path(), &[Arc::clone(&blocked)]).unwrap();
        store.load(&blocked, "ads.example.com");
        store.load(&blocked, "ads.example.com");
        store.finalize();

        assert_eq!(store.rule_count(), 1);

        let found = store.find_match(&[blocked], "ads.example.com");
        assert_eq!(found.verdict, Match::Block);
    }
}
