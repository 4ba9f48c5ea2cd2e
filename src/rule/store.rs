//! Rule store contract and the in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::dnsutil::{domain_suffixes, normalize_domain};
use crate::list::{List, ListType};
use crate::rule::{Match, Rule};

/// Result of a store lookup: the verdict plus which list and rule produced
/// it.
#[derive(Debug, Clone, Default)]
pub struct RuleMatch {
    pub verdict: Match,
    pub list: Option<Arc<List>>,
    pub rule: String,
}

impl RuleMatch {
    fn found(verdict: Match, list: Arc<List>, rule: String) -> Self {
        Self {
            verdict,
            list: Some(list),
            rule,
        }
    }
}

/// Storage back-end for list rules.
///
/// Stores are built once at engine start (`load` per rule, then `finalize`)
/// and queried read-only afterwards. An allow match on any suffix of the
/// domain always beats a block match.
pub trait RuleStore: Send + Sync {
    /// Add one rule belonging to a list. Called during the build phase.
    fn load(&mut self, list: &Arc<List>, rule: &str);

    /// Seal the store: after this call only lookups are performed.
    fn finalize(&mut self);

    /// Match a domain against a set of candidate lists.
    fn find_match(&self, lists: &[Arc<List>], domain: &str) -> RuleMatch;

    /// Number of rules held, for the active-rules gauge.
    fn rule_count(&self) -> usize;
}

#[derive(Default)]
struct ListRules {
    exact: HashSet<String>,
    complex: Vec<Rule>,
}

/// In-memory store: per list, a set of exact rules and a scan list of
/// compiled complex rules.
#[derive(Default)]
pub struct HashStore {
    rules: HashMap<String, ListRules>,
    count: usize,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn match_in_lists(&self, lists: &[&Arc<List>], domain: &str) -> Option<(Arc<List>, String)> {
        let suffixes = domain_suffixes(domain);

        // exact rules first: indexed, so each suffix is a set probe
        for list in lists {
            if let Some(rules) = self.rules.get(&list.short_name()) {
                for suffix in &suffixes {
                    if rules.exact.contains(suffix) {
                        return Some((Arc::clone(list), suffix.clone()));
                    }
                }
            }
        }

        // then complex rules, scanned in list order
        for list in lists {
            if let Some(rules) = self.rules.get(&list.short_name()) {
                for rule in &rules.complex {
                    if rule.is_match(domain) {
                        return Some((Arc::clone(list), rule.text().to_string()));
                    }
                }
            }
        }

        None
    }
}

impl RuleStore for HashStore {
    fn load(&mut self, list: &Arc<List>, rule: &str) {
        let Some(rule) = Rule::parse(rule) else {
            return;
        };

        let rules = self.rules.entry(list.short_name()).or_default();
        let added = if rule.is_complex() {
            rules.complex.push(rule);
            true
        } else {
            rules.exact.insert(rule.text().to_string())
        };
        if added {
            self.count += 1;
        }
    }

    fn finalize(&mut self) {
        for rules in self.rules.values_mut() {
            rules.exact.shrink_to_fit();
            rules.complex.shrink_to_fit();
        }
    }

    fn find_match(&self, lists: &[Arc<List>], domain: &str) -> RuleMatch {
        let domain = normalize_domain(domain);

        let allow: Vec<&Arc<List>> = lists
            .iter()
            .filter(|l| l.list_type == ListType::Allow)
            .collect();
        let block: Vec<&Arc<List>> = lists
            .iter()
            .filter(|l| l.list_type == ListType::Block)
            .collect();

        if let Some((list, rule)) = self.match_in_lists(&allow, &domain) {
            return RuleMatch::found(Match::Allow, list, rule);
        }
        if let Some((list, rule)) = self.match_in_lists(&block, &domain) {
            return RuleMatch::found(Match::Block, list, rule);
        }

        RuleMatch::default()
    }

    fn rule_count(&self) -> usize {
        self.count
    }
}
