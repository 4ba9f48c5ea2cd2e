//! Rule parsing and matching.
//!
//! A rule is one line of text from a list. Rules come in three kinds:
//!
//! - **Exact**: a literal domain (`ads.example.com`), matched by
//!   case-insensitive equality against any suffix of the queried name.
//! - **Wildcard**: contains `*`, where each `*` matches any run of
//!   characters that does not cross a label boundary (`a*.*.com`).
//! - **Regex**: delimited by `/` (`/^r.*\.com$/`), compiled case-insensitive
//!   and anchored exactly as written.
//!
//! Wildcard and regex rules are "complex": they cannot be indexed and are
//! scanned per list by the stores.

mod sql_store;
mod store;

pub use sql_store::SqlStore;
pub use store::{HashStore, RuleStore};

use regex::Regex;

use crate::dnsutil::normalize_domain;

/// Verdict of a rule-store lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Match {
    #[default]
    None,
    Allow,
    Block,
}

impl Match {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Allow => 1,
            Self::Block => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Allow,
            2 => Self::Block,
            _ => Self::None,
        }
    }
}

impl std::fmt::Display for Match {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Allow => write!(f, "allow"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// How a rule's text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Exact,
    Wildcard,
    Regex,
}

/// A single parsed rule.
#[derive(Debug, Clone)]
pub struct Rule {
    text: String,
    kind: RuleKind,
    pattern: Option<Regex>,
}

impl Rule {
    /// Parse one line of rule text. Returns `None` for blank lines and for
    /// regex rules whose body does not compile.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        // a lone "/" cannot delimit a regex body; any longer slash-framed
        // text compiles as one, even "//" with its empty body
        if text.len() >= 2 && text.starts_with('/') && text.ends_with('/') {
            let body = &text[1..text.len() - 1];
            let pattern = Regex::new(&format!("(?i){body}")).ok()?;
            return Some(Self {
                text: text.to_string(),
                kind: RuleKind::Regex,
                pattern: Some(pattern),
            });
        }

        if text.contains('*') {
            let pattern = Regex::new(&wildcard_pattern(text)).ok()?;
            return Some(Self {
                text: text.to_string(),
                kind: RuleKind::Wildcard,
                pattern: Some(pattern),
            });
        }

        Some(Self {
            text: normalize_domain(text),
            kind: RuleKind::Exact,
            pattern: None,
        })
    }

    /// The original rule text (exact rules are stored normalized).
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Complex rules (wildcard, regex) are scanned rather than indexed.
    pub fn is_complex(&self) -> bool {
        self.kind != RuleKind::Exact
    }

    /// Test the rule against a domain. The domain may carry a trailing dot
    /// and any casing.
    pub fn is_match(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        match &self.pattern {
            Some(pattern) => pattern.is_match(&domain),
            None => self.text == domain,
        }
    }
}

/// Translate a wildcard rule into an anchored regular expression where each
/// `*` matches within a single label.
fn wildcard_pattern(text: &str) -> String {
    let literals: Vec<String> = text.split('*').map(regex::escape).collect();
    format!("(?i)^{}$", literals.join("[^.]*"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_rule_kinds() {
        assert_eq!(
            Rule::parse("simple.domain.com").unwrap().kind(),
            RuleKind::Exact
        );
        assert_eq!(
            Rule::parse("/.*google.*/").unwrap().kind(),
            RuleKind::Regex
        );
        assert_eq!(
            Rule::parse("*.google.com").unwrap().kind(),
            RuleKind::Wildcard
        );
        assert!(Rule::parse("simple.domain.com").unwrap().pattern.is_none());
        assert!(Rule::parse("").is_none());
        // slash-framed text is a regex whatever its body holds
        assert_eq!(Rule::parse("//").unwrap().kind(), RuleKind::Regex);
        assert_eq!(Rule::parse("/").unwrap().kind(), RuleKind::Exact);
    }

    #[test]
    fn should_match_exact_rules_case_insensitively() {
        let rule = Rule::parse("Google.COM").unwrap();
        assert!(rule.is_match("google.com"));
        assert!(rule.is_match("GOOGLE.COM."));
        assert!(!rule.is_match("yahoo.com"));
        // suffix walking is the store's job, not the rule's
        assert!(!rule.is_match("mail.google.com"));
    }

    #[test]
    fn should_keep_wildcards_within_one_label() {
        let rule = Rule::parse("a*.*.com").unwrap();
        assert!(!rule.is_match("google.com"));
        assert!(rule.is_match("ads.google.com"));
        assert!(rule.is_match("ads.yahoo.com"));
        assert!(!rule.is_match("ads.yahoo.org"));
        assert!(!rule.is_match("ads.com"));
    }

    #[test]
    fn should_match_regex_rules_as_written() {
        let rule = Rule::parse("/^r.*\\.com$/").unwrap();
        assert!(rule.is_match("ripple.com"));
        assert!(rule.is_match("rack.com"));
        assert!(!rule.is_match("frack.com"));
        assert!(!rule.is_match("rrrrr.com.co"));
    }

    #[test]
    fn should_reject_unparsable_regex_rules() {
        assert!(Rule::parse("/((/").is_none());
    }
}
