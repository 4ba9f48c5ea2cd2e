//! Rule list model and file parsing.
//!
//! A list is a named set of rules of one type (allow or block) built from a
//! source file. List files mix two line shapes:
//!
//! - plain rule lines: `ads.example.com`, `*.tracker.net`, `/^r.*\.com$/`
//! - hosts-format lines: `0.0.0.0 ads.example.com tracker.example.com`
//!
//! Comments start with `#` or `//`; blank lines are skipped. Hosts-format
//! lines contribute every domain after the address, minus the usual system
//! entries.

use std::io::BufRead;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Domains that hosts-format blocklists carry but never mean to block.
const IGNORED_DOMAINS: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
];

const REMOTE_PREFIXES: &[&str] = &["http:", "https:"];

/// Whether a list allows or blocks the domains it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListType {
    Allow,
    #[default]
    Block,
}

impl ListType {
    /// Parse the configured type string; anything but "allow" blocks.
    pub fn parse(text: &str) -> Self {
        if text.eq_ignore_ascii_case("allow") {
            Self::Allow
        } else {
            Self::Block
        }
    }
}

/// A named rule list. Immutable once built from its source.
#[derive(Debug, Clone, Default)]
pub struct List {
    pub name: String,
    pub list_type: ListType,
    pub tags: Vec<String>,
    pub source: String,
}

impl List {
    /// The display name: the configured name, or the source when unnamed.
    pub fn canonical_name(&self) -> &str {
        if self.name.is_empty() {
            &self.source
        } else {
            &self.name
        }
    }

    /// A name safe for table keys and metric names: lowercased with
    /// non-alphanumeric runs collapsed to single dashes.
    pub fn short_name(&self) -> String {
        let mut short = String::with_capacity(self.canonical_name().len());
        let mut dash = false;
        for ch in self.canonical_name().chars() {
            if ch.is_ascii_alphanumeric() {
                short.push(ch.to_ascii_lowercase());
                dash = false;
            } else if !dash && !short.is_empty() {
                short.push('-');
                dash = true;
            }
        }
        short.trim_end_matches('-').to_string()
    }

    /// Remote lists are downloaded into the cache directory out of band.
    pub fn is_remote(&self) -> bool {
        let lower = self.source.to_lowercase();
        REMOTE_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
    }

    /// Where the list file lives on disk: the source path itself, or the
    /// cached download for remote lists.
    pub fn path(&self, cache_root: &Path) -> PathBuf {
        if self.is_remote() {
            cache_root.join(format!("{}.list", self.short_name()))
        } else {
            PathBuf::from(&self.source)
        }
    }
}

/// Error type for list file parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Extract rule texts from a list file.
pub fn parse_rules(reader: &mut dyn BufRead) -> Result<Vec<String>, ParseError> {
    let mut rules = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
            continue;
        }

        // drop inline comments
        let trimmed = trimmed.split('#').next().unwrap_or(trimmed).trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut tokens = trimmed.split_whitespace();
        let Some(first) = tokens.next() else {
            continue;
        };

        if first.parse::<IpAddr>().is_ok() {
            // hosts-format line: every remaining token is a domain
            for domain in tokens {
                if IGNORED_DOMAINS.contains(&domain.to_lowercase().as_str()) {
                    continue;
                }
                if domain.parse::<IpAddr>().is_ok() {
                    continue;
                }
                rules.push(domain.to_string());
            }
        } else {
            rules.push(first.to_string());
        }
    }

    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn parse(content: &str) -> Vec<String> {
        parse_rules(&mut BufReader::new(content.as_bytes())).unwrap()
    }

    #[test]
    fn should_parse_plain_rule_lines() {
        let rules = parse("# comment\nexample.com\n*.ads.com\n/^r.*\\.com$/\n");
        assert_eq!(rules, vec!["example.com", "*.ads.com", "/^r.*\\.com$/"]);
    }

    #[test]
    fn should_extract_domains_from_hosts_lines() {
        let rules = parse("0.0.0.0 ads.example.com tracker.example.com\n");
        assert_eq!(rules, vec!["ads.example.com", "tracker.example.com"]);
    }

    #[test]
    fn should_skip_system_entries_and_addresses() {
        let rules = parse("127.0.0.1 localhost\n0.0.0.0 0.0.0.0\n0.0.0.0 ads.example.com\n");
        assert_eq!(rules, vec!["ads.example.com"]);
    }

    #[test]
    fn should_skip_comments_and_blank_lines() {
        let rules = parse("\n# one\n// two\nexample.com # trailing\n\n");
        assert_eq!(rules, vec!["example.com"]);
    }

    #[test]
    fn should_build_short_names() {
        let list = List {
            name: "Steven Black's Hosts".to_string(),
            ..List::default()
        };
        assert_eq!(list.short_name(), "steven-black-s-hosts");

        let unnamed = List {
            source: "/etc/warden/ads.list".to_string(),
            ..List::default()
        };
        assert_eq!(unnamed.canonical_name(), "/etc/warden/ads.list");
    }

    #[test]
    fn should_detect_remote_lists() {
        let list = List {
            name: "remote".to_string(),
            source: "https://example.com/hosts.txt".to_string(),
            ..List::default()
        };
        assert!(list.is_remote());
        assert_eq!(
            list.path(Path::new("/tmp/cache")),
            PathBuf::from("/tmp/cache/remote.list")
        );

        let local = List {
            name: "local".to_string(),
            source: "/etc/warden/ads.list".to_string(),
            ..List::default()
        };
        assert!(!local.is_remote());
        assert_eq!(
            local.path(Path::new("/tmp/cache")),
            PathBuf::from("/etc/warden/ads.list")
        );
    }
}
