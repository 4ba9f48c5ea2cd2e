//! Hosts-format file source.
//!
//! Parses a hosts file once at construction and answers `A`, `AAAA`, `PTR`,
//! `CNAME`, and `ANY` questions from it. Lines come in two shapes:
//!
//! ```text
//! 10.0.0.1   server.lan server
//! target.lan alias.lan other-alias.lan
//! ```
//!
//! The first token is either an address (a hosts line) or a CNAME target
//! followed by its aliases. `#` and `//` start comments; tabs and commas are
//! treated as spaces. All names are normalized to lowercase FQDNs. A reverse
//! index is kept so PTR questions can be answered for every address seen.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::{A, AAAA, CNAME, PTR};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::warn;

use crate::dnsutil::{is_empty_response, reply, reverse_lookup_name};
use crate::error::ResolveError;
use crate::resolver::map::ResolverMap;
use crate::resolver::{RequestContext, ResolutionContext, Source};

// hostfile answers are essentially free, so they are never cached
const TTL: u32 = 0;

pub struct HostfileSource {
    path: PathBuf,
    host_entries: HashMap<String, Vec<IpAddr>>,
    cname_entries: HashMap<String, String>,
    reverse_lookup: HashMap<String, Vec<String>>,
}

impl HostfileSource {
    /// Parse the file at `path`. An unreadable file yields an empty source.
    pub fn new(path: &Path) -> Self {
        let mut source = Self {
            path: path.to_path_buf(),
            host_entries: HashMap::new(),
            cname_entries: HashMap::new(),
            reverse_lookup: HashMap::new(),
        };

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!("could not read hostfile {path:?}: {err}");
                return source;
            }
        };

        for line in content.lines() {
            source.parse_line(line);
        }
        source
    }

    fn parse_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with('*')
            || line.starts_with('#')
            || line.starts_with("//")
        {
            return;
        }

        let line = line.replace(['\t', ','], " ");
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            return;
        };
        let domains: Vec<&str> = tokens.collect();
        if domains.is_empty() {
            return;
        }

        if let Ok(address) = first.parse::<IpAddr>() {
            let ptr = fqdn(&reverse_lookup_name(address).to_utf8());
            self.reverse_lookup
                .entry(ptr)
                .or_default()
                .extend(domains.iter().map(|d| d.to_string()));

            for domain in domains {
                self.host_entries.entry(fqdn(domain)).or_default().push(address);
            }
        } else {
            // cname line: target alias alias ...
            let target = fqdn(first);
            for alias in domains {
                self.cname_entries.entry(fqdn(alias)).or_insert_with(|| target.clone());
            }
        }
    }

    fn respond_to_address(&self, name: &str, qtype: RecordType, response: &mut Message) {
        let Some(addresses) = self.host_entries.get(name) else {
            return;
        };
        let Ok(record_name) = Name::from_utf8(name) else {
            return;
        };

        for address in addresses {
            let rdata = match address {
                IpAddr::V4(v4) if qtype != RecordType::AAAA => RData::A(A(*v4)),
                IpAddr::V6(v6) if qtype != RecordType::A => RData::AAAA(AAAA(*v6)),
                _ => continue,
            };
            response.add_answer(Record::from_rdata(record_name.clone(), TTL, rdata));
        }
    }

    fn respond_to_cname(&self, name: &str, response: &mut Message) {
        let Some(target) = self.cname_entries.get(name) else {
            return;
        };
        let (Ok(record_name), Ok(target)) = (Name::from_utf8(name), Name::from_utf8(target))
        else {
            return;
        };
        response.add_answer(Record::from_rdata(
            record_name,
            TTL,
            RData::CNAME(CNAME(target)),
        ));
    }

    fn respond_to_ptr(&self, name: &str, response: &mut Message) {
        let Some(domains) = self.reverse_lookup.get(name) else {
            return;
        };
        let Ok(record_name) = Name::from_utf8(name) else {
            return;
        };

        for domain in domains {
            let Ok(ptr) = Name::from_utf8(&fqdn(domain)) else {
                continue;
            };
            response.add_answer(Record::from_rdata(
                record_name.clone(),
                TTL,
                RData::PTR(PTR(ptr)),
            ));
        }
    }
}

#[async_trait]
impl Source for HostfileSource {
    fn name(&self) -> String {
        format!("hostfile:{}", self.path.display())
    }

    async fn answer(
        &self,
        _rcon: &RequestContext,
        _map: &ResolverMap,
        ctx: &mut ResolutionContext,
        request: &Message,
    ) -> Result<Option<Message>, ResolveError> {
        let Some(question) = request.queries().first() else {
            return Ok(None);
        };

        let qtype = question.query_type();
        if !matches!(
            qtype,
            RecordType::ANY
                | RecordType::A
                | RecordType::AAAA
                | RecordType::PTR
                | RecordType::CNAME
        ) {
            return Ok(None);
        }

        let name = fqdn(&question.name().to_utf8());
        let mut response = reply(request);

        if matches!(qtype, RecordType::ANY | RecordType::CNAME) {
            self.respond_to_cname(&name, &mut response);
        }

        if matches!(qtype, RecordType::ANY | RecordType::A | RecordType::AAAA) {
            // a cname answer wins over direct addresses for A/AAAA
            if qtype != RecordType::ANY {
                self.respond_to_cname(&name, &mut response);
            }
            if qtype == RecordType::ANY || response.answers().is_empty() {
                self.respond_to_address(&name, qtype, &mut response);
            }
        }

        if matches!(qtype, RecordType::ANY | RecordType::PTR) {
            self.respond_to_ptr(&name, &mut response);
        }

        if ctx.source_used.is_empty() && !is_empty_response(Some(&response)) {
            ctx.source_used = self.name();
        }

        Ok(Some(response))
    }
}

fn fqdn(name: &str) -> String {
    let mut name = name.to_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}
