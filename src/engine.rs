//! The per-request pipeline and engine assembly.
//!
//! `Engine::handle` turns `(client address, protocol, request)` into
//! `(response, request context, resolution result)`:
//!
//! 1. validate the question (shape, name length, supported type)
//! 2. select the consumer for the client address
//! 3. match the name against the consumer's lists (allow beats block)
//! 4. resolve through the consumer's resolvers unless blocked
//! 5. chase a leading CNAME once, rewriting answers to the asked name
//! 6. normalize a still-empty response to NXDOMAIN
//! 7. enqueue the record
//!
//! A panic anywhere inside the pipeline is caught and converted to a
//! SERVFAIL response carrying the panic text; a resolver bug must not take
//! DNS down with it.

use std::collections::{HashMap, HashSet};
use std::io::BufReader;
use std::net::IpAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use hickory_proto::op::{Message, OpCode, ResponseCode};
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::{Name, RData, RecordType};
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::cache::DnsCache;
use crate::config::{Config, StorageKind, DEFAULT_NAME};
use crate::consumer::{Consumer, ConsumerMatch, ConsumerSelector};
use crate::dnsutil::{first_ip_answer, is_empty_response, record_value, reverse_lookup_name};
use crate::error::Result;
use crate::list::{List, ListType};
use crate::metrics::{self, Metrics};
use crate::qlog::{InfoRecord, QueryLog, Recorder};
use crate::resolver::{
    source_for_spec, Protocol, RequestContext, ResolutionResult, Resolver, ResolverMap,
    SystemSource,
};
use crate::rule::{HashStore, Match, RuleStore, SqlStore};

/// Question types answered with NotImplemented.
const NOT_IMPLEMENTED: &[RecordType] = &[
    RecordType::ZERO,
    RecordType::NULL,
    RecordType::IXFR,
    RecordType::AXFR,
];

pub struct Engine {
    selector: ConsumerSelector,
    store: Box<dyn RuleStore>,
    resolvers: Arc<ResolverMap>,
    qlog: Arc<QueryLog>,
    metrics: Option<Arc<Metrics>>,
    recorder: Mutex<Option<Recorder>>,
}

impl Engine {
    /// Assemble an engine from configuration: build the lists and the rule
    /// store, flatten groups into consumers, wire up resolvers, and start
    /// the recorder. Must run inside a tokio runtime.
    pub fn build(config: &Config) -> Result<Self> {
        let session = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            std::process::id()
        );

        let lists: Vec<Arc<List>> = config
            .lists
            .iter()
            .map(|cfg| {
                Arc::new(List {
                    name: cfg.name.clone(),
                    list_type: ListType::parse(&cfg.list_type),
                    tags: cfg.tags.clone(),
                    source: cfg.src.clone(),
                })
            })
            .collect();

        let mut store: Box<dyn RuleStore> = match config.storage {
            StorageKind::Memory => Box::new(HashStore::new()),
            StorageKind::Sqlite => Box::new(SqlStore::open(
                &config.session_root().join(&session),
                &lists,
            )?),
        };
        load_lists(store.as_mut(), &lists, config);
        store.finalize();

        let selector = build_selector(config, &lists);
        let resolvers = Arc::new(build_resolvers(config));

        let metrics = if config.metrics.enabled() {
            let metrics = Arc::new(Metrics::open(&config.data_root(), &config.metrics)?);
            metrics.set(metrics::TOTAL_RULES, store.rule_count() as i64);
            let cache_handle = Arc::clone(&resolvers);
            metrics.use_cache_size_fn(Box::new(move || cache_handle.cache().size()));
            Some(metrics)
        } else {
            None
        };

        let qlog = Arc::new(QueryLog::open(&config.data_root(), &config.querylog)?);

        let recorder = Recorder::start(
            Arc::clone(&qlog),
            metrics.clone(),
            config.metrics.interval(),
        );

        info!(
            session = %session,
            rules = store.rule_count(),
            lists = lists.len(),
            "engine ready"
        );

        Ok(Self {
            selector,
            store,
            resolvers,
            qlog,
            metrics,
            recorder: Mutex::new(Some(recorder)),
        })
    }

    /// Entry point for the listeners: run the pipeline and enqueue the
    /// record.
    #[instrument(skip(self, request), fields(client = %address))]
    pub async fn handle(
        &self,
        address: IpAddr,
        protocol: Protocol,
        request: &Message,
    ) -> (Message, RequestContext, ResolutionResult) {
        let rcon = RequestContext::new(protocol);

        let outcome = std::panic::AssertUnwindSafe(self.perform_request(address, &rcon, request, true))
            .catch_unwind()
            .await;

        let (response, result) = match outcome {
            Ok(done) => done,
            Err(panic) => {
                // a panic inside resolution must not take the server down;
                // answer SERVFAIL and keep serving
                let text = panic_text(panic.as_ref());
                warn!("recovered from panic during resolution: {text}");
                let response = reply_with_code(request, ResponseCode::ServFail);
                let result = ResolutionResult {
                    message: text,
                    ..ResolutionResult::default()
                };
                (response, result)
            }
        };

        if let Some(recorder) = self.recorder.lock().as_ref() {
            recorder.queue(InfoRecord::new(address, request, &response, &rcon, &result));
        }

        (response, rcon, result)
    }

    fn perform_request<'a>(
        &'a self,
        address: IpAddr,
        rcon: &'a RequestContext,
        request: &'a Message,
        chase: bool,
    ) -> BoxFuture<'a, (Message, ResolutionResult)> {
        async move {
            let consumer = self.selector.select(address);
            let mut result = ResolutionResult {
                consumer: consumer.name.clone(),
                ..ResolutionResult::default()
            };

            let Some(question) = request.queries().first() else {
                return (reply_with_code(request, ResponseCode::Refused), result);
            };

            let qname = question.name().to_utf8();
            if qname.is_empty() || qname.len() > 255 {
                return (reply_with_code(request, ResponseCode::BADNAME), result);
            }

            if NOT_IMPLEMENTED.contains(&question.query_type()) {
                return (reply_with_code(request, ResponseCode::NotImp), result);
            }

            if consumer.block {
                result.blocked = true;
                return (reply_with_code(request, ResponseCode::Refused), result);
            }

            let found = self.store.find_match(&consumer.lists, &qname);
            if found.verdict != Match::None {
                result.verdict = found.verdict;
                result.match_list = found.list;
                result.match_rule = found.rule;
            }
            if found.verdict == Match::Block {
                return (reply_with_code(request, ResponseCode::Refused), result);
            }

            let (response, resolution) = self
                .resolvers
                .answer_multi(rcon, &consumer.resolvers, request)
                .await;
            result.resolver = resolution.resolver;
            result.source = resolution.source;
            result.cached = resolution.cached;

            let mut response = match response {
                Some(response) => response,
                None => Message::new(),
            };

            if chase {
                if let Some(chased) = self
                    .chase_cname(address, rcon, request, &response)
                    .await
                {
                    response = chased;
                }
            }

            if is_empty_response(Some(&response)) {
                set_reply(&mut response, request);
                response.set_response_code(ResponseCode::NXDomain);
            }

            (response, result)
        }
        .boxed()
    }

    /// When the first answer is a CNAME and the question was not, ask the
    /// pipeline again for the target and return the answers under the name
    /// the client asked for. The chase goes one level deep; the inner
    /// request resolves any further CNAMEs through its own resolution.
    async fn chase_cname(
        &self,
        address: IpAddr,
        rcon: &RequestContext,
        request: &Message,
        response: &Message,
    ) -> Option<Message> {
        let question = request.queries().first()?;
        let answer = response.answers().first()?;

        if question.query_type() == RecordType::CNAME {
            return None;
        }
        let Some(RData::CNAME(CNAME(target))) = answer.data() else {
            return None;
        };

        let mut cname_request = request.clone();
        let queries = cname_request
            .take_queries()
            .into_iter()
            .map(|mut query| {
                query.set_name(target.clone());
                query
            })
            .collect::<Vec<_>>();
        for query in queries {
            cname_request.add_query(query);
        }

        let (cname_response, _) = self
            .perform_request(address, rcon, &cname_request, false)
            .await;
        if is_empty_response(Some(&cname_response)) {
            return None;
        }

        let original_name = question.name().clone();
        let mut merged = cname_response;
        let answers = merged
            .take_answers()
            .into_iter()
            .map(|mut record| {
                record.set_name(original_name.clone());
                record
            })
            .collect();
        merged.insert_answers(answers);
        set_reply(&mut merged, request);
        Some(merged)
    }

    /// Resolve a name to its first address through the full pipeline, as a
    /// local client would.
    pub async fn resolve(&self, domain: &str) -> Option<String> {
        if domain.is_empty() {
            return None;
        }
        let name = Name::from_utf8(domain).ok()?;
        let request = build_query(name, RecordType::A);

        let rcon = RequestContext::default();
        let (response, _) = self
            .perform_request(IpAddr::from([127, 0, 0, 1]), &rcon, &request, true)
            .await;
        first_ip_answer(&response)
    }

    /// Reverse-lookup an address to its first PTR name.
    pub async fn reverse(&self, address: IpAddr) -> Option<String> {
        let request = build_query(reverse_lookup_name(address), RecordType::PTR);

        let rcon = RequestContext::default();
        let (response, _) = self
            .perform_request(IpAddr::from([127, 0, 0, 1]), &rcon, &request, true)
            .await;
        response
            .answers()
            .iter()
            .find(|record| record.record_type() == RecordType::PTR)
            .and_then(record_value)
    }

    pub fn cache_size(&self) -> u64 {
        self.resolvers.cache().size()
    }

    pub fn cache(&self) -> &DnsCache {
        self.resolvers.cache()
    }

    pub fn query_log(&self) -> &Arc<QueryLog> {
        &self.qlog
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Drain and stop the recorder (final flush and prune included). The
    /// databases close when the engine is dropped.
    pub async fn shutdown(&self) {
        let recorder = self.recorder.lock().take();
        if let Some(recorder) = recorder {
            recorder.shutdown().await;
        }
    }
}

fn load_lists(store: &mut dyn RuleStore, lists: &[Arc<List>], config: &Config) {
    let cache_root = config.cache_root();
    for list in lists {
        let path = list.path(&cache_root);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(list = list.canonical_name(), "could not open list {path:?}: {err}");
                continue;
            }
        };
        match crate::list::parse_rules(&mut BufReader::new(file)) {
            Ok(rules) => {
                for rule in &rules {
                    store.load(list, rule);
                }
                info!(
                    list = list.canonical_name(),
                    rules = rules.len(),
                    "loaded list"
                );
            }
            Err(err) => warn!(list = list.canonical_name(), "could not parse list: {err}"),
        }
    }
}

/// Lists and resolvers contributed by a group after inheritance.
#[derive(Default, Clone)]
struct FlatGroup {
    lists: Vec<String>,
    resolvers: Vec<String>,
}

/// Flatten group inheritance depth-first, left to right, unioning lists and
/// resolvers with first-seen order kept. Cycles are rejected at config
/// validation.
fn flatten_group(name: &str, config: &Config) -> FlatGroup {
    fn visit(name: &str, config: &Config, visited: &mut Vec<String>, flat: &mut FlatGroup) {
        if visited.iter().any(|seen| seen == name) {
            return;
        }
        visited.push(name.to_string());

        let Some(group) = config.groups.iter().find(|g| g.name == name) else {
            return;
        };
        for inherited in &group.inherit {
            visit(inherited, config, visited, flat);
        }
        for list in &group.lists {
            if !flat.lists.contains(list) {
                flat.lists.push(list.clone());
            }
        }
        for resolver in &group.resolvers {
            if !flat.resolvers.contains(resolver) {
                flat.resolvers.push(resolver.clone());
            }
        }
    }

    let mut flat = FlatGroup::default();
    visit(name, config, &mut Vec::new(), &mut flat);

    // an unconfigured default group applies every list
    if name == DEFAULT_NAME
        && flat.lists.is_empty()
        && !config.groups.iter().any(|g| g.name == DEFAULT_NAME)
    {
        flat.lists = config
            .lists
            .iter()
            .map(|list| list.name.clone())
            .collect();
    }

    flat
}

fn build_selector(config: &Config, lists: &[Arc<List>]) -> ConsumerSelector {
    let lists_by_name: HashMap<&str, &Arc<List>> =
        lists.iter().map(|list| (list.name.as_str(), list)).collect();

    let build = |name: &str, groups: &[String], block: bool, matches: Vec<ConsumerMatch>| {
        let group_names: Vec<String> = if groups.is_empty() {
            vec![DEFAULT_NAME.to_string()]
        } else {
            groups.to_vec()
        };

        let mut flat_lists = Vec::new();
        let mut flat_resolvers = Vec::new();
        for group in &group_names {
            let flat = flatten_group(group, config);
            for list in flat.lists {
                if !flat_lists.contains(&list) {
                    flat_lists.push(list);
                }
            }
            for resolver in flat.resolvers {
                if !flat_resolvers.contains(&resolver) {
                    flat_resolvers.push(resolver);
                }
            }
        }
        if flat_resolvers.is_empty() {
            flat_resolvers.push(DEFAULT_NAME.to_string());
        }

        Consumer {
            name: name.to_string(),
            block,
            matches,
            lists: flat_lists
                .iter()
                .filter_map(|name| lists_by_name.get(name.as_str()).map(|l| Arc::clone(l)))
                .collect(),
            resolvers: flat_resolvers,
        }
    };

    let mut consumers = Vec::new();
    let mut default_consumer = None;
    for cfg in &config.consumers {
        let matches = cfg
            .matches
            .iter()
            .flat_map(|m| {
                let mut rules = Vec::new();
                if let Some(ip) = m.ip {
                    rules.push(ConsumerMatch::Ip(ip));
                }
                if let Some(range) = &m.range {
                    rules.push(ConsumerMatch::Range {
                        start: range.start,
                        end: range.end,
                    });
                }
                if let Some(net) = m.net {
                    rules.push(ConsumerMatch::Net(net));
                }
                rules
            })
            .collect();

        let consumer = build(&cfg.name, &cfg.groups, cfg.block.unwrap_or(false), matches);
        if cfg.name == DEFAULT_NAME {
            default_consumer = Some(consumer);
        } else {
            consumers.push(consumer);
        }
    }

    let default_consumer =
        default_consumer.unwrap_or_else(|| build(DEFAULT_NAME, &[], false, Vec::new()));
    ConsumerSelector::new(consumers, default_consumer)
}

fn build_resolvers(config: &Config) -> ResolverMap {
    let known_names: HashSet<String> = config
        .resolvers
        .iter()
        .map(|resolver| resolver.name.clone())
        .collect();

    let mut resolvers = Vec::new();
    for cfg in &config.resolvers {
        let mut sources = Vec::new();
        for spec in &cfg.sources {
            match source_for_spec(spec, &known_names) {
                Ok(source) => sources.push(source),
                Err(err) => warn!(
                    resolver = %cfg.name,
                    "skipping unusable source '{spec}': {err}"
                ),
            }
        }
        resolvers.push(Resolver::new(
            &cfg.name,
            cfg.domains.clone(),
            cfg.search.clone(),
            sources,
        ));
    }

    // without a configured default resolver, fall back to the host's own
    // nameservers
    if !known_names.contains(DEFAULT_NAME) {
        resolvers.push(Resolver::new(
            DEFAULT_NAME,
            Vec::new(),
            Vec::new(),
            vec![Box::new(SystemSource::from_resolv_conf())],
        ));
    }

    ResolverMap::new(resolvers)
}

fn build_query(name: Name, qtype: RecordType) -> Message {
    let mut query = hickory_proto::op::Query::new();
    query.set_name(name);
    query.set_query_type(qtype);

    let mut request = Message::new();
    request
        .set_id(rand_id())
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_authoritative(true)
        .add_query(query);
    request
}

/// Message ids for internally generated requests; uniqueness does not
/// matter because they never leave the pipeline unmodified.
fn rand_id() -> u16 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u16)
        .unwrap_or(0)
}

fn reply_with_code(request: &Message, code: ResponseCode) -> Message {
    crate::dnsutil::reply_with_code(request, code)
}

fn set_reply(response: &mut Message, request: &Message) {
    response.set_id(request.id());
    response.set_message_type(hickory_proto::op::MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.take_queries();
    for query in request.queries() {
        response.add_query(query.clone());
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
