//! Named resolvers and the resolver map.
//!
//! A resolver runs its sources in order and takes the first non-empty
//! answer. The map owns every named resolver plus the shared response
//! cache; lookups go through `answer_with_context` so that the per-request
//! visited set can refuse re-entry into a resolver already on the path.

use std::collections::HashMap;

use hickory_proto::op::Message;
use tracing::{debug, warn};

use crate::cache::DnsCache;
use crate::dnsutil::{is_empty_response, normalize_domain};
use crate::error::ResolveError;
use crate::resolver::{RequestContext, ResolutionContext, ResolutionResult, Source};

/// A named, ordered composition of sources.
pub struct Resolver {
    name: String,
    /// When non-empty, only questions under these suffixes are handled.
    domains: Vec<String>,
    /// Suffixes retried one at a time when the primary answer is empty.
    search: Vec<String>,
    sources: Vec<Box<dyn Source>>,
}

impl Resolver {
    pub fn new(
        name: &str,
        domains: Vec<String>,
        search: Vec<String>,
        sources: Vec<Box<dyn Source>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            domains: domains.iter().map(|d| normalize_domain(d)).collect(),
            search,
            sources,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, qname: &str) -> bool {
        if self.domains.is_empty() {
            return true;
        }
        let qname = normalize_domain(qname);
        self.domains
            .iter()
            .any(|domain| qname == *domain || qname.ends_with(&format!(".{domain}")))
    }

    async fn answer_from_sources(
        &self,
        rcon: &RequestContext,
        map: &ResolverMap,
        ctx: &mut ResolutionContext,
        request: &Message,
    ) -> Option<Message> {
        let mut last = None;
        for source in &self.sources {
            match source.answer(rcon, map, ctx, request).await {
                Ok(Some(response)) => {
                    if !is_empty_response(Some(&response)) {
                        return Some(response);
                    }
                    last = Some(response);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(
                        resolver = %self.name,
                        source = %source.name(),
                        "source failed: {err}"
                    );
                }
            }
        }
        last
    }

    async fn answer(
        &self,
        rcon: &RequestContext,
        map: &ResolverMap,
        ctx: &mut ResolutionContext,
        request: &Message,
    ) -> Option<Message> {
        let qname = request
            .queries()
            .first()
            .map(|q| q.name().to_utf8())
            .unwrap_or_default();
        if !self.handles(&qname) {
            return None;
        }

        let primary = self.answer_from_sources(rcon, map, ctx, request).await;
        if !is_empty_response(primary.as_ref()) {
            return primary;
        }

        // the primary name came back empty; retry under each search suffix
        for suffix in &self.search {
            let retry = retry_request(request, &qname, suffix);
            let response = self.answer_from_sources(rcon, map, ctx, &retry).await;
            if let Some(response) = response {
                if !is_empty_response(Some(&response)) {
                    return Some(rename_answers(response, request));
                }
            }
        }

        primary
    }
}

/// Mapping of resolver names to resolvers, plus the shared cache.
pub struct ResolverMap {
    resolvers: HashMap<String, Resolver>,
    cache: DnsCache,
}

impl ResolverMap {
    pub fn new(resolvers: Vec<Resolver>) -> Self {
        Self {
            resolvers: resolvers
                .into_iter()
                .map(|resolver| (resolver.name.clone(), resolver))
                .collect(),
            cache: DnsCache::new(),
        }
    }

    /// A map with no resolvers, for sources that are exercised alone.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// Answer through one named resolver. Returns `None` when the resolver
    /// is unknown, already on the visited path, or has no answer.
    pub async fn answer_with_context(
        &self,
        name: &str,
        rcon: &RequestContext,
        ctx: &mut ResolutionContext,
        request: &Message,
    ) -> Result<Option<Message>, ResolveError> {
        if ctx.visited.iter().any(|visited| visited == name) {
            return Ok(None);
        }
        ctx.visited.push(name.to_string());

        let Some(resolver) = self.resolvers.get(name) else {
            warn!("unknown resolver '{name}'");
            return Ok(None);
        };

        if let Some(hit) = self.cache.query(name, request) {
            ctx.cached = true;
            return Ok(Some(hit));
        }

        let response = resolver.answer(rcon, self, ctx, request).await;
        if let Some(response) = &response {
            if !response.truncated() {
                self.cache.store(name, request, response);
            }
        }

        Ok(response)
    }

    /// Try resolvers in order and return the first non-empty response. When
    /// every resolver yields an empty response the last of them is returned
    /// so the caller still has response codes to work with.
    pub async fn answer_multi(
        &self,
        rcon: &RequestContext,
        resolver_names: &[String],
        request: &Message,
    ) -> (Option<Message>, ResolutionResult) {
        let mut last_empty = None;
        let mut result = ResolutionResult::default();

        for name in resolver_names {
            let mut ctx = ResolutionContext::default();
            match self.answer_with_context(name, rcon, &mut ctx, request).await {
                Ok(Some(response)) => {
                    result.resolver = name.clone();
                    result.source = ctx.source_used;
                    result.cached = ctx.cached;
                    if !is_empty_response(Some(&response)) {
                        return (Some(response), result);
                    }
                    last_empty = Some(response);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("resolver '{name}' failed: {err}");
                }
            }
        }

        (last_empty, result)
    }
}

/// Clone the request with the search suffix appended to the question name.
fn retry_request(request: &Message, qname: &str, suffix: &str) -> Message {
    let retry_name = format!(
        "{}.{}.",
        normalize_domain(qname),
        normalize_domain(suffix)
    );
    let mut retry = request.clone();
    let queries = retry
        .take_queries()
        .into_iter()
        .map(|mut query| {
            if let Ok(name) = hickory_proto::rr::Name::from_utf8(&retry_name) {
                query.set_name(name);
            }
            query
        })
        .collect::<Vec<_>>();
    for query in queries {
        retry.add_query(query);
    }
    retry
}

/// Rewrite a search-suffix answer so it matches the question the client
/// actually asked.
fn rename_answers(mut response: Message, request: &Message) -> Message {
    let Some(original) = request.queries().first().map(|q| q.name().clone()) else {
        return response;
    };

    let answers = response
        .take_answers()
        .into_iter()
        .map(|mut record| {
            record.set_name(original.clone());
            record
        })
        .collect();
    response.insert_answers(answers);

    response.take_queries();
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response.set_id(request.id());
    response
}
