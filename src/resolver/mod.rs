//! Question answering: sources, resolvers, and the resolver map.
//!
//! A *source* is anything that can answer a DNS question: a hosts-format
//! file, another resolver referenced by name, the host's own nameservers, or
//! a remote endpoint over UDP, TCP, or TLS. A *resolver* runs an ordered
//! list of sources; the `ResolverMap` holds the named resolvers together
//! with the shared response cache and guards the chain against cycles with a
//! per-request visited set.

pub mod hostfile;
pub mod map;
pub mod named;
pub mod remote;
pub mod system;

pub use hostfile::HostfileSource;
pub use map::{Resolver, ResolverMap};
pub use named::NamedSource;
pub use remote::RemoteSource;
pub use system::SystemSource;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::error::ResolveError;
use crate::list::List;
use crate::rule::Match;

/// Client-facing transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable facts about the incoming request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    pub protocol: Protocol,
}

impl RequestContext {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }
}

/// Mutable state threaded through one resolution chain.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Resolver names already entered; refuses re-entry to break cycles.
    pub visited: Vec<String>,
    /// The source that produced the answer, first writer wins.
    pub source_used: String,
    /// Whether the answer came out of the cache.
    pub cached: bool,
}

/// Summary of how a request was resolved, for logging and recording.
#[derive(Debug, Clone, Default)]
pub struct ResolutionResult {
    pub consumer: String,
    pub resolver: String,
    pub source: String,
    pub cached: bool,
    pub blocked: bool,
    pub verdict: Match,
    pub match_list: Option<Arc<List>>,
    pub match_rule: String,
    /// Failure detail, set when the pipeline recovered from a panic.
    pub message: String,
}

/// Something that can answer a DNS question.
///
/// `Ok(None)` means "this source has no answer; try the next one". A
/// returned message is accepted even when its response code is not
/// `NoError`.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> String;

    async fn answer(
        &self,
        rcon: &RequestContext,
        map: &ResolverMap,
        ctx: &mut ResolutionContext,
        request: &Message,
    ) -> Result<Option<Message>, ResolveError>;
}

/// Interpret a source spec string, in order: a resolver reference by name, a
/// readable hostfile path, a remote endpoint `host[:port][/protocol]`, then
/// the literal `system`.
pub fn source_for_spec(
    spec: &str,
    resolver_names: &HashSet<String>,
) -> Result<Box<dyn Source>, ResolveError> {
    let spec = spec.trim();

    if resolver_names.contains(spec) {
        return Ok(Box::new(NamedSource::new(spec)));
    }

    if Path::new(spec).is_file() {
        return Ok(Box::new(HostfileSource::new(Path::new(spec))));
    }

    if let Ok(source) = RemoteSource::parse(spec) {
        return Ok(Box::new(source));
    }

    if spec.eq_ignore_ascii_case("system") {
        return Ok(Box::new(SystemSource::from_resolv_conf()));
    }

    Err(ResolveError::Endpoint(spec.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_prefer_resolver_references_over_endpoints() {
        let names: HashSet<String> = ["upstream".to_string()].into();
        let source = source_for_spec("upstream", &names).unwrap();
        assert_eq!(source.name(), "upstream");
    }

    #[test]
    fn should_fall_through_to_remote_endpoints() {
        let names = HashSet::new();
        let source = source_for_spec("8.8.8.8:53/udp", &names).unwrap();
        assert_eq!(source.name(), "8.8.8.8:53");
    }

    #[test]
    fn should_resolve_the_system_literal() {
        let names = HashSet::new();
        let source = source_for_spec("system", &names).unwrap();
        assert_eq!(source.name(), "system");
    }

    #[test]
    fn should_reject_specs_that_match_nothing() {
        let names = HashSet::new();
        assert!(source_for_spec("not a spec", &names).is_err());
    }
}
