//! By-name resolver reference source.
//!
//! Lets one resolver chain into another. The visited set in the resolution
//! context keeps the reference graph a DAG at resolution time: re-entering a
//! resolver already on the path yields no answer instead of recursing.

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::error::ResolveError;
use crate::resolver::map::ResolverMap;
use crate::resolver::{RequestContext, ResolutionContext, Source};

pub struct NamedSource {
    resolver_name: String,
}

impl NamedSource {
    pub fn new(resolver_name: &str) -> Self {
        Self {
            resolver_name: resolver_name.to_string(),
        }
    }
}

#[async_trait]
impl Source for NamedSource {
    fn name(&self) -> String {
        self.resolver_name.clone()
    }

    async fn answer(
        &self,
        rcon: &RequestContext,
        map: &ResolverMap,
        ctx: &mut ResolutionContext,
        request: &Message,
    ) -> Result<Option<Message>, ResolveError> {
        if ctx.visited.iter().any(|name| name == &self.resolver_name) {
            return Ok(None);
        }

        map.answer_with_context(&self.resolver_name, rcon, ctx, request)
            .await
    }
}
