//! Host default nameservers as a source.
//!
//! The `system` source spec reads the nameservers from `/etc/resolv.conf`
//! and tries each one in order, inheriting the client's protocol.

use std::path::Path;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::{debug, warn};

use crate::dnsutil::is_empty_response;
use crate::error::ResolveError;
use crate::resolver::map::ResolverMap;
use crate::resolver::remote::RemoteSource;
use crate::resolver::{RequestContext, ResolutionContext, Source};

const RESOLV_CONF: &str = "/etc/resolv.conf";

pub struct SystemSource {
    nameservers: Vec<RemoteSource>,
}

impl SystemSource {
    pub fn from_resolv_conf() -> Self {
        Self::from_file(Path::new(RESOLV_CONF))
    }

    pub fn from_file(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!("could not read {path:?}: {err}");
                return Self {
                    nameservers: Vec::new(),
                };
            }
        };

        let nameservers = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
            .filter_map(|line| {
                let mut tokens = line.split_whitespace();
                match (tokens.next(), tokens.next()) {
                    (Some("nameserver"), Some(address)) => RemoteSource::parse(address).ok(),
                    _ => None,
                }
            })
            .collect();

        Self { nameservers }
    }
}

#[async_trait]
impl Source for SystemSource {
    fn name(&self) -> String {
        "system".to_string()
    }

    async fn answer(
        &self,
        rcon: &RequestContext,
        map: &ResolverMap,
        ctx: &mut ResolutionContext,
        request: &Message,
    ) -> Result<Option<Message>, ResolveError> {
        for nameserver in &self.nameservers {
            match nameserver.answer(rcon, map, ctx, request).await {
                Ok(Some(response)) if !is_empty_response(Some(&response)) => {
                    return Ok(Some(response));
                }
                Ok(_) => {}
                Err(err) => {
                    debug!("system nameserver {} failed: {err}", nameserver.name());
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn should_parse_nameserver_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# generated by NetworkManager").unwrap();
        writeln!(file, "search lan").unwrap();
        writeln!(file, "nameserver 10.0.0.1").unwrap();
        writeln!(file, "nameserver fd00::1").unwrap();
        file.flush().unwrap();

        let source = SystemSource::from_file(file.path());
        assert_eq!(source.nameservers.len(), 2);
        assert_eq!(source.nameservers[0].name(), "10.0.0.1:53");
    }

    #[test]
    fn should_survive_a_missing_file() {
        let source = SystemSource::from_file(Path::new("/nonexistent/resolv.conf"));
        assert!(source.nameservers.is_empty());
    }
}
