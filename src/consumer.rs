//! Client-to-consumer selection.
//!
//! A consumer is the policy subject for a client address: it carries the
//! flattened lists and resolver names its groups contribute. Selection
//! walks the configured consumers in order and takes the first whose match
//! rules accept the address; when none does the reserved `default` consumer
//! applies. Addresses are compared in their 16-byte form so a consumer
//! written with IPv4 literals also matches mapped IPv6 clients.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::list::List;

/// One way a consumer can match a client address.
#[derive(Debug, Clone)]
pub enum ConsumerMatch {
    Ip(IpAddr),
    Range { start: IpAddr, end: IpAddr },
    Net(IpNet),
}

impl ConsumerMatch {
    fn matches(&self, address: IpAddr) -> bool {
        match self {
            Self::Ip(ip) => as_bytes(*ip) == as_bytes(address),
            Self::Range { start, end } => {
                let address = as_bytes(address);
                as_bytes(*start) <= address && address <= as_bytes(*end)
            }
            Self::Net(net) => net.contains(&unmapped(address)),
        }
    }
}

/// A policy subject with its precomputed lists and resolvers.
#[derive(Debug, Clone, Default)]
pub struct Consumer {
    pub name: String,
    /// Refuse all queries from this consumer outright.
    pub block: bool,
    pub matches: Vec<ConsumerMatch>,
    pub lists: Vec<Arc<List>>,
    pub resolvers: Vec<String>,
}

impl Consumer {
    fn matches(&self, address: IpAddr) -> bool {
        self.matches.iter().any(|rule| rule.matches(address))
    }
}

/// Ordered consumer list with the fallback consumer.
pub struct ConsumerSelector {
    consumers: Vec<Consumer>,
    default_consumer: Consumer,
}

impl ConsumerSelector {
    pub fn new(consumers: Vec<Consumer>, default_consumer: Consumer) -> Self {
        Self {
            consumers,
            default_consumer,
        }
    }

    /// First consumer whose rules match the address, else `default`.
    pub fn select(&self, address: IpAddr) -> &Consumer {
        self.consumers
            .iter()
            .find(|consumer| consumer.matches(address))
            .unwrap_or(&self.default_consumer)
    }

    pub fn default_consumer(&self) -> &Consumer {
        &self.default_consumer
    }
}

fn as_bytes(address: IpAddr) -> [u8; 16] {
    match address {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Fold mapped IPv6 addresses back to IPv4 for CIDR containment.
fn unmapped(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => address,
        },
        IpAddr::V4(_) => address,
    }
}
