//! Partitioned DNS response cache with TTL decay.
//!
//! Responses are stored in envelopes that remember when they were cached.
//! The envelope lives for the smallest TTL found in the response (answers,
//! else authority, else additionals), capped at seven days. On a hit the
//! returned copy has every record's TTL decremented by the time spent in the
//! cache and the message id rewritten to the incoming request's id.
//!
//! Partitions isolate entries from different resolution contexts sharing
//! one cache instance; resolvers use their name as the partition.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::Record;
use moka::sync::Cache;
use moka::Expiry;
use parking_lot::Mutex;

use crate::dnsutil::is_empty_response;

/// Longest a response may be cached, in seconds.
pub const MAX_TTL_SECS: u32 = 604_800;

const KEY_DELIMITER: char = '|';

#[derive(Clone)]
struct Envelope {
    message: Message,
    stored_at: Instant,
    ttl: Duration,
}

/// Expire each envelope after its own response TTL.
struct EnvelopeExpiry;

impl Expiry<String, Envelope> for EnvelopeExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        envelope: &Envelope,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(envelope.ttl)
    }
}

/// Shared response cache keyed by partition and question set.
pub struct DnsCache {
    entries: Cache<String, Envelope>,
    partitions: Mutex<HashMap<String, usize>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().expire_after(EnvelopeExpiry).build(),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    /// Store a response under the partition and the request's questions.
    /// Empty and truncated responses are never stored; a zero TTL means the
    /// response is not worth keeping. Returns whether the response was
    /// cached.
    pub fn store(&self, partition: &str, request: &Message, response: &Message) -> bool {
        self.store_at(partition, request, response, Instant::now())
    }

    fn store_at(
        &self,
        partition: &str,
        request: &Message,
        response: &Message,
        stored_at: Instant,
    ) -> bool {
        if is_empty_response(Some(response)) || response.truncated() {
            return false;
        }

        let Some(key) = self.key(partition, request) else {
            return false;
        };

        let ttl = envelope_ttl(response);
        if ttl == 0 {
            return false;
        }

        self.entries.insert(
            key,
            Envelope {
                message: response.clone(),
                stored_at,
                ttl: Duration::from_secs(u64::from(ttl)),
            },
        );
        true
    }

    /// Look up a response for the request. On a hit the returned message is
    /// a deep copy with decayed TTLs and the request's id.
    pub fn query(&self, partition: &str, request: &Message) -> Option<Message> {
        let key = self.key(partition, request)?;
        let envelope = self.entries.get(&key)?;

        let elapsed = envelope.stored_at.elapsed().as_secs();
        let delta = u32::try_from(elapsed).unwrap_or(u32::MAX);

        let mut message = envelope.message.clone();
        message.set_id(request.id());

        let answers = decay(message.take_answers(), delta);
        message.insert_answers(answers);
        let name_servers = decay(message.take_name_servers(), delta);
        message.insert_name_servers(name_servers);
        let additionals = decay(message.take_additionals(), delta);
        message.insert_additionals(additionals);

        Some(message)
    }

    /// Number of live entries.
    pub fn size(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    fn key(&self, partition: &str, request: &Message) -> Option<String> {
        if request.queries().is_empty() {
            return None;
        }

        let partition_id = {
            let mut partitions = self.partitions.lock();
            let next = partitions.len() + 1;
            *partitions.entry(partition.to_string()).or_insert(next)
        };

        let mut key = partition_id.to_string();
        for query in request.queries() {
            key.push(KEY_DELIMITER);
            key.push_str(&query.name().to_utf8().to_lowercase());
            key.push(KEY_DELIMITER);
            key.push_str(&query.query_class().to_string());
            key.push(KEY_DELIMITER);
            key.push_str(&query.query_type().to_string());
        }
        Some(key)
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The envelope TTL: the minimum record TTL of the answer section, falling
/// back to authority then additional records, capped at [`MAX_TTL_SECS`].
fn envelope_ttl(response: &Message) -> u32 {
    let sections: [&[Record]; 3] = [
        response.answers(),
        response.name_servers(),
        response.additionals(),
    ];
    sections
        .into_iter()
        .find(|records| !records.is_empty())
        .map(|records| {
            records
                .iter()
                .map(Record::ttl)
                .fold(MAX_TTL_SECS, std::cmp::min)
        })
        .unwrap_or(0)
}

fn decay(records: Vec<Record>, delta: u32) -> Vec<Record> {
    records
        .into_iter()
        .map(|mut record| {
            let remaining = record.ttl().saturating_sub(delta);
            record.set_ttl(remaining);
            record
        })
        .collect()
}
