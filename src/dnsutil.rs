//! Small helpers over DNS messages.
//!
//! Everything here operates on `hickory_proto` types and is shared by the
//! cache, the resolver chain, the engine, and the recorder.

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Name, RData, Record};

/// Build a response skeleton for the given request: same id, the request's
/// questions copied over, response flag set and a clean `NoError` code.
pub fn reply(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_response_code(ResponseCode::NoError);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response
}

/// Build a response for the request carrying only a response code.
pub fn reply_with_code(request: &Message, code: ResponseCode) -> Message {
    let mut response = reply(request);
    response.set_response_code(code);
    response
}

/// A response counts as empty unless at least one answer record carries a
/// payload that renders to a value. Name-server and additional records do
/// not make a response non-empty on their own.
pub fn is_empty_response(response: Option<&Message>) -> bool {
    let Some(response) = response else {
        return true;
    };
    !response
        .answers()
        .iter()
        .any(|record| record_value(record).is_some_and(|value| !value.is_empty()))
}

/// Render the payload of a record to text, for query logging and for the
/// empty-response test. Returns `None` for payload-less record types.
pub fn record_value(record: &Record) -> Option<String> {
    match record.data() {
        Some(RData::A(a)) => Some(a.0.to_string()),
        Some(RData::AAAA(aaaa)) => Some(aaaa.0.to_string()),
        Some(RData::CNAME(cname)) => Some(trim_fqdn(&cname.0.to_utf8())),
        Some(RData::PTR(ptr)) => Some(trim_fqdn(&ptr.0.to_utf8())),
        Some(RData::NS(ns)) => Some(trim_fqdn(&ns.0.to_utf8())),
        Some(RData::MX(mx)) => Some(trim_fqdn(&mx.exchange().to_utf8())),
        Some(RData::TXT(txt)) => Some(
            txt.txt_data()
                .iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(" "),
        ),
        Some(RData::SOA(soa)) => Some(trim_fqdn(&soa.mname().to_utf8())),
        Some(RData::SRV(srv)) => Some(trim_fqdn(&srv.target().to_utf8())),
        _ => None,
    }
}

/// Collect the rendered values of every answer record.
pub fn answer_values(response: &Message) -> Vec<String> {
    response
        .answers()
        .iter()
        .filter_map(record_value)
        .collect()
}

/// The first A/AAAA answer value, if any.
pub fn first_ip_answer(response: &Message) -> Option<String> {
    response.answers().iter().find_map(|record| match record.data() {
        Some(RData::A(a)) => Some(a.0.to_string()),
        Some(RData::AAAA(aaaa)) => Some(aaaa.0.to_string()),
        _ => None,
    })
}

/// The reverse-lookup name (`in-addr.arpa` / `ip6.arpa`) for an address.
pub fn reverse_lookup_name(address: IpAddr) -> Name {
    Name::from(address)
}

/// Normalize a domain for matching: drop the trailing dot, lowercase.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_lowercase()
}

/// The suffix set of a domain, most specific first:
/// `a.b.example.com` yields `[a.b.example.com, b.example.com, example.com, com]`.
pub fn domain_suffixes(domain: &str) -> Vec<String> {
    let normalized = normalize_domain(domain);
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut suffixes = vec![normalized.clone()];
    let mut rest = normalized.as_str();
    while let Some(idx) = rest.find('.') {
        rest = &rest[idx + 1..];
        if !rest.is_empty() {
            suffixes.push(rest.to_string());
        }
    }
    suffixes
}

fn trim_fqdn(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA, PTR, TXT};
    use hickory_proto::rr::RecordType;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    #[test]
    fn should_treat_response_without_answers_as_empty() {
        let response = Message::new();
        assert!(is_empty_response(Some(&response)));
        assert!(is_empty_response(None));
    }

    #[test]
    fn should_treat_response_with_only_ns_records_as_empty() {
        let mut response = Message::new();
        response.add_name_server(Record::from_rdata(
            name("example.com."),
            300,
            RData::NS(hickory_proto::rr::rdata::NS(name("ns.example.com."))),
        ));
        assert!(is_empty_response(Some(&response)));
    }

    #[test]
    fn should_treat_response_with_an_address_answer_as_non_empty() {
        let mut response = Message::new();
        response.add_answer(Record::from_rdata(
            name("test."),
            0,
            RData::A(A(Ipv4Addr::LOCALHOST)),
        ));
        assert!(!is_empty_response(Some(&response)));
    }

    #[test]
    fn should_render_record_values() {
        let hdr = name("test.");
        assert_eq!(
            record_value(&Record::from_rdata(
                hdr.clone(),
                0,
                RData::A(A(Ipv4Addr::new(127, 0, 0, 1)))
            )),
            Some("127.0.0.1".to_string())
        );
        assert_eq!(
            record_value(&Record::from_rdata(
                hdr.clone(),
                0,
                RData::AAAA(AAAA("::1".parse().unwrap()))
            )),
            Some("::1".to_string())
        );
        assert_eq!(
            record_value(&Record::from_rdata(
                hdr.clone(),
                0,
                RData::PTR(PTR(name("google.com.")))
            )),
            Some("google.com".to_string())
        );
        assert_eq!(
            record_value(&Record::from_rdata(
                hdr,
                0,
                RData::TXT(TXT::new(vec!["h".to_string(), "hello".to_string()]))
            )),
            Some("h hello".to_string())
        );
    }

    #[test]
    fn should_collect_all_answer_values() {
        let mut response = Message::new();
        response.add_answer(Record::from_rdata(
            name("test."),
            0,
            RData::A(A(Ipv4Addr::new(127, 0, 0, 1))),
        ));
        response.add_answer(Record::from_rdata(
            name("test."),
            0,
            RData::PTR(PTR(name("google.com."))),
        ));

        let values = answer_values(&response);
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], "127.0.0.1");
    }

    #[test]
    fn should_build_suffix_set_most_specific_first() {
        assert_eq!(
            domain_suffixes("a.b.c.example.com."),
            vec![
                "a.b.c.example.com",
                "b.c.example.com",
                "c.example.com",
                "example.com",
                "com"
            ]
        );
        assert_eq!(domain_suffixes("com"), vec!["com"]);
        assert!(domain_suffixes(".").is_empty());
    }

    #[test]
    fn should_copy_request_id_and_questions_into_reply() {
        let mut request = Message::new();
        request.set_id(4242).set_recursion_desired(true);
        let mut query = hickory_proto::op::Query::new();
        query.set_name(name("example.com."));
        query.set_query_type(RecordType::A);
        request.add_query(query);

        let response = reply_with_code(&request, ResponseCode::Refused);
        assert_eq!(response.id(), 4242);
        assert_eq!(response.queries().len(), 1);
        assert_eq!(response.response_code(), ResponseCode::Refused);
        assert_eq!(response.message_type(), MessageType::Response);
    }
}
