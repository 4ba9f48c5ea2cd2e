//! End-to-end tests of the request pipeline.
//!
//! These drive `Engine::handle` against real configuration: rule lists and
//! hostfiles in temp files, and upstream servers as loopback UDP responders.
//! No real resolver is contacted.

use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tempfile::TempDir;
use tokio::net::UdpSocket;

use warden::qlog::QueryLogQuery;
use warden::resolver::Protocol;
use warden::rule::Match;
use warden::{Config, Engine};

const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

/// What the mock upstream answers for a name.
#[derive(Clone)]
enum Upstream {
    Address(Ipv4Addr),
    Cname(&'static str),
}

/// Spawn a loopback UDP responder with a fixed answer table (TTL 60).
async fn spawn_upstream(records: &[(&str, Upstream)]) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap();

    let table: HashMap<String, Upstream> = records
        .iter()
        .map(|(name, answer)| (name.to_string(), answer.clone()))
        .collect();

    tokio::spawn(async move {
        let mut buffer = [0u8; 4096];
        while let Ok((length, peer)) = socket.recv_from(&mut buffer).await {
            let Ok(request) = Message::from_bytes(&buffer[..length]) else {
                continue;
            };

            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_recursion_available(true)
                .set_response_code(ResponseCode::NoError);

            for query in request.queries() {
                response.add_query(query.clone());
            }

            if let Some(question) = request.queries().first() {
                let qname = question.name().to_utf8().to_lowercase();
                let qname = qname.trim_end_matches('.');
                match table.get(qname) {
                    Some(Upstream::Address(ip)) => {
                        response.add_answer(Record::from_rdata(
                            question.name().clone(),
                            60,
                            RData::A(A(*ip)),
                        ));
                    }
                    Some(Upstream::Cname(target)) => {
                        let target = Name::from_str(&format!("{target}.")).unwrap();
                        response.add_answer(Record::from_rdata(
                            question.name().clone(),
                            60,
                            RData::CNAME(CNAME(target)),
                        ));
                    }
                    None => {}
                }
            }

            let Ok(bytes) = response.to_bytes() else {
                continue;
            };
            let _ = socket.send_to(&bytes, peer).await;
        }
    });

    address
}

fn write_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path.display().to_string()
}

fn query(domain: &str, qtype: RecordType, id: u16) -> Message {
    let mut q = Query::new();
    q.set_name(Name::from_str(domain).unwrap());
    q.set_query_type(qtype);

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(q);
    message
}

fn build_engine(config_yaml: &str) -> Arc<Engine> {
    let config = Config::parse(config_yaml).unwrap();
    Arc::new(Engine::build(&config).unwrap())
}

fn quiet_tail(home: &Path) -> String {
    format!(
        r#"
  querylog:
    stdout: false
    persist: false
  metrics:
    enabled: false
  home: {}
"#,
        home.display()
    )
}

#[tokio::test]
async fn should_block_listed_domains_and_report_the_rule() {
    let home = TempDir::new().unwrap();
    let upstream = spawn_upstream(&[("ads.example.com", Upstream::Address(Ipv4Addr::new(1, 2, 3, 4)))]).await;
    let ads_list = write_file(home.path(), "ads.list", "ads.example.com\n");

    let engine = build_engine(&format!(
        r#"
warden:
  resolvers:
    - name: default
      sources: ["{upstream}/udp"]
  lists:
    - name: ads
      type: block
      src: {ads_list}
{tail}"#,
        tail = quiet_tail(home.path())
    ));

    let request = query("ads.example.com.", RecordType::A, 100);
    let (response, _, result) = engine.handle(CLIENT, Protocol::Udp, &request).await;

    assert!(response.answers().is_empty());
    assert_eq!(response.response_code(), ResponseCode::Refused);
    assert_eq!(result.verdict, Match::Block);
    assert_eq!(result.match_list.as_deref().unwrap().name, "ads");
    assert_eq!(result.match_rule, "ads.example.com");

    // a sibling name under the same suffix is blocked too
    let request = query("tracker.ads.example.com.", RecordType::A, 101);
    let (response, _, result) = engine.handle(CLIENT, Protocol::Udp, &request).await;
    assert_eq!(result.verdict, Match::Block);
    assert!(response.answers().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn should_let_allow_rules_override_block_rules() {
    let home = TempDir::new().unwrap();
    let upstream = spawn_upstream(&[(
        "good.example.com",
        Upstream::Address(Ipv4Addr::new(10, 0, 0, 9)),
    )])
    .await;
    let block_list = write_file(home.path(), "block.list", "example.com\n");
    let allow_list = write_file(home.path(), "allow.list", "good.example.com\n");

    let engine = build_engine(&format!(
        r#"
warden:
  resolvers:
    - name: default
      sources: ["{upstream}/udp"]
  lists:
    - name: wide-block
      type: block
      src: {block_list}
    - name: exceptions
      type: allow
      src: {allow_list}
{tail}"#,
        tail = quiet_tail(home.path())
    ));

    let request = query("good.example.com.", RecordType::A, 7);
    let (response, _, result) = engine.handle(CLIENT, Protocol::Udp, &request).await;

    assert_eq!(result.verdict, Match::Allow);
    assert_eq!(result.match_list.as_deref().unwrap().name, "exceptions");
    assert_eq!(response.answers().len(), 1);
    assert_eq!(
        response.answers()[0].data().unwrap().as_a().unwrap().0,
        Ipv4Addr::new(10, 0, 0, 9)
    );

    // everything else under the blocked suffix stays blocked
    let request = query("other.example.com.", RecordType::A, 8);
    let (_, _, result) = engine.handle(CLIENT, Protocol::Udp, &request).await;
    assert_eq!(result.verdict, Match::Block);

    engine.shutdown().await;
}

#[tokio::test]
async fn should_serve_repeat_queries_from_the_cache() {
    let home = TempDir::new().unwrap();
    let upstream = spawn_upstream(&[(
        "cached.example.com",
        Upstream::Address(Ipv4Addr::new(127, 0, 0, 1)),
    )])
    .await;

    let engine = build_engine(&format!(
        r#"
warden:
  resolvers:
    - name: default
      sources: ["{upstream}/udp"]
{tail}"#,
        tail = quiet_tail(home.path())
    ));

    let (_, _, first) = engine
        .handle(CLIENT, Protocol::Udp, &query("cached.example.com.", RecordType::A, 1))
        .await;
    assert!(!first.cached);

    let (response, _, second) = engine
        .handle(CLIENT, Protocol::Udp, &query("cached.example.com.", RecordType::A, 2))
        .await;
    assert!(second.cached);
    assert_eq!(response.id(), 2);
    assert_eq!(response.answers().len(), 1);
    assert!(response.answers()[0].ttl() <= 60);
    assert_eq!(engine.cache_size(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn should_answer_nxdomain_when_every_resolver_comes_up_empty() {
    let home = TempDir::new().unwrap();
    let upstream = spawn_upstream(&[]).await;

    let engine = build_engine(&format!(
        r#"
warden:
  resolvers:
    - name: default
      sources: ["{upstream}/udp"]
{tail}"#,
        tail = quiet_tail(home.path())
    ));

    let request = query("nowhere.example.com.", RecordType::A, 31);
    let (response, _, _) = engine.handle(CLIENT, Protocol::Udp, &request).await;

    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert_eq!(response.id(), 31);
    assert!(response.answers().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn should_survive_resolver_reference_cycles() {
    let home = TempDir::new().unwrap();

    let engine = build_engine(&format!(
        r#"
warden:
  resolvers:
    - name: default
      sources: ["loop-b"]
    - name: loop-b
      sources: ["default"]
{tail}"#,
        tail = quiet_tail(home.path())
    ));

    let request = query("spin.example.com.", RecordType::A, 5);
    let (response, _, _) = engine.handle(CLIENT, Protocol::Udp, &request).await;

    // no answer and, more to the point, no stack overflow
    assert_eq!(response.response_code(), ResponseCode::NXDomain);

    engine.shutdown().await;
}

#[tokio::test]
async fn should_chase_cnames_and_answer_under_the_asked_name() {
    let home = TempDir::new().unwrap();
    let upstream = spawn_upstream(&[("foo.example.com", Upstream::Cname("bar.example.com"))]).await;
    let hostfile = write_file(home.path(), "hosts", "10.0.0.1 bar.example.com\n");

    let engine = build_engine(&format!(
        r#"
warden:
  resolvers:
    - name: default
      sources: ["{upstream}/udp", "{hostfile}"]
{tail}"#,
        tail = quiet_tail(home.path())
    ));

    let request = query("foo.example.com.", RecordType::A, 77);
    let (response, _, _) = engine.handle(CLIENT, Protocol::Udp, &request).await;

    assert_eq!(response.id(), 77);
    assert_eq!(response.answers().len(), 1);
    let answer = &response.answers()[0];
    assert_eq!(answer.name().to_utf8(), "foo.example.com.");
    assert_eq!(answer.data().unwrap().as_a().unwrap().0, Ipv4Addr::new(10, 0, 0, 1));

    engine.shutdown().await;
}

#[tokio::test]
async fn should_refuse_blocked_consumers_without_evaluating_rules() {
    let home = TempDir::new().unwrap();
    let upstream = spawn_upstream(&[(
        "fine.example.com",
        Upstream::Address(Ipv4Addr::new(10, 0, 0, 2)),
    )])
    .await;

    let engine = build_engine(&format!(
        r#"
warden:
  resolvers:
    - name: default
      sources: ["{upstream}/udp"]
  consumers:
    - name: punished
      block: true
      matches:
        - ip: 192.168.1.66
{tail}"#,
        tail = quiet_tail(home.path())
    ));

    let blocked_client = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 66));
    let request = query("fine.example.com.", RecordType::A, 9);
    let (response, _, result) = engine.handle(blocked_client, Protocol::Udp, &request).await;

    assert_eq!(response.response_code(), ResponseCode::Refused);
    assert!(result.blocked);
    assert_eq!(result.consumer, "punished");
    assert_eq!(result.verdict, Match::None);

    // everyone else resolves normally
    let (response, _, result) = engine.handle(CLIENT, Protocol::Udp, &request).await;
    assert_eq!(response.answers().len(), 1);
    assert!(!result.blocked);

    engine.shutdown().await;
}

#[tokio::test]
async fn should_answer_not_implemented_for_transfer_queries() {
    let home = TempDir::new().unwrap();
    let engine = build_engine(&format!("warden:\n{}", quiet_tail(home.path())));

    for qtype in [RecordType::AXFR, RecordType::IXFR, RecordType::NULL] {
        let request = query("example.com.", qtype, 3);
        let (response, _, _) = engine.handle(CLIENT, Protocol::Udp, &request).await;
        assert_eq!(response.response_code(), ResponseCode::NotImp, "{qtype}");
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn should_refuse_requests_without_questions() {
    let home = TempDir::new().unwrap();
    let engine = build_engine(&format!("warden:\n{}", quiet_tail(home.path())));

    let request = Message::new();
    let (response, _, _) = engine.handle(CLIENT, Protocol::Udp, &request).await;
    assert_eq!(response.response_code(), ResponseCode::Refused);

    engine.shutdown().await;
}

#[tokio::test]
async fn should_match_rules_through_the_sqlite_store_too() {
    let home = TempDir::new().unwrap();
    let upstream = spawn_upstream(&[]).await;
    let ads_list = write_file(home.path(), "ads.list", "ads.example.com\n*.tracker.net\n");

    let engine = build_engine(&format!(
        r#"
warden:
  storage: sqlite
  resolvers:
    - name: default
      sources: ["{upstream}/udp"]
  lists:
    - name: ads
      type: block
      src: {ads_list}
{tail}"#,
        tail = quiet_tail(home.path())
    ));

    let (_, _, exact) = engine
        .handle(CLIENT, Protocol::Udp, &query("ads.example.com.", RecordType::A, 1))
        .await;
    assert_eq!(exact.verdict, Match::Block);

    let (_, _, complex) = engine
        .handle(CLIENT, Protocol::Udp, &query("px.tracker.net.", RecordType::A, 2))
        .await;
    assert_eq!(complex.verdict, Match::Block);
    assert_eq!(complex.match_rule, "*.tracker.net");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn should_record_handled_queries_into_the_query_log() {
    let home = TempDir::new().unwrap();
    let upstream = spawn_upstream(&[(
        "logged.example.com",
        Upstream::Address(Ipv4Addr::new(10, 0, 0, 3)),
    )])
    .await;
    let ads_list = write_file(home.path(), "ads.list", "ads.example.com\n");

    let engine = build_engine(&format!(
        r#"
warden:
  home: {home}
  resolvers:
    - name: default
      sources: ["{upstream}/udp"]
  lists:
    - name: ads
      type: block
      src: {ads_list}
  querylog:
    stdout: false
  metrics:
    enabled: false
"#,
        home = home.path().display()
    ));

    engine
        .handle(CLIENT, Protocol::Udp, &query("logged.example.com.", RecordType::A, 1))
        .await;
    engine
        .handle(CLIENT, Protocol::Udp, &query("ads.example.com.", RecordType::A, 2))
        .await;

    // shutdown drains the queue and flushes the batch
    engine.shutdown().await;

    let (records, total) = engine.query_log().query(&QueryLogQuery::default()).unwrap();
    assert_eq!(total, 2);
    assert!(records.iter().any(|r| r.request_domain == "logged.example.com."
        && r.response_text.contains("10.0.0.3")));
    assert!(records
        .iter()
        .any(|r| r.request_domain == "ads.example.com." && r.rule_match == Match::Block));

    let (filtered, filtered_total) = engine
        .query_log()
        .query(&QueryLogQuery {
            rule_match: Some(Match::Block),
            ..QueryLogQuery::default()
        })
        .unwrap();
    assert_eq!(filtered_total, 1);
    assert_eq!(filtered[0].match_list, "ads");
}
