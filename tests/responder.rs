use fake::faker::lorem::en::Word;
use fake::Fake;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use clusterdns::client::{exchange, poll_until, query_message};
use clusterdns::name_table::{NameTable, SharedNameTable};
use clusterdns::protocol::types::*;
use clusterdns::responder::Responder;
use clusterdns::server::listen_udp;

const UPSTREAM_ADDRESS: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
const UPSTREAM_TIMEOUT: Duration = Duration::from_millis(300);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

fn domain(name: &str) -> DomainName {
    DomainName::from_dotted_string(name).unwrap()
}

fn a_query(name: &str) -> Message {
    query_message(domain(name), QueryType::Record(RecordType::A), true)
}

/// How the fake recursive resolver treats each query.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Behaviour {
    /// Answer every A question with `UPSTREAM_ADDRESS`.
    Answer,
    /// Never reply.
    Silent,
    /// Reply REFUSED with an empty question section.
    RefuseWithoutQuestion,
}

/// A fake recursive resolver which counts the queries it gets.
struct Upstream {
    address: SocketAddr,
    queries: Arc<AtomicUsize>,
}

async fn upstream(behaviour: Behaviour) -> Upstream {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = sock.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));

    let counter = queries.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        loop {
            let (size, peer) = sock.recv_from(&mut buf).await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            if behaviour == Behaviour::Silent {
                continue;
            }

            let query = Message::from_octets(&buf[..size]).unwrap();
            let mut response = query.make_response();
            response.header.recursion_available = true;
            if behaviour == Behaviour::RefuseWithoutQuestion {
                response.header.rcode = Rcode::Refused;
                response.questions.clear();
                sock.send_to(&response.to_octets().unwrap(), peer)
                    .await
                    .unwrap();
                continue;
            }
            for question in &query.questions {
                response.answers.push(ResourceRecord {
                    name: question.name.clone(),
                    rtype_with_data: RecordTypeWithData::A {
                        address: UPSTREAM_ADDRESS,
                    },
                    rclass: RecordClass::IN,
                    ttl: 3600,
                });
            }
            sock.send_to(&response.to_octets().unwrap(), peer)
                .await
                .unwrap();
        }
    });

    Upstream { address, queries }
}

/// Start a server on an ephemeral port, returning its address and
/// its Name Table.
async fn server(upstream: &Upstream) -> (SocketAddr, Arc<SharedNameTable>) {
    let table: NameTable = [
        (domain("kubernetes.default.local."), Ipv4Addr::new(10, 96, 0, 1)),
        (domain("db.default.local."), Ipv4Addr::new(10, 96, 0, 2)),
    ]
    .into_iter()
    .collect();
    let names = Arc::new(SharedNameTable::new(table));

    let responder = Arc::new(Responder {
        authoritative_suffix: domain("default.local."),
        upstream_nameserver: upstream.address,
        upstream_timeout: UPSTREAM_TIMEOUT,
        answer_ttl: 30,
        names: names.clone(),
    });

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let address = sock.local_addr().unwrap();
    tokio::spawn(listen_udp(responder, sock));

    (address, names)
}

#[tokio::test]
async fn answers_name_in_table() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;
    let query = a_query("kubernetes.default.local.");

    let response = exchange(address, &query, CLIENT_TIMEOUT).await.unwrap();

    assert_eq!(query.header.id, response.header.id);
    assert_eq!(Rcode::NoError, response.header.rcode);
    assert!(response.header.is_authoritative);
    assert!(response.header.recursion_desired);
    assert_eq!(query.questions, response.questions);
    assert_eq!(
        vec![ResourceRecord {
            name: domain("kubernetes.default.local."),
            rtype_with_data: RecordTypeWithData::A {
                address: Ipv4Addr::new(10, 96, 0, 1)
            },
            rclass: RecordClass::IN,
            ttl: 30,
        }],
        response.answers
    );
    assert_eq!(0, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn names_are_case_insensitive() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;

    let response = exchange(address, &a_query("KuberNetes.Default.LOCAL."), CLIENT_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(1, response.answers.len());
    assert_eq!(0, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn absent_name_under_suffix_is_never_forwarded() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;

    for name in ["foo.kubernetes.default.local.", "nothing.here.default.local."] {
        let response = exchange(address, &a_query(name), CLIENT_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(Rcode::NameError, response.header.rcode, "{name}");
        assert!(response.header.is_authoritative, "{name}");
        assert!(response.answers.is_empty(), "{name}");
    }

    assert_eq!(0, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn ancestor_of_a_name_in_table_is_noerror() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;

    let response = exchange(address, &a_query("default.local."), CLIENT_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(Rcode::NoError, response.header.rcode);
    assert!(response.header.is_authoritative);
    assert!(response.answers.is_empty());
    assert_eq!(0, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn aaaa_for_present_name_is_empty() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;
    let query = query_message(
        domain("db.default.local."),
        QueryType::Record(RecordType::AAAA),
        true,
    );

    let response = exchange(address, &query, CLIENT_TIMEOUT).await.unwrap();

    assert_eq!(Rcode::NoError, response.header.rcode);
    assert!(response.answers.is_empty());
    assert_eq!(0, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn forwards_names_outside_suffix() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;
    let query = a_query("www.google.com.");

    let response = exchange(address, &query, CLIENT_TIMEOUT).await.unwrap();

    assert_eq!(query.header.id, response.header.id);
    assert_eq!(Rcode::NoError, response.header.rcode);
    assert!(!response.header.is_authoritative);
    assert!(response.header.recursion_available);
    assert_eq!(1, response.answers.len());
    assert_eq!(
        RecordTypeWithData::A {
            address: UPSTREAM_ADDRESS
        },
        response.answers[0].rtype_with_data
    );
    assert_eq!(3600, response.answers[0].ttl);
    assert_eq!(1, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn lookalike_suffix_is_forwarded() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;

    let response = exchange(address, &a_query("xdefault.local."), CLIENT_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(1, response.answers.len());
    assert_eq!(1, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn repeated_queries_get_the_same_answer() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;

    let first = exchange(address, &a_query("db.default.local."), CLIENT_TIMEOUT)
        .await
        .unwrap();
    let second = exchange(address, &a_query("db.default.local."), CLIENT_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(first.answers, second.answers);
    assert_eq!(first.header.rcode, second.header.rcode);
}

#[tokio::test]
async fn silent_upstream_is_servfail_in_bounded_time() {
    let upstream = upstream(Behaviour::Silent).await;
    let (address, _) = server(&upstream).await;
    let query = a_query("www.google.com.");
    let start = Instant::now();

    let response = exchange(address, &query, CLIENT_TIMEOUT).await.unwrap();

    assert_eq!(query.header.id, response.header.id);
    assert_eq!(Rcode::ServerFailure, response.header.rcode);
    assert!(response.answers.is_empty());
    assert!(start.elapsed() < UPSTREAM_TIMEOUT + Duration::from_secs(2));
    assert_eq!(1, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn upstream_refusal_without_question_is_relayed() {
    let upstream = upstream(Behaviour::RefuseWithoutQuestion).await;
    let (address, _) = server(&upstream).await;
    let query = a_query("www.google.com.");
    let start = Instant::now();

    let response = exchange(address, &query, CLIENT_TIMEOUT).await.unwrap();

    assert_eq!(query.header.id, response.header.id);
    assert_eq!(Rcode::Refused, response.header.rcode);
    assert!(response.questions.is_empty());
    assert!(start.elapsed() < UPSTREAM_TIMEOUT);
    assert_eq!(1, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn newly_inserted_name_starts_resolving() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, names) = server(&upstream).await;
    let label: String = Word().fake();
    let name = format!("{label}.svc.default.local.");

    let before = exchange(address, &a_query(&name), CLIENT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(Rcode::NameError, before.header.rcode);

    names.insert(domain(&name), Ipv4Addr::new(10, 96, 0, 99));

    let answer = poll_until(Duration::from_millis(20), Duration::from_secs(5), || {
        let query = a_query(&name);
        async move {
            exchange(address, &query, CLIENT_TIMEOUT)
                .await
                .ok()
                .filter(|response| !response.answers.is_empty())
        }
    })
    .await
    .unwrap();

    assert_eq!(
        RecordTypeWithData::A {
            address: Ipv4Addr::new(10, 96, 0, 99)
        },
        answer.answers[0].rtype_with_data
    );
    assert_eq!(0, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn removed_name_stops_resolving() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, names) = server(&upstream).await;

    assert_eq!(
        Some(Ipv4Addr::new(10, 96, 0, 2)),
        names.remove(&domain("db.default.local."))
    );

    let response = exchange(address, &a_query("db.default.local."), CLIENT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(Rcode::NameError, response.header.rcode);
    assert_eq!(0, upstream.queries.load(Ordering::SeqCst));
}

#[tokio::test]
async fn malformed_datagram_gets_formerr_and_server_survives() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;

    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sock.connect(address).await.unwrap();
    // header claims one question, but there is none
    sock.send(&[0xab, 0xcd, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut buf = vec![0u8; 512];
    let size = tokio::time::timeout(CLIENT_TIMEOUT, sock.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = Message::from_octets(&buf[..size]).unwrap();
    assert_eq!(0xabcd, response.header.id);
    assert!(response.header.is_response);
    assert_eq!(Rcode::FormatError, response.header.rcode);

    let response = exchange(address, &a_query("kubernetes.default.local."), CLIENT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(1, response.answers.len());
}

#[tokio::test]
async fn id_and_rd_are_copied() {
    let upstream = upstream(Behaviour::Answer).await;
    let (address, _) = server(&upstream).await;
    let mut query = a_query("kubernetes.default.local.");
    query.header.recursion_desired = false;

    let response = exchange(address, &query, CLIENT_TIMEOUT).await.unwrap();

    assert_eq!(query.header.id, response.header.id);
    assert!(!response.header.recursion_desired);
    assert_eq!(1, response.answers.len());
}
