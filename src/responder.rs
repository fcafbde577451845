//! The per-query decision: answer from the Name Table, or forward
//! upstream and relay what comes back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::metrics::{self, Metrics};
use crate::name_table::SharedNameTable;
use crate::protocol::types::*;
use crate::upstream::{self, UpstreamResponse};

/// Where a question is answered from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Route {
    /// Inside the authoritative suffix: the Name Table, only.
    Authoritative,
    /// Everything else: the upstream resolver.
    Forward,
}

/// Label-wise suffix match, so `default.local.` itself is inside
/// `default.local.` but `xdefault.local.` is not.
pub fn route(suffix: &DomainName, name: &DomainName) -> Route {
    if name.is_subdomain_of(suffix) {
        Route::Authoritative
    } else {
        Route::Forward
    }
}

/// What to send back for one datagram.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reply {
    /// A response built here, still to be serialised.
    Built(Message),
    /// An upstream response, to be sent exactly as received.
    Relayed(UpstreamResponse),
}

impl Reply {
    pub fn header(&self) -> &Header {
        match self {
            Reply::Built(message) => &message.header,
            Reply::Relayed(response) => &response.message.header,
        }
    }
}

#[derive(Debug)]
pub struct Responder {
    pub authoritative_suffix: DomainName,
    pub upstream_nameserver: SocketAddr,
    pub upstream_timeout: Duration,
    /// TTL put on authoritative A answers.
    pub answer_ttl: u32,
    pub names: Arc<SharedNameTable>,
}

impl Responder {
    /// Handle one raw datagram.  Returns `None` only if the datagram
    /// is too short to hold an ID, as then no response could be
    /// linked to the query.
    pub async fn handle_raw_message(&self, buf: &[u8]) -> (Option<Reply>, Metrics) {
        let mut metrics = Metrics::new();

        let query = match Message::from_octets(buf) {
            Ok(query) => query,
            Err(error) => {
                tracing::debug!(?error, "could not parse query");
                let reply = error
                    .id()
                    .map(|id| Reply::Built(Message::make_format_error_response(id)));
                return (reply, metrics);
            }
        };

        if query.header.is_response {
            tracing::debug!("got a response, not a query");
            let reply = Reply::Built(Message::make_format_error_response(query.header.id));
            return (Some(reply), metrics);
        }

        let mut response = query.make_response();

        if query.header.opcode != Opcode::Standard {
            tracing::debug!(opcode = ?query.header.opcode, "unsupported opcode");
            response.header.rcode = Rcode::NotImplemented;
            return (Some(Reply::Built(response)), metrics);
        }

        let question = match query.questions.as_slice() {
            [question] => question,
            [] => {
                response.header.rcode = Rcode::FormatError;
                return (Some(Reply::Built(response)), metrics);
            }
            _ => {
                metrics::DNS_REQUESTS_REFUSED_TOTAL
                    .with_label_values(&[metrics::REFUSED_FOR_MULTIPLE_QUESTIONS])
                    .inc();
                response.header.rcode = Rcode::Refused;
                return (Some(Reply::Built(response)), metrics);
            }
        };

        let rd = if query.header.recursion_desired {
            "true"
        } else {
            "false"
        };
        let qtype = question.qtype.to_string();
        let qclass = question.qclass.to_string();
        metrics::DNS_QUESTIONS_TOTAL
            .with_label_values(&[rd, &qtype, &qclass])
            .inc();

        let span = tracing::error_span!("question", %question);
        let reply = match route(&self.authoritative_suffix, &question.name) {
            Route::Authoritative => span.in_scope(|| {
                Reply::Built(self.authoritative_response(&query, question, &mut metrics))
            }),
            Route::Forward => {
                self.forward(&query, buf, response, &mut metrics)
                    .instrument(span)
                    .await
            }
        };

        (Some(reply), metrics)
    }

    /// Answer a question under the authoritative suffix from the
    /// current Name Table snapshot.  This never forwards, whatever
    /// the RD flag says.
    pub fn authoritative_response(
        &self,
        query: &Message,
        question: &Question,
        metrics: &mut Metrics,
    ) -> Message {
        let mut response = query.make_response();
        response.header.is_authoritative = true;

        let names = self.names.load();
        match names.get(&question.name) {
            Some(address) => {
                tracing::trace!("name table HIT");
                metrics.authoritative_hits += 1;

                let rr = ResourceRecord {
                    name: question.name.clone(),
                    rtype_with_data: RecordTypeWithData::A { address },
                    rclass: RecordClass::IN,
                    ttl: self.answer_ttl,
                };
                if rr.matches(question) {
                    response.answers.push(rr);
                }
            }
            None if names.has_descendant(&question.name) => {
                tracing::trace!("name table MISS (empty non-terminal)");
                metrics.authoritative_misses += 1;
            }
            None => {
                tracing::trace!("name table MISS");
                metrics.authoritative_misses += 1;
                response.header.rcode = Rcode::NameError;
            }
        }

        response
    }

    /// Relay the query, exactly as received, to the upstream
    /// resolver.  On failure, `failure_response` goes back with
    /// SERVFAIL.
    async fn forward(
        &self,
        query: &Message,
        raw_query: &[u8],
        mut failure_response: Message,
        metrics: &mut Metrics,
    ) -> Reply {
        match upstream::forward(
            self.upstream_nameserver,
            query,
            raw_query,
            self.upstream_timeout,
        )
        .await
        {
            Ok(response) => {
                tracing::trace!(rcode = %response.message.header.rcode, "upstream HIT");
                metrics.upstream_hits += 1;
                Reply::Relayed(response)
            }
            Err(error) => {
                tracing::debug!(%error, upstream = %self.upstream_nameserver, "upstream MISS");
                metrics.upstream_misses += 1;
                failure_response.header.rcode = Rcode::ServerFailure;
                Reply::Built(failure_response)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::name_table::NameTable;
    use crate::protocol::types::test_util::*;

    fn responder(upstream_nameserver: SocketAddr) -> Responder {
        let names: NameTable = [(
            domain("kubernetes.default.local."),
            Ipv4Addr::new(10, 96, 0, 1),
        )]
        .into_iter()
        .collect();

        Responder {
            authoritative_suffix: domain("default.local."),
            upstream_nameserver,
            upstream_timeout: Duration::from_millis(200),
            answer_ttl: 30,
            names: Arc::new(SharedNameTable::new(names)),
        }
    }

    fn query(name: &str, qtype: QueryType) -> Message {
        let mut query = Message::from_question(
            42,
            Question {
                name: domain(name),
                qtype,
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );
        query.header.recursion_desired = true;
        query
    }

    async fn built(responder: &Responder, query: &Message) -> Message {
        match responder
            .handle_raw_message(&query.to_octets().unwrap())
            .await
        {
            (Some(Reply::Built(message)), _) => message,
            other => panic!("expected a built reply, got {other:?}"),
        }
    }

    /// An upstream which never answers.  Keep the socket alive to
    /// check what it was sent.
    async fn unused_upstream() -> (SocketAddr, tokio::net::UdpSocket) {
        let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (sock.local_addr().unwrap(), sock)
    }

    #[test]
    fn route_is_by_label() {
        let suffix = domain("default.local.");

        assert_eq!(Route::Authoritative, route(&suffix, &domain("default.local.")));
        assert_eq!(
            Route::Authoritative,
            route(&suffix, &domain("foo.kubernetes.default.local."))
        );
        assert_eq!(Route::Forward, route(&suffix, &domain("xdefault.local.")));
        assert_eq!(Route::Forward, route(&suffix, &domain("www.google.com.")));
        assert_eq!(Route::Forward, route(&suffix, &DomainName::root_domain()));
    }

    #[tokio::test]
    async fn answers_present_name() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);
        let query = query("kubernetes.default.local.", QueryType::Record(RecordType::A));

        let response = built(&responder, &query).await;

        assert_eq!(42, response.header.id);
        assert!(response.header.is_response);
        assert!(response.header.is_authoritative);
        assert!(response.header.recursion_desired);
        assert!(response.header.recursion_available);
        assert_eq!(Rcode::NoError, response.header.rcode);
        assert_eq!(query.questions, response.questions);

        let mut expected = a_record("kubernetes.default.local.", Ipv4Addr::new(10, 96, 0, 1));
        expected.ttl = 30;
        assert_eq!(vec![expected], response.answers);
    }

    #[tokio::test]
    async fn wildcard_qtype_gets_the_a_record() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);

        let response = built(&responder, &query("kubernetes.default.local.", QueryType::Wildcard)).await;

        assert_eq!(1, response.answers.len());
    }

    #[tokio::test]
    async fn other_qtype_is_empty_noerror() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);
        let query = query("kubernetes.default.local.", QueryType::Record(RecordType::AAAA));

        let response = built(&responder, &query).await;

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn absent_name_is_nxdomain_and_not_forwarded() {
        let (upstream, sock) = unused_upstream().await;
        let responder = responder(upstream);
        let query = query("foo.kubernetes.default.local.", QueryType::Record(RecordType::A));

        let (reply, metrics) = responder
            .handle_raw_message(&query.to_octets().unwrap())
            .await;
        let Some(Reply::Built(response)) = reply else {
            panic!("expected a built reply");
        };

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert!(response.answers.is_empty());
        assert_eq!(1, metrics.authoritative_misses);
        assert_eq!(0, metrics.upstream_hits + metrics.upstream_misses);

        let mut buf = [0u8; 512];
        assert!(sock.try_recv_from(&mut buf).is_err());
    }

    #[tokio::test]
    async fn empty_non_terminal_is_noerror() {
        let (upstream, sock) = unused_upstream().await;
        let responder = responder(upstream);
        let query = query("default.local.", QueryType::Record(RecordType::A));

        let (reply, metrics) = responder
            .handle_raw_message(&query.to_octets().unwrap())
            .await;
        let Some(Reply::Built(response)) = reply else {
            panic!("expected a built reply");
        };

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        assert!(response.answers.is_empty());
        assert_eq!(1, metrics.authoritative_misses);

        let mut buf = [0u8; 512];
        assert!(sock.try_recv_from(&mut buf).is_err());
    }

    #[tokio::test]
    async fn silent_upstream_is_servfail() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);
        let query = query("www.google.com.", QueryType::Record(RecordType::A));

        let (reply, metrics) = responder
            .handle_raw_message(&query.to_octets().unwrap())
            .await;
        let Some(Reply::Built(response)) = reply else {
            panic!("expected a built reply");
        };

        assert_eq!(42, response.header.id);
        assert_eq!(Rcode::ServerFailure, response.header.rcode);
        assert!(response.answers.is_empty());
        assert_eq!(1, metrics.upstream_misses);
    }

    #[tokio::test]
    async fn too_short_is_dropped() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);

        let (reply, _) = responder.handle_raw_message(&[7]).await;
        assert_eq!(None, reply);
    }

    #[tokio::test]
    async fn undecodable_is_formerr() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);

        let (reply, _) = responder.handle_raw_message(&[0, 7, 0, 0, 0, 1]).await;
        let Some(Reply::Built(response)) = reply else {
            panic!("expected a built reply");
        };

        assert_eq!(7, response.header.id);
        assert_eq!(Rcode::FormatError, response.header.rcode);
        assert!(response.questions.is_empty());
    }

    #[tokio::test]
    async fn response_is_formerr() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);
        let mut query = query("kubernetes.default.local.", QueryType::Record(RecordType::A));
        query.header.is_response = true;

        assert_eq!(Rcode::FormatError, built(&responder, &query).await.header.rcode);
    }

    #[tokio::test]
    async fn no_questions_is_formerr() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);
        let mut query = query("kubernetes.default.local.", QueryType::Record(RecordType::A));
        query.questions.clear();

        let response = built(&responder, &query).await;
        assert_eq!(Rcode::FormatError, response.header.rcode);
        assert!(response.header.recursion_desired);
    }

    #[tokio::test]
    async fn multiple_questions_is_refused() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);
        let mut query = query("kubernetes.default.local.", QueryType::Record(RecordType::A));
        query.questions.push(a_question("www.google.com."));

        let response = built(&responder, &query).await;
        assert_eq!(Rcode::Refused, response.header.rcode);
        assert_eq!(query.questions, response.questions);
    }

    #[tokio::test]
    async fn other_opcode_is_notimp() {
        let (upstream, _sock) = unused_upstream().await;
        let responder = responder(upstream);
        let mut query = query("kubernetes.default.local.", QueryType::Record(RecordType::A));
        query.header.opcode = Opcode::Status;

        let response = built(&responder, &query).await;
        assert_eq!(Rcode::NotImplemented, response.header.rcode);
        assert_eq!(Opcode::Status, response.header.opcode);
    }
}
