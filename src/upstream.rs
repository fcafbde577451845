//! Forwarding to the upstream recursive resolver: one query, one
//! fresh socket, one bounded wait.

use bytes::Bytes;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::protocol::types::*;

/// Size of the receive buffer for upstream responses.  Larger than
/// 512 so that a client which advertised a bigger payload gets the
/// whole response.
pub const UPSTREAM_RECV_BUFFER_LEN: usize = 4096;

/// A validated upstream response: the datagram exactly as received,
/// and its parsed form.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UpstreamResponse {
    pub octets: Bytes,
    pub message: Message,
}

/// Send `serialised_request` to `address` and wait for a matching
/// response.  Datagrams which do not match `request` are discarded
/// and the wait goes on.  Nothing is retried: the whole exchange
/// gets `timeout_after`, and when that runs out the socket is
/// dropped.
///
/// # Errors
///
/// If the socket cannot be set up, sending or receiving fails (for
/// example an ICMP port unreachable), the response does not fit the
/// receive buffer, or no matching response arrives in time.
pub async fn forward(
    address: SocketAddr,
    request: &Message,
    serialised_request: &[u8],
    timeout_after: Duration,
) -> Result<UpstreamResponse, ForwardError> {
    match timeout(
        timeout_after,
        forward_notimeout(address, request, serialised_request),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => Err(ForwardError::Timeout),
    }
}

/// Timeout-less version of `forward`.
async fn forward_notimeout(
    address: SocketAddr,
    request: &Message,
    serialised_request: &[u8],
) -> Result<UpstreamResponse, ForwardError> {
    let local: SocketAddr = if address.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let sock = UdpSocket::bind(local).await?;
    sock.connect(address).await?;
    sock.send(serialised_request).await?;

    let mut buf = vec![0u8; UPSTREAM_RECV_BUFFER_LEN];
    loop {
        let size = sock.recv(&mut buf).await?;
        if size == buf.len() {
            return Err(ForwardError::Oversized);
        }

        match Message::from_octets(&buf[..size]) {
            Ok(response) if response_matches_request(request, &response) => {
                return Ok(UpstreamResponse {
                    octets: Bytes::copy_from_slice(&buf[..size]),
                    message: response,
                });
            }
            Ok(response) => {
                tracing::debug!(id = %response.header.id, "discarding non-matching upstream response");
            }
            Err(error) => {
                tracing::debug!(?error, "discarding undecodable upstream response");
            }
        }
    }
}

/// Very basic validation that an upstream response answers a
/// request: the ID, opcode, and questions match, and it is a
/// response.  An error response may leave out the question section
/// (servers often do for REFUSED, FORMERR, and NOTIMP).
///
/// The TC flag is not checked: those responses are relayed to the
/// client as they are.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    if request.header.id != response.header.id
        || !response.header.is_response
        || request.header.opcode != response.header.opcode
    {
        return false;
    }

    request.questions == response.questions
        || (response.header.rcode != Rcode::NoError && response.questions.is_empty())
}

/// Ways forwarding can fail.  None of these reach the client: they
/// all become SERVFAIL.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream I/O error")]
    Io(#[from] io::Error),
    #[error("upstream did not answer in time")]
    Timeout,
    #[error("upstream response exceeds {UPSTREAM_RECV_BUFFER_LEN} octets")]
    Oversized,
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::test_util::*;
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    fn response_matches_request_accepts() {
        let (request, response) = matching_nameserver_response();

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_id() {
        let (request, mut response) = matching_nameserver_response();
        response.header.id += 1;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_qr() {
        let (request, mut response) = matching_nameserver_response();
        response.header.is_response = false;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_opcode() {
        let (request, mut response) = matching_nameserver_response();
        response.header.opcode = Opcode::Status;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_questions() {
        let (request, mut response) = matching_nameserver_response();
        response.questions = vec![a_question("www.example.org.")];

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_does_not_check_tc() {
        let (request, mut response) = matching_nameserver_response();
        response.header.is_truncated = true;

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_does_not_check_rcode() {
        let (request, mut response) = matching_nameserver_response();
        response.header.rcode = Rcode::NameError;
        response.answers.clear();

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_accepts_error_without_questions() {
        let (request, mut response) = matching_nameserver_response();
        response.header.rcode = Rcode::Refused;
        response.questions.clear();
        response.answers.clear();

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_rejects_noerror_without_questions() {
        let (request, mut response) = matching_nameserver_response();
        response.questions.clear();

        assert!(!response_matches_request(&request, &response));
    }

    #[tokio::test]
    async fn forward_relays_error_without_questions() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_address = upstream.local_addr().unwrap();
        let (request, _) = matching_nameserver_response();

        let mut refused = request.make_response();
        refused.header.rcode = Rcode::Refused;
        refused.questions.clear();
        let refused_octets = refused.to_octets().unwrap();

        let sent = refused_octets.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (_, peer) = upstream.recv_from(&mut buf).await.unwrap();
            upstream.send_to(&sent, peer).await.unwrap();
        });

        let forwarded = forward(
            upstream_address,
            &request,
            &request.to_octets().unwrap(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(Rcode::Refused, forwarded.message.header.rcode);
        assert_eq!(refused_octets.as_ref(), forwarded.octets.as_ref());
    }

    #[tokio::test]
    async fn forward_skips_non_matching_then_relays_verbatim() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_address = upstream.local_addr().unwrap();
        let (request, response) = matching_nameserver_response();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (_, peer) = upstream.recv_from(&mut buf).await.unwrap();

            let mut wrong_id = response.clone();
            wrong_id.header.id = wrong_id.header.id.wrapping_add(1);
            upstream
                .send_to(&wrong_id.to_octets().unwrap(), peer)
                .await
                .unwrap();
            upstream.send_to(&[1, 2, 3], peer).await.unwrap();
            upstream
                .send_to(&response.to_octets().unwrap(), peer)
                .await
                .unwrap();
        });

        let forwarded = forward(
            upstream_address,
            &request,
            &request.to_octets().unwrap(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let (_, expected) = matching_nameserver_response();
        assert_eq!(expected, forwarded.message);
        assert_eq!(expected.to_octets().unwrap().as_ref(), forwarded.octets.as_ref());
        assert_eq!(
            vec![a_record("www.example.com.", Ipv4Addr::new(1, 1, 1, 1))],
            forwarded.message.answers
        );
    }

    #[tokio::test]
    async fn forward_times_out_on_silent_upstream() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (request, _) = matching_nameserver_response();

        let result = forward(
            silent.local_addr().unwrap(),
            &request,
            &request.to_octets().unwrap(),
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(ForwardError::Timeout)));
    }
}
