//! A minimal DNS client: enough to query a server over UDP and to
//! wait for a name to start resolving.

use rand::Rng;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, timeout_at, Instant};

use crate::protocol::serialise;
use crate::protocol::types::*;
use crate::upstream::response_matches_request;

/// A query for `name` with a random ID.
pub fn query_message(name: DomainName, qtype: QueryType, recursion_desired: bool) -> Message {
    let mut message = Message::from_question(
        rand::rng().random(),
        Question {
            name,
            qtype,
            qclass: QueryClass::Record(RecordClass::IN),
        },
    );
    message.header.recursion_desired = recursion_desired;
    message
}

/// Send `query` to `server` and wait up to `timeout_after` for the
/// matching response.  Anything else arriving on the socket is
/// ignored.
///
/// # Errors
///
/// If the query cannot be serialised, the socket fails, or no
/// matching response arrives in time.
pub async fn exchange(
    server: SocketAddr,
    query: &Message,
    timeout_after: Duration,
) -> Result<Message, ExchangeError> {
    let serialised = query.to_octets()?;
    match timeout(timeout_after, exchange_notimeout(server, query, &serialised)).await {
        Ok(res) => res,
        Err(_) => Err(ExchangeError::Timeout),
    }
}

async fn exchange_notimeout(
    server: SocketAddr,
    query: &Message,
    serialised: &[u8],
) -> Result<Message, ExchangeError> {
    let local: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let sock = UdpSocket::bind(local).await?;
    sock.connect(server).await?;
    sock.send(serialised).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let size = sock.recv(&mut buf).await?;
        if let Ok(response) = Message::from_octets(&buf[..size]) {
            if response_matches_request(query, &response) {
                return Ok(response);
            }
        }
    }
}

/// Run `attempt` every `interval` until it gives a value or
/// `deadline` has passed.  An attempt still running at the deadline
/// is abandoned.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    deadline: Duration,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + deadline;
    loop {
        match timeout_at(deadline, attempt()).await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => (),
            Err(_) => return None,
        }

        if Instant::now() + interval >= deadline {
            return None;
        }
        sleep(interval).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("could not serialise query")]
    Serialise(#[from] serialise::Error),
    #[error("socket error")]
    Io(#[from] io::Error),
    #[error("no response in time")]
    Timeout,
}
