use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::metrics::{DNS_REQUESTS_TOTAL, DNS_RESPONSES_TOTAL, DNS_RESPONSE_TIME_SECONDS};
use crate::net_util::serialise_for_udp;
use crate::protocol::types::Header;
use crate::responder::{Reply, Responder};

/// Largest datagram read from a client.  Queries are small, but a
/// client using EDNS may send a little more than 512 octets.
pub const QUERY_RECV_BUFFER_LEN: usize = 4096;

/// Serve queries on `socket` forever.  Each datagram is handled in
/// its own task, and the replies come back through a channel so the
/// socket has a single owner.
pub async fn listen_udp(responder: Arc<Responder>, socket: UdpSocket) {
    let (tx, mut rx) = mpsc::channel::<(Bytes, SocketAddr, Header, Instant)>(32);
    let mut buf = vec![0u8; QUERY_RECV_BUFFER_LEN];

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => match recv {
                Ok((size, peer)) => {
                    let start = Instant::now();
                    let bytes = Bytes::copy_from_slice(&buf[..size]);
                    let reply = tx.clone();
                    let responder = responder.clone();
                    tokio::spawn(async move {
                        DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
                        let (response, metrics) = responder.handle_raw_message(bytes.as_ref()).await;
                        metrics.record();
                        if let Some(response) = response {
                            if let Some(serialised) = serialise_reply(&response) {
                                if let Err(error) = reply.send((serialised, peer, *response.header(), start)).await {
                                    tracing::debug!(?error, "reply channel closed");
                                }
                            }
                        }
                    }.instrument(tracing::error_span!("udp", %peer)));
                }
                Err(error) => tracing::debug!(?error, "udp recv error"),
            },

            Some((serialised, peer, header, start)) = rx.recv() => {
                if let Err(error) = socket.send_to(&serialised, peer).await {
                    tracing::warn!(%peer, ?error, "udp send error");
                } else {
                    record_response(&header, start);
                }
            }
        }
    }
}

fn serialise_reply(reply: &Reply) -> Option<Bytes> {
    match reply {
        Reply::Relayed(response) => Some(response.octets.clone()),
        Reply::Built(message) => match serialise_for_udp(message) {
            Ok(serialised) => Some(serialised.freeze()),
            Err(error) => {
                tracing::warn!(?message, ?error, "could not serialise message");
                None
            }
        },
    }
}

fn record_response(header: &Header, start: Instant) {
    let rcode = header.rcode.to_string();
    DNS_RESPONSES_TOTAL
        .with_label_values(&[
            bool_label(header.is_authoritative),
            bool_label(header.is_truncated),
            bool_label(header.recursion_desired),
            bool_label(header.recursion_available),
            &rcode,
        ])
        .inc();
    DNS_RESPONSE_TIME_SECONDS
        .with_label_values(&["udp"])
        .observe(start.elapsed().as_secs_f64());
}

fn bool_label(flag: bool) -> &'static str {
    if flag {
        "true"
    } else {
        "false"
    }
}
