use bytes::BytesMut;

use crate::protocol::serialise::Error;
use crate::protocol::types::*;

/// Serialise a locally built response for sending over UDP.  If it
/// does not fit in 512 octets, the record sections are dropped and
/// the TC flag set, so the client knows to retry over another
/// transport; the result is always a well-formed message.
///
/// # Errors
///
/// If the message cannot be serialised.
pub fn serialise_for_udp(message: &Message) -> Result<BytesMut, Error> {
    let octets = message.to_octets()?;
    if octets.len() <= UDP_MAX_LEN {
        return Ok(octets);
    }

    let truncated = Message {
        header: Header {
            is_truncated: true,
            ..message.header
        },
        questions: message.questions.clone(),
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    };
    let octets = truncated.to_octets()?;
    if octets.len() <= UDP_MAX_LEN {
        Ok(octets)
    } else {
        // only a pathological question section gets here
        Message {
            questions: Vec::new(),
            ..truncated
        }
        .to_octets()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    fn small_message_is_unchanged() {
        let mut message = Message::from_question(1, a_question("svc.default.local.")).make_response();
        message
            .answers
            .push(a_record("svc.default.local.", Ipv4Addr::new(10, 0, 0, 1)));

        assert_eq!(
            message.to_octets().unwrap(),
            serialise_for_udp(&message).unwrap()
        );
    }

    #[test]
    fn large_message_is_truncated() {
        let mut message = Message::from_question(1, a_question("svc.default.local.")).make_response();
        for i in 0..100 {
            message
                .additional
                .push(a_record(&format!("host{i}.default.local."), Ipv4Addr::new(10, 0, 0, 1)));
        }

        let octets = serialise_for_udp(&message).unwrap();
        assert!(octets.len() <= UDP_MAX_LEN);

        let decoded = Message::from_octets(&octets).unwrap();
        assert!(decoded.header.is_truncated);
        assert_eq!(message.questions, decoded.questions);
        assert!(decoded.additional.is_empty());
    }
}
