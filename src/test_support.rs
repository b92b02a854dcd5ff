//! Loopback UDP upstreams for forwarder and server tests

use std::net::{SocketAddr, UdpSocket};
use std::thread;

use crate::dns_header::ResponseCode;
use crate::dns_message::{build_response, create_response_header, DnsMessage};
use crate::dns_question_and_answer::{DnsAnswer, RecordType};

/// Serve every datagram with `reply`; `None` means stay silent
pub fn spawn_upstream<F>(reply: F) -> SocketAddr
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();

    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        while let Ok((size, peer)) = socket.recv_from(&mut buf) {
            if let Some(response) = reply(&buf[..size]) {
                let _ = socket.send_to(&response, peer);
            }
        }
    });

    addr
}

/// An upstream that never answers
pub fn silent_upstream() -> SocketAddr {
    spawn_upstream(|_| None)
}

/// Reply to `request` with one A record for its question
pub fn a_reply(request: &[u8], rcode: ResponseCode, address: [u8; 4]) -> Vec<u8> {
    let message = DnsMessage::parse(request).unwrap();
    let question = &message.questions[0];
    let answers = match rcode {
        ResponseCode::NoError => vec![DnsAnswer::new(&question.name, RecordType::A, 60, address.to_vec())],
        _ => Vec::new(),
    };
    let header = create_response_header(&message.header, rcode, 1, answers.len() as u16);
    build_response(&header, &message.questions[..1], &answers).unwrap()
}

/// An upstream answering every A question with `address`
pub fn answering_upstream(address: [u8; 4]) -> SocketAddr {
    spawn_upstream(move |request| Some(a_reply(request, ResponseCode::NoError, address)))
}
