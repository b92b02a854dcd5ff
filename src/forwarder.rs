use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dns_header::{DnsHeader, ResponseCode};
use crate::query::{Answer, Query};

pub const DNS_PORT: u16 = 53;

/// Per-attempt wait for an upstream reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_REPLY_LEN: usize = 4096;

/// Turn length when sockets of both address families wait for a parallel reply
const FANOUT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid forwarder address: {0:?}")]
    InvalidAddress(String),

    #[error("failed to bind upstream socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to send to {upstream}: {source}")]
    Send {
        upstream: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no reply from {upstream} within {timeout:?}")]
    Timeout {
        upstream: SocketAddr,
        timeout: Duration,
    },

    #[error("failed to receive from {upstream}: {source}")]
    Receive {
        upstream: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("malformed reply from {upstream}: {reason}")]
    MalformedReply {
        upstream: SocketAddr,
        reason: &'static str,
    },
}

/// How the upstreams of a policy are tried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStrategy {
    /// One upstream at a time, in configured order
    #[default]
    Sequential,

    /// Every upstream at once; the first reply wins
    Parallel,
}

/// Parse `ip`, `ip:port` or `[ipv6]:port`; a bare address gets port 53
pub fn parse_upstream(text: &str) -> Result<SocketAddr, ForwardError> {
    let text = text.trim();

    text.parse::<SocketAddr>()
        .or_else(|_| text.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
        .map_err(|_| ForwardError::InvalidAddress(text.to_string()))
}

/// Upstream resolvers, per-attempt timeout and the order they are tried in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPolicy {
    pub upstreams: Vec<SocketAddr>,
    pub timeout: Duration,
    pub strategy: ForwardStrategy,
}

impl ForwardPolicy {
    pub fn sequential(upstreams: Vec<SocketAddr>, timeout: Duration) -> Self {
        ForwardPolicy {
            upstreams,
            timeout,
            strategy: ForwardStrategy::Sequential,
        }
    }
}

/// Reject anything that is not a reply to the request we sent
fn validate_reply(upstream: SocketAddr, request_id: u16, reply: &[u8]) -> Result<(), ForwardError> {
    let header = DnsHeader::from_bytes(reply).map_err(|_| ForwardError::MalformedReply {
        upstream,
        reason: "shorter than a DNS header",
    })?;

    if !header.dns_flags().qr {
        return Err(ForwardError::MalformedReply {
            upstream,
            reason: "not a response",
        });
    }
    if header.id != request_id {
        return Err(ForwardError::MalformedReply {
            upstream,
            reason: "transaction id mismatch",
        });
    }
    Ok(())
}

/// Ephemeral socket of the upstream's address family
fn bind_for(upstream: SocketAddr) -> Result<UdpSocket, ForwardError> {
    let bind_addr = if upstream.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    UdpSocket::bind(bind_addr).map_err(ForwardError::Bind)
}

/// Receive errors after which the socket is still usable, such as an ICMP
/// port-unreachable reported for an earlier send
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// One request sent from a single socket to every upstream of one address family
struct Fanout {
    socket: UdpSocket,
    /// Upstreams whose reply is still awaited
    pending: Vec<SocketAddr>,
}

impl Fanout {
    fn send(ipv4: bool, upstreams: &[SocketAddr], request: &[u8]) -> Option<Self> {
        let targets: Vec<SocketAddr> = upstreams
            .iter()
            .copied()
            .filter(|upstream| upstream.is_ipv4() == ipv4)
            .collect();
        let socket = match bind_for(*targets.first()?) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "Failed to open forwarding socket");
                return None;
            }
        };

        let pending = targets
            .into_iter()
            .filter(|&upstream| match socket.send_to(request, upstream) {
                Ok(_) => true,
                Err(source) => {
                    let e = ForwardError::Send { upstream, source };
                    warn!(error = %e, "Failed to forward query");
                    false
                }
            })
            .collect();
        Some(Fanout { socket, pending })
    }

    /// Wait up to `wait` for one datagram; only a valid reply from a pending upstream counts
    fn receive(&mut self, request_id: u16, wait: Duration) -> Option<(SocketAddr, Bytes)> {
        if let Err(e) = self.socket.set_read_timeout(Some(wait)) {
            warn!(error = %e, "Failed to set forwarding socket timeout");
            self.pending.clear();
            return None;
        }

        let mut buf = vec![0u8; MAX_REPLY_LEN];
        let (size, upstream) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if is_transient(&e) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to receive forwarded reply");
                self.pending.clear();
                return None;
            }
        };

        if !self.pending.contains(&upstream) {
            debug!(%upstream, "Ignoring datagram from unexpected source");
            return None;
        }
        buf.truncate(size);

        match validate_reply(upstream, request_id, &buf) {
            Ok(()) => Some((upstream, Bytes::from(buf))),
            Err(e) => {
                warn!(error = %e, "Failed to forward query");
                self.pending.retain(|&p| p != upstream);
                None
            }
        }
    }
}

/// Send one request to one upstream and wait up to `timeout` for its reply
pub fn exchange(
    upstream: SocketAddr,
    request: &[u8],
    request_id: u16,
    timeout: Duration,
) -> Result<Bytes, ForwardError> {
    let socket = bind_for(upstream)?;
    socket.set_read_timeout(Some(timeout)).map_err(ForwardError::Bind)?;

    socket
        .connect(upstream)
        .and_then(|_| socket.send(request))
        .map_err(|source| ForwardError::Send { upstream, source })?;

    let mut buf = vec![0u8; MAX_REPLY_LEN];
    let size = socket.recv(&mut buf).map_err(|source| match source.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ForwardError::Timeout { upstream, timeout },
        _ => ForwardError::Receive { upstream, source },
    })?;
    buf.truncate(size);

    validate_reply(upstream, request_id, &buf)?;
    Ok(Bytes::from(buf))
}

/// Relays queries nothing local could answer
pub struct Forwarder {
    policy: ForwardPolicy,
}

impl Forwarder {
    pub fn new(policy: ForwardPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ForwardPolicy {
        &self.policy
    }

    /// Always produces an answer: the first upstream reply, or SERVFAIL
    pub fn forward(&self, query: &Query) -> Answer {
        let reply = match self.policy.strategy {
            ForwardStrategy::Sequential => self.forward_sequential(query),
            ForwardStrategy::Parallel => self.forward_parallel(query),
        };

        match reply {
            Some((upstream, reply)) => {
                debug!(%upstream, name = query.name(), "Received forwarded response");
                Answer::Upstream {
                    query: query.clone(),
                    upstream,
                    reply,
                }
            }
            None => {
                warn!(
                    name = query.name(),
                    forwarders = self.policy.upstreams.len(),
                    "All forwarders failed, answering SERVFAIL"
                );
                Answer::failure(query, ResponseCode::ServFail)
            }
        }
    }

    fn forward_sequential(&self, query: &Query) -> Option<(SocketAddr, Bytes)> {
        for &upstream in &self.policy.upstreams {
            match exchange(upstream, query.raw(), query.id, self.policy.timeout) {
                Ok(reply) => return Some((upstream, reply)),
                Err(e) => warn!(error = %e, "Failed to forward query"),
            }
        }
        None
    }

    /// Every upstream at once from the calling thread; sockets close as soon as one reply wins
    fn forward_parallel(&self, query: &Query) -> Option<(SocketAddr, Bytes)> {
        let deadline = Instant::now() + self.policy.timeout;
        let mut fanouts: Vec<Fanout> = [true, false]
            .into_iter()
            .filter_map(|ipv4| Fanout::send(ipv4, &self.policy.upstreams, query.raw()))
            .collect();

        loop {
            fanouts.retain(|fanout| !fanout.pending.is_empty());
            let remaining = deadline.saturating_duration_since(Instant::now());
            if fanouts.is_empty() || remaining.is_zero() {
                break;
            }

            let wait = if fanouts.len() == 1 {
                remaining
            } else {
                remaining.min(FANOUT_POLL)
            };
            for fanout in &mut fanouts {
                if let Some(reply) = fanout.receive(query.id, wait) {
                    return Some(reply);
                }
            }
        }

        let timeout = self.policy.timeout;
        for &upstream in fanouts.iter().flat_map(|fanout| &fanout.pending) {
            let e = ForwardError::Timeout { upstream, timeout };
            warn!(error = %e, "Failed to forward query");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_message::DnsMessage;
    use crate::dns_question_and_answer::RecordType;
    use crate::test_support::{a_reply, answering_upstream, silent_upstream, spawn_upstream};
    use std::time::Instant;

    const TEST_TIMEOUT: Duration = Duration::from_millis(200);

    fn query() -> Query {
        Query::new(0x4242, "www.example.net", RecordType::A).unwrap()
    }

    fn forwarder(upstreams: Vec<SocketAddr>, strategy: ForwardStrategy) -> Forwarder {
        Forwarder::new(ForwardPolicy {
            upstreams,
            timeout: TEST_TIMEOUT,
            strategy,
        })
    }

    #[test]
    fn test_parse_upstream() {
        assert_eq!(parse_upstream("8.8.8.8").unwrap(), "8.8.8.8:53".parse().unwrap());
        assert_eq!(parse_upstream(" 10.0.0.1:5353 ").unwrap(), "10.0.0.1:5353".parse().unwrap());
        assert_eq!(parse_upstream("::1").unwrap(), "[::1]:53".parse().unwrap());
        assert_eq!(parse_upstream("[::1]:8053").unwrap(), "[::1]:8053".parse().unwrap());
        assert!(matches!(
            parse_upstream("dns.google"),
            Err(ForwardError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_falls_back_to_next_forwarder() {
        let dead = silent_upstream();
        let good = answering_upstream([198, 51, 100, 7]);
        let query = query();

        let answer = forwarder(vec![dead, good], ForwardStrategy::Sequential).forward(&query);

        match answer {
            Answer::Upstream { upstream, reply, .. } => {
                assert_eq!(upstream, good);
                let expected = a_reply(query.raw(), ResponseCode::NoError, [198, 51, 100, 7]);
                assert_eq!(reply.to_vec(), expected);
            }
            other => panic!("expected forwarded answer, got {:?}", other),
        }
    }

    #[test]
    fn test_all_forwarders_fail() {
        let query = query();
        let answer = forwarder(vec![silent_upstream(), silent_upstream()], ForwardStrategy::Sequential)
            .forward(&query);

        assert_eq!(answer.rcode(), ResponseCode::ServFail);

        let message = DnsMessage::parse(&answer.to_bytes().unwrap()).unwrap();
        assert_eq!(message.header.id, query.id);
        assert_eq!(message.questions, vec![query.question.clone()]);
        assert!(message.answers.is_empty());
    }

    #[test]
    fn test_no_forwarders_is_servfail() {
        let answer = forwarder(Vec::new(), ForwardStrategy::Sequential).forward(&query());
        assert_eq!(answer.rcode(), ResponseCode::ServFail);
    }

    #[test]
    fn test_upstream_error_response_still_wins() {
        let refusing = spawn_upstream(|request| Some(a_reply(request, ResponseCode::Refused, [0; 4])));
        let good = answering_upstream([198, 51, 100, 8]);

        let answer = forwarder(vec![refusing, good], ForwardStrategy::Sequential).forward(&query());

        assert!(matches!(answer, Answer::Upstream { upstream, .. } if upstream == refusing));
        assert_eq!(answer.rcode(), ResponseCode::Refused);
    }

    #[test]
    fn test_mismatched_reply_is_a_transport_failure() {
        let wrong_id = spawn_upstream(|request| {
            let mut reply = a_reply(request, ResponseCode::NoError, [192, 0, 2, 1]);
            reply[0] ^= 0xFF;
            Some(reply)
        });
        let garbage = spawn_upstream(|_| Some(vec![1, 2, 3]));
        let good = answering_upstream([198, 51, 100, 9]);

        let answer =
            forwarder(vec![wrong_id, garbage, good], ForwardStrategy::Sequential).forward(&query());

        assert!(matches!(answer, Answer::Upstream { upstream, .. } if upstream == good));
    }

    #[test]
    fn test_exchange_timeout() {
        let dead = silent_upstream();
        let query = query();

        let result = exchange(dead, query.raw(), query.id, TEST_TIMEOUT);

        assert!(matches!(result, Err(ForwardError::Timeout { upstream, .. }) if upstream == dead));
    }

    #[test]
    fn test_parallel_first_reply_wins() {
        let dead = silent_upstream();
        let good = answering_upstream([198, 51, 100, 10]);
        let forwarder = Forwarder::new(ForwardPolicy {
            upstreams: vec![dead, good],
            timeout: Duration::from_secs(2),
            strategy: ForwardStrategy::Parallel,
        });

        let started = Instant::now();
        let answer = forwarder.forward(&query());

        assert!(matches!(answer, Answer::Upstream { upstream, .. } if upstream == good));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_parallel_skips_invalid_replies() {
        let wrong_id = spawn_upstream(|request| {
            let mut reply = a_reply(request, ResponseCode::NoError, [192, 0, 2, 1]);
            reply[1] ^= 0xFF;
            Some(reply)
        });
        let garbage = spawn_upstream(|_| Some(vec![0xFF; 3]));
        let good = spawn_upstream(|request| {
            std::thread::sleep(Duration::from_millis(50));
            Some(a_reply(request, ResponseCode::NoError, [198, 51, 100, 11]))
        });

        let answer = forwarder(vec![wrong_id, garbage, good], ForwardStrategy::Parallel).forward(&query());

        assert!(matches!(answer, Answer::Upstream { upstream, .. } if upstream == good));
        assert_eq!(answer.rcode(), ResponseCode::NoError);
    }

    #[test]
    fn test_parallel_waits_no_longer_than_timeout() {
        let started = Instant::now();
        let answer = forwarder(vec![silent_upstream(), silent_upstream()], ForwardStrategy::Parallel)
            .forward(&query());

        assert_eq!(answer.rcode(), ResponseCode::ServFail);
        assert!(started.elapsed() >= TEST_TIMEOUT);
        assert!(started.elapsed() < TEST_TIMEOUT * 5);
    }

    #[test]
    fn test_parallel_all_fail() {
        let answer = forwarder(vec![silent_upstream(), silent_upstream()], ForwardStrategy::Parallel)
            .forward(&query());
        assert_eq!(answer.rcode(), ResponseCode::ServFail);
    }
}
