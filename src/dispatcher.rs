use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::dns_header::{DnsHeader, ResponseCode};
use crate::dns_message::{build_response, create_response_header, DnsMessage, WireError};
use crate::forwarder::Forwarder;
use crate::query::{Answer, Query, QueryError};
use crate::resolver;
use crate::zones::ZoneCollection;

/// Routes each query to the local zones first and to the forwarders after
pub struct QueryDispatcher {
    zones: Arc<ZoneCollection>,
    forwarder: Forwarder,
}

impl QueryDispatcher {
    pub fn new(zones: Arc<ZoneCollection>, forwarder: Forwarder) -> Self {
        Self { zones, forwarder }
    }

    pub fn dispatch(&self, query: &Query) -> Answer {
        match resolver::resolve(query, &self.zones) {
            Ok(Some(answer)) => {
                debug!(name = query.name(), rtype = %query.record_type(), "Answered from local zone");
                answer
            }
            Ok(None) => self.forwarder.forward(query),
            Err(e) => {
                warn!(name = query.name(), error = %e, "Failed to build local answer");
                Answer::failure(query, ResponseCode::ServFail)
            }
        }
    }

    /// Turn one request datagram into the response datagram, if any.
    /// Nothing that arrives on the wire can make this panic.
    pub fn handle_packet(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let header = match DnsHeader::from_bytes(packet) {
            Ok(header) => header,
            Err(e) => {
                debug!(len = packet.len(), error = %e, "Dropping undecodable packet");
                return None;
            }
        };

        let query = DnsMessage::parse(packet)
            .map_err(QueryError::from)
            .and_then(|message| Query::from_message(&message, packet));

        let response = match query {
            Ok(query) => self.respond(&query),
            Err(QueryError::NotAQuery) => {
                debug!(id = header.id, "Ignoring DNS response sent to the server");
                return None;
            }
            Err(e) => {
                let rcode = match e {
                    QueryError::UnsupportedOpcode(_) => ResponseCode::NotImp,
                    _ => ResponseCode::FormErr,
                };
                warn!(id = header.id, error = %e, %rcode, "Rejecting request");
                error_response(&header, rcode)
            }
        };

        match response {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(id = header.id, error = %e, "Failed to encode response");
                None
            }
        }
    }

    fn respond(&self, query: &Query) -> Result<Vec<u8>, WireError> {
        let answer = self.dispatch(query);
        debug!(name = answer.query().name(), rcode = %answer.rcode(), "Answering query");

        answer.to_bytes().or_else(|e| {
            warn!(name = query.name(), error = %e, "Failed to encode answer, sending SERVFAIL");
            Answer::failure(query, ResponseCode::ServFail).to_bytes()
        })
    }
}

/// Header-only reply for a request that could not be handled
fn error_response(request: &DnsHeader, rcode: ResponseCode) -> Result<Vec<u8>, WireError> {
    let header = create_response_header(request, rcode, 0, 0);
    build_response(&header, &[], &[])
}
