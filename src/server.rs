use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::dispatcher::QueryDispatcher;
use crate::forwarder::is_transient;

/// Large enough for any query a client sends over UDP, EDNS included
const RECV_BUFFER_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to start worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: io::Error,
    },
}

/// DNS Server that handles incoming DNS requests
pub struct DnsServer {
    socket: UdpSocket,
    dispatcher: Arc<QueryDispatcher>,
    workers: usize,
}

impl DnsServer {
    /// Bind the listening socket; `workers` threads will share it
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: QueryDispatcher,
        workers: usize,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(bind_addr).map_err(|source| ServerError::Bind {
            addr: bind_addr,
            source,
        })?;

        Ok(Self {
            socket,
            dispatcher: Arc::new(dispatcher),
            workers: workers.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until every worker has stopped.
    /// Workers only stop when their socket fails for good.
    pub fn run(self) -> Result<(), ServerError> {
        let handles = self.spawn_workers()?;

        for handle in handles {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        Ok(())
    }

    fn spawn_workers(&self) -> Result<Vec<thread::JoinHandle<()>>, ServerError> {
        let addr = self.local_addr().ok();
        info!(address = ?addr, workers = self.workers, "DNS server listening");

        (0..self.workers)
            .map(|worker| {
                let socket = self
                    .socket
                    .try_clone()
                    .map_err(|source| ServerError::Spawn { worker, source })?;
                let dispatcher = Arc::clone(&self.dispatcher);

                thread::Builder::new()
                    .name(format!("dns-worker-{}", worker))
                    .spawn(move || serve(worker, &socket, &dispatcher))
                    .map_err(|source| ServerError::Spawn { worker, source })
            })
            .collect()
    }
}

/// Listens for incoming requests and sends responses
fn serve(worker: usize, socket: &UdpSocket, dispatcher: &QueryDispatcher) {
    let mut buf = [0u8; RECV_BUFFER_LEN];

    loop {
        match socket.recv_from(&mut buf) {
            Ok((size, source)) => {
                debug!(worker, size, %source, "Received request");

                if let Some(response) = dispatcher.handle_packet(&buf[..size]) {
                    if let Err(e) = socket.send_to(&response, source) {
                        warn!(worker, %source, error = %e, "Failed to send response");
                    }
                }
            }
            Err(e) if is_transient(&e) => {
                debug!(worker, error = %e, "Transient receive error");
            }
            Err(e) => {
                error!(worker, error = %e, "Error receiving data, stopping worker");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_header::ResponseCode;
    use crate::dns_message::DnsMessage;
    use crate::dns_question_and_answer::RecordType;
    use crate::forwarder::{ForwardPolicy, Forwarder};
    use crate::query::Query;
    use crate::test_support::answering_upstream;
    use crate::zones::{Zone, ZoneCollection};
    use std::time::Duration;

    fn start_server() -> SocketAddr {
        let zones = ZoneCollection::from_zones([(
            "example.com",
            Zone::from_json(r#"{"A": {"www": "192.0.2.80"}}"#).unwrap(),
        )]);
        let forwarder = Forwarder::new(ForwardPolicy::sequential(
            vec![answering_upstream([198, 51, 100, 80])],
            Duration::from_millis(500),
        ));
        let dispatcher = QueryDispatcher::new(Arc::new(zones), forwarder);

        let server = DnsServer::new("127.0.0.1:0".parse().unwrap(), dispatcher, 2).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());
        addr
    }

    fn ask(server: SocketAddr, packet: &[u8]) -> DnsMessage {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.send_to(packet, server).unwrap();

        let mut buf = [0u8; 4096];
        let (size, _) = client.recv_from(&mut buf).unwrap();
        DnsMessage::parse(&buf[..size]).unwrap()
    }

    #[test]
    fn test_answers_local_and_forwarded_queries() {
        let server = start_server();

        let local = Query::new(100, "www.example.com", RecordType::A).unwrap();
        let message = ask(server, local.raw());
        assert_eq!(message.header.id, 100);
        assert_eq!(message.answers[0].rdata, vec![192, 0, 2, 80]);

        let remote = Query::new(101, "www.example.net", RecordType::A).unwrap();
        let message = ask(server, remote.raw());
        assert_eq!(message.header.id, 101);
        assert_eq!(message.answers[0].rdata, vec![198, 51, 100, 80]);
    }

    #[test]
    fn test_keeps_serving_after_bad_packets() {
        let server = start_server();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&[0xFF, 0x01], server).unwrap();

        let query = Query::new(102, "www.example.com", RecordType::A).unwrap();
        let truncated = query.raw()[..14].to_vec();
        let message = ask(server, &truncated);
        assert_eq!(message.header.dns_flags().response_code(), ResponseCode::FormErr);

        let message = ask(server, query.raw());
        assert_eq!(message.header.dns_flags().response_code(), ResponseCode::NoError);
    }
}
