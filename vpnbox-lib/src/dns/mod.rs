//! Embedded DNS responder on the bridge address.
//!
//! A two-record local zone is answered authoritatively; every other
//! question is forwarded to a DNS-over-HTTPS endpoint and the JSON answer
//! translated back onto the wire. One failed upstream lookup yields an
//! empty answer, never a dead server.

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

mod upstream;

pub use upstream::UpstreamClient;

pub const DNS_PORT: u16 = 53;

const GOOGLE_DNS_NAME: &str = "googleDNS.";
const GOOGLE_DNS_ADDR: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
const LOCAL_TTL: u32 = 60;
const WRITE_DEADLINE: Duration = Duration::from_secs(1);
const MAX_PACKET_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Names answered without consulting the upstream.
struct LocalZone {
    controller_name: Option<Name>,
    google_dns: Name,
    bridge_addr: Ipv4Addr,
}

impl LocalZone {
    fn new(controller_name: &str, bridge_addr: Ipv4Addr) -> Self {
        let controller_name = if controller_name.is_empty() {
            None
        } else {
            Name::from_str(&format!("{controller_name}.")).ok()
        };
        LocalZone {
            controller_name,
            // static name, parse cannot fail
            google_dns: Name::from_str(GOOGLE_DNS_NAME).unwrap_or_default(),
            bridge_addr,
        }
    }

    fn answer(&self, query: &Query) -> Option<Record> {
        if self.controller_name.as_ref() == Some(query.name()) {
            return Some(Record::from_rdata(
                query.name().clone(),
                LOCAL_TTL,
                RData::A(A(self.bridge_addr)),
            ));
        }
        if query.name() == &self.google_dns {
            return Some(Record::from_rdata(query.name().clone(), 0, RData::A(A(GOOGLE_DNS_ADDR))));
        }
        None
    }
}

/// Answer engine, split from the socket so protocol behavior tests
/// without the network.
pub struct Engine {
    zone: LocalZone,
    upstream: UpstreamClient,
}

impl Engine {
    pub fn new(controller_name: &str, bridge_addr: Ipv4Addr) -> Self {
        Engine {
            zone: LocalZone::new(controller_name, bridge_addr),
            upstream: UpstreamClient::new(),
        }
    }

    pub async fn answer(&self, req: &Message) -> Message {
        let mut response = Message::new();
        response
            .set_id(req.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(false)
            .set_recursion_available(true);

        for query in req.queries() {
            response.add_query(query.clone());

            if let Some(record) = self.zone.answer(query) {
                response.set_authoritative(true);
                response.add_answer(record);
                continue;
            }

            let name = query.name().to_utf8();
            match self.upstream.resolve(&name, u16::from(query.query_type())).await {
                Ok(records) => {
                    for record in records {
                        response.add_answer(record);
                    }
                }
                Err(e) => {
                    // the question stays unanswered, the response still goes out
                    tracing::warn!(error = ?e, %name, "upstream lookup failed");
                }
            }
        }

        response
    }
}

pub struct Responder {
    socket: UdpSocket,
    engine: Engine,
    shutdown: CancellationToken,
}

impl Responder {
    pub async fn bind(
        controller_name: &str,
        bridge_addr: Ipv4Addr,
        shutdown: CancellationToken,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(SocketAddr::from((bridge_addr, DNS_PORT))).await?;
        Ok(Responder {
            socket,
            engine: Engine::new(controller_name, bridge_addr),
            shutdown,
        })
    }

    pub async fn serve(self) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        tracing::info!("dns responder listening");
        loop {
            let (n, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::debug!("dns responder shutting down");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::error!(error = ?e, "dns responder socket error, serve loop exiting");
                        return;
                    }
                },
            };

            if let Err(e) = self.handle_packet(&buf[..n], peer).await {
                tracing::warn!(error = ?e, "dropping dns query");
            }
        }
    }

    async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Result<(), Error> {
        let req = Message::from_vec(packet)?;
        let response = self.engine.answer(&req).await;
        let bytes = response.to_vec()?;

        match tokio::time::timeout(WRITE_DEADLINE, self.socket.send_to(&bytes, peer)).await {
            Ok(sent) => {
                sent?;
            }
            Err(_) => tracing::warn!(%peer, "dns reply write deadline elapsed"),
        }
        Ok(())
    }
}
