//! Embedded DHCPv4 server for bridge clients.
//!
//! A minimal RFC 2131 subset: DISCOVER/REQUEST handled, leases kept in
//! memory keyed by client hardware address, addresses handed out
//! monotonically from the bridge address upward. Nothing survives a
//! restart.

use dhcproto::v4::{Decodable, Decoder, DhcpOption, DhcpOptions, Encodable, Encoder, Message, MessageType, Opcode, OptionCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;

mod socket;

pub use socket::{CLIENT_PORT, FilteredSocket, SERVER_PORT, reply_dest};

const LEASE_SECS: u32 = 24 * 60 * 60;
const SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
const DNS_SERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
const MAX_PACKET_SIZE: usize = 1500;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] dhcproto::error::DecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] dhcproto::error::EncodeError),
}

/// Lease state plus reply policy. Pure message-in/message-out so the
/// protocol behavior tests without sockets.
pub struct Handler {
    debug: bool,
    base_ip: Ipv4Addr,
    next: Ipv4Addr,
    leases: HashMap<String, Ipv4Addr>,
}

fn mac_string(chaddr: &[u8]) -> String {
    let hw = if chaddr.len() >= 6 { &chaddr[..6] } else { chaddr };
    hw.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

fn ip_add(ip: Ipv4Addr, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(n))
}

impl Handler {
    /// `base_ip` is the bridge address; it doubles as the server identity
    /// and the router handed to clients. Allocation starts just past it.
    pub fn new(base_ip: Ipv4Addr, debug: bool) -> Self {
        Handler {
            debug,
            base_ip,
            next: ip_add(base_ip, 1),
            leases: HashMap::new(),
        }
    }

    pub fn leases(&self) -> &HashMap<String, Ipv4Addr> {
        &self.leases
    }

    pub fn next(&self) -> Ipv4Addr {
        self.next
    }

    pub fn handle(&mut self, msg: &Message) -> Option<Message> {
        let chaddr = mac_string(msg.chaddr());
        let msg_type = msg.opts().msg_type()?;

        if self.debug {
            tracing::info!(
                %chaddr,
                ?msg_type,
                leases = ?self.leases,
                next = %self.next,
                base = %self.base_ip,
                "dhcp message"
            );
        }

        match msg_type {
            MessageType::Discover => {
                let offer = self.leases.get(&chaddr).copied().unwrap_or(self.next);
                Some(self.reply(msg, MessageType::Offer, Some(offer)))
            }
            MessageType::Request => {
                if let Some(DhcpOption::ServerIdentifier(server)) = msg.opts().get(OptionCode::ServerIdentifier) {
                    if *server != self.base_ip {
                        if self.debug {
                            tracing::info!(server = %server, us = %self.base_ip, "dhcp request for another server");
                        }
                        return None; // not addressed to us
                    }
                }

                let requested = match msg.opts().get(OptionCode::RequestedIpAddress) {
                    Some(DhcpOption::RequestedIpAddress(ip)) => *ip,
                    _ => msg.ciaddr(),
                };

                if !requested.is_unspecified() && requested == self.next {
                    self.next = ip_add(self.next, 1);
                    self.leases.insert(chaddr, requested);
                    Some(self.reply(msg, MessageType::Ack, Some(requested)))
                } else if self.leases.get(&chaddr) == Some(&requested) {
                    Some(self.reply(msg, MessageType::Ack, Some(requested)))
                } else {
                    Some(self.reply(msg, MessageType::Nak, None))
                }
            }
            _ => None,
        }
    }

    fn reply(&self, req: &Message, msg_type: MessageType, yiaddr: Option<Ipv4Addr>) -> Message {
        let mut opts = DhcpOptions::default();
        opts.insert(DhcpOption::MessageType(msg_type));
        opts.insert(DhcpOption::ServerIdentifier(self.base_ip));
        if msg_type != MessageType::Nak {
            opts.insert(DhcpOption::AddressLeaseTime(LEASE_SECS));
            for opt in self.selected_options(req) {
                opts.insert(opt);
            }
        }

        let mut reply = Message::default();
        reply
            .set_opcode(Opcode::BootReply)
            .set_xid(req.xid())
            .set_flags(req.flags())
            .set_giaddr(req.giaddr())
            .set_chaddr(req.chaddr())
            .set_siaddr(self.base_ip)
            .set_yiaddr(yiaddr.unwrap_or(Ipv4Addr::UNSPECIFIED))
            .set_opts(opts);
        reply
    }

    /// The client's parameter request list picks and orders the extra
    /// reply options; without one, everything we know goes out.
    fn selected_options(&self, req: &Message) -> Vec<DhcpOption> {
        let candidates = [
            (OptionCode::SubnetMask, DhcpOption::SubnetMask(SUBNET_MASK)),
            (OptionCode::Router, DhcpOption::Router(vec![self.base_ip])),
            (OptionCode::DomainNameServer, DhcpOption::DomainNameServer(vec![DNS_SERVER])),
            (OptionCode::PerformRouterDiscovery, DhcpOption::PerformRouterDiscovery(false)),
        ];

        match req.opts().get(OptionCode::ParameterRequestList) {
            Some(DhcpOption::ParameterRequestList(requested)) => requested
                .iter()
                .filter_map(|code| {
                    candidates
                        .iter()
                        .find(|(c, _)| c == code)
                        .map(|(_, opt)| opt.clone())
                })
                .collect(),
            _ => candidates.into_iter().map(|(_, opt)| opt).collect(),
        }
    }
}

fn param_request_list(msg: &Message) -> Vec<OptionCode> {
    match msg.opts().get(OptionCode::ParameterRequestList) {
        Some(DhcpOption::ParameterRequestList(requested)) => requested.clone(),
        _ => Vec::new(),
    }
}

// fixed DHCP header plus the magic cookie
const OPTIONS_OFFSET: usize = 240;

/// dhcproto keeps options in a code-ordered map and encodes them that way;
/// clients that send a parameter request list expect their requested
/// ordering on the wire. Rearranges the encoded options region to message
/// type, server identifier, lease time, then the client's list, then the
/// rest. Returns `None` when the options region does not walk cleanly, in
/// which case the encoded form is kept as-is.
fn order_wire_options(wire: &[u8], order: &[OptionCode]) -> Option<Vec<u8>> {
    let options = wire.get(OPTIONS_OFFSET..)?;

    let mut tlvs: Vec<(u8, &[u8])> = Vec::new();
    let mut i = 0;
    loop {
        match *options.get(i)? {
            0 => i += 1,
            255 => break,
            code => {
                let len = *options.get(i + 1)? as usize;
                let tlv = options.get(i..i + 2 + len)?;
                tlvs.push((code, tlv));
                i += 2 + len;
            }
        }
    }

    let mut want: Vec<u8> = vec![
        u8::from(OptionCode::MessageType),
        u8::from(OptionCode::ServerIdentifier),
        u8::from(OptionCode::AddressLeaseTime),
    ];
    want.extend(order.iter().map(|code| u8::from(*code)));

    let mut out = wire[..OPTIONS_OFFSET].to_vec();
    for code in want {
        if let Some(position) = tlvs.iter().position(|(c, _)| *c == code) {
            out.extend_from_slice(tlvs.remove(position).1);
        }
    }
    for (_, tlv) in tlvs {
        out.extend_from_slice(tlv);
    }
    out.push(255);
    Some(out)
}

/// Serve loop glue: blocking bounded reads on the filtered socket until
/// shutdown. Per-packet failures are logged and swallowed; a hard socket
/// error ends the loop for good.
pub struct Server {
    handler: Handler,
    socket: FilteredSocket,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(handler: Handler, socket: FilteredSocket, shutdown: CancellationToken) -> Self {
        Server {
            handler,
            socket,
            shutdown,
        }
    }

    pub fn serve(mut self) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        tracing::info!("dhcp server listening");
        loop {
            if self.shutdown.is_cancelled() {
                tracing::debug!("dhcp server shutting down");
                return;
            }
            let (n, source) = match self.socket.recv(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = ?e, "dhcp server socket error, serve loop exiting");
                    return;
                }
            };
            if let Err(e) = self.handle_packet(&buf[..n], source) {
                tracing::warn!(error = ?e, "dropping dhcp packet");
            }
        }
    }

    fn handle_packet(&mut self, packet: &[u8], source: std::net::SocketAddrV4) -> Result<(), Error> {
        let msg = Message::decode(&mut Decoder::new(packet))?;
        let order = param_request_list(&msg);
        let Some(reply) = self.handler.handle(&msg) else {
            return Ok(());
        };

        let mut out = Vec::new();
        reply.encode(&mut Encoder::new(&mut out))?;
        if !order.is_empty() {
            if let Some(ordered) = order_wire_options(&out, &order) {
                out = ordered;
            }
        }
        self.socket.send_to(&out, reply_dest(source))?;
        Ok(())
    }
}
