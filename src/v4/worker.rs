use arc_swap::ArcSwap;
use dhcproto::{v4, Decodable, Encodable};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::leasedb::LeaseDb;
use crate::v4::extensions::ShadowMessageExtV4;
use crate::v4::handlers::{handle_message, select_link, DhcpV4Response, NoResponse};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// Where a reply goes, RFC 2131 section 4.1.
///
/// Relayed messages go back to the relay. A client that already has an
/// address is unicast on it, except for a NAK. Everything else is broadcast.
pub fn reply_destination(request: &v4::Message, reply: &v4::Message, src: SocketAddr) -> SocketAddr {
    let giaddr = request.giaddr();
    if giaddr != Ipv4Addr::UNSPECIFIED {
        return SocketAddr::V4(SocketAddrV4::new(giaddr, SERVER_PORT));
    }

    let is_nak = reply.message_type() == Some(&v4::MessageType::Nak);
    let ciaddr = request.ciaddr();
    if ciaddr != Ipv4Addr::UNSPECIFIED && !is_nak {
        return SocketAddr::V4(SocketAddrV4::new(ciaddr, src.port()));
    }

    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT))
}

pub fn v4_worker(socket: UdpSocket, leases: Arc<LeaseDb>, config: Arc<ArcSwap<Config>>) {
    let mut read_buf = [0u8; 2048];
    let mut error_count: u32 = 0;
    const MAX_BACKOFF_MS: u64 = 1000;

    loop {
        let (amount, src) = match socket.recv_from(&mut read_buf) {
            Ok((amount, src)) => {
                error_count = 0;
                debug!("Received {amount} bytes from {src:?}");
                trace!("Data: {:x?}", &read_buf[..amount]);
                (amount, src)
            }
            Err(err) => {
                match err.kind() {
                    io::ErrorKind::ConnectionReset => {
                        info!("Sent response to host that responded with ICMP unreachable");
                    }
                    io::ErrorKind::Interrupted => {
                        debug!("recv_from interrupted, retrying");
                    }
                    _ => {
                        error!("Unexpected socket error: {err:?}");
                        // Apply exponential backoff to prevent CPU spin on persistent errors
                        error_count = error_count.saturating_add(1);
                        let backoff_ms = std::cmp::min(
                            10_u64.saturating_mul(2_u64.saturating_pow(error_count)),
                            MAX_BACKOFF_MS,
                        );
                        std::thread::sleep(Duration::from_millis(backoff_ms));
                    }
                }
                continue;
            }
        };

        let msg = match v4::Message::from_bytes(&read_buf[..amount]) {
            Ok(msg) => msg,
            Err(e) => {
                error!("Unable to parse dhcpv4 message {}", e);
                continue;
            }
        };

        // one configuration generation per message
        let config = config.load();
        let response = match select_link(&config, &msg) {
            Some(link) => handle_message(&config, &leases, &msg, link),
            None => {
                debug!(giaddr = %msg.giaddr(), "no link configured for message");
                DhcpV4Response::NoResponse(NoResponse::NoLink)
            }
        };

        match response {
            DhcpV4Response::NoResponse(reason) => {
                debug!(xid = msg.xid(), "Not responding {}", reason.as_str());
            }
            DhcpV4Response::Message(resp) => {
                let write_buf = match resp.message.to_vec() {
                    Ok(buf) => buf,
                    Err(e) => {
                        error!("Failed to encode DHCPv4 response: {e}");
                        continue;
                    }
                };
                let dest = reply_destination(&msg, &resp.message, src);
                match socket.send_to(&write_buf, dest) {
                    Ok(sent) => {
                        debug!(
                            address = ?resp.binding.as_ref().map(|b| b.address),
                            "responded to {dest} with {sent} bytes"
                        );
                    }
                    Err(e) => error!("Problem sending response message to {dest}: {e}"),
                }
            }
        }
    }
}
