use advmac::MacAddr6;
use dhcproto::v4;
use std::net::Ipv4Addr;
use tracing::{debug, field, info, instrument, Span};

use crate::config::{Config, Link};
use crate::leasedb::{Binding, LeaseDb};
use crate::v4::{
    extensions::ShadowMessageExtV4,
    processor::{MessageKind, RequestContext},
};

/// A DHCPv4 response message produced by the server.
///
/// The binding the reply carries, if any, is included for logging.
pub struct ResponseMessage {
    pub message: v4::Message,
    pub binding: Option<Binding>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NoResponse {
    NoLink,
    NoValidMac,
    NoMessageType,
    Discarded,
    WrongServerId,
    InvalidCiaddr,
    UnexpectedServerId,
    MissingAddress,
    IgnoredMac,
    NoBinding,
    AllocationFailed,
    /// RELEASE and DECLINE are never answered.
    NotExpected,
}

impl NoResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoResponse::NoLink => "NoLink",
            NoResponse::NoValidMac => "NoValidMac",
            NoResponse::NoMessageType => "NoMessageType",
            NoResponse::Discarded => "Discarded",
            NoResponse::WrongServerId => "WrongServerId",
            NoResponse::InvalidCiaddr => "InvalidCiaddr",
            NoResponse::UnexpectedServerId => "UnexpectedServerId",
            NoResponse::MissingAddress => "MissingAddress",
            NoResponse::IgnoredMac => "IgnoredMac",
            NoResponse::NoBinding => "NoBinding",
            NoResponse::AllocationFailed => "AllocationFailed",
            NoResponse::NotExpected => "NotExpected",
        }
    }
}

/// Result of processing an incoming DHCPv4 message.
///
/// `DhcpV4Response` indicates whether the server should send a DHCPv4
/// message back to the client or intentionally remain silent.
pub enum DhcpV4Response {
    Message(ResponseMessage),
    NoResponse(NoResponse),
}

/// The link a message arrived on: the relay's network when relayed, the
/// server's own network otherwise.
pub fn select_link<'a>(config: &'a Config, msg: &v4::Message) -> Option<&'a Link> {
    let giaddr = msg.giaddr();
    if giaddr != Ipv4Addr::UNSPECIFIED {
        config.link_for(giaddr)
    } else {
        config.link_for(config.server_id)
    }
}

/// 4.3 A DHCP server can receive the following messages from a client:
/// * DHCPDISCOVER
/// * DHCPREQUEST
/// * DHCPDECLINE
/// * DHCPRELEASE
/// * DHCPINFORM
///
/// Each supported kind runs through its processor's three phases.
#[instrument(skip(config, leases, msg, link),
fields(mac = field::Empty, xid = %msg.xid(), link = %link.name))]
pub fn handle_message(
    config: &Config,
    leases: &LeaseDb,
    msg: &v4::Message,
    link: &Link,
) -> DhcpV4Response {
    // servers should only respond to BootRequest messages
    let message_type = match msg.opcode() {
        v4::Opcode::BootRequest => match msg.message_type() {
            Some(mt) => mt,
            None => return DhcpV4Response::NoResponse(NoResponse::NoMessageType),
        },
        // Servers don't receive BootReply
        v4::Opcode::BootReply => return DhcpV4Response::NoResponse(NoResponse::Discarded),
        // Skip handling Unknown
        v4::Opcode::Unknown(_) => return DhcpV4Response::NoResponse(NoResponse::Discarded),
    };

    let Some(kind) = MessageKind::from_message_type(message_type) else {
        // INFORM and anything a client shouldn't send
        debug!(?message_type, "unsupported message type");
        return DhcpV4Response::NoResponse(NoResponse::Discarded);
    };

    let mac_addr = match MacAddr6::try_from(msg.chaddr()).ok() {
        Some(ma) => ma,
        None => return DhcpV4Response::NoResponse(NoResponse::NoValidMac),
    };
    Span::current().record("mac", field::display(mac_addr));
    info!("{}", kind.as_str());

    let ctx = RequestContext::new(config, leases, msg, link, mac_addr);
    let processor = kind.processor();

    if let Err(reason) = processor.pre_process(&ctx) {
        return DhcpV4Response::NoResponse(reason);
    }
    let processed = processor.process(&ctx);
    processor.post_process(&ctx, processed)
}
