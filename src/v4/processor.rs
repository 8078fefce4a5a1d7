//! Per-message-kind processors.
//!
//! Every inbound message goes through three phases:
//!
//! * `pre_process` validates the message and drops it silently on failure,
//! * `process` queries policy and the allocator and returns the bindings it
//!   produced together with the reply type,
//! * `post_process` turns that outcome into a reply, or into silence.

use advmac::MacAddr6;
use dhcproto::v4;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use crate::allocator::Allocator;
use crate::config::{ClientClass, Config, Host, Link};
use crate::error::AllocationFailure;
use crate::leasedb::{Binding, LeaseDb};
use crate::policy::{PolicyContext, PolicyResolver, Property};
use crate::v4::extensions::ShadowMessageExtV4;
use crate::v4::handlers::{DhcpV4Response, NoResponse, ResponseMessage};
use crate::v4::reply::{binding_reply, nak, ReplyOptions};

/// Client message types the server acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Discover,
    Request,
    Release,
    Decline,
}

impl MessageKind {
    pub fn from_message_type(message_type: &v4::MessageType) -> Option<Self> {
        match message_type {
            v4::MessageType::Discover => Some(MessageKind::Discover),
            v4::MessageType::Request => Some(MessageKind::Request),
            v4::MessageType::Release => Some(MessageKind::Release),
            v4::MessageType::Decline => Some(MessageKind::Decline),
            _ => None,
        }
    }

    pub fn processor(&self) -> &'static dyn Processor {
        match self {
            MessageKind::Discover => &DiscoverProcessor,
            MessageKind::Request => &RequestProcessor,
            MessageKind::Release => &ReleaseProcessor,
            MessageKind::Decline => &DeclineProcessor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Discover => "DHCPDiscover",
            MessageKind::Request => "DHCPRequest",
            MessageKind::Release => "DHCPRelease",
            MessageKind::Decline => "DHCPDecline",
        }
    }
}

/// Everything a processor needs for one inbound message.
pub struct RequestContext<'a> {
    pub config: &'a Config,
    pub leases: &'a LeaseDb,
    pub msg: &'a v4::Message,
    pub link: &'a Link,
    pub mac: MacAddr6,
    pub classes: Vec<&'a ClientClass>,
    pub host: Option<&'a Host>,
}

impl<'a> RequestContext<'a> {
    pub fn new(
        config: &'a Config,
        leases: &'a LeaseDb,
        msg: &'a v4::Message,
        link: &'a Link,
        mac: MacAddr6,
    ) -> Self {
        Self {
            config,
            leases,
            msg,
            link,
            mac,
            classes: config.classes_for(msg.vendor_class()),
            host: config.host(mac),
        }
    }

    /// Policy scopes of this request, without a subnet.
    pub fn policy(&self) -> PolicyContext<'_> {
        PolicyContext {
            inline: self.host.map(|host| &host.policies),
            classes: &self.classes,
            subnet: None,
            link: Some(self.link),
        }
    }

    pub fn allocator(&self) -> Allocator<'_> {
        Allocator::new(self.config, self.leases)
    }

    fn is_ignored(&self) -> bool {
        PolicyResolver::new(self.config)
            .global_macs(Property::IgnoredMacs)
            .contains(&self.mac)
    }
}

/// What `process` decided.
#[derive(Debug)]
pub enum Processed {
    Reply {
        message_type: v4::MessageType,
        bindings: Vec<Binding>,
        /// Acknowledging a rapid commit DISCOVER.
        rapid_commit: bool,
    },
    NoReply(NoResponse),
}

pub trait Processor: Sync {
    /// Validate the message. An `Err` drops it without a reply.
    fn pre_process(&self, ctx: &RequestContext<'_>) -> Result<(), NoResponse>;

    fn process(&self, ctx: &RequestContext<'_>) -> Processed;

    /// Build the reply. A reply that should carry a binding but has none is
    /// not sent.
    fn post_process(&self, ctx: &RequestContext<'_>, processed: Processed) -> DhcpV4Response {
        let (message_type, bindings, rapid_commit) = match processed {
            Processed::NoReply(reason) => return DhcpV4Response::NoResponse(reason),
            Processed::Reply {
                message_type: v4::MessageType::Nak,
                ..
            } => {
                return DhcpV4Response::Message(ResponseMessage {
                    message: nak(ctx.msg, ctx.config.server_id),
                    binding: None,
                })
            }
            Processed::Reply {
                message_type,
                bindings,
                rapid_commit,
            } => (message_type, bindings, rapid_commit),
        };

        let Some(binding) = bindings.into_iter().next() else {
            debug!(?message_type, "no binding to send, suppressing reply");
            return DhcpV4Response::NoResponse(NoResponse::NoBinding);
        };

        let resolver = PolicyResolver::new(ctx.config);
        let subnet = ctx.link.subnet_for(binding.address);
        let scoped = ctx.policy().with_subnet(subnet);
        let options = ReplyOptions {
            server_id: ctx.config.server_id,
            subnet,
            lease_time: resolver.effective_secs(Property::LeaseTime, &scoped),
            dns_servers: resolver.effective_addrs(Property::DnsServers, &scoped),
            domain_name: resolver.effective_text(Property::DomainName, &scoped),
            requested_only: resolver.effective_bool(Property::SendRequestedOptionsOnly, &scoped),
            rapid_commit,
        };

        DhcpV4Response::Message(ResponseMessage {
            message: binding_reply(ctx.msg, message_type, &binding, &options),
            binding: Some(binding),
        })
    }
}

/// Client is discovering available DHCP servers, reply with DHCPOFFER, or
/// with DHCPACK when both sides agree on rapid commit.
///
/// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.1>
/// <https://datatracker.ietf.org/doc/html/rfc4039>
pub struct DiscoverProcessor;

impl Processor for DiscoverProcessor {
    fn pre_process(&self, ctx: &RequestContext<'_>) -> Result<(), NoResponse> {
        if ctx.msg.ciaddr() != Ipv4Addr::UNSPECIFIED {
            info!(ciaddr = %ctx.msg.ciaddr(), "DHCPDiscover with ciaddr set, dropping");
            return Err(NoResponse::InvalidCiaddr);
        }
        if let Some(server_id) = ctx.msg.server_id() {
            info!(%server_id, "DHCPDiscover carries a server identifier, dropping");
            return Err(NoResponse::UnexpectedServerId);
        }
        if ctx.is_ignored() {
            info!("hardware address is on the ignored list");
        }
        Ok(())
    }

    fn process(&self, ctx: &RequestContext<'_>) -> Processed {
        let policy = ctx.policy();
        let rapid_commit = ctx.msg.rapid_commit()
            && PolicyResolver::new(ctx.config).effective_bool(Property::SupportRapidCommit, &policy);
        let message_type = if rapid_commit {
            v4::MessageType::Ack
        } else {
            v4::MessageType::Offer
        };

        let mut bindings = Vec::new();
        if ctx.is_ignored() {
            debug!("not allocating for ignored hardware address");
        } else {
            match ctx.allocator().allocate(
                ctx.link,
                ctx.mac,
                ctx.msg.requested_ip_addr().copied(),
                rapid_commit,
                ctx.msg.parameter_request_list(),
                &policy,
            ) {
                Ok(binding) => {
                    info!(address = %binding.address, state = ?binding.state, rapid_commit, "allocated");
                    bindings.push(binding);
                }
                Err(e) => warn!(reason = e.as_str(), "allocation failed: {e}"),
            }
        }

        Processed::Reply {
            message_type,
            bindings,
            rapid_commit,
        }
    }
}

/// The four DHCPREQUEST variants, RFC 2131 section 4.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestVariant {
    /// Answering an OFFER. server id set, ciaddr zero, requested ip set.
    Selecting {
        server_id: Ipv4Addr,
        requested: Ipv4Addr,
    },
    /// Verifying a remembered address. No server id, ciaddr zero, requested ip set.
    InitReboot { requested: Ipv4Addr },
    /// Extending a lease by unicast. ciaddr set, no giaddr.
    Renewing { ciaddr: Ipv4Addr },
    /// Extending a lease by broadcast through a relay.
    Rebinding { ciaddr: Ipv4Addr },
}

impl RequestVariant {
    pub fn classify(msg: &v4::Message) -> Option<Self> {
        match (msg.server_id(), msg.ciaddr(), msg.requested_ip_addr()) {
            (Some(server_id), Ipv4Addr::UNSPECIFIED, Some(requested)) => {
                Some(RequestVariant::Selecting {
                    server_id: *server_id,
                    requested: *requested,
                })
            }
            (None, Ipv4Addr::UNSPECIFIED, Some(requested)) => Some(RequestVariant::InitReboot {
                requested: *requested,
            }),
            (None, ciaddr, None) if ciaddr != Ipv4Addr::UNSPECIFIED => {
                if msg.giaddr() == Ipv4Addr::UNSPECIFIED {
                    Some(RequestVariant::Renewing { ciaddr })
                } else {
                    Some(RequestVariant::Rebinding { ciaddr })
                }
            }
            _ => None,
        }
    }
}

/// DHCPREQUEST - Client message to servers either (a) requesting offered parameters from one server
/// and implicitly declining offers from all others, (b) confirming correctness of previously allocated
/// address after, e.g., system reboot, or (c) extending the lease on a particular network address
///
/// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.2>
pub struct RequestProcessor;

impl Processor for RequestProcessor {
    fn pre_process(&self, ctx: &RequestContext<'_>) -> Result<(), NoResponse> {
        match RequestVariant::classify(ctx.msg) {
            Some(RequestVariant::Selecting { server_id, .. })
                if server_id != ctx.config.server_id =>
            {
                // client picked another server's offer
                info!(%server_id, "SELECTING server id did not match");
                Err(NoResponse::WrongServerId)
            }
            Some(variant) => {
                debug!(?variant, "request variant");
                Ok(())
            }
            None => {
                info!("Unrecognized DHCPREQUEST variant");
                Err(NoResponse::Discarded)
            }
        }
    }

    fn process(&self, ctx: &RequestContext<'_>) -> Processed {
        if ctx.is_ignored() {
            debug!("not committing for ignored hardware address");
            return Processed::NoReply(NoResponse::IgnoredMac);
        }

        let (address, allow_create) = match RequestVariant::classify(ctx.msg) {
            Some(RequestVariant::Selecting { requested, .. }) => (requested, true),
            Some(RequestVariant::InitReboot { requested }) => (requested, false),
            Some(RequestVariant::Renewing { ciaddr }) | Some(RequestVariant::Rebinding { ciaddr }) => {
                (ciaddr, false)
            }
            None => return Processed::NoReply(NoResponse::Discarded),
        };

        let policy = ctx.policy();
        match ctx.allocator().commit(
            ctx.link,
            ctx.mac,
            address,
            allow_create,
            ctx.msg.parameter_request_list(),
            &policy,
        ) {
            Ok(binding) => {
                info!(address = %binding.address, "committed");
                Processed::Reply {
                    message_type: v4::MessageType::Ack,
                    bindings: vec![binding],
                    rapid_commit: false,
                }
            }
            Err(
                e @ (AllocationFailure::RequestedAddressUnavailable(_)
                | AllocationFailure::RequestedAddressConflict { .. }),
            ) => {
                warn!(requested = %address, reason = e.as_str(), "sending DHCPNAK: {e}");
                Processed::Reply {
                    message_type: v4::MessageType::Nak,
                    bindings: Vec::new(),
                    rapid_commit: false,
                }
            }
            Err(AllocationFailure::NoBinding) => {
                // RFC 2131 4.3.2: no record of the client, remain silent
                info!(requested = %address, "no binding for client");
                Processed::NoReply(NoResponse::NoBinding)
            }
            Err(e) => {
                warn!(reason = e.as_str(), "commit failed: {e}");
                Processed::NoReply(NoResponse::AllocationFailed)
            }
        }
    }
}

/// Client relinquishes its address. Never answered.
///
/// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.4>
pub struct ReleaseProcessor;

impl Processor for ReleaseProcessor {
    fn pre_process(&self, ctx: &RequestContext<'_>) -> Result<(), NoResponse> {
        if ctx.msg.ciaddr() == Ipv4Addr::UNSPECIFIED {
            info!("DHCPRelease without ciaddr");
            return Err(NoResponse::MissingAddress);
        }
        check_server_id(ctx)
    }

    fn process(&self, ctx: &RequestContext<'_>) -> Processed {
        let address = ctx.msg.ciaddr();
        match ctx.allocator().release(ctx.link, ctx.mac, address) {
            Ok(Some(_)) => info!(%address, "binding released"),
            Ok(None) => debug!(%address, "nothing to release"),
            Err(e) => warn!(%address, reason = e.as_str(), "release failed: {e}"),
        }
        Processed::NoReply(NoResponse::NotExpected)
    }
}

/// Client found its address already in use. Never answered.
///
/// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.3>
pub struct DeclineProcessor;

impl Processor for DeclineProcessor {
    fn pre_process(&self, ctx: &RequestContext<'_>) -> Result<(), NoResponse> {
        if ctx.msg.requested_ip_addr().is_none() {
            info!("DHCPDecline without requested ip address");
            return Err(NoResponse::MissingAddress);
        }
        check_server_id(ctx)
    }

    fn process(&self, ctx: &RequestContext<'_>) -> Processed {
        let Some(&address) = ctx.msg.requested_ip_addr() else {
            return Processed::NoReply(NoResponse::MissingAddress);
        };
        let policy = ctx.policy();
        match ctx.allocator().decline(ctx.link, ctx.mac, address, &policy) {
            Ok(Some(_)) => info!(%address, "binding declined"),
            Ok(None) => debug!(%address, "decline for an address the client doesn't hold"),
            Err(e) => warn!(%address, reason = e.as_str(), "decline failed: {e}"),
        }
        Processed::NoReply(NoResponse::NotExpected)
    }
}

/// RELEASE and DECLINE name the server they are meant for.
fn check_server_id(ctx: &RequestContext<'_>) -> Result<(), NoResponse> {
    match ctx.msg.server_id() {
        Some(server_id) if *server_id != ctx.config.server_id => {
            debug!(%server_id, "message for another server");
            Err(NoResponse::WrongServerId)
        }
        _ => Ok(()),
    }
}
