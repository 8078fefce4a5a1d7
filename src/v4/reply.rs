use dhcproto::v4::{self, DhcpOption, Flags, OptionCode};
use std::net::Ipv4Addr;

use crate::config::Subnet;
use crate::leasedb::Binding;
use crate::v4::{extensions::rapid_commit_option, rebinding_time, renewal_time};

/// Policy values resolved for one reply.
#[derive(Debug, Clone, Copy)]
pub struct ReplyOptions<'a> {
    pub server_id: Ipv4Addr,
    /// Subnet of the bound address, source of the mask and router.
    pub subnet: Option<&'a Subnet>,
    pub lease_time: u32,
    pub dns_servers: &'a [Ipv4Addr],
    pub domain_name: &'a str,
    /// Only include configuration options the client asked for in option 55.
    pub requested_only: bool,
    pub rapid_commit: bool,
}

fn reply_to(msg: &v4::Message, yiaddr: Ipv4Addr) -> v4::Message {
    let unspecified = Ipv4Addr::UNSPECIFIED;
    let mut reply = v4::Message::new_with_id(
        msg.xid(),
        unspecified,
        yiaddr,
        unspecified,
        msg.giaddr(),
        msg.chaddr(),
    );
    reply.set_opcode(v4::Opcode::BootReply);
    reply.set_secs(0);
    reply.set_flags(msg.flags());
    reply
}

/// OFFER or ACK carrying `binding`.
pub fn binding_reply(
    msg: &v4::Message,
    message_type: v4::MessageType,
    binding: &Binding,
    options: &ReplyOptions<'_>,
) -> v4::Message {
    let mut reply = reply_to(msg, binding.address);
    let wanted = |code: OptionCode| {
        !options.requested_only || binding.requested_options.contains(&u8::from(code))
    };

    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(message_type));
    opts.insert(DhcpOption::ServerIdentifier(options.server_id));
    if let Some(subnet) = options.subnet {
        if wanted(OptionCode::SubnetMask) {
            opts.insert(DhcpOption::SubnetMask(subnet.net.netmask()));
        }
        if wanted(OptionCode::Router) {
            opts.insert(DhcpOption::Router(vec![subnet.gateway]));
        }
    }
    if !options.dns_servers.is_empty() && wanted(OptionCode::DomainNameServer) {
        opts.insert(DhcpOption::DomainNameServer(options.dns_servers.to_vec()));
    }
    if !options.domain_name.is_empty() && wanted(OptionCode::DomainName) {
        opts.insert(DhcpOption::DomainName(options.domain_name.to_string()));
    }
    opts.insert(DhcpOption::AddressLeaseTime(options.lease_time));
    opts.insert(DhcpOption::Renewal(renewal_time(options.lease_time)));
    opts.insert(DhcpOption::Rebinding(rebinding_time(options.lease_time)));
    if options.rapid_commit {
        opts.insert(rapid_commit_option());
    }
    opts.insert(DhcpOption::End);

    reply
}

pub fn nak(msg: &v4::Message, server_id: Ipv4Addr) -> v4::Message {
    // RFC 2131 Table 3: yiaddr in DHCPNAK MUST be 0
    let mut reply = reply_to(msg, Ipv4Addr::UNSPECIFIED);
    if msg.giaddr() != Ipv4Addr::UNSPECIFIED {
        // relayed NAK must be broadcast by the relay
        let flags = reply.flags();
        reply.set_flags(Flags::set_broadcast(flags));
    }
    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(v4::MessageType::Nak));
    opts.insert(DhcpOption::ServerIdentifier(server_id));
    opts.insert(DhcpOption::End);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leasedb::{BindingKey, BindingState};
    use crate::policy::Policies;
    use crate::v4::extensions::ShadowMessageExtV4;
    use advmac::MacAddr6;
    use std::time::{Duration, SystemTime};

    fn test_subnet() -> Subnet {
        Subnet {
            net: "192.168.1.0/24".parse().unwrap(),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            policies: Policies::default(),
        }
    }

    fn test_binding(requested_options: Vec<u8>) -> Binding {
        Binding {
            key: BindingKey {
                link: "lan".into(),
                mac: MacAddr6::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            },
            address: Ipv4Addr::new(192, 168, 1, 100),
            state: BindingState::Committed,
            start: SystemTime::now(),
            duration: Duration::from_secs(3600),
            requested_options,
        }
    }

    fn test_request() -> v4::Message {
        let mut msg = v4::Message::new_with_id(
            0xdeadbeef,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(192, 168, 1, 254),
            &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
        );
        msg.set_flags(Flags::default().set_broadcast());
        msg
    }

    #[test]
    fn reply_carries_binding_and_timers() {
        let subnet = test_subnet();
        let dns = [Ipv4Addr::new(8, 8, 8, 8)];
        let options = ReplyOptions {
            server_id: Ipv4Addr::new(192, 168, 1, 1),
            subnet: Some(&subnet),
            lease_time: 3600,
            dns_servers: &dns,
            domain_name: "example.net",
            requested_only: false,
            rapid_commit: false,
        };
        let request = test_request();

        let reply = binding_reply(&request, v4::MessageType::Offer, &test_binding(vec![]), &options);

        assert_eq!(reply.opcode(), v4::Opcode::BootReply);
        assert_eq!(reply.xid(), 0xdeadbeef);
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(reply.giaddr(), Ipv4Addr::new(192, 168, 1, 254));
        assert!(reply.flags().broadcast());
        assert_eq!(reply.message_type(), Some(&v4::MessageType::Offer));
        assert_eq!(reply.server_id(), Some(&Ipv4Addr::new(192, 168, 1, 1)));
        assert!(reply.opts().get(OptionCode::DomainNameServer).is_some());
        assert!(reply.opts().get(OptionCode::DomainName).is_some());
        assert!(!reply.rapid_commit());

        match reply.opts().get(OptionCode::Renewal) {
            Some(DhcpOption::Renewal(t1)) => assert_eq!(*t1, 1800),
            other => panic!("unexpected renewal option {other:?}"),
        }
        match reply.opts().get(OptionCode::Rebinding) {
            Some(DhcpOption::Rebinding(t2)) => assert_eq!(*t2, 3150),
            other => panic!("unexpected rebinding option {other:?}"),
        }
    }

    #[test]
    fn requested_options_only() {
        let subnet = test_subnet();
        let dns = [Ipv4Addr::new(8, 8, 8, 8)];
        let options = ReplyOptions {
            server_id: Ipv4Addr::new(192, 168, 1, 1),
            subnet: Some(&subnet),
            lease_time: 3600,
            dns_servers: &dns,
            domain_name: "example.net",
            requested_only: true,
            rapid_commit: true,
        };
        // subnet mask and router only
        let binding = test_binding(vec![1, 3]);

        let reply = binding_reply(&test_request(), v4::MessageType::Ack, &binding, &options);

        assert!(reply.opts().get(OptionCode::SubnetMask).is_some());
        assert!(reply.opts().get(OptionCode::Router).is_some());
        assert!(reply.opts().get(OptionCode::DomainNameServer).is_none());
        assert!(reply.opts().get(OptionCode::DomainName).is_none());
        assert!(reply.opts().get(OptionCode::AddressLeaseTime).is_some());
        assert!(reply.rapid_commit());
    }

    #[test]
    fn nak_clears_yiaddr() {
        let reply = nak(&test_request(), Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(reply.yiaddr(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(reply.message_type(), Some(&v4::MessageType::Nak));
        assert!(reply.flags().broadcast());
        assert!(reply.opts().get(OptionCode::AddressLeaseTime).is_none());
    }
}
