use dhcproto::v4::{self, DhcpOption, OptionCode};
use std::net::Ipv4Addr;

/// RFC 4039 Rapid Commit. Zero-length, presence is the signal.
pub const RAPID_COMMIT: u8 = 80;

/// Helpers for interacting with dhcproto::v4::Message
pub trait ShadowMessageExtV4 {
    fn message_type(&self) -> Option<&v4::MessageType>;
    fn server_id(&self) -> Option<&Ipv4Addr>;
    fn requested_ip_addr(&self) -> Option<&Ipv4Addr>;
    fn vendor_class(&self) -> Option<&[u8]>;
    fn rapid_commit(&self) -> bool;
    /// Option codes the client listed in option 55, empty when absent.
    fn parameter_request_list(&self) -> Vec<u8>;
}

impl ShadowMessageExtV4 for v4::Message {
    fn message_type(&self) -> Option<&v4::MessageType> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::MessageType(mt) => Some(mt),
            _ => None,
        })
    }

    fn server_id(&self) -> Option<&Ipv4Addr> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::ServerIdentifier(addr) => Some(addr),
            _ => None,
        })
    }

    fn requested_ip_addr(&self) -> Option<&Ipv4Addr> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::RequestedIpAddress(addr) => Some(addr),
            _ => None,
        })
    }

    fn vendor_class(&self) -> Option<&[u8]> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::ClassIdentifier(class) => Some(class.as_slice()),
            _ => None,
        })
    }

    fn rapid_commit(&self) -> bool {
        self.opts().get(OptionCode::from(RAPID_COMMIT)).is_some()
    }

    fn parameter_request_list(&self) -> Vec<u8> {
        self.opts()
            .iter()
            .find_map(|o| match o.1 {
                DhcpOption::ParameterRequestList(codes) => {
                    Some(codes.iter().map(|c| u8::from(*c)).collect())
                }
                _ => None,
            })
            .unwrap_or_default()
    }
}

/// An empty Rapid Commit option, for the ACK of a rapid-commit DISCOVER.
pub fn rapid_commit_option() -> DhcpOption {
    DhcpOption::Unknown(v4::UnknownOption::new(
        OptionCode::from(RAPID_COMMIT),
        Vec::new(),
    ))
}
