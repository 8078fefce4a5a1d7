use std::{collections::HashSet, net::Ipv4Addr, path::Path};

use advmac::MacAddr6;
use compact_str::CompactString;
use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::policy::Policies;

/// One generation of the server configuration.
///
/// A `Config` is never mutated once loaded. Reloading builds a new one and
/// swaps it in through `ArcSwap`, so in-flight requests finish against the
/// generation they started with.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server identifier option value, also the address of the directly attached link.
    pub server_id: Ipv4Addr,
    pub links: Vec<Link>,
    #[serde(default)]
    pub client_classes: Vec<ClientClass>,
    #[serde(default)]
    pub hosts: Vec<Host>,
    /// Global policy scope
    #[serde(default)]
    pub policies: Policies,
    #[serde(skip)]
    pub generation: u64,
}

/// A network attachment point. Requests are mapped to a link by the relay
/// address (giaddr), or by the server's own address for local clients.
#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub name: CompactString,
    pub address: Ipv4Net,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub policies: Policies,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subnet {
    pub net: Ipv4Net,
    pub gateway: Ipv4Addr,
    /// First address of the dynamic pool
    pub range_start: Ipv4Addr,
    /// Last address of the dynamic pool, inclusive
    pub range_end: Ipv4Addr,
    #[serde(default)]
    pub policies: Policies,
}

/// Clients whose vendor class identifier (option 60) starts with
/// `vendor_class_prefix` belong to the class.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientClass {
    pub name: CompactString,
    pub vendor_class_prefix: CompactString,
    #[serde(default)]
    pub policies: Policies,
}

/// Per-client policy overrides, keyed by hardware address.
#[derive(Debug, Clone, Deserialize)]
pub struct Host {
    pub mac: MacAddr6,
    #[serde(default)]
    pub policies: Policies,
}

impl Subnet {
    pub fn in_range(&self, addr: Ipv4Addr) -> bool {
        (self.range_start..=self.range_end).contains(&addr)
    }

    /// Pool addresses in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.range_start)..=u32::from(self.range_end)).map(Ipv4Addr::from)
    }

    /// Addresses that are never leased even inside the pool: the gateway, and
    /// the network and broadcast addresses unless the prefix is /31 or longer.
    pub fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        addr == self.gateway
            || (self.net.prefix_len() < 31
                && (addr == self.net.network() || addr == self.net.broadcast()))
    }
}

impl Link {
    /// The subnet whose network contains `addr`.
    pub fn subnet_for(&self, addr: Ipv4Addr) -> Option<&Subnet> {
        self.subnets.iter().find(|subnet| subnet.net.contains(&addr))
    }

    /// Whether `addr` can be leased: inside one of the link's dynamic pools
    /// and not reserved by its subnet.
    pub fn is_assignable(&self, addr: Ipv4Addr) -> bool {
        self.subnets
            .iter()
            .any(|subnet| subnet.in_range(addr) && !subnet.is_reserved(addr))
    }
}

impl ClientClass {
    pub fn matches(&self, vendor_class: Option<&[u8]>) -> bool {
        vendor_class.is_some_and(|v| v.starts_with(self.vendor_class_prefix.as_bytes()))
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Config = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.links.is_empty() {
            return Err(ConfigError::Invalid("no links configured".into()));
        }

        let mut names = HashSet::new();
        for link in &self.links {
            if !names.insert(&link.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate link name {}",
                    link.name
                )));
            }

            for subnet in &link.subnets {
                if subnet.range_start > subnet.range_end {
                    return Err(ConfigError::Invalid(format!(
                        "link {}: pool {}-{} is reversed",
                        link.name, subnet.range_start, subnet.range_end
                    )));
                }
                if !subnet.net.contains(&subnet.range_start)
                    || !subnet.net.contains(&subnet.range_end)
                {
                    return Err(ConfigError::Invalid(format!(
                        "link {}: pool {}-{} is outside {}",
                        link.name, subnet.range_start, subnet.range_end, subnet.net
                    )));
                }
            }
        }

        Ok(())
    }

    /// The link a request arrived on, given the relay or local address.
    pub fn link_for(&self, addr: Ipv4Addr) -> Option<&Link> {
        self.links.iter().find(|link| link.address.contains(&addr))
    }

    pub fn link_by_name(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|link| link.name == name)
    }

    pub fn host(&self, mac: MacAddr6) -> Option<&Host> {
        self.hosts.iter().find(|host| host.mac == mac)
    }

    /// Client classes matching the vendor class identifier, in configuration order.
    pub fn classes_for(&self, vendor_class: Option<&[u8]>) -> Vec<&ClientClass> {
        self.client_classes
            .iter()
            .filter(|class| class.matches(vendor_class))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Property;

    const CONFIG: &str = r#"{
        "server_id": "192.168.1.1",
        "policies": { "support-rapid-commit": true },
        "links": [
            {
                "name": "lan",
                "address": "192.168.1.0/24",
                "subnets": [
                    {
                        "net": "192.168.1.0/24",
                        "gateway": "192.168.1.1",
                        "range_start": "192.168.1.100",
                        "range_end": "192.168.1.109"
                    }
                ]
            },
            {
                "name": "relay",
                "address": "10.20.0.0/16",
                "subnets": [
                    {
                        "net": "10.20.1.0/24",
                        "gateway": "10.20.1.1",
                        "range_start": "10.20.1.10",
                        "range_end": "10.20.1.20"
                    }
                ]
            }
        ],
        "client_classes": [
            { "name": "pxe", "vendor_class_prefix": "PXEClient" }
        ]
    }"#;

    #[test]
    fn parse_config() {
        let config = Config::from_json(CONFIG).unwrap();
        assert_eq!(config.links.len(), 2);
        assert_eq!(config.links[0].subnets[0].addresses().count(), 10);
        assert!(config.policies.get(Property::SupportRapidCommit).is_some());
        assert_eq!(config.generation, 0);
    }

    #[test]
    fn link_selection() {
        let config = Config::from_json(CONFIG).unwrap();
        assert_eq!(
            config.link_for(Ipv4Addr::new(192, 168, 1, 1)).unwrap().name,
            "lan"
        );
        assert_eq!(
            config.link_for(Ipv4Addr::new(10, 20, 5, 1)).unwrap().name,
            "relay"
        );
        assert!(config.link_for(Ipv4Addr::new(172, 16, 0, 1)).is_none());
        assert!(config.link_by_name("relay").is_some());
    }

    #[test]
    fn pool_membership_and_order() {
        let config = Config::from_json(CONFIG).unwrap();
        let link = config.link_by_name("lan").unwrap();
        assert!(link.is_assignable(Ipv4Addr::new(192, 168, 1, 105)));
        assert!(!link.is_assignable(Ipv4Addr::new(192, 168, 1, 50)));
        assert!(link.subnet_for(Ipv4Addr::new(192, 168, 1, 50)).is_some());

        let first: Vec<_> = link.subnets[0].addresses().take(2).collect();
        assert_eq!(
            first,
            vec![Ipv4Addr::new(192, 168, 1, 100), Ipv4Addr::new(192, 168, 1, 101)]
        );
    }

    #[test]
    fn class_matching() {
        let config = Config::from_json(CONFIG).unwrap();
        assert_eq!(config.classes_for(Some(b"PXEClient:Arch:00007")).len(), 1);
        assert!(config.classes_for(Some(b"MSFT 5.0")).is_empty());
        assert!(config.classes_for(None).is_empty());
    }

    #[test]
    fn reject_pool_outside_subnet() {
        let bad = CONFIG.replace("10.20.1.20", "10.20.2.20");
        assert!(matches!(
            Config::from_json(&bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn reject_duplicate_links() {
        let bad = CONFIG.replace("\"relay\"", "\"lan\"");
        assert!(matches!(
            Config::from_json(&bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn reserved_addresses_are_not_assignable() {
        let wide = CONFIG
            .replace("192.168.1.100", "192.168.1.0")
            .replace("192.168.1.109", "192.168.1.255");
        let config = Config::from_json(&wide).unwrap();
        let link = config.link_by_name("lan").unwrap();

        assert!(!link.is_assignable(Ipv4Addr::new(192, 168, 1, 0)));
        assert!(!link.is_assignable(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!link.is_assignable(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(link.is_assignable(Ipv4Addr::new(192, 168, 1, 2)));
    }

    #[test]
    fn point_to_point_uses_both_addresses() {
        let subnet = Subnet {
            net: "10.9.0.0/31".parse().unwrap(),
            gateway: Ipv4Addr::new(10, 9, 0, 0),
            range_start: Ipv4Addr::new(10, 9, 0, 0),
            range_end: Ipv4Addr::new(10, 9, 0, 1),
            policies: Policies::default(),
        };
        assert!(subnet.is_reserved(Ipv4Addr::new(10, 9, 0, 0)));
        assert!(!subnet.is_reserved(Ipv4Addr::new(10, 9, 0, 1)));
    }
}
