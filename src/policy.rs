//! Layered server policies.
//!
//! A [`Property`] can be set in any of five scopes. Resolution walks them from
//! the most specific to the least specific and the first scope that defines the
//! property wins:
//!
//! 1. inline, the policies of a [`Host`](crate::config::Host) entry for the client
//! 2. the first matching [`ClientClass`] in configuration order
//! 3. the [`Subnet`] the client's address belongs to
//! 4. the arrival [`Link`]
//! 5. the global `policies` block, then the compiled-in default
//!
//! Resolution only borrows one [`Config`] generation, so it never takes a lock
//! and a concurrent reload can't mix values from two generations.

use std::{collections::HashMap, fmt, net::Ipv4Addr};

use advmac::MacAddr6;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::config::{ClientClass, Config, Link, Subnet};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Property {
    /// Allow a DISCOVER carrying option 80 to be committed in one round trip.
    SupportRapidCommit,
    /// Hardware addresses that never receive a lease. Read from the global scope.
    IgnoredMacs,
    /// Lease duration of a committed binding, in seconds.
    LeaseTime,
    /// How long an offered address stays reserved without a REQUEST, in seconds.
    OfferTtl,
    /// How long a declined address stays out of the pool, in seconds.
    DeclineQuarantine,
    DnsServers,
    DomainName,
    /// Only send configuration options that appear in the parameter request list.
    SendRequestedOptionsOnly,
}

impl Property {
    pub fn as_str(&self) -> &'static str {
        match self {
            Property::SupportRapidCommit => "support-rapid-commit",
            Property::IgnoredMacs => "ignored-macs",
            Property::LeaseTime => "lease-time",
            Property::OfferTtl => "offer-ttl",
            Property::DeclineQuarantine => "decline-quarantine",
            Property::DnsServers => "dns-servers",
            Property::DomainName => "domain-name",
            Property::SendRequestedOptionsOnly => "send-requested-options-only",
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Property::SupportRapidCommit | Property::SendRequestedOptionsOnly => PolicyKind::Bool,
            Property::LeaseTime | Property::OfferTtl | Property::DeclineQuarantine => {
                PolicyKind::Seconds
            }
            Property::IgnoredMacs => PolicyKind::Macs,
            Property::DnsServers => PolicyKind::Addrs,
            Property::DomainName => PolicyKind::Text,
        }
    }

    /// Value used when no scope defines the property.
    pub fn default_value(&self) -> &'static PolicyValue {
        static FALSE: PolicyValue = PolicyValue::Bool(false);
        static LEASE_TIME: PolicyValue = PolicyValue::Seconds(3600);
        static OFFER_TTL: PolicyValue = PolicyValue::Seconds(12);
        static DECLINE_QUARANTINE: PolicyValue = PolicyValue::Seconds(3600);
        static NO_ADDRS: PolicyValue = PolicyValue::Addrs(Vec::new());
        static NO_MACS: PolicyValue = PolicyValue::Macs(Vec::new());
        static EMPTY_TEXT: PolicyValue = PolicyValue::Text(CompactString::const_new(""));

        match self {
            Property::SupportRapidCommit | Property::SendRequestedOptionsOnly => &FALSE,
            Property::LeaseTime => &LEASE_TIME,
            Property::OfferTtl => &OFFER_TTL,
            Property::DeclineQuarantine => &DECLINE_QUARANTINE,
            Property::IgnoredMacs => &NO_MACS,
            Property::DnsServers => &NO_ADDRS,
            Property::DomainName => &EMPTY_TEXT,
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Bool,
    Seconds,
    Addrs,
    Macs,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyValue {
    Bool(bool),
    Seconds(u32),
    Addrs(Vec<Ipv4Addr>),
    Macs(Vec<MacAddr6>),
    Text(CompactString),
}

impl PolicyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PolicyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_secs(&self) -> Option<u32> {
        match self {
            PolicyValue::Seconds(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_addrs(&self) -> Option<&[Ipv4Addr]> {
        match self {
            PolicyValue::Addrs(addrs) => Some(addrs),
            _ => None,
        }
    }

    pub fn as_macs(&self) -> Option<&[MacAddr6]> {
        match self {
            PolicyValue::Macs(macs) => Some(macs),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PolicyValue::Text(text) => Some(text),
            _ => None,
        }
    }

    fn kind(&self) -> PolicyKind {
        match self {
            PolicyValue::Bool(_) => PolicyKind::Bool,
            PolicyValue::Seconds(_) => PolicyKind::Seconds,
            PolicyValue::Addrs(_) => PolicyKind::Addrs,
            PolicyValue::Macs(_) => PolicyKind::Macs,
            PolicyValue::Text(_) => PolicyKind::Text,
        }
    }

    /// Decode a configuration value according to the type of `property`.
    fn from_json(property: Property, value: serde_json::Value) -> Result<Self, ConfigError> {
        let parsed = match property.kind() {
            PolicyKind::Bool => PolicyValue::Bool(serde_json::from_value(value)?),
            PolicyKind::Seconds => PolicyValue::Seconds(serde_json::from_value(value)?),
            PolicyKind::Addrs => PolicyValue::Addrs(serde_json::from_value(value)?),
            PolicyKind::Text => PolicyValue::Text(serde_json::from_value(value)?),
            PolicyKind::Macs => match serde_json::from_value(value)? {
                MacList::List(macs) => PolicyValue::Macs(macs),
                // comma separated form: "00:11:22:33:44:55, 66:77:88:99:aa:bb"
                MacList::Csv(csv) => PolicyValue::Macs(
                    csv.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| {
                            s.parse::<MacAddr6>().map_err(|_| {
                                ConfigError::Invalid(format!("{property}: bad MAC address {s:?}"))
                            })
                        })
                        .collect::<Result<_, _>>()?,
                ),
            },
        };
        Ok(parsed)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MacList {
    List(Vec<MacAddr6>),
    Csv(String),
}

/// The set of properties defined in one scope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "HashMap<Property, serde_json::Value>")]
pub struct Policies {
    values: HashMap<Property, PolicyValue>,
}

impl Policies {
    pub fn get(&self, property: Property) -> Option<&PolicyValue> {
        self.values.get(&property)
    }

    /// Set a property, replacing any previous value.
    ///
    /// Values whose type doesn't match the property are rejected.
    pub fn set(&mut self, property: Property, value: PolicyValue) -> Result<(), ConfigError> {
        if value.kind() != property.kind() {
            return Err(ConfigError::Invalid(format!(
                "{property} expects {:?}, got {:?}",
                property.kind(),
                value.kind()
            )));
        }
        self.values.insert(property, value);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl TryFrom<HashMap<Property, serde_json::Value>> for Policies {
    type Error = ConfigError;

    fn try_from(raw: HashMap<Property, serde_json::Value>) -> Result<Self, Self::Error> {
        let values = raw
            .into_iter()
            .map(|(property, value)| Ok((property, PolicyValue::from_json(property, value)?)))
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self { values })
    }
}

/// The request-specific scopes that take part in resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyContext<'a> {
    pub inline: Option<&'a Policies>,
    pub classes: &'a [&'a ClientClass],
    pub subnet: Option<&'a Subnet>,
    pub link: Option<&'a Link>,
}

impl<'a> PolicyContext<'a> {
    pub fn for_link(link: &'a Link) -> Self {
        Self {
            link: Some(link),
            ..Default::default()
        }
    }

    pub fn with_subnet(self, subnet: Option<&'a Subnet>) -> Self {
        Self { subnet, ..self }
    }
}

/// Resolves effective policy values against one configuration snapshot.
#[derive(Clone, Copy)]
pub struct PolicyResolver<'a> {
    global: &'a Policies,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            global: &config.policies,
        }
    }

    /// The effective value of `property` for a request, most specific scope first.
    pub fn effective(&self, property: Property, ctx: &PolicyContext<'a>) -> &'a PolicyValue {
        ctx.inline
            .and_then(|p| p.get(property))
            .or_else(|| {
                ctx.classes
                    .iter()
                    .copied()
                    .find_map(|class| class.policies.get(property))
            })
            .or_else(|| ctx.subnet.and_then(|s| s.policies.get(property)))
            .or_else(|| ctx.link.and_then(|l| l.policies.get(property)))
            .unwrap_or_else(|| self.global(property))
    }

    /// The server-wide value of `property`, ignoring every request scope.
    pub fn global(&self, property: Property) -> &'a PolicyValue {
        self.global
            .get(property)
            .unwrap_or_else(|| property.default_value())
    }

    pub fn effective_bool(&self, property: Property, ctx: &PolicyContext<'a>) -> bool {
        self.effective(property, ctx)
            .as_bool()
            .or_else(|| property.default_value().as_bool())
            .unwrap_or_default()
    }

    pub fn effective_secs(&self, property: Property, ctx: &PolicyContext<'a>) -> u32 {
        self.effective(property, ctx)
            .as_secs()
            .or_else(|| property.default_value().as_secs())
            .unwrap_or_default()
    }

    pub fn effective_addrs(&self, property: Property, ctx: &PolicyContext<'a>) -> &'a [Ipv4Addr] {
        self.effective(property, ctx).as_addrs().unwrap_or_default()
    }

    pub fn effective_text(&self, property: Property, ctx: &PolicyContext<'a>) -> &'a str {
        self.effective(property, ctx).as_text().unwrap_or_default()
    }

    pub fn global_macs(&self, property: Property) -> &'a [MacAddr6] {
        self.global(property).as_macs().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_json(
            r#"{
                "server_id": "10.0.0.1",
                "policies": {
                    "lease-time": 7200,
                    "support-rapid-commit": false,
                    "ignored-macs": "00:11:22:33:44:55, aa:bb:cc:dd:ee:ff"
                },
                "links": [
                    {
                        "name": "lan",
                        "address": "192.168.1.0/24",
                        "policies": { "offer-ttl": 30, "dns-servers": ["192.168.1.53"] },
                        "subnets": [
                            {
                                "net": "192.168.1.0/24",
                                "gateway": "192.168.1.1",
                                "range_start": "192.168.1.100",
                                "range_end": "192.168.1.200",
                                "policies": { "offer-ttl": 45 }
                            }
                        ]
                    }
                ],
                "client_classes": [
                    {
                        "name": "phones",
                        "vendor_class_prefix": "android",
                        "policies": { "lease-time": 600, "support-rapid-commit": true }
                    }
                ],
                "hosts": [
                    { "mac": "00:00:5e:00:53:01", "policies": { "lease-time": 60 } }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn link_value_used_when_global_unset() {
        let config = test_config();
        let resolver = PolicyResolver::new(&config);
        let ctx = PolicyContext::for_link(&config.links[0]);

        assert_eq!(
            resolver.effective_addrs(Property::DnsServers, &ctx),
            &[Ipv4Addr::new(192, 168, 1, 53)]
        );
        assert_eq!(resolver.effective_secs(Property::OfferTtl, &ctx), 30);
    }

    #[test]
    fn client_class_beats_global() {
        let config = test_config();
        let resolver = PolicyResolver::new(&config);
        let classes = [&config.client_classes[0]];
        let ctx = PolicyContext {
            classes: &classes,
            ..PolicyContext::for_link(&config.links[0])
        };

        assert_eq!(resolver.effective_secs(Property::LeaseTime, &ctx), 600);
        assert!(resolver.effective_bool(Property::SupportRapidCommit, &ctx));

        // same link without the class falls back to the global value
        let plain = PolicyContext::for_link(&config.links[0]);
        assert_eq!(resolver.effective_secs(Property::LeaseTime, &plain), 7200);
        assert!(!resolver.effective_bool(Property::SupportRapidCommit, &plain));
    }

    #[test]
    fn subnet_beats_link() {
        let config = test_config();
        let resolver = PolicyResolver::new(&config);
        let link = &config.links[0];
        let ctx = PolicyContext::for_link(link).with_subnet(link.subnets.first());

        assert_eq!(resolver.effective_secs(Property::OfferTtl, &ctx), 45);
    }

    #[test]
    fn inline_beats_everything() {
        let config = test_config();
        let resolver = PolicyResolver::new(&config);
        let classes = [&config.client_classes[0]];
        let link = &config.links[0];
        let ctx = PolicyContext {
            inline: Some(&config.hosts[0].policies),
            classes: &classes,
            subnet: link.subnets.first(),
            link: Some(link),
        };

        assert_eq!(resolver.effective_secs(Property::LeaseTime, &ctx), 60);
    }

    #[test]
    fn unset_property_returns_default() {
        let config = test_config();
        let resolver = PolicyResolver::new(&config);
        let ctx = PolicyContext::for_link(&config.links[0]);

        assert_eq!(resolver.effective_secs(Property::DeclineQuarantine, &ctx), 3600);
        assert_eq!(resolver.effective_text(Property::DomainName, &ctx), "");
        assert!(!resolver.effective_bool(Property::SendRequestedOptionsOnly, &ctx));
    }

    #[test]
    fn global_ignores_request_scopes() {
        let config = test_config();
        let resolver = PolicyResolver::new(&config);

        assert_eq!(resolver.global(Property::LeaseTime), &PolicyValue::Seconds(7200));
        assert_eq!(resolver.global(Property::OfferTtl), &PolicyValue::Seconds(12));
        assert_eq!(
            resolver.global_macs(Property::IgnoredMacs),
            &[
                MacAddr6::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
                MacAddr6::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            ]
        );
    }

    #[test]
    fn wrong_value_type_rejected() {
        let parsed: Result<Policies, _> = serde_json::from_str(r#"{ "lease-time": "forever" }"#);
        assert!(parsed.is_err());

        let mut policies = Policies::default();
        assert!(policies
            .set(Property::SupportRapidCommit, PolicyValue::Seconds(1))
            .is_err());
        assert!(policies.is_empty());
    }

    #[test]
    fn unknown_property_rejected() {
        let parsed: Result<Policies, _> = serde_json::from_str(r#"{ "no-such-thing": 1 }"#);
        assert!(parsed.is_err());
    }
}
