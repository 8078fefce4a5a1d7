use std::net::Ipv4Addr;
use std::time::Duration;

use advmac::MacAddr6;
use tracing::debug;

use crate::config::{Config, Link};
use crate::error::AllocationFailure;
use crate::leasedb::{Binding, BindingSlot, BindingState, LeaseDb, Requested};
use crate::policy::{PolicyContext, PolicyResolver, Property};

/// Decides which binding a client gets, on top of the [`LeaseDb`].
///
/// Every operation runs as one transaction on the client's (link, mac) key,
/// so a retransmitted or reordered message sees the result of the one before
/// it and never creates a second binding.
pub struct Allocator<'a> {
    leases: &'a LeaseDb,
    policy: PolicyResolver<'a>,
}

impl<'a> Allocator<'a> {
    pub fn new(config: &'a Config, leases: &'a LeaseDb) -> Self {
        Self {
            leases,
            policy: PolicyResolver::new(config),
        }
    }

    /// Binding for a DISCOVER.
    ///
    /// An existing binding keeps its address and has its timer restarted. It is
    /// committed when `rapid_commit` is set and never moved back from committed
    /// to offered. Without one, a new binding is created, committed for rapid
    /// commit and offered otherwise. `hint` is the client's requested address.
    pub fn allocate(
        &self,
        link: &'a Link,
        mac: MacAddr6,
        hint: Option<Ipv4Addr>,
        rapid_commit: bool,
        requested_options: Vec<u8>,
        ctx: &PolicyContext<'a>,
    ) -> Result<Binding, AllocationFailure> {
        let state = if rapid_commit {
            BindingState::Committed
        } else {
            BindingState::Offered
        };

        self.leases.transaction(link, mac, |slot| match slot.current() {
            Some(existing) => {
                let state = match existing.state {
                    BindingState::Committed => BindingState::Committed,
                    BindingState::Offered => state,
                };
                let duration = self.duration(state, link, Some(existing.address), ctx);
                debug!(address = %existing.address, ?state, "refreshing existing binding");
                slot.update(state, duration, Some(requested_options))
            }
            None => {
                let requested = hint.map_or(Requested::Any, Requested::Hint);
                self.create(slot, link, requested, state, requested_options, ctx)
            }
        })
    }

    /// Commit the client's binding for `requested` in response to a REQUEST.
    ///
    /// A binding for another address fails with `RequestedAddressUnavailable`,
    /// as does an address outside the link's subnets. A client without a
    /// binding gets `requested` only when `allow_create` is set, otherwise
    /// `NoBinding`.
    pub fn commit(
        &self,
        link: &'a Link,
        mac: MacAddr6,
        requested: Ipv4Addr,
        allow_create: bool,
        requested_options: Vec<u8>,
        ctx: &PolicyContext<'a>,
    ) -> Result<Binding, AllocationFailure> {
        self.leases.transaction(link, mac, |slot| match slot.current() {
            Some(existing) if existing.address == requested => {
                let duration = self.duration(BindingState::Committed, link, Some(requested), ctx);
                slot.update(BindingState::Committed, duration, Some(requested_options))
            }
            Some(existing) => {
                debug!(bound = %existing.address, %requested, "client requested a different address");
                Err(AllocationFailure::RequestedAddressUnavailable(requested))
            }
            None if link.subnet_for(requested).is_none() => {
                Err(AllocationFailure::RequestedAddressUnavailable(requested))
            }
            None if allow_create => self.create(
                slot,
                link,
                Requested::Exact(requested),
                BindingState::Committed,
                requested_options,
                ctx,
            ),
            None => Err(AllocationFailure::NoBinding),
        })
    }

    /// Drop the client's binding if it holds `address`.
    pub fn release(
        &self,
        link: &'a Link,
        mac: MacAddr6,
        address: Ipv4Addr,
    ) -> Result<Option<Binding>, AllocationFailure> {
        self.leases.transaction(link, mac, |slot| match slot.current() {
            Some(binding) if binding.address == address => slot.release(),
            Some(binding) => {
                debug!(bound = %binding.address, %address, "release for an address the client doesn't hold");
                Ok(None)
            }
            None => Ok(None),
        })
    }

    /// Drop the client's binding for `address` and quarantine the address for
    /// the effective `decline-quarantine`.
    pub fn decline(
        &self,
        link: &'a Link,
        mac: MacAddr6,
        address: Ipv4Addr,
        ctx: &PolicyContext<'a>,
    ) -> Result<Option<Binding>, AllocationFailure> {
        let scoped = ctx.with_subnet(link.subnet_for(address));
        let quarantine = self
            .policy
            .effective_secs(Property::DeclineQuarantine, &scoped);
        self.leases
            .decline(link, mac, address, Duration::from_secs(u64::from(quarantine)))
    }

    /// Create a binding whose timer comes from the subnet the address landed in.
    fn create(
        &self,
        slot: &mut BindingSlot<'_>,
        link: &'a Link,
        requested: Requested,
        state: BindingState,
        requested_options: Vec<u8>,
        ctx: &PolicyContext<'a>,
    ) -> Result<Binding, AllocationFailure> {
        slot.create_with(
            requested,
            state,
            |address| self.duration(state, link, Some(address), ctx),
            requested_options,
        )
    }

    fn duration(
        &self,
        state: BindingState,
        link: &'a Link,
        address: Option<Ipv4Addr>,
        ctx: &PolicyContext<'a>,
    ) -> Duration {
        let scoped = ctx.with_subnet(address.and_then(|addr| link.subnet_for(addr)));
        let property = match state {
            BindingState::Offered => Property::OfferTtl,
            BindingState::Committed => Property::LeaseTime,
        };
        Duration::from_secs(u64::from(self.policy.effective_secs(property, &scoped)))
    }
}
