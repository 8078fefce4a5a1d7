use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use advmac::MacAddr6;
use compact_str::CompactString;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Link;
use crate::error::AllocationFailure;
use crate::repository::{LeaseRepository, MemoryRepository};

/// Identity of a binding: one client on one link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingKey {
    pub link: CompactString,
    pub mac: MacAddr6,
}

impl BindingKey {
    pub fn new(link: &Link, mac: MacAddr6) -> Self {
        Self {
            link: link.name.clone(),
            mac,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    /// Provisional, held for the offer TTL waiting for a REQUEST.
    Offered,
    /// Leased for the full lease time.
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub key: BindingKey,
    pub address: Ipv4Addr,
    pub state: BindingState,
    pub start: SystemTime,
    pub duration: Duration,
    /// Parameter request list of the last message that touched the binding.
    #[serde(default)]
    pub requested_options: Vec<u8>,
}

impl Binding {
    pub fn expires_at(&self) -> SystemTime {
        self.start + self.duration
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at()
    }
}

/// Address selection for a new binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requested {
    /// Next free pool address.
    Any,
    /// Use this address if possible, otherwise fall back to the pool.
    Hint(Ipv4Addr),
    /// This address or nothing.
    Exact(Ipv4Addr),
}

/// Ownership of one address, kept in step with the owning binding's expiry.
#[derive(Debug, Clone, Copy)]
struct Claim {
    mac: MacAddr6,
    expires: SystemTime,
}

type AddressKey = (CompactString, Ipv4Addr);

/// The authoritative binding store.
///
/// Bindings live in a sharded map keyed by (link, mac). Every mutation of a key
/// runs while holding that key's shard lock, so two messages from the same
/// client are applied one after the other. A second map tracks which client
/// owns each address; claiming an address is a single map entry operation, so
/// two clients racing for the same address can't both win.
///
/// Lock order is always bindings, then claims, then quarantine.
pub struct LeaseDb {
    bindings: DashMap<BindingKey, Option<Binding>>,
    claims: DashMap<AddressKey, Claim>,
    quarantine: DashMap<AddressKey, SystemTime>,
    repository: Arc<dyn LeaseRepository>,
}

/// Exclusive access to one (link, mac) key for the duration of a transaction.
pub struct BindingSlot<'a> {
    db: &'a LeaseDb,
    link: &'a Link,
    entry: RefMut<'a, BindingKey, Option<Binding>>,
    now: SystemTime,
}

impl<'a> BindingSlot<'a> {
    /// The binding for this key, unless it has expired.
    pub fn current(&self) -> Option<&Binding> {
        self.entry
            .value()
            .as_ref()
            .filter(|binding| !binding.is_expired(self.now))
    }

    /// Reserve an address and create a new binding in `state`.
    ///
    /// A live binding is returned unchanged. An expired one still sitting in
    /// the slot is dropped first, and with `Requested::Any` its address is
    /// preferred.
    pub fn create(
        &mut self,
        requested: Requested,
        state: BindingState,
        duration: Duration,
        requested_options: Vec<u8>,
    ) -> Result<Binding, AllocationFailure> {
        self.create_with(requested, state, |_| duration, requested_options)
    }

    /// Like [`create`](Self::create), with the duration picked for the
    /// address that was actually claimed.
    pub fn create_with<D>(
        &mut self,
        requested: Requested,
        state: BindingState,
        duration_for: D,
        requested_options: Vec<u8>,
    ) -> Result<Binding, AllocationFailure>
    where
        D: Fn(Ipv4Addr) -> Duration,
    {
        if let Some(live) = self.current() {
            debug!(mac = %live.key.mac, address = %live.address, "binding still live, reusing it");
            return Ok(live.clone());
        }

        let key = self.entry.key().clone();
        let mut requested = requested;

        if let Some(stale) = self.entry.value_mut().take() {
            debug!(mac = %key.mac, address = %stale.address, "dropping expired binding");
            self.db.unclaim(&key.link, stale.address, key.mac);
            if requested == Requested::Any {
                requested = Requested::Hint(stale.address);
            }
        }

        let (address, duration) =
            self.db
                .claim_address(self.link, key.mac, requested, &duration_for, self.now)?;

        let binding = Binding {
            key,
            address,
            state,
            start: self.now,
            duration,
            requested_options,
        };

        if let Err(e) = self.db.repository.insert(&binding) {
            self.db.unclaim(&binding.key.link, address, binding.key.mac);
            return Err(e.into());
        }

        info!(mac = %binding.key.mac, link = %binding.key.link, %address, state = ?state,
            "created binding");
        *self.entry.value_mut() = Some(binding.clone());
        Ok(binding)
    }

    /// Move the current binding to `state` and restart its lease timer.
    ///
    /// `requested_options` replaces the echo set when given.
    pub fn update(
        &mut self,
        state: BindingState,
        duration: Duration,
        requested_options: Option<Vec<u8>>,
    ) -> Result<Binding, AllocationFailure> {
        let mut updated = self.current().cloned().ok_or(AllocationFailure::NoBinding)?;
        updated.state = state;
        updated.start = self.now;
        updated.duration = duration;
        if let Some(options) = requested_options {
            updated.requested_options = options;
        }

        self.db.repository.update(&updated)?;
        self.db.claims.insert(
            (updated.key.link.clone(), updated.address),
            Claim {
                mac: updated.key.mac,
                expires: updated.expires_at(),
            },
        );

        debug!(mac = %updated.key.mac, address = %updated.address, state = ?state,
            "updated binding");
        *self.entry.value_mut() = Some(updated.clone());
        Ok(updated)
    }

    /// Remove the binding and return its address to the pool immediately.
    pub fn release(&mut self) -> Result<Option<Binding>, AllocationFailure> {
        let Some(binding) = self.entry.value_mut().take() else {
            return Ok(None);
        };

        if let Err(e) = self.db.repository.delete(&binding.key) {
            *self.entry.value_mut() = Some(binding);
            return Err(e.into());
        }

        self.db
            .unclaim(&binding.key.link, binding.address, binding.key.mac);
        info!(mac = %binding.key.mac, address = %binding.address, "released binding");
        Ok(Some(binding))
    }

    /// Remove the binding holding `address` and keep the address out of the
    /// pool until `quarantine` has passed.
    pub fn decline(
        &mut self,
        address: Ipv4Addr,
        quarantine: Duration,
    ) -> Result<Option<Binding>, AllocationFailure> {
        match self.current() {
            Some(binding) if binding.address == address => {}
            _ => return Ok(None),
        }

        let released = self.release()?;
        let until = self.now + quarantine;
        self.db
            .quarantine
            .insert((self.link.name.clone(), address), until);
        warn!(%address, link = %self.link.name, quarantine_secs = quarantine.as_secs(),
            "address declined, quarantined");
        Ok(released)
    }
}

impl LeaseDb {
    pub fn new(repository: Arc<dyn LeaseRepository>) -> Self {
        Self {
            bindings: DashMap::new(),
            claims: DashMap::new(),
            quarantine: DashMap::new(),
            repository,
        }
    }

    /// A store without durable backing.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRepository::new()))
    }

    /// Load every unexpired binding from the repository. Returns how many
    /// bindings were restored.
    pub fn restore(&self) -> Result<usize, AllocationFailure> {
        let now = SystemTime::now();
        let mut restored = 0;

        match self.repository.purge_expired(now) {
            Ok(0) => {}
            Ok(purged) => info!(purged, "dropped expired stored bindings"),
            Err(e) => warn!("failed to drop expired stored bindings: {e}"),
        }

        for binding in self.repository.load_all()? {
            if binding.is_expired(now) {
                continue;
            }

            match self.claims.entry((binding.key.link.clone(), binding.address)) {
                Entry::Occupied(o) => {
                    warn!(address = %binding.address, owner = %o.get().mac, mac = %binding.key.mac,
                        "stored binding conflicts with an earlier one, skipping");
                    continue;
                }
                Entry::Vacant(v) => {
                    v.insert(Claim {
                        mac: binding.key.mac,
                        expires: binding.expires_at(),
                    });
                }
            }

            self.bindings.insert(binding.key.clone(), Some(binding));
            restored += 1;
        }

        info!(restored, "restored bindings from repository");
        Ok(restored)
    }

    /// Run `f` with exclusive access to the (link, mac) key.
    ///
    /// Operations on other keys are not blocked unless they share a shard.
    pub fn transaction<R, F>(&self, link: &Link, mac: MacAddr6, f: F) -> Result<R, AllocationFailure>
    where
        F: FnOnce(&mut BindingSlot<'_>) -> Result<R, AllocationFailure>,
    {
        let now = SystemTime::now();
        let mut entry = self
            .bindings
            .entry(BindingKey::new(link, mac))
            .or_insert(None);
        self.hydrate(link, &mut entry, now)?;

        let mut slot = BindingSlot {
            db: self,
            link,
            entry,
            now,
        };
        f(&mut slot)
    }

    pub fn find_current(
        &self,
        link: &Link,
        mac: MacAddr6,
    ) -> Result<Option<Binding>, AllocationFailure> {
        self.transaction(link, mac, |slot| Ok(slot.current().cloned()))
    }

    pub fn create(
        &self,
        link: &Link,
        mac: MacAddr6,
        requested: Requested,
        state: BindingState,
        duration: Duration,
        requested_options: Vec<u8>,
    ) -> Result<Binding, AllocationFailure> {
        self.transaction(link, mac, |slot| {
            slot.create(requested, state, duration, requested_options)
        })
    }

    pub fn update(
        &self,
        link: &Link,
        mac: MacAddr6,
        state: BindingState,
        duration: Duration,
    ) -> Result<Binding, AllocationFailure> {
        self.transaction(link, mac, |slot| slot.update(state, duration, None))
    }

    pub fn release(&self, link: &Link, mac: MacAddr6) -> Result<Option<Binding>, AllocationFailure> {
        self.transaction(link, mac, |slot| slot.release())
    }

    pub fn decline(
        &self,
        link: &Link,
        mac: MacAddr6,
        address: Ipv4Addr,
        quarantine: Duration,
    ) -> Result<Option<Binding>, AllocationFailure> {
        self.transaction(link, mac, |slot| slot.decline(address, quarantine))
    }

    /// Snapshot of every unexpired binding.
    pub fn active_bindings(&self) -> Vec<Binding> {
        let now = SystemTime::now();
        self.bindings
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .as_ref()
                    .filter(|b| !b.is_expired(now))
                    .cloned()
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        let now = SystemTime::now();
        self.bindings
            .iter()
            .filter(|entry| entry.value().as_ref().is_some_and(|b| !b.is_expired(now)))
            .count()
    }

    /// Whether `address` on `link` is owned by a live binding.
    pub fn is_claimed(&self, link: &str, address: Ipv4Addr) -> bool {
        let now = SystemTime::now();
        self.claims
            .get(&(CompactString::from(link), address))
            .is_some_and(|claim| claim.expires > now)
    }

    pub fn is_quarantined(&self, link: &str, address: Ipv4Addr) -> bool {
        self.quarantined_at(&CompactString::from(link), address, SystemTime::now())
    }

    /// Remove expired bindings, claims and quarantine entries.
    ///
    /// Each binding is removed under its own key's lock and the repository is
    /// purged once at the end, with no shard lock held.
    pub fn evict_expired(&self) {
        let now = SystemTime::now();

        let candidates: Vec<BindingKey> = self
            .bindings
            .iter()
            .filter(|entry| entry.value().as_ref().map_or(true, |b| b.is_expired(now)))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0usize;
        let mut bindings_removed = 0usize;
        for key in &candidates {
            // a transaction may have refreshed the key since the scan
            let removed = self.bindings.remove_if(key, |_, slot| {
                slot.as_ref().map_or(true, |b| b.is_expired(now))
            });
            if let Some((_, slot)) = removed {
                bindings_removed += 1;
                if slot.is_some() {
                    expired += 1;
                }
            }
        }

        // claims of the removed bindings expire with them
        let claims_before = self.claims.len();
        self.claims.retain(|_, claim| claim.expires > now);
        let claims_evicted = claims_before.saturating_sub(self.claims.len());

        let quarantine_before = self.quarantine.len();
        self.quarantine.retain(|_, until| *until > now);
        let quarantine_evicted = quarantine_before.saturating_sub(self.quarantine.len());

        let purged = match self.repository.purge_expired(now) {
            Ok(purged) => purged,
            Err(e) => {
                warn!("failed to purge expired bindings from repository: {e}");
                0
            }
        };

        if expired > 0 || claims_evicted > 0 || quarantine_evicted > 0 || purged > 0 {
            info!(
                expired,
                bindings_removed,
                claims_evicted,
                quarantine_evicted,
                purged,
                bindings_remaining = self.bindings.len(),
                "evicted expired entries"
            );
        }
    }

    /// Spawn a cleanup thread that periodically evicts expired entries.
    ///
    /// Returns a join handle for the spawned thread.
    pub fn spawn_cleanup_thread(
        self: &Arc<Self>,
        interval: Duration,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        let db = Arc::clone(self);
        std::thread::Builder::new()
            .name("leasedb-cleanup".into())
            .spawn(move || loop {
                std::thread::sleep(interval);
                db.evict_expired();
            })
    }

    /// Fill an empty slot from the repository, e.g. a binding written by
    /// another server process sharing the backend.
    fn hydrate(
        &self,
        link: &Link,
        entry: &mut RefMut<'_, BindingKey, Option<Binding>>,
        now: SystemTime,
    ) -> Result<(), AllocationFailure> {
        if entry.value().is_some() {
            return Ok(());
        }
        let Some(stored) = self.repository.find_by_key(entry.key())? else {
            return Ok(());
        };
        if stored.is_expired(now) {
            return Ok(());
        }

        match self.claims.entry((link.name.clone(), stored.address)) {
            Entry::Occupied(o) if o.get().mac != stored.key.mac && o.get().expires > now => {
                warn!(address = %stored.address, owner = %o.get().mac, mac = %stored.key.mac,
                    "stored binding conflicts with a live claim, ignoring it");
                return Ok(());
            }
            Entry::Occupied(mut o) => {
                o.insert(Claim {
                    mac: stored.key.mac,
                    expires: stored.expires_at(),
                });
            }
            Entry::Vacant(v) => {
                v.insert(Claim {
                    mac: stored.key.mac,
                    expires: stored.expires_at(),
                });
            }
        }

        debug!(mac = %stored.key.mac, address = %stored.address, "loaded binding from repository");
        *entry.value_mut() = Some(stored);
        Ok(())
    }

    fn claim_address(
        &self,
        link: &Link,
        mac: MacAddr6,
        requested: Requested,
        duration_for: &dyn Fn(Ipv4Addr) -> Duration,
        now: SystemTime,
    ) -> Result<(Ipv4Addr, Duration), AllocationFailure> {
        match requested {
            Requested::Exact(address) => self.try_claim(link, address, mac, duration_for, now),
            Requested::Hint(address) => self
                .try_claim(link, address, mac, duration_for, now)
                .or_else(|reason| {
                    debug!(%address, reason = reason.as_str(), "requested address not usable, scanning pool");
                    self.scan_pool(link, mac, duration_for, now)
                }),
            Requested::Any => self.scan_pool(link, mac, duration_for, now),
        }
    }

    /// First claimable address of the link, subnets in configuration order and
    /// addresses ascending.
    fn scan_pool(
        &self,
        link: &Link,
        mac: MacAddr6,
        duration_for: &dyn Fn(Ipv4Addr) -> Duration,
        now: SystemTime,
    ) -> Result<(Ipv4Addr, Duration), AllocationFailure> {
        for subnet in &link.subnets {
            for address in subnet.addresses().filter(|a| !subnet.is_reserved(*a)) {
                if let Ok(claimed) = self.try_claim(link, address, mac, duration_for, now) {
                    return Ok(claimed);
                }
            }
        }
        Err(AllocationFailure::PoolExhausted(link.name.clone()))
    }

    fn try_claim(
        &self,
        link: &Link,
        address: Ipv4Addr,
        mac: MacAddr6,
        duration_for: &dyn Fn(Ipv4Addr) -> Duration,
        now: SystemTime,
    ) -> Result<(Ipv4Addr, Duration), AllocationFailure> {
        if !link.is_assignable(address) || self.quarantined_at(&link.name, address, now) {
            return Err(AllocationFailure::RequestedAddressUnavailable(address));
        }

        let duration = duration_for(address);
        let expires = now + duration;
        match self.claims.entry((link.name.clone(), address)) {
            Entry::Vacant(v) => {
                v.insert(Claim { mac, expires });
                Ok((address, duration))
            }
            Entry::Occupied(mut o) => {
                let claim = *o.get();
                if claim.mac == mac || claim.expires <= now {
                    o.insert(Claim { mac, expires });
                    Ok((address, duration))
                } else {
                    Err(AllocationFailure::RequestedAddressConflict {
                        address,
                        owner: claim.mac,
                    })
                }
            }
        }
    }

    fn unclaim(&self, link: &CompactString, address: Ipv4Addr, mac: MacAddr6) {
        self.claims
            .remove_if(&(link.clone(), address), |_, claim| claim.mac == mac);
    }

    fn quarantined_at(&self, link: &CompactString, address: Ipv4Addr, now: SystemTime) -> bool {
        let key = (link.clone(), address);
        self.quarantine.remove_if(&key, |_, until| *until <= now);
        self.quarantine.contains_key(&key)
    }
}
