use std::{
    fs::{self, File},
    io::{BufReader, Write},
    path::PathBuf,
    sync::Mutex,
    time::SystemTime,
};

use dashmap::DashMap;
use tracing::info;

use crate::error::RepositoryError;
use crate::leasedb::{Binding, BindingKey};

/// Durable storage behind the [`LeaseDb`](crate::leasedb::LeaseDb).
///
/// Every call is keyed by (link, hardware address). Implementations must be
/// safe to call from many workers at once.
pub trait LeaseRepository: Send + Sync {
    fn find_by_key(&self, key: &BindingKey) -> Result<Option<Binding>, RepositoryError>;
    fn insert(&self, binding: &Binding) -> Result<(), RepositoryError>;
    fn update(&self, binding: &Binding) -> Result<(), RepositoryError>;
    fn delete(&self, key: &BindingKey) -> Result<(), RepositoryError>;
    /// Drop every record that has expired by `now`. Returns how many were dropped.
    fn purge_expired(&self, now: SystemTime) -> Result<usize, RepositoryError>;
    /// Every stored record, used to restore state on startup.
    fn load_all(&self) -> Result<Vec<Binding>, RepositoryError>;
}

/// Keeps bindings in memory only; they are lost on restart.
#[derive(Default)]
pub struct MemoryRepository {
    inner: DashMap<BindingKey, Binding>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl LeaseRepository for MemoryRepository {
    fn find_by_key(&self, key: &BindingKey) -> Result<Option<Binding>, RepositoryError> {
        Ok(self.inner.get(key).map(|b| b.value().clone()))
    }

    fn insert(&self, binding: &Binding) -> Result<(), RepositoryError> {
        self.inner.insert(binding.key.clone(), binding.clone());
        Ok(())
    }

    fn update(&self, binding: &Binding) -> Result<(), RepositoryError> {
        self.inner.insert(binding.key.clone(), binding.clone());
        Ok(())
    }

    fn delete(&self, key: &BindingKey) -> Result<(), RepositoryError> {
        self.inner.remove(key);
        Ok(())
    }

    fn purge_expired(&self, now: SystemTime) -> Result<usize, RepositoryError> {
        let mut purged = 0;
        self.inner.retain(|_, binding| {
            let keep = !binding.is_expired(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        Ok(purged)
    }

    fn load_all(&self) -> Result<Vec<Binding>, RepositoryError> {
        Ok(self.inner.iter().map(|b| b.value().clone()).collect())
    }
}

/// Persists every binding to a single JSON document.
///
/// Each mutation rewrites the file with the write-rename pattern so a crash
/// mid-write never leaves a truncated lease file behind.
pub struct JsonFileRepository {
    path: PathBuf,
    records: DashMap<BindingKey, Binding>,
    write_lock: Mutex<()>,
}

impl JsonFileRepository {
    /// Open the lease file at `path`, starting empty if it doesn't exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let path = path.into();
        let records = DashMap::new();

        if path.exists() {
            let file = File::open(&path)?;
            let stored: Vec<Binding> = serde_json::from_reader(BufReader::new(file))?;
            for binding in stored {
                records.insert(binding.key.clone(), binding);
            }
            info!(path = %path.display(), count = records.len(), "loaded lease file");
        }

        Ok(Self {
            path,
            records,
            write_lock: Mutex::new(()),
        })
    }

    fn flush(&self) -> Result<(), RepositoryError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RepositoryError::Unavailable("lease file writer poisoned".into()))?;

        let mut snapshot: Vec<Binding> = self.records.iter().map(|b| b.value().clone()).collect();
        // stable output makes the file diffable
        snapshot.sort_by(|a, b| (&a.key.link, a.address).cmp(&(&b.key.link, b.address)));

        let temp = self.path.with_extension("json.tmp");
        let mut file = File::create(&temp)?;
        serde_json::to_writer_pretty(&mut file, &snapshot)?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&temp, &self.path)?;

        Ok(())
    }
}

impl LeaseRepository for JsonFileRepository {
    fn find_by_key(&self, key: &BindingKey) -> Result<Option<Binding>, RepositoryError> {
        Ok(self.records.get(key).map(|b| b.value().clone()))
    }

    fn insert(&self, binding: &Binding) -> Result<(), RepositoryError> {
        let previous = self.records.insert(binding.key.clone(), binding.clone());
        self.flush().inspect_err(|_| {
            // keep memory and disk in agreement when the write fails
            match previous {
                Some(ref old) => {
                    self.records.insert(old.key.clone(), old.clone());
                }
                None => {
                    self.records.remove(&binding.key);
                }
            }
        })
    }

    fn update(&self, binding: &Binding) -> Result<(), RepositoryError> {
        self.insert(binding)
    }

    fn delete(&self, key: &BindingKey) -> Result<(), RepositoryError> {
        match self.records.remove(key) {
            Some((_, old)) => self.flush().inspect_err(|_| {
                self.records.insert(old.key.clone(), old);
            }),
            None => Ok(()),
        }
    }

    /// Removes all expired records with a single rewrite of the file.
    fn purge_expired(&self, now: SystemTime) -> Result<usize, RepositoryError> {
        let expired: Vec<BindingKey> = self
            .records
            .iter()
            .filter(|b| b.value().is_expired(now))
            .map(|b| b.key().clone())
            .collect();

        let removed: Vec<Binding> = expired
            .iter()
            .filter_map(|key| self.records.remove_if(key, |_, b| b.is_expired(now)))
            .map(|(_, binding)| binding)
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }

        match self.flush() {
            Ok(()) => Ok(removed.len()),
            Err(e) => {
                for old in removed {
                    // a record written since the removal wins
                    self.records.entry(old.key.clone()).or_insert(old);
                }
                Err(e)
            }
        }
    }

    fn load_all(&self) -> Result<Vec<Binding>, RepositoryError> {
        Ok(self.records.iter().map(|b| b.value().clone()).collect())
    }
}

/// Rejects every write, for exercising the store's rollback paths.
#[cfg(test)]
pub(crate) struct FailingRepository;

#[cfg(test)]
impl LeaseRepository for FailingRepository {
    fn find_by_key(&self, _key: &BindingKey) -> Result<Option<Binding>, RepositoryError> {
        Ok(None)
    }
    fn insert(&self, _binding: &Binding) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("backend down".into()))
    }
    fn update(&self, _binding: &Binding) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("backend down".into()))
    }
    fn delete(&self, _key: &BindingKey) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("backend down".into()))
    }
    fn purge_expired(&self, _now: SystemTime) -> Result<usize, RepositoryError> {
        Err(RepositoryError::Unavailable("backend down".into()))
    }
    fn load_all(&self) -> Result<Vec<Binding>, RepositoryError> {
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leasedb::BindingState;
    use advmac::MacAddr6;
    use std::net::Ipv4Addr;
    use std::time::{Duration, SystemTime};

    fn test_binding(last_octet: u8) -> Binding {
        Binding {
            key: BindingKey {
                link: "lan".into(),
                mac: MacAddr6::new([0x00, 0x11, 0x22, 0x33, 0x44, last_octet]),
            },
            address: Ipv4Addr::new(192, 168, 1, last_octet),
            state: BindingState::Committed,
            start: SystemTime::now(),
            duration: Duration::from_secs(3600),
            requested_options: vec![1, 3, 6],
        }
    }

    fn temp_lease_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "shadowlease-{}-{}.json",
            name,
            std::process::id()
        ));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn memory_repository_crud() {
        let repo = MemoryRepository::new();
        let binding = test_binding(10);

        repo.insert(&binding).unwrap();
        assert_eq!(repo.find_by_key(&binding.key).unwrap(), Some(binding.clone()));

        let mut updated = binding.clone();
        updated.state = BindingState::Offered;
        repo.update(&updated).unwrap();
        assert_eq!(
            repo.find_by_key(&binding.key).unwrap().unwrap().state,
            BindingState::Offered
        );

        repo.delete(&binding.key).unwrap();
        assert!(repo.find_by_key(&binding.key).unwrap().is_none());
        assert!(repo.is_empty());
    }

    #[test]
    fn json_repository_survives_reopen() {
        let path = temp_lease_path("reopen");

        {
            let repo = JsonFileRepository::open(&path).unwrap();
            repo.insert(&test_binding(10)).unwrap();
            repo.insert(&test_binding(11)).unwrap();
            repo.delete(&test_binding(11).key).unwrap();
        }

        let reopened = JsonFileRepository::open(&path).unwrap();
        let all = reopened.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].address, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(all[0].requested_options, vec![1, 3, 6]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn json_repository_rolls_back_failed_write() {
        let path = std::env::temp_dir()
            .join(format!("shadowlease-missing-dir-{}", std::process::id()))
            .join("leases.json");
        let repo = JsonFileRepository::open(&path).unwrap();

        assert!(repo.insert(&test_binding(10)).is_err());
        assert!(repo.find_by_key(&test_binding(10).key).unwrap().is_none());
    }

    #[test]
    fn json_repository_purges_expired_records() {
        let path = temp_lease_path("purge");
        let repo = JsonFileRepository::open(&path).unwrap();

        let live = test_binding(10);
        let mut dead = test_binding(11);
        dead.start = SystemTime::now() - Duration::from_secs(7200);
        repo.insert(&live).unwrap();
        repo.insert(&dead).unwrap();

        assert_eq!(repo.purge_expired(SystemTime::now()).unwrap(), 1);
        assert_eq!(repo.purge_expired(SystemTime::now()).unwrap(), 0);

        let reopened = JsonFileRepository::open(&path).unwrap();
        let all = reopened.load_all().unwrap();
        assert_eq!(all, vec![live]);

        let _ = fs::remove_file(&path);
    }
}
