//! File-backed metadata store
//!
//! Keeps the device, media and lock tables as JSON files under one
//! base directory, plus an append-only audit log. Every mutation
//! locks, reloads, modifies and atomically replaces the table, so
//! concurrent schedulers sharing the directory stay consistent.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use serde_json::json;

use proxmox_sys::fs::{file_get_json, open_file_locked, replace_file, CreateOptions};

use lrs_api_types::{DeviceEntry, DeviceId, Medium, MediumId};

use super::{AuditAction, MetaStore, WriteMediumFilter};

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LockRow {
    id: String,
    owner: String,
    /// Lock acquisition time (epoch)
    ctime: i64,
}

pub struct LocalStore {
    base_path: PathBuf,
    lockfile_path: PathBuf,
    audit: Mutex<()>,
}

impl LocalStore {
    pub const DEVICE_TABLE_FILENAME: &'static str = "device-table.json";
    pub const MEDIA_TABLE_FILENAME: &'static str = "media-table.json";
    pub const LOCK_TABLE_FILENAME: &'static str = "lock-table.json";
    pub const AUDIT_LOG_FILENAME: &'static str = "audit.log";
    pub const STORE_LOCKFILE: &'static str = ".store.lck";

    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self, Error> {
        let base_path = base_path.as_ref().to_owned();
        std::fs::create_dir_all(&base_path)?;

        let mut lockfile_path = base_path.clone();
        lockfile_path.push(Self::STORE_LOCKFILE);

        Ok(LocalStore {
            base_path,
            lockfile_path,
            audit: Mutex::new(()),
        })
    }

    fn table_path(&self, filename: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(filename);
        path
    }

    fn lock(&self) -> Result<std::fs::File, Error> {
        open_file_locked(
            &self.lockfile_path,
            std::time::Duration::new(10, 0),
            true,
            CreateOptions::new(),
        )
    }

    fn load_table<T: serde::de::DeserializeOwned>(&self, filename: &str) -> Result<Vec<T>, Error> {
        let data = file_get_json(self.table_path(filename), Some(json!([])))?;
        let list: Vec<T> = serde_json::from_value(data)?;
        Ok(list)
    }

    fn store_table<T: Serialize>(&self, filename: &str, list: &[T]) -> Result<(), Error> {
        let raw = serde_json::to_string_pretty(&serde_json::to_value(list)?)?;
        replace_file(
            self.table_path(filename),
            raw.as_bytes(),
            CreateOptions::new(),
            false,
        )?;
        Ok(())
    }

    /// Seed a device row (startup/test helper).
    pub fn insert_device(&self, entry: &DeviceEntry) -> Result<(), Error> {
        let _lock = self.lock()?;
        let mut list: Vec<DeviceEntry> = self.load_table(Self::DEVICE_TABLE_FILENAME)?;
        list.retain(|row| row.id != entry.id);
        list.push(entry.clone());
        self.store_table(Self::DEVICE_TABLE_FILENAME, &list)
    }

    /// Seed a medium row (startup/test helper).
    pub fn insert_medium(&self, medium: &Medium) -> Result<(), Error> {
        let _lock = self.lock()?;
        let mut list: Vec<Medium> = self.load_table(Self::MEDIA_TABLE_FILENAME)?;
        list.retain(|row| row.id != medium.id);
        list.push(medium.clone());
        self.store_table(Self::MEDIA_TABLE_FILENAME, &list)
    }

    fn take_lock(&self, key: String, owner: &str) -> Result<(), Error> {
        let _lock = self.lock()?;
        let mut list: Vec<LockRow> = self.load_table(Self::LOCK_TABLE_FILENAME)?;
        if let Some(row) = list.iter().find(|row| row.id == key) {
            if row.owner == owner {
                return Ok(()); // we already hold it
            }
            bail!("'{}' is locked by '{}'", key, row.owner);
        }
        list.push(LockRow {
            id: key,
            owner: owner.to_string(),
            ctime: proxmox_time::epoch_i64(),
        });
        self.store_table(Self::LOCK_TABLE_FILENAME, &list)
    }

    fn drop_lock(&self, key: &str, owner: &str) -> Result<(), Error> {
        let _lock = self.lock()?;
        let mut list: Vec<LockRow> = self.load_table(Self::LOCK_TABLE_FILENAME)?;
        match list.iter().position(|row| row.id == key) {
            Some(pos) => {
                if list[pos].owner != owner {
                    bail!(
                        "cannot unlock '{}' - held by '{}', not '{}'",
                        key,
                        list[pos].owner,
                        owner
                    );
                }
                list.remove(pos);
                self.store_table(Self::LOCK_TABLE_FILENAME, &list)
            }
            None => bail!("cannot unlock '{}' - not locked", key),
        }
    }

    fn medium_key(id: &MediumId) -> String {
        format!("medium/{}", id)
    }

    fn device_key(id: &DeviceId) -> String {
        format!("device/{}", id)
    }
}

impl MetaStore for LocalStore {
    fn list_devices(&self) -> Result<Vec<DeviceEntry>, Error> {
        self.load_table(Self::DEVICE_TABLE_FILENAME)
    }

    fn lookup_device(&self, id: &DeviceId) -> Result<DeviceEntry, Error> {
        let list: Vec<DeviceEntry> = self.load_table(Self::DEVICE_TABLE_FILENAME)?;
        match list.into_iter().find(|row| &row.id == id) {
            Some(entry) => Ok(entry),
            None => bail!("no such device '{}'", id),
        }
    }

    fn update_device(&self, entry: &DeviceEntry) -> Result<(), Error> {
        let _lock = self.lock()?;
        let mut list: Vec<DeviceEntry> = self.load_table(Self::DEVICE_TABLE_FILENAME)?;
        match list.iter_mut().find(|row| row.id == entry.id) {
            Some(row) => *row = entry.clone(),
            None => bail!("no such device '{}'", entry.id),
        }
        self.store_table(Self::DEVICE_TABLE_FILENAME, &list)
    }

    fn lookup_medium(&self, id: &MediumId) -> Result<Medium, Error> {
        let list: Vec<Medium> = self.load_table(Self::MEDIA_TABLE_FILENAME)?;
        match list.into_iter().find(|row| &row.id == id) {
            Some(medium) => Ok(medium),
            None => bail!("no such medium '{}'", id),
        }
    }

    fn update_medium(&self, medium: &Medium) -> Result<(), Error> {
        let _lock = self.lock()?;
        let mut list: Vec<Medium> = self.load_table(Self::MEDIA_TABLE_FILENAME)?;
        match list.iter_mut().find(|row| row.id == medium.id) {
            Some(row) => *row = medium.clone(),
            None => bail!("no such medium '{}'", medium.id),
        }
        self.store_table(Self::MEDIA_TABLE_FILENAME, &list)
    }

    fn select_writable_medium(
        &self,
        filter: &WriteMediumFilter,
    ) -> Result<Option<Medium>, Error> {
        let list: Vec<Medium> = self.load_table(Self::MEDIA_TABLE_FILENAME)?;
        let locks: Vec<LockRow> = self.load_table(Self::LOCK_TABLE_FILENAME)?;

        let mut candidates: Vec<Medium> = list
            .into_iter()
            .filter(|medium| {
                medium.id.family == filter.family
                    && medium.is_writable()
                    && medium.stats.phys_spc_free >= filter.required_size
                    && !filter.exclude.contains(&medium.id)
                    && filter
                        .tags
                        .iter()
                        .all(|tag| medium.tags.iter().any(|have| have == tag))
                    && !locks
                        .iter()
                        .any(|row| row.id == Self::medium_key(&medium.id))
            })
            .collect();

        // grouping matches first, then most free space
        candidates.sort_by(|a, b| {
            let a_group = filter
                .grouping
                .map(|g| a.groupings.iter().any(|have| have == g))
                .unwrap_or(false);
            let b_group = filter
                .grouping
                .map(|g| b.groupings.iter().any(|have| have == g))
                .unwrap_or(false);
            b_group
                .cmp(&a_group)
                .then(b.stats.phys_spc_free.cmp(&a.stats.phys_spc_free))
        });

        Ok(candidates.into_iter().next())
    }

    fn lock_medium(&self, id: &MediumId, owner: &str) -> Result<(), Error> {
        self.take_lock(Self::medium_key(id), owner)
    }

    fn unlock_medium(&self, id: &MediumId, owner: &str) -> Result<(), Error> {
        self.drop_lock(&Self::medium_key(id), owner)
    }

    fn medium_locked_by_other(&self, id: &MediumId, owner_prefix: &str) -> Result<bool, Error> {
        let list: Vec<LockRow> = self.load_table(Self::LOCK_TABLE_FILENAME)?;
        let key = Self::medium_key(id);
        Ok(list
            .iter()
            .any(|row| row.id == key && !row.owner.starts_with(owner_prefix)))
    }

    fn lock_device(&self, id: &DeviceId, owner: &str) -> Result<(), Error> {
        self.take_lock(Self::device_key(id), owner)
    }

    fn unlock_device(&self, id: &DeviceId, owner: &str) -> Result<(), Error> {
        self.drop_lock(&Self::device_key(id), owner)
    }

    fn audit(&self, action: AuditAction, target: &str, error: Option<&str>) {
        let _guard = self.audit.lock().unwrap();

        let outcome = match error {
            None => "ok".to_string(),
            Some(err) => format!("failed: {}", err),
        };
        let line = format!(
            "{} {} {} {}\n",
            proxmox_time::epoch_i64(),
            action,
            target,
            outcome
        );

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.table_path(Self::AUDIT_LOG_FILENAME))
            .and_then(|mut file| file.write_all(line.as_bytes()));

        if let Err(err) = result {
            log::error!("unable to append audit log - {}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use lrs_api_types::{
        AdminStatus, FsStatus, Medium, MediumId, MediumStats, ResourceFamily,
    };

    use super::*;

    fn create_testdir(name: &str) -> Result<PathBuf, Error> {
        let mut testdir: PathBuf = String::from("./target/testout").into();
        testdir.push(std::module_path!());
        testdir.push(name);

        let _ = std::fs::remove_dir_all(&testdir);
        let _ = std::fs::create_dir_all(&testdir);

        Ok(testdir)
    }

    fn test_medium(name: &str, free: u64) -> Medium {
        let id = MediumId::new(ResourceFamily::Tape, name, "lib0");
        let mut medium = Medium::blank(
            id,
            lrs_api_types::FsType::Ltfs,
            lrs_api_types::AddressType::Path,
        );
        medium.fs.status = FsStatus::Empty;
        medium.stats = MediumStats {
            phys_spc_free: free,
            ..Default::default()
        };
        medium
    }

    #[test]
    fn test_lock_table() -> Result<(), Error> {
        let testdir = create_testdir("test_lock_table")?;
        let store = LocalStore::open(&testdir)?;

        let id = MediumId::new(ResourceFamily::Tape, "tape1", "lib0");

        store.lock_medium(&id, "sched-a")?;
        // idempotent for the same owner
        store.lock_medium(&id, "sched-a")?;
        // refused for another owner
        assert!(store.lock_medium(&id, "sched-b").is_err());
        assert!(store.medium_locked_by_other(&id, "sched-b")?);
        assert!(!store.medium_locked_by_other(&id, "sched-a")?);

        // wrong owner cannot unlock
        assert!(store.unlock_medium(&id, "sched-b").is_err());
        store.unlock_medium(&id, "sched-a")?;
        assert!(store.unlock_medium(&id, "sched-a").is_err());

        Ok(())
    }

    #[test]
    fn test_select_writable_medium() -> Result<(), Error> {
        let testdir = create_testdir("test_select_writable_medium")?;
        let store = LocalStore::open(&testdir)?;

        let mut small = test_medium("small", 1024);
        small.groupings.push("archive".to_string());
        let big = test_medium("big", 1024 * 1024);
        let mut locked = test_medium("locked", 1024 * 1024 * 10);
        locked.admin_status = AdminStatus::Locked;

        store.insert_medium(&small)?;
        store.insert_medium(&big)?;
        store.insert_medium(&locked)?;

        let filter = WriteMediumFilter {
            family: ResourceFamily::Tape,
            required_size: 512,
            tags: &[],
            grouping: None,
            exclude: &[],
        };
        // most free space wins, admin-locked media never selected
        let picked = store.select_writable_medium(&filter)?.unwrap();
        assert_eq!(picked.id.name, "big");

        // a grouping match outranks free space
        let filter = WriteMediumFilter {
            grouping: Some("archive"),
            ..filter
        };
        let picked = store.select_writable_medium(&filter)?.unwrap();
        assert_eq!(picked.id.name, "small");

        // store-side locks exclude a medium from selection
        let store: Arc<dyn MetaStore> = Arc::new(store);
        store.lock_medium(&big.id, "other-sched")?;
        let filter = WriteMediumFilter {
            family: ResourceFamily::Tape,
            required_size: 512,
            tags: &[],
            grouping: None,
            exclude: &[],
        };
        let picked = store.select_writable_medium(&filter)?.unwrap();
        assert_eq!(picked.id.name, "small");

        Ok(())
    }
}
