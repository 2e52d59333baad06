//! Medium cache
//!
//! Thread-safe identity map holding at most one *current* in-memory
//! image per medium id. Holders keep plain [`Arc`] references: a
//! demoted record stays alive for exactly as long as some holder
//! still references it, and is destroyed when the last reference
//! drops. Mutation never happens in place; writers clone the record,
//! persist it through the store, and republish the new version.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Error;

use lrs_api_types::{Medium, MediumId};

use crate::store::MetaStore;

#[derive(Default)]
pub struct MediumCache {
    current: RwLock<HashMap<MediumId, Arc<Medium>>>,
}

impl MediumCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current record for `id`, building it from the
    /// store on first use.
    ///
    /// Takes the read lock first and only upgrades to the write lock
    /// on a miss, rechecking after the upgrade.
    pub fn acquire(&self, store: &dyn MetaStore, id: &MediumId) -> Result<Arc<Medium>, Error> {
        if let Some(medium) = self.current.read().unwrap().get(id) {
            return Ok(Arc::clone(medium));
        }

        let mut current = self.current.write().unwrap();
        // another thread may have built the record while we upgraded
        if let Some(medium) = current.get(id) {
            return Ok(Arc::clone(medium));
        }

        let result = store.lookup_medium(id);
        store.audit(
            crate::store::AuditAction::MediumLookup,
            &id.to_string(),
            result.as_ref().err().map(|err| err.to_string()).as_deref(),
        );

        let medium = Arc::new(result?);
        current.insert(id.clone(), Arc::clone(&medium));
        Ok(medium)
    }

    /// Returns the current record without touching the store.
    pub fn lookup(&self, id: &MediumId) -> Option<Arc<Medium>> {
        self.current.read().unwrap().get(id).map(Arc::clone)
    }

    /// Publishes an externally built record as the current version.
    ///
    /// A previously current record is demoted; references handed out
    /// earlier remain valid until released.
    pub fn insert(&self, medium: Medium) -> Arc<Medium> {
        let medium = Arc::new(medium);
        self.current
            .write()
            .unwrap()
            .insert(medium.id.clone(), Arc::clone(&medium));
        medium
    }

    /// Re-reads the record from the store and publishes the new
    /// version.
    pub fn update(&self, store: &dyn MetaStore, id: &MediumId) -> Result<Arc<Medium>, Error> {
        let medium = store.lookup_medium(id)?;
        Ok(self.insert(medium))
    }

    /// Drops the current entry for `id` (e.g. once a medium is dead).
    ///
    /// Outstanding references keep the record alive.
    pub fn remove(&self, id: &MediumId) -> Option<Arc<Medium>> {
        self.current.write().unwrap().remove(id)
    }

    /// Number of references to the current record, cache included.
    pub fn ref_count(&self, id: &MediumId) -> Option<usize> {
        self.current
            .read()
            .unwrap()
            .get(id)
            .map(Arc::strong_count)
    }
}

#[cfg(test)]
mod test {
    use lrs_api_types::{AddressType, FsStatus, FsType, ResourceFamily};

    use crate::store::LocalStore;

    use super::*;

    fn create_teststore(name: &str) -> Result<LocalStore, Error> {
        let mut testdir: std::path::PathBuf = String::from("./target/testout").into();
        testdir.push(std::module_path!());
        testdir.push(name);

        let _ = std::fs::remove_dir_all(&testdir);
        let _ = std::fs::create_dir_all(&testdir);

        LocalStore::open(&testdir)
    }

    fn test_id(name: &str) -> MediumId {
        MediumId::new(ResourceFamily::Tape, name, "lib0")
    }

    #[test]
    fn test_acquire_builds_once() -> Result<(), Error> {
        let store = create_teststore("test_acquire_builds_once")?;
        let id = test_id("tape1");
        store.insert_medium(&Medium::blank(id.clone(), FsType::Ltfs, AddressType::Path))?;

        let cache = MediumCache::new();
        let first = cache.acquire(&store, &id)?;
        let second = cache.acquire(&store, &id)?;
        // same record, not rebuilt from the store
        assert!(Arc::ptr_eq(&first, &second));
        // cache + two holders
        assert_eq!(cache.ref_count(&id), Some(3));

        assert!(cache.acquire(&store, &test_id("missing")).is_err());

        Ok(())
    }

    #[test]
    fn test_stale_reference_stays_valid() -> Result<(), Error> {
        let store = create_teststore("test_stale_reference_stays_valid")?;
        let id = test_id("tape1");
        store.insert_medium(&Medium::blank(id.clone(), FsType::Ltfs, AddressType::Path))?;

        let cache = MediumCache::new();
        let stale = cache.acquire(&store, &id)?;
        assert_eq!(stale.fs.status, FsStatus::Blank);

        // mutate through the store, republish
        let mut updated = (*stale).clone();
        updated.fs.status = FsStatus::Empty;
        store.update_medium(&updated)?;
        let current = cache.update(&store, &id)?;

        // the stale holder still observes its coherent snapshot
        assert_eq!(stale.fs.status, FsStatus::Blank);
        assert_eq!(current.fs.status, FsStatus::Empty);
        assert!(!Arc::ptr_eq(&stale, &current));

        // the demoted record is owned by its holders alone now
        assert_eq!(Arc::strong_count(&stale), 1);
        // current entry: cache + one holder
        assert_eq!(cache.ref_count(&id), Some(2));

        Ok(())
    }

    #[test]
    fn test_remove_keeps_holders_alive() -> Result<(), Error> {
        let store = create_teststore("test_remove_keeps_holders_alive")?;
        let id = test_id("tape1");
        store.insert_medium(&Medium::blank(id.clone(), FsType::Ltfs, AddressType::Path))?;

        let cache = MediumCache::new();
        let holder = cache.acquire(&store, &id)?;

        cache.remove(&id);
        assert!(cache.lookup(&id).is_none());
        // the holder's reference is unaffected
        assert_eq!(holder.id, id);
        assert_eq!(Arc::strong_count(&holder), 1);

        Ok(())
    }
}
