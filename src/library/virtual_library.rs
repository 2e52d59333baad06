// Note: This is only for test and debug

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};
use serde_json::json;

use proxmox_sys::fs::{file_get_json, replace_file, CreateOptions};

use lrs_api_types::{DeviceId, MediumId};

use super::{MediaTransport, TransportError};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct VirtualLibraryState {
    /// Media sitting in storage slots
    slots: BTreeSet<String>,
    /// Drive name -> loaded medium
    drives: BTreeMap<String, String>,
}

/// Directory-backed media changer emulation
pub struct VirtualLibrary {
    name: String,
    path: PathBuf,
    planned_failures: VecDeque<TransportError>,
}

impl VirtualLibrary {
    pub fn create<P: AsRef<Path>>(name: &str, path: P, media: &[&str]) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        std::fs::create_dir_all(&path)?;

        let library = VirtualLibrary {
            name: name.to_string(),
            path,
            planned_failures: VecDeque::new(),
        };

        let mut state = VirtualLibraryState::default();
        for medium in media {
            state.slots.insert(medium.to_string());
        }
        library.store_state(&state)?;

        Ok(library)
    }

    pub fn open<P: AsRef<Path>>(name: &str, path: P) -> Result<Self, Error> {
        Ok(VirtualLibrary {
            name: name.to_string(),
            path: path.as_ref().to_owned(),
            planned_failures: VecDeque::new(),
        })
    }

    /// Queue an error returned by the next transport operation.
    pub fn plan_failure(&mut self, error: TransportError) {
        self.planned_failures.push_back(error);
    }

    fn state_file_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.push("library-state.json");
        path
    }

    fn load_state(&self) -> Result<VirtualLibraryState, Error> {
        let data = file_get_json(self.state_file_path(), Some(json!({})))?;
        let state: VirtualLibraryState = serde_json::from_value(data)?;
        Ok(state)
    }

    fn store_state(&self, state: &VirtualLibraryState) -> Result<(), Error> {
        let raw = serde_json::to_string_pretty(&serde_json::to_value(state)?)?;
        replace_file(
            self.state_file_path(),
            raw.as_bytes(),
            CreateOptions::new(),
            false,
        )?;
        Ok(())
    }

    fn check_planned_failure(&mut self) -> Result<(), TransportError> {
        match self.planned_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl MediaTransport for VirtualLibrary {
    fn library(&self) -> &str {
        &self.name
    }

    fn scan(&mut self) -> Result<Vec<String>, TransportError> {
        self.check_planned_failure()?;

        let state = self
            .load_state()
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;

        let mut list: Vec<String> = state.slots.into_iter().collect();
        list.extend(state.drives.into_values());
        Ok(list)
    }

    fn load_medium(&mut self, drive: &DeviceId, medium: &MediumId) -> Result<(), TransportError> {
        self.check_planned_failure()?;

        let mut state = self
            .load_state()
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;

        if let Some(loaded) = state.drives.get(&drive.name) {
            return Err(TransportError::Drive(format!(
                "drive '{}' already holds medium '{}'",
                drive.name, loaded
            )));
        }
        if !state.slots.remove(&medium.name) {
            return Err(TransportError::Medium(format!(
                "unable to find medium '{}' (offline?)",
                medium.name
            )));
        }
        state.drives.insert(drive.name.clone(), medium.name.clone());

        self.store_state(&state)
            .map_err(|err| TransportError::Unreachable(err.to_string()))
    }

    fn unload_medium(
        &mut self,
        drive: &DeviceId,
        medium: &MediumId,
    ) -> Result<(), TransportError> {
        self.check_planned_failure()?;

        let mut state = self
            .load_state()
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;

        match state.drives.get(&drive.name) {
            Some(loaded) if loaded == &medium.name => {
                state.drives.remove(&drive.name);
                state.slots.insert(medium.name.clone());
            }
            Some(loaded) => {
                return Err(TransportError::Drive(format!(
                    "drive '{}' holds '{}', not '{}'",
                    drive.name, loaded, medium.name
                )));
            }
            None => {
                return Err(TransportError::Drive(format!(
                    "drive '{}' is empty",
                    drive.name
                )));
            }
        }

        self.store_state(&state)
            .map_err(|err| TransportError::Unreachable(err.to_string()))
    }
}

impl VirtualLibrary {
    /// Test helper: medium currently loaded in `drive`.
    pub fn loaded_medium(&self, drive: &DeviceId) -> Result<Option<String>, Error> {
        let state = self
            .load_state()
            .map_err(|err| format_err!("unable to read library state - {}", err))?;
        Ok(state.drives.get(&drive.name).cloned())
    }
}

#[cfg(test)]
mod test {
    use lrs_api_types::ResourceFamily;

    use super::*;

    fn create_testdir(name: &str) -> Result<PathBuf, Error> {
        let mut testdir: PathBuf = String::from("./target/testout").into();
        testdir.push(std::module_path!());
        testdir.push(name);

        let _ = std::fs::remove_dir_all(&testdir);
        let _ = std::fs::create_dir_all(&testdir);

        Ok(testdir)
    }

    #[test]
    fn test_load_unload_cycle() -> Result<(), Error> {
        let testdir = create_testdir("test_load_unload_cycle")?;
        let mut library = VirtualLibrary::create("lib0", &testdir, &["tape1", "tape2"])?;

        let drive = DeviceId::new(ResourceFamily::Tape, "drive0", "lib0");
        let tape1 = MediumId::new(ResourceFamily::Tape, "tape1", "lib0");
        let tape2 = MediumId::new(ResourceFamily::Tape, "tape2", "lib0");

        library.load_medium(&drive, &tape1).unwrap();
        assert_eq!(library.loaded_medium(&drive)?, Some("tape1".to_string()));

        // a loaded drive refuses another load
        assert!(matches!(
            library.load_medium(&drive, &tape2),
            Err(TransportError::Drive(_))
        ));

        // unload with the wrong medium is a drive error
        assert!(matches!(
            library.unload_medium(&drive, &tape2),
            Err(TransportError::Drive(_))
        ));

        library.unload_medium(&drive, &tape1).unwrap();
        assert_eq!(library.loaded_medium(&drive)?, None);

        let mut list = library.scan().unwrap();
        list.sort();
        assert_eq!(list, vec!["tape1".to_string(), "tape2".to_string()]);

        Ok(())
    }

    #[test]
    fn test_planned_failure() -> Result<(), Error> {
        let testdir = create_testdir("test_planned_failure")?;
        let mut library = VirtualLibrary::create("lib0", &testdir, &["tape1"])?;

        let drive = DeviceId::new(ResourceFamily::Tape, "drive0", "lib0");
        let tape1 = MediumId::new(ResourceFamily::Tape, "tape1", "lib0");

        library.plan_failure(TransportError::Unreachable("injected".to_string()));
        assert!(matches!(
            library.load_medium(&drive, &tape1),
            Err(TransportError::Unreachable(_))
        ));

        // the failure is consumed, the next call succeeds
        library.load_medium(&drive, &tape1).unwrap();

        Ok(())
    }
}
