//! Directory-backed filesystem adapter
//!
//! Emulates per-medium filesystems as subdirectories of one backing
//! directory; mounting symlinks the medium directory to the mount
//! path. A `.readonly` marker inside the medium directory makes the
//! mount report read-only, which is how tests exercise the near-full
//! tape path.

use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use lrs_api_types::{AddressType, FsType, MediumId};

use super::{FsAdapter, FsUsage};

pub struct DirFs {
    backing: PathBuf,
    /// Emulated medium capacity (bytes)
    capacity: u64,
}

const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

/// Marker making a medium mount read-only
pub const READONLY_MARKER: &str = ".readonly";
const LABEL_FILENAME: &str = ".label";

impl DirFs {
    pub fn new<P: AsRef<Path>>(backing: P) -> Result<Self, Error> {
        let backing = backing.as_ref().to_owned();
        std::fs::create_dir_all(&backing)?;
        Ok(DirFs {
            backing,
            capacity: DEFAULT_CAPACITY,
        })
    }

    pub fn with_capacity<P: AsRef<Path>>(backing: P, capacity: u64) -> Result<Self, Error> {
        let mut this = Self::new(backing)?;
        this.capacity = capacity;
        Ok(this)
    }

    fn medium_dir(&self, medium: &MediumId) -> PathBuf {
        let mut path = self.backing.clone();
        path.push(&medium.name);
        path
    }

    fn dir_usage(path: &Path) -> Result<u64, Error> {
        let mut used = 0;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                used += Self::dir_usage(&entry.path())?;
            } else {
                used += metadata.len();
            }
        }
        Ok(used)
    }

    /// Test helper: flip the read-only marker of a medium.
    pub fn set_read_only(&self, medium: &MediumId, read_only: bool) -> Result<(), Error> {
        let mut marker = self.medium_dir(medium);
        marker.push(READONLY_MARKER);
        if read_only {
            std::fs::write(&marker, b"")?;
        } else {
            let _ = std::fs::remove_file(&marker);
        }
        Ok(())
    }
}

impl FsAdapter for DirFs {
    fn fs_type(&self) -> FsType {
        FsType::Posix
    }

    fn addr_type(&self) -> AddressType {
        AddressType::Path
    }

    fn mount(
        &self,
        _device_path: &str,
        medium: &MediumId,
        mount_path: &Path,
    ) -> Result<(), Error> {
        let medium_dir = self.medium_dir(medium);
        if !medium_dir.is_dir() {
            bail!("medium '{}' has no filesystem (not formatted?)", medium);
        }

        if let Some(parent) = mount_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if mount_path.exists() {
            bail!("mount path {:?} is busy", mount_path);
        }

        symlink(&medium_dir, mount_path)
            .map_err(|err| format_err!("mount {:?} failed - {}", mount_path, err))?;

        Ok(())
    }

    fn umount(&self, mount_path: &Path) -> Result<(), Error> {
        if !mount_path.exists() {
            bail!("nothing mounted at {:?}", mount_path);
        }
        std::fs::remove_file(mount_path)
            .map_err(|err| format_err!("umount {:?} failed - {}", mount_path, err))?;
        Ok(())
    }

    fn format(&self, _device_path: &str, medium: &MediumId, label: &str) -> Result<(), Error> {
        let medium_dir = self.medium_dir(medium);
        if medium_dir.is_dir() {
            std::fs::remove_dir_all(&medium_dir)?;
        }
        std::fs::create_dir_all(&medium_dir)?;

        let mut label_path = medium_dir;
        label_path.push(LABEL_FILENAME);
        std::fs::write(label_path, label.as_bytes())?;

        Ok(())
    }

    fn sync(&self, mount_path: &Path) -> Result<(), Error> {
        let target = mount_path
            .read_link()
            .map_err(|err| format_err!("nothing mounted at {:?} - {}", mount_path, err))?;
        let dir = std::fs::File::open(&target)?;
        dir.sync_all()?;
        Ok(())
    }

    fn df(&self, mount_path: &Path) -> Result<FsUsage, Error> {
        let target = mount_path
            .read_link()
            .map_err(|err| format_err!("nothing mounted at {:?} - {}", mount_path, err))?;

        let used = Self::dir_usage(&target)?;
        let avail = self.capacity.saturating_sub(used);

        // the backing filesystem itself may be read-only
        let stat = nix::sys::statvfs::statvfs(&target)
            .map_err(|err| format_err!("statvfs {:?} failed - {}", target, err))?;
        let fs_read_only = stat
            .flags()
            .contains(nix::sys::statvfs::FsFlags::ST_RDONLY);

        let mut marker = target;
        marker.push(READONLY_MARKER);
        let read_only = fs_read_only || marker.exists() || avail == 0;

        Ok(FsUsage {
            total: self.capacity,
            used,
            avail,
            read_only,
        })
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
    fn test_format_mount_cycle() -> Result<(), Error> {
        let testdir = create_testdir("test_format_mount_cycle")?;
        let fs = DirFs::new(testdir.join("backing"))?;
        let medium = MediumId::new(ResourceFamily::Tape, "tape1", "lib0");
        let mount_path = testdir.join("mnt").join("drive0");

        // mounting an unformatted medium fails
        assert!(fs.mount("/dev/null", &medium, &mount_path).is_err());

        fs.format("/dev/null", &medium, "tape1")?;
        fs.mount("/dev/null", &medium, &mount_path)?;

        std::fs::write(mount_path.join("obj1"), vec![0u8; 4096])?;
        fs.sync(&mount_path)?;

        let usage = fs.df(&mount_path)?;
        assert!(usage.used >= 4096);
        assert!(!usage.read_only);
        assert_eq!(usage.total, DEFAULT_CAPACITY);

        fs.umount(&mount_path)?;
        assert!(fs.df(&mount_path).is_err());

        // formatting again wipes the content
        fs.format("/dev/null", &medium, "tape1")?;
        fs.mount("/dev/null", &medium, &mount_path)?;
        assert!(!mount_path.join("obj1").exists());
        fs.umount(&mount_path)?;

        Ok(())
    }

    #[test]
    fn test_read_only_marker() -> Result<(), Error> {
        let testdir = create_testdir("test_read_only_marker")?;
        let fs = DirFs::new(testdir.join("backing"))?;
        let medium = MediumId::new(ResourceFamily::Tape, "tape1", "lib0");
        let mount_path = testdir.join("mnt").join("drive0");

        fs.format("/dev/null", &medium, "tape1")?;
        fs.set_read_only(&medium, true)?;
        fs.mount("/dev/null", &medium, &mount_path)?;

        assert!(fs.df(&mount_path)?.read_only);

        fs.set_read_only(&medium, false)?;
        assert!(!fs.df(&mount_path)?.read_only);

        Ok(())
    }
}
