// End-to-end scheduler tests: real scheduler + device threads over
// the file-backed store, the virtual library and the directory
// filesystem adapter.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Error};
use proxmox_uuid::Uuid;

use lrs_api_types::{
    AddressType, AdminStatus, DeviceEntry, DeviceId, FormatRequest, FsStatus, FsType,
    IoRequestKind, Medium, MediumId, MediumStats, ReadAllocRequest, ReleaseMediumSpec,
    ReleaseRequest, Request, RequestBody, ResourceFamily, Response, ResponseBody,
    WriteAllocRequest, WriteMediumSpec, HEALTH_MAX,
};
use lrs_config::{FamilyTuning, LrsConfig};

use lrs::fs_adapter::{DirFs, FsAdapter};
use lrs::library::{MediaTransport, VirtualLibrary};
use lrs::sched::{spawn_scheduler, SchedulerHandle};
use lrs::store::{LocalStore, MetaStore};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

struct TestBed {
    handle: SchedulerHandle,
    store: Arc<LocalStore>,
    fs: Arc<DirFs>,
    #[allow(dead_code)]
    testdir: PathBuf,
}

fn medium_id(name: &str) -> MediumId {
    MediumId::new(ResourceFamily::Tape, name, "lib0")
}

fn create_testbed(name: &str, media: &[&str], drives: &[&str]) -> Result<TestBed, Error> {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut testdir: PathBuf = String::from("./target/testout").into();
    testdir.push("scheduler");
    testdir.push(name);
    let _ = std::fs::remove_dir_all(&testdir);
    std::fs::create_dir_all(&testdir)?;

    let store = Arc::new(LocalStore::open(testdir.join("store"))?);
    let fs = Arc::new(DirFs::with_capacity(testdir.join("backing"), 8 << 20)?);
    let library = VirtualLibrary::create("lib0", testdir.join("library"), media)?;

    for name in media {
        let mut medium = Medium::blank(medium_id(name), FsType::Posix, AddressType::Path);
        // formatted and empty, ready for I/O
        fs.format("/dev/null", &medium.id, name)?;
        medium.fs.status = FsStatus::Empty;
        medium.stats = MediumStats {
            phys_spc_free: 8 << 20,
            ..Default::default()
        };
        store.insert_medium(&medium)?;
    }

    for name in drives {
        store.insert_device(&DeviceEntry {
            id: DeviceId::new(ResourceFamily::Tape, name, "lib0"),
            admin_status: AdminStatus::Unlocked,
            path: format!("/dev/{}", name),
            model: None,
            technology: None,
            health: HEALTH_MAX,
        })?;
    }

    let mut config = LrsConfig {
        mount_prefix: testdir.join("mnt"),
        ..Default::default()
    };
    // aggressive sync thresholds keep the tests fast
    config.families.insert(
        ResourceFamily::Tape,
        FamilyTuning {
            sync_time_ms: 100,
            sync_nb_req: 1,
            sync_wsize_kb: 1024 * 1024,
        },
    );

    let transport: Arc<Mutex<Box<dyn MediaTransport>>> =
        Arc::new(Mutex::new(Box::new(library)));
    let handle = spawn_scheduler(
        Arc::new(config),
        store.clone() as Arc<dyn MetaStore>,
        transport,
        fs.clone() as Arc<dyn FsAdapter>,
    )?;

    Ok(TestBed {
        handle,
        store,
        fs,
        testdir,
    })
}

fn recv_response(bed: &TestBed, id: &Uuid) -> Result<Response, Error> {
    let deadline = std::time::Instant::now() + RESPONSE_TIMEOUT;
    loop {
        let timeout = deadline.saturating_duration_since(std::time::Instant::now());
        match bed.handle.response_rx.recv_timeout(timeout) {
            Ok(response) if &response.id == id => return Ok(response),
            Ok(response) => bail!("unexpected response {:?}", response),
            Err(_) => bail!("no response for request {}", id),
        }
    }
}

fn release_media(
    bed: &TestBed,
    kind: IoRequestKind,
    media: &[(&str, u64)],
    partial: bool,
    grouping: Option<&str>,
) -> Result<Response, Error> {
    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Release(ReleaseRequest {
            kind,
            partial,
            media: media
                .iter()
                .map(|(name, written)| ReleaseMediumSpec {
                    medium: medium_id(name),
                    written_size: *written,
                    nb_extents_written: if *written > 0 { 1 } else { 0 },
                    rc: 0,
                    grouping: grouping.map(|g| g.to_string()),
                })
                .collect(),
        }),
    })?;
    recv_response(bed, &id)
}

#[test]
fn test_write_alloc_release_cycle() -> Result<(), Error> {
    let bed = create_testbed("write_release", &["tape1"], &["st0"])?;

    // write allocation lands on the only drive
    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Write(WriteAllocRequest {
            family: ResourceFamily::Tape,
            media: vec![WriteMediumSpec {
                size: 4096,
                tags: Vec::new(),
                grouping: Some("archive".to_string()),
            }],
        }),
    })?;

    let response = recv_response(&bed, &id)?;
    let slot = match response.body {
        ResponseBody::Write { media } => media[0].clone(),
        other => bail!("unexpected response body {:?}", other),
    };
    assert_eq!(slot.medium, medium_id("tape1"));
    assert!(slot.root_path.ends_with("st0"));
    let avail = slot.avail_size.expect("write allocations report space");
    assert!(avail > 0);

    // the client performs its payload I/O under the mount root
    std::fs::write(PathBuf::from(&slot.root_path).join("obj1"), vec![1u8; 4096])?;

    // final release: sync, store update, response
    let response = release_media(
        &bed,
        IoRequestKind::Write,
        &[("tape1", 4096)],
        false,
        Some("archive"),
    )?;
    match response.body {
        ResponseBody::Release { media } => assert_eq!(media, vec![medium_id("tape1")]),
        other => bail!("unexpected response body {:?}", other),
    }

    // durability bookkeeping reached the store
    let medium = bed.store.lookup_medium(&medium_id("tape1"))?;
    assert_eq!(medium.fs.status, FsStatus::Used);
    assert_eq!(medium.stats.logical_spc_used, 4096);
    assert_eq!(medium.stats.nb_obj, 1);
    assert!(medium.stats.phys_spc_used >= 4096);
    assert!(medium.groupings.iter().any(|g| g == "archive"));

    bed.handle.shutdown();
    Ok(())
}

#[test]
fn test_read_alloc_cycle() -> Result<(), Error> {
    let bed = create_testbed("read_alloc", &["tape1", "tape2"], &["st0"])?;

    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Read(ReadAllocRequest {
            n_required: 1,
            media: vec![medium_id("tape1"), medium_id("tape2")],
        }),
    })?;

    let response = recv_response(&bed, &id)?;
    let slot = match response.body {
        ResponseBody::Read { media } => media[0].clone(),
        other => bail!("unexpected response body {:?}", other),
    };
    assert_eq!(slot.medium, medium_id("tape1"));
    assert_eq!(slot.fs_type, FsType::Posix);
    assert_eq!(slot.addr_type, AddressType::Path);
    // reads do not report free space
    assert_eq!(slot.avail_size, None);
    assert!(PathBuf::from(&slot.root_path).exists());

    let response = release_media(&bed, IoRequestKind::Read, &[("tape1", 0)], false, None)?;
    assert!(!response.is_error());

    bed.handle.shutdown();
    Ok(())
}

#[test]
fn test_format_request_idempotent() -> Result<(), Error> {
    let bed = create_testbed("format", &["tape1"], &["st0"])?;

    for _ in 0..2 {
        let id = Uuid::generate();
        bed.handle.request_tx.send(Request {
            id: id.clone(),
            body: RequestBody::Format(FormatRequest {
                medium: medium_id("tape1"),
                fs_type: FsType::Posix,
                unlock: false,
            }),
        })?;

        let response = recv_response(&bed, &id)?;
        match response.body {
            ResponseBody::Format { medium } => assert_eq!(medium, medium_id("tape1")),
            other => bail!("unexpected response body {:?}", other),
        }

        // formatting twice converges on the same state
        let medium = bed.store.lookup_medium(&medium_id("tape1"))?;
        assert_eq!(medium.fs.status, FsStatus::Empty);
        assert_eq!(medium.stats.nb_obj, 0);
        assert_eq!(medium.stats.logical_spc_used, 0);
        assert_eq!(medium.fs.label.as_deref(), Some("tape1"));
    }

    bed.handle.shutdown();
    Ok(())
}

#[test]
fn test_write_retried_on_read_only_mount() -> Result<(), Error> {
    let bed = create_testbed("read_only_retry", &["worn", "fresh"], &["st0"])?;

    // "worn" wins the selection (more free space recorded) but mounts
    // read-only, the way a near-full tape does
    let mut worn = bed.store.lookup_medium(&medium_id("worn"))?;
    worn.stats.phys_spc_free = 16 << 20;
    bed.store.update_medium(&worn)?;
    bed.fs.set_read_only(&medium_id("worn"), true)?;

    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Write(WriteAllocRequest {
            family: ResourceFamily::Tape,
            media: vec![WriteMediumSpec {
                size: 1024,
                tags: Vec::new(),
                grouping: None,
            }],
        }),
    })?;

    // the allocation still succeeds, on the second medium
    let response = recv_response(&bed, &id)?;
    let slot = match response.body {
        ResponseBody::Write { media } => media[0].clone(),
        other => bail!("unexpected response body {:?}", other),
    };
    assert_eq!(slot.medium, medium_id("fresh"));

    // and the read-only medium is flagged full in the store
    let worn = bed.store.lookup_medium(&medium_id("worn"))?;
    assert_eq!(worn.fs.status, FsStatus::Full);

    let response = release_media(&bed, IoRequestKind::Write, &[("fresh", 1024)], false, None)?;
    assert!(!response.is_error());

    bed.handle.shutdown();
    Ok(())
}

#[test]
fn test_partial_release_keeps_drive_claimed() -> Result<(), Error> {
    let bed = create_testbed("partial_release", &["tape1", "tape2"], &["st0"])?;

    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Write(WriteAllocRequest {
            family: ResourceFamily::Tape,
            media: vec![WriteMediumSpec {
                size: 1024,
                tags: Vec::new(),
                grouping: None,
            }],
        }),
    })?;
    let response = recv_response(&bed, &id)?;
    let slot = match response.body {
        ResponseBody::Write { media } => media[0].clone(),
        other => bail!("unexpected response body {:?}", other),
    };
    let first_medium = slot.medium.clone();

    // a partial release flushes but keeps the writer's claim
    let response = release_media(
        &bed,
        IoRequestKind::Write,
        &[(&first_medium.name, 1024)],
        true,
        None,
    )?;
    assert!(!response.is_error());

    // a second allocation cannot be served while the session is open
    // on the only drive
    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Write(WriteAllocRequest {
            family: ResourceFamily::Tape,
            media: vec![WriteMediumSpec {
                size: 1024,
                tags: Vec::new(),
                grouping: None,
            }],
        }),
    })?;
    assert!(bed
        .handle
        .response_rx
        .recv_timeout(Duration::from_millis(500))
        .is_err());

    // the continuation closes the session and unblocks the queue
    let response = release_media(
        &bed,
        IoRequestKind::Write,
        &[(&first_medium.name, 512)],
        false,
        None,
    )?;
    assert!(!response.is_error());

    let response = recv_response(&bed, &id)?;
    let second_medium = match response.body {
        ResponseBody::Write { media } => media[0].medium.clone(),
        other => bail!("unexpected response body {:?}", other),
    };
    release_media(
        &bed,
        IoRequestKind::Write,
        &[(&second_medium.name, 0)],
        false,
        None,
    )?;

    bed.handle.shutdown();
    Ok(())
}

#[test]
fn test_sync_triggered_by_time_threshold() -> Result<(), Error> {
    let bed = create_testbed("sync_by_time", &["tape1"], &["st0"])?;

    // thresholds that only the age check can trip
    let mut config = LrsConfig {
        mount_prefix: bed.testdir.join("mnt"),
        ..Default::default()
    };
    config.families.insert(
        ResourceFamily::Tape,
        FamilyTuning {
            sync_time_ms: 200,
            sync_nb_req: 100,
            sync_wsize_kb: 1 << 30,
        },
    );
    // restart the scheduler with the new tuning
    bed.handle.shutdown();
    let transport: Arc<Mutex<Box<dyn MediaTransport>>> = Arc::new(Mutex::new(Box::new(
        VirtualLibrary::open("lib0", bed.testdir.join("library"))?,
    )));
    let handle = spawn_scheduler(
        Arc::new(config),
        bed.store.clone() as Arc<dyn MetaStore>,
        transport,
        bed.fs.clone() as Arc<dyn FsAdapter>,
    )?;
    let bed = TestBed {
        handle,
        store: bed.store.clone(),
        fs: bed.fs.clone(),
        testdir: bed.testdir.clone(),
    };

    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Write(WriteAllocRequest {
            family: ResourceFamily::Tape,
            media: vec![WriteMediumSpec {
                size: 1024,
                tags: Vec::new(),
                grouping: None,
            }],
        }),
    })?;
    recv_response(&bed, &id)?;

    // a single release is far below the count/size thresholds; only
    // the age deadline flushes it
    let started = std::time::Instant::now();
    let response = release_media(&bed, IoRequestKind::Write, &[("tape1", 1024)], false, None)?;
    assert!(!response.is_error());
    assert!(started.elapsed() >= Duration::from_millis(150));

    let medium = bed.store.lookup_medium(&medium_id("tape1"))?;
    assert_eq!(medium.fs.status, FsStatus::Used);
    assert_eq!(medium.stats.logical_spc_used, 1024);

    bed.handle.shutdown();
    Ok(())
}

#[test]
fn test_notify_device_add_remove() -> Result<(), Error> {
    let bed = create_testbed("notify_devices", &["tape1"], &["st0"])?;

    let monitor = |bed: &TestBed| -> Result<usize, Error> {
        let id = Uuid::generate();
        bed.handle.request_tx.send(Request {
            id: id.clone(),
            body: RequestBody::Monitor,
        })?;
        match recv_response(bed, &id)?.body {
            ResponseBody::Monitor { devices } => Ok(devices.len()),
            other => bail!("unexpected response body {:?}", other),
        }
    };

    assert_eq!(monitor(&bed)?, 1);

    // hot-add: the row appears in the store first, then we are told
    let st1 = DeviceId::new(ResourceFamily::Tape, "st1", "lib0");
    bed.store.insert_device(&DeviceEntry {
        id: st1.clone(),
        admin_status: AdminStatus::Unlocked,
        path: "/dev/st1".to_string(),
        model: None,
        technology: None,
        health: HEALTH_MAX,
    })?;

    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Notify(lrs_api_types::NotifyRequest::DeviceAdd {
            device: st1.clone(),
        }),
    })?;
    assert!(!recv_response(&bed, &id)?.is_error());
    assert_eq!(monitor(&bed)?, 2);

    // hot-remove drains and detaches the drive
    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Notify(lrs_api_types::NotifyRequest::DeviceRemove {
            device: st1,
        }),
    })?;
    assert!(!recv_response(&bed, &id)?.is_error());
    assert_eq!(monitor(&bed)?, 1);

    bed.handle.shutdown();
    Ok(())
}

#[test]
fn test_monitor_snapshot() -> Result<(), Error> {
    let bed = create_testbed("monitor", &["tape1"], &["st0", "st1"])?;

    let id = Uuid::generate();
    bed.handle.request_tx.send(Request {
        id: id.clone(),
        body: RequestBody::Monitor,
    })?;

    let response = recv_response(&bed, &id)?;
    match response.body {
        ResponseBody::Monitor { devices } => {
            assert_eq!(devices.len(), 2);
            for entry in devices {
                assert_eq!(entry.health, HEALTH_MAX);
                assert!(!entry.ongoing_io);
            }
        }
        other => bail!("unexpected response body {:?}", other),
    }

    bed.handle.shutdown();
    Ok(())
}
