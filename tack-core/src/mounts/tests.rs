use super::*;
use crate::mounter::{DecryptionKey, DecryptionMethod};
use crate::types::{DetectedVolume, Disk};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex as StdMutex;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

/// Holds mount attempts until the test opens it.
struct Gate {
    entered: Notify,
    open: Semaphore,
}

/// Scripted collaborator.
#[derive(Default)]
struct MockMounter {
    /// One-shot responses, consumed before the standing ones
    scripted: StdMutex<HashMap<MountBackend, VecDeque<std::result::Result<ParsedImage, String>>>>,
    standing: StdMutex<HashMap<MountBackend, ParsedImage>>,
    /// File names for which nothing ever mounts
    refused: StdMutex<HashSet<String>>,
    attempts: StdMutex<Vec<MountRequest>>,
    releases: StdMutex<Vec<MountHandle>>,
    fail_release: std::sync::atomic::AtomicBool,
    gate: Option<Gate>,
}

impl MockMounter {
    fn new() -> Self {
        Self::default()
    }

    fn always(self, backend: MountBackend, parsed: ParsedImage) -> Self {
        self.standing.lock().unwrap().insert(backend, parsed);
        self
    }

    fn once(self, backend: MountBackend, response: std::result::Result<ParsedImage, String>) -> Self {
        self.scripted.lock().unwrap().entry(backend).or_default().push_back(response);
        self
    }

    fn refuse(self, filename: &str) -> Self {
        self.refused.lock().unwrap().insert(filename.to_string());
        self
    }

    fn gated(self) -> Self {
        Self { gate: Some(Gate { entered: Notify::new(), open: Semaphore::new(0) }), ..self }
    }

    fn attempted_backends(&self) -> Vec<MountBackend> {
        self.attempts.lock().unwrap().iter().map(|r| r.backend).collect()
    }

    fn release_count(&self) -> usize {
        self.releases.lock().unwrap().len()
    }

    fn fail_releases(&self, fail: bool) {
        self.fail_release.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl DiskMounter for MockMounter {
    async fn attempt_mount(&self, request: &MountRequest) -> Result<ParsedImage> {
        self.attempts.lock().unwrap().push(request.clone());

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.open.acquire().await.unwrap().forget();
        }

        let filename = request.paths[0].file_name().unwrap().to_string_lossy().to_string();
        if self.refused.lock().unwrap().contains(&filename) {
            return Ok(nothing_mounted());
        }

        let scripted =
            self.scripted.lock().unwrap().get_mut(&request.backend).and_then(|q| q.pop_front());
        match scripted {
            Some(Ok(parsed)) => Ok(parsed),
            Some(Err(reason)) => Err(TackError::MounterFailed { mounter: "mock".into(), reason }),
            None => Ok(self.standing.lock().unwrap().get(&request.backend).cloned().unwrap_or_default()),
        }
    }

    async fn release(&self, handle: &MountHandle, _allow_lazy: bool) -> Result<()> {
        if self.fail_release.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TackError::MounterFailed { mounter: "mock".into(), reason: "busy".into() });
        }
        self.releases.lock().unwrap().push(handle.clone());
        Ok(())
    }

    async fn supported_tools(&self) -> Result<BTreeMap<String, bool>> {
        Ok(BTreeMap::from([("qemu-nbd".to_string(), true), ("xmount".to_string(), false)]))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn volume(mountpoint: Option<&str>) -> DetectedVolume {
    DetectedVolume {
        size: 1 << 20,
        fstype: Some("ntfs".into()),
        mountpoint: mountpoint.map(String::from),
        ..Default::default()
    }
}

fn single_disk(mountpoint: Option<&str>, volumes: Vec<DetectedVolume>) -> ParsedImage {
    ParsedImage { disks: vec![Disk { paths: vec![], mountpoint: mountpoint.map(String::from), volumes }] }
}

fn mounted() -> ParsedImage {
    single_disk(Some("/mnt/tack/a"), vec![volume(Some("/mnt/tack/a/0")), volume(Some("/mnt/tack/a/1"))])
}

fn nothing_mounted() -> ParsedImage {
    single_disk(None, vec![volume(None)])
}

fn luks_only() -> ParsedImage {
    let luks = DetectedVolume { fsdescription: Some("LUKS encrypted file".into()), ..volume(None) };
    single_disk(None, vec![luks])
}

struct Fixture {
    dir: TempDir,
    service: MountService,
    mounter: Arc<MockMounter>,
}

impl Fixture {
    async fn image(&self, rel_path: &str) -> Image {
        self.service.catalog().get_image(rel_path).await.unwrap().unwrap()
    }

    fn manual_dir(&self) -> PathBuf {
        let path = self.dir.path().join("manual");
        std::fs::create_dir_all(&path).unwrap();
        path
    }
}

async fn fixture(mounter: MockMounter, images: &[&str]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let image_dir = dir.path().join("images");
    std::fs::create_dir_all(&image_dir).unwrap();

    let catalog = Catalog::new_in_memory().await.unwrap();
    for name in images {
        let full_path = image_dir.join(name);
        std::fs::create_dir_all(full_path.parent().unwrap()).unwrap();
        std::fs::write(&full_path, b"image").unwrap();
        catalog.insert_image_if_absent(&full_path, name, name).await.unwrap();
    }

    let mounter = Arc::new(mounter);
    let service = MountService::new(
        catalog,
        mounter.clone(),
        MountSettings { mount_dir: dir.path().join("mnt") },
    );

    Fixture { dir, service, mounter }
}

#[tokio::test]
async fn test_mount_then_fast_path_skips_collaborator() {
    let f = fixture(MockMounter::new().always(MountBackend::Auto, mounted()), &["a.E01"]).await;

    let info = f.service.mount("a.E01", None).await.unwrap();
    assert_eq!(info.ref_count, 1);
    assert_eq!(info.disk.mountpoint.as_deref(), Some("/mnt/tack/a"));
    assert_eq!(info.disk.imagepath, f.dir.path().join("images/a.E01"));
    assert_eq!(info.disk.volumes.len(), 2);
    assert_eq!(info.disk.volumes[1].mountpoint.as_deref(), Some("/mnt/tack/a/1"));
    assert_eq!(info.disk.volumes[1].status, MountStatus::Mounted);

    let again = f.service.mount("a.E01", None).await.unwrap();
    assert_eq!(again.ref_count, 2);
    assert_eq!(again.disk.mountpoint, info.disk.mountpoint);
    assert_eq!(f.mounter.attempted_backends(), vec![MountBackend::Auto]);
}

#[tokio::test]
async fn test_unmount_with_consumers_only_decrements() {
    let f = fixture(MockMounter::new().always(MountBackend::Auto, mounted()), &["a.E01"]).await;
    f.service.mount("a.E01", None).await.unwrap();
    f.service.mount("a.E01", None).await.unwrap();

    assert!(!f.service.unmount("a.E01", false).await.unwrap());
    assert_eq!(f.mounter.release_count(), 0);
    assert_eq!(f.image("a.E01").await.ref_count, 1);

    assert!(f.service.unmount("a.E01", false).await.unwrap());
    assert_eq!(f.mounter.release_count(), 1);

    let image = f.image("a.E01").await;
    assert_eq!(image.ref_count, 0);
    assert_eq!(image.status, MountStatus::Unmounted);
    assert!(image.mountpoint.is_none());
    assert!(image.mount_handle.is_none());

    // Volume rows are kept, cleared in place
    let volumes = f.service.catalog().list_volumes(image.id).await.unwrap();
    assert_eq!(volumes.len(), 2);
    assert!(volumes.iter().all(|v| v.mountpoint.is_none() && v.status == MountStatus::Unmounted));
}

#[tokio::test]
async fn test_force_unmount_releases_all_consumers() {
    let f = fixture(MockMounter::new().always(MountBackend::Auto, mounted()), &["a.E01"]).await;
    for _ in 0..3 {
        f.service.mount("a.E01", None).await.unwrap();
    }

    assert!(f.service.unmount("a.E01", true).await.unwrap());
    assert_eq!(f.mounter.release_count(), 1);
    assert_eq!(f.image("a.E01").await.ref_count, 0);
}

#[tokio::test]
async fn test_unmount_of_unmounted_image_is_noop() {
    let f = fixture(MockMounter::new(), &["a.E01"]).await;

    assert!(f.service.unmount("a.E01", false).await.unwrap());
    assert_eq!(f.mounter.release_count(), 0);
}

#[tokio::test]
async fn test_unknown_image_is_not_in_catalog() {
    let f = fixture(MockMounter::new(), &[]).await;

    let err = f.service.mount("missing.E01", None).await.unwrap_err();
    assert!(matches!(err, TackError::NotInCatalog { .. }));
    assert!(err.is_retryable());

    let err = f.service.unmount("missing.E01", false).await.unwrap_err();
    assert!(matches!(err, TackError::NotInCatalog { .. }));
}

#[tokio::test]
async fn test_unreadable_image_leaves_no_claim() {
    let f = fixture(MockMounter::new().always(MountBackend::Auto, mounted()), &["a.E01"]).await;
    std::fs::remove_file(f.dir.path().join("images/a.E01")).unwrap();

    let err = f.service.mount("a.E01", None).await.unwrap_err();
    assert!(matches!(err, TackError::NotReadable { .. }));
    assert_eq!(f.image("a.E01").await.ref_count, 0);
    assert!(f.mounter.attempted_backends().is_empty());
}

#[tokio::test]
async fn test_fallback_backend_used_when_nothing_mounts() {
    let mounter = MockMounter::new()
        .always(MountBackend::Auto, nothing_mounted())
        .always(MountBackend::QemuNbd, mounted());
    let f = fixture(mounter, &["a.vmdk"]).await;

    let info = f.service.mount("a.vmdk", None).await.unwrap();
    assert_eq!(info.disk.mountpoint.as_deref(), Some("/mnt/tack/a"));
    assert_eq!(f.mounter.attempted_backends(), vec![MountBackend::Auto, MountBackend::QemuNbd]);

    let handle = f.image("a.vmdk").await.handle().unwrap().unwrap();
    assert_eq!(handle.backend, MountBackend::QemuNbd);
    assert_eq!(handle.disk_mountpoint.as_deref(), Some("/mnt/tack/a"));
}

#[tokio::test]
async fn test_no_mountable_volumes_after_fallback() {
    let mounter = MockMounter::new()
        .always(MountBackend::Auto, nothing_mounted())
        .always(MountBackend::QemuNbd, nothing_mounted());
    let f = fixture(mounter, &["a.dd"]).await;

    let err = f.service.mount("a.dd", None).await.unwrap_err();
    assert!(matches!(err, TackError::NoMountableVolumes { .. }));

    let image = f.image("a.dd").await;
    assert_eq!(image.ref_count, 0);
    assert_eq!(image.status, MountStatus::UnableToMount);
    assert!(image.mountpoint.is_none());
}

#[tokio::test]
async fn test_encrypted_image_without_key_asks_for_one() {
    let mounter = MockMounter::new()
        .always(MountBackend::Auto, luks_only())
        .always(MountBackend::QemuNbd, luks_only());
    let f = fixture(mounter, &["luks.dd"]).await;

    let err = f.service.mount("luks.dd", None).await.unwrap_err();
    match err {
        TackError::EncryptedImage { reason, .. } => {
            assert_eq!(reason, "Try mounting with a decryption key.")
        }
        other => panic!("unexpected error: {other}"),
    }

    let image = f.image("luks.dd").await;
    assert_eq!(image.ref_count, 0);
    assert_eq!(image.status, MountStatus::UnableToMount);
    assert_eq!(f.mounter.attempted_backends().len(), 2);
}

#[tokio::test]
async fn test_encrypted_image_with_wrong_key() {
    let mounter = MockMounter::new()
        .always(MountBackend::Auto, luks_only())
        .always(MountBackend::QemuNbd, luks_only());
    let f = fixture(mounter, &["luks.dd"]).await;

    let key = DecryptionKey::new(DecryptionMethod::LuksPassphrase, "wrong");
    let err = f.service.mount("luks.dd", Some(Credentials::single(0, &key))).await.unwrap_err();
    match err {
        TackError::EncryptedImage { reason, .. } => {
            assert_eq!(reason, "Incorrect decryption key provided.")
        }
        other => panic!("unexpected error: {other}"),
    }

    let requests = f.mounter.attempts.lock().unwrap().clone();
    assert!(requests.iter().all(|r| r.credentials.is_some()));
}

#[tokio::test]
async fn test_unexpected_disk_count_releases_partial_mounts() {
    let mut two = mounted();
    two.disks.push(two.disks[0].clone());
    let f = fixture(MockMounter::new().always(MountBackend::Auto, two), &["multi.E01"]).await;

    let err = f.service.mount("multi.E01", None).await.unwrap_err();
    assert!(matches!(err, TackError::UnexpectedDiskCount { count: 2, .. }));
    assert_eq!(f.mounter.release_count(), 1);
    assert_eq!(f.mounter.attempted_backends(), vec![MountBackend::Auto]);

    let image = f.image("multi.E01").await;
    assert_eq!(image.ref_count, 0);
    assert_eq!(image.status, MountStatus::UnableToMount);
}

#[tokio::test]
async fn test_duplicate_volume_group_persists_then_errors() {
    let lvm = DetectedVolume {
        volume_group: Some("vg_root".into()),
        duplicate_volume_group: true,
        volumes: vec![volume(Some("/mnt/tack/a/lv0"))],
        ..volume(None)
    };
    let parsed = single_disk(Some("/mnt/tack/a"), vec![volume(Some("/mnt/tack/a/0")), lvm]);
    let f = fixture(MockMounter::new().always(MountBackend::Auto, parsed), &["lvm.E01"]).await;

    let err = f.service.mount("lvm.E01", None).await.unwrap_err();
    assert!(
        matches!(err, TackError::DuplicateVolumeGroup { ref volume_group, .. } if volume_group == "vg_root")
    );
    assert_eq!(f.mounter.attempted_backends(), vec![MountBackend::Auto]);

    let image = f.image("lvm.E01").await;
    assert_eq!(image.status, MountStatus::Mounted);
    assert_eq!(image.ref_count, 1);

    let volumes = f.service.catalog().list_volumes(image.id).await.unwrap();
    let indexed: Vec<_> = volumes.iter().map(|v| (v.partition_index, v.mountpoint.as_deref())).collect();
    assert_eq!(indexed, vec![(0, Some("/mnt/tack/a/0")), (1, None), (2, Some("/mnt/tack/a/lv0"))]);
}

#[tokio::test]
async fn test_collaborator_failure_rolls_back_claim() {
    let mounter = MockMounter::new()
        .once(MountBackend::Auto, Err("helper crashed".into()))
        .always(MountBackend::Auto, mounted());
    let f = fixture(mounter, &["a.E01"]).await;

    let err = f.service.mount("a.E01", None).await.unwrap_err();
    assert!(matches!(err, TackError::MounterFailed { .. }));

    let image = f.image("a.E01").await;
    assert_eq!(image.ref_count, 0);
    assert_eq!(image.status, MountStatus::Unmounted);

    assert_eq!(f.service.mount("a.E01", None).await.unwrap().ref_count, 1);
}

#[tokio::test]
async fn test_concurrent_mount_reports_duplicate_attempt() {
    let mounter = MockMounter::new().always(MountBackend::Auto, mounted()).gated();
    let f = fixture(mounter, &["a.E01"]).await;

    let first = {
        let service = f.service.clone();
        tokio::spawn(async move { service.mount("a.E01", None).await })
    };

    f.mounter.gate.as_ref().unwrap().entered.notified().await;
    assert_eq!(f.image("a.E01").await.state(), ImageState::MountInFlight);

    let err = f.service.mount("a.E01", None).await.unwrap_err();
    assert!(matches!(err, TackError::DuplicateMountInProgress { .. }));
    assert!(err.is_retryable());

    let err = f.service.unmount("a.E01", false).await.unwrap_err();
    assert!(matches!(err, TackError::DuplicateMountInProgress { .. }));

    f.mounter.gate.as_ref().unwrap().open.add_permits(1);
    let info = first.await.unwrap().unwrap();
    assert_eq!(info.ref_count, 1);
    assert_eq!(f.mounter.attempted_backends().len(), 1);
}

#[tokio::test]
async fn test_dropped_mount_request_still_settles() {
    let mounter = MockMounter::new().always(MountBackend::Auto, mounted()).gated();
    let f = fixture(mounter, &["a.E01"]).await;
    let gate = f.mounter.gate.as_ref().unwrap();

    {
        let mount =
            tokio::time::timeout(std::time::Duration::from_secs(5), f.service.mount("a.E01", None));
        tokio::pin!(mount);
        tokio::select! {
            _ = &mut mount => panic!("mount finished while the collaborator was held"),
            _ = gate.entered.notified() => {}
        }
    }
    assert_eq!(f.image("a.E01").await.state(), ImageState::MountInFlight);

    gate.open.add_permits(1);
    let mut state = ImageState::MountInFlight;
    for _ in 0..200 {
        state = f.image("a.E01").await.state();
        if state != ImageState::MountInFlight {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(state, ImageState::Mounted);
    assert_eq!(f.image("a.E01").await.ref_count, 1);

    assert_eq!(f.service.mount("a.E01", None).await.unwrap().ref_count, 2);
    assert!(f.service.unmount("a.E01", true).await.unwrap());
    assert_eq!(f.image("a.E01").await.state(), ImageState::Unmounted);
    assert_eq!(f.mounter.release_count(), 1);
}

#[tokio::test]
async fn test_dropped_mount_request_rolls_back_failure() {
    let mounter = MockMounter::new().refuse("a.E01").gated();
    let f = fixture(mounter, &["a.E01"]).await;
    let gate = f.mounter.gate.as_ref().unwrap();

    {
        let mount = f.service.mount("a.E01", None);
        tokio::pin!(mount);
        tokio::select! {
            _ = &mut mount => panic!("mount finished while the collaborator was held"),
            _ = gate.entered.notified() => {}
        }
    }

    // Auto and the fallback backend both pass through the gate
    gate.open.add_permits(2);
    let mut image = f.image("a.E01").await;
    for _ in 0..200 {
        if image.state() != ImageState::MountInFlight {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        image = f.image("a.E01").await;
    }
    assert_eq!(image.ref_count, 0);
    assert_eq!(image.status, MountStatus::UnableToMount);
}

#[tokio::test]
async fn test_stale_snapshot_joins_completed_mount() {
    let f = fixture(MockMounter::new().always(MountBackend::Auto, mounted()), &["a.E01"]).await;
    let stale = f.image("a.E01").await;
    assert_eq!(stale.state(), ImageState::Unmounted);

    f.service.mount("a.E01", None).await.unwrap();

    match f.service.begin_mount(&stale).await.unwrap() {
        MountEntry::Shared(info) => assert_eq!(info.ref_count, 2),
        MountEntry::Claimed(_) => panic!("claimed an image that is already mounted"),
    }
    assert_eq!(f.mounter.attempted_backends().len(), 1);
}

#[tokio::test]
async fn test_partially_mounted_disk_holds_a_mount() {
    let parsed = single_disk(None, vec![volume(Some("/mnt/tack/a/0"))]);
    let f = fixture(MockMounter::new().always(MountBackend::Auto, parsed), &["a.E01"]).await;

    let info = f.service.mount("a.E01", None).await.unwrap();
    assert!(info.disk.mountpoint.is_none());

    let image = f.image("a.E01").await;
    assert_eq!(image.status, MountStatus::UnableToMount);
    assert_eq!(image.state(), ImageState::PartiallyMounted);
    assert!(f.service.get("a.E01").await.unwrap().is_some());

    assert_eq!(f.service.mount("a.E01", None).await.unwrap().ref_count, 2);
    assert_eq!(f.mounter.attempted_backends().len(), 1);

    assert!(f.service.unmount("a.E01", true).await.unwrap());
    assert_eq!(f.mounter.release_count(), 1);
    assert_eq!(f.image("a.E01").await.state(), ImageState::Unmounted);
}

#[tokio::test]
async fn test_release_failure_keeps_catalog_state() {
    let f = fixture(MockMounter::new().always(MountBackend::Auto, mounted()), &["a.E01"]).await;
    f.service.mount("a.E01", None).await.unwrap();
    f.mounter.fail_releases(true);

    let err = f.service.unmount("a.E01", false).await.unwrap_err();
    assert!(matches!(err, TackError::UnmountFailed { .. }));

    let image = f.image("a.E01").await;
    assert_eq!(image.ref_count, 1);
    assert_eq!(image.status, MountStatus::Mounted);

    f.mounter.fail_releases(false);
    assert!(f.service.unmount("a.E01", false).await.unwrap());
}

#[tokio::test]
async fn test_manual_mount_round_trip() {
    let f = fixture(MockMounter::new(), &["a.E01"]).await;
    let manual = f.manual_dir();

    assert!(f.service.register_manual_mount("a.E01", &manual).await.unwrap());

    let image = f.image("a.E01").await;
    assert_eq!(image.status, MountStatus::ManualMount);
    assert_eq!(image.ref_count, 1);
    assert_eq!(image.mountpoint.as_deref(), manual.to_str());

    // Mounting a manual mount is a fast-path reference
    let info = f.service.mount("a.E01", None).await.unwrap();
    assert_eq!(info.ref_count, 2);
    assert_eq!(info.disk.volumes.len(), 1);
    assert_eq!(info.disk.volumes[0].status, MountStatus::ManualMount);

    assert!(f.service.unmount("a.E01", true).await.unwrap());
    assert!(f.mounter.attempted_backends().is_empty());
    assert_eq!(f.mounter.release_count(), 0);

    let image = f.image("a.E01").await;
    assert_eq!(image.ref_count, 0);
    assert!(image.mountpoint.is_none());
    assert!(f.service.catalog().list_volumes(image.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_manual_mount_preconditions() {
    let f = fixture(MockMounter::new().always(MountBackend::Auto, mounted()), &["a.E01"]).await;
    let manual = f.manual_dir();

    assert!(!f.service.register_manual_mount("a.E01", Path::new("")).await.unwrap());
    assert!(!f.service.register_manual_mount("a.E01", &manual.join("missing")).await.unwrap());
    let file = f.dir.path().join("images/a.E01");
    assert!(!f.service.register_manual_mount("a.E01", &file).await.unwrap());

    let err = f.service.register_manual_mount("missing.E01", &manual).await.unwrap_err();
    assert!(matches!(err, TackError::NotInCatalog { .. }));

    f.service.mount("a.E01", None).await.unwrap();
    assert!(!f.service.register_manual_mount("a.E01", &manual).await.unwrap());
    assert_eq!(f.image("a.E01").await.status, MountStatus::Mounted);
}

#[tokio::test]
async fn test_unmount_all_continues_past_failures() {
    let f = fixture(
        MockMounter::new().always(MountBackend::Auto, mounted()),
        &["a.E01", "b.E01", "c.E01", "d.E01"],
    )
    .await;
    f.service.mount("a.E01", None).await.unwrap();
    f.service.mount("a.E01", None).await.unwrap();
    f.service.register_manual_mount("b.E01", &f.manual_dir()).await.unwrap();
    f.service.mount("c.E01", None).await.unwrap();

    f.mounter.fail_releases(true);
    let report = f.service.unmount_all(false).await.unwrap();
    assert_eq!(report.still_referenced, vec!["a.E01"]);
    assert_eq!(report.released, vec!["b.E01"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "c.E01");

    f.mounter.fail_releases(false);
    let report = f.service.unmount_all(true).await.unwrap();
    assert_eq!(report.released, vec!["a.E01", "c.E01"]);
    assert!(report.failed.is_empty());
    assert!(f.service.list_mounted().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reads_and_listing() {
    let f = fixture(MockMounter::new().always(MountBackend::Auto, mounted()), &["case/a.E01", "b.dd"])
        .await;
    f.service.mount("case/a.E01", None).await.unwrap();

    assert!(f.service.get("b.dd").await.unwrap().is_none());
    assert_eq!(f.service.get("case/a.E01").await.unwrap().unwrap().ref_count, 1);
    assert_eq!(f.service.list_mounted().await.unwrap().len(), 1);

    let summaries = f.service.list_images().await.unwrap();
    assert_eq!(summaries.len(), 2);

    let b = summaries.iter().find(|s| s.rel_path == "b.dd").unwrap();
    assert!(b.volumes.is_empty());

    let a = summaries.iter().find(|s| s.rel_path == "case/a.E01").unwrap();
    assert_eq!(a.status, MountStatus::Mounted);
    let uids: Vec<_> = a.volumes.iter().map(|v| v.uid.as_str()).collect();
    assert_eq!(uids, vec!["case_a-E01_0", "case_a-E01_1"]);
}

#[tokio::test]
async fn test_recover_interrupted_mounts() {
    let f = fixture(MockMounter::new().always(MountBackend::Auto, mounted()), &["a.E01"]).await;
    let id = f.image("a.E01").await.id;
    f.service.catalog().claim_mount(id).await.unwrap();

    let err = f.service.mount("a.E01", None).await.unwrap_err();
    assert!(matches!(err, TackError::DuplicateMountInProgress { .. }));

    assert_eq!(f.service.recover_interrupted_mounts().await.unwrap(), 1);
    assert_eq!(f.service.mount("a.E01", None).await.unwrap().ref_count, 1);
    assert_eq!(f.service.recover_interrupted_mounts().await.unwrap(), 0);
}

#[tokio::test]
async fn test_supported_tools_passthrough() {
    let f = fixture(MockMounter::new(), &[]).await;
    let tools = f.service.supported_tools().await.unwrap();
    assert_eq!(tools.get("qemu-nbd"), Some(&true));
    assert_eq!(tools.get("xmount"), Some(&false));
}

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Mount(usize),
        Unmount(usize, bool),
        Manual(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..2usize).prop_map(Op::Mount),
            (0..2usize, any::<bool>()).prop_map(|(i, force)| Op::Unmount(i, force)),
            (0..2usize).prop_map(Op::Manual),
        ]
    }

    const IMAGES: [&str; 2] = ["good.E01", "bad.dd"];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn ref_count_zero_iff_no_mountpoint(ops in proptest::collection::vec(op(), 1..24)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let mounter = MockMounter::new().always(MountBackend::Auto, mounted()).refuse("bad.dd");
                let f = fixture(mounter, &IMAGES).await;
                let manual = f.manual_dir();

                for op in ops {
                    let _ = match op {
                        Op::Mount(i) => f.service.mount(IMAGES[i], None).await.map(|_| ()),
                        Op::Unmount(i, force) => f.service.unmount(IMAGES[i], force).await.map(|_| ()),
                        Op::Manual(i) => {
                            f.service.register_manual_mount(IMAGES[i], &manual).await.map(|_| ())
                        }
                    };

                    for image in f.service.catalog().list_images().await.unwrap() {
                        assert_eq!(
                            image.ref_count == 0,
                            image.mountpoint.is_none(),
                            "{} violates the ref-count invariant: {:?}",
                            image.rel_path,
                            image
                        );
                        assert_ne!(image.state(), ImageState::MountInFlight);
                    }
                }
            });
        }
    }
}
