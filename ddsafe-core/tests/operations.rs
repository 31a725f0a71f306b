//! End-to-end operations through the Coordinator: gate, confirmation,
//! transfer with the real `dd`, verification and journal.

mod common;

use common::{
    MemoryCatalog, ScriptExecutor, ScriptedConfirmer, device, file_device, sha256_file,
};
use ddsafe_core::journal::Journal;
use ddsafe_core::{
    ChecksumAlgorithm, Coordinator, DdExecutor, Error, FillPattern, Integrity, OperationKind,
    OperationStatus, ProgressObserver, RequestBuilder, TransferProgress, Violation,
};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::tempdir;

const GB: u64 = 1_000_000_000;

fn running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

fn coordinator<E: ddsafe_core::Executor + Clone>(
    catalog: MemoryCatalog,
    executor: E,
) -> Coordinator<MemoryCatalog, E> {
    Coordinator::new(catalog, executor)
        .progress_interval(Duration::from_millis(20))
        .kill_grace(Duration::from_millis(500))
}

#[derive(Default)]
struct Recorder {
    started: Option<Option<u64>>,
    transfer: Vec<TransferProgress>,
    verify_total: Option<Option<u64>>,
    verify_last: u64,
}

impl ProgressObserver for Recorder {
    fn transfer_started(&mut self, total: Option<u64>) {
        self.started = Some(total);
    }

    fn transfer_progress(&mut self, progress: &TransferProgress) {
        self.transfer.push(progress.clone());
    }

    fn verification_started(&mut self, total: Option<u64>) {
        self.verify_total = Some(total);
    }

    fn verification_progress(&mut self, bytes: u64) {
        self.verify_last = bytes;
    }
}

#[test]
fn backup_then_restore_round_trips() {
    let dir = tempdir().unwrap();
    let size = (1 << 20) + 4096;
    let disk = file_device(dir.path(), "disk", size, 3);
    let spare = file_device(dir.path(), "spare", size, 0);
    let image = dir.path().join("disk.img");
    let journal_path = dir.path().join("ops.log");

    let coordinator = coordinator(
        MemoryCatalog::new(vec![disk.clone(), spare.clone()]),
        DdExecutor::default(),
    )
    .journal(Some(Journal::new(&journal_path)));

    let backup = RequestBuilder::new(OperationKind::Backup)
        .source_device(disk.clone())
        .target_image(&image)
        .build()
        .unwrap();
    let mut recorder = Recorder::default();
    let outcome = coordinator
        .run(backup, &mut ScriptedConfirmer::accept(), running(), &mut recorder)
        .unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.integrity, Integrity::Verified);
    assert_eq!(recorder.started, Some(Some(size as u64)));
    assert_eq!(recorder.verify_total, Some(Some(2 * size as u64)));
    assert_eq!(recorder.verify_last, 2 * size as u64);

    let restore = RequestBuilder::new(OperationKind::Restore)
        .source_image(&image)
        .unwrap()
        .target_device(spare.clone())
        .build()
        .unwrap();
    let outcome = coordinator
        .run(restore, &mut ScriptedConfirmer::accept(), running(), &mut ())
        .unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);

    let verification = outcome.verification.expect("sha256 is the restore default");
    assert_eq!(verification.algorithm, ChecksumAlgorithm::Sha256);
    assert!(verification.matched);
    assert_eq!(sha256_file(&disk.path), sha256_file(&spare.path));
    assert_eq!(verification.destination_digest, sha256_file(&spare.path));

    let log = std::fs::read_to_string(&journal_path).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains(" backup ") && lines[0].contains("verify=sha256:match"));
    assert!(lines[1].contains(" restore ") && lines[1].contains(" succeeded "));
}

#[test]
fn compressed_image_restores_through_stdin() {
    let dir = tempdir().unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let image = dir.path().join("disk.img.gz");
    let mut encoder =
        flate2::write::GzEncoder::new(std::fs::File::create(&image).unwrap(), flate2::Compression::fast());
    encoder.write_all(&payload).unwrap();
    encoder.finish().unwrap();

    let target = file_device(dir.path(), "target", 256 * 1024, 0);
    let coordinator = coordinator(MemoryCatalog::new(vec![target.clone()]), DdExecutor::default());

    let request = RequestBuilder::new(OperationKind::Restore)
        .source_image(&image)
        .unwrap()
        .target_device(target.clone())
        .checksum(ChecksumAlgorithm::Md5)
        .build()
        .unwrap();
    let mut recorder = Recorder::default();
    let outcome = coordinator
        .run(request, &mut ScriptedConfirmer::accept(), running(), &mut recorder)
        .unwrap();

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(recorder.started, Some(None));
    let progress = outcome.progress.unwrap();
    assert_eq!(progress.bytes_copied, payload.len() as u64);
    assert_eq!(progress.total_bytes, Some(payload.len() as u64));
    assert_eq!(outcome.integrity, Integrity::Verified);

    let written = std::fs::read(&target.path).unwrap();
    assert_eq!(&written[..payload.len()], &payload[..]);
}

#[test]
fn zero_wipe_without_checksum_has_no_verification() {
    let dir = tempdir().unwrap();
    let target = file_device(dir.path(), "usb", 64 * 1024, 9);
    let coordinator = coordinator(MemoryCatalog::new(vec![target.clone()]), DdExecutor::default());

    let request = RequestBuilder::new(OperationKind::Wipe)
        .target_device(target.clone())
        .build()
        .unwrap();
    assert_eq!(request.checksum(), ChecksumAlgorithm::None);

    let outcome = coordinator
        .run(request, &mut ScriptedConfirmer::accept(), running(), &mut ())
        .unwrap();
    assert_eq!(outcome.status, OperationStatus::Succeeded, "{:?}", outcome.error);
    assert!(outcome.verification.is_none());
    assert_eq!(outcome.integrity, Integrity::Unverified);
    assert!(std::fs::read(&target.path).unwrap().iter().all(|&b| b == 0));
}

#[test]
fn zero_wipe_can_be_verified() {
    let dir = tempdir().unwrap();
    let target = file_device(dir.path(), "usb", 64 * 1024, 9);
    let coordinator = coordinator(MemoryCatalog::new(vec![target.clone()]), DdExecutor::default());

    let request = RequestBuilder::new(OperationKind::Wipe)
        .fill(FillPattern::Zero, 2)
        .target_device(target)
        .checksum(ChecksumAlgorithm::Sha256)
        .build()
        .unwrap();
    let outcome = coordinator
        .run(request, &mut ScriptedConfirmer::accept(), running(), &mut ())
        .unwrap();

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.progress.as_ref().unwrap().bytes_copied, 2 * 64 * 1024);
    assert!(outcome.verification.unwrap().matched);
    assert_eq!(outcome.integrity, Integrity::Verified);
}

#[test]
fn equal_size_clone_succeeds() {
    let source = device("/dev/sda", 8 * GB);
    let target = device("/dev/sdb", 8 * GB);
    let catalog = MemoryCatalog::new(vec![source.clone(), target.clone()]);
    let script = r#"echo "8000000000 bytes (8.0 GB, 7.5 GiB) copied, 40 s, 200 MB/s" >&2"#;
    let coordinator = coordinator(catalog, ScriptExecutor::new(script));

    let request = RequestBuilder::new(OperationKind::Clone)
        .source_device(source)
        .target_device(target)
        .checksum(ChecksumAlgorithm::None)
        .build()
        .unwrap();
    let mut confirmer = ScriptedConfirmer::accept();
    let outcome = coordinator
        .run(request, &mut confirmer, running(), &mut ())
        .unwrap();

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.progress.unwrap().bytes_copied, 8 * GB);
    assert_eq!(confirmer.shown.len(), 1);
    assert_eq!(confirmer.shown[0].kind, OperationKind::Clone);
    assert_eq!(confirmer.shown[0].data_at_risk, Some(8 * GB));
}

#[test]
fn smaller_destination_never_reaches_the_executor() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let source = device("/dev/sda", 8 * GB);
    let target = device("/dev/sdb", 4 * GB);
    let coordinator = coordinator(
        MemoryCatalog::new(vec![source.clone(), target.clone()]),
        ScriptExecutor::new(format!("touch '{}'", marker.display())),
    );

    let request = RequestBuilder::new(OperationKind::Clone)
        .source_device(source)
        .target_device(target)
        .build()
        .unwrap();
    let mut confirmer = ScriptedConfirmer::accept();
    let err = coordinator
        .run(request, &mut confirmer, running(), &mut ())
        .unwrap_err();

    match err {
        Error::Validation(violations) => assert_eq!(
            violations.0,
            vec![Violation::DestinationTooSmall {
                required: 8 * GB,
                available: 4 * GB
            }]
        ),
        other => panic!("unexpected error: {other}"),
    }
    assert!(confirmer.shown.is_empty());
    assert!(!marker.exists());
}

#[test]
fn backup_onto_a_device_never_reaches_the_executor() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let source = file_device(dir.path(), "disk", 4096, 3);
    let coordinator = coordinator(
        MemoryCatalog::new(vec![source.clone()]),
        ScriptExecutor::new(format!("touch '{}'", marker.display())),
    );

    for image in [source.path.clone(), "/dev/null".into()] {
        let request = RequestBuilder::new(OperationKind::Backup)
            .source_device(source.clone())
            .target_image(&image)
            .build()
            .unwrap();
        let err = coordinator
            .run(request, &mut ScriptedConfirmer::accept(), running(), &mut ())
            .unwrap_err();
        assert!(
            matches!(
                &err,
                Error::Validation(v)
                    if matches!(v.0[..], [Violation::SameDevice(_) | Violation::ImageNotAFile(_)])
            ),
            "{}: {err}",
            image.display()
        );
    }
    assert!(!marker.exists());
    assert_eq!(std::fs::metadata(&source.path).unwrap().len(), 4096);
}

#[test]
fn declined_confirmation_never_reaches_the_executor() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let target = device("/dev/sdb", GB);
    let coordinator = coordinator(
        MemoryCatalog::new(vec![target.clone()]),
        ScriptExecutor::new(format!("touch '{}'", marker.display())),
    );

    let request = RequestBuilder::new(OperationKind::Wipe)
        .target_device(target)
        .build()
        .unwrap();
    let outcome = coordinator
        .run(request, &mut ScriptedConfirmer::decline(), running(), &mut ())
        .unwrap();

    assert_eq!(outcome.status, OperationStatus::Aborted);
    assert!(outcome.progress.is_none());
    assert!(!marker.exists());
}

#[test]
fn mounted_restore_target_is_rejected_unless_unmount_requested() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("small.img");
    std::fs::write(&image, vec![1u8; 4096]).unwrap();

    let mut target = device("/dev/sdb", GB);
    target.mount_points = vec!["/media/usb".to_string()];
    let script = r#"echo "4096 bytes copied" >&2"#;

    let coordinator = coordinator(
        MemoryCatalog::new(vec![target.clone()]),
        ScriptExecutor::new(script),
    );
    let request = RequestBuilder::new(OperationKind::Restore)
        .source_image(&image)
        .unwrap()
        .target_device(target.clone())
        .checksum(ChecksumAlgorithm::None)
        .build()
        .unwrap();
    let err = coordinator
        .run(request, &mut ScriptedConfirmer::accept(), running(), &mut ())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(v) if matches!(v.0[..], [Violation::DestinationMounted { .. }])
    ));

    let forced = RequestBuilder::new(OperationKind::Restore)
        .source_image(&image)
        .unwrap()
        .target_device(target.clone())
        .checksum(ChecksumAlgorithm::None)
        .force_unmount(true)
        .build()
        .unwrap();
    let outcome = coordinator
        .run(forced, &mut ScriptedConfirmer::accept(), running(), &mut ())
        .unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(
        *coordinator.catalog().unmounted.lock().unwrap(),
        vec![target.path.clone()]
    );
}

#[test]
fn device_that_changed_after_confirmation_is_rejected() {
    let target = device("/dev/sdb", GB);
    let catalog = MemoryCatalog::new(vec![]);
    catalog.replace(device("/dev/sdb", 2 * GB));
    let coordinator = coordinator(catalog, ScriptExecutor::new("exit 0"));

    let request = RequestBuilder::new(OperationKind::Wipe)
        .target_device(target)
        .build()
        .unwrap();
    let err = coordinator
        .run(request, &mut ScriptedConfirmer::accept(), running(), &mut ())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(v) if matches!(v.0[..], [Violation::DeviceChanged(_)])
    ));
}

#[test]
fn verification_mismatch_is_a_warning_not_a_failure() {
    let dir = tempdir().unwrap();
    let source = file_device(dir.path(), "src", 8192, 1);
    let target = file_device(dir.path(), "dst", 8192, 2);
    // Reports a full copy without writing anything.
    let script = r#"echo "8192 bytes copied" >&2"#;
    let coordinator = coordinator(
        MemoryCatalog::new(vec![source.clone(), target.clone()]),
        ScriptExecutor::new(script),
    );

    let request = RequestBuilder::new(OperationKind::Clone)
        .source_device(source)
        .target_device(target)
        .build()
        .unwrap();
    let outcome = coordinator
        .run(request, &mut ScriptedConfirmer::accept(), running(), &mut ())
        .unwrap();

    assert_eq!(outcome.status, OperationStatus::Succeeded);
    assert_eq!(outcome.integrity, Integrity::Mismatch);
    assert!(matches!(
        outcome.verification_warning(),
        Some(Error::VerificationMismatch { .. })
    ));
}
