//! End-to-end runs of the orchestrator against the simulated ECU.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;

use ecuflash_core::backup::verify_file;
use ecuflash_core::{
    AuthError, ChannelObserver, DeviceProfile, FinalizeMode, FlashError, FlashEvent, FlashFailure,
    FlashReport, FlashSession, FlashState, IntegrityError, Nrc, SafetyAbort, SessionConfig,
    SimulatedBus,
};
use tempfile::TempDir;

const STAGING_SIZE: u32 = 64 * 256;

struct Fixture {
    dir: TempDir,
    bus: SimulatedBus,
    config: SessionConfig,
    image: Vec<u8>,
}

fn profile() -> DeviceProfile {
    let mut profile = DeviceProfile::default().without_delays();
    profile.name = "sim".into();
    profile.timing.p2_ms = 20;
    profile.timing.p2_star_ms = 50;
    profile.memory.read_size = 0x8000;
    profile.memory.staging_offset = 0x2000;
    profile.memory.staging_size = STAGING_SIZE;
    profile
}

fn fixture(profile: DeviceProfile) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let bus = SimulatedBus::new(&profile);

    let image: Vec<u8> = (0..STAGING_SIZE as usize)
        .map(|i| (i as u8) ^ 0xA5)
        .collect();
    let image_path = dir.path().join("image.bin");
    std::fs::write(&image_path, &image).unwrap();
    let credential_path = dir.path().join("credential.bin");
    std::fs::write(&credential_path, bus.credential()).unwrap();

    let config = SessionConfig {
        image_path,
        credential_path,
        backup_locations: vec![dir.path().join("backup-a"), dir.path().join("backup-b")],
        audit_dir: dir.path().join("logs"),
        profile,
    };
    Fixture {
        dir,
        bus,
        config,
        image,
    }
}

fn run(f: &Fixture) -> (Result<FlashReport, FlashFailure>, Vec<FlashEvent>) {
    let (tx, rx) = mpsc::channel();
    let session = FlashSession::with_observer(
        f.config.clone(),
        f.bus.clone(),
        Arc::new(ChannelObserver::new(tx)),
    );
    let result = session.run();
    drop(session);
    (result, rx.try_iter().collect())
}

/// RequestDownload requests aimed at the staging region.
fn staging_downloads(f: &Fixture) -> usize {
    let address = f.config.profile.memory.staging_address.to_be_bytes();
    f.bus
        .requests()
        .iter()
        .filter(|r| r[0] == 0x34 && r.len() >= 7 && r[3..7] == address)
        .count()
}

fn audit_text(failure: &FlashFailure) -> String {
    std::fs::read_to_string(failure.audit_path.as_ref().unwrap()).unwrap()
}

fn states(events: &[FlashEvent]) -> Vec<FlashState> {
    events
        .iter()
        .filter_map(|e| match e {
            FlashEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

#[test]
fn test_full_run_succeeds() {
    let f = fixture(profile());
    let original_staging = f.bus.staging();
    let (result, events) = run(&f);
    let report = result.unwrap();

    assert_eq!(f.bus.staging(), f.image);
    assert_eq!(report.bytes_written, STAGING_SIZE as usize);
    assert_eq!(report.backups.len(), 2);
    assert_eq!(report.warnings, 0);

    // Staging backup holds the pre-write contents.
    let staging_backup = report.backups[0]
        .to_string_lossy()
        .replace("_full.bin", "_staging.bin");
    assert_eq!(
        verify_file(&PathBuf::from(staging_backup)).unwrap(),
        original_staging
    );

    assert!(f.bus.received(0x37), "transfer exit sent");
    assert!(f.bus.received(0x11), "device reset");
    assert_eq!(
        states(&events),
        vec![
            FlashState::LoadCredential,
            FlashState::Connect,
            FlashState::QualityCheck,
            FlashState::Backup,
            FlashState::BackupVerify,
            FlashState::Write,
            FlashState::Reset,
            FlashState::Verify,
            FlashState::DoubleVerify,
            FlashState::Done,
        ]
    );
    assert!(matches!(
        events.last(),
        Some(FlashEvent::Finished { success: true })
    ));
    assert!(events.iter().any(|e| matches!(e, FlashEvent::Frame { .. })));

    let audit = std::fs::read_to_string(&report.audit_path).unwrap();
    assert!(audit.lines().last().unwrap().contains("Run finished: PASS"));
}

#[test]
fn test_reset_and_clear_variant() {
    let mut profile = profile();
    profile.finalize = FinalizeMode::ResetAndClear;
    let f = fixture(profile);
    let (result, _) = run(&f);
    result.unwrap();
    assert!(!f.bus.received(0x37));
    assert!(f.bus.received(0x14));
    assert_eq!(f.bus.staging(), f.image);
}

#[test]
fn test_no_write_without_verified_backup() {
    let mut f = fixture(profile());
    // Regular files where directories are expected: every location fails.
    let blockers: Vec<PathBuf> = (0..2).map(|i| f.dir.path().join(format!("file{i}"))).collect();
    for b in &blockers {
        std::fs::write(b, b"x").unwrap();
    }
    f.config.backup_locations = blockers;

    let (result, events) = run(&f);
    let failure = result.unwrap_err();
    assert_eq!(failure.state, FlashState::BackupVerify);
    assert!(matches!(
        failure.error,
        FlashError::Safety(SafetyAbort::InsufficientBackups { verified: 0, .. })
    ));
    assert!(failure.backup_path.is_none());
    assert_eq!(staging_downloads(&f), 0);
    assert!(f.bus.transfer_lengths().is_empty());
    assert!(!states(&events).contains(&FlashState::Write));
}

#[test]
fn test_bus_quality_gate() {
    let mut profile = profile();
    profile.safety.quality_pings = 50;
    let f = fixture(profile);
    f.bus.drop_keepalives(3);

    let (result, _) = run(&f);
    let failure = result.unwrap_err();
    assert_eq!(failure.state, FlashState::QualityCheck);
    match failure.error {
        FlashError::Safety(SafetyAbort::BusQuality {
            successes, total, ..
        }) => {
            assert_eq!(successes, 47);
            assert_eq!(total, 50);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(staging_downloads(&f), 0);
    assert!(!f.bus.received(0x36));
}

#[test]
fn test_interrupted_write_reports_backup() {
    let f = fixture(profile());
    f.bus.fail_write_block(5, Nrc::GeneralProgrammingFailure);

    let (result, _) = run(&f);
    let failure = result.unwrap_err();
    assert_eq!(failure.state, FlashState::Write);
    assert!(matches!(
        failure.error,
        FlashError::BlockFailed {
            block: 5,
            total: 64,
            ..
        }
    ));
    assert_eq!(failure.last_block, Some(4));

    let backup = failure.backup_path.clone().unwrap();
    let audit = audit_text(&failure);
    assert!(audit.contains(&backup.display().to_string()));
    assert!(audit.contains("Last block acknowledged by the device: 4"));
    assert!(audit.contains("States visited: PREFLIGHT > LOAD_CREDENTIAL"));
    assert!(audit.contains("BACKUP_VERIFY > WRITE > FAILED"));
    assert!(!f.bus.received(0x11), "no reset after a partial write");
}

#[test]
fn test_rejected_key_stops_run() {
    let f = fixture(profile());
    f.bus.reject_key(Some(Nrc::SecurityAccessDenied));

    let (result, _) = run(&f);
    let failure = result.unwrap_err();
    assert_eq!(failure.state, FlashState::Backup);
    match &failure.error {
        FlashError::Auth(AuthError::Exhausted { attempts, last }) => {
            assert_eq!(*attempts, 5);
            assert!(matches!(
                **last,
                AuthError::KeyRejected(Nrc::SecurityAccessDenied)
            ));
        }
        other => panic!("unexpected error: {other}"),
    }

    let requests = f.bus.requests();
    let last = requests.last().unwrap();
    assert_eq!(&last[..2], &[0x27, 0x02], "nothing sent after the final key");
    assert!(!f.bus.received(0x35));
}

#[test]
fn test_verify_mismatch_fails() {
    let f = fixture(profile());
    f.bus.corrupt_write_at(100);

    let (result, _) = run(&f);
    let failure = result.unwrap_err();
    assert_eq!(failure.state, FlashState::Verify);
    assert!(matches!(
        failure.error,
        FlashError::Integrity(IntegrityError::VerifyMismatch {
            pass: 1,
            differing: 1,
            first: Some(100),
        })
    ));
    assert!(failure.last_block.is_none());
}

#[test]
fn test_preflight_rejects_wrong_image_size() {
    let f = fixture(profile());
    std::fs::write(&f.config.image_path, [0u8; 100]).unwrap();

    let (result, _) = run(&f);
    let failure = result.unwrap_err();
    assert_eq!(failure.state, FlashState::Preflight);
    assert!(matches!(
        failure.error,
        FlashError::Safety(SafetyAbort::Preflight(_))
    ));
    assert!(f.bus.requests().is_empty(), "no device contact");
}

#[test]
fn test_preflight_requires_credential() {
    let mut f = fixture(profile());
    f.config.credential_path = f.dir.path().join("missing.bin");
    let (result, _) = run(&f);
    assert_eq!(result.unwrap_err().state, FlashState::Preflight);
    assert!(f.bus.requests().is_empty());
}

#[test]
fn test_cancelled_run_never_contacts_device() {
    let f = fixture(profile());
    let session = FlashSession::new(f.config.clone(), f.bus.clone());
    session.cancel_token().cancel();
    let failure = session.run().unwrap_err();
    assert!(matches!(failure.error, FlashError::Cancelled));
    assert!(f.bus.requests().is_empty());
}

#[test]
fn test_backup_only_run() {
    let f = fixture(profile());
    let session = FlashSession::new(f.config.clone(), f.bus.clone());
    let (report, outcome) = session.backup().unwrap();

    assert_eq!(outcome.verified(), 2);
    assert_eq!(report.bytes_written, 0);
    assert_eq!(staging_downloads(&f), 0);
    let staging = verify_file(&outcome.copies[1].staging_path).unwrap();
    assert_eq!(staging, f.bus.staging());
    let full = verify_file(&outcome.copies[0].full_path).unwrap();
    assert_eq!(full, f.bus.read_region());
}

#[test]
fn test_privilege_expiry_is_recovered() {
    let f = fixture(profile());
    f.bus.expire_privileges_after(10);
    let (result, _) = run(&f);
    result.unwrap();
    assert_eq!(f.bus.staging(), f.image);
}

#[test]
fn test_transient_block_failure_is_retried() {
    let f = fixture(profile());
    f.bus.fail_write_block_once(7, Nrc::BusyRepeatRequest);
    let (result, _) = run(&f);
    let report = result.unwrap();
    assert_eq!(report.bytes_written, STAGING_SIZE as usize);
    assert_eq!(f.bus.transfer_lengths().len(), 65);
}

#[test]
fn test_quality_threshold_must_be_exceeded() {
    // 19/20 sits exactly on the 95% threshold.
    let mut profile = profile();
    profile.safety.quality_pings = 20;
    let f = fixture(profile);
    f.bus.drop_keepalives(1);
    let (result, _) = run(&f);
    let failure = result.unwrap_err();
    assert_eq!(failure.state, FlashState::QualityCheck);
    assert!(matches!(
        failure.error,
        FlashError::Safety(SafetyAbort::BusQuality {
            successes: 19,
            total: 20,
            ..
        })
    ));
    assert!(!f.bus.received(0x27));
}

#[test]
fn test_duplicate_backup_location_counts_once() {
    let mut f = fixture(profile());
    let location = f.dir.path().join("backup-a");
    f.config.backup_locations = vec![location.clone(), location];

    let (result, _) = run(&f);
    let report = result.unwrap();
    assert_eq!(report.backups.len(), 1);
    // Duplicate location plus falling short of the target of two.
    assert_eq!(report.warnings, 2);
}

#[test]
fn test_unlock_count_per_run() {
    let f = fixture(profile());
    let (result, _) = run(&f);
    result.unwrap();

    // Backup: 1 + 3 renewals over 128 uploads. Write: 1.
    // Each verify pass: 1 + 1 renewal over 64 uploads.
    let seeds = f
        .bus
        .requests()
        .iter()
        .filter(|r| r.as_slice() == [0x27, 0x01])
        .count();
    assert_eq!(seeds, 9);
}
