//! Region backup and the backup gate.

use chrono::Utc;

use super::StepContext;
use crate::audit::AuditLevel;
use crate::backup::{BackupStore, verify_file};
use crate::error::{FlashError, SafetyAbort};
use crate::events::FlashObserver;
use crate::memory::extract_subregion;
use crate::transport::CanBus;

/// BACKUP - authenticate, read the region and persist it everywhere.
pub fn backup<B: CanBus, O: FlashObserver>(
    ctx: &mut StepContext<'_, B, O>,
) -> Result<(), FlashError> {
    let auth = ctx.authenticator()?;
    let memory = ctx.memory(&auth);
    let layout = ctx.profile.memory.clone();

    memory.authenticate()?;
    ctx.log(
        AuditLevel::Info,
        format!(
            "Reading 0x{:X} bytes at 0x{:08X}",
            layout.read_size, layout.read_address
        ),
    );
    let dump = memory.read(layout.read_address, layout.read_size as usize)?;
    let staging = extract_subregion(
        &dump,
        layout.staging_offset as usize,
        layout.staging_size as usize,
    )?;

    let store = BackupStore::new(ctx.config.backup_locations.clone());
    let outcome = store.save(&dump, staging, Utc::now());
    for (location, reason) in &outcome.failures {
        ctx.log(
            AuditLevel::Warning,
            format!("Backup to {} failed: {}", location.display(), reason),
        );
    }
    for copy in &outcome.copies {
        ctx.log(
            AuditLevel::Info,
            format!(
                "Backup written: {} (CRC-32 {:08X})",
                copy.full_path.display(),
                copy.checksum
            ),
        );
    }
    ctx.backups = outcome;
    ctx.dump = Some(dump);
    Ok(())
}

/// BACKUP_VERIFY - re-read every copy from disk; at least one must hold.
pub fn verify_backups<B: CanBus, O: FlashObserver>(
    ctx: &mut StepContext<'_, B, O>,
) -> Result<(), FlashError> {
    let target = ctx.profile.safety.backup_target;
    let copies = std::mem::take(&mut ctx.backups.copies);

    for copy in copies {
        let checked = verify_file(&copy.full_path).and_then(|_| verify_file(&copy.staging_path));
        match checked {
            Ok(_) => ctx.backups.copies.push(copy),
            Err(e) => {
                ctx.log(
                    AuditLevel::Warning,
                    format!("Backup {} rejected: {}", copy.full_path.display(), e),
                );
                ctx.backups
                    .failures
                    .push((copy.full_path.clone(), e.to_string()));
            }
        }
    }

    let verified = ctx.backups.verified();
    if verified == 0 {
        return Err(SafetyAbort::InsufficientBackups { verified, target }.into());
    }
    if verified < target {
        ctx.log(
            AuditLevel::Warning,
            format!(
                "Only {} of {} wanted backup copies verified",
                verified, target
            ),
        );
    }
    let primary = ctx
        .backups
        .primary()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    ctx.log(
        AuditLevel::Success,
        format!("{} backup copies verified; restore from {}", verified, primary),
    );
    Ok(())
}
