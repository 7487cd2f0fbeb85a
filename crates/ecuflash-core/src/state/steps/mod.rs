//! Step handlers - the work done inside each orchestrator state.
//!
//! Split by phase:
//! - `preflight`: local checks and credential loading
//! - `connect`: session opening and bus quality gate
//! - `backup`: region backup and backup gate
//! - `program`: staging write and device reset
//! - `verify`: read-back comparison passes

mod backup;
mod connect;
mod preflight;
mod program;
mod verify;

use crate::audit::{AuditLevel, AuditLog};
use crate::auth::Authenticator;
use crate::backup::BackupOutcome;
use crate::cancel::CancelToken;
use crate::error::{FlashError, SafetyAbort};
use crate::events::{FlashEvent, FlashObserver, LogLevel};
use crate::memory::MemoryManager;
use crate::profile::DeviceProfile;
use crate::session::SessionConfig;
use crate::state::machine::FlashState;
use crate::transport::CanBus;
use crate::uds::UdsClient;

/// Resources and results shared by the steps of one run.
pub struct StepContext<'a, B: CanBus, O: FlashObserver> {
    pub config: &'a SessionConfig,
    pub profile: &'a DeviceProfile,
    pub client: &'a UdsClient<B>,
    pub observer: &'a O,
    pub cancel: &'a CancelToken,
    pub audit: &'a mut AuditLog,
    /// Whether the plan writes; preflight skips image checks otherwise.
    pub writes: bool,
    /// New staging image, loaded by preflight.
    pub image: Option<Vec<u8>>,
    pub authenticator: Option<Authenticator>,
    /// Full region as read during backup.
    pub dump: Option<Vec<u8>>,
    pub backups: BackupOutcome,
    /// Last block the device acknowledged during the write.
    pub last_block: Option<u32>,
    pub bytes_written: usize,
}

impl<'a, B: CanBus, O: FlashObserver> StepContext<'a, B, O> {
    pub(crate) fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    /// Audit entry mirrored to the observer.
    pub(crate) fn log(&mut self, level: AuditLevel, message: impl Into<String>) {
        let message = message.into();
        self.audit.record(level, &message);
        let level = match level {
            AuditLevel::Info | AuditLevel::Success => LogLevel::Info,
            AuditLevel::Warning => LogLevel::Warn,
            AuditLevel::Error => LogLevel::Error,
        };
        self.emit(FlashEvent::Log { level, message });
    }

    pub(crate) fn authenticator(&self) -> Result<Authenticator, FlashError> {
        self.authenticator
            .clone()
            .ok_or_else(|| SafetyAbort::Preflight("credential not loaded".into()).into())
    }

    /// Memory engine bound to this run's client, observer and cancel token.
    pub(crate) fn memory<'s>(&self, auth: &'s Authenticator) -> MemoryManager<'s, B, O>
    where
        'a: 's,
    {
        MemoryManager::new(self.client, auth, self.profile, self.observer)
            .with_cancel(self.cancel.clone())
    }

    pub(crate) fn image(&self) -> Result<&[u8], FlashError> {
        self.image
            .as_deref()
            .ok_or_else(|| SafetyAbort::Preflight("image not loaded".into()).into())
    }
}

/// Run the work of `state`.
pub fn run_step<B: CanBus, O: FlashObserver>(
    state: FlashState,
    ctx: &mut StepContext<'_, B, O>,
) -> Result<(), FlashError> {
    match state {
        FlashState::Preflight => preflight::preflight(ctx),
        FlashState::LoadCredential => preflight::load_credential(ctx),
        FlashState::Connect => connect::connect(ctx),
        FlashState::QualityCheck => connect::quality_check(ctx),
        FlashState::Backup => backup::backup(ctx),
        FlashState::BackupVerify => backup::verify_backups(ctx),
        FlashState::Write => program::write(ctx),
        FlashState::Reset => program::reset(ctx),
        FlashState::Verify => verify::verify_pass(ctx, 1),
        FlashState::DoubleVerify => verify::verify_pass(ctx, 2),
        FlashState::Done | FlashState::Failed => Ok(()),
    }
}
