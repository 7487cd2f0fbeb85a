//! Flash session - high-level orchestrator for one run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::audit::{AuditLevel, AuditLog};
use crate::backup::BackupOutcome;
use crate::cancel::CancelToken;
use crate::error::{FlashError, FlashFailure};
use crate::events::{FlashEvent, FlashObserver, FrameDirection, TracingObserver};
use crate::profile::DeviceProfile;
use crate::state::machine::{BACKUP_PLAN, FLASH_PLAN, FlashMachine, FlashState};
use crate::state::steps::{StepContext, run_step};
use crate::transport::{CanBus, CanFrame, IsoTpChannel, TransportError};
use crate::uds::UdsClient;

/// Inputs of one run.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// New staging image; must be exactly the staging size.
    #[serde(default)]
    pub image_path: PathBuf,
    /// Raw credential blob.
    pub credential_path: PathBuf,
    /// Directories receiving backup copies.
    pub backup_locations: Vec<PathBuf>,
    /// Directory for the per-run audit log.
    pub audit_dir: PathBuf,
    #[serde(default)]
    pub profile: DeviceProfile,
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct FlashReport {
    pub duration: Duration,
    pub bytes_written: usize,
    /// Verified full-region backups, primary first.
    pub backups: Vec<PathBuf>,
    pub audit_path: PathBuf,
    pub warnings: u32,
    pub errors: u32,
}

/// Orchestrates a flash (or backup-only) run over one bus.
pub struct FlashSession<B: CanBus, O: FlashObserver> {
    config: SessionConfig,
    bus: B,
    observer: Arc<O>,
    cancel: CancelToken,
}

impl<B: CanBus> FlashSession<B, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig, bus: B) -> Self {
        Self::with_observer(config, bus, Arc::new(TracingObserver))
    }
}

impl<B: CanBus, O: FlashObserver> FlashSession<B, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, bus: B, observer: Arc<O>) -> Self {
        Self {
            config,
            bus,
            observer,
            cancel: CancelToken::new(),
        }
    }

    /// Token that stops the run at the next block or state boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Back up, write, reset and double-verify.
    #[instrument(skip(self), fields(profile = %self.config.profile.name))]
    pub fn run(&self) -> Result<FlashReport, FlashFailure> {
        self.execute(FLASH_PLAN, true).map(|(report, _)| report)
    }

    /// Read and persist the region without writing anything.
    #[instrument(skip(self), fields(profile = %self.config.profile.name))]
    pub fn backup(&self) -> Result<(FlashReport, BackupOutcome), FlashFailure> {
        self.execute(BACKUP_PLAN, false)
    }

    fn execute(
        &self,
        plan: &'static [FlashState],
        writes: bool,
    ) -> Result<(FlashReport, BackupOutcome), FlashFailure> {
        let started = Instant::now();
        let profile = &self.config.profile;

        let mut audit = AuditLog::create(&self.config.audit_dir, Utc::now()).map_err(|e| {
            FlashFailure {
                state: FlashState::Preflight,
                error: e.into(),
                backup_path: None,
                last_block: None,
                audit_path: None,
            }
        })?;
        audit.info(format!(
            "Run started: profile {}, {} mode",
            profile.name,
            if writes { "flash" } else { "backup" }
        ));

        let tap = ObservableBus {
            inner: &self.bus,
            observer: self.observer.as_ref(),
        };
        let client = UdsClient::new(
            IsoTpChannel::new(tap, profile.isotp_config()),
            profile.bus.broadcast_id,
        )
        .with_timing(profile.p2(), profile.p2_star());

        let mut ctx = StepContext {
            config: &self.config,
            profile,
            client: &client,
            observer: self.observer.as_ref(),
            cancel: &self.cancel,
            audit: &mut audit,
            writes,
            image: None,
            authenticator: None,
            dump: None,
            backups: BackupOutcome::default(),
            last_block: None,
            bytes_written: 0,
        };

        let mut machine = FlashMachine::new(plan);
        let result = self.drive(&mut machine, &mut ctx);

        let backups = std::mem::take(&mut ctx.backups);
        let last_block = ctx.last_block;
        let bytes_written = ctx.bytes_written;
        drop(ctx);

        let backup_path = backups.primary().map(Path::to_path_buf);
        match result {
            Ok(()) => {
                audit.finish(true, started.elapsed());
                self.observer.on_event(&FlashEvent::Finished { success: true });
                info!(elapsed = ?started.elapsed(), "Run complete");
                let report = FlashReport {
                    duration: started.elapsed(),
                    bytes_written,
                    backups: backups.copies.iter().map(|c| c.full_path.clone()).collect(),
                    audit_path: audit.path().to_path_buf(),
                    warnings: audit.warnings(),
                    errors: audit.errors(),
                };
                Ok((report, backups))
            }
            Err(error) => {
                let from = machine.fail();
                self.observer.on_event(&FlashEvent::StateChanged {
                    from,
                    to: FlashState::Failed,
                });
                audit.error(format!("Failed in {}: {}", from, error));
                let visited: Vec<String> =
                    machine.history().iter().map(|s| s.to_string()).collect();
                audit.info(format!("States visited: {}", visited.join(" > ")));
                match &backup_path {
                    Some(path) => audit.error(format!(
                        "Device can be restored manually from backup {}",
                        path.display()
                    )),
                    None => audit.info("No backup was taken; device memory was not written"),
                }
                if let Some(block) = last_block.filter(|_| from.writes_device()) {
                    audit.error(format!("Last block acknowledged by the device: {}", block));
                }
                audit.finish(false, started.elapsed());
                self.observer.on_event(&FlashEvent::Finished { success: false });
                error!(state = %from, error = %error, "Run failed");

                Err(FlashFailure {
                    state: from,
                    error,
                    backup_path,
                    last_block: last_block.filter(|_| from.writes_device()),
                    audit_path: Some(audit.path().to_path_buf()),
                })
            }
        }
    }

    fn drive<T: CanBus>(
        &self,
        machine: &mut FlashMachine,
        ctx: &mut StepContext<'_, T, O>,
    ) -> Result<(), FlashError> {
        loop {
            let state = machine.state();
            if state.is_terminal() {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                ctx.log(AuditLevel::Warning, format!("Cancelled before {}", state));
                return Err(FlashError::Cancelled);
            }
            ctx.audit.info(format!("Entering {}", state));
            run_step(state, ctx)?;
            if let Some((from, to)) = machine.advance() {
                self.observer.on_event(&FlashEvent::StateChanged { from, to });
            }
        }
    }
}

/// Bus wrapper that reports frame traffic to the observer.
struct ObservableBus<'a, B: CanBus, O: FlashObserver> {
    inner: &'a B,
    observer: &'a O,
}

impl<B: CanBus, O: FlashObserver> ObservableBus<'_, B, O> {
    fn tap(&self, direction: FrameDirection, frame: &CanFrame) {
        self.observer.on_event(&FlashEvent::Frame {
            direction,
            id: frame.id(),
            data: frame.data().to_vec(),
        });
    }
}

impl<B: CanBus, O: FlashObserver> CanBus for ObservableBus<'_, B, O> {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let res = self.inner.send(frame);
        if res.is_ok() {
            self.tap(FrameDirection::Tx, frame);
        }
        res
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        let res = self.inner.recv(timeout);
        if let Ok(frame) = &res {
            self.tap(FrameDirection::Rx, frame);
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn name(&self) -> String {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        let config = SessionConfig {
            image_path: "image.bin".into(),
            credential_path: "cred.bin".into(),
            backup_locations: vec!["/tmp/a".into(), "/tmp/b".into()],
            audit_dir: "logs".into(),
            profile: DeviceProfile::default(),
        };
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.backup_locations, config.backup_locations);
        assert_eq!(loaded.profile, config.profile);
    }

    #[test]
    fn test_config_profile_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            credential_path = "cred.bin"
            backup_locations = ["b"]
            audit_dir = "logs"
            "#,
        )
        .unwrap();
        assert_eq!(config.profile, DeviceProfile::default());
        assert_eq!(config.image_path, PathBuf::new());
    }
}
