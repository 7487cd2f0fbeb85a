//! Privileged-mode unlock.
//!
//! Two stages run back to back on every attempt: standard seed/key security
//! access, then replay of an opaque credential blob through a download to a
//! fixed address. The blob is never inspected.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::memory::BlockCounter;
use crate::profile::{DeviceProfile, SecurityProfile, ms};
use crate::transport::CanBus;
use crate::uds::{Nrc, UdsClient, UdsError, UdsRequest};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Seed request rejected: {0}")]
    SeedRejected(Nrc),

    #[error("Key rejected: {0}")]
    KeyRejected(Nrc),

    #[error("Credential rejected: {0}")]
    CredentialRejected(Nrc),

    #[error("Expected a 2-byte seed, got {0} bytes")]
    MalformedSeed(usize),

    #[error("Credential source {path}: {reason}")]
    Source { path: PathBuf, reason: String },

    #[error(transparent)]
    Uds(#[from] UdsError),

    #[error("Authentication failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<AuthError>,
    },
}

impl AuthError {
    /// NRC the device answered with, if this was a rejection.
    pub fn nrc(&self) -> Option<Nrc> {
        match self {
            AuthError::SeedRejected(nrc)
            | AuthError::KeyRejected(nrc)
            | AuthError::CredentialRejected(nrc) => Some(*nrc),
            AuthError::Uds(e) => e.nrc(),
            AuthError::Exhausted { last, .. } => last.nrc(),
            _ => None,
        }
    }

    /// The device refuses further attempts for now.
    pub fn is_lockout(&self) -> bool {
        self.nrc().is_some_and(|nrc| nrc.is_lockout())
    }
}

fn rejected(e: UdsError, wrap: fn(Nrc) -> AuthError) -> AuthError {
    match e.nrc() {
        Some(nrc) => wrap(nrc),
        None => AuthError::Uds(e),
    }
}

/// Opaque credential bytes, shared cheaply between sessions.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBlob(Arc<[u8]>);

impl CredentialBlob {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Contents stay out of logs.
impl std::fmt::Debug for CredentialBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialBlob({} bytes)", self.0.len())
    }
}

/// Provider of the credential blob.
pub trait CredentialSource {
    fn load(&self) -> Result<CredentialBlob, AuthError>;
}

/// Raw credential bytes stored in a file.
#[derive(Debug, Clone)]
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl CredentialSource for FileCredentialSource {
    fn load(&self) -> Result<CredentialBlob, AuthError> {
        let bytes = std::fs::read(&self.path).map_err(|e| AuthError::Source {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        if bytes.is_empty() {
            return Err(AuthError::Source {
                path: self.path.clone(),
                reason: "file is empty".into(),
            });
        }
        info!(path = %self.path.display(), len = bytes.len(), "Credential loaded");
        Ok(CredentialBlob::new(bytes))
    }
}

impl CredentialSource for CredentialBlob {
    fn load(&self) -> Result<CredentialBlob, AuthError> {
        Ok(self.clone())
    }
}

/// Key for a seed: plain XOR with the profile constant.
pub fn derive_key(seed: u16, xor: u16) -> u16 {
    seed ^ xor
}

/// Runs the unlock sequence with bounded retries.
#[derive(Debug, Clone)]
pub struct Authenticator {
    blob: CredentialBlob,
    security: SecurityProfile,
    attempts: u32,
    retry_delay: Duration,
}

impl Authenticator {
    pub fn new(blob: CredentialBlob, profile: &DeviceProfile) -> Self {
        Self {
            blob,
            security: profile.security.clone(),
            attempts: profile.retry.auth_attempts.max(1),
            retry_delay: ms(profile.retry.auth_retry_delay_ms),
        }
    }

    pub fn blob(&self) -> &CredentialBlob {
        &self.blob
    }

    /// Unlock privileged memory access.
    ///
    /// Stops early when the device reports a lockout.
    #[instrument(skip_all, fields(bus = %client.channel().bus().name()))]
    pub fn authenticate<B: CanBus>(&self, client: &UdsClient<B>) -> Result<(), AuthError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(client) {
                Ok(()) => {
                    info!(attempt, "Privileged access granted");
                    return Ok(());
                }
                Err(e) if e.is_lockout() || attempt >= self.attempts => {
                    warn!(attempt, error = %e, "Authentication failed");
                    return Err(AuthError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(attempt, max = self.attempts, error = %e, "Authentication attempt failed");
                    thread::sleep(self.retry_delay);
                }
            }
        }
    }

    fn attempt<B: CanBus>(&self, client: &UdsClient<B>) -> Result<(), AuthError> {
        // A silent keep-alive here is not fatal; the seed request decides.
        if let Err(e) = client.tester_present() {
            debug!(error = %e, "Keep-alive unanswered");
        }

        client.broadcast(&UdsRequest::session_control(self.security.session))?;
        let dropped = client.drain();
        debug!(dropped, "Drained session replies");

        let level = self.security.level;
        let seed = client
            .request_seed(level)
            .map_err(|e| rejected(e, AuthError::SeedRejected))?;
        if seed.len() != 2 {
            return Err(AuthError::MalformedSeed(seed.len()));
        }
        let seed = BigEndian::read_u16(&seed);

        if seed == 0 {
            debug!(level, "Zero seed, level already unlocked");
        } else {
            let mut key = [0u8; 2];
            BigEndian::write_u16(&mut key, derive_key(seed, self.security.key_xor));
            client
                .send_key(level, &key)
                .map_err(|e| rejected(e, AuthError::KeyRejected))?;
            debug!(level, "Key accepted");
        }

        self.replay_credential(client)
    }

    fn replay_credential<B: CanBus>(&self, client: &UdsClient<B>) -> Result<(), AuthError> {
        let blob = self.blob.as_bytes();
        let max_block = client
            .request_download(self.security.credential_address, blob.len() as u32)
            .map_err(|e| rejected(e, AuthError::CredentialRejected))?;
        // maxNumberOfBlockLength counts the service id and the counter.
        let chunk_size = max_block.saturating_sub(2).max(1);

        let mut counter = BlockCounter::new();
        for chunk in blob.chunks(chunk_size) {
            client
                .transfer_data(counter.next(), chunk)?
                .into_result()
                .map_err(|e| rejected(e, AuthError::CredentialRejected))?;
        }
        debug!(len = blob.len(), chunk_size, "Credential replayed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{IsoTpChannel, SimulatedBus};

    fn profile() -> DeviceProfile {
        DeviceProfile::default().without_delays()
    }

    fn client(bus: &SimulatedBus, profile: &DeviceProfile) -> UdsClient<SimulatedBus> {
        UdsClient::new(
            IsoTpChannel::new(bus.clone(), profile.isotp_config()),
            profile.bus.broadcast_id,
        )
        .with_timing(Duration::from_millis(20), Duration::from_millis(50))
    }

    #[test]
    fn test_derive_key() {
        assert_eq!(derive_key(0x1234, 0x9AE8), 0x88DC);
        assert_eq!(derive_key(0x0000, 0x9AE8), 0x9AE8);
    }

    #[test]
    fn test_blob_debug_hides_contents() {
        let blob = CredentialBlob::new(vec![0xAA; 4]);
        assert_eq!(format!("{:?}", blob), "CredentialBlob(4 bytes)");
    }

    #[test]
    fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred.bin");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        let blob = FileCredentialSource::new(&path).load().unwrap();
        assert_eq!(blob.as_bytes(), &[1, 2, 3]);

        let missing = FileCredentialSource::new(dir.path().join("nope.bin")).load();
        assert!(matches!(missing, Err(AuthError::Source { .. })));
    }

    #[test]
    fn test_authenticate_unlocks() {
        let profile = profile();
        let bus = SimulatedBus::new(&profile);
        let blob = CredentialBlob::new(bus.credential());
        let auth = Authenticator::new(blob, &profile);
        auth.authenticate(&client(&bus, &profile)).unwrap();
        assert!(bus.is_unlocked());
    }

    #[test]
    fn test_zero_seed_skips_key() {
        let profile = profile();
        let bus = SimulatedBus::new(&profile);
        bus.set_seed(0x0000);
        let auth = Authenticator::new(CredentialBlob::new(bus.credential()), &profile);
        auth.authenticate(&client(&bus, &profile)).unwrap();
        let keys = bus
            .requests()
            .iter()
            .filter(|r| r.len() >= 2 && r[0] == 0x27 && r[1] == 0x02)
            .count();
        assert_eq!(keys, 0);
    }

    #[test]
    fn test_key_rejection_exhausts_retries() {
        let profile = profile();
        let bus = SimulatedBus::new(&profile);
        bus.reject_key(Some(Nrc::SecurityAccessDenied));
        let auth = Authenticator::new(CredentialBlob::new(bus.credential()), &profile);
        let err = auth.authenticate(&client(&bus, &profile)).unwrap_err();
        match err {
            AuthError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 5);
                assert!(matches!(*last, AuthError::KeyRejected(Nrc::SecurityAccessDenied)));
            }
            other => panic!("unexpected error: {other}"),
        }
        let seeds = bus
            .requests()
            .iter()
            .filter(|r| r.len() >= 2 && r[0] == 0x27 && r[1] == 0x01)
            .count();
        assert_eq!(seeds, 5);
        assert!(!bus.is_unlocked());
    }

    #[test]
    fn test_lockout_stops_early() {
        let profile = profile();
        let bus = SimulatedBus::new(&profile);
        bus.reject_key(Some(Nrc::ExceededNumberOfAttempts));
        let auth = Authenticator::new(CredentialBlob::new(bus.credential()), &profile);
        let err = auth.authenticate(&client(&bus, &profile)).unwrap_err();
        assert!(matches!(err, AuthError::Exhausted { attempts: 1, .. }));
        assert!(err.is_lockout());
    }

    #[test]
    fn test_wrong_credential_rejected() {
        let profile = profile();
        let bus = SimulatedBus::new(&profile);
        let auth = Authenticator::new(CredentialBlob::new(vec![0u8; 16]), &profile);
        let err = auth.authenticate(&client(&bus, &profile)).unwrap_err();
        assert!(matches!(err, AuthError::Exhausted { .. }));
        assert!(!bus.is_unlocked());
    }
}
