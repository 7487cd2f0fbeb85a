//! ecuflash-core: diagnostic flashing engine for CAN-attached controllers.
//!
//! This crate provides segmented transport, a diagnostic service client,
//! privileged-mode authentication, chunked memory access and a
//! safety-gated flash orchestrator.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: CAN frame abstraction, ISO-TP style segmentation,
//!   mock and simulated buses, optional SocketCAN driver
//! - **UDS**: Request builders, response decoding, NRC table, client
//! - **Auth**: Seed/key unlock plus credential replay
//! - **Memory**: Chunked read/write/verify with periodic re-authentication
//! - **State**: Orchestrator states and step handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use ecuflash_core::session::{FlashSession, SessionConfig};
//! use ecuflash_core::transport::SimulatedBus;
//!
//! let config = SessionConfig {
//!     image_path: "staging.bin".into(),
//!     credential_path: "credential.bin".into(),
//!     backup_locations: vec!["backups".into()],
//!     audit_dir: "logs".into(),
//!     ..Default::default()
//! };
//!
//! let bus = SimulatedBus::new(&config.profile);
//! let session = FlashSession::new(config, bus);
//! let report = session.run().expect("flash failed");
//! println!("audit log: {}", report.audit_path.display());
//! ```

pub mod audit;
pub mod auth;
pub mod backup;
pub mod cancel;
pub mod error;
pub mod events;
pub mod memory;
pub mod profile;
pub mod session;
pub mod state;
pub mod transport;
pub mod uds;

// Re-exports for convenience
pub use audit::{AuditLevel, AuditLog};
pub use auth::{AuthError, Authenticator, CredentialBlob, CredentialSource, FileCredentialSource};
pub use backup::{BackupKind, BackupOutcome, BackupRecord, BackupStore};
pub use cancel::CancelToken;
pub use error::{FlashError, FlashFailure, IntegrityError, SafetyAbort};
pub use events::{
    ChannelObserver, FlashEvent, FlashObserver, FrameDirection, LogLevel, NullObserver,
    TracingObserver,
};
pub use memory::{BlockCounter, MemoryManager, VerifyReport, extract_subregion};
pub use profile::{DeviceProfile, FinalizeMode};
pub use session::{FlashReport, FlashSession, SessionConfig};
pub use state::FlashState;
pub use transport::{CanBus, CanFrame, MockBus, SimulatedBus, TransportError};
pub use uds::{Nrc, UdsClient, UdsError};
