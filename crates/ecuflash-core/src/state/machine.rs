//! Orchestrator states and the transition guard.

use std::fmt;
use std::time::Instant;

/// State of one orchestrated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashState {
    /// Local checks; no device contact.
    Preflight,
    /// Credential blob loaded from its source.
    LoadCredential,
    /// Diagnostic session opened.
    Connect,
    /// Keep-alive success ratio measured.
    QualityCheck,
    /// Region read and persisted.
    Backup,
    /// Persisted copies re-verified from disk.
    BackupVerify,
    /// New image downloaded to the staging region.
    Write,
    /// Device reset and diagnostic codes cleared.
    Reset,
    /// First read-back comparison.
    Verify,
    /// Second, independent read-back comparison.
    DoubleVerify,
    Done,
    Failed,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlashState::Preflight => "PREFLIGHT",
            FlashState::LoadCredential => "LOAD_CREDENTIAL",
            FlashState::Connect => "CONNECT",
            FlashState::QualityCheck => "QUALITY_CHECK",
            FlashState::Backup => "BACKUP",
            FlashState::BackupVerify => "BACKUP_VERIFY",
            FlashState::Write => "WRITE",
            FlashState::Reset => "RESET",
            FlashState::Verify => "VERIFY",
            FlashState::DoubleVerify => "DOUBLE_VERIFY",
            FlashState::Done => "DONE",
            FlashState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

impl FlashState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlashState::Done | FlashState::Failed)
    }

    /// Whether this state sends data to device memory.
    pub fn writes_device(&self) -> bool {
        matches!(self, FlashState::Write)
    }
}

/// Full flash sequence.
pub const FLASH_PLAN: &[FlashState] = &[
    FlashState::Preflight,
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
];

/// Read-only sequence: back the device up and stop.
pub const BACKUP_PLAN: &[FlashState] = &[
    FlashState::Preflight,
    FlashState::LoadCredential,
    FlashState::Connect,
    FlashState::Backup,
    FlashState::BackupVerify,
    FlashState::Done,
];

/// Walks a plan one state at a time.
///
/// The only legal moves are to the next state of the plan or to `Failed`.
#[derive(Debug)]
pub struct FlashMachine {
    plan: &'static [FlashState],
    index: usize,
    state: FlashState,
    entered: Instant,
    history: Vec<FlashState>,
}

impl FlashMachine {
    pub fn new(plan: &'static [FlashState]) -> Self {
        let state = plan.first().copied().unwrap_or(FlashState::Done);
        Self {
            plan,
            index: 0,
            state,
            entered: Instant::now(),
            history: vec![state],
        }
    }

    pub fn state(&self) -> FlashState {
        self.state
    }

    /// States visited so far, in order.
    pub fn history(&self) -> &[FlashState] {
        &self.history
    }

    /// Successor in the plan, if the run is not finished.
    pub fn next_state(&self) -> Option<FlashState> {
        if self.state.is_terminal() {
            return None;
        }
        self.plan.get(self.index + 1).copied()
    }

    /// Advance along the plan. Returns `(from, to)`.
    pub fn advance(&mut self) -> Option<(FlashState, FlashState)> {
        let next = self.next_state()?;
        let from = self.enter(next);
        self.index += 1;
        Some((from, next))
    }

    /// Move to `Failed`. Returns the state that failed.
    pub fn fail(&mut self) -> FlashState {
        if self.state == FlashState::Failed {
            return self.history.iter().rev().nth(1).copied().unwrap_or(FlashState::Failed);
        }
        self.enter(FlashState::Failed)
    }

    fn enter(&mut self, to: FlashState) -> FlashState {
        let from = self.state;
        tracing::info!(
            from = %from,
            to = %to,
            elapsed_ms = self.entered.elapsed().as_millis() as u64,
            "State transition"
        );
        self.state = to;
        self.entered = Instant::now();
        self.history.push(to);
        from
    }
}
