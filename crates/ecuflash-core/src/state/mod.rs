//! Orchestrator state machine.

pub mod machine;
pub mod steps;

pub use machine::{BACKUP_PLAN, FLASH_PLAN, FlashMachine, FlashState};
pub use steps::{StepContext, run_step};
