//! Read-back comparison passes.

use std::thread;

use super::StepContext;
use crate::audit::AuditLevel;
use crate::error::{FlashError, IntegrityError};
use crate::events::FlashObserver;
use crate::profile::ms;
use crate::transport::CanBus;

/// VERIFY / DOUBLE_VERIFY - both passes must match the image exactly.
pub fn verify_pass<B: CanBus, O: FlashObserver>(
    ctx: &mut StepContext<'_, B, O>,
    pass: u8,
) -> Result<(), FlashError> {
    if pass > 1 {
        thread::sleep(ms(ctx.profile.timing.verify_pass_delay_ms));
    }
    let auth = ctx.authenticator()?;
    let image = ctx.image()?.to_vec();
    let address = ctx.profile.memory.readback_address();
    let memory = ctx.memory(&auth);

    // `verify` renews privileges itself; the reset dropped them.
    let report = memory.verify(address, &image)?;
    if !report.matches() {
        ctx.log(
            AuditLevel::Error,
            format!(
                "Verify pass {}: {} differing bytes, first at {:?}",
                pass, report.differing, report.first_difference
            ),
        );
        return Err(IntegrityError::VerifyMismatch {
            pass,
            differing: report.differing,
            first: report.first_difference,
        }
        .into());
    }
    ctx.log(
        AuditLevel::Success,
        format!("Verify pass {}: {} bytes match", pass, image.len()),
    );
    Ok(())
}
