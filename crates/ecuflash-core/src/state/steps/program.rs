//! Staging write and device reset.

use std::thread;

use tracing::info;

use super::StepContext;
use crate::audit::AuditLevel;
use crate::error::FlashError;
use crate::events::FlashObserver;
use crate::profile::ms;
use crate::transport::CanBus;
use crate::uds::reset_type;

/// WRITE - renew privileges and download the new image.
pub fn write<B: CanBus, O: FlashObserver>(
    ctx: &mut StepContext<'_, B, O>,
) -> Result<(), FlashError> {
    let auth = ctx.authenticator()?;
    let image = ctx.image()?.to_vec();
    let address = ctx.profile.memory.staging_address;
    let memory = ctx.memory(&auth);

    memory.authenticate()?;
    ctx.log(
        AuditLevel::Info,
        format!("Writing {} bytes to 0x{:08X}", image.len(), address),
    );

    match memory.write(address, &image) {
        Ok(summary) => {
            ctx.last_block = Some(summary.blocks);
            ctx.bytes_written = summary.bytes;
            ctx.log(
                AuditLevel::Success,
                format!(
                    "Write complete: {} blocks, {} retries",
                    summary.blocks, summary.retries
                ),
            );
            Ok(())
        }
        Err(e) => {
            if let FlashError::BlockFailed { block, .. } = &e {
                ctx.last_block = Some(block.saturating_sub(1));
            }
            Err(e)
        }
    }
}

/// RESET - reset the device, clear diagnostic codes and let it settle.
pub fn reset<B: CanBus, O: FlashObserver>(
    ctx: &mut StepContext<'_, B, O>,
) -> Result<(), FlashError> {
    ctx.client
        .ecu_reset(reset_type::HARD_RESET)?
        .into_result()?;
    ctx.client.clear_diagnostics()?.into_result()?;
    info!("Device reset, diagnostic codes cleared");

    let settle = ms(ctx.profile.timing.stabilization_delay_ms);
    ctx.log(
        AuditLevel::Info,
        format!(
            "Device reset and codes cleared; settling {}ms",
            settle.as_millis()
        ),
    );
    thread::sleep(settle);
    Ok(())
}
