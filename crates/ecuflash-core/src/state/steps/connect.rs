//! Session opening and the bus quality gate.

use std::thread;

use tracing::{debug, info};

use super::StepContext;
use crate::audit::AuditLevel;
use crate::error::{FlashError, SafetyAbort};
use crate::events::{FlashEvent, FlashObserver};
use crate::profile::ms;
use crate::transport::CanBus;

/// CONNECT - drop stray traffic and open the diagnostic session.
pub fn connect<B: CanBus, O: FlashObserver>(
    ctx: &mut StepContext<'_, B, O>,
) -> Result<(), FlashError> {
    let dropped = ctx.client.drain();
    if dropped > 0 {
        debug!(dropped, "Stray frames before connect");
    }
    let session = ctx.profile.security.session;
    ctx.client.session_control(session)?.into_result()?;
    info!(session, "Diagnostic session open");
    ctx.log(
        AuditLevel::Info,
        format!("Connected, session 0x{:02X} active", session),
    );
    Ok(())
}

/// QUALITY_CHECK - require a keep-alive success ratio above the threshold
/// before any write.
pub fn quality_check<B: CanBus, O: FlashObserver>(
    ctx: &mut StepContext<'_, B, O>,
) -> Result<(), FlashError> {
    let total = ctx.profile.safety.quality_pings;
    let threshold = ctx.profile.safety.quality_threshold;
    let interval = ms(ctx.profile.timing.ping_interval_ms);

    let mut successes = 0u32;
    for i in 0..total {
        if ctx.cancel.is_cancelled() {
            return Err(FlashError::Cancelled);
        }
        match ctx.client.tester_present() {
            Ok(r) if r.is_positive() => successes += 1,
            Ok(r) => debug!(ping = i, nrc = ?r.nrc(), "Keep-alive refused"),
            Err(e) => debug!(ping = i, error = %e, "Keep-alive lost"),
        }
        ctx.emit(FlashEvent::Progress {
            operation: "quality".into(),
            current: (i + 1) as u64,
            total: total as u64,
        });
        if i + 1 < total && !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    let ratio = if total == 0 {
        1.0
    } else {
        successes as f64 / total as f64
    };
    if ratio <= threshold {
        return Err(SafetyAbort::BusQuality {
            successes,
            total,
            ratio,
            threshold,
        }
        .into());
    }
    ctx.log(
        AuditLevel::Success,
        format!(
            "Bus quality {}/{} ({:.0}%, threshold {:.0}%)",
            successes,
            total,
            ratio * 100.0,
            threshold * 100.0
        ),
    );
    Ok(())
}
