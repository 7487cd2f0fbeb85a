//! Local checks and credential loading. No device contact.

use std::fs;

use tracing::info;

use super::StepContext;
use crate::audit::AuditLevel;
use crate::auth::{Authenticator, CredentialSource, FileCredentialSource};
use crate::error::{FlashError, SafetyAbort};
use crate::events::FlashObserver;
use crate::transport::CanBus;

fn abort(message: impl Into<String>) -> FlashError {
    SafetyAbort::Preflight(message.into()).into()
}

/// PREFLIGHT - validate inputs before touching the device.
pub fn preflight<B: CanBus, O: FlashObserver>(
    ctx: &mut StepContext<'_, B, O>,
) -> Result<(), FlashError> {
    ctx.profile
        .validate()
        .map_err(|e| abort(format!("profile {}: {:#}", ctx.profile.name, e)))?;

    let bus = ctx.client.channel().bus();
    if !bus.is_connected() {
        return Err(abort(format!("transport {} is not connected", bus.name())));
    }

    if ctx.writes {
        let path = &ctx.config.image_path;
        if !path.is_file() {
            return Err(abort(format!("image {} not found", path.display())));
        }
        let image = fs::read(path)
            .map_err(|e| abort(format!("image {}: {}", path.display(), e)))?;
        let expected = ctx.profile.memory.staging_size as usize;
        if image.len() != expected {
            return Err(abort(format!(
                "image {} is {} bytes, expected exactly {}",
                path.display(),
                image.len(),
                expected
            )));
        }
        info!(path = %path.display(), len = image.len(), "Image loaded");
        ctx.image = Some(image);
    }

    let credential = &ctx.config.credential_path;
    if !credential.is_file() {
        return Err(abort(format!(
            "credential source {} not found",
            credential.display()
        )));
    }
    if ctx.config.backup_locations.is_empty() {
        return Err(abort("no backup locations configured"));
    }

    let message = format!(
        "Preflight passed: profile {}, transport {}",
        ctx.profile.name,
        bus.name()
    );
    ctx.log(AuditLevel::Success, message);
    Ok(())
}

/// LOAD_CREDENTIAL - read the opaque credential blob.
pub fn load_credential<B: CanBus, O: FlashObserver>(
    ctx: &mut StepContext<'_, B, O>,
) -> Result<(), FlashError> {
    let blob = FileCredentialSource::new(&ctx.config.credential_path).load()?;
    let len = blob.len();
    ctx.authenticator = Some(Authenticator::new(blob, ctx.profile));
    ctx.log(AuditLevel::Info, format!("Credential loaded ({} bytes)", len));
    Ok(())
}
