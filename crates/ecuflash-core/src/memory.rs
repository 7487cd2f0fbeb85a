//! Chunked read, write and verify of privileged device memory.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::auth::Authenticator;
use crate::cancel::CancelToken;
use crate::error::{FlashError, IntegrityError};
use crate::events::{FlashEvent, FlashObserver};
use crate::profile::{DeviceProfile, FinalizeMode, MemoryLayout, RetryPolicy, ms};
use crate::transport::CanBus;
use crate::uds::{UdsClient, UdsError};

/// Rolling transfer-data sequence counter: 1..=255, then back to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCounter(u8);

impl BlockCounter {
    pub fn new() -> Self {
        Self(1)
    }

    /// Value the next block will carry.
    pub fn current(&self) -> u8 {
        self.0
    }

    /// Return the current value and advance.
    pub fn next(&mut self) -> u8 {
        let value = self.0;
        self.0 = if value == u8::MAX { 1 } else { value + 1 };
        value
    }
}

impl Default for BlockCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor and counters of one in-flight read or write.
///
/// Owned by exactly one operation.
#[derive(Debug)]
pub struct MemorySession {
    address: u32,
    remaining: usize,
    counter: BlockCounter,
    ops_since_auth: u32,
    reauth_count: u32,
}

impl MemorySession {
    fn new(address: u32, length: usize) -> Self {
        Self {
            address,
            remaining: length,
            counter: BlockCounter::new(),
            ops_since_auth: 0,
            reauth_count: 0,
        }
    }

    fn advance(&mut self, len: usize) {
        self.address = self.address.wrapping_add(len as u32);
        self.remaining = self.remaining.saturating_sub(len);
        self.ops_since_auth += 1;
    }
}

/// Outcome of a read-back comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub expected_len: usize,
    pub actual_len: usize,
    pub differing: usize,
    pub first_difference: Option<usize>,
}

impl VerifyReport {
    /// Byte-compare; a length difference is never a match.
    pub fn compare(expected: &[u8], actual: &[u8]) -> Self {
        let mut differing = expected.len().abs_diff(actual.len());
        let mut first_difference = None;
        for (i, (a, b)) in expected.iter().zip(actual).enumerate() {
            if a != b {
                differing += 1;
                first_difference.get_or_insert(i);
            }
        }
        if first_difference.is_none() && expected.len() != actual.len() {
            first_difference = Some(expected.len().min(actual.len()));
        }
        Self {
            expected_len: expected.len(),
            actual_len: actual.len(),
            differing,
            first_difference,
        }
    }

    pub fn matches(&self) -> bool {
        self.differing == 0 && self.expected_len == self.actual_len
    }
}

/// Result of a completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub bytes: usize,
    pub blocks: u32,
    pub retries: u32,
}

/// Slice the staging region out of a full-region dump.
pub fn extract_subregion(dump: &[u8], offset: usize, size: usize) -> Result<&[u8], IntegrityError> {
    offset
        .checked_add(size)
        .and_then(|end| dump.get(offset..end))
        .ok_or(IntegrityError::OutOfBounds {
            offset,
            size,
            len: dump.len(),
        })
}

/// Read/write engine bound to one client and authenticator.
pub struct MemoryManager<'a, B: CanBus, O: FlashObserver> {
    client: &'a UdsClient<B>,
    auth: &'a Authenticator,
    observer: &'a O,
    layout: MemoryLayout,
    retry: RetryPolicy,
    finalize: FinalizeMode,
    cancel: CancelToken,
}

impl<'a, B: CanBus, O: FlashObserver> MemoryManager<'a, B, O> {
    pub fn new(
        client: &'a UdsClient<B>,
        auth: &'a Authenticator,
        profile: &DeviceProfile,
        observer: &'a O,
    ) -> Self {
        Self {
            client,
            auth,
            observer,
            layout: profile.memory.clone(),
            retry: profile.retry.clone(),
            finalize: profile.finalize,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn authenticate(&self) -> Result<(), FlashError> {
        self.auth.authenticate(self.client)?;
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), FlashError> {
        if self.cancel.is_cancelled() {
            return Err(FlashError::Cancelled);
        }
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        ms(self.retry.backoff_ms.saturating_mul(attempt as u64))
    }

    fn progress(&self, operation: &str, current: usize, total: usize) {
        self.observer.on_event(&FlashEvent::Progress {
            operation: operation.to_string(),
            current: current as u64,
            total: total as u64,
        });
    }

    /// Read `length` bytes starting at `address`.
    ///
    /// Callers authenticate first; the session is renewed every
    /// `reauth_interval` uploads and whenever the device reports lost
    /// privileges. Either the whole region is returned or an error.
    #[instrument(skip(self), fields(address = %format!("0x{:08X}", address)))]
    pub fn read(&self, address: u32, length: usize) -> Result<Vec<u8>, FlashError> {
        let mut session = MemorySession::new(address, length);
        let mut data = Vec::with_capacity(length);

        while session.remaining > 0 {
            self.check_cancel()?;
            if session.ops_since_auth >= self.layout.reauth_interval {
                self.reauthenticate(&mut session)?;
            }

            let mut block = self.read_block(&mut session)?;
            let consumed = block.len();
            block.truncate(session.remaining);
            data.extend_from_slice(&block);
            session.advance(consumed);
            self.progress("read", data.len(), length);
        }

        info!(
            len = data.len(),
            reauths = session.reauth_count,
            "Read complete"
        );
        Ok(data)
    }

    fn reauthenticate(&self, session: &mut MemorySession) -> Result<(), FlashError> {
        debug!(
            address = %format!("0x{:08X}", session.address),
            ops = session.ops_since_auth,
            "Renewing privileged session"
        );
        self.authenticate()?;
        session.ops_since_auth = 0;
        session.reauth_count += 1;
        Ok(())
    }

    fn upload(&self, address: u32) -> Result<Vec<u8>, FlashError> {
        let block = self
            .client
            .request_upload(address, self.layout.upload_format)?;
        if block.is_empty() {
            return Err(UdsError::Malformed(format!("empty block at 0x{:08X}", address)).into());
        }
        Ok(block)
    }

    fn read_block(&self, session: &mut MemorySession) -> Result<Vec<u8>, FlashError> {
        let attempts = self.retry.read_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.upload(session.address) {
                Ok(block) => return Ok(block),
                Err(e) => e,
            };
            let recoverable = err.is_retryable()
                || err.is_access_denied()
                || matches!(err, FlashError::Protocol(UdsError::Malformed(_)));
            if !recoverable || attempt >= attempts {
                return Err(FlashError::ReadFailed {
                    address: session.address,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            warn!(
                address = %format!("0x{:08X}", session.address),
                attempt,
                error = %err,
                "Upload failed, retrying"
            );
            if err.is_access_denied() {
                self.reauthenticate(session)?;
            } else {
                thread::sleep(self.backoff(attempt));
            }
        }
    }

    /// Download `data` to `address` in fixed-size blocks.
    ///
    /// The last block is zero-padded. Any block that exhausts its retries
    /// aborts the write; `FlashError::BlockFailed` names it (1-based).
    #[instrument(skip(self, data), fields(address = %format!("0x{:08X}", address), len = data.len()))]
    pub fn write(&self, address: u32, data: &[u8]) -> Result<WriteSummary, FlashError> {
        if data.is_empty() {
            return Ok(WriteSummary {
                bytes: 0,
                blocks: 0,
                retries: 0,
            });
        }

        let max_block = self.client.request_download(address, data.len() as u32)?;
        let mut block_size = self.layout.write_block_size;
        let device_limit = max_block.saturating_sub(2);
        if device_limit > 0 && device_limit < block_size {
            warn!(
                configured = block_size,
                device = device_limit,
                "Device accepts smaller blocks, shrinking"
            );
            block_size = device_limit;
        }

        let total = data.len().div_ceil(block_size) as u32;
        let mut session = MemorySession::new(address, data.len());
        let mut retries = 0;
        let mut sent = 0;
        let mut buf = vec![0u8; block_size];

        for (i, chunk) in data.chunks(block_size).enumerate() {
            self.check_cancel()?;
            let block = i as u32 + 1;
            buf[..chunk.len()].copy_from_slice(chunk);
            buf[chunk.len()..].fill(0);

            let counter = session.counter.next();
            retries += self.send_block(counter, &buf, block, total)?;

            sent += chunk.len();
            session.advance(chunk.len());
            self.progress("write", sent, data.len());
        }

        match self.finalize {
            FinalizeMode::TransferExit => {
                self.client.transfer_exit()?.into_result()?;
                debug!("Transfer exit acknowledged");
            }
            FinalizeMode::ResetAndClear => {
                debug!("Transfer exit skipped; device commits on reset");
            }
        }

        info!(blocks = total, retries, "Write complete");
        Ok(WriteSummary {
            bytes: data.len(),
            blocks: total,
            retries,
        })
    }

    /// Send one block, retrying with the same counter. Returns the retry count.
    fn send_block(&self, counter: u8, payload: &[u8], block: u32, total: u32) -> Result<u32, FlashError> {
        let attempts = self.retry.write_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .transfer_data(counter, payload)
                .map_err(FlashError::from)
                .and_then(|r| r.into_result().map_err(FlashError::from));
            let err = match result {
                Ok(_) => return Ok(attempt - 1),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= attempts {
                return Err(FlashError::BlockFailed {
                    block,
                    total,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            warn!(block, total, attempt, error = %err, "Block failed, retrying");
            thread::sleep(self.backoff(attempt));
        }
    }

    /// Renew privileges, read `expected.len()` bytes back and compare.
    pub fn verify(&self, address: u32, expected: &[u8]) -> Result<VerifyReport, FlashError> {
        self.authenticate()?;
        let actual = self.read(address, expected.len())?;
        let report = VerifyReport::compare(expected, &actual);
        if report.matches() {
            info!(len = expected.len(), "Verify matched");
        } else {
            warn!(
                differing = report.differing,
                first = ?report.first_difference,
                "Verify mismatch"
            );
        }
        Ok(report)
    }
}
