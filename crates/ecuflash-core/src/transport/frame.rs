//! Physical CAN frame.

use std::fmt;

use super::traits::TransportError;

/// Largest valid 11-bit identifier.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// Maximum classic CAN payload.
pub const CAN_MAX_DLEN: usize = 8;

/// A classic CAN frame with an 11-bit identifier.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u16,
    data: [u8; CAN_MAX_DLEN],
    len: u8,
}

impl CanFrame {
    pub fn new(id: u16, payload: &[u8]) -> Result<Self, TransportError> {
        if id > MAX_STANDARD_ID {
            return Err(TransportError::InvalidId(id as u32));
        }
        if payload.len() > CAN_MAX_DLEN {
            return Err(TransportError::FrameTooLong(payload.len()));
        }
        let mut data = [0u8; CAN_MAX_DLEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            data,
            len: payload.len() as u8,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Declared payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanFrame({:03X} [{}]", self.id, self.len)?;
        for b in self.data() {
            write!(f, " {:02X}", b)?;
        }
        write!(f, ")")
    }
}
