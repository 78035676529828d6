//! Image buffers crossing the engine boundary
//!
//! An [`Image`] is always owned by Rust. Inputs are lent to the engine only
//! for the duration of a native call; outputs are copied out of engine memory
//! before that memory is freed, so no borrowed pointer survives a call.

use crate::error::{Error, Result};

/// Largest channel count the engine produces or accepts.
pub const MAX_CHANNELS: u32 = 4;

/// A flat, row-major pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<u8>,
}

impl Image {
    /// Build an image, rejecting any mismatch between dimensions and data.
    pub fn new(width: u32, height: u32, channels: u32, data: Vec<u8>) -> Result<Self> {
        let image = Self {
            width,
            height,
            channels,
            data,
        };
        image.validate()?;
        Ok(image)
    }

    /// An image of the given shape with every byte set to `value`.
    pub fn filled(width: u32, height: u32, channels: u32, value: u8) -> Result<Self> {
        let len = byte_len(width, height, channels)?;
        Self::new(width, height, channels, vec![value; len])
    }

    /// Check the shape invariants: non-zero size, 1..=4 channels and
    /// `data.len() == width * height * channels`.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid(format!(
                "image dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(Error::invalid(format!(
                "image channel count must be 1..={}, got {}",
                MAX_CHANNELS, self.channels
            )));
        }
        let expected = byte_len(self.width, self.height, self.channels)?;
        if self.data.len() != expected {
            return Err(Error::invalid(format!(
                "image data is {} bytes, expected {} for {}x{}x{}",
                self.data.len(),
                expected,
                self.width,
                self.height,
                self.channels
            )));
        }
        Ok(())
    }

    /// Number of bytes in one row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// `width * height * channels`, failing on overflow.
pub fn byte_len(width: u32, height: u32, channels: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(channels as usize))
        .ok_or_else(|| {
            Error::invalid(format!(
                "image size {}x{}x{} overflows",
                width, height, channels
            ))
        })
}
