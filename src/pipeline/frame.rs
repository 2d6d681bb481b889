//! Frame slots and the tokens that stand in for them on the queues.

use serde::{Deserialize, Serialize};

/// Stable index of one frame slot. Queues and stages pass tokens, never
/// frame references; holding a token is holding the exclusive right to
/// touch that slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameToken(u16);

impl FrameToken {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u16)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One preallocated frame slot: RGB pixels, a grayscale plane scratch for
/// the difference stage, and the difference metrics attached by it.
///
/// Allocated once at pipeline construction and never resized.
pub struct Frame {
    width: u32,
    height: u32,
    pub pixels: Vec<u8>,
    pub gray: Vec<u8>,
    pub difference_absolute: u64,
    pub difference_percentage: f64,
}

impl Frame {
    pub fn new(width: u32, height: u32) -> Self {
        let area = width as usize * height as usize;
        Self {
            width,
            height,
            pixels: vec![0; area * 3],
            gray: vec![0; area],
            difference_absolute: 0,
            difference_percentage: 0.0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Convert the RGB pixels to the grayscale plane, Rec.601 weighting in
    /// integer arithmetic.
    pub fn fill_gray(&mut self) {
        for (luma, rgb) in self.gray.iter_mut().zip(self.pixels.chunks_exact(3)) {
            let weighted =
                77 * rgb[0] as u32 + 150 * rgb[1] as u32 + 29 * rgb[2] as u32;
            *luma = (weighted >> 8) as u8;
        }
    }
}
