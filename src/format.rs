//! Pixel Format Module
//!
//! Pixel formats understood by the upload engine and the size math shared by
//! every upload path (mip shapes, row pitches, block compression).

use serde::{Deserialize, Serialize};

/// Edge length of a block-compressed block, in pixels.
pub const BLOCK_COMPRESSION_DIM: u32 = 4;

/// Texel formats. Discriminants are the matching DXGI_FORMAT values.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Unknown = 0,
    R32G32B32A32Float = 2,
    R16G16B16A16Float = 10,
    R8G8B8A8Unorm = 28,
    R32Float = 41,
    R8Unorm = 61,
    Bc1Unorm = 71,
    Bc2Unorm = 74,
    Bc3Unorm = 77,
    B8G8R8A8Unorm = 87,
    Bc7Unorm = 98,
}

impl PixelFormat {
    /// Bits per pixel. For block-compressed formats this is the average
    /// cost of one pixel inside a 4x4 block.
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Unknown => 0,
            PixelFormat::R32G32B32A32Float => 128,
            PixelFormat::R16G16B16A16Float => 64,
            PixelFormat::R8G8B8A8Unorm | PixelFormat::B8G8R8A8Unorm | PixelFormat::R32Float => 32,
            PixelFormat::R8Unorm => 8,
            PixelFormat::Bc1Unorm => 4,
            PixelFormat::Bc2Unorm | PixelFormat::Bc3Unorm | PixelFormat::Bc7Unorm => 8,
        }
    }

    pub const fn is_block_compressed(self) -> bool {
        matches!(
            self,
            PixelFormat::Bc1Unorm
                | PixelFormat::Bc2Unorm
                | PixelFormat::Bc3Unorm
                | PixelFormat::Bc7Unorm
        )
    }

    /// Size of one addressable element: a pixel, or a whole 4x4 block for
    /// block-compressed formats.
    pub const fn bytes_per_element(self) -> u32 {
        if self.is_block_compressed() {
            self.bits_per_pixel() * 16 / 8
        } else {
            self.bits_per_pixel() / 8
        }
    }

    /// Tightly packed byte width of one row of elements.
    pub fn row_bytes(self, width: u32) -> u32 {
        if self.is_block_compressed() {
            block_count(width) * self.bytes_per_element()
        } else {
            width.max(1) * self.bytes_per_element()
        }
    }

    /// Number of element rows covering `height` pixels.
    pub fn row_count(self, height: u32) -> u32 {
        if self.is_block_compressed() {
            block_count(height)
        } else {
            height.max(1)
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Unknown => "unknown",
            PixelFormat::R32G32B32A32Float => "R32G32B32A32_FLOAT",
            PixelFormat::R16G16B16A16Float => "R16G16B16A16_FLOAT",
            PixelFormat::R8G8B8A8Unorm => "R8G8B8A8_UNORM",
            PixelFormat::R32Float => "R32_FLOAT",
            PixelFormat::R8Unorm => "R8_UNORM",
            PixelFormat::Bc1Unorm => "BC1_UNORM",
            PixelFormat::Bc2Unorm => "BC2_UNORM",
            PixelFormat::Bc3Unorm => "BC3_UNORM",
            PixelFormat::B8G8R8A8Unorm => "B8G8R8A8_UNORM",
            PixelFormat::Bc7Unorm => "BC7_UNORM",
        }
    }
}

fn block_count(pixels: u32) -> u32 {
    ((pixels + BLOCK_COMPRESSION_DIM - 1) / BLOCK_COMPRESSION_DIM).max(1)
}

/// Round a pixel dimension up to a whole number of compression blocks.
pub const fn round_to_block(input: u32) -> u32 {
    (input + 3) & !3
}

/// Total bytes for a mip chain of the given top-level size.
///
/// Stops early once every dimension has shrunk to zero.
pub fn texture_data_size(
    mut width: u32,
    mut height: u32,
    mut depth: u32,
    mip_count: u32,
    format: PixelFormat,
) -> usize {
    if format == PixelFormat::Unknown {
        return 0;
    }

    let mut result = 0usize;
    for _ in 0..mip_count.max(1) {
        if width == 0 && height == 0 && depth == 0 {
            break;
        }
        let rows = format.row_count(height) as usize;
        result += format.row_bytes(width) as usize * rows * depth.max(1) as usize;
        width >>= 1;
        height >>= 1;
        depth >>= 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_compressed_element_size() {
        assert_eq!(PixelFormat::Bc1Unorm.bytes_per_element(), 8);
        assert_eq!(PixelFormat::Bc3Unorm.bytes_per_element(), 16);
        assert_eq!(PixelFormat::R8G8B8A8Unorm.bytes_per_element(), 4);
    }

    #[test]
    fn test_row_math() {
        assert_eq!(PixelFormat::Bc1Unorm.row_bytes(16), 32);
        assert_eq!(PixelFormat::Bc1Unorm.row_bytes(2), 8);
        assert_eq!(PixelFormat::Bc1Unorm.row_count(6), 2);
        assert_eq!(PixelFormat::R8G8B8A8Unorm.row_bytes(16), 64);
        assert_eq!(PixelFormat::R8G8B8A8Unorm.row_count(0), 1);
    }

    #[test]
    fn test_texture_data_size() {
        // 4x4 RGBA8 + 2x2 + 1x1
        assert_eq!(
            texture_data_size(4, 4, 1, 3, PixelFormat::R8G8B8A8Unorm),
            64 + 16 + 4
        );
        // BC1 mips never go below one block
        assert_eq!(texture_data_size(8, 8, 1, 4, PixelFormat::Bc1Unorm), 32 + 8 + 8 + 8);
        assert_eq!(texture_data_size(8, 8, 1, 4, PixelFormat::Unknown), 0);
    }

    #[test]
    fn test_round_to_block() {
        assert_eq!(round_to_block(1), 4);
        assert_eq!(round_to_block(4), 4);
        assert_eq!(round_to_block(13), 16);
    }
}
