//! Pixel codec and content hashing (C1).
//!
//! `Plane` is the one shared currency between the splitter framework, the
//! storage backend, and the catalog: a splitter decodes source bytes into a
//! `Plane`, the storage backend is handed the PNG-encoded bytes to store, and
//! the SHA-256 recorded in the catalog is always taken over the canonical
//! (decoded) buffer, never the encoded one, so re-encoding never changes it.

use image::{ExtendedColorType, ImageEncoder};
use sha2::{Digest, Sha256};
use std::io::Cursor;

use crate::error::IngestError;

/// Bit depth of a plane's pixel buffer. Only two are accepted (§4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitDepth {
    Uint8,
    Uint16,
}

impl BitDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            BitDepth::Uint8 => "uint8",
            BitDepth::Uint16 => "uint16",
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            BitDepth::Uint8 => 1,
            BitDepth::Uint16 => 2,
        }
    }

    pub fn parse(s: &str) -> Result<Self, IngestError> {
        match s {
            "uint8" => Ok(BitDepth::Uint8),
            "uint16" => Ok(BitDepth::Uint16),
            other => Err(IngestError::UnsupportedBitDepth(other.to_string())),
        }
    }
}

/// A single decoded plane: row-major pixel buffer at native bit depth.
#[derive(Clone, Debug)]
pub struct Plane {
    pub width: u32,
    pub height: u32,
    /// 1 (grayscale) or 3 (RGB).
    pub colors: u8,
    pub bit_depth: BitDepth,
    /// Row-major pixel buffer. For `Uint16`, each sample is two
    /// little-endian bytes; length is always
    /// `width * height * colors as u32 * bit_depth.bytes_per_sample()`.
    data: Vec<u8>,
}

impl Plane {
    pub fn new(width: u32, height: u32, colors: u8, bit_depth: BitDepth, data: Vec<u8>) -> Result<Self, IngestError> {
        if colors != 1 && colors != 3 {
            return Err(IngestError::ParseError {
                name: "plane".to_string(),
                reason: format!("im_colors must be 1 or 3, got {colors}"),
            });
        }
        let expected = width as usize * height as usize * colors as usize * bit_depth.bytes_per_sample();
        if data.len() != expected {
            return Err(IngestError::ParseError {
                name: "plane".to_string(),
                reason: format!("pixel buffer length {} does not match expected {expected}", data.len()),
            });
        }
        Ok(Self { width, height, colors, bit_depth, data })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// SHA-256 over the canonical (decoded) buffer. Re-encoding the plane in
    /// any image format never changes this value.
    pub fn sha256_hex(&self) -> String {
        sha256_hex(&self.data)
    }
}

/// Hash arbitrary bytes (used for both plane buffers and whole source files).
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// The only supported encoded format per invariant §3.3.6.
pub const PLANE_EXT: &str = "png";

/// Encode a plane to PNG bytes for upload to the storage backend.
pub fn encode_png(plane: &Plane) -> Result<Vec<u8>, IngestError> {
    let mut buf = Vec::new();
    let color_type = match (plane.colors, plane.bit_depth) {
        (1, BitDepth::Uint8) => ExtendedColorType::L8,
        (1, BitDepth::Uint16) => ExtendedColorType::L16,
        (3, BitDepth::Uint8) => ExtendedColorType::Rgb8,
        (3, BitDepth::Uint16) => ExtendedColorType::Rgb16,
        (colors, _) => {
            return Err(IngestError::ParseError {
                name: "plane".to_string(),
                reason: format!("unsupported color count {colors}"),
            })
        }
    };
    let encoder = image::codecs::png::PngEncoder::new(Cursor::new(&mut buf));
    encoder
        .write_image(&plane.data, plane.width, plane.height, color_type)
        .map_err(|e| IngestError::Other(anyhow::anyhow!("png encode failed: {e}")))?;
    Ok(buf)
}

/// Decode PNG bytes back into a `Plane`, given the bit depth and color count
/// the caller already knows from catalog metadata (PNG itself is trusted to
/// report consistent width/height/bit depth, which we verify).
pub fn decode_png(bytes: &[u8], expected_colors: u8, expected_bit_depth: BitDepth) -> Result<Plane, IngestError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| IngestError::Other(anyhow::anyhow!("png decode failed: {e}")))?;
    let (width, height) = (img.width(), img.height());
    let data = match (expected_colors, expected_bit_depth) {
        (1, BitDepth::Uint8) => img.to_luma8().into_raw(),
        (1, BitDepth::Uint16) => img
            .to_luma16()
            .into_raw()
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        (3, BitDepth::Uint8) => img.to_rgb8().into_raw(),
        (3, BitDepth::Uint16) => img
            .to_rgb16()
            .into_raw()
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        (colors, _) => {
            return Err(IngestError::ParseError {
                name: "plane".to_string(),
                reason: format!("unsupported color count {colors}"),
            })
        }
    };
    Plane::new(width, height, expected_colors, expected_bit_depth, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_stable_across_reencoding() {
        let data = vec![1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let plane = Plane::new(2, 2, 3, BitDepth::Uint8, data).unwrap();
        let hash_before = plane.sha256_hex();
        let encoded = encode_png(&plane).unwrap();
        let decoded = decode_png(&encoded, 3, BitDepth::Uint8).unwrap();
        assert_eq!(hash_before, decoded.sha256_hex());
    }

    #[test]
    fn rejects_unsupported_color_count() {
        let err = Plane::new(1, 1, 4, BitDepth::Uint8, vec![0, 0, 0, 0]);
        assert!(err.is_err());
    }

    #[test]
    fn bit_depth_parses_only_known_values() {
        assert!(BitDepth::parse("uint8").is_ok());
        assert!(BitDepth::parse("uint16").is_ok());
        assert!(BitDepth::parse("float32").is_err());
    }
}
