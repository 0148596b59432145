//! Perceptual image hashing for the semantic cache key (§4.3).
//!
//! Implements the `ImageHash.Perceptual` collaborator contract: a 64-bit
//! fingerprint such that two images with identical visible content hash to
//! the same value regardless of encoding. This is a classic average-hash
//! (aHash) over a luminance-normalized 8x8 downscale — cheap, dependency-light
//! (just `image`'s decode + resize), and the textbook choice for "near
//! duplicates collide, bitwise stable" rather than cryptographic uniqueness.

use image::{DynamicImage, GenericImageView, imageops::FilterType};
use miette::Diagnostic;
use thiserror::Error;

const HASH_SIZE: u32 = 8;

#[derive(Debug, Error, Diagnostic)]
pub enum ImageHashError {
    #[error("failed to decode image bytes: {0}")]
    #[diagnostic(code(examflow::imaging::decode))]
    Decode(#[from] image::ImageError),
}

/// The `ImageHash.Perceptual(image_ref) -> 64-bit fingerprint` collaborator
/// contract. Implementations must be deterministic:
/// `hash(x) == hash(x)` bitwise, and near-identical images must collide.
pub trait ImageHasher: Send + Sync {
    fn hash(&self, image_bytes: &[u8]) -> Result<u64, ImageHashError>;
}

/// Average-hash over a luminance-normalized 8x8 downscale.
///
/// The algorithm: decode, convert to grayscale, resize to 8x8 (discarding
/// aspect ratio — the hash only cares about coarse luminance structure),
/// compute the mean pixel value, then set bit `i` when pixel `i` is at or
/// above the mean. Re-encoding the same visible content (JPEG vs PNG, a
/// different quality level) changes the bytes but not the coarse luminance
/// pattern, so the hash is stable across encodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageHasher;

impl ImageHasher for AverageHasher {
    fn hash(&self, image_bytes: &[u8]) -> Result<u64, ImageHashError> {
        let img: DynamicImage = image::load_from_memory(image_bytes)?;
        Ok(average_hash(&img))
    }
}

fn average_hash(img: &DynamicImage) -> u64 {
    let small = img
        .resize_exact(HASH_SIZE, HASH_SIZE, FilterType::Triangle)
        .to_luma8();

    let pixels: Vec<u32> = small.pixels().map(|p| p.0[0] as u32).collect();
    let sum: u32 = pixels.iter().sum();
    let mean = sum / pixels.len() as u32;

    let mut hash: u64 = 0;
    for (i, &value) in pixels.iter().enumerate() {
        if value >= mean {
            hash |= 1 << i;
        }
    }
    hash
}

/// Hamming distance between two perceptual hashes; a practical similarity
/// measure downstream callers can threshold against when they want
/// "near-identical" rather than bitwise-equal.
#[must_use]
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn encode(width: u32, height: u32, fill: impl Fn(u32, u32) -> [u8; 3], format: image::ImageFormat) -> Vec<u8> {
        let buf: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| Rgb(fill(x, y)));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(buf)
            .write_to(&mut Cursor::new(&mut bytes), format)
            .expect("encode");
        bytes
    }

    #[test]
    fn hash_is_bitwise_deterministic() {
        let bytes = encode(64, 64, |x, y| [((x * 4) % 256) as u8, ((y * 4) % 256) as u8, 128], image::ImageFormat::Png);
        let hasher = AverageHasher;
        let h1 = hasher.hash(&bytes).unwrap();
        let h2 = hasher.hash(&bytes).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn identical_content_collides_across_encodings() {
        let fill = |x: u32, y: u32| [((x * 4) % 256) as u8, ((y * 4) % 256) as u8, 128];
        let png = encode(64, 64, fill, image::ImageFormat::Png);
        let bmp = encode(64, 64, fill, image::ImageFormat::Bmp);
        let hasher = AverageHasher;
        assert_eq!(hasher.hash(&png).unwrap(), hasher.hash(&bmp).unwrap());
    }

    #[test]
    fn distinct_content_differs() {
        let hasher = AverageHasher;
        let black = encode(32, 32, |_, _| [0, 0, 0], image::ImageFormat::Png);
        let white = encode(32, 32, |_, _| [255, 255, 255], image::ImageFormat::Png);
        assert_ne!(hasher.hash(&black).unwrap(), hasher.hash(&white).unwrap());
    }

    #[test]
    fn hamming_distance_is_zero_for_equal_hashes() {
        assert_eq!(hamming_distance(0xABCD, 0xABCD), 0);
        assert_eq!(hamming_distance(0b1010, 0b0101), 4);
    }
}
