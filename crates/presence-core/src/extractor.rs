//! Feature extraction contract.
//!
//! The matcher only needs fixed-length, scale-consistent descriptors. The
//! bundled [`SimulatedExtractor`] stands in for a real face model: it derives
//! a pseudo-random descriptor from a SHA-256 digest of the frame, so the same
//! frame always yields the same descriptor.

use crate::types::{Descriptor, DescriptorError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("frame size mismatch: {width}x{height} needs {expected} bytes, got {actual}")]
    FrameSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("extractor produced an invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
}

/// Turns an 8-bit grayscale frame into a descriptor of fixed length.
pub trait FeatureExtractor: Send + Sync {
    /// Length of every descriptor this extractor returns.
    fn descriptor_len(&self) -> usize;

    fn extract(&self, frame: &[u8], width: u32, height: u32) -> Result<Descriptor, ExtractError>;
}

/// Deterministic stand-in for a face model. Components are uniform in [-1, 1).
#[derive(Debug, Clone)]
pub struct SimulatedExtractor {
    len: usize,
}

impl SimulatedExtractor {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl Default for SimulatedExtractor {
    fn default() -> Self {
        Self::new(crate::types::DEFAULT_DESCRIPTOR_LEN)
    }
}

impl FeatureExtractor for SimulatedExtractor {
    fn descriptor_len(&self) -> usize {
        self.len
    }

    fn extract(&self, frame: &[u8], width: u32, height: u32) -> Result<Descriptor, ExtractError> {
        check_frame(frame, width, height)?;

        let mut hasher = Sha256::new();
        hasher.update(width.to_le_bytes());
        hasher.update(height.to_le_bytes());
        hasher.update(frame);
        let seed: [u8; 32] = hasher.finalize().into();

        let mut rng = StdRng::from_seed(seed);
        let values = (0..self.len).map(|_| rng.gen_range(-1.0f64..1.0)).collect();
        let descriptor = Descriptor::new(values)?;

        tracing::debug!(width, height, dims = self.len, "simulated descriptor extracted");
        Ok(descriptor)
    }
}

fn check_frame(frame: &[u8], width: u32, height: u32) -> Result<(), ExtractError> {
    let expected = width as usize * height as usize;
    if expected == 0 || frame.is_empty() {
        return Err(ExtractError::EmptyFrame);
    }
    if frame.len() != expected {
        return Err(ExtractError::FrameSize {
            width,
            height,
            expected,
            actual: frame.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_frame_same_descriptor() {
        let extractor = SimulatedExtractor::default();
        let frame = vec![42u8; 16 * 16];
        let a = extractor.extract(&frame, 16, 16).unwrap();
        let b = extractor.extract(&frame, 16, 16).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
    }

    #[test]
    fn test_different_frames_differ() {
        let extractor = SimulatedExtractor::new(64);
        let a = extractor.extract(&[1u8; 64], 8, 8).unwrap();
        let mut frame = vec![1u8; 64];
        frame[63] = 2;
        let b = extractor.extract(&frame, 8, 8).unwrap();
        assert_ne!(a, b);
        assert!(a.similarity(&b).unwrap() < 0.8);
    }

    #[test]
    fn test_dimensions_are_part_of_seed() {
        let extractor = SimulatedExtractor::new(32);
        let frame = vec![7u8; 64];
        let a = extractor.extract(&frame, 8, 8).unwrap();
        let b = extractor.extract(&frame, 16, 4).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_components_in_range() {
        let extractor = SimulatedExtractor::new(512);
        let descriptor = extractor.extract(&[9u8; 4], 2, 2).unwrap();
        assert!(descriptor.as_slice().iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn test_rejects_bad_frames() {
        let extractor = SimulatedExtractor::default();
        assert!(matches!(extractor.extract(&[], 0, 0), Err(ExtractError::EmptyFrame)));
        assert!(matches!(
            extractor.extract(&[0u8; 10], 4, 4),
            Err(ExtractError::FrameSize { expected: 16, actual: 10, .. })
        ));
    }

    #[test]
    fn test_zero_length_descriptor_rejected() {
        let extractor = SimulatedExtractor::new(0);
        assert!(matches!(
            extractor.extract(&[0u8; 4], 2, 2),
            Err(ExtractError::InvalidDescriptor(DescriptorError::Empty))
        ));
    }
}
