//! Probe and enrollment descriptor sources: image files run through an
//! extractor, or descriptor vectors stored as JSON.

use anyhow::{bail, Context, Result};
use presence_core::{Descriptor, FeatureExtractor};
use std::path::Path;

/// Decode an image file to 8-bit grayscale. Returns (pixels, width, height).
pub fn load_grayscale(path: &Path) -> Result<(Vec<u8>, u32, u32)> {
    let img = image::open(path)
        .with_context(|| format!("decoding image {}", path.display()))?
        .to_luma8();
    let (width, height) = img.dimensions();
    Ok((img.into_raw(), width, height))
}

pub fn descriptor_from_image(extractor: &dyn FeatureExtractor, path: &Path) -> Result<Descriptor> {
    let (frame, width, height) = load_grayscale(path)?;
    let descriptor = extractor
        .extract(&frame, width, height)
        .with_context(|| format!("extracting descriptor from {}", path.display()))?;
    tracing::debug!(path = %path.display(), width, height, "descriptor extracted");
    Ok(descriptor)
}

/// Read a descriptor stored as a JSON array of numbers.
pub fn descriptor_from_json(path: &Path, expected_len: usize) -> Result<Descriptor> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading descriptor {}", path.display()))?;
    let values: Vec<f64> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing descriptor {}", path.display()))?;
    let descriptor = Descriptor::new(values)
        .with_context(|| format!("invalid descriptor in {}", path.display()))?;
    if descriptor.len() != expected_len {
        bail!(
            "descriptor in {} has {} components, expected {expected_len}",
            path.display(),
            descriptor.len()
        );
    }
    Ok(descriptor)
}
