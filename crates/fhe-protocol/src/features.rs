//! Feature vectors for biometric matching.
//!
//! Embedding models are external to this crate: a [`FeatureExtractor`] maps an
//! image reference to a fixed-length vector. [`EmbeddingFileExtractor`] reads
//! precomputed embeddings from CSV files, one or more rows of numbers which
//! are flattened in order.

use std::fs::File;
use std::path::Path;

use tracing::debug;

use crate::{Error, Result};

/// Produces a fixed-length feature vector for an image reference.
pub trait FeatureExtractor {
    /// Extract the feature vector of `image`.
    fn extract(&self, image: &Path) -> Result<Vec<f64>>;
}

/// Reads embeddings from comma-separated files.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingFileExtractor {
    dimension: Option<usize>,
}

impl EmbeddingFileExtractor {
    /// Create an extractor accepting embeddings of any length.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every embedding to have exactly `dimension` values.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
        }
    }

    /// Parse an embedding from any reader.
    pub fn read<R: std::io::Read>(&self, reader: R) -> Result<Vec<f64>> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut values = Vec::new();
        for (row, record) in csv.records().enumerate() {
            let record = record.map_err(|e| Error::InvalidInput(e.to_string()))?;
            for field in record.iter().filter(|f| !f.is_empty()) {
                let value = field.parse::<f64>().map_err(|_| {
                    Error::InvalidInput(format!("row {}: {field:?} is not a number", row + 1))
                })?;
                values.push(value);
            }
        }

        validate_feature_vector(&values)?;
        if let Some(dimension) = self.dimension {
            if values.len() != dimension {
                return Err(Error::DimensionMismatch(values.len(), dimension));
            }
        }
        Ok(values)
    }
}

impl FeatureExtractor for EmbeddingFileExtractor {
    fn extract(&self, image: &Path) -> Result<Vec<f64>> {
        let values = self.read(File::open(image)?)?;
        debug!(path = %image.display(), dimension = values.len(), "loaded embedding");
        Ok(values)
    }
}

/// Checks that a feature vector is non-empty and finite.
pub fn validate_feature_vector(values: &[f64]) -> Result<()> {
    if values.is_empty() {
        return Err(Error::InvalidInput("empty feature vector".to_string()));
    }
    if let Some(position) = values.iter().position(|v| !v.is_finite()) {
        return Err(Error::InvalidInput(format!(
            "feature {position} is not a finite value"
        )));
    }
    Ok(())
}
