//! Weighted multi-component aggregation of embeddings into one profile vector.
//!
//! # Algorithm
//!
//! 1. Check every component has the model's raw dimensionality.
//! 2. Group components by [`SourceKind`] and average each group unweighted.
//! 3. Combine the group means with the [`WeightTable`], normalized by the
//!    total weight of the kinds that are actually present.
//! 4. Apply the fixed [`Reducer`] from `D_raw` to `D_out`.
//! 5. L2-normalize (optional, on by default).
//!
//! The reducer is linear, so reducing before or after averaging gives the
//! same vector. Query vectors go through the exact same reducer as stored
//! vectors, which keeps cosine scores comparable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::embedding::l2_normalize;
use crate::error::{FusionError, Result};
use crate::models::{ComponentVector, ProfileVector, SourceKind};
use crate::weights::{HybridWeights, WeightTable};

/// How raw model vectors are brought down to the index dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Reduction {
    /// Keep the first `D_out` coordinates. Suited to models trained with
    /// nested (Matryoshka) representations.
    Truncate,
    /// Multiply by a fixed `D_out × D_raw` matrix of `±1/√D_out` entries
    /// generated from `seed`.
    Projection { seed: u64 },
}

/// A fixed linear map from `in_dims` to `out_dims`.
#[derive(Debug, Clone)]
pub struct Reducer {
    in_dims: usize,
    out_dims: usize,
    matrix: Option<Vec<f32>>,
}

impl Reducer {
    pub fn new(in_dims: usize, out_dims: usize, reduction: Reduction) -> Result<Self> {
        if in_dims == 0 || out_dims == 0 {
            return Err(FusionError::Config(
                "embedding dimensions must be > 0".to_string(),
            ));
        }
        if out_dims > in_dims {
            return Err(FusionError::Config(format!(
                "output dimension {} exceeds model dimension {}",
                out_dims, in_dims
            )));
        }

        let matrix = match reduction {
            _ if in_dims == out_dims => None,
            Reduction::Truncate => None,
            Reduction::Projection { seed } => Some(random_sign_matrix(seed, out_dims, in_dims)),
        };

        Ok(Self {
            in_dims,
            out_dims,
            matrix,
        })
    }

    pub fn in_dims(&self) -> usize {
        self.in_dims
    }

    pub fn out_dims(&self) -> usize {
        self.out_dims
    }

    /// Apply the map. `v` must have `in_dims` elements.
    pub fn apply(&self, v: &[f32]) -> Result<Vec<f32>> {
        if v.len() != self.in_dims {
            return Err(FusionError::DimensionMismatch {
                expected: self.in_dims,
                actual: v.len(),
            });
        }
        match &self.matrix {
            None => Ok(v[..self.out_dims].to_vec()),
            Some(m) => Ok(m
                .chunks_exact(self.in_dims)
                .map(|row| row.iter().zip(v).map(|(a, b)| a * b).sum())
                .collect()),
        }
    }
}

fn random_sign_matrix(seed: u64, rows: usize, cols: usize) -> Vec<f32> {
    let scale = 1.0 / (rows as f32).sqrt();
    let mut state = seed;
    (0..rows * cols)
        .map(|_| {
            if splitmix64(&mut state) & 1 == 0 {
                scale
            } else {
                -scale
            }
        })
        .collect()
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Fuses component vectors into profile vectors and builds query vectors
/// in the same space.
#[derive(Debug, Clone)]
pub struct EmbeddingAggregator {
    weights: WeightTable,
    reducer: Reducer,
    normalize: bool,
}

impl EmbeddingAggregator {
    pub fn new(weights: WeightTable, reducer: Reducer, normalize: bool) -> Result<Self> {
        weights.validate()?;
        Ok(Self {
            weights,
            reducer,
            normalize,
        })
    }

    pub fn weights(&self) -> &WeightTable {
        &self.weights
    }

    pub fn output_dims(&self) -> usize {
        self.reducer.out_dims()
    }

    pub fn raw_dims(&self) -> usize {
        self.reducer.in_dims()
    }

    /// Aggregate with the configured weight table.
    pub fn aggregate(&self, components: &[ComponentVector]) -> Result<ProfileVector> {
        self.aggregate_with(components, &self.weights)
    }

    /// Aggregate with an explicit weight table.
    pub fn aggregate_with(
        &self,
        components: &[ComponentVector],
        weights: &WeightTable,
    ) -> Result<ProfileVector> {
        if components.is_empty() {
            return Err(FusionError::InsufficientData(
                "no components to aggregate".to_string(),
            ));
        }
        weights.validate()?;

        let dims = self.reducer.in_dims();
        let mut groups: BTreeMap<SourceKind, (Vec<f32>, usize)> = BTreeMap::new();
        for c in components {
            if c.vector.len() != dims {
                return Err(FusionError::DimensionMismatch {
                    expected: dims,
                    actual: c.vector.len(),
                });
            }
            let (sum, n) = groups.entry(c.kind).or_insert_with(|| (vec![0.0; dims], 0));
            for (s, x) in sum.iter_mut().zip(&c.vector) {
                *s += x;
            }
            *n += 1;
        }

        let total: f32 = groups.keys().map(|k| weights.get(*k)).sum();
        if total <= 0.0 {
            return Err(FusionError::InsufficientData(
                "combined weight of available components is zero".to_string(),
            ));
        }

        let mut combined = vec![0.0f32; dims];
        for (kind, (sum, n)) in &groups {
            let w = weights.get(*kind) / (total * *n as f32);
            if w == 0.0 {
                continue;
            }
            for (c, s) in combined.iter_mut().zip(sum) {
                *c += w * s;
            }
        }

        self.finish(&combined)
    }

    /// Build a query vector from an optional image embedding and a text
    /// embedding, weighted by the hybrid split.
    ///
    /// Without an image the text embedding is used alone regardless of
    /// `weights`.
    pub fn aggregate_query(
        &self,
        image: Option<&[f32]>,
        text: &[f32],
        weights: HybridWeights,
    ) -> Result<ProfileVector> {
        let dims = self.reducer.in_dims();
        if text.len() != dims {
            return Err(FusionError::DimensionMismatch {
                expected: dims,
                actual: text.len(),
            });
        }
        let Some(image) = image else {
            return self.project(text);
        };
        if image.len() != dims {
            return Err(FusionError::DimensionMismatch {
                expected: dims,
                actual: image.len(),
            });
        }

        let total = weights.image + weights.text;
        if !(total > 0.0) || weights.image < 0.0 || weights.text < 0.0 {
            return Err(FusionError::InsufficientData(
                "hybrid weights sum to zero".to_string(),
            ));
        }
        let combined: Vec<f32> = image
            .iter()
            .zip(text)
            .map(|(i, t)| (weights.image * i + weights.text * t) / total)
            .collect();
        self.finish(&combined)
    }

    /// Reduce and normalize a single raw vector (text query, exemplar).
    pub fn project(&self, raw: &[f32]) -> Result<ProfileVector> {
        self.finish(raw)
    }

    fn finish(&self, raw: &[f32]) -> Result<ProfileVector> {
        let mut reduced = self.reducer.apply(raw)?;
        if self.normalize && !l2_normalize(&mut reduced) {
            return Err(FusionError::InsufficientData(
                "aggregated vector has zero norm".to_string(),
            ));
        }
        Ok(ProfileVector(reduced))
    }
}
