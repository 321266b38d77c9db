//! Modality weights: the per-kind aggregation table and the image/text
//! split used for hybrid queries.
//!
//! The keyword scorer here is the deterministic path of weight analysis.
//! It needs no external service and always produces an answer, so the
//! application can fall back to it whenever the intent model fails.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, Result};
use crate::models::SourceKind;

/// Relative importance of each source kind during aggregation.
///
/// One typed field per [`SourceKind`]; values are non-negative and need
/// not sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    #[serde(default = "default_bio")]
    pub bio: f32,
    #[serde(default = "default_profile_pic")]
    pub profile_pic: f32,
    #[serde(default = "default_caption")]
    pub caption: f32,
    #[serde(default = "default_post_image")]
    pub post_image: f32,
}

fn default_bio() -> f32 {
    3.0
}
fn default_profile_pic() -> f32 {
    2.0
}
fn default_caption() -> f32 {
    1.0
}
fn default_post_image() -> f32 {
    1.0
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            bio: default_bio(),
            profile_pic: default_profile_pic(),
            caption: default_caption(),
            post_image: default_post_image(),
        }
    }
}

impl WeightTable {
    /// Build a validated table.
    pub fn new(bio: f32, profile_pic: f32, caption: f32, post_image: f32) -> Result<Self> {
        let table = Self {
            bio,
            profile_pic,
            caption,
            post_image,
        };
        table.validate()?;
        Ok(table)
    }

    pub fn get(&self, kind: SourceKind) -> f32 {
        match kind {
            SourceKind::Bio => self.bio,
            SourceKind::ProfilePic => self.profile_pic,
            SourceKind::Caption => self.caption,
            SourceKind::PostImage => self.post_image,
        }
    }

    /// Return a copy with one kind's weight replaced.
    pub fn with(mut self, kind: SourceKind, weight: f32) -> Self {
        match kind {
            SourceKind::Bio => self.bio = weight,
            SourceKind::ProfilePic => self.profile_pic = weight,
            SourceKind::Caption => self.caption = weight,
            SourceKind::PostImage => self.post_image = weight,
        }
        self
    }

    /// Every weight must be finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        for kind in SourceKind::ALL {
            let w = self.get(kind);
            if !w.is_finite() || w < 0.0 {
                return Err(FusionError::InvalidWeight {
                    field: kind.as_str().to_string(),
                    value: w,
                });
            }
        }
        Ok(())
    }
}

/// Image vs text weight for a hybrid query. The two sum to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    pub image: f32,
    pub text: f32,
}

impl HybridWeights {
    /// Build from an image weight; text takes the remainder. Both are
    /// clamped to `[0, 1]` and rounded to one decimal.
    pub fn from_image(image: f32) -> Self {
        let image = round1(image.clamp(0.0, 1.0));
        Self {
            image,
            text: round1(1.0 - image),
        }
    }

    /// Equal split, used when nothing better is known.
    pub fn neutral() -> Self {
        Self::from_image(0.5)
    }

    pub fn text_only() -> Self {
        Self::from_image(0.0)
    }
}

fn round1(x: f32) -> f32 {
    (x * 10.0).round() / 10.0
}

/// Strong image-intent phrases that settle the split without consulting
/// the intent model.
pub const IMAGE_INTENT_PHRASES: &[&str] = &[
    "similar to this",
    "like this image",
    "matching this",
    "same style as this",
    "looks like this",
    "resembles this",
    "comparable to this",
    "in the style of this",
    "based on this image",
    "find profiles like this",
    "show me similar to this",
    "who looks like this",
    "profiles matching this",
];

/// Weights applied when an image-intent phrase is present.
pub const PHRASE_OVERRIDE_IMAGE_WEIGHT: f32 = 0.9;

const VISUAL_TERMS: &[&str] = &[
    "similar",
    "matching",
    "style",
    "look",
    "appearance",
    "like this",
    "resembles",
    "comparable",
];

const MIXED_TERMS: &[&str] = &[
    "with similar",
    "style and",
    "appearance of",
    "inspired by",
    "based on",
];

const DESCRIPTIVE_TERMS: &[&str] = &[
    "profiles",
    "accounts",
    "people",
    "search for",
    "find",
    "show me",
];

/// Image weight when the query carries no keyword signal at all.
pub const NO_SIGNAL_IMAGE_WEIGHT: f32 = 0.3;

/// Check the query against [`IMAGE_INTENT_PHRASES`].
pub fn phrase_override(query: &str) -> Option<HybridWeights> {
    let q = query.to_lowercase();
    IMAGE_INTENT_PHRASES
        .iter()
        .any(|p| q.contains(p))
        .then(|| HybridWeights::from_image(PHRASE_OVERRIDE_IMAGE_WEIGHT))
}

fn count_terms(query: &str, terms: &[&str]) -> usize {
    terms.iter().filter(|t| query.contains(*t)).count()
}

/// Deterministic keyword scoring of a hybrid query.
///
/// | signal | image weight |
/// |--------|--------------|
/// | visual terms only | 0.7, +0.1 per extra term, max 1.0 |
/// | descriptive terms only | 0.3, −0.1 per extra term, min 0.0 |
/// | both kinds, or any mixed phrase | 0.6 if visual terms outnumber descriptive ones, 0.4 if fewer, else 0.5 |
/// | nothing | 0.3 |
///
/// Returns `None` for a blank query.
pub fn keyword_weights(query: &str) -> Option<HybridWeights> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return None;
    }
    if let Some(w) = phrase_override(&q) {
        return Some(w);
    }

    let visual = count_terms(&q, VISUAL_TERMS);
    let descriptive = count_terms(&q, DESCRIPTIVE_TERMS);
    let mixed = count_terms(&q, MIXED_TERMS);

    let image = match (visual, descriptive, mixed) {
        (0, 0, 0) => NO_SIGNAL_IMAGE_WEIGHT,
        (v, 0, 0) => (0.7 + 0.1 * (v as f32 - 1.0)).min(1.0),
        (0, d, 0) => (0.3 - 0.1 * (d as f32 - 1.0)).max(0.0),
        (v, d, _) => match v.cmp(&d) {
            Ordering::Greater => 0.6,
            Ordering::Less => 0.4,
            Ordering::Equal => 0.5,
        },
    };
    Some(HybridWeights::from_image(image))
}

/// Parse an intent-model reply of the form
/// `image_weight: X.X, text_weight: Y.Y`.
///
/// Both weights must be present, numeric, and within `[0, 1]`. The text
/// weight is reported by the model but the returned split always sums to
/// one, derived from the image weight.
pub fn parse_weight_response(response: &str) -> Option<HybridWeights> {
    let lowered = response.to_lowercase();
    let image = value_after(&lowered, "image_weight")?;
    let text = value_after(&lowered, "text_weight")?;
    if !(0.0..=1.0).contains(&image) || !(0.0..=1.0).contains(&text) {
        return None;
    }
    Some(HybridWeights::from_image(image))
}

fn value_after(haystack: &str, key: &str) -> Option<f32> {
    let start = haystack.find(key)? + key.len();
    let rest = haystack[start..].trim_start();
    let rest = rest.strip_prefix(':').or_else(|| rest.strip_prefix('='))?;
    let rest = rest.trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].trim_end_matches('.').parse().ok()
}
