//! Core data models used throughout profile fusion.
//!
//! These types represent the per-modality component vectors, the fused
//! profile records stored in the vector index, and the payload metadata
//! that search filters operate on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::weights::HybridWeights;

/// Maximum number of posts considered per profile.
pub const MAX_POSTS: usize = 12;

/// The modality a component vector was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Bio,
    ProfilePic,
    Caption,
    PostImage,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Bio,
        SourceKind::ProfilePic,
        SourceKind::Caption,
        SourceKind::PostImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Bio => "bio",
            SourceKind::ProfilePic => "profile_pic",
            SourceKind::Caption => "caption",
            SourceKind::PostImage => "post_image",
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, SourceKind::ProfilePic | SourceKind::PostImage)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One embedding derived from a single piece of profile content.
///
/// `index` distinguishes multiple instances of the same kind (the n-th
/// caption or post image); it is `None` for singletons such as the bio.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentVector {
    pub kind: SourceKind,
    pub index: Option<usize>,
    pub vector: Vec<f32>,
}

impl ComponentVector {
    pub fn new(kind: SourceKind, vector: Vec<f32>) -> Self {
        Self {
            kind,
            index: None,
            vector,
        }
    }

    pub fn indexed(kind: SourceKind, index: usize, vector: Vec<f32>) -> Self {
        Self {
            kind,
            index: Some(index),
            vector,
        }
    }
}

/// The fused, reduced and normalized vector for one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileVector(pub Vec<f32>);

impl ProfileVector {
    pub fn dims(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

/// Human vs brand account label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountLabel {
    Human,
    Brand,
}

impl AccountLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountLabel::Human => "human",
            AccountLabel::Brand => "brand",
        }
    }
}

impl fmt::Display for AccountLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "personal" | "individual" => Ok(AccountLabel::Human),
            "brand" | "business" | "company" => Ok(AccountLabel::Brand),
            other => Err(format!("unknown account label: '{}'", other)),
        }
    }
}

/// Audience-size bucket derived from the follower count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowerTier {
    None,
    Nano,
    Micro,
    Macro,
    Mega,
}

impl FollowerTier {
    /// Tier boundaries: 1K, 10K, 100K, 1M.
    pub fn from_count(followers: u64) -> Self {
        match followers {
            0..=999 => FollowerTier::None,
            1_000..=9_999 => FollowerTier::Nano,
            10_000..=99_999 => FollowerTier::Micro,
            100_000..=999_999 => FollowerTier::Macro,
            _ => FollowerTier::Mega,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FollowerTier::None => "none",
            FollowerTier::Nano => "nano",
            FollowerTier::Micro => "micro",
            FollowerTier::Macro => "macro",
            FollowerTier::Mega => "mega",
        }
    }
}

impl fmt::Display for FollowerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a follower count as scraped from profile pages.
///
/// Accepts plain integers (`"1204"`, `"1,204"`) and abbreviated forms with
/// an optional trailing word (`"19.3K followers"`, `"34.2M+ followers"`,
/// `"1.1B"`). Returns `None` when no number can be read.
pub fn parse_follower_count(raw: &str) -> Option<u64> {
    let lowered = raw.trim().to_ascii_lowercase();
    let token = lowered.split_whitespace().next()?;
    let token: String = token.chars().filter(|c| *c != ',' && *c != '+').collect();
    if token.is_empty() {
        return None;
    }

    let (number, multiplier) = match token.chars().last()? {
        'k' => (&token[..token.len() - 1], 1_000f64),
        'm' => (&token[..token.len() - 1], 1_000_000f64),
        'b' => (&token[..token.len() - 1], 1_000_000_000f64),
        _ => (token.as_str(), 1f64),
    };

    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

/// Payload keys owned by the account classifier. Re-indexing a profile
/// keeps them.
pub const CLASSIFICATION_KEYS: [&str; 3] = [
    "account_type",
    "account_type_confidence",
    "account_type_ambiguous",
];

/// Metadata stored alongside each profile vector.
///
/// Serialized as a flat JSON object so filters can address fields by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follower_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FollowerTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_type: Option<AccountLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub influencer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProfilePayload {
    /// Render the payload as a JSON object for filtering and storage.
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Rebuild a payload from a stored JSON object. Unknown keys land in `extra`.
    pub fn from_json(map: serde_json::Map<String, serde_json::Value>) -> Self {
        serde_json::from_value(serde_json::Value::Object(map.clone())).unwrap_or_else(|_| Self {
            extra: map,
            ..Self::default()
        })
    }

    /// Merge a set of fields into the payload, overwriting existing keys.
    pub fn merge(&mut self, fields: &serde_json::Map<String, serde_json::Value>) {
        let mut map = self.to_json();
        for (k, v) in fields {
            map.insert(k.clone(), v.clone());
        }
        *self = Self::from_json(map);
    }

    /// Copy the classifier's fields from an earlier payload of the same profile.
    pub fn carry_classification(&mut self, previous: &ProfilePayload) {
        let previous = previous.to_json();
        let fields: serde_json::Map<String, serde_json::Value> = CLASSIFICATION_KEYS
            .iter()
            .filter_map(|k| previous.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();
        if !fields.is_empty() {
            self.merge(&fields);
        }
    }
}

/// A profile as stored in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ProfilePayload,
}

/// A search request combining free text, an optional image, and the
/// modality weights chosen for it.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridQuery {
    pub raw_text: String,
    pub image_reference: Option<String>,
    pub weights: HybridWeights,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_follower_count_forms() {
        assert_eq!(parse_follower_count("1204"), Some(1204));
        assert_eq!(parse_follower_count("1,204 followers"), Some(1204));
        assert_eq!(parse_follower_count("19.3K followers"), Some(19_300));
        assert_eq!(parse_follower_count("34.2M+ followers"), Some(34_200_000));
        assert_eq!(parse_follower_count("1.1b"), Some(1_100_000_000));
        assert_eq!(parse_follower_count(""), None);
        assert_eq!(parse_follower_count("followers"), None);
    }

    #[test]
    fn test_follower_tiers() {
        assert_eq!(FollowerTier::from_count(0), FollowerTier::None);
        assert_eq!(FollowerTier::from_count(999), FollowerTier::None);
        assert_eq!(FollowerTier::from_count(1_000), FollowerTier::Nano);
        assert_eq!(FollowerTier::from_count(19_300), FollowerTier::Micro);
        assert_eq!(FollowerTier::from_count(250_000), FollowerTier::Macro);
        assert_eq!(FollowerTier::from_count(34_200_000), FollowerTier::Mega);
    }

    #[test]
    fn test_carry_classification_keeps_only_classifier_fields() {
        let mut old = ProfilePayload {
            bio: Some("old bio".into()),
            ..Default::default()
        };
        let mut fields = serde_json::Map::new();
        fields.insert("account_type".into(), serde_json::json!("brand"));
        fields.insert("account_type_confidence".into(), serde_json::json!(0.8));
        fields.insert("account_type_ambiguous".into(), serde_json::json!(false));
        old.merge(&fields);

        let mut fresh = ProfilePayload {
            bio: Some("new bio".into()),
            follower_count: Some(13_000),
            ..Default::default()
        };
        fresh.carry_classification(&old);
        assert_eq!(fresh.account_type, Some(AccountLabel::Brand));
        assert_eq!(fresh.extra["account_type_confidence"], 0.8);
        assert_eq!(fresh.extra["account_type_ambiguous"], false);
        assert_eq!(fresh.bio.as_deref(), Some("new bio"));
        assert_eq!(fresh.follower_count, Some(13_000));

        let mut unclassified = ProfilePayload::default();
        unclassified.carry_classification(&ProfilePayload::default());
        assert_eq!(unclassified, ProfilePayload::default());
    }

    #[test]
    fn test_payload_json_is_flat() {
        let mut payload = ProfilePayload {
            username: Some("sydneypt".into()),
            follower_count: Some(19_300),
            category: Some(FollowerTier::Micro),
            ..Default::default()
        };
        let json = payload.to_json();
        assert_eq!(json["username"], "sydneypt");
        assert_eq!(json["category"], "micro");
        assert!(!json.contains_key("bio"));

        let mut fields = serde_json::Map::new();
        fields.insert("account_type".into(), serde_json::json!("human"));
        fields.insert("account_type_confidence".into(), serde_json::json!(0.9));
        payload.merge(&fields);
        assert_eq!(payload.account_type, Some(AccountLabel::Human));
        assert_eq!(payload.extra["account_type_confidence"], 0.9);
        assert_eq!(payload.username.as_deref(), Some("sydneypt"));
    }

    #[test]
    fn test_account_label_parse() {
        assert_eq!("Human".parse::<AccountLabel>(), Ok(AccountLabel::Human));
        assert_eq!(" brand ".parse::<AccountLabel>(), Ok(AccountLabel::Brand));
        assert!("robot".parse::<AccountLabel>().is_err());
    }
}
