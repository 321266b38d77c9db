//! Profile source: a JSON-lines export of scraped profiles.
//!
//! Each line is one profile object. Two post layouts are accepted:
//!
//! ```json
//! {"user_id": 1790342, "bio": "...", "posts": [{"url": "...", "caption": "..."}]}
//! {"user_id": 1790342, "bio": "...", "post_0_url": "...", "caption_0": "..."}
//! ```
//!
//! `follower_count` may be a number or scraped text (`"19.3K followers"`).
//! At most [`MAX_POSTS`] posts are kept per profile.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use profile_fusion_core::models::{parse_follower_count, FollowerTier, ProfilePayload, MAX_POSTS};

/// One post: an image and/or its caption.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostInput {
    pub image_url: Option<String>,
    pub caption: Option<String>,
}

/// A profile as read from the source, before embedding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileInput {
    pub id: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub bio: Option<String>,
    pub profile_pic_url: Option<String>,
    pub is_private: Option<bool>,
    pub follower_count: Option<u64>,
    pub influencer_type: Option<String>,
    pub posts: Vec<PostInput>,
}

impl ProfileInput {
    /// Non-empty captions, in post order.
    pub fn captions(&self) -> impl Iterator<Item = &str> {
        self.posts
            .iter()
            .filter_map(|p| p.caption.as_deref())
            .filter(|c| !c.trim().is_empty())
    }

    pub fn post_image_urls(&self) -> impl Iterator<Item = &str> {
        self.posts.iter().filter_map(|p| p.image_url.as_deref())
    }

    /// Payload stored next to the profile vector.
    pub fn payload(&self) -> ProfilePayload {
        ProfilePayload {
            username: self.username.clone(),
            full_name: self.full_name.clone(),
            bio: self.bio.clone(),
            follower_count: self.follower_count,
            category: self.follower_count.map(FollowerTier::from_count),
            account_type: None,
            influencer_type: self.influencer_type.clone(),
            is_private: self.is_private,
            profile_pic_url: self.profile_pic_url.clone(),
            extra: Map::new(),
        }
    }

    /// SHA-256 over everything that feeds the profile vector or payload.
    ///
    /// Used by the indexer to skip profiles whose content has not changed.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |name: &str, value: Option<&str>| {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.unwrap_or("").as_bytes());
            hasher.update([0u8]);
        };
        field("username", self.username.as_deref());
        field("full_name", self.full_name.as_deref());
        field("bio", self.bio.as_deref());
        field("profile_pic_url", self.profile_pic_url.as_deref());
        field("influencer_type", self.influencer_type.as_deref());
        let followers = self.follower_count.map(|n| n.to_string());
        field("follower_count", followers.as_deref());
        let private = self.is_private.map(|b| b.to_string());
        field("is_private", private.as_deref());
        for post in &self.posts {
            field("post_url", post.image_url.as_deref());
            field("caption", post.caption.as_deref());
        }
        hex::encode(hasher.finalize())
    }
}

/// Parse one JSON object into a profile.
pub fn parse_profile(value: &Value) -> Result<ProfileInput> {
    let Some(obj) = value.as_object() else {
        bail!("profile must be a JSON object");
    };

    let username = text(obj, "username").or_else(|| text(obj, "instagram_username"));
    let id = id_field(obj, "user_id")
        .or_else(|| id_field(obj, "id"))
        .or_else(|| username.clone())
        .context("profile has no user_id, id or username")?;

    let follower_count = match obj.get("follower_count") {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Some(Value::String(s)) => parse_follower_count(s),
        _ => None,
    };

    Ok(ProfileInput {
        id,
        username,
        full_name: text(obj, "full_name"),
        bio: text(obj, "bio").or_else(|| text(obj, "biography")),
        profile_pic_url: text(obj, "profile_pic_url_hd").or_else(|| text(obj, "profile_pic_url")),
        is_private: obj.get("is_private").and_then(Value::as_bool),
        follower_count,
        influencer_type: text(obj, "influencer_type"),
        posts: posts(obj),
    })
}

/// Load every profile from a JSON-lines file. Blank lines are skipped; a
/// malformed line fails the whole load with its line number.
pub fn load_profiles(path: &Path) -> Result<Vec<ProfileInput>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read profile source: {}", path.display()))?;
    parse_profiles(&content)
}

pub fn parse_profiles(content: &str) -> Result<Vec<ProfileInput>> {
    let mut profiles = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON on line {}", lineno + 1))?;
        let profile =
            parse_profile(&value).with_context(|| format!("Invalid profile on line {}", lineno + 1))?;
        profiles.push(profile);
    }
    Ok(profiles)
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn id_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn posts(obj: &Map<String, Value>) -> Vec<PostInput> {
    if let Some(array) = obj.get("posts").and_then(Value::as_array) {
        return array
            .iter()
            .filter_map(Value::as_object)
            .map(|p| PostInput {
                image_url: text(p, "url")
                    .or_else(|| text(p, "image_url"))
                    .or_else(|| text(p, "display_url")),
                caption: text(p, "caption"),
            })
            .filter(|p| p.image_url.is_some() || p.caption.is_some())
            .take(MAX_POSTS)
            .collect();
    }

    (0..MAX_POSTS)
        .map(|i| PostInput {
            image_url: text(obj, &format!("post_{}_url", i)),
            caption: text(obj, &format!("caption_{}", i)),
        })
        .filter(|p| p.image_url.is_some() || p.caption.is_some())
        .collect()
}
