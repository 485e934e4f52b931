//! Resource key codec
//!
//! A hot-tier counter is addressed by the tuple
//! `(time_bucket, subscription_id, resource_type, resource_id)`, flattened to
//! a single string:
//!
//! ```text
//! {YYYYMMDDHH}:{subscription_id}:{resource_type}:{resource_id}
//! 2024030108:42:node:100
//! ```
//!
//! `resource_type` must not contain the delimiter, otherwise the encoding would
//! be ambiguous. Every entry point validates it through
//! [`ResourceType::parse`].

use crate::error::{LedgerError, Result};
use crate::types::{BusinessZone, TimeBucket};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Field delimiter of the flat key encoding
pub const KEY_DELIMITER: char = ':';

/// Longest accepted resource type tag, in bytes
pub const MAX_RESOURCE_TYPE_LEN: usize = 32;

/// Kind of metered resource
///
/// Known kinds are enum variants; anything else travels as `Custom` so the
/// string-based storage format stays forward compatible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceType {
    /// Edge node traffic
    Node,
    /// Port-forwarding rule traffic
    ForwardRule,
    /// Subscription-level traffic
    Subscription,
    /// Any other validated tag
    Custom(String),
}

impl ResourceType {
    /// Parse and validate a resource type tag
    ///
    /// Rejects empty tags, tags longer than [`MAX_RESOURCE_TYPE_LEN`], tags
    /// containing the key delimiter and tags with whitespace or control
    /// characters.
    pub fn parse(tag: &str) -> Result<Self> {
        if tag.is_empty() {
            return Err(LedgerError::Validation(
                "resource type cannot be empty".to_string(),
            ));
        }
        if tag.len() > MAX_RESOURCE_TYPE_LEN {
            return Err(LedgerError::Validation(format!(
                "resource type exceeds {} bytes: {:?}",
                MAX_RESOURCE_TYPE_LEN, tag
            )));
        }
        if tag.contains(KEY_DELIMITER) {
            return Err(LedgerError::Validation(format!(
                "resource type must not contain '{}': {:?}",
                KEY_DELIMITER, tag
            )));
        }
        if tag.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(LedgerError::Validation(format!(
                "resource type contains whitespace or control characters: {:?}",
                tag
            )));
        }

        Ok(match tag {
            "node" => ResourceType::Node,
            "forward_rule" => ResourceType::ForwardRule,
            "subscription" => ResourceType::Subscription,
            other => ResourceType::Custom(other.to_string()),
        })
    }

    /// Wire/storage tag
    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::Node => "node",
            ResourceType::ForwardRule => "forward_rule",
            ResourceType::Subscription => "subscription",
            ResourceType::Custom(tag) => tag,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceType {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ResourceType> for String {
    fn from(value: ResourceType) -> Self {
        value.as_str().to_string()
    }
}

/// Address of one hot-tier counter
///
/// Immutable once constructed; equality is exact per tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    bucket: TimeBucket,
    subscription_id: u64,
    resource_type: ResourceType,
    resource_id: u64,
}

impl ResourceKey {
    /// Build a key from already-validated parts
    pub fn new(
        bucket: TimeBucket,
        subscription_id: u64,
        resource_type: ResourceType,
        resource_id: u64,
    ) -> Self {
        Self {
            bucket,
            subscription_id,
            resource_type,
            resource_id,
        }
    }

    /// Build a key from a raw resource type tag, validating it
    pub fn from_raw(
        bucket: TimeBucket,
        subscription_id: u64,
        resource_type: &str,
        resource_id: u64,
    ) -> Result<Self> {
        Ok(Self::new(
            bucket,
            subscription_id,
            ResourceType::parse(resource_type)?,
            resource_id,
        ))
    }

    /// Time bucket
    pub fn bucket(&self) -> TimeBucket {
        self.bucket
    }

    /// Owning subscription
    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    /// Resource type
    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    /// Resource identifier
    pub fn resource_id(&self) -> u64 {
        self.resource_id
    }

    /// Same resource in another bucket
    pub fn with_bucket(&self, bucket: TimeBucket) -> Self {
        Self {
            bucket,
            ..self.clone()
        }
    }

    /// Flat string encoding
    pub fn encode(&self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}",
            self.bucket.label(),
            self.subscription_id,
            self.resource_type,
            self.resource_id,
            d = KEY_DELIMITER
        )
    }

    /// Decode a flat key produced by [`ResourceKey::encode`]
    pub fn decode(encoded: &str, zone: &BusinessZone) -> Result<Self> {
        let parts: Vec<&str> = encoded.split(KEY_DELIMITER).collect();
        if parts.len() != 4 {
            return Err(LedgerError::Validation(format!(
                "resource key must have 4 fields, got {}: {:?}",
                parts.len(),
                encoded
            )));
        }

        let bucket = zone.parse_bucket(parts[0])?;
        let subscription_id = parse_id("subscription id", parts[1], encoded)?;
        let resource_type = ResourceType::parse(parts[2])?;
        let resource_id = parse_id("resource id", parts[3], encoded)?;

        Ok(Self::new(bucket, subscription_id, resource_type, resource_id))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn parse_id(field: &str, raw: &str, encoded: &str) -> Result<u64> {
    raw.parse().map_err(|_| {
        LedgerError::Validation(format!("invalid {} {:?} in key {:?}", field, raw, encoded))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bucket() -> TimeBucket {
        BusinessZone::default().bucket_of(Utc.with_ymd_and_hms(2024, 3, 1, 0, 15, 0).unwrap())
    }

    #[test]
    fn test_encode_layout() {
        let key = ResourceKey::new(bucket(), 42, ResourceType::Node, 100);
        assert_eq!(key.encode(), "2024030108:42:node:100");
    }

    #[test]
    fn test_decode_round_trip() {
        let zone = BusinessZone::default();
        let key = ResourceKey::new(bucket(), 7, ResourceType::Custom("relay".into()), 9);
        let decoded = ResourceKey::decode(&key.encode(), &zone).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_known_types_map_to_variants() {
        assert_eq!(ResourceType::parse("node").unwrap(), ResourceType::Node);
        assert_eq!(
            ResourceType::parse("forward_rule").unwrap(),
            ResourceType::ForwardRule
        );
        assert_eq!(
            ResourceType::parse("subscription").unwrap(),
            ResourceType::Subscription
        );
        assert_eq!(
            ResourceType::parse("tunnel").unwrap(),
            ResourceType::Custom("tunnel".into())
        );
    }

    #[test]
    fn test_delimiter_rejected() {
        let err = ResourceType::parse("node:evil").unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(ResourceKey::from_raw(bucket(), 1, "a:b", 1).is_err());
    }

    #[test]
    fn test_malformed_tags_rejected() {
        assert!(ResourceType::parse("").is_err());
        assert!(ResourceType::parse("has space").is_err());
        assert!(ResourceType::parse(&"x".repeat(MAX_RESOURCE_TYPE_LEN + 1)).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let zone = BusinessZone::default();
        assert!(ResourceKey::decode("2024030108:42:node", &zone).is_err());
        assert!(ResourceKey::decode("2024030108:x:node:1", &zone).is_err());
        assert!(ResourceKey::decode("2024030108:1:node:-1", &zone).is_err());
        assert!(ResourceKey::decode("20240301:1:node:1", &zone).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let parsed: std::result::Result<ResourceType, _> = serde_json::from_str("\"a:b\"");
        assert!(parsed.is_err());
        let parsed: ResourceType = serde_json::from_str("\"forward_rule\"").unwrap();
        assert_eq!(parsed, ResourceType::ForwardRule);
    }
}
