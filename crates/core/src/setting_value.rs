use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{SettingId, ValueDigest};

/// Opaque payload of a setting.
///
/// Untagged so that the JSON wire form is the plain value (`"red"`, `3`,
/// `["text-2"]`). Maps are ordered, which keeps the MessagePack encoding and
/// therefore [`SettingValue::digest`] canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<SettingValue>),
    Map(BTreeMap<String, SettingValue>),
}

impl PartialEq for SettingValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for SettingValue {}

impl SettingValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SettingValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SettingValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            SettingValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[SettingValue]> {
        match self {
            SettingValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Setting ids referenced by a composite value: every text entry of a list.
    /// Entries that are not valid ids are skipped.
    pub fn referenced_ids(&self) -> Vec<SettingId> {
        self.as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|item| item.as_text())
            .filter_map(|s| SettingId::new(s).ok())
            .collect()
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    pub fn digest(&self) -> Result<ValueDigest, rmp_serde::encode::Error> {
        let bytes = self.to_msgpack()?;
        Ok(ValueDigest::from_bytes(*blake3::hash(&bytes).as_bytes()))
    }
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for SettingValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for SettingValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}
