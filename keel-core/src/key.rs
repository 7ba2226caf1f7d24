//! Hierarchical entity identifiers.
//!
//! An [`Identifier`] names exactly one entity: a kind, a local id (either a
//! string name or an integer) and an optional parent identifier. Parent chains
//! are shared behind an `Arc`, so cloning an identifier never copies its
//! ancestors.
//!
//! # Wire Format
//!
//! Each level of the chain, starting at the leaf, is written as:
//!
//! ```text
//! [kind len: u32 BE][kind][string_id len: u32 BE][string_id][int_id: i64 BE][has_parent: u8]
//! ```
//!
//! The bytes are URL-safe base64 encoded with the `=` padding replaced by `.`,
//! so the result can be dropped into a URL path segment or a JSON string as-is.
//! The zero identifier encodes to the empty string.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::KeyError;

/// Replaces `=` in the wire form.
const WIRE_PAD: char = '.';

/// Size of the fixed part of one encoded level (two lengths, the int id, the continuation byte).
const LEVEL_FIXED_LEN: usize = 4 + 4 + 8 + 1;

/// A hierarchical composite key.
///
/// Either the zero identifier (see [`Identifier::is_zero`]) or a kind plus a
/// local id. At most one of `string_id` / `int_id` is expected to be set per
/// level; an identifier with neither is *incomplete* and gets its int id
/// assigned by the store on first put.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    kind: String,
    string_id: String,
    int_id: i64,
    parent: Option<Arc<Identifier>>,
}

impl Identifier {
    /// Build an identifier from its parts. No validation beyond shape.
    pub fn new(
        kind: impl Into<String>,
        string_id: impl Into<String>,
        int_id: i64,
        parent: Option<Identifier>,
    ) -> Self {
        Self {
            kind: kind.into(),
            string_id: string_id.into(),
            int_id,
            parent: parent.map(Arc::new),
        }
    }

    /// Identifier with a string local id.
    pub fn with_name(
        kind: impl Into<String>,
        name: impl Into<String>,
        parent: Option<Identifier>,
    ) -> Self {
        Self::new(kind, name, 0, parent)
    }

    /// Identifier with an integer local id.
    pub fn with_int(kind: impl Into<String>, int_id: i64, parent: Option<Identifier>) -> Self {
        Self::new(kind, "", int_id, parent)
    }

    /// Identifier for an entity that has not been stored yet.
    pub fn incomplete(kind: impl Into<String>, parent: Option<Identifier>) -> Self {
        Self::new(kind, "", 0, parent)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn string_id(&self) -> &str {
        &self.string_id
    }

    pub fn int_id(&self) -> i64 {
        self.int_id
    }

    pub fn parent(&self) -> Option<&Identifier> {
        self.parent.as_deref()
    }

    /// True for the empty identifier, which has no kind and no ancestors.
    pub fn is_zero(&self) -> bool {
        self.kind.is_empty()
            && self.string_id.is_empty()
            && self.int_id == 0
            && self.parent.is_none()
    }

    /// True when the identifier has a kind but no local id yet.
    pub fn is_incomplete(&self) -> bool {
        !self.kind.is_empty() && self.string_id.is_empty() && self.int_id == 0
    }

    /// Same kind and parent, with the given integer id filled in.
    pub fn complete_with(&self, int_id: i64) -> Self {
        Self {
            kind: self.kind.clone(),
            string_id: String::new(),
            int_id,
            parent: self.parent.clone(),
        }
    }

    /// Walk the chain from this identifier up to the root, inclusive.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors { next: Some(self) }
    }

    /// The topmost identifier of the chain.
    pub fn root(&self) -> &Identifier {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Number of levels in the chain; the zero identifier has depth 0.
    pub fn depth(&self) -> usize {
        if self.is_zero() {
            0
        } else {
            self.ancestors().count()
        }
    }

    /// True if `other` is this identifier or one of its ancestors.
    pub fn has_ancestor(&self, other: &Identifier) -> bool {
        self.ancestors().any(|a| a == other)
    }

    /// Human readable form for logs, e.g. `Account,12/SoundZone,"lobby"`.
    pub fn path(&self) -> String {
        if self.is_zero() {
            return String::from("<zero>");
        }
        let mut levels: Vec<String> = self
            .ancestors()
            .map(|k| {
                if k.string_id.is_empty() {
                    format!("{},{}", k.kind, k.int_id)
                } else {
                    format!("{},{:?}", k.kind, k.string_id)
                }
            })
            .collect();
        levels.reverse();
        levels.join("/")
    }

    /// Binary form, leaf level first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.is_zero() {
            return out;
        }
        let mut level = Some(self);
        while let Some(key) = level {
            write_str(&mut out, &key.kind);
            write_str(&mut out, &key.string_id);
            out.extend_from_slice(&key.int_id.to_be_bytes());
            level = key.parent();
            out.push(u8::from(level.is_some()));
        }
        out
    }

    /// Inverse of [`Identifier::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        if bytes.len() < LEVEL_FIXED_LEN {
            return Err(KeyError::Malformed {
                reason: format!("{} bytes is shorter than one level", bytes.len()),
            });
        }

        let mut reader = Reader { bytes, pos: 0 };
        let mut levels = Vec::new();
        loop {
            let kind = reader.read_str()?;
            let string_id = reader.read_str()?;
            let int_id = reader.read_i64()?;
            levels.push((kind, string_id, int_id));
            match reader.read_u8()? {
                0 => break,
                1 => continue,
                other => {
                    return Err(KeyError::Malformed {
                        reason: format!("invalid continuation byte {other:#04x}"),
                    })
                }
            }
        }
        if reader.remaining() != 0 {
            return Err(KeyError::Malformed {
                reason: format!("{} trailing bytes", reader.remaining()),
            });
        }

        let mut key: Option<Identifier> = None;
        for (kind, string_id, int_id) in levels.into_iter().rev() {
            key = Some(Identifier {
                kind,
                string_id,
                int_id,
                parent: key.map(Arc::new),
            });
        }
        key.ok_or_else(|| KeyError::Malformed {
            reason: "no levels decoded".to_string(),
        })
    }

    /// Wire form: URL-safe base64 with `.` padding.
    pub fn encode(&self) -> String {
        URL_SAFE
            .encode(self.to_bytes())
            .replace('=', &WIRE_PAD.to_string())
    }

    /// Parse the wire form produced by [`Identifier::encode`].
    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        let padded = encoded.replace(WIRE_PAD, "=");
        let bytes = URL_SAFE.decode(padded).map_err(|e| KeyError::Malformed {
            reason: e.to_string(),
        })?;
        Self::from_bytes(&bytes)
    }
}

/// Iterator over an identifier and its ancestors, leaf first.
#[derive(Debug, Clone)]
pub struct Ancestors<'a> {
    next: Option<&'a Identifier>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Identifier;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent();
        Some(current)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Identifier {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

fn write_str(out: &mut Vec<u8>, value: &str) {
    // Lengths beyond u32 are not representable; identifiers are far smaller in practice.
    let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&value.as_bytes()[..len as usize]);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], KeyError> {
        if self.remaining() < n {
            return Err(KeyError::Malformed {
                reason: format!(
                    "truncated at byte {}: wanted {} more, have {}",
                    self.pos,
                    n,
                    self.remaining()
                ),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, KeyError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, KeyError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn read_i64(&mut self) -> Result<i64, KeyError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(buf))
    }

    fn read_str(&mut self) -> Result<String, KeyError> {
        let len = self.read_u32()? as usize;
        // A string can never be longer than what is left minus the rest of its level.
        if len > self.remaining() {
            return Err(KeyError::Malformed {
                reason: format!("string length {len} exceeds input"),
            });
        }
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| KeyError::Malformed {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> Identifier {
        let account = Identifier::with_int("Account", 12, None);
        Identifier::with_name("SoundZone", "lobby", Some(account))
    }

    #[test]
    fn test_accessors() {
        let key = zone();
        assert_eq!(key.kind(), "SoundZone");
        assert_eq!(key.string_id(), "lobby");
        assert_eq!(key.int_id(), 0);
        let parent = key.parent().expect("zone has a parent");
        assert_eq!(parent.kind(), "Account");
        assert_eq!(parent.int_id(), 12);
        assert!(parent.parent().is_none());
    }

    #[test]
    fn test_zero_identifier() {
        let zero = Identifier::default();
        assert!(zero.is_zero());
        assert!(!zero.is_incomplete());
        assert_eq!(zero.encode(), "");
        assert_eq!(Identifier::decode("").unwrap(), zero);
        assert_eq!(zero.depth(), 0);
        assert_ne!(zero, Identifier::incomplete("Account", None));
    }

    #[test]
    fn test_incomplete_and_complete_with() {
        let parent = Identifier::with_int("Account", 1, None);
        let key = Identifier::incomplete("Schedule", Some(parent.clone()));
        assert!(key.is_incomplete());

        let done = key.complete_with(99);
        assert!(!done.is_incomplete());
        assert_eq!(done.int_id(), 99);
        assert_eq!(done.parent(), Some(&parent));
    }

    #[test]
    fn test_ancestors_leaf_first() {
        let key = zone();
        let kinds: Vec<&str> = key.ancestors().map(|k| k.kind()).collect();
        assert_eq!(kinds, vec!["SoundZone", "Account"]);
        assert_eq!(key.root().kind(), "Account");
        assert_eq!(key.depth(), 2);
        assert!(key.has_ancestor(key.root()));
        assert!(key.has_ancestor(&key));
        assert!(!key.root().has_ancestor(&key));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = zone();
        let encoded = key.encode();
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('+'));
        assert_eq!(Identifier::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn test_empty_kind_with_parent_is_not_zero() {
        let key = Identifier::new("", "", 0, Some(Identifier::with_int("A", 1, None)));
        assert!(!key.is_zero());
        assert_eq!(Identifier::decode(&key.encode()).unwrap(), key);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Identifier::decode("!!!not base64!!!").is_err());
        // Valid base64, truncated level.
        let truncated = URL_SAFE.encode([0u8, 0, 0, 9, b'a']);
        assert!(Identifier::decode(&truncated).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = zone().to_bytes();
        bytes.push(7);
        assert!(Identifier::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_continuation() {
        let mut bytes = Identifier::with_int("A", 1, None).to_bytes();
        let last = bytes.len() - 1;
        bytes[last] = 2;
        let err = Identifier::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("continuation"));
    }

    #[test]
    fn test_level_fixed_len_matches_encoding() {
        let key = Identifier::new("", "", 0, Some(Identifier::default()));
        // Two levels, both with empty strings.
        assert_eq!(key.to_bytes().len(), 2 * LEVEL_FIXED_LEN);
    }

    #[test]
    fn test_serde_as_string() {
        let key = zone();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.encode()));
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<Identifier>("\"%%%\"").is_err());
    }

    #[test]
    fn test_display_from_str() {
        let key = zone();
        let parsed: Identifier = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_path() {
        assert_eq!(zone().path(), "Account,12/SoundZone,\"lobby\"");
        assert_eq!(Identifier::default().path(), "<zero>");
    }
}
