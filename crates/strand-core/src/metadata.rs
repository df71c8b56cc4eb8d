//! Call metadata: a lowercase-keyed header map exchanged alongside a call.
//!
//! Entries are either ASCII (printable text) or binary. Keys ending in
//! `-bin` MUST hold binary values and all other keys MUST hold ASCII values;
//! both rules are enforced at insertion. Keys are case-insensitive and
//! stored lowercase.
//!
//! Multi-valued keys are not supported: the map is last-write-wins. The
//! gRPC wire format technically allows repeated keys; carrying the
//! single-value simplification forward keeps the map API flat, and no
//! reserved key consumed by the core is ever repeated.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;

/// Suffix marking a key as binary-valued.
pub const BIN_SUFFIX: &str = "-bin";

/// Keys the core owns. User-facing insertion rejects these; the framing
/// layer writes them through crate-internal constructors.
fn is_reserved(key: &str) -> bool {
    key.starts_with(':') || key.starts_with("grpc-") || key == "content-type"
}

/// A single metadata value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

/// Errors from metadata construction and parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// Key is empty or contains characters outside `[a-z0-9_.-]`.
    InvalidKey(String),
    /// Key is reserved for the core (`:pseudo`, `grpc-*`, `content-type`).
    ReservedKey(String),
    /// ASCII value required for a non `-bin` key.
    ExpectedAscii(String),
    /// Binary value required for a `-bin` key.
    ExpectedBinary(String),
    /// Value contains bytes outside the printable ASCII range.
    NotPrintable(String),
    /// Header block could not be parsed.
    Malformed(String),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::InvalidKey(k) => write!(f, "invalid metadata key {:?}", k),
            MetadataError::ReservedKey(k) => write!(f, "metadata key {:?} is reserved", k),
            MetadataError::ExpectedAscii(k) => {
                write!(f, "key {:?} requires an ASCII value", k)
            }
            MetadataError::ExpectedBinary(k) => {
                write!(f, "key {:?} ends in -bin and requires a binary value", k)
            }
            MetadataError::NotPrintable(k) => {
                write!(f, "value for key {:?} contains non-printable bytes", k)
            }
            MetadataError::Malformed(msg) => write!(f, "malformed header block: {}", msg),
        }
    }
}

impl std::error::Error for MetadataError {}

fn validate_key(key: &str) -> Result<(), MetadataError> {
    if key.is_empty() {
        return Err(MetadataError::InvalidKey(key.to_string()));
    }
    let ok = key
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'));
    if !ok {
        return Err(MetadataError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn validate_ascii_value(key: &str, value: &str) -> Result<(), MetadataError> {
    if !value.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(MetadataError::NotPrintable(key.to_string()));
    }
    Ok(())
}

/// The metadata map.
///
/// Cloning yields an equal, independently owned map; propagation between
/// calls is always by clone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, MetadataValue>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata {
            entries: BTreeMap::new(),
        }
    }

    /// Insert an ASCII entry. The key is lowercased first.
    ///
    /// Rejects reserved keys, `-bin` keys, and non-printable values.
    pub fn insert_ascii(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<String>,
    ) -> Result<(), MetadataError> {
        let key = key.as_ref().to_ascii_lowercase();
        validate_key(&key)?;
        if is_reserved(&key) {
            return Err(MetadataError::ReservedKey(key));
        }
        if key.ends_with(BIN_SUFFIX) {
            return Err(MetadataError::ExpectedBinary(key));
        }
        let value = value.into();
        validate_ascii_value(&key, &value)?;
        self.entries.insert(key, MetadataValue::Ascii(value));
        Ok(())
    }

    /// Insert a binary entry. The key must end in `-bin`.
    pub fn insert_bin(
        &mut self,
        key: impl AsRef<str>,
        value: impl Into<Bytes>,
    ) -> Result<(), MetadataError> {
        let key = key.as_ref().to_ascii_lowercase();
        validate_key(&key)?;
        if is_reserved(&key) {
            return Err(MetadataError::ReservedKey(key));
        }
        if !key.ends_with(BIN_SUFFIX) {
            return Err(MetadataError::ExpectedAscii(key));
        }
        self.entries.insert(key, MetadataValue::Binary(value.into()));
        Ok(())
    }

    /// Crate-internal insertion used by the framing layer for reserved keys.
    pub(crate) fn insert_raw_ascii(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(key.into(), MetadataValue::Ascii(value.into()));
    }

    pub(crate) fn insert_raw_bin(&mut self, key: impl Into<String>, value: Bytes) {
        self.entries.insert(key.into(), MetadataValue::Binary(value));
    }

    /// Get an ASCII value.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self.entries.get(&key.to_ascii_lowercase()) {
            Some(MetadataValue::Ascii(v)) => Some(v),
            _ => None,
        }
    }

    /// Get a binary value.
    pub fn get_bin(&self, key: &str) -> Option<&Bytes> {
        match self.entries.get(&key.to_ascii_lowercase()) {
            Some(MetadataValue::Binary(v)) => Some(v),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy every entry of `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    /// Encode into the wire header block: one `key: value\r\n` line per
    /// entry, binary values Base64URL-encoded without padding.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.entries.len() * 32);
        for (key, value) in &self.entries {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            match value {
                MetadataValue::Ascii(v) => out.extend_from_slice(v.as_bytes()),
                MetadataValue::Binary(v) => {
                    out.extend_from_slice(base64url_encode(v).as_bytes())
                }
            }
            out.extend_from_slice(b"\r\n");
        }
        Bytes::from(out)
    }

    /// Parse a wire header block.
    ///
    /// Reserved keys are accepted here; they arrive on the wire and the
    /// framing layer interprets them.
    pub fn parse(block: &[u8]) -> Result<Self, MetadataError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| MetadataError::Malformed("header block is not UTF-8".to_string()))?;
        let mut metadata = Metadata::new();
        for line in text.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| MetadataError::Malformed(format!("no separator in {:?}", line)))?;
            let key = key.to_ascii_lowercase();
            if key.is_empty() {
                return Err(MetadataError::Malformed("empty key".to_string()));
            }
            if key.ends_with(BIN_SUFFIX) {
                let raw = base64url_decode(value)
                    .map_err(|_| MetadataError::Malformed(format!("bad base64 for {:?}", key)))?;
                metadata
                    .entries
                    .insert(key, MetadataValue::Binary(Bytes::from(raw)));
            } else {
                validate_ascii_value(&key, value)?;
                metadata
                    .entries
                    .insert(key, MetadataValue::Ascii(value.to_string()));
            }
        }
        Ok(metadata)
    }
}

/// Base64URL (no padding) encode.
pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Base64URL (no padding) decode.
pub fn base64url_decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_lowercased() {
        let mut md = Metadata::new();
        md.insert_ascii("X-Request-Id", "abc").unwrap();
        assert_eq!(md.get("x-request-id"), Some("abc"));
        assert_eq!(md.get("X-REQUEST-ID"), Some("abc"));
    }

    #[test]
    fn last_write_wins() {
        let mut md = Metadata::new();
        md.insert_ascii("k", "one").unwrap();
        md.insert_ascii("K", "two").unwrap();
        assert_eq!(md.len(), 1);
        assert_eq!(md.get("k"), Some("two"));
    }

    #[test]
    fn bin_suffix_requires_binary() {
        let mut md = Metadata::new();
        assert_eq!(
            md.insert_ascii("trace-bin", "text").err(),
            Some(MetadataError::ExpectedBinary("trace-bin".to_string()))
        );
        md.insert_bin("trace-bin", vec![1, 2, 3]).unwrap();
        assert_eq!(md.get_bin("trace-bin").unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn non_bin_key_rejects_binary() {
        let mut md = Metadata::new();
        assert_eq!(
            md.insert_bin("plain", vec![1]).err(),
            Some(MetadataError::ExpectedAscii("plain".to_string()))
        );
    }

    #[test]
    fn reserved_keys_rejected() {
        let mut md = Metadata::new();
        assert!(matches!(
            md.insert_ascii(":path", "/x/y"),
            Err(MetadataError::ReservedKey(_))
        ));
        assert!(matches!(
            md.insert_ascii("grpc-timeout", "1S"),
            Err(MetadataError::ReservedKey(_))
        ));
        assert!(matches!(
            md.insert_ascii("content-type", "application/grpc"),
            Err(MetadataError::ReservedKey(_))
        ));
        // authorization is conventional, not reserved
        md.insert_ascii("authorization", "Bearer t").unwrap();
    }

    #[test]
    fn invalid_keys_rejected() {
        let mut md = Metadata::new();
        assert!(md.insert_ascii("", "v").is_err());
        assert!(md.insert_ascii("spaced key", "v").is_err());
    }

    #[test]
    fn non_printable_value_rejected() {
        let mut md = Metadata::new();
        assert_eq!(
            md.insert_ascii("k", "a\x07b").err(),
            Some(MetadataError::NotPrintable("k".to_string()))
        );
    }

    #[test]
    fn encode_parse_roundtrip_ascii() {
        let mut md = Metadata::new();
        md.insert_ascii("alpha", "one").unwrap();
        md.insert_ascii("beta", "two words").unwrap();
        md.insert_ascii("authorization", "Bearer abc.def").unwrap();

        let parsed = Metadata::parse(&md.encode()).unwrap();
        assert_eq!(parsed, md);
    }

    #[test]
    fn encode_parse_roundtrip_binary() {
        let mut md = Metadata::new();
        md.insert_bin("blob-bin", vec![0u8, 255, 7, 42]).unwrap();
        md.insert_ascii("plain", "x").unwrap();

        let parsed = Metadata::parse(&md.encode()).unwrap();
        assert_eq!(parsed.get_bin("blob-bin").unwrap().as_ref(), &[0, 255, 7, 42]);
        assert_eq!(parsed.get("plain"), Some("x"));
    }

    #[test]
    fn parse_accepts_reserved_keys() {
        let block = b":path: /echo.Echo/Say\r\ngrpc-timeout: 50m\r\n";
        let md = Metadata::parse(block).unwrap();
        assert_eq!(md.get(":path"), Some("/echo.Echo/Say"));
        assert_eq!(md.get("grpc-timeout"), Some("50m"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Metadata::parse(b"no-separator-line\r\n").is_err());
        assert!(Metadata::parse(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn clone_is_independent() {
        let mut md = Metadata::new();
        md.insert_ascii("k", "v").unwrap();
        let mut copy = md.clone();
        assert_eq!(copy, md);
        copy.insert_ascii("k", "other").unwrap();
        assert_eq!(md.get("k"), Some("v"));
        assert_eq!(copy.get("k"), Some("other"));
    }

    #[test]
    fn merge_overwrites() {
        let mut a = Metadata::new();
        a.insert_ascii("k", "old").unwrap();
        a.insert_ascii("only-a", "1").unwrap();
        let mut b = Metadata::new();
        b.insert_ascii("k", "new").unwrap();
        a.merge(&b);
        assert_eq!(a.get("k"), Some("new"));
        assert_eq!(a.get("only-a"), Some("1"));
    }

    #[test]
    fn base64url_identity() {
        for data in [
            Vec::new(),
            vec![0u8],
            vec![255u8; 3],
            (0u8..=255).collect::<Vec<u8>>(),
        ] {
            assert_eq!(base64url_decode(&base64url_encode(&data)).unwrap(), data);
        }
    }
}
