//! Owned, host-independent renditions of the PKCS#11 structures that cross
//! the wire.
//!
//! Every `CK_ULONG` travels as a `u64`. Fields that the token standard
//! allows to be `CK_UNAVAILABLE_INFORMATION` are `Option<u64>` so that the
//! sentinel never leaks between hosts with different `CK_ULONG` widths.

use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_ULONG, CKA_CERTIFICATE_CATEGORY, CKA_CERTIFICATE_TYPE, CKA_CLASS,
    CKA_KEY_GEN_MECHANISM, CKA_KEY_TYPE, CKA_MECHANISM_TYPE, CKA_MODULUS_BITS, CKA_PRIME_BITS,
    CKA_VALUE_BITS, CKA_VALUE_LEN,
};
use serde::{Deserialize, Serialize};

/// Width of a `CK_ULONG` attribute value on the wire.
pub const WIRE_ULONG_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub cryptoki_version: Version,
    pub manufacturer: InfoText,
    pub flags: u64,
    pub description: InfoText,
    pub library_version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub description: InfoText,
    pub manufacturer: InfoText,
    pub flags: u64,
    pub hardware_version: Version,
    pub firmware_version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub label: InfoText,
    pub manufacturer: InfoText,
    pub model: InfoText,
    pub serial_number: InfoText,
    pub flags: u64,
    pub max_session_count: Option<u64>,
    pub session_count: Option<u64>,
    pub max_rw_session_count: Option<u64>,
    pub rw_session_count: Option<u64>,
    pub max_pin_len: u64,
    pub min_pin_len: u64,
    pub total_public_memory: Option<u64>,
    pub free_public_memory: Option<u64>,
    pub total_private_memory: Option<u64>,
    pub free_private_memory: Option<u64>,
    pub hardware_version: Version,
    pub firmware_version: Version,
    pub utc_time: InfoText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub slot_id: u64,
    pub state: u64,
    pub flags: u64,
    pub device_error: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MechanismInfo {
    pub min_key_size: u64,
    pub max_key_size: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    pub kind: u64,
    #[serde(with = "b64", default)]
    pub parameter: Vec<u8>,
}

impl Mechanism {
    pub fn new(kind: u64) -> Self {
        Self {
            kind,
            parameter: Vec::new(),
        }
    }
}

/// A template entry. The value is in wire form: `CK_ULONG` attributes are
/// eight little-endian bytes regardless of the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub kind: u64,
    #[serde(with = "b64")]
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(kind: u64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn ulong(kind: u64, value: u64) -> Self {
        Self::new(kind, value.to_le_bytes().to_vec())
    }

    pub fn bool(kind: u64, value: bool) -> Self {
        Self::new(kind, vec![u8::from(value)])
    }

    /// Builds a wire attribute from a value laid out for this host.
    pub fn from_host(kind: u64, host: &[u8]) -> Self {
        Self::new(kind, wire_value(kind, host))
    }

    /// Value laid out for this host.
    pub fn host_value(&self) -> Vec<u8> {
        host_value(self.kind, &self.value)
    }
}

/// One slot of a `GetAttributeValue` template. `capacity` is `None` when the
/// caller only wants the value length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRequest {
    pub kind: u64,
    pub capacity: Option<u64>,
}

/// Outcome for one template slot. `len` is `None` when the provider reported
/// the value as unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub kind: u64,
    pub len: Option<u64>,
    #[serde(with = "b64_opt", default)]
    pub value: Option<Vec<u8>>,
}

impl AttributeValue {
    pub fn unavailable(kind: u64) -> Self {
        Self {
            kind,
            len: None,
            value: None,
        }
    }
}

/// `GetAttributeValue` reports a result code alongside per-attribute
/// outcomes because partial success is part of its contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeReport {
    pub rv: u64,
    pub values: Vec<AttributeValue>,
}

/// Output of a call following the two-step length convention. `data` is
/// `None` for a length query or when the supplied capacity was too small.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBuffer {
    pub required: u64,
    #[serde(with = "b64_opt", default)]
    pub data: Option<Vec<u8>>,
}

impl OutputBuffer {
    pub fn length(required: usize) -> Self {
        Self {
            required: required as u64,
            data: None,
        }
    }

    pub fn filled(data: Vec<u8>) -> Self {
        Self {
            required: data.len() as u64,
            data: Some(data),
        }
    }

    /// Applies the caller's capacity to a fully computed output.
    pub fn fit(data: Vec<u8>, capacity: Option<u64>) -> Self {
        match capacity {
            Some(cap) if cap >= data.len() as u64 => Self::filled(data),
            _ => Self::length(data.len()),
        }
    }
}

pub fn is_ulong_attribute(kind: u64) -> bool {
    let kind = kind as CK_ATTRIBUTE_TYPE;
    matches!(
        kind,
        CKA_CLASS
            | CKA_KEY_TYPE
            | CKA_CERTIFICATE_TYPE
            | CKA_CERTIFICATE_CATEGORY
            | CKA_MODULUS_BITS
            | CKA_PRIME_BITS
            | CKA_VALUE_BITS
            | CKA_VALUE_LEN
            | CKA_KEY_GEN_MECHANISM
            | CKA_MECHANISM_TYPE
    )
}

/// Length a value of `kind` occupies on this host, given its wire length.
pub fn host_len(kind: u64, wire_len: u64) -> u64 {
    if is_ulong_attribute(kind) && wire_len == WIRE_ULONG_LEN as u64 {
        std::mem::size_of::<CK_ULONG>() as u64
    } else {
        wire_len
    }
}

/// Length a value of `kind` occupies on the wire, given its host length.
pub fn wire_len(kind: u64, host_len: u64) -> u64 {
    if is_ulong_attribute(kind) && host_len == std::mem::size_of::<CK_ULONG>() as u64 {
        WIRE_ULONG_LEN as u64
    } else {
        host_len
    }
}

pub fn wire_value(kind: u64, host: &[u8]) -> Vec<u8> {
    match read_ulong(host) {
        Some(value) if is_ulong_attribute(kind) => (value as u64).to_le_bytes().to_vec(),
        _ => host.to_vec(),
    }
}

pub fn host_value(kind: u64, wire: &[u8]) -> Vec<u8> {
    if is_ulong_attribute(kind)
        && let Ok(bytes) = <[u8; WIRE_ULONG_LEN]>::try_from(wire)
    {
        return ulong_bytes(u64::from_le_bytes(bytes) as CK_ULONG);
    }
    wire.to_vec()
}

/// Native-endian bytes of a host `CK_ULONG`.
pub fn ulong_bytes(value: CK_ULONG) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

pub fn read_ulong(bytes: &[u8]) -> Option<CK_ULONG> {
    let raw = <[u8; std::mem::size_of::<CK_ULONG>()]>::try_from(bytes).ok()?;
    Some(CK_ULONG::from_ne_bytes(raw))
}

/// Contents of a blank-padded fixed-width PKCS#11 field.
pub fn trim_padding(field: &[u8]) -> &[u8] {
    let end = field
        .iter()
        .rposition(|b| *b != b' ' && *b != 0)
        .map_or(0, |idx| idx + 1);
    &field[..end]
}

/// Writes `value` into a fixed-width field, truncating and padding with
/// spaces as the token standard requires.
pub fn pad_into(value: &[u8], field: &mut [u8]) {
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value[..len]);
    field[len..].fill(b' ');
}

/// Text of an info field such as a label or manufacturer ID. Providers are
/// supposed to fill these with UTF-8 but not all do, so the bytes are kept
/// exactly as reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoText(#[serde(with = "b64")] Vec<u8>);

impl InfoText {
    /// Reads a blank-padded field as found in `CK_INFO` and friends.
    pub fn from_field(field: &[u8]) -> Self {
        Self(trim_padding(field).to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for InfoText {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for InfoText {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl PartialEq<&str> for InfoText {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl std::fmt::Display for InfoText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

pub mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

pub mod b64_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptoki_sys::{CKA_LABEL, CKO_SECRET_KEY};

    #[test]
    fn ulong_attributes_travel_as_eight_le_bytes() {
        let host = ulong_bytes(CKO_SECRET_KEY);
        let attr = Attribute::from_host(CKA_CLASS as u64, &host);
        assert_eq!(attr.value, (CKO_SECRET_KEY as u64).to_le_bytes().to_vec());
        assert_eq!(attr.host_value(), host);
    }

    #[test]
    fn byte_attributes_are_untouched() {
        let attr = Attribute::from_host(CKA_LABEL as u64, b"12345678");
        assert_eq!(attr.value, b"12345678");
        assert_eq!(attr.host_value(), b"12345678");
    }

    #[test]
    fn padding_round_trips_through_fixed_fields() {
        let mut field = [0u8; 32];
        pad_into(b"SoftHSM", &mut field);
        assert_eq!(&field[..7], b"SoftHSM");
        assert!(field[7..].iter().all(|b| *b == b' '));
        assert_eq!(InfoText::from_field(&field), "SoftHSM");

        let mut short = [0u8; 4];
        pad_into(b"Implementation", &mut short);
        assert_eq!(&short, b"Impl");
    }

    #[test]
    fn info_text_keeps_bytes_that_are_not_utf8() {
        let mut reported = [b' '; 32];
        reported[..5].copy_from_slice(b"caf\xe9!");
        let text = InfoText::from_field(&reported);
        assert_eq!(text.as_bytes(), b"caf\xe9!");

        let json = serde_json::to_string(&text).expect("serialize");
        let text: InfoText = serde_json::from_str(&json).expect("deserialize");
        let mut forwarded = [0u8; 32];
        pad_into(text.as_bytes(), &mut forwarded);
        assert_eq!(forwarded, reported);
        assert_eq!(text.to_string(), "caf\u{fffd}!");
    }

    #[test]
    fn output_buffer_respects_capacity() {
        let out = OutputBuffer::fit(vec![1, 2, 3], Some(2));
        assert_eq!(out.required, 3);
        assert!(out.data.is_none());
        let out = OutputBuffer::fit(vec![1, 2, 3], None);
        assert!(out.data.is_none());
        let out = OutputBuffer::fit(vec![1, 2, 3], Some(8));
        assert_eq!(out.data.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn attribute_serializes_value_as_base64() {
        let attr = Attribute::new(CKA_LABEL as u64, b"key".to_vec());
        let json = serde_json::to_value(&attr).expect("serialize");
        assert_eq!(json["value"], "a2V5");
    }
}
