//! Payload: optional data plus optional metadata
//!
//! Absence and emptiness are distinct: `Payload::new(Some(Bytes::new()), None)`
//! carries present-but-empty data and no metadata.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

use crate::error::Result;

/// Immutable message unit exchanged between peers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    data: Option<Bytes>,
    metadata: Option<Bytes>,
}

impl Payload {
    pub fn new(data: Option<Bytes>, metadata: Option<Bytes>) -> Self {
        Self { data, metadata }
    }

    pub fn builder() -> PayloadBuilder {
        PayloadBuilder::default()
    }

    /// Build from UTF-8 text; metadata is optional
    pub fn from_text(data: &str, metadata: Option<&str>) -> Self {
        Self {
            data: Some(Bytes::copy_from_slice(data.as_bytes())),
            metadata: metadata.map(|m| Bytes::copy_from_slice(m.as_bytes())),
        }
    }

    /// Build from a JSON-serializable value; metadata is an optional JSON document
    pub fn from_json<D>(data: &D, metadata: Option<&serde_json::Value>) -> Result<Self>
    where
        D: Serialize + ?Sized,
    {
        let data = Bytes::from(serde_json::to_vec(data)?);
        let metadata = match metadata {
            Some(m) => Some(Bytes::from(serde_json::to_vec(m)?)),
            None => None,
        };
        Ok(Self {
            data: Some(data),
            metadata,
        })
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn data_len(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn metadata_len(&self) -> usize {
        self.metadata.as_ref().map(|m| m.len()).unwrap_or(0)
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Decode data as UTF-8, failing with `Encoding` on invalid bytes
    pub fn data_utf8(&self) -> Result<Option<&str>> {
        match &self.data {
            Some(d) => Ok(Some(std::str::from_utf8(d)?)),
            None => Ok(None),
        }
    }

    pub fn metadata_utf8(&self) -> Result<Option<&str>> {
        match &self.metadata {
            Some(m) => Ok(Some(std::str::from_utf8(m)?)),
            None => Ok(None),
        }
    }

    pub fn data_json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.data {
            Some(d) => Ok(Some(serde_json::from_slice(d)?)),
            None => Ok(None),
        }
    }

    pub fn metadata_json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.metadata {
            Some(m) => Ok(Some(serde_json::from_slice(m)?)),
            None => Ok(None),
        }
    }

    /// Consume into the raw `(data, metadata)` pair
    pub fn split(self) -> (Option<Bytes>, Option<Bytes>) {
        (self.data, self.metadata)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(part: Option<&Bytes>) -> String {
            match part {
                None => "<none>".to_string(),
                Some(b) => match std::str::from_utf8(b) {
                    Ok(s) => s.to_string(),
                    Err(_) => format!("<{} bytes>", b.len()),
                },
            }
        }
        write!(
            f,
            "Payload(data='{}', metadata='{}')",
            render(self.data.as_ref()),
            render(self.metadata.as_ref())
        )
    }
}

/// Incremental payload constructor
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    data: Option<Bytes>,
    metadata: Option<Bytes>,
}

impl PayloadBuilder {
    pub fn set_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn set_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn set_data_utf8(self, data: &str) -> Self {
        self.set_data(Bytes::copy_from_slice(data.as_bytes()))
    }

    pub fn set_metadata_utf8(self, metadata: &str) -> Self {
        self.set_metadata(Bytes::copy_from_slice(metadata.as_bytes()))
    }

    pub fn build(self) -> Payload {
        Payload {
            data: self.data,
            metadata: self.metadata,
        }
    }
}

/// One side of a payload as a host hands it over: raw bytes, text or JSON
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PayloadValue {
    #[default]
    Absent,
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
}

impl PayloadValue {
    fn into_bytes(self) -> Result<Option<Bytes>> {
        Ok(match self {
            PayloadValue::Absent => None,
            PayloadValue::Bytes(b) => Some(b),
            PayloadValue::Text(t) => Some(Bytes::from(t)),
            PayloadValue::Json(v) => Some(Bytes::from(serde_json::to_vec(&v)?)),
        })
    }
}

impl From<Bytes> for PayloadValue {
    fn from(b: Bytes) -> Self {
        PayloadValue::Bytes(b)
    }
}

impl From<Vec<u8>> for PayloadValue {
    fn from(b: Vec<u8>) -> Self {
        PayloadValue::Bytes(Bytes::from(b))
    }
}

impl From<&[u8]> for PayloadValue {
    fn from(b: &[u8]) -> Self {
        PayloadValue::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<&str> for PayloadValue {
    fn from(s: &str) -> Self {
        PayloadValue::Text(s.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(s: String) -> Self {
        PayloadValue::Text(s)
    }
}

impl From<serde_json::Value> for PayloadValue {
    fn from(v: serde_json::Value) -> Self {
        PayloadValue::Json(v)
    }
}

impl<T: Into<PayloadValue>> From<Option<T>> for PayloadValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(PayloadValue::Absent)
    }
}

/// Build a payload from any mix of bytes, text, JSON or absent parts
pub fn create_payload(
    data: impl Into<PayloadValue>,
    metadata: impl Into<PayloadValue>,
) -> Result<Payload> {
    Ok(Payload::new(
        data.into().into_bytes()?,
        metadata.into().into_bytes()?,
    ))
}
