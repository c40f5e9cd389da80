use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const ID_PREFIX: &str = "req_";

/// Opaque identifier of a captured request: `req_<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CaptureId(String);

impl CaptureId {
    pub fn generate() -> Self {
        Self(format!("{ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CaptureId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(ID_PREFIX)
            .ok_or_else(|| format!("'{s}' does not start with '{ID_PREFIX}'"))?;
        let uuid = Uuid::parse_str(raw).map_err(|e| format!("'{s}': {e}"))?;
        Ok(Self(format!("{ID_PREFIX}{uuid}")))
    }
}

impl TryFrom<String> for CaptureId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CaptureId> for String {
    fn from(id: CaptureId) -> Self {
        id.0
    }
}

/// One header line. `value` is the text form; values that are not UTF-8
/// also keep their exact bytes in `raw`, which wins on rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
}

impl HeaderEntry {
    pub fn new(name: &HeaderName, value: &HeaderValue) -> Self {
        let bytes = value.as_bytes();
        match std::str::from_utf8(bytes) {
            Ok(text) => Self {
                name: name.as_str().to_string(),
                value: text.to_string(),
                raw: None,
            },
            Err(_) => Self {
                name: name.as_str().to_string(),
                value: String::from_utf8_lossy(bytes).into_owned(),
                raw: Some(bytes.to_vec()),
            },
        }
    }

    pub fn value_bytes(&self) -> &[u8] {
        self.raw.as_deref().unwrap_or(self.value.as_bytes())
    }
}

/// Everything about a request except its id. Stores assign the id on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub version: String,
    /// Ordered header multimap; repeated names keep their order.
    pub headers: Vec<HeaderEntry>,
    pub body: Vec<u8>,
    pub host: String,
    pub remote_addr: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RequestSnapshot {
    pub fn headers_from(map: &HeaderMap) -> Vec<HeaderEntry> {
        map.iter()
            .map(|(name, value)| HeaderEntry::new(name, value))
            .collect()
    }

    /// Rebuilds a header map, skipping entries that no longer parse.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for entry in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(entry.name.as_bytes()),
                HeaderValue::from_bytes(entry.value_bytes()),
            ) {
                map.append(name, value);
            }
        }
        map
    }
}

/// An immutable persisted capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub id: CaptureId,
    #[serde(flatten)]
    pub request: RequestSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub id: CaptureId,
    pub method: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub body_size: usize,
}

impl From<&CapturedRequest> for CaptureSummary {
    fn from(record: &CapturedRequest) -> Self {
        Self {
            id: record.id.clone(),
            method: record.request.method.clone(),
            url: record.request.url.clone(),
            created_at: record.request.created_at,
            body_size: record.request.body.len(),
        }
    }
}
