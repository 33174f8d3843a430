//! Cache entry ids exchanged with API callers.
//!
//! An id is the URL-safe base64 encoding of `"{upstream_id} {relative_path}"`.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;

use crate::errors::EntryIdError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryId {
    pub upstream_id: i32,
    pub relative_path: String,
}

impl CacheEntryId {
    pub fn new(upstream_id: i32, relative_path: &str) -> Self {
        Self {
            upstream_id,
            relative_path: relative_path.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        URL_SAFE.encode(format!("{} {}", self.upstream_id, self.relative_path))
    }

    /// Decode id, splitting at the first space. Paths may contain spaces.
    pub fn decode(id: &str) -> Result<Self, EntryIdError> {
        let bytes = URL_SAFE
            .decode(id.trim())
            .map_err(|_| EntryIdError::Base64)?;
        let decoded = String::from_utf8(bytes).map_err(|_| EntryIdError::Utf8)?;
        let (upstream_id, relative_path) = decoded
            .split_once(' ')
            .ok_or(EntryIdError::MissingSeparator)?;
        let upstream_id = upstream_id
            .parse()
            .map_err(|_| EntryIdError::UpstreamId)?;
        if relative_path.trim().is_empty() {
            return Err(EntryIdError::BlankPath);
        }
        Ok(Self::new(upstream_id, relative_path))
    }
}

impl fmt::Display for CacheEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
