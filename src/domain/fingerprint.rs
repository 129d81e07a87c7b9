//! Content fingerprint shared by the local cache and the remote store.
//!
//! Only fields that change the rendered pixels participate. Delivery options
//! (raw/base64/url, URL visibility, expiry) never reach this function, so a
//! fingerprint always names exactly one output.

use std::fmt;

use sha2::{Digest, Sha256};

use super::request::{OutputFormat, RenderRequest};

/// Bumped whenever the render protocol changes in a way that alters output bytes.
const CANONICAL_VERSION: &[u8] = b"mermaid-render/v1";
const SHARD_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(request: &RenderRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(CANONICAL_VERSION);
        field(&mut hasher, "code", request.code().as_bytes());
        field(&mut hasher, "format", request.format().as_str().as_bytes());
        field(&mut hasher, "theme", request.theme().as_str().as_bytes());
        field(&mut hasher, "width", &dimension_bytes(request.width()));
        field(&mut hasher, "height", &dimension_bytes(request.height()));
        field(&mut hasher, "background", request.background().as_bytes());
        field(&mut hasher, "scale", &[request.scale()]);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading hex characters used to fan entries out across directories.
    pub fn shard(&self) -> &str {
        &self.0[..SHARD_LEN]
    }

    /// `<shard>/<fingerprint>.<ext>`, the layout shared by both cache tiers.
    pub fn sharded_name(&self, format: OutputFormat) -> String {
        format!("{}/{}.{}", self.shard(), self.0, format.extension())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Length framing keeps `("ab", "c")` and `("a", "bc")` from colliding.
fn field(hasher: &mut Sha256, name: &str, value: &[u8]) {
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value);
}

fn dimension_bytes(value: Option<u32>) -> Vec<u8> {
    match value {
        Some(v) => v.to_le_bytes().to_vec(),
        None => Vec::new(),
    }
}
