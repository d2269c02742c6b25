//! Inventory model
//!
//! The decrypted inventory is a JSON array of connection records. `port` is
//! string-encoded in the file and validated into an integer when the raw
//! records are converted to [`ConfigElement`]s.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Connection details for a single server.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub host: String,
    pub dir: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("host", &self.host)
            .field("dir", &self.dir)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One inventory record: a tagged server inside a group/environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigElement {
    pub group: String,
    pub env: String,
    pub tag: String,
    pub server: Server,
}

/// A record as it appears in the JSON file, before port validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawElement {
    pub group: String,
    pub env: String,
    pub tag: String,
    pub server: RawServer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawServer {
    pub host: String,
    pub dir: String,
    pub port: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to parse inventory JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entry '{tag}': port '{port}' is not a valid port number")]
    InvalidPort { tag: String, port: String },
}

impl RawElement {
    /// Convert to a well-typed record. The only enforced check is that the
    /// port parses as an integer in 0..65535.
    pub fn validate(self) -> Result<ConfigElement, InventoryError> {
        let port = self
            .server
            .port
            .trim()
            .parse::<u16>()
            .map_err(|_| InventoryError::InvalidPort {
                tag: self.tag.clone(),
                port: self.server.port.clone(),
            })?;

        Ok(ConfigElement {
            group: self.group,
            env: self.env,
            tag: self.tag,
            server: Server {
                host: self.server.host,
                dir: self.server.dir,
                port,
                username: self.server.username,
                password: self.server.password,
            },
        })
    }
}

/// Parse the plaintext inventory into raw records, preserving file order.
pub fn parse(bytes: &[u8]) -> Result<Vec<RawElement>, InventoryError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Ordered collection of validated records.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    elements: Vec<ConfigElement>,
}

impl Inventory {
    pub fn from_raw(raw: Vec<RawElement>) -> Result<Self, InventoryError> {
        let elements = raw
            .into_iter()
            .map(RawElement::validate)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { elements })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigElement> {
        self.elements.iter()
    }

    pub fn get(&self, position: usize) -> Option<&ConfigElement> {
        self.elements.get(position)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Stable content hash used to name the on-disk search index. Identical
    /// inventory content always yields the same hash.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for element in &self.elements {
            // Struct serialization is deterministic: fixed field order.
            if let Ok(json) = serde_json::to_vec(element) {
                hasher.update(&json);
            }
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }

    /// Case-insensitive tag lookup map. Duplicate tags keep the first
    /// occurrence.
    pub fn tag_positions(&self) -> HashMap<String, usize> {
        let mut map = HashMap::with_capacity(self.elements.len());
        for (position, element) in self.elements.iter().enumerate() {
            map.entry(element.tag.to_lowercase()).or_insert(position);
        }
        map
    }
}

/// Diagnose raw records without blocking: duplicate tags and unparseable or
/// out-of-range ports. Backs `jim validate`; the daemon only enforces the
/// port check.
pub fn check(raw: &[RawElement]) -> Vec<String> {
    let mut findings = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();

    for (position, element) in raw.iter().enumerate() {
        if element.tag.trim().is_empty() {
            findings.push(format!("entry #{}: empty tag", position + 1));
        }
        if let Some(first) = seen.get(element.tag.as_str()) {
            findings.push(format!(
                "entry #{}: duplicate tag '{}' (first used by entry #{})",
                position + 1,
                element.tag,
                first + 1
            ));
        } else {
            seen.insert(element.tag.as_str(), position);
        }
        if element.server.port.trim().parse::<u16>().is_err() {
            findings.push(format!(
                "entry #{} ('{}'): port '{}' is not an integer in 0..65535",
                position + 1,
                element.tag,
                element.server.port
            ));
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static [u8] {
        br#"[
            {"group":"prod","env":"eu","tag":"api-1",
             "server":{"host":"h1","dir":"/srv","port":"22","username":"u","password":"p"}},
            {"group":"prod","env":"us","tag":"api-2",
             "server":{"host":"h2","dir":"/srv","port":"2222","username":"u","password":"p"}}
        ]"#
    }

    #[test]
    fn parses_and_validates() {
        let raw = parse(sample_json()).unwrap();
        let inventory = Inventory::from_raw(raw).unwrap();
        assert_eq!(inventory.len(), 2);
        let first = inventory.get(0).unwrap();
        assert_eq!(first.tag, "api-1");
        assert_eq!(first.server.port, 22);
    }

    #[test]
    fn rejects_invalid_port() {
        let raw = parse(
            br#"[{"group":"g","env":"e","tag":"t",
                 "server":{"host":"h","dir":"/","port":"not-a-port","username":"u","password":"p"}}]"#,
        )
        .unwrap();
        let err = Inventory::from_raw(raw).unwrap_err();
        assert!(matches!(err, InventoryError::InvalidPort { .. }));
    }

    #[test]
    fn rejects_out_of_range_port() {
        let raw = parse(
            br#"[{"group":"g","env":"e","tag":"t",
                 "server":{"host":"h","dir":"/","port":"65536","username":"u","password":"p"}}]"#,
        )
        .unwrap();
        assert!(Inventory::from_raw(raw).is_err());
    }

    #[test]
    fn content_hash_is_deterministic() {
        let a = Inventory::from_raw(parse(sample_json()).unwrap()).unwrap();
        let b = Inventory::from_raw(parse(sample_json()).unwrap()).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let other = Inventory::from_raw(
            parse(
                br#"[{"group":"g","env":"e","tag":"t",
                     "server":{"host":"h","dir":"/","port":"22","username":"u","password":"p"}}]"#,
            )
            .unwrap(),
        )
        .unwrap();
        assert_ne!(a.content_hash(), other.content_hash());
    }

    #[test]
    fn tag_positions_keep_first_occurrence() {
        let raw = parse(
            br#"[
                {"group":"g","env":"e","tag":"Dup",
                 "server":{"host":"h1","dir":"/","port":"22","username":"u","password":"p"}},
                {"group":"g","env":"e","tag":"dup",
                 "server":{"host":"h2","dir":"/","port":"22","username":"u","password":"p"}}
            ]"#,
        )
        .unwrap();
        let inventory = Inventory::from_raw(raw).unwrap();
        let positions = inventory.tag_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions["dup"], 0);
    }

    #[test]
    fn checker_reports_duplicates_and_bad_ports() {
        let raw = parse(
            br#"[
                {"group":"g","env":"e","tag":"a",
                 "server":{"host":"h","dir":"/","port":"22","username":"u","password":"p"}},
                {"group":"g","env":"e","tag":"a",
                 "server":{"host":"h","dir":"/","port":"99999","username":"u","password":"p"}}
            ]"#,
        )
        .unwrap();
        let findings = check(&raw);
        assert_eq!(findings.len(), 2);
        assert!(findings[0].contains("duplicate tag"));
        assert!(findings[1].contains("99999"));
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let raw = parse(sample_json()).unwrap();
        let inventory = Inventory::from_raw(raw).unwrap();
        let debug = format!("{:?}", inventory.get(0).unwrap());
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("\"p\""));
    }
}
