use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-unique identity of a worker, stable for the process lifetime.
///
/// The id is one metric scope segment, so it never contains `.` or
/// whitespace: [`ResourceId::new`] replaces them with `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.contains(|c: char| c == '.' || c.is_whitespace()) {
            Self(
                id.chars()
                    .map(|c| if c == '.' || c.is_whitespace() { '-' } else { c })
                    .collect(),
            )
        } else {
            Self(id)
        }
    }

    /// 32 lowercase hex characters from 16 random bytes.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
