//! Persisted key layout of one session.

/// Builds the namespaced keys of one session:
///
/// - `{prefix}:{session}:creds` primary credentials
/// - `{prefix}:{session}:keys:{type}:{id}` per-type key material
/// - `{prefix}:{session}:status` status snapshot
/// - `{prefix}:{session}:qr` current QR artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    base: String,
}

impl StoreKeys {
    pub fn new(prefix: &str, session_name: &str) -> Self {
        Self {
            base: format!("{prefix}:{session_name}"),
        }
    }

    pub fn credentials(&self) -> String {
        format!("{}:creds", self.base)
    }

    /// Prefix of the whole key material space.
    pub fn key_space(&self) -> String {
        format!("{}:keys:", self.base)
    }

    pub fn key(&self, kind: &str, id: &str) -> String {
        format!("{}:keys:{kind}:{id}", self.base)
    }

    pub fn status(&self) -> String {
        format!("{}:status", self.base)
    }

    pub fn qr(&self) -> String {
        format!("{}:qr", self.base)
    }
}
