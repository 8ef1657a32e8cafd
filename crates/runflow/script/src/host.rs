//! Optional host capabilities reachable from scripts

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Capabilities enabled for one execution; all off by default
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `http.request`, `http.get`, `http.post`
    #[serde(default)]
    pub http: bool,
    /// `data.query`, `data.get` (read-only)
    #[serde(default)]
    pub data_query: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_http(mut self, enabled: bool) -> Self {
        self.http = enabled;
        self
    }

    pub fn with_data_query(mut self, enabled: bool) -> Self {
        self.data_query = enabled;
        self
    }
}

/// Bridge from the sandbox to host services.
///
/// Called synchronously from the interpreter thread. Implementations must
/// return within `timeout`.
pub trait HostBridge: Send + Sync {
    fn http_request(&self, request: Value, timeout: Duration) -> Result<Value, String>;

    fn data_query(&self, collection: &str, query: Value, timeout: Duration) -> Result<Value, String>;
}
