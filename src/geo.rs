//! IP-to-location collaborator interface
//!
//! Looked up once per flow at creation time. When no resolver is wired in
//! or the address is unknown, the flow's location stays empty.

use std::collections::HashMap;

/// Outbound interface to the location resolver
pub trait GeoLookup: Send + Sync {
    /// Resolve an IP string to a display location, if known
    fn lookup(&self, ip: &str) -> Option<String>;
}

/// Resolver that knows nothing
pub struct NoGeo;

impl GeoLookup for NoGeo {
    fn lookup(&self, _ip: &str) -> Option<String> {
        None
    }
}

/// Fixed-table resolver, for tests and demos
#[derive(Debug, Default)]
pub struct StaticGeo {
    entries: HashMap<String, String>,
}

impl StaticGeo {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(ip, location)` pairs
    pub fn from_iter<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Add one entry
    pub fn insert(&mut self, ip: impl Into<String>, location: impl Into<String>) {
        self.entries.insert(ip.into(), location.into());
    }
}

impl GeoLookup for StaticGeo {
    fn lookup(&self, ip: &str) -> Option<String> {
        self.entries.get(ip).cloned()
    }
}
