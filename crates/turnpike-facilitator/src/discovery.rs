//! The priced-endpoint catalog served from `/discovery/resources`.
//!
//! Resource servers register out of band; the catalog is seeded from a JSON
//! file at boot and served read-only.

use serde::{Deserialize, Serialize};

/// One priced endpoint a client can discover.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResource {
    /// URL of the priced endpoint.
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Human-readable price, e.g. "$0.01".
    pub price: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_to: Option<String>,
}

/// Load the catalog from a JSON file containing an array of resources.
pub fn load_resources(path: &str) -> Result<Vec<DiscoveryResource>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read discovery catalog {path}: {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("invalid discovery catalog {path}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_resources() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"resource": "https://api.example.com/data", "price": "$0.01", "network": "eip155:8453"}}]"#
        )
        .unwrap();

        let resources = load_resources(file.path().to_str().unwrap()).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].price, "$0.01");
        assert!(resources[0].description.is_none());
    }

    #[test]
    fn test_load_resources_missing_file() {
        assert!(load_resources("/nonexistent/catalog.json").is_err());
    }
}
