//! Image, volume and network listings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Row from an image listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub id: String,
    pub repository: String,
    pub tag: String,
    /// Engine-formatted size, e.g. "142MB"
    pub size: String,
    pub created: String,
}

/// Named volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSummary {
    pub name: String,
    pub driver: String,
    pub mountpoint: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Engine network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
}

/// Parameters for creating a volume or network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceCreate {
    pub name: String,
    pub driver: Option<String>,
    pub labels: HashMap<String, String>,
}
