//! Bodies exchanged with an instance's `/api` endpoints.
//!
//! Option fields travel as bare string codes here; the dashboard rehydrates
//! them into [`crate::Network`] and [`crate::Interaction`].

use serde::{Deserialize, Serialize};

use crate::ProxyStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireService {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub interaction: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireProxy {
    pub id: String,
    #[serde(default)]
    pub port: u16,
    /// Kept loose: anything other than a known status string falls back to
    /// the default status when the record is normalized.
    #[serde(default)]
    pub status: Option<serde_json::Value>,
    #[serde(default)]
    pub service: Option<WireService>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub network: String,
    pub interaction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateServiceRequest {
    pub name: String,
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangePortRequest {
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: ProxyStatus,
}

/// Body of a status change answer. The value is checked before it is trusted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub status: Option<serde_json::Value>,
}
