use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Instance, Profile, ProxyRecord, ProxyStatus};

/// Field name to message, as produced by validators.
pub type FieldErrors = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub errors: FieldErrors,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachServiceRequest {
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceProfileRequest {
    pub profile_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRequest {
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusRequest {
    pub status: ProxyStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceProfileResponse {
    pub instance: Instance,
    /// Proxies created for the new profile.
    pub attached: Vec<ProxyRecord>,
    /// Proxies of the previous profile that could not be removed remotely.
    pub retained: Vec<ProxyRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileServiceResponse {
    pub profile: Profile,
    pub changed: bool,
}
