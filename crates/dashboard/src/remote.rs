//! Client for the proxy API that every instance exposes under `/api`.
//!
//! One attempt per call, no retries and no timeouts. Every failure comes back
//! as a [`RemoteError`] so callers can decide what to surface.

use async_trait::async_trait;
use common::wire::{
    ChangePortRequest, ChangeStatusRequest, CreateServiceRequest, StatusResponse,
    UpdateServiceRequest, WireProxy, WireService,
};
use common::{Interaction, Network, ProxyRecord, ProxyStatus, SelectOption, Service};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::RemoteError;

#[async_trait]
pub trait ProxyApi: Send + Sync {
    async fn fetch_proxies(&self, host: &str) -> Result<Vec<ProxyRecord>, RemoteError>;

    async fn add_proxy_service(
        &self,
        host: &str,
        service: &Service,
    ) -> Result<ProxyRecord, RemoteError>;

    /// Succeeds only when the instance confirms the deletion.
    async fn delete_proxy_service(&self, host: &str, proxy_id: &str) -> Result<(), RemoteError>;

    async fn change_proxy_port(
        &self,
        host: &str,
        proxy_id: &str,
        port: u16,
    ) -> Result<ProxyRecord, RemoteError>;

    /// Returns the status the instance reports, which is always one of the
    /// known states.
    async fn change_proxy_status(
        &self,
        host: &str,
        proxy_id: &str,
        status: ProxyStatus,
    ) -> Result<ProxyStatus, RemoteError>;

    async fn update_service(
        &self,
        host: &str,
        service_id: &str,
        update: &UpdateServiceRequest,
    ) -> Result<Service, RemoteError>;
}

#[derive(Clone, Default)]
pub struct RemoteClient {
    client: Client,
}

impl RemoteClient {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn url(host: &str, path: &str) -> String {
        format!("http://{}/api/{}", host, path)
    }

    async fn send_value(&self, req: RequestBuilder) -> Result<Value, RemoteError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        if !status.is_success() {
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                message: error_message(&body, status),
            });
        }

        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| RemoteError::Malformed(format!("invalid JSON body: {}", e)))?;

        // Instances sometimes answer 200 with an error object.
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                message: message.to_string(),
            });
        }

        Ok(value)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, RemoteError> {
        let value = self.send_value(req).await?;
        serde_json::from_value(value).map_err(|e| RemoteError::Malformed(e.to_string()))
    }
}

fn error_message(body: &[u8], status: StatusCode) -> String {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    if let Some(value) = parsed {
        if let Some(msg) = value.get("error").and_then(Value::as_str) {
            return msg.to_string();
        }
        if let Some(errs) = value.get("errors").and_then(Value::as_array) {
            let joined: Vec<String> = errs
                .iter()
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                .collect();
            return joined.join("; ");
        }
    }
    status
        .canonical_reason()
        .unwrap_or("unexpected status")
        .to_string()
}

fn option_from_code<O: SelectOption>(code: Option<&str>, field: &str) -> Result<O, RemoteError> {
    match code {
        None => Ok(O::OPTIONS[0]),
        Some(code) => O::from_code(code)
            .ok_or_else(|| RemoteError::Malformed(format!("unknown {} code '{}'", field, code))),
    }
}

/// Rehydrate a wire service into the local representation.
pub fn normalize_service(wire: WireService) -> Result<Service, RemoteError> {
    let network: Network = option_from_code(wire.network.as_deref(), "network")?;
    let interaction: Interaction = option_from_code(wire.interaction.as_deref(), "interaction")?;
    Ok(Service {
        id: wire.id,
        name: wire.name,
        network,
        interaction,
        host: wire.host,
        port: wire.port,
    })
}

/// Lay a wire proxy over the default record. A missing or unknown status
/// reads as the default.
pub fn normalize_proxy(wire: WireProxy) -> Result<ProxyRecord, RemoteError> {
    let status = wire
        .status
        .as_ref()
        .and_then(Value::as_str)
        .and_then(ProxyStatus::parse)
        .unwrap_or_default();
    let service = match wire.service {
        Some(service) => normalize_service(service)?,
        None => Service::default(),
    };
    Ok(ProxyRecord {
        id: wire.id,
        port: wire.port,
        status,
        service,
    })
}

/// Normalize a proxy listing record by record. Records that cannot be read are
/// logged and left out so they do not hide the rest.
pub fn normalize_listing(wire: Vec<WireProxy>) -> Vec<ProxyRecord> {
    wire.into_iter()
        .filter_map(|proxy| {
            let id = proxy.id.clone();
            match normalize_proxy(proxy) {
                Ok(record) => Some(record),
                Err(error) => {
                    warn!("Skipping proxy {} in listing: {}", id, error);
                    None
                }
            }
        })
        .collect()
}

pub fn create_request(service: &Service) -> CreateServiceRequest {
    CreateServiceRequest {
        name: service.name.clone(),
        host: service.host.clone(),
        port: service.port,
        network: service.network.value().to_string(),
        interaction: service.interaction.value().to_string(),
    }
}

#[async_trait]
impl ProxyApi for RemoteClient {
    async fn fetch_proxies(&self, host: &str) -> Result<Vec<ProxyRecord>, RemoteError> {
        let wire: Vec<WireProxy> = self.send(self.client.get(Self::url(host, "proxies/"))).await?;
        Ok(normalize_listing(wire))
    }

    async fn add_proxy_service(
        &self,
        host: &str,
        service: &Service,
    ) -> Result<ProxyRecord, RemoteError> {
        let req = self
            .client
            .post(Self::url(host, "services/new/"))
            .json(&create_request(service));
        let wire: WireProxy = self.send(req).await?;
        normalize_proxy(wire)
    }

    async fn delete_proxy_service(&self, host: &str, proxy_id: &str) -> Result<(), RemoteError> {
        let req = self.client.delete(Self::url(host, &format!("proxies/{}/", proxy_id)));
        let value = self.send_value(req).await?;

        match value.get("success") {
            Some(Value::Bool(false)) | None => Err(RemoteError::Malformed(
                "deletion was not confirmed".to_string(),
            )),
            Some(_) => Ok(()),
        }
    }

    async fn change_proxy_port(
        &self,
        host: &str,
        proxy_id: &str,
        port: u16,
    ) -> Result<ProxyRecord, RemoteError> {
        let req = self
            .client
            .post(Self::url(host, &format!("proxies/{}/port", proxy_id)))
            .json(&ChangePortRequest { port });
        let wire: WireProxy = self.send(req).await?;
        normalize_proxy(wire)
    }

    async fn change_proxy_status(
        &self,
        host: &str,
        proxy_id: &str,
        status: ProxyStatus,
    ) -> Result<ProxyStatus, RemoteError> {
        let req = self
            .client
            .post(Self::url(host, &format!("proxies/{}/status", proxy_id)))
            .json(&ChangeStatusRequest { status });
        let resp: StatusResponse = self.send(req).await?;

        let raw = resp.status.unwrap_or(Value::Null);
        raw.as_str()
            .and_then(ProxyStatus::parse)
            .ok_or_else(|| RemoteError::Malformed(format!("unexpected proxy status {}", raw)))
    }

    async fn update_service(
        &self,
        host: &str,
        service_id: &str,
        update: &UpdateServiceRequest,
    ) -> Result<Service, RemoteError> {
        let req = self
            .client
            .post(Self::url(host, &format!("services/{}/", service_id)))
            .json(update);
        let wire: WireService = self.send(req).await?;
        normalize_service(wire)
    }
}
