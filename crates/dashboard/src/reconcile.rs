//! Keeps an instance's cached proxies in line with what the instance reports.
//!
//! The cache only changes after the instance has answered. Presence is tracked
//! locally through the ordered id list; content always comes from the remote.

use std::collections::HashMap;

use common::{Instance, Profile, ProxyRecord, ProxyStatus, Service};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::RemoteError;
use crate::remote::ProxyApi;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyCache {
    ids: Vec<String>,
    records: HashMap<String, ProxyRecord>,
    /// Registry service each proxy was created from, by proxy id. Instances
    /// assign their own service ids, so this is the only link back.
    origins: HashMap<String, String>,
}

impl ProxyCache {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ProxyRecord> {
        self.records.get(id)
    }

    /// Records in tracking order.
    pub fn list(&self) -> Vec<ProxyRecord> {
        self.ids
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }

    /// Track the record if it is new and take its content either way.
    pub fn register(&mut self, record: ProxyRecord) {
        if !self.ids.contains(&record.id) {
            self.ids.push(record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
    }

    /// Register a proxy created from the registry service `service_id`.
    pub fn register_from(&mut self, record: ProxyRecord, service_id: &str) {
        self.origins.insert(record.id.clone(), service_id.to_string());
        self.register(record);
    }

    pub fn origin(&self, id: &str) -> Option<&str> {
        self.origins.get(id).map(String::as_str)
    }

    /// Fold a remote listing in. Returns how many ids were not tracked before.
    pub fn merge(&mut self, incoming: Vec<ProxyRecord>) -> usize {
        let before = self.ids.len();
        self.ids = merge_incoming_proxies(&self.ids, &incoming);
        for record in incoming {
            self.records.insert(record.id.clone(), record);
        }
        self.ids.len() - before
    }

    pub fn evict(&mut self, id: &str) -> Option<ProxyRecord> {
        self.ids.retain(|x| x != id);
        self.origins.remove(id);
        self.records.remove(id)
    }

    /// Cached proxies created from the registry service `service_id`.
    pub fn created_from(&self, service_id: &str) -> Vec<ProxyRecord> {
        self.list()
            .into_iter()
            .filter(|p| self.origin(&p.id) == Some(service_id))
            .collect()
    }

    /// Cached proxies whose underlying service is one of `service_ids`.
    pub fn for_services(&self, service_ids: &[String]) -> Vec<ProxyRecord> {
        self.list()
            .into_iter()
            .filter(|p| service_ids.contains(&p.service.id))
            .collect()
    }

    fn set_status(&mut self, id: &str, status: ProxyStatus) {
        if let Some(record) = self.records.get_mut(id) {
            record.status = status;
        }
    }
}

/// Ids of `existing` followed by every incoming id not already present.
pub fn merge_incoming_proxies(existing_ids: &[String], incoming: &[ProxyRecord]) -> Vec<String> {
    let mut ids = existing_ids.to_vec();
    for record in incoming {
        if !ids.contains(&record.id) {
            ids.push(record.id.clone());
        }
    }
    ids
}

#[derive(Debug)]
pub struct ServiceFailure {
    pub service: Service,
    pub error: RemoteError,
}

#[derive(Debug)]
pub struct AppliedProfile {
    /// Proxies the instance created, in the profile's order.
    pub proxies: Vec<ProxyRecord>,
    /// Id of the profile service each proxy was created from, by position.
    pub origins: Vec<String>,
    /// The profile with its services replaced by the ones the instance
    /// confirmed.
    pub profile: Profile,
    pub failures: Vec<ServiceFailure>,
}

/// Create one proxy per profile service, one after the other, keeping only
/// the ones that succeed.
pub async fn apply_profile<A: ProxyApi + ?Sized>(
    api: &A,
    host: &str,
    profile: &Profile,
) -> AppliedProfile {
    let mut proxies = Vec::with_capacity(profile.services.len());
    let mut origins = Vec::with_capacity(profile.services.len());
    let mut failures = Vec::new();

    for service in &profile.services {
        match api.add_proxy_service(host, service).await {
            Ok(proxy) => {
                proxies.push(proxy);
                origins.push(service.id.clone());
            }
            Err(error) => {
                warn!("Failed to provision {} on {}: {}", service.name, host, error);
                failures.push(ServiceFailure {
                    service: service.clone(),
                    error,
                });
            }
        }
    }

    let profile = Profile {
        services: proxies.iter().map(|p| p.service.clone()).collect(),
        ..profile.clone()
    };

    AppliedProfile {
        proxies,
        origins,
        profile,
        failures,
    }
}

#[derive(Debug)]
pub struct ProfileReplacement {
    pub instance: Instance,
    pub attached: Vec<ProxyRecord>,
    /// Proxies of the previous profile that the instance refused to delete.
    pub retained: Vec<ProxyRecord>,
    pub failures: Vec<RemoteError>,
}

/// Tear down the proxies provisioned for the instance's current profile, then
/// provision `new_profile`. Best effort: neither step is rolled back.
pub async fn replace_instance_profile<A: ProxyApi + ?Sized>(
    api: &A,
    instance: &Instance,
    cache: &mut ProxyCache,
    new_profile: &Profile,
) -> ProfileReplacement {
    let host = instance.address();
    let mut retained = Vec::new();
    let mut failures = Vec::new();

    if let Some(current) = &instance.profile {
        let service_ids: Vec<String> = current.services.iter().map(|s| s.id.clone()).collect();
        for proxy in cache.for_services(&service_ids) {
            if let Err(error) = detach_proxy(api, &host, cache, &proxy.id).await {
                retained.push(proxy);
                failures.push(error);
            }
        }
    }

    let applied = apply_profile(api, &host, new_profile).await;
    for (proxy, origin) in applied.proxies.iter().zip(&applied.origins) {
        cache.register_from(proxy.clone(), origin);
    }
    failures.extend(applied.failures.into_iter().map(|f| f.error));

    let instance = Instance {
        profile: Some(applied.profile),
        ..instance.clone()
    };

    ProfileReplacement {
        instance,
        attached: applied.proxies,
        retained,
        failures,
    }
}

pub async fn refresh_proxies<A: ProxyApi + ?Sized>(
    api: &A,
    host: &str,
    cache: &mut ProxyCache,
) -> Result<Vec<ProxyRecord>, RemoteError> {
    let incoming = api.fetch_proxies(host).await?;
    let added = cache.merge(incoming);
    debug!("Merged proxies from {}: {} new, {} tracked", host, added, cache.len());
    Ok(cache.list())
}

pub async fn attach_service<A: ProxyApi + ?Sized>(
    api: &A,
    host: &str,
    cache: &mut ProxyCache,
    service: &Service,
) -> Result<ProxyRecord, RemoteError> {
    let proxy = api.add_proxy_service(host, service).await?;
    cache.register_from(proxy.clone(), &service.id);
    Ok(proxy)
}

/// The cached entry is only dropped once the instance confirms the delete.
pub async fn detach_proxy<A: ProxyApi + ?Sized>(
    api: &A,
    host: &str,
    cache: &mut ProxyCache,
    proxy_id: &str,
) -> Result<(), RemoteError> {
    api.delete_proxy_service(host, proxy_id).await?;
    cache.evict(proxy_id);
    Ok(())
}

pub async fn change_proxy_port<A: ProxyApi + ?Sized>(
    api: &A,
    host: &str,
    cache: &mut ProxyCache,
    proxy_id: &str,
    port: u16,
) -> Result<ProxyRecord, RemoteError> {
    let proxy = api.change_proxy_port(host, proxy_id, port).await?;
    cache.register(proxy.clone());
    Ok(proxy)
}

/// The cached status keeps its last confirmed value until the instance
/// answers with a valid one.
pub async fn change_proxy_status<A: ProxyApi + ?Sized>(
    api: &A,
    host: &str,
    cache: &mut ProxyCache,
    proxy_id: &str,
    status: ProxyStatus,
) -> Result<ProxyStatus, RemoteError> {
    let confirmed = api.change_proxy_status(host, proxy_id, status).await?;
    cache.set_status(proxy_id, confirmed);
    Ok(confirmed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::wire::UpdateServiceRequest;
    use std::sync::Mutex;

    /// Scripted instance: creates succeed unless the service name is listed
    /// in `fail_names`, deletes succeed unless the id is in `refuse_delete`.
    #[derive(Default)]
    pub(crate) struct FakeInstance {
        pub fail_names: Vec<String>,
        pub refuse_delete: Vec<String>,
        pub listing: Vec<ProxyRecord>,
        pub status_answer: Option<Result<ProxyStatus, String>>,
        pub created: Mutex<Vec<Service>>,
        pub deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProxyApi for FakeInstance {
        async fn fetch_proxies(&self, _host: &str) -> Result<Vec<ProxyRecord>, RemoteError> {
            Ok(self.listing.clone())
        }

        async fn add_proxy_service(
            &self,
            _host: &str,
            service: &Service,
        ) -> Result<ProxyRecord, RemoteError> {
            if self.fail_names.contains(&service.name) {
                return Err(RemoteError::Rejected {
                    status: 400,
                    message: format!("cannot create {}", service.name),
                });
            }
            let mut created = self.created.lock().unwrap();
            created.push(service.clone());
            let n = created.len();
            Ok(ProxyRecord {
                id: format!("px{}", n),
                port: service.port,
                status: ProxyStatus::Stopped,
                service: Service {
                    id: format!("remote-{}", n),
                    ..service.clone()
                },
            })
        }

        async fn delete_proxy_service(
            &self,
            _host: &str,
            proxy_id: &str,
        ) -> Result<(), RemoteError> {
            if self.refuse_delete.iter().any(|id| id == proxy_id) {
                return Err(RemoteError::Malformed("deletion was not confirmed".into()));
            }
            self.deleted.lock().unwrap().push(proxy_id.to_string());
            Ok(())
        }

        async fn change_proxy_port(
            &self,
            _host: &str,
            proxy_id: &str,
            port: u16,
        ) -> Result<ProxyRecord, RemoteError> {
            Ok(ProxyRecord {
                id: proxy_id.to_string(),
                port,
                ..Default::default()
            })
        }

        async fn change_proxy_status(
            &self,
            _host: &str,
            _proxy_id: &str,
            status: ProxyStatus,
        ) -> Result<ProxyStatus, RemoteError> {
            match &self.status_answer {
                None => Ok(status),
                Some(Ok(s)) => Ok(*s),
                Some(Err(raw)) => Err(RemoteError::Malformed(format!(
                    "unexpected proxy status {}",
                    raw
                ))),
            }
        }

        async fn update_service(
            &self,
            _host: &str,
            service_id: &str,
            update: &UpdateServiceRequest,
        ) -> Result<Service, RemoteError> {
            Ok(Service {
                id: service_id.to_string(),
                name: update.name.clone(),
                host: update.host.clone(),
                port: update.port,
                ..Default::default()
            })
        }
    }

    fn named(name: &str) -> Service {
        Service {
            id: format!("local-{}", name),
            name: name.to_string(),
            port: 1000,
            ..Default::default()
        }
    }

    fn proxy(id: &str, port: u16) -> ProxyRecord {
        ProxyRecord {
            id: id.to_string(),
            port,
            ..Default::default()
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let incoming = vec![proxy("a", 1), proxy("b", 2)];
        let once = merge_incoming_proxies(&[], &incoming);
        let twice = merge_incoming_proxies(&once, &incoming);
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
    }

    #[test]
    fn merge_keeps_existing_order_and_refreshes_content() {
        let mut cache = ProxyCache::default();
        cache.register(proxy("b", 1));
        assert_eq!(cache.merge(vec![proxy("a", 5), proxy("b", 9)]), 1);
        assert_eq!(cache.ids(), &["b".to_string(), "a".to_string()]);
        assert_eq!(cache.get("b").unwrap().port, 9);
    }

    #[tokio::test]
    async fn apply_profile_skips_failed_services() {
        let api = FakeInstance {
            fail_names: vec!["B".into()],
            ..Default::default()
        };
        let profile = Profile {
            id: "p".into(),
            name: "Printer".into(),
            services: vec![named("A"), named("B"), named("C")],
            ..Default::default()
        };

        let applied = apply_profile(&api, "lab:2022", &profile).await;

        let names: Vec<&str> = applied.proxies.iter().map(|p| p.service.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);
        let stamped: Vec<&str> = applied.profile.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(stamped, vec!["A", "C"]);
        assert_eq!(applied.profile.services[0].id, "remote-1");
        assert_eq!(applied.failures.len(), 1);
        assert_eq!(applied.failures[0].service.name, "B");
    }

    #[tokio::test]
    async fn replace_profile_keeps_proxies_that_fail_to_delete() {
        let api = FakeInstance {
            refuse_delete: vec!["old2".into()],
            ..Default::default()
        };

        let old_a = Service { id: "sa".into(), ..named("A") };
        let old_b = Service { id: "sb".into(), ..named("B") };
        let mut cache = ProxyCache::default();
        let tracked = [
            ("old1", old_a.clone()),
            ("old2", old_b.clone()),
            ("custom", named("X")),
        ];
        for (id, service) in tracked {
            cache.register(ProxyRecord {
                id: id.into(),
                service,
                ..Default::default()
            });
        }

        let instance = Instance {
            id: 1,
            name: "Lab1".into(),
            profile: Some(Profile {
                id: "old".into(),
                services: vec![old_a, old_b],
                ..Default::default()
            }),
            ..Default::default()
        };
        let next = Profile {
            id: "new".into(),
            name: "Camera".into(),
            services: vec![named("C")],
            ..Default::default()
        };

        let result = replace_instance_profile(&api, &instance, &mut cache, &next).await;

        assert!(!cache.contains("old1"));
        assert!(cache.contains("old2"));
        assert!(cache.contains("custom"));
        assert!(cache.contains("px1"));
        assert_eq!(result.retained.len(), 1);
        assert_eq!(result.failures.len(), 1);
        let profile = result.instance.profile.unwrap();
        assert_eq!(profile.id, "new");
        assert_eq!(profile.services.len(), 1);
    }

    #[tokio::test]
    async fn refused_delete_leaves_cache_untouched() {
        let api = FakeInstance {
            refuse_delete: vec!["p1".into()],
            ..Default::default()
        };
        let mut cache = ProxyCache::default();
        cache.register(proxy("p1", 5683));

        assert!(detach_proxy(&api, "lab:2022", &mut cache, "p1").await.is_err());
        assert!(cache.contains("p1"));
    }

    #[tokio::test]
    async fn invalid_status_answer_keeps_confirmed_status() {
        let api = FakeInstance {
            status_answer: Some(Err("\"paused\"".into())),
            ..Default::default()
        };
        let mut cache = ProxyCache::default();
        cache.register(proxy("p1", 5683));

        let result =
            change_proxy_status(&api, "lab:2022", &mut cache, "p1", ProxyStatus::Running).await;
        assert!(result.is_err());
        assert_eq!(cache.get("p1").unwrap().status, ProxyStatus::Stopped);

        let api = FakeInstance::default();
        change_proxy_status(&api, "lab:2022", &mut cache, "p1", ProxyStatus::Running)
            .await
            .unwrap();
        assert_eq!(cache.get("p1").unwrap().status, ProxyStatus::Running);
    }

    #[tokio::test]
    async fn created_proxies_remember_their_registry_service() {
        let api = FakeInstance::default();
        let mut cache = ProxyCache::default();
        let proxy = attach_service(&api, "lab:2022", &mut cache, &named("A")).await.unwrap();

        assert_eq!(proxy.service.id, "remote-1");
        assert_eq!(cache.origin(&proxy.id), Some("local-A"));
        assert_eq!(cache.created_from("local-A"), vec![proxy.clone()]);
        assert!(cache.created_from("remote-1").is_empty());

        cache.merge(vec![proxy.clone()]);
        assert_eq!(cache.origin(&proxy.id), Some("local-A"));

        detach_proxy(&api, "lab:2022", &mut cache, &proxy.id).await.unwrap();
        assert_eq!(cache.origin(&proxy.id), None);
    }

    #[tokio::test]
    async fn refresh_twice_does_not_duplicate() {
        let api = FakeInstance {
            listing: vec![proxy("a", 1), proxy("b", 2)],
            ..Default::default()
        };
        let mut cache = ProxyCache::default();
        refresh_proxies(&api, "lab:2022", &mut cache).await.unwrap();
        let listed = refresh_proxies(&api, "lab:2022", &mut cache).await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
