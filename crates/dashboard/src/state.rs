use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use common::wire::UpdateServiceRequest;
use common::{Instance, Profile, ProxyRecord, ProxyStatus, Service, Snapshot, Toast, ToastVariant};
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{RemoteError, Result, StoreError};
use crate::reconcile::{self, ProfileReplacement, ProxyCache};
use crate::remote::ProxyApi;
use crate::snapshot::{self, BootSource};
use crate::store::{Collection, Entity, Stores};
use crate::toast::ToastSlot;

/// Shared dashboard state.
///
/// Entity stores sit behind one lock that is never held across a remote
/// call. Each instance gets its own proxy cache lock, so a slow instance only
/// holds up operations on that instance.
#[derive(Clone)]
pub struct AppState {
    stores: Arc<RwLock<Stores>>,
    proxies: Arc<RwLock<HashMap<u64, Arc<Mutex<ProxyCache>>>>>,
    remote: Arc<dyn ProxyApi>,
    db: Arc<Mutex<Connection>>,
    toast: Arc<RwLock<ToastSlot>>,
}

impl AppState {
    pub fn new(remote: Arc<dyn ProxyApi>, conn: Connection) -> Self {
        Self {
            stores: Arc::new(RwLock::new(Stores::default())),
            proxies: Arc::new(RwLock::new(HashMap::new())),
            remote,
            db: Arc::new(Mutex::new(conn)),
            toast: Arc::new(RwLock::new(ToastSlot::default())),
        }
    }

    pub async fn bootstrap(&self, seed_path: Option<&Path>) -> Result<BootSource> {
        let mut stores = self.stores.write().await;
        let db = self.db.lock().await;
        snapshot::bootstrap(&mut stores, seed_path, &db)
    }

    async fn persist(&self) -> Result<()> {
        let current = snapshot::capture(&*self.stores.read().await);
        let db = self.db.lock().await;
        snapshot::persist(&db, &current)
    }

    async fn raise(&self, error: &RemoteError) {
        warn!("Remote call failed: {}", error);
        self.toast.write().await.show(error.to_string(), ToastVariant::Error);
    }

    async fn checked<T>(&self, result: std::result::Result<T, RemoteError>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                self.raise(&error).await;
                Err(error.into())
            }
        }
    }

    // Entities

    pub async fn list<T: Collection>(&self) -> Vec<T> {
        T::of(&*self.stores.read().await).list().to_vec()
    }

    pub async fn find<T: Collection>(&self, id: &T::Id) -> Result<T> {
        T::of(&*self.stores.read().await)
            .find(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(T::KIND, id).into())
    }

    /// Commit `draft` as a new entity. A rejected draft stays in the store
    /// together with its field errors.
    pub async fn create<T: Collection>(&self, draft: T) -> Result<T> {
        let created = {
            let mut stores = self.stores.write().await;
            let store = T::of_mut(&mut stores);
            store.set_draft(draft);
            store.commit_draft()?
        };
        info!("Created {} {}", T::KIND, created.id());
        self.persist().await?;
        Ok(created)
    }

    pub async fn update<T: Collection>(&self, id: &T::Id, patch: &Value) -> Result<T> {
        let updated = T::of_mut(&mut *self.stores.write().await).update(id, patch)?;
        self.persist().await?;
        Ok(updated)
    }

    /// Remove a service from the registry after detaching every proxy that
    /// was created from it. Proxies the instances refuse to delete stay cached.
    pub async fn delete_service(&self, id: &str) -> Result<Service> {
        let service = self.find::<Service>(&id.to_string()).await?;

        for instance in self.list::<Instance>().await {
            let cache = self.cache_for(instance.id).await;
            let mut cache = cache.lock().await;
            let host = instance.address();
            for proxy in cache.created_from(&service.id) {
                let result =
                    reconcile::detach_proxy(self.remote.as_ref(), &host, &mut cache, &proxy.id)
                        .await;
                if let Err(error) = result {
                    self.raise(&error).await;
                }
            }
        }

        self.stores.write().await.services.remove(&service.id);
        info!("Deleted service {}", service.id);
        self.persist().await?;
        Ok(service)
    }

    pub async fn delete_profile(&self, id: &str) -> Result<Profile> {
        let removed = self
            .stores
            .write()
            .await
            .profiles
            .remove(&id.to_string())
            .ok_or_else(|| StoreError::not_found(Profile::KIND, id))?;
        self.persist().await?;
        Ok(removed)
    }

    /// Local removal only; proxies running on the instance are left alone.
    pub async fn delete_instance(&self, id: u64) -> Result<Instance> {
        let removed = self
            .stores
            .write()
            .await
            .instances
            .remove(&id)
            .ok_or_else(|| StoreError::not_found(Instance::KIND, id))?;
        self.proxies.write().await.remove(&id);
        self.persist().await?;
        Ok(removed)
    }

    pub async fn add_profile_service(
        &self,
        profile_id: &str,
        service_id: &str,
    ) -> Result<(Profile, bool)> {
        let outcome = self
            .stores
            .write()
            .await
            .add_service_to_profile(profile_id, service_id)?;
        if outcome.1 {
            self.persist().await?;
        }
        Ok(outcome)
    }

    pub async fn remove_profile_service(
        &self,
        profile_id: &str,
        service_id: &str,
    ) -> Result<(Profile, bool)> {
        let outcome = self
            .stores
            .write()
            .await
            .remove_service_from_profile(profile_id, service_id)?;
        if outcome.1 {
            self.persist().await?;
        }
        Ok(outcome)
    }

    // Proxies

    async fn cache_for(&self, instance_id: u64) -> Arc<Mutex<ProxyCache>> {
        self.proxies
            .write()
            .await
            .entry(instance_id)
            .or_default()
            .clone()
    }

    async fn instance_handle(
        &self,
        instance_id: u64,
    ) -> Result<(Instance, Arc<Mutex<ProxyCache>>)> {
        let instance = self.find::<Instance>(&instance_id).await?;
        Ok((instance, self.cache_for(instance_id).await))
    }

    /// Cached proxies without asking the instance.
    pub async fn cached_proxies(&self, instance_id: u64) -> Result<Vec<ProxyRecord>> {
        let (_, cache) = self.instance_handle(instance_id).await?;
        let cache = cache.lock().await;
        Ok(cache.list())
    }

    pub async fn refresh_proxies(&self, instance_id: u64) -> Result<Vec<ProxyRecord>> {
        let (instance, cache) = self.instance_handle(instance_id).await?;
        let mut cache = cache.lock().await;
        let result =
            reconcile::refresh_proxies(self.remote.as_ref(), &instance.address(), &mut cache).await;
        self.checked(result).await
    }

    pub async fn attach_service(&self, instance_id: u64, service_id: &str) -> Result<ProxyRecord> {
        let service = self.find::<Service>(&service_id.to_string()).await?;
        let (instance, cache) = self.instance_handle(instance_id).await?;
        let mut cache = cache.lock().await;
        let result = reconcile::attach_service(
            self.remote.as_ref(),
            &instance.address(),
            &mut cache,
            &service,
        )
        .await;
        self.checked(result).await
    }

    pub async fn detach_proxy(&self, instance_id: u64, proxy_id: &str) -> Result<()> {
        let (instance, cache) = self.instance_handle(instance_id).await?;
        let mut cache = cache.lock().await;
        let result = reconcile::detach_proxy(
            self.remote.as_ref(),
            &instance.address(),
            &mut cache,
            proxy_id,
        )
        .await;
        self.checked(result).await
    }

    pub async fn change_proxy_port(
        &self,
        instance_id: u64,
        proxy_id: &str,
        port: u16,
    ) -> Result<ProxyRecord> {
        let (instance, cache) = self.instance_handle(instance_id).await?;
        let mut cache = cache.lock().await;
        let result = reconcile::change_proxy_port(
            self.remote.as_ref(),
            &instance.address(),
            &mut cache,
            proxy_id,
            port,
        )
        .await;
        self.checked(result).await
    }

    pub async fn change_proxy_status(
        &self,
        instance_id: u64,
        proxy_id: &str,
        status: ProxyStatus,
    ) -> Result<ProxyStatus> {
        let (instance, cache) = self.instance_handle(instance_id).await?;
        let mut cache = cache.lock().await;
        let result = reconcile::change_proxy_status(
            self.remote.as_ref(),
            &instance.address(),
            &mut cache,
            proxy_id,
            status,
        )
        .await;
        self.checked(result).await
    }

    /// Push a name/port/host change to the service behind a cached proxy.
    pub async fn update_proxy_service(
        &self,
        instance_id: u64,
        proxy_id: &str,
        update: &UpdateServiceRequest,
    ) -> Result<ProxyRecord> {
        let (instance, cache) = self.instance_handle(instance_id).await?;
        let mut cache = cache.lock().await;
        let mut proxy = cache
            .get(proxy_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("proxy", proxy_id))?;

        let result = self
            .remote
            .update_service(&instance.address(), &proxy.service.id, update)
            .await;
        proxy.service = self.checked(result).await?;
        cache.register(proxy.clone());
        Ok(proxy)
    }

    /// Swap the instance's profile: detach what the old one provisioned,
    /// provision the new one, and record what actually got created.
    pub async fn replace_profile(
        &self,
        instance_id: u64,
        profile_id: &str,
    ) -> Result<ProfileReplacement> {
        let profile = self.find::<Profile>(&profile_id.to_string()).await?;
        let (instance, cache) = self.instance_handle(instance_id).await?;

        let mut replacement = {
            let mut cache = cache.lock().await;
            reconcile::replace_instance_profile(
                self.remote.as_ref(),
                &instance,
                &mut cache,
                &profile,
            )
            .await
        };

        for error in &replacement.failures {
            self.raise(error).await;
        }

        replacement.instance = self
            .record_profile(instance_id, replacement.instance.profile.clone())
            .await?;
        info!(
            "Instance {} now runs profile {} ({} attached, {} retained)",
            instance_id,
            profile.name,
            replacement.attached.len(),
            replacement.retained.len()
        );
        self.persist().await?;
        Ok(replacement)
    }

    /// Set only the profile of a tracked instance. The instance may have been
    /// edited or deleted while its proxies were being provisioned.
    async fn record_profile(&self, instance_id: u64, profile: Option<Profile>) -> Result<Instance> {
        let mut patch = serde_json::Map::new();
        patch.insert(
            "profile".to_string(),
            serde_json::to_value(profile).map_err(StoreError::from)?,
        );

        self.stores
            .write()
            .await
            .instances
            .upsert(&instance_id, &Value::Object(patch))?
            .ok_or_else(|| StoreError::not_found(Instance::KIND, instance_id).into())
    }

    // Snapshot

    pub async fn export_state(&self) -> Result<Snapshot> {
        let stores = self.stores.read().await;
        let db = self.db.lock().await;
        snapshot::export_snapshot(&stores, &db)
    }

    /// Destructive restore from a snapshot document. Every proxy cache is
    /// dropped; an imported id may name a different host.
    pub async fn import_state(&self, document: &str) -> Result<Snapshot> {
        let imported = {
            let mut stores = self.stores.write().await;
            snapshot::import_snapshot(&mut stores, document)?
        };

        self.proxies.write().await.clear();

        info!(
            "Imported {} service(s), {} profile(s), {} instance(s)",
            imported.services.len(),
            imported.profiles.len(),
            imported.instances.len()
        );
        self.persist().await?;
        Ok(imported)
    }

    // Toast

    pub async fn toast(&self) -> Toast {
        self.toast.read().await.current().clone()
    }

    pub async fn dismiss_toast(&self) {
        self.toast.write().await.dismiss();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::error::DashboardError;
    use crate::reconcile::tests::FakeInstance;
    use serde_json::json;

    fn state_with(api: FakeInstance) -> AppState {
        AppState::new(Arc::new(api), db::init_memory_db().unwrap())
    }

    async fn lab(state: &AppState) -> Instance {
        state
            .create(Instance {
                name: "Lab1".into(),
                host: "10.0.0.5".into(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn service(state: &AppState, name: &str) -> Service {
        state
            .create(Service {
                name: name.into(),
                host: "localhost".into(),
                port: 5683,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rejected_create_keeps_draft() {
        let state = state_with(FakeInstance::default());
        service(&state, "CoAP").await;

        let err = state
            .create(Service {
                name: "CoAP".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::Store(StoreError::Invalid(_))));
        assert_eq!(state.list::<Service>().await.len(), 1);

        let stores = state.stores.read().await;
        assert_eq!(stores.services.draft().name, "CoAP");
        assert!(stores.services.field_error("name").is_some());
    }

    #[tokio::test]
    async fn mutations_are_persisted() {
        let state = state_with(FakeInstance::default());
        service(&state, "CoAP").await;

        let db = state.db.lock().await;
        let persisted = snapshot::load_persisted(&db).unwrap().unwrap();
        assert_eq!(persisted.services[0].name, "CoAP");
    }

    #[tokio::test]
    async fn attach_registers_proxy() {
        let state = state_with(FakeInstance::default());
        let inst = lab(&state).await;
        let coap = service(&state, "CoAP").await;

        let proxy = state.attach_service(inst.id, &coap.id).await.unwrap();
        assert_eq!(state.cached_proxies(inst.id).await.unwrap(), vec![proxy]);
    }

    #[tokio::test]
    async fn failed_attach_raises_error_toast() {
        let state = state_with(FakeInstance {
            fail_names: vec!["CoAP".into()],
            ..Default::default()
        });
        let inst = lab(&state).await;
        let coap = service(&state, "CoAP").await;

        assert!(state.attach_service(inst.id, &coap.id).await.is_err());
        assert!(state.cached_proxies(inst.id).await.unwrap().is_empty());

        let toast = state.toast().await;
        assert!(toast.show);
        assert_eq!(toast.variant, ToastVariant::Error);

        state.dismiss_toast().await;
        assert!(!state.toast().await.show);
    }

    #[tokio::test]
    async fn replace_profile_records_provisioned_services() {
        let state = state_with(FakeInstance {
            fail_names: vec!["MQTT".into()],
            ..Default::default()
        });
        let inst = lab(&state).await;
        let coap = service(&state, "CoAP").await;
        let mqtt = service(&state, "MQTT").await;
        let profile = state
            .create(Profile {
                name: "Printer".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        state.add_profile_service(&profile.id, &coap.id).await.unwrap();
        state.add_profile_service(&profile.id, &mqtt.id).await.unwrap();

        let result = state.replace_profile(inst.id, &profile.id).await.unwrap();
        assert_eq!(result.attached.len(), 1);

        let stored = state.find::<Instance>(&inst.id).await.unwrap();
        let names: Vec<String> =
            stored.profile.unwrap().services.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["CoAP".to_string()]);
    }

    #[tokio::test]
    async fn deleting_service_detaches_its_proxies() {
        let api = Arc::new(FakeInstance::default());
        let state = AppState::new(api.clone(), db::init_memory_db().unwrap());
        let inst = lab(&state).await;
        let coap = service(&state, "CoAP").await;
        let mqtt = service(&state, "MQTT").await;
        let proxy = state.attach_service(inst.id, &coap.id).await.unwrap();
        let kept = state.attach_service(inst.id, &mqtt.id).await.unwrap();
        assert_ne!(proxy.service.id, coap.id);

        state.delete_service(&coap.id).await.unwrap();

        assert_eq!(*api.deleted.lock().unwrap(), vec![proxy.id]);
        assert_eq!(state.cached_proxies(inst.id).await.unwrap(), vec![kept]);
        assert_eq!(state.list::<Service>().await, vec![mqtt]);
    }

    #[tokio::test]
    async fn refused_cascade_delete_keeps_proxy_cached() {
        let state = state_with(FakeInstance {
            refuse_delete: vec!["px1".into()],
            ..Default::default()
        });
        let inst = lab(&state).await;
        let coap = service(&state, "CoAP").await;
        state.attach_service(inst.id, &coap.id).await.unwrap();

        state.delete_service(&coap.id).await.unwrap();

        assert_eq!(state.cached_proxies(inst.id).await.unwrap().len(), 1);
        assert_eq!(state.toast().await.variant, ToastVariant::Error);
    }

    #[tokio::test]
    async fn import_drops_every_proxy_cache() {
        let state = state_with(FakeInstance::default());
        let inst = lab(&state).await;
        let coap = service(&state, "CoAP").await;
        state.attach_service(inst.id, &coap.id).await.unwrap();

        // Same id, different host.
        let document = json!({
            "instances": [{"id": inst.id, "name": "Lab1", "host": "192.168.9.9", "port": 2022}]
        })
        .to_string();
        state.import_state(&document).await.unwrap();

        let moved = state.find::<Instance>(&inst.id).await.unwrap();
        assert_eq!(moved.address(), "192.168.9.9:2022");
        assert!(state.cached_proxies(inst.id).await.unwrap().is_empty());

        state.import_state(r#"{"instances": []}"#).await.unwrap();
        assert!(matches!(
            state.cached_proxies(inst.id).await,
            Err(DashboardError::Store(StoreError::NotFound { .. }))
        ));
    }

    /// Holds every proxy creation until the test lets it through.
    struct GatedInstance {
        entered: tokio::sync::Notify,
        gate: tokio::sync::Semaphore,
    }

    impl GatedInstance {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entered: tokio::sync::Notify::new(),
                gate: tokio::sync::Semaphore::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ProxyApi for GatedInstance {
        async fn fetch_proxies(
            &self,
            _host: &str,
        ) -> std::result::Result<Vec<ProxyRecord>, RemoteError> {
            Ok(Vec::new())
        }

        async fn add_proxy_service(
            &self,
            _host: &str,
            service: &Service,
        ) -> std::result::Result<ProxyRecord, RemoteError> {
            self.entered.notify_one();
            let _permit = self.gate.acquire().await;
            Ok(ProxyRecord {
                id: "px1".into(),
                service: service.clone(),
                ..Default::default()
            })
        }

        async fn delete_proxy_service(
            &self,
            _host: &str,
            _proxy_id: &str,
        ) -> std::result::Result<(), RemoteError> {
            Ok(())
        }

        async fn change_proxy_port(
            &self,
            _host: &str,
            proxy_id: &str,
            port: u16,
        ) -> std::result::Result<ProxyRecord, RemoteError> {
            Ok(ProxyRecord {
                id: proxy_id.into(),
                port,
                ..Default::default()
            })
        }

        async fn change_proxy_status(
            &self,
            _host: &str,
            _proxy_id: &str,
            status: ProxyStatus,
        ) -> std::result::Result<ProxyStatus, RemoteError> {
            Ok(status)
        }

        async fn update_service(
            &self,
            _host: &str,
            service_id: &str,
            _update: &UpdateServiceRequest,
        ) -> std::result::Result<Service, RemoteError> {
            Ok(Service {
                id: service_id.into(),
                ..Default::default()
            })
        }
    }

    async fn gated_profile(state: &AppState) -> (Instance, Profile) {
        let inst = lab(state).await;
        let coap = service(state, "CoAP").await;
        let profile = state
            .create(Profile {
                name: "Printer".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        state.add_profile_service(&profile.id, &coap.id).await.unwrap();
        (inst, profile)
    }

    #[tokio::test]
    async fn replace_profile_does_not_resurrect_deleted_instance() {
        let api = GatedInstance::new();
        let state = AppState::new(api.clone(), db::init_memory_db().unwrap());
        let (inst, profile) = gated_profile(&state).await;

        let task = {
            let state = state.clone();
            let (instance_id, profile_id) = (inst.id, profile.id.clone());
            tokio::spawn(async move { state.replace_profile(instance_id, &profile_id).await })
        };
        api.entered.notified().await;
        state.delete_instance(inst.id).await.unwrap();
        api.gate.add_permits(1);

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(DashboardError::Store(StoreError::NotFound { .. }))
        ));
        assert!(state.list::<Instance>().await.is_empty());
    }

    #[tokio::test]
    async fn replace_profile_keeps_concurrent_edits() {
        let api = GatedInstance::new();
        let state = AppState::new(api.clone(), db::init_memory_db().unwrap());
        let (inst, profile) = gated_profile(&state).await;

        let task = {
            let state = state.clone();
            let (instance_id, profile_id) = (inst.id, profile.id.clone());
            tokio::spawn(async move { state.replace_profile(instance_id, &profile_id).await })
        };
        api.entered.notified().await;
        state
            .update::<Instance>(&inst.id, &json!({"description": "rack 3"}))
            .await
            .unwrap();
        api.gate.add_permits(1);

        let replacement = task.await.unwrap().unwrap();
        assert_eq!(replacement.instance.description, "rack 3");
        let stored = state.find::<Instance>(&inst.id).await.unwrap();
        assert_eq!(stored.description, "rack 3");
        assert_eq!(stored.profile.unwrap().id, profile.id);
    }

    #[tokio::test]
    async fn update_patches_shallowly() {
        let state = state_with(FakeInstance::default());
        let inst = lab(&state).await;
        let updated = state
            .update::<Instance>(&inst.id, &json!({"description": "rack 3"}))
            .await
            .unwrap();
        assert_eq!(updated.description, "rack 3");
        assert_eq!(updated.host, "10.0.0.5");
    }
}
