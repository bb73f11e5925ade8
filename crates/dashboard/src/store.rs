//! In-memory collections of services, profiles and instances.
//!
//! Each collection keeps insertion order, answers lookups of unknown ids with
//! the kind's default value, and carries the create-form draft together with
//! the field errors produced the last time that draft was committed.

use std::fmt;

use common::api::FieldErrors;
use common::{Instance, Profile, Service};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::validate::{self, name_unique, port_in_range, Validator};

pub trait Entity: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Id: Clone + PartialEq + fmt::Display + DeserializeOwned + Send + Sync + 'static;

    const KIND: &'static str;

    fn id(&self) -> &Self::Id;
    fn set_id(&mut self, id: Self::Id);
    fn name(&self) -> &str;

    fn port(&self) -> Option<u16> {
        None
    }

    /// Identity for a newly committed entity.
    fn next_id(existing: &[Self]) -> Self::Id;

    fn validators() -> &'static [Validator<Self>];
}

const SERVICE_VALIDATORS: &[Validator<Service>] = &[name_unique, port_in_range];
const PROFILE_VALIDATORS: &[Validator<Profile>] = &[name_unique];
const INSTANCE_VALIDATORS: &[Validator<Instance>] = &[name_unique, port_in_range];

impl Entity for Service {
    type Id = String;
    const KIND: &'static str = "service";

    fn id(&self) -> &String {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> Option<u16> {
        Some(self.port)
    }

    fn next_id(_existing: &[Self]) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn validators() -> &'static [Validator<Self>] {
        SERVICE_VALIDATORS
    }
}

impl Entity for Profile {
    type Id = String;
    const KIND: &'static str = "profile";

    fn id(&self) -> &String {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn next_id(_existing: &[Self]) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn validators() -> &'static [Validator<Self>] {
        PROFILE_VALIDATORS
    }
}

impl Entity for Instance {
    type Id = u64;
    const KIND: &'static str = "instance";

    fn id(&self) -> &u64 {
        &self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn port(&self) -> Option<u16> {
        Some(self.port)
    }

    // Local monotonic sequence, starting at 1.
    fn next_id(existing: &[Self]) -> u64 {
        existing.iter().map(|i| i.id).max().unwrap_or(0) + 1
    }

    fn validators() -> &'static [Validator<Self>] {
        INSTANCE_VALIDATORS
    }
}

/// Merge the top-level keys of `patch` over `base`. Nested values are
/// replaced wholesale and the id is never touched.
fn merge_shallow<T: Entity>(base: &T, patch: &Value) -> Result<T, StoreError> {
    let fields = patch.as_object().ok_or(StoreError::InvalidPatch)?;
    let mut merged = serde_json::to_value(base)?;
    if let Value::Object(target) = &mut merged {
        for (key, value) in fields {
            if key == "id" {
                continue;
            }
            target.insert(key.clone(), value.clone());
        }
    }
    Ok(serde_json::from_value(merged)?)
}

#[derive(Debug, Clone)]
pub struct EntityStore<T: Entity> {
    items: Vec<T>,
    draft: T,
    errors: FieldErrors,
}

impl<T: Entity> Default for EntityStore<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            draft: T::default(),
            errors: FieldErrors::new(),
        }
    }
}

impl<T: Entity> EntityStore<T> {
    pub fn list(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, id: &T::Id) -> Option<&T> {
        self.items.iter().find(|e| e.id() == id)
    }

    /// The entity, or the kind's default value when the id is not tracked.
    pub fn get(&self, id: &T::Id) -> T {
        self.find(id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.find(id).is_some()
    }

    /// Append, or replace the entity carrying the same id.
    pub fn insert(&mut self, item: T) {
        if let Some(found) = self.items.iter_mut().find(|e| e.id() == item.id()) {
            *found = item;
        } else {
            self.items.push(item);
        }
    }

    /// Shallow-merge `patch` into a tracked entity. Returns `None` when the id
    /// is unknown.
    pub fn upsert(&mut self, id: &T::Id, patch: &Value) -> Result<Option<T>, StoreError> {
        let Some(found) = self.items.iter_mut().find(|e| e.id() == id) else {
            return Ok(None);
        };
        *found = merge_shallow(found, patch)?;
        Ok(Some(found.clone()))
    }

    /// Like [`upsert`](Self::upsert), but the merged entity must pass the
    /// kind's validators before it replaces the tracked one.
    pub fn update(&mut self, id: &T::Id, patch: &Value) -> Result<T, StoreError> {
        let current = self
            .find(id)
            .ok_or_else(|| StoreError::not_found(T::KIND, id))?;
        let merged = merge_shallow(current, patch)?;

        let errors = self.validate(&merged);
        if !errors.is_empty() {
            return Err(StoreError::Invalid(errors));
        }

        self.insert(merged.clone());
        Ok(merged)
    }

    pub fn remove(&mut self, id: &T::Id) -> Option<T> {
        let pos = self.items.iter().position(|e| e.id() == id)?;
        Some(self.items.remove(pos))
    }

    pub fn replace_all(&mut self, items: Vec<T>) {
        self.items = items;
    }

    pub fn validate(&self, candidate: &T) -> FieldErrors {
        validate::run(candidate, &self.items, T::validators())
    }

    pub fn draft(&self) -> &T {
        &self.draft
    }

    pub fn set_draft(&mut self, draft: T) {
        self.draft = draft;
    }

    pub fn set_draft_field(&mut self, field: &str, value: Value) -> Result<(), StoreError> {
        let mut patch = serde_json::Map::new();
        patch.insert(field.to_string(), value);
        self.draft = merge_shallow(&self.draft, &Value::Object(patch))?;
        Ok(())
    }

    pub fn reset_draft(&mut self) {
        self.draft = T::default();
        self.errors.clear();
    }

    pub fn errors(&self) -> &FieldErrors {
        &self.errors
    }

    pub fn field_error(&self, field: &str) -> Option<&str> {
        self.errors.get(field).map(String::as_str)
    }

    /// Validate the draft and, when clean, add it under a fresh id. On failure
    /// the draft stays as it is and the errors are kept for display.
    ///
    /// Whatever id the draft carries is ignored, so a draft can never pass as
    /// an edit of an entity it shares an id with.
    pub fn commit_draft(&mut self) -> Result<T, StoreError> {
        self.errors.clear();

        let mut entity = self.draft.clone();
        entity.set_id(T::next_id(&self.items));

        let errors = self.validate(&entity);
        if !errors.is_empty() {
            self.errors = errors.clone();
            return Err(StoreError::Invalid(errors));
        }

        self.items.push(entity.clone());
        self.reset_draft();
        Ok(entity)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stores {
    pub services: EntityStore<Service>,
    pub profiles: EntityStore<Profile>,
    pub instances: EntityStore<Instance>,
}

/// Selects the collection an entity kind lives in.
pub trait Collection: Entity {
    fn of(stores: &Stores) -> &EntityStore<Self>;
    fn of_mut(stores: &mut Stores) -> &mut EntityStore<Self>;
}

impl Collection for Service {
    fn of(stores: &Stores) -> &EntityStore<Self> {
        &stores.services
    }

    fn of_mut(stores: &mut Stores) -> &mut EntityStore<Self> {
        &mut stores.services
    }
}

impl Collection for Profile {
    fn of(stores: &Stores) -> &EntityStore<Self> {
        &stores.profiles
    }

    fn of_mut(stores: &mut Stores) -> &mut EntityStore<Self> {
        &mut stores.profiles
    }
}

impl Collection for Instance {
    fn of(stores: &Stores) -> &EntityStore<Self> {
        &stores.instances
    }

    fn of_mut(stores: &mut Stores) -> &mut EntityStore<Self> {
        &mut stores.instances
    }
}

impl Stores {
    /// Copy a registry service into a profile. Adding a service that is
    /// already part of the profile changes nothing.
    pub fn add_service_to_profile(
        &mut self,
        profile_id: &str,
        service_id: &str,
    ) -> Result<(Profile, bool), StoreError> {
        let service = self
            .services
            .find(&service_id.to_string())
            .cloned()
            .ok_or_else(|| StoreError::not_found(Service::KIND, service_id))?;
        let mut profile = self
            .profiles
            .find(&profile_id.to_string())
            .cloned()
            .ok_or_else(|| StoreError::not_found(Profile::KIND, profile_id))?;

        if profile.services.iter().any(|s| s.id == service.id) {
            return Ok((profile, false));
        }

        profile.services.push(service);
        self.profiles.insert(profile.clone());
        Ok((profile, true))
    }

    pub fn remove_service_from_profile(
        &mut self,
        profile_id: &str,
        service_id: &str,
    ) -> Result<(Profile, bool), StoreError> {
        let mut profile = self
            .profiles
            .find(&profile_id.to_string())
            .cloned()
            .ok_or_else(|| StoreError::not_found(Profile::KIND, profile_id))?;

        let before = profile.services.len();
        profile.services.retain(|s| s.id != service_id);
        let changed = profile.services.len() != before;
        if changed {
            self.profiles.insert(profile.clone());
        }
        Ok((profile, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Network, SelectOption};
    use serde_json::json;

    fn coap() -> Service {
        Service {
            name: "CoAP".to_string(),
            host: "localhost".to_string(),
            port: 5683,
            network: Network::Udp,
            ..Default::default()
        }
    }

    #[test]
    fn commit_assigns_id_and_resets_draft() {
        let mut store = EntityStore::<Service>::default();
        store.set_draft(coap());

        let created = store.commit_draft().unwrap();
        assert!(!created.id.is_empty());
        assert_eq!(store.list(), &[created]);
        assert_eq!(store.draft(), &Service::default());
        assert!(store.errors().is_empty());
    }

    #[test]
    fn duplicate_name_keeps_draft_and_records_error() {
        let mut store = EntityStore::<Service>::default();
        store.set_draft(coap());
        store.commit_draft().unwrap();

        let mut again = coap();
        again.port = 5684;
        store.set_draft(again.clone());

        let err = store.commit_draft().unwrap_err();
        assert!(matches!(err, StoreError::Invalid(ref e) if e.contains_key("name")));
        assert_eq!(store.len(), 1);
        assert_eq!(store.draft(), &again);
        assert_eq!(store.field_error("name"), Some("Invalid value"));
    }

    #[test]
    fn draft_reusing_an_existing_id_cannot_duplicate_a_name() {
        let mut store = EntityStore::<Service>::default();
        store.insert(Service {
            id: "a".into(),
            ..coap()
        });

        store.set_draft(Service {
            id: "a".into(),
            ..coap()
        });
        assert!(matches!(store.commit_draft(), Err(StoreError::Invalid(_))));
        assert_eq!(store.len(), 1);

        let mut instances = EntityStore::<Instance>::default();
        instances.insert(Instance {
            id: 0,
            name: "Lab1".into(),
            ..Default::default()
        });
        instances.set_draft_field("name", json!("Lab1")).unwrap();
        assert!(instances.commit_draft().is_err());
        assert_eq!(instances.len(), 1);
    }

    #[test]
    fn next_commit_clears_previous_errors() {
        let mut store = EntityStore::<Profile>::default();
        store.set_draft(Profile {
            name: "Printer".into(),
            ..Default::default()
        });
        store.commit_draft().unwrap();

        store.set_draft_field("name", json!("Printer")).unwrap();
        assert!(store.commit_draft().is_err());

        store.set_draft_field("name", json!("Camera")).unwrap();
        store.commit_draft().unwrap();
        assert!(store.errors().is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn get_unknown_id_yields_default() {
        let store = EntityStore::<Instance>::default();
        assert_eq!(store.get(&42), Instance::default());
    }

    #[test]
    fn instance_ids_are_monotonic() {
        let mut store = EntityStore::<Instance>::default();
        for name in ["Lab1", "Lab2"] {
            store.set_draft_field("name", json!(name)).unwrap();
            store.commit_draft().unwrap();
        }
        let ids: Vec<u64> = store.list().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2]);

        store.remove(&1);
        store.set_draft_field("name", json!("Lab3")).unwrap();
        assert_eq!(store.commit_draft().unwrap().id, 3);
    }

    #[test]
    fn upsert_is_shallow_and_keeps_identity() {
        let mut store = EntityStore::<Service>::default();
        store.set_draft(coap());
        let created = store.commit_draft().unwrap();

        let patched = store
            .upsert(
                &created.id,
                &json!({"id": "other", "port": 6000, "network": {"value": "tcp", "label": "TCP"}}),
            )
            .unwrap()
            .unwrap();

        assert_eq!(patched.id, created.id);
        assert_eq!(patched.port, 6000);
        assert_eq!(patched.network.value(), "tcp");
        assert_eq!(patched.name, "CoAP");
    }

    #[test]
    fn upsert_replaces_nested_values_wholesale() {
        let mut store = EntityStore::<Profile>::default();
        store.insert(Profile {
            id: "p".into(),
            name: "Printer".into(),
            services: vec![coap(), coap()],
            ..Default::default()
        });

        let patched = store.upsert(&"p".to_string(), &json!({"services": []})).unwrap().unwrap();
        assert!(patched.services.is_empty());
        assert_eq!(store.upsert(&"missing".to_string(), &json!({})).unwrap(), None);
        assert!(matches!(
            store.upsert(&"p".to_string(), &json!([1, 2])),
            Err(StoreError::InvalidPatch)
        ));
    }

    #[test]
    fn update_rejects_rename_onto_existing_name() {
        let mut store = EntityStore::<Service>::default();
        store.insert(Service {
            id: "a".into(),
            name: "CoAP".into(),
            ..Default::default()
        });
        store.insert(Service {
            id: "b".into(),
            name: "MQTT".into(),
            ..Default::default()
        });

        assert!(matches!(
            store.update(&"b".to_string(), &json!({"name": "CoAP"})),
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(store.get(&"b".to_string()).name, "MQTT");
        assert!(matches!(
            store.update(&"zzz".to_string(), &json!({})),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn profile_membership_copies_services_by_value() {
        let mut stores = Stores::default();
        stores.services.insert(Service {
            id: "s1".into(),
            ..coap()
        });
        stores.profiles.insert(Profile {
            id: "p1".into(),
            name: "Printer".into(),
            ..Default::default()
        });

        let (_, changed) = stores.add_service_to_profile("p1", "s1").unwrap();
        assert!(changed);
        let (_, changed) = stores.add_service_to_profile("p1", "s1").unwrap();
        assert!(!changed);

        stores.services.upsert(&"s1".to_string(), &json!({"port": 9999})).unwrap();
        assert_eq!(stores.profiles.get(&"p1".to_string()).services[0].port, 5683);

        let (profile, changed) = stores.remove_service_from_profile("p1", "s1").unwrap();
        assert!(changed);
        assert!(profile.services.is_empty());
    }
}
