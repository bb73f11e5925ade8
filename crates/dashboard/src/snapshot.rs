//! Whole-state capture and restore.
//!
//! A snapshot holds the services, profiles and instances (ids included) and
//! nothing else; proxies are always fetched live from the instances. Restores
//! replace the collections outright, they never merge.

use std::path::Path;

use common::{Snapshot, SNAPSHOT_FILE, STORAGE_KEY};
use rusqlite::Connection;
use rust_embed::RustEmbed;
use tracing::info;

use crate::db;
use crate::error::Result;
use crate::store::Stores;

#[derive(RustEmbed)]
#[folder = "seed/"]
struct SeedAssets;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSource {
    Empty,
    Seed,
    Persisted,
}

pub fn capture(stores: &Stores) -> Snapshot {
    Snapshot {
        services: stores.services.list().to_vec(),
        profiles: stores.profiles.list().to_vec(),
        instances: stores.instances.list().to_vec(),
    }
}

pub fn restore(stores: &mut Stores, snapshot: Snapshot) {
    stores.services.replace_all(snapshot.services);
    stores.profiles.replace_all(snapshot.profiles);
    stores.instances.replace_all(snapshot.instances);
}

/// Parse a snapshot document. Collections missing from the document read as
/// empty.
pub fn parse(raw: &str) -> Result<Snapshot> {
    Ok(serde_json::from_str(raw)?)
}

/// Write the snapshot under the durable storage key.
pub fn persist(conn: &Connection, snapshot: &Snapshot) -> Result<()> {
    let raw = serde_json::to_string(snapshot)?;
    db::put_value(conn, STORAGE_KEY, &raw)?;
    Ok(())
}

pub fn load_persisted(conn: &Connection) -> Result<Option<Snapshot>> {
    match db::get_value(conn, STORAGE_KEY)? {
        Some(raw) => Ok(Some(parse(&raw)?)),
        None => Ok(None),
    }
}

/// Capture the stores and mirror the result to durable storage.
pub fn export_snapshot(stores: &Stores, conn: &Connection) -> Result<Snapshot> {
    let snapshot = capture(stores);
    persist(conn, &snapshot)?;
    Ok(snapshot)
}

/// Replace the stores with the content of `document`.
pub fn import_snapshot(stores: &mut Stores, document: &str) -> Result<Snapshot> {
    let snapshot = parse(document)?;
    restore(stores, snapshot.clone());
    Ok(snapshot)
}

/// The seed document compiled into the binary, if any.
pub fn bundled_seed() -> Result<Option<Snapshot>> {
    match SeedAssets::get(SNAPSHOT_FILE) {
        Some(file) => Ok(Some(serde_json::from_slice(&file.data)?)),
        None => Ok(None),
    }
}

/// Seed from `path` when given, from the bundled document otherwise.
pub fn read_seed(path: Option<&Path>) -> Result<Option<Snapshot>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(Some(parse(&raw)?))
        }
        None => bundled_seed(),
    }
}

/// Startup restore: the seed first, then whatever was persisted on a previous
/// run on top of it.
pub fn bootstrap(
    stores: &mut Stores,
    seed_path: Option<&Path>,
    conn: &Connection,
) -> Result<BootSource> {
    let mut source = BootSource::Empty;

    if let Some(seed) = read_seed(seed_path)? {
        info!(
            "Seeded {} service(s), {} profile(s), {} instance(s)",
            seed.services.len(),
            seed.profiles.len(),
            seed.instances.len()
        );
        restore(stores, seed);
        source = BootSource::Seed;
    }

    if let Some(persisted) = load_persisted(conn)? {
        info!("Restored state from durable storage");
        restore(stores, persisted);
        source = BootSource::Persisted;
    }

    Ok(source)
}

/// Content type and pretty-printed body for a snapshot download.
pub fn download(snapshot: &Snapshot) -> Result<(String, Vec<u8>)> {
    let content_type = mime_guess::from_path(SNAPSHOT_FILE)
        .first_or_octet_stream()
        .to_string();
    let body = serde_json::to_vec_pretty(snapshot)?;
    Ok((content_type, body))
}
