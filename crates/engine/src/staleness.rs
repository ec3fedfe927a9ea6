//! Staleness oracle
//!
//! An index is stale when, for any of its collections, the store holds a
//! document or tombstone newer than the matching watermark. The verdict is
//! computed from a single read transaction, so it agrees with the snapshot
//! the caller already holds and never waits on the writer.

use crate::extractor::SourceKind;
use crate::index::{Index, IndexStore};
use crate::metadata::read_watermark;
use quarry_core::{DocumentSource, Result};
use quarry_storage::{Environment, TreeReader};
use tracing::debug;

/// True if `index` has not yet processed everything visible in `tx`.
pub fn is_stale<T>(tx: &T, index: &Index) -> Result<bool>
where
    T: DocumentSource + TreeReader + ?Sized,
{
    for collection in index.collections() {
        let documents = read_watermark(tx, index.name(), SourceKind::Document, collection)?;
        if tx.last_document_etag(collection)? > documents {
            return Ok(true);
        }
        let tombstones = read_watermark(tx, index.name(), SourceKind::Tombstone, collection)?;
        if tx.last_tombstone_etag(collection)? > tombstones {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Number of stale indexes, all judged against one snapshot.
pub fn count_stale_indexes(env: &Environment, store: &IndexStore) -> Result<usize> {
    let tx = env.read_transaction();
    let mut stale = 0;
    for index in store.all() {
        if is_stale(&tx, &index)? {
            stale += 1;
        }
    }
    debug!(target: "quarry::indexing", stale, total = store.len(), "Counted stale indexes");
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexDefinition;
    use crate::metadata::Fields;
    use crate::worker::MapWorker;
    use quarry_core::{Collection, Document};
    use serde_json::json;

    fn definition(name: &str, collection: Collection) -> IndexDefinition {
        IndexDefinition::from_fn(name, vec![collection], |_: &Document| Ok(Some(Fields::new())))
            .unwrap()
    }

    fn put(env: &Environment, id: &str, collection: &str) {
        let mut tx = env.write_transaction();
        tx.put_document(id, collection, json!({})).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_empty_store_is_not_stale() {
        let env = Environment::in_memory();
        let index = Index::new(definition("i", Collection::All));
        assert!(!is_stale(&env.read_transaction(), &index).unwrap());
    }

    #[test]
    fn test_stale_until_drained() {
        let env = Environment::in_memory();
        put(&env, "users/1", "Users");
        let index = Index::new(definition("i", Collection::named("Users")));
        assert!(index.is_stale(&env.read_transaction()).unwrap());

        MapWorker::default().run_all(&env, &index).unwrap();
        assert!(!index.is_stale(&env.read_transaction()).unwrap());

        put(&env, "users/2", "Users");
        assert!(index.is_stale(&env.read_transaction()).unwrap());
    }

    #[test]
    fn test_other_collections_do_not_matter() {
        let env = Environment::in_memory();
        let index = Index::new(definition("i", Collection::named("Users")));
        put(&env, "orders/1", "Orders");
        assert!(!index.is_stale(&env.read_transaction()).unwrap());
    }

    #[test]
    fn test_delete_makes_stale() {
        let env = Environment::in_memory();
        put(&env, "users/1", "Users");
        let index = Index::new(definition("i", Collection::All));
        MapWorker::default().run_all(&env, &index).unwrap();

        let mut tx = env.write_transaction();
        tx.delete_document("users/1").unwrap();
        tx.commit().unwrap();
        assert!(index.is_stale(&env.read_transaction()).unwrap());

        MapWorker::default().run_all(&env, &index).unwrap();
        assert!(!index.is_stale(&env.read_transaction()).unwrap());
    }

    #[test]
    fn test_verdict_uses_callers_snapshot() {
        let env = Environment::in_memory();
        put(&env, "users/1", "Users");
        let index = Index::new(definition("i", Collection::All));
        let before = env.read_transaction();
        MapWorker::default().run_all(&env, &index).unwrap();
        assert!(is_stale(&before, &index).unwrap());
        assert!(!is_stale(&env.read_transaction(), &index).unwrap());
    }

    #[test]
    fn test_count_stale_indexes() {
        let env = Environment::in_memory();
        let store = IndexStore::new();
        let users = store
            .register(definition("users", Collection::named("Users")))
            .unwrap();
        store
            .register(definition("orders", Collection::named("Orders")))
            .unwrap();
        put(&env, "users/1", "Users");
        put(&env, "orders/1", "Orders");
        assert_eq!(count_stale_indexes(&env, &store).unwrap(), 2);

        MapWorker::default().run_all(&env, &users).unwrap();
        assert_eq!(count_stale_indexes(&env, &store).unwrap(), 1);
    }
}
