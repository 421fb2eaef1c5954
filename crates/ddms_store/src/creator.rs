//! Factories registered with the store cache.

use crate::context::StoreContext;
use crate::engine::{KvEngine, RelationalEngine};
use crate::kv_store::KvGeneralStore;
use crate::rdb_store::RdbGeneralStore;
use ddms_core::metadata::{StoreKind, StoreMetaData};
use ddms_core::store::{Creator, GeneralStore};
use ddms_core::AutoCache;
use std::sync::Arc;

/// Creator opening KV stores on `engine`.
pub fn kv_creator(engine: Arc<dyn KvEngine>, context: Arc<StoreContext>) -> Creator {
    Arc::new(move |meta: &StoreMetaData| {
        let store = KvGeneralStore::open(meta, engine.as_ref(), Arc::clone(&context))?;
        Ok(store as Arc<dyn GeneralStore>)
    })
}

/// Creator opening relational stores on `engine`.
pub fn rdb_creator(engine: Arc<dyn RelationalEngine>, context: Arc<StoreContext>) -> Creator {
    Arc::new(move |meta: &StoreMetaData| {
        let store = RdbGeneralStore::open(meta, engine.as_ref(), Arc::clone(&context))?;
        Ok(store as Arc<dyn GeneralStore>)
    })
}

/// Registers both engine families with `cache`.
pub fn register_creators(
    cache: &AutoCache,
    kv: Arc<dyn KvEngine>,
    relational: Arc<dyn RelationalEngine>,
    context: Arc<StoreContext>,
) {
    cache.register_creator(StoreKind::Kv, kv_creator(kv, Arc::clone(&context)));
    cache.register_creator(StoreKind::Relational, rdb_creator(relational, context));
}
