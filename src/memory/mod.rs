pub(crate) mod bucket;
pub(crate) mod cleanup;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod fallback;
pub(crate) mod free_list;
pub(crate) mod free_range;
pub(crate) mod integration;
pub(crate) mod layout;
pub(crate) mod manager;
pub(crate) mod refill;
pub(crate) mod scratch;
pub(crate) mod segment;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod trace;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
