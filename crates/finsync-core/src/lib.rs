//! Core library for finsync.
//!
//! finsync keeps a user's records consistent across a local on-device store,
//! a per-user remote document store, and a versioned cache of the
//! application's own static resources so it keeps working offline.
//!
//! The two central pieces are [`sync::SyncEngine`], which reconciles local and
//! remote copies of the dataset collection under intermittent connectivity,
//! and [`offline::ResourceCache`], which answers resource requests from cache
//! or network per a cache-first policy.

pub mod config;
pub mod events;
pub mod models;
pub mod offline;
pub mod remote;
pub mod session;
pub mod store;
pub mod sync;
