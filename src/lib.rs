//! Keeps a provider's trip tickets in sync with the Ride Clearinghouse.
//!
//! The reconciliation core is four pure engines ([`diff`], [`mapping`],
//! [`normalize`] and [`identity`]) driven by [`sync::SyncCycle`]. Everything
//! the cycle talks to sits behind a trait: [`remote::RemoteClient`],
//! [`processors::Importer`], [`processors::Exporter`] and
//! [`notify::Notifier`]. The local store is SQLite ([`db::LocalStore`]).

pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod identity;
pub mod mapping;
pub mod models;
pub mod normalize;
pub mod notify;
pub mod pattern;
pub mod processors;
pub mod remote;
pub mod sync;
pub mod value;
