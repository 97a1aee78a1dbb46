//! Data plane of the heron proxy: the table/column catalog, per-peer
//! in-memory stores and the peer registry.

pub mod catalog;
pub mod peer;
pub mod store;

pub use catalog::{Catalog, Column, ColumnStorage, PeerLockMode, Table, TableName};
pub use peer::{Peer, PeerFlags, PeerMap, PeerStatus, PeerTransport};
pub use store::{DataRow, DataSet, DataStore, RowRef};
