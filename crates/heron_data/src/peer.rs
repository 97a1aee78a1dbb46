//! Peer registry: one `Peer` per federated monitoring backend, plus the
//! insertion-ordered `PeerMap` the selector iterates.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use heron_common::context::QueryContext;
use heron_common::error::PeerError;
use heron_common::value::Value;

use crate::catalog::{Catalog, Table, TableName};
use crate::store::{DataSet, DataStore};

/// Peer behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerFlags(u32);

impl PeerFlags {
    pub const NONE: PeerFlags = PeerFlags(0);
    /// The peer is itself a federating aggregator; querying it would
    /// duplicate rows already owned by its sub-peers.
    pub const MULTI_BACKEND: PeerFlags = PeerFlags(1);

    pub fn contains(&self, other: PeerFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PeerFlags {
    type Output = PeerFlags;

    fn bitor(self, rhs: PeerFlags) -> PeerFlags {
        PeerFlags(self.0 | rhs.0)
    }
}

/// Mutable peer state, guarded by the peer's status mutex.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub online: bool,
    pub idling: bool,
    pub last_error: String,
    pub last_query: i64,
    pub last_update: i64,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            online: true,
            idling: false,
            last_error: String::new(),
            last_query: 0,
            last_update: 0,
        }
    }
}

/// Connection seam towards the remote site. Production implementations
/// speak Livestatus over TCP/unix sockets; tests inject fakes.
pub trait PeerTransport: Send + Sync {
    /// Forward a rendered query and return the decoded JSON rows.
    fn query(&self, wire: &str) -> Result<Vec<Vec<serde_json::Value>>, PeerError>;

    /// Ask the cache layer for an immediate delta update.
    fn resume(&self) -> Result<(), PeerError>;
}

/// One upstream monitoring backend.
pub struct Peer {
    pub id: String,
    pub name: String,
    pub addr: String,
    flags: PeerFlags,
    status: Mutex<PeerStatus>,
    /// Wait-trigger bookkeeping: fired condition names plus a wakeup.
    triggers: Mutex<HashSet<String>>,
    trigger_cv: Condvar,
    /// Row lock for `PeerLockMode::Full` tables; shared into every store
    /// this peer owns.
    row_lock: Arc<RwLock<()>>,
    data: RwLock<Option<Arc<DataSet>>>,
    transport: Option<Box<dyn PeerTransport>>,
}

impl Peer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            addr: addr.into(),
            flags: PeerFlags::NONE,
            status: Mutex::new(PeerStatus::default()),
            triggers: Mutex::new(HashSet::new()),
            trigger_cv: Condvar::new(),
            row_lock: Arc::new(RwLock::new(())),
            data: RwLock::new(None),
            transport: None,
        }
    }

    pub fn with_flags(mut self, flags: PeerFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_transport(mut self, transport: Box<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn has_flag(&self, flag: PeerFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn row_lock(&self) -> Arc<RwLock<()>> {
        self.row_lock.clone()
    }

    // ── status accessors ────────────────────────────────────────────────

    pub fn status(&self) -> PeerStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_online(&self) -> bool {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).online
    }

    pub fn is_idling(&self) -> bool {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).idling
    }

    pub fn set_online(&self, online: bool, last_error: impl Into<String>) {
        let mut st = self.status.lock().unwrap_or_else(|e| e.into_inner());
        st.online = online;
        st.last_error = last_error.into();
    }

    pub fn set_idling(&self, idling: bool) {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).idling = idling;
    }

    pub fn last_error(&self) -> String {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_error
            .clone()
    }

    pub fn touch_last_query(&self) {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_query = unix_now();
    }

    // ── data plane ──────────────────────────────────────────────────────

    pub fn data_set(&self) -> Option<Arc<DataSet>> {
        self.data.read().clone()
    }

    pub fn set_data_set(&self, set: Arc<DataSet>) {
        *self.data.write() = Some(set);
    }

    /// Fetch the peer's store for a table. Virtual tables are
    /// synthesized on the fly from peer state and the catalog.
    pub fn get_data_store(
        &self,
        catalog: &Catalog,
        table: TableName,
    ) -> Result<Arc<DataStore>, PeerError> {
        let table_def = catalog
            .table(table)
            .ok_or_else(|| PeerError::TableNotLoaded {
                id: self.id.clone(),
                table: table.as_str().to_string(),
            })?;

        if table_def.is_virtual {
            return Ok(Arc::new(self.build_virtual_store(catalog, &table_def)));
        }

        if !self.is_online() {
            return Err(PeerError::Offline {
                id: self.id.clone(),
                reason: self.last_error(),
            });
        }
        self.data_set()
            .and_then(|ds| ds.store(table))
            .ok_or_else(|| PeerError::TableNotLoaded {
                id: self.id.clone(),
                table: table.as_str().to_string(),
            })
    }

    fn build_virtual_store(&self, catalog: &Catalog, table_def: &Arc<Table>) -> DataStore {
        let mut store = DataStore::new(
            table_def.clone(),
            self.id.clone(),
            self.name.clone(),
            self.row_lock.clone(),
        );
        match table_def.name {
            TableName::Sites => {
                let st = self.status();
                store.insert(vec![
                    Value::Str(self.name.clone()),
                    Value::Str(self.addr.clone()),
                    Value::Int(if st.online { 0 } else { 2 }),
                    Value::Str(st.last_error),
                    Value::Int(i64::from(st.idling)),
                ]);
            }
            TableName::Tables => {
                for t in catalog.tables_ordered() {
                    store.insert(vec![Value::Str(t.name.as_str().to_string())]);
                }
            }
            TableName::Columns => {
                for t in catalog.tables_ordered() {
                    for c in &t.columns {
                        store.insert(vec![
                            Value::Str(t.name.as_str().to_string()),
                            Value::Str(c.name.clone()),
                            Value::Str(c.kind.to_string()),
                        ]);
                    }
                }
            }
            _ => {}
        }
        store
    }

    // ── spin-up and wait triggers ───────────────────────────────────────

    /// Leave the idle state and ask the transport for a delta refresh.
    pub fn resume_from_idle(&self) -> Result<(), PeerError> {
        {
            let mut st = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if !st.idling {
                return Ok(());
            }
            st.idling = false;
        }
        tracing::debug!(peer = %self.id, "resuming peer from idle");
        if let Some(t) = &self.transport {
            t.resume()?;
        }
        let mut st = self.status.lock().unwrap_or_else(|e| e.into_inner());
        st.last_update = unix_now();
        Ok(())
    }

    /// Mark a named wait condition as met, waking blocked requests.
    pub fn fire_trigger(&self, name: &str) {
        self.triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
        self.trigger_cv.notify_all();
    }

    /// Block until the named condition fires or the context is done.
    pub fn wait_condition(&self, ctx: &QueryContext, trigger: &str) {
        let mut fired = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
        while !fired.contains(trigger) && !ctx.is_done() {
            let step = ctx
                .remaining()
                .unwrap_or(Duration::from_millis(50))
                .min(Duration::from_millis(50));
            let (guard, _res) = self
                .trigger_cv
                .wait_timeout(fired, step)
                .unwrap_or_else(|e| e.into_inner());
            fired = guard;
        }
    }

    // ── passthrough ─────────────────────────────────────────────────────

    /// Forward a rendered query to the remote site.
    pub fn remote_query(&self, wire: &str) -> Result<Vec<Vec<serde_json::Value>>, PeerError> {
        let transport = self.transport.as_ref().ok_or_else(|| {
            PeerError::Connection(format!("peer {} has no transport configured", self.id))
        })?;
        match transport.query(wire) {
            Ok(rows) => Ok(rows),
            Err(err) => {
                let mut st = self.status.lock().unwrap_or_else(|e| e.into_inner());
                st.last_error = err.to_string();
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Insertion-ordered peer registry. Catalog order is load-bearing:
/// selection, metadata-table pinning and the 502 message all follow it.
pub struct PeerMap {
    inner: RwLock<PeerMapInner>,
}

struct PeerMapInner {
    peers: HashMap<String, Arc<Peer>>,
    order: Vec<String>,
}

impl PeerMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PeerMapInner {
                peers: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub fn insert(&self, peer: Peer) -> Arc<Peer> {
        let peer = Arc::new(peer);
        let mut inner = self.inner.write();
        if !inner.peers.contains_key(&peer.id) {
            inner.order.push(peer.id.clone());
        }
        inner.peers.insert(peer.id.clone(), peer.clone());
        peer
    }

    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.inner.read().peers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().peers.contains_key(id)
    }

    /// All peers in insertion order.
    pub fn ordered(&self) -> Vec<Arc<Peer>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.peers.get(id).cloned())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    pub fn first(&self) -> Option<Arc<Peer>> {
        let inner = self.inner.read();
        inner.order.first().and_then(|id| inner.peers.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }
}

impl Default for PeerMap {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_map_keeps_insertion_order() {
        let map = PeerMap::new();
        map.insert(Peer::new("c", "c", ""));
        map.insert(Peer::new("a", "a", ""));
        map.insert(Peer::new("b", "b", ""));
        assert_eq!(map.ids(), vec!["c", "a", "b"]);
        assert_eq!(map.first().unwrap().id, "c");
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_flags() {
        let peer = Peer::new("x", "x", "").with_flags(PeerFlags::MULTI_BACKEND);
        assert!(peer.has_flag(PeerFlags::MULTI_BACKEND));
        assert!(!Peer::new("y", "y", "").has_flag(PeerFlags::MULTI_BACKEND));
    }

    #[test]
    fn test_offline_store_fetch_fails() {
        let catalog = Catalog::default();
        let peer = Peer::new("p1", "peer one", "");
        peer.set_online(false, "conn refused");
        let err = peer.get_data_store(&catalog, TableName::Hosts).unwrap_err();
        assert!(err.to_string().contains("conn refused"));
    }

    #[test]
    fn test_missing_store_reports_table() {
        let catalog = Catalog::default();
        let peer = Peer::new("p1", "peer one", "");
        let err = peer.get_data_store(&catalog, TableName::Hosts).unwrap_err();
        assert!(err.to_string().contains("hosts"));
    }

    #[test]
    fn test_virtual_sites_store() {
        let catalog = Catalog::default();
        let peer = Peer::new("p1", "peer one", "10.0.0.1:6557");
        let store = peer.get_data_store(&catalog, TableName::Sites).unwrap();
        assert_eq!(store.len(), 1);
        let name_col = store.table.column("name").unwrap();
        assert_eq!(
            store.value(&store.rows()[0], &name_col),
            Value::Str("peer one".into())
        );
    }

    #[test]
    fn test_virtual_columns_store_lists_catalog() {
        let catalog = Catalog::default();
        let peer = Peer::new("p1", "peer one", "");
        let store = peer.get_data_store(&catalog, TableName::Columns).unwrap();
        // one row per column over all tables
        let expected: usize = catalog.tables_ordered().map(|t| t.columns.len()).sum();
        assert_eq!(store.len(), expected);
    }

    #[test]
    fn test_resume_from_idle_clears_flag() {
        let peer = Peer::new("p1", "peer one", "");
        peer.set_idling(true);
        peer.resume_from_idle().unwrap();
        assert!(!peer.is_idling());
    }

    #[test]
    fn test_wait_condition_fires() {
        let peer = Arc::new(Peer::new("p1", "peer one", ""));
        let ctx = QueryContext::background();
        let p2 = peer.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            p2.fire_trigger("check");
        });
        peer.wait_condition(&ctx, "check");
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_condition_honors_context() {
        let peer = Peer::new("p1", "peer one", "");
        let ctx = QueryContext::with_timeout(Duration::from_millis(30));
        let start = std::time::Instant::now();
        peer.wait_condition(&ctx, "never");
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
