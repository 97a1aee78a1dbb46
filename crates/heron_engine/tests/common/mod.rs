#![allow(dead_code)]

pub use std::sync::Arc;

pub use heron_common::context::QueryContext;
pub use heron_common::value::Value;
pub use heron_data::catalog::{Catalog, TableName};
pub use heron_data::peer::{Peer, PeerMap, PeerTransport};
pub use heron_data::store::{DataSet, DataStore};
pub use heron_engine::Response;
pub use heron_query::filter::{Filter, MatchOp};
pub use heron_query::request::{OutputFormat, Request, SortDirection};
pub use heron_query::stats::{StatsKind, StatsSpec};

pub struct Fixture {
    pub catalog: Catalog,
    pub peers: PeerMap,
}

pub fn setup() -> Fixture {
    Fixture {
        catalog: Catalog::default(),
        peers: PeerMap::new(),
    }
}

pub fn host_row(name: &str, state: i64) -> Vec<Value> {
    vec![
        Value::Str(name.to_string()),
        Value::Str(format!("alias {}", name)),
        Value::Str("127.0.0.1".to_string()),
        Value::Int(state),
        Value::Float(0.0),
        Value::StringList(vec!["alice".to_string()]),
        Value::StringList(vec![]),
    ]
}

pub fn service_row(host: &str, description: &str, state: i64, latency: f64) -> Vec<Value> {
    vec![
        Value::Str(host.to_string()),
        Value::Str(description.to_string()),
        Value::Int(state),
        Value::Float(latency),
        Value::StringList(vec!["alice".to_string()]),
        Value::StringList(vec![]),
    ]
}

impl Fixture {
    /// Register a peer holding the given hosts rows.
    pub fn add_hosts_peer(&self, id: &str, rows: &[(&str, i64)]) -> Arc<Peer> {
        let peer = Peer::new(id, id, "");
        let table = self.catalog.table(TableName::Hosts).unwrap();
        let mut store = DataStore::new(table, id, id, peer.row_lock());
        for (name, state) in rows {
            store.insert(host_row(name, *state));
        }
        let ds = DataSet::new();
        ds.set_store(store);
        let peer = self.peers.insert(peer);
        peer.set_data_set(Arc::new(ds));
        peer
    }

    /// Register a peer holding the given services rows.
    pub fn add_services_peer(&self, id: &str, rows: &[(&str, &str, i64, f64)]) -> Arc<Peer> {
        let peer = Peer::new(id, id, "");
        let table = self.catalog.table(TableName::Services).unwrap();
        let mut store = DataStore::new(table, id, id, peer.row_lock());
        for (host, desc, state, latency) in rows {
            store.insert(service_row(host, desc, *state, *latency));
        }
        let ds = DataSet::new();
        ds.set_store(store);
        let peer = self.peers.insert(peer);
        peer.set_data_set(Arc::new(ds));
        peer
    }

    /// Register a peer that is down with the given error message.
    pub fn add_offline_peer(&self, id: &str, message: &str) -> Arc<Peer> {
        let peer = Peer::new(id, id, "");
        peer.set_online(false, message);
        self.peers.insert(peer)
    }

    pub fn request(&self, table: TableName, columns: &[&str]) -> Request {
        Request::new(&self.catalog, table, columns).unwrap()
    }

    pub fn column(&self, table: TableName, name: &str) -> Arc<heron_data::catalog::Column> {
        self.catalog.table(table).unwrap().column(name).unwrap()
    }

    pub fn eq_filter(&self, table: TableName, column: &str, value: Value) -> Filter {
        Filter::new_match(self.column(table, column), MatchOp::Equal, value).unwrap()
    }

    pub fn build(&self, request: Request) -> Response {
        Response::build(
            &QueryContext::background(),
            request,
            &self.peers,
            &self.catalog,
            None,
        )
        .expect("pipeline failed")
    }

    /// Build and serialize in one go, returning the full wire bytes.
    pub fn answer(&self, request: Request) -> (Response, Vec<u8>) {
        let response = self.build(request);
        let mut out = Vec::new();
        response.send(&mut out).expect("send failed");
        (response, out)
    }
}

/// Parse an unbuffered JSON body (strips the trailing newline).
pub fn parse_body(bytes: &[u8]) -> serde_json::Value {
    let text = std::str::from_utf8(bytes).expect("response is not utf-8");
    serde_json::from_str(text.trim_end_matches('\n')).expect("response is not valid json")
}
