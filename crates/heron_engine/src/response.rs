//! The response frame and the pipeline entry: peer selection, spin-up,
//! wait triggers, store locking, scan dispatch, post-processing and
//! stats finalization.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard};

/// Owned read guard on a peer's data set, held from store-lock entry
/// until writer entry.
type StoreGuard = ArcRwLockReadGuard<RawRwLock, ()>;

use heron_common::context::QueryContext;
use heron_common::error::{HeronError, QueryError};
use heron_common::value::{cmp_values, ColumnKind, Value};
use heron_common::{LIST_SEP_CHAR, SPIN_UP_PEERS_TIMEOUT};
use heron_data::catalog::Catalog;
use heron_data::peer::{Peer, PeerFlags, PeerMap};
use heron_data::store::DataStore;
use heron_query::request::{OutputFormat, Request, SortField};
use heron_query::stats::{create_stats_copy, ResultSetStats};

use crate::passthrough::build_passthrough_result;
use crate::scan::{build_local_response, RawResultSet};

/// Cluster ownership oracle. Absent means every backend is local.
pub trait NodeAccessor: Send + Sync {
    fn is_our_backend(&self, peer_id: &str) -> bool;
}

/// Response fields mutated concurrently by scan and passthrough
/// threads, guarded by the response writer lock.
pub(crate) struct ResponseState {
    /// Materialized result rows (stats, passthrough and empty paths).
    pub result: Vec<Vec<Value>>,
    /// Per-peer failure messages; presence excludes the peer's rows.
    pub failed: BTreeMap<String, String>,
    /// Merged stats groups (stats path only).
    pub stats: Option<ResultSetStats>,
}

/// Per-request aggregation frame, shared across scan threads for the
/// lifetime of the query.
pub struct Response {
    pub request: Arc<Request>,
    pub code: u16,
    pub error: Option<QueryError>,
    pub selected_peers: Vec<Arc<Peer>>,
    pub result_total: usize,
    pub rows_scanned: usize,
    pub(crate) raw_results: Option<RawResultSet>,
    pub(crate) state: RwLock<ResponseState>,
    /// Passthrough queries may append sort columns beyond the requested
    /// set; the adjusted spec lives here so the request stays frozen.
    pub(crate) sort_override: Option<Vec<SortField>>,
    /// Row width to truncate to after sorting (passthrough extras).
    pub(crate) visible_columns: Option<usize>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("code", &self.code)
            .field("error", &self.error)
            .field("result_total", &self.result_total)
            .field("rows_scanned", &self.rows_scanned)
            .finish_non_exhaustive()
    }
}

impl Response {
    /// Run the full pipeline for one request. The returned response
    /// carries either the result or, when all requested backends
    /// failed in plain JSON mode, code 502 plus the error body.
    pub fn build(
        ctx: &QueryContext,
        mut request: Request,
        peers: &PeerMap,
        catalog: &Catalog,
        node: Option<&dyn NodeAccessor>,
    ) -> Result<Response, HeronError> {
        let started = Instant::now();
        request.expand_requested_backends(peers);

        let request = Arc::new(request);
        let mut res = Response {
            request: request.clone(),
            code: 200,
            error: None,
            selected_peers: Vec::new(),
            result_total: 0,
            rows_scanned: 0,
            raw_results: None,
            state: RwLock::new(ResponseState {
                result: Vec::new(),
                failed: request.backend_errors.clone().into_iter().collect(),
                stats: None,
            }),
            sort_override: None,
            visible_columns: None,
        };

        res.prepare_response(ctx, peers, node);

        let table = request.table_def.clone();
        // result rows hold Arc'd snapshots, so the guards only need to
        // span selection through post-processing
        let mut guards: Vec<StoreGuard> = Vec::new();

        if res.selected_peers.is_empty() {
            // no backends selected: empty result, never an error
        } else if table.passthrough_only {
            let (sort, visible) = build_passthrough_result(ctx, &res);
            res.sort_override = sort;
            res.visible_columns = visible;
            res.post_processing();
        } else {
            if let Some(trigger) = request.wait_trigger.clone() {
                for p in res.selected_peers.clone() {
                    p.wait_condition(ctx, &trigger);
                    // the peer might have gone down while waiting
                    if let Err(err) = p.get_data_store(catalog, request.table) {
                        res.add_failed(&p.id, err.to_string());
                    }
                }
            }

            let mut stores: Vec<(Arc<Peer>, Arc<DataStore>)> = Vec::new();
            for p in res.selected_peers.clone() {
                match p.get_data_store(catalog, request.table) {
                    Ok(store) => {
                        if !table.works_unlocked {
                            if let Some(ds) = p.data_set() {
                                guards.push(ds.lock.read_arc());
                            }
                        }
                        stores.push((p, store));
                    }
                    Err(err) => res.add_failed(&p.id, err.to_string()),
                }
            }

            let merged = build_local_response(ctx, &res, &stores);
            if request.stats.is_empty() {
                let mut raw = RawResultSet {
                    sort: request.sort.clone(),
                    ..Default::default()
                };
                if let Some((rows, total, rows_scanned)) = merged {
                    raw.data = rows;
                    raw.total = total;
                    raw.rows_scanned = rows_scanned;
                }
                raw.post_processing(&request, res.selected_peers.len() > 1);
                res.result_total = raw.total;
                res.rows_scanned = raw.rows_scanned;
                res.raw_results = Some(raw);
            }
        }

        res.calculate_final_stats();
        res.finalize_failure();
        drop(guards);

        let elapsed_us = started.elapsed().as_micros() as u64;
        if ctx.is_done() {
            heron_observability::record_query_metrics(elapsed_us, request.table.as_str(), false);
            return Err(QueryError::Canceled.into());
        }
        heron_observability::record_query_metrics(elapsed_us, request.table.as_str(), true);

        tracing::debug!(
            table = %request.table,
            peers = res.selected_peers.len(),
            total = res.result_total,
            elapsed = ?started.elapsed(),
            "request processed"
        );
        Ok(res)
    }

    /// Select the peers answering this request and trigger spin-up for
    /// idle ones. Iterates the peer map in insertion order so the
    /// output order matches catalog order.
    fn prepare_response(
        &mut self,
        ctx: &QueryContext,
        peers: &PeerMap,
        node: Option<&dyn NodeAccessor>,
    ) {
        let request = self.request.clone();
        let mut spin_up: Vec<Arc<Peer>> = Vec::new();

        for p in peers.ordered() {
            if !request.backends_map.contains(&p.id) {
                continue;
            }
            if let Some(node) = node {
                if !node.is_our_backend(&p.id) {
                    continue;
                }
            }
            if p.has_flag(PeerFlags::MULTI_BACKEND) {
                continue;
            }

            if p.is_idling() && !request.table_def.is_virtual {
                p.touch_last_query();
                spin_up.push(p.clone());
            }
            self.selected_peers.push(p);
        }

        // metadata is uniform across peers, ask only the first one
        if request.table.is_meta() {
            self.selected_peers = peers.first().into_iter().collect();
        }

        if !request.table_def.passthrough_only && !spin_up.is_empty() {
            spin_up_peers(ctx, &spin_up);
        }
    }

    /// Record a per-peer failure. Failed peers contribute no rows.
    pub(crate) fn add_failed(&self, peer_id: &str, message: impl Into<String>) {
        let mut state = self.state.write();
        state.failed.insert(peer_id.to_string(), message.into());
    }

    /// Fold one peer's stats sub-result into the shared state.
    pub(crate) fn merge_stats(&self, stats: ResultSetStats) {
        let mut state = self.state.write();
        state
            .stats
            .get_or_insert_with(ResultSetStats::new)
            .merge(stats);
    }

    /// Append decoded passthrough rows under the writer lock.
    pub(crate) fn append_result_rows(&self, rows: Vec<Vec<Value>>) {
        let mut state = self.state.write();
        state.result.extend(rows);
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, ResponseState> {
        self.state.read()
    }

    /// Sort, offset and limit the materialized result (passthrough and
    /// empty paths; the data path post-processes its raw rows instead).
    fn post_processing(&mut self) {
        let request = self.request.clone();
        if !request.stats.is_empty() {
            return;
        }
        let mut state = self.state.write();

        let sort = self
            .sort_override
            .as_deref()
            .unwrap_or(&request.sort)
            .to_vec();
        if !sort.is_empty()
            && (self.selected_peers.len() > 1 || !request.is_default_sort_order())
        {
            let start = Instant::now();
            state
                .result
                .sort_by(|a, b| cmp_result_rows(&request, &sort, a, b));
            tracing::debug!(elapsed = ?start.elapsed(), "sorting result done");
        }

        if self.result_total == 0 {
            self.result_total = state.result.len();
        }

        if request.offset > 0 {
            if request.offset > self.result_total {
                state.result.clear();
            } else {
                let cut = request.offset.min(state.result.len());
                state.result.drain(..cut);
            }
        }

        if let Some(limit) = request.limit {
            if limit < state.result.len() {
                state.result.truncate(limit);
            }
        }

        // drop sort-only helper columns appended by passthrough
        if let Some(width) = self.visible_columns {
            for row in state.result.iter_mut() {
                row.truncate(width);
            }
        }
    }

    /// Materialize stats groups into result rows: leading group-key
    /// columns, then one finalized value (or raw [value, count] pair)
    /// per stats expression.
    fn calculate_final_stats(&mut self) {
        let request = self.request.clone();
        if request.stats.is_empty() || request.table_def.passthrough_only {
            return;
        }
        let mut state = self.state.write();
        let mut stats_result = state.stats.take().unwrap_or_default();

        let group_columns = request.stats_columns().len();
        if group_columns == 0 && stats_result.stats.is_empty() {
            // no rows matched anywhere: one synthetic all-zero group
            stats_result
                .stats
                .insert(String::new(), create_stats_copy(&request.stats));
        }

        let mut result: Vec<Vec<Value>> = Vec::with_capacity(stats_result.stats.len());
        for (key, accumulators) in &stats_result.stats {
            let mut row: Vec<Value> = Vec::with_capacity(group_columns + accumulators.len());
            if group_columns > 0 {
                let mut parts = key.split(LIST_SEP_CHAR);
                for _ in 0..group_columns {
                    row.push(Value::Str(parts.next().unwrap_or("").to_string()));
                }
            }
            for acc in accumulators {
                if request.send_stats_data {
                    row.push(Value::Json(serde_json::json!([acc.value, acc.count])));
                } else {
                    row.push(Value::Float(acc.finalize()));
                }
            }
            result.push(row);
        }
        self.rows_scanned += stats_result.rows_scanned;

        if group_columns > 0 {
            let sort: Vec<SortField> = (0..group_columns).map(SortField::group_key).collect();
            result.sort_by(|a, b| cmp_result_rows(&request, &sort, a, b));
        }

        self.result_total += result.len();
        state.result = result;
        state.stats = Some(stats_result);
    }

    /// When every requested backend failed and the format is plain
    /// JSON, the response collapses to 502 with the first requested
    /// backend's message as body. Wrapped JSON instead reports failures
    /// in its envelope and stays 200.
    fn finalize_failure(&mut self) {
        if self.request.output_format == OutputFormat::WrappedJson {
            return;
        }
        let state = self.state.read();
        if state.failed.is_empty() {
            return;
        }
        let requested: Vec<String> = if !self.request.backends.is_empty() {
            self.request.backends.clone()
        } else if !self.selected_peers.is_empty() {
            self.selected_peers.iter().map(|p| p.id.clone()).collect()
        } else {
            state.failed.keys().cloned().collect()
        };
        if !requested.is_empty() && requested.iter().all(|id| state.failed.contains_key(id)) {
            let message = state.failed.get(&requested[0]).cloned().unwrap_or_default();
            drop(state);
            self.code = 502;
            self.error = Some(QueryError::AllBackendsFailed(message));
        }
    }

    /// Snapshot of the failed map for inspection.
    pub fn failed(&self) -> BTreeMap<String, String> {
        self.state.read().failed.clone()
    }

    /// Materialize the final result rows. The data path resolves its
    /// raw row handles against the requested columns; other paths
    /// already hold materialized rows.
    pub fn materialized_result(&self) -> Vec<Vec<Value>> {
        if let Some(raw) = &self.raw_results {
            return raw
                .data
                .iter()
                .map(|row| {
                    self.request
                        .request_columns
                        .iter()
                        .map(|col| row.value(col))
                        .collect()
                })
                .collect();
        }
        self.state.read().result.clone()
    }
}

/// Trigger an immediate parallel resume for all supplied idle peers and
/// wait for completion, bounded by the spin-up deadline. Failures land
/// in the peer's own error state, never in the request.
pub fn spin_up_peers(ctx: &QueryContext, peers: &[Arc<Peer>]) {
    let (tx, rx) = mpsc::channel::<()>();
    for p in peers {
        let p = p.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            if let Err(err) = p.resume_from_idle() {
                tracing::warn!(peer = %p.id, error = %err, "spin-up failed");
                p.set_online(false, err.to_string());
            }
            let _ = tx.send(());
        });
    }
    drop(tx);

    let deadline = Instant::now() + SPIN_UP_PEERS_TIMEOUT;
    let mut done = 0;
    while done < peers.len() && !ctx.is_done() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let step = (deadline - now).min(Duration::from_millis(100));
        match rx.recv_timeout(step) {
            Ok(()) => done += 1,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!(peers = peers.len(), resumed = done, "spin up completed");
}

/// Compare one sort key pair under a column kind. Group keys compare as
/// strings; list kinds have no defined order and compare equal so the
/// stable sort keeps arrival order.
pub(crate) fn cmp_sort_key(
    kind: ColumnKind,
    field: &SortField,
    a: &Value,
    b: &Value,
) -> Ordering {
    let ord = if field.group {
        a.to_text().cmp(&b.to_text())
    } else if kind.is_list() {
        tracing::debug!(kind = %kind, "sort on unordered list column, keeping input order");
        Ordering::Equal
    } else {
        cmp_values(kind, a, b)
    };
    match field.direction {
        heron_query::request::SortDirection::Asc => ord,
        heron_query::request::SortDirection::Desc => ord.reverse(),
    }
}

/// Row comparator over materialized rows. Group sort fields read the
/// key at index 0; everything else dispatches on the column's declared
/// kind.
pub(crate) fn cmp_result_rows(
    req: &Request,
    sort: &[SortField],
    a: &[Value],
    b: &[Value],
) -> Ordering {
    for field in sort {
        let (index, kind) = if field.group {
            (0, ColumnKind::String)
        } else {
            let kind = field
                .column
                .as_ref()
                .map(|c| c.kind)
                .or_else(|| req.request_columns.get(field.index).map(|c| c.kind))
                .unwrap_or(ColumnKind::String);
            (field.index, kind)
        };
        let (va, vb) = match (a.get(index), b.get(index)) {
            (Some(va), Some(vb)) => (va, vb),
            _ => continue,
        };
        let ord = cmp_sort_key(kind, field, va, vb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_data::catalog::TableName;
    use heron_query::request::SortDirection;

    fn req(columns: &[&str]) -> Request {
        Request::new(&Catalog::default(), TableName::Hosts, columns).unwrap()
    }

    #[test]
    fn test_cmp_result_rows_numeric_then_string() {
        let request = req(&["name", "state"]);
        let sort = vec![
            SortField::new(1, SortDirection::Asc),
            SortField::new(0, SortDirection::Desc),
        ];
        let a = vec![Value::Str("a".into()), Value::Int(0)];
        let b = vec![Value::Str("b".into()), Value::Int(0)];
        let c = vec![Value::Str("a".into()), Value::Int(1)];
        assert_eq!(cmp_result_rows(&request, &sort, &a, &c), Ordering::Less);
        // equal state, name descending
        assert_eq!(cmp_result_rows(&request, &sort, &a, &b), Ordering::Greater);
        assert_eq!(cmp_result_rows(&request, &sort, &a, &a), Ordering::Equal);
    }

    #[test]
    fn test_cmp_group_fields_read_index_zero() {
        let request = req(&["name"]);
        let sort = vec![SortField::group_key(3)];
        let a = vec![Value::Str("x".into())];
        let b = vec![Value::Str("y".into())];
        assert_eq!(cmp_result_rows(&request, &sort, &a, &b), Ordering::Less);
    }

    #[test]
    fn test_list_sort_keeps_order() {
        let request = req(&["contacts"]);
        let sort = vec![SortField::new(0, SortDirection::Asc)];
        let a = vec![Value::StringList(vec!["z".into()])];
        let b = vec![Value::StringList(vec!["a".into()])];
        assert_eq!(cmp_result_rows(&request, &sort, &a, &b), Ordering::Equal);
    }

    #[test]
    fn test_spin_up_resumes_idle_peers() {
        let ctx = QueryContext::background();
        let p1 = Arc::new(Peer::new("p1", "p1", ""));
        let p2 = Arc::new(Peer::new("p2", "p2", ""));
        p1.set_idling(true);
        p2.set_idling(true);
        spin_up_peers(&ctx, &[p1.clone(), p2.clone()]);
        assert!(!p1.is_idling());
        assert!(!p2.is_idling());
    }
}
