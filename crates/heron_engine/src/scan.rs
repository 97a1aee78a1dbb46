//! Per-peer local scans and the fan-out merger.
//!
//! Every selected non-virtual peer is scanned on its own thread inside
//! a `std::thread::scope`; virtual tables run on the calling thread so
//! their generator order survives. A single collector drains a bounded
//! channel of per-peer sub-results.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use heron_common::context::QueryContext;
use heron_common::ROW_CONTEXT_CHECK;
use heron_data::catalog::PeerLockMode;
use heron_data::peer::Peer;
use heron_data::store::{DataStore, RowRef};
use heron_query::filter::pk_equality_probe;
use heron_query::request::{OutputFormat, Request, SortField};
use heron_query::stats::{count_stats, create_stats_copy, ResultSetStats};

use std::sync::Arc;

use crate::response::{cmp_sort_key, Response};

/// Sub-result from one peer before merging.
#[derive(Debug, Default)]
pub struct PeerResponse {
    /// Matching row handles, in store order.
    pub rows: Vec<RowRef>,
    /// Rows that matched all filters, ignoring any limit.
    pub total: usize,
    /// Rows visited to produce the result.
    pub rows_scanned: usize,
}

/// Merger state for the data path: the concatenation of all per-peer
/// sub-results plus the sort spec restoring deterministic order.
#[derive(Default)]
pub struct RawResultSet {
    pub data: Vec<RowRef>,
    pub total: usize,
    pub rows_scanned: usize,
    pub sort: Vec<SortField>,
}

impl RawResultSet {
    /// Sort, offset and limit the merged row handles. Sorting is
    /// skipped on the single-peer default-order fast path; this is
    /// observable through scan order and part of the contract.
    pub fn post_processing(&mut self, req: &Request, multi_peer: bool) {
        if !self.sort.is_empty() && (multi_peer || !req.is_default_sort_order()) {
            let start = std::time::Instant::now();
            let sort = std::mem::take(&mut self.sort);
            self.data.sort_by(|a, b| cmp_raw_rows(req, &sort, a, b));
            self.sort = sort;
            tracing::debug!(elapsed = ?start.elapsed(), rows = self.data.len(), "sorted result");
        }

        if req.offset > 0 {
            if req.offset > self.total {
                self.data.clear();
            } else {
                let cut = req.offset.min(self.data.len());
                self.data.drain(..cut);
            }
        }

        if let Some(limit) = req.limit {
            if limit < self.data.len() {
                self.data.truncate(limit);
            }
        }
    }
}

fn cmp_raw_rows(req: &Request, sort: &[SortField], a: &RowRef, b: &RowRef) -> std::cmp::Ordering {
    for field in sort {
        let col = match field
            .column
            .clone()
            .or_else(|| req.request_columns.get(field.index).cloned())
        {
            Some(c) => c,
            None => continue,
        };
        let ord = cmp_sort_key(col.kind, field, &a.value(&col), &b.value(&col));
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

/// Fan the scan out across the selected peers and merge the
/// sub-results. Returns the merged raw rows for data queries; stats
/// queries merge directly into the response under its lock and return
/// `None`.
pub(crate) fn build_local_response(
    ctx: &QueryContext,
    res: &Response,
    stores: &[(Arc<Peer>, Arc<DataStore>)],
) -> Option<(Vec<RowRef>, usize, usize)> {
    let req = &res.request;

    if !req.stats.is_empty() {
        thread::scope(|s| {
            let mut handles = Vec::new();
            for (peer, store) in stores {
                peer.touch_last_query();
                if store.table.is_virtual {
                    // virtual tables scan serially to keep generator order
                    if let Some(stats) = gather_stats_result(ctx, req, store) {
                        res.merge_stats(stats);
                    }
                    continue;
                }
                let handle = s.spawn(move || {
                    if let Some(stats) = gather_stats_result(ctx, req, store) {
                        res.merge_stats(stats);
                    }
                });
                handles.push((peer.clone(), handle));
            }
            for (peer, handle) in handles {
                if handle.join().is_err() {
                    tracing::error!(peer = %peer.id, "stats scan thread panicked");
                    res.add_failed(&peer.id, "internal error: scan thread panicked");
                }
            }
        });
        return None;
    }

    // Collector drains a bounded channel; capacity covers every peer so
    // producers never block on a slow consumer.
    let (tx, rx) = mpsc::sync_channel::<PeerResponse>(stores.len().max(1));
    let (done_tx, done_rx) = mpsc::channel::<(Vec<RowRef>, usize, usize)>();
    let collector = thread::spawn(move || {
        let mut rows: Vec<RowRef> = Vec::new();
        let mut total = 0;
        let mut rows_scanned = 0;
        for sub in rx {
            total += sub.total;
            rows_scanned += sub.rows_scanned;
            rows.extend(sub.rows);
        }
        let _ = done_tx.send((rows, total, rows_scanned));
    });

    thread::scope(|s| {
        let mut handles = Vec::new();
        for (peer, store) in stores {
            peer.touch_last_query();

            if store.table.is_virtual {
                if let Some(sub) = gather_result_rows(ctx, req, store) {
                    let _ = tx.send(sub);
                }
                continue;
            }

            let tx = tx.clone();
            let handle = s.spawn(move || {
                if let Some(sub) = gather_result_rows(ctx, req, store) {
                    let _ = tx.send(sub);
                }
            });
            handles.push((peer.clone(), handle));
        }
        for (peer, handle) in handles {
            if handle.join().is_err() {
                tracing::error!(peer = %peer.id, "scan thread panicked");
                res.add_failed(&peer.id, "internal error: scan thread panicked");
            }
        }
    });
    drop(tx);

    // All producers are done; wait for the collector or the context,
    // whichever first.
    let merged = match ctx.remaining() {
        Some(rem) => done_rx.recv_timeout(rem.max(Duration::from_millis(1))).ok(),
        None => done_rx.recv().ok(),
    };
    drop(collector);
    merged
}

/// Scan one store for matching rows.
fn gather_result_rows(
    ctx: &QueryContext,
    req: &Request,
    store: &Arc<DataStore>,
) -> Option<PeerResponse> {
    if store.is_empty() {
        return None;
    }
    tracing::trace!(peer = %store.peer_id, table = %store.table.name, "scanning");

    // for some tables it is faster to lock the peer once per scan
    let _scan_guard = (store.peer_lock_mode == PeerLockMode::Full)
        .then(|| store.row_lock.read());

    let limit = req.optimize_result_limit();
    // wrapped json needs an exact total_count, so counting continues
    // past the limit there
    let break_on_limit = req.output_format != OutputFormat::WrappedJson;
    let probe = pk_equality_probe(&req.filter, &store.table);

    let mut result = PeerResponse::default();
    for (i, row) in store.prefiltered(probe.as_deref()).into_iter().enumerate() {
        if i % ROW_CONTEXT_CHECK == 0 && ctx.is_done() {
            // canceled scans contribute nothing
            return None;
        }

        result.rows_scanned += 1;

        let row = RowRef {
            store: store.clone(),
            row,
        };
        if !req.filter.iter().all(|f| f.matches_row(&row)) {
            continue;
        }
        if !row.check_auth(req.auth_user.as_deref()) {
            continue;
        }

        result.total += 1;

        if let Some(limit) = limit {
            if result.total > limit {
                if break_on_limit {
                    return Some(result);
                }
                continue;
            }
        }
        result.rows.push(row);
    }
    Some(result)
}

/// Scan one store accumulating stats groups instead of rows.
fn gather_stats_result(
    ctx: &QueryContext,
    req: &Request,
    store: &Arc<DataStore>,
) -> Option<ResultSetStats> {
    if store.is_empty() {
        return None;
    }

    let _scan_guard = (store.peer_lock_mode == PeerLockMode::Full)
        .then(|| store.row_lock.read());

    let group_columns = req.stats_columns();
    let count_specs = req.stats_grouped.as_deref().unwrap_or(&req.stats);
    let probe = pk_equality_probe(&req.filter, &store.table);

    let mut result = ResultSetStats::new();
    for (i, row) in store.prefiltered(probe.as_deref()).into_iter().enumerate() {
        if i % ROW_CONTEXT_CHECK == 0 && ctx.is_done() {
            return None;
        }

        result.rows_scanned += 1;

        let row = RowRef {
            store: store.clone(),
            row,
        };
        if !req.filter.iter().all(|f| f.matches_row(&row)) {
            continue;
        }
        if !row.check_auth(req.auth_user.as_deref()) {
            continue;
        }

        result.total += 1;

        let key = row.stats_key(group_columns);
        let accumulators = result
            .stats
            .entry(key)
            .or_insert_with(|| create_stats_copy(&req.stats));
        count_stats(count_specs, &row, accumulators);
    }
    Some(result)
}
