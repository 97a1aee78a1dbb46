//! Passthrough executor: forward the query to each remote site, decode
//! the JSON result and stitch locally-computed virtual columns into
//! their slots.

use std::sync::Arc;
use std::thread;

use serde_json::Value as JsonValue;

use heron_common::context::QueryContext;
use heron_common::value::Value;
use heron_data::catalog::{Column, ColumnStorage};
use heron_data::peer::Peer;
use heron_query::request::SortField;

use crate::response::Response;

/// Where each output cell of a passthrough row comes from.
enum Slot {
    /// Position in the remote result row, plus the column for decoding.
    Backend(usize, Arc<Column>),
    /// Computed locally from the peer context.
    Virtual(Arc<Column>),
}

/// Fan the sub-request out to all selected peers in parallel. Returns
/// the adjusted sort spec (sort columns outside the requested set get
/// appended slots) and the visible row width to truncate back to after
/// sorting.
pub(crate) fn build_passthrough_result(
    ctx: &QueryContext,
    res: &Response,
) -> (Option<Vec<SortField>>, Option<usize>) {
    let req = &res.request;

    // split the requested columns: backend columns travel in the
    // sub-request, virtual ones are stitched in locally
    let mut backend_columns: Vec<String> = Vec::new();
    let mut slots: Vec<Slot> = Vec::new();
    for col in &req.request_columns {
        match col.storage {
            ColumnStorage::Virtual => slots.push(Slot::Virtual(col.clone())),
            ColumnStorage::Backend => {
                slots.push(Slot::Backend(backend_columns.len(), col.clone()));
                backend_columns.push(col.name.clone());
            }
        }
    }

    // sort columns that are not part of the requested set still have to
    // come back from the remote site; give them trailing slots
    let mut sort = req.sort.clone();
    let mut appended = false;
    for field in sort.iter_mut() {
        if field.group {
            continue;
        }
        if let Some(col) = field.column.clone() {
            field.index = slots.len();
            appended = true;
            match col.storage {
                ColumnStorage::Virtual => slots.push(Slot::Virtual(col)),
                ColumnStorage::Backend => {
                    slots.push(Slot::Backend(backend_columns.len(), col.clone()));
                    backend_columns.push(col.name.clone());
                }
            }
        }
    }
    let visible = appended.then(|| req.request_columns.len());

    let wire = req.to_wire_with_columns(&backend_columns);

    if ctx.is_done() {
        return (Some(sort), visible);
    }

    thread::scope(|s| {
        let mut handles = Vec::new();
        for peer in &res.selected_peers {
            if !peer.is_online() {
                res.add_failed(&peer.id, peer.last_error());
                continue;
            }
            let wire = &wire;
            let slots = &slots;
            let handle = s.spawn(move || {
                tracing::debug!(peer = %peer.id, "starting passthrough request");
                match peer.remote_query(wire) {
                    Ok(raw_rows) => {
                        let mut rows = Vec::with_capacity(raw_rows.len());
                        for mut raw in raw_rows {
                            let mut row = Vec::with_capacity(slots.len());
                            for slot in slots.iter() {
                                match slot {
                                    Slot::Backend(pos, col) => {
                                        let cell = raw
                                            .get_mut(*pos)
                                            .map(JsonValue::take)
                                            .unwrap_or(JsonValue::Null);
                                        row.push(Value::from_json(col.kind, cell));
                                    }
                                    Slot::Virtual(col) => row.push(virtual_cell(col, peer)),
                                }
                            }
                            rows.push(row);
                        }
                        res.append_result_rows(rows);
                    }
                    Err(err) => res.add_failed(&peer.id, err.to_string()),
                }
            });
            handles.push((peer.clone(), handle));
        }
        for (peer, handle) in handles {
            if handle.join().is_err() {
                tracing::error!(peer = %peer.id, "passthrough thread panicked");
                res.add_failed(&peer.id, "internal error: passthrough thread panicked");
            }
        }
    });
    tracing::debug!(peers = res.selected_peers.len(), "passthrough requests done");

    (Some(sort), visible)
}

fn virtual_cell(col: &Column, peer: &Peer) -> Value {
    match col.name.as_str() {
        "peer_key" => Value::Str(peer.id.clone()),
        "peer_name" => Value::Str(peer.name.clone()),
        _ => Value::empty(col.kind),
    }
}
