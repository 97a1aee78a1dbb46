//! End-to-end pipeline scenarios against in-memory peers.

mod common;

use common::*;

use heron_common::error::{HeronError, QueryError};
use std::time::Duration;

#[test]
fn test_basic_filter_sort_limit_fixed16() {
    let f = setup();
    f.add_hosts_peer("p1", &[("a", 0), ("b", 1), ("c", 0), ("d", 0)]);

    let req = f
        .request(TableName::Hosts, &["name", "state"])
        .with_filter(f.eq_filter(TableName::Hosts, "state", Value::Int(0)))
        .with_sort("name", SortDirection::Asc)
        .with_limit(2)
        .with_fixed16();

    let (res, out) = f.answer(req);
    assert_eq!(res.code, 200);
    // early-exit still counted the third match before stopping
    assert_eq!(res.result_total, 3);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "200          19\n[[\"a\",0],\n[\"c\",0]]\n"
    );
}

#[test]
fn test_wrapped_json_with_failed_peer() {
    let f = setup();
    f.add_offline_peer("X", "conn refused");
    f.add_hosts_peer("Y", &[("h1", 0)]);

    let mut req = f
        .request(TableName::Hosts, &["name", "state"])
        .with_output_format(OutputFormat::WrappedJson);
    req.columns_headers = true;

    let (res, out) = f.answer(req);
    assert_eq!(res.code, 200);

    let body = parse_body(&out);
    assert_eq!(body["data"], serde_json::json!([["h1", 0]]));
    assert!(body["failed"]["X"]
        .as_str()
        .unwrap()
        .contains("conn refused"));
    assert_eq!(body["columns"], serde_json::json!(["name", "state"]));
    assert_eq!(body["rows_scanned"], 1);
    assert_eq!(body["total_count"], 1);
}

#[test]
fn test_all_backends_failed_plain_json() {
    let f = setup();
    f.add_offline_peer("A", "down");
    f.add_offline_peer("B", "down");
    f.add_offline_peer("C", "down");

    let req = f
        .request(TableName::Hosts, &["name"])
        .with_backends(&["A", "B", "C"]);

    let (res, out) = f.answer(req);
    assert_eq!(res.code, 502);
    let body = String::from_utf8(out).unwrap();
    // the body is backend A's message, A being backends[0]
    assert!(body.contains("peer A"));
    assert!(body.contains("down"));
    assert!(body.ends_with('\n'));
}

#[test]
fn test_all_failed_wrapped_json_stays_200() {
    let f = setup();
    f.add_offline_peer("A", "down");

    let req = f
        .request(TableName::Hosts, &["name"])
        .with_backends(&["A"])
        .with_output_format(OutputFormat::WrappedJson);

    let (res, out) = f.answer(req);
    assert_eq!(res.code, 200);
    let body = parse_body(&out);
    assert_eq!(body["data"], serde_json::json!([]));
    assert!(body["failed"]["A"].as_str().unwrap().contains("down"));
}

#[test]
fn test_unknown_backend_is_bad_request() {
    let f = setup();
    f.add_hosts_peer("p1", &[("a", 0)]);

    let req = f
        .request(TableName::Hosts, &["name"])
        .with_backends(&["ghost"]);

    let (res, out) = f.answer(req);
    assert_eq!(res.code, 502);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "bad request: backend ghost does not exist\n"
    );
}

#[test]
fn test_no_peers_selected_plain_json() {
    let f = setup();

    let req = f.request(TableName::Hosts, &["name"]);
    let (res, out) = f.answer(req);
    assert_eq!(res.code, 200);
    assert_eq!(String::from_utf8(out).unwrap(), "[]\n");
}

#[test]
fn test_no_columns_emits_header_row() {
    let f = setup();

    let req = f.request(TableName::Hosts, &[]);
    let (_res, out) = f.answer(req);
    let body = parse_body(&out);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    let header: Vec<&str> = rows[0]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(header.contains(&"name"));
    assert!(header.contains(&"peer_name"));
}

#[test]
fn test_multi_peer_merge_and_sort_is_deterministic() {
    let expected = vec![
        vec![Value::Str("a".into())],
        vec![Value::Str("b".into())],
        vec![Value::Str("c".into())],
        vec![Value::Str("d".into())],
    ];

    for order in [["p1", "p2"], ["p2", "p1"]] {
        let f = setup();
        for id in order {
            match id {
                "p1" => f.add_hosts_peer("p1", &[("c", 0), ("a", 0)]),
                _ => f.add_hosts_peer("p2", &[("d", 0), ("b", 0)]),
            };
        }
        let req = f
            .request(TableName::Hosts, &["name"])
            .with_sort("name", SortDirection::Asc);
        let res = f.build(req);
        let rows: Vec<Vec<Value>> = res
            .materialized_result()
            .into_iter()
            .map(|r| r.into_iter().take(1).collect())
            .collect();
        assert_eq!(rows, expected);
    }
}

#[test]
fn test_single_peer_default_order_skips_sort() {
    let f = setup();
    f.add_hosts_peer("p1", &[("c", 0), ("a", 0), ("b", 0)]);

    // name asc is the hosts default order; with a single peer the sort
    // phase is skipped and scan order wins (part of the contract)
    let req = f
        .request(TableName::Hosts, &["name"])
        .with_sort("name", SortDirection::Asc);
    let res = f.build(req);
    let names: Vec<String> = res
        .materialized_result()
        .iter()
        .map(|r| r[0].to_text())
        .collect();
    assert_eq!(names, vec!["c", "a", "b"]);
}

#[test]
fn test_auth_user_filters_rows() {
    let f = setup();
    f.add_hosts_peer("p1", &[("a", 0), ("b", 0)]);

    let req = f
        .request(TableName::Hosts, &["name"])
        .with_auth_user("mallory");
    let res = f.build(req);
    assert!(res.materialized_result().is_empty());
    assert_eq!(res.result_total, 0);

    let req = f
        .request(TableName::Hosts, &["name"])
        .with_auth_user("alice");
    let res = f.build(req);
    assert_eq!(res.materialized_result().len(), 2);
}

#[test]
fn test_metadata_tables_use_first_peer_only() {
    let f = setup();
    f.add_hosts_peer("p1", &[("a", 0)]);
    f.add_hosts_peer("p2", &[("b", 0)]);

    let req = f.request(TableName::Tables, &["name"]);
    let res = f.build(req);
    assert_eq!(res.selected_peers.len(), 1);
    assert_eq!(res.selected_peers[0].id, "p1");
    // one row per catalog table, not doubled per peer
    assert_eq!(res.materialized_result().len(), 6);
}

#[test]
fn test_sites_virtual_table_lists_all_peers() {
    let f = setup();
    f.add_hosts_peer("p1", &[("a", 0)]);
    f.add_offline_peer("p2", "conn refused");

    let req = f.request(TableName::Sites, &["name", "status"]);
    let res = f.build(req);
    let rows = res.materialized_result();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], vec![Value::Str("p1".into()), Value::Int(0)]);
    assert_eq!(rows[1], vec![Value::Str("p2".into()), Value::Int(2)]);
}

#[test]
fn test_canceled_context_aborts_pipeline() {
    let f = setup();
    f.add_hosts_peer("p1", &[("a", 0)]);

    let ctx = QueryContext::background();
    ctx.cancel();
    let req = f.request(TableName::Hosts, &["name"]);
    let err = Response::build(&ctx, req, &f.peers, &f.catalog, None).unwrap_err();
    assert!(matches!(
        err,
        HeronError::Query(QueryError::Canceled)
    ));
}

#[test]
fn test_canceled_scan_returns_no_rows() {
    let f = setup();
    let rows: Vec<(String, i64)> = (0..30_000).map(|i| (format!("h{:05}", i), 0)).collect();
    let rows_ref: Vec<(&str, i64)> = rows.iter().map(|(n, s)| (n.as_str(), *s)).collect();
    f.add_hosts_peer("p1", &rows_ref);

    let ctx = QueryContext::with_timeout(Duration::from_millis(0));
    std::thread::sleep(Duration::from_millis(1));
    let req = f.request(TableName::Hosts, &["name"]);
    assert!(Response::build(&ctx, req, &f.peers, &f.catalog, None).is_err());
}

#[test]
fn test_wait_trigger_blocks_until_fired() {
    let f = setup();
    let peer = f.add_hosts_peer("p1", &[("a", 0)]);

    let mut req = f.request(TableName::Hosts, &["name"]);
    req.wait_trigger = Some("check".to_string());

    let fire = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        peer.fire_trigger("check");
    });

    let start = std::time::Instant::now();
    let res = f.build(req);
    fire.join().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(25));
    assert_eq!(res.materialized_result().len(), 1);
}

#[test]
fn test_spin_up_wakes_idle_peer() {
    let f = setup();
    let peer = f.add_hosts_peer("p1", &[("a", 0)]);
    peer.set_idling(true);

    let req = f.request(TableName::Hosts, &["name"]);
    let res = f.build(req);
    assert!(!peer.is_idling());
    assert_eq!(res.materialized_result().len(), 1);
}

#[test]
fn test_idempotent_rerun_yields_identical_bytes() {
    let f = setup();
    f.add_hosts_peer("p1", &[("b", 0), ("a", 1)]);
    f.add_hosts_peer("p2", &[("c", 0)]);

    let make = || {
        f.request(TableName::Hosts, &["name", "state"])
            .with_sort("name", SortDirection::Asc)
            .with_fixed16()
    };
    let (_, out1) = f.answer(make());
    let (_, out2) = f.answer(make());
    assert_eq!(out1, out2);
}
