//! Multi-chain sharing of equal-fingerprint instances.

mod common;

use std::sync::Arc;

use serde_json::json;
use taskchain::{ChainError, MultiChain};

use common::env;

#[test]
fn equal_fingerprints_share_one_instance() {
    let env = env();
    let configs = vec![
        env.config("first", json!({"tasks": "pipeline.*", "x": 5})),
        env.config("second", json!({"tasks": "pipeline.*", "x": 5})),
    ];
    let multi = MultiChain::new(&configs).unwrap();

    let first = multi.get("first").unwrap().get("source").unwrap().clone();
    let second = multi.get("second").unwrap().get("source").unwrap().clone();
    assert!(Arc::ptr_eq(&first, &second));

    // One computation serves both chains, even in memory.
    multi.get("first").unwrap().get("total").unwrap().value().unwrap();
    let value = multi.get("second").unwrap().get("total").unwrap().value().unwrap();
    assert_eq!(value.as_json().unwrap(), &json!(20));
    assert_eq!(env.count("source"), 1);
    assert_eq!(env.count("total"), 1);
}

#[test]
fn different_parameters_stay_separate() {
    let env = env();
    let configs = vec![
        env.config("five", json!({"tasks": "pipeline.*", "x": 5})),
        env.config("six", json!({"tasks": "pipeline.*", "x": 6})),
    ];
    let multi = MultiChain::new(&configs).unwrap();

    let five = multi.get("five").unwrap().get("source").unwrap().clone();
    let six = multi.get("six").unwrap().get("source").unwrap().clone();
    assert!(!Arc::ptr_eq(&five, &six));

    multi.get("five").unwrap().get("source").unwrap().value().unwrap();
    multi.get("six").unwrap().get("source").unwrap().value().unwrap();
    assert_eq!(env.count("source"), 2);
}

#[test]
fn partial_overlap_shares_the_common_prefix() {
    let env = env();
    // Same source, but the downstream pipeline is configured only in one.
    let configs = vec![
        env.config("full", json!({"tasks": "pipeline.*", "x": 3})),
        env.config("narrow", json!({"tasks": "pipeline.SourceTask", "x": 3})),
    ];
    let multi = MultiChain::new(&configs).unwrap();

    assert_eq!(multi.get("full").unwrap().tasks().len(), 3);
    assert_eq!(multi.get("narrow").unwrap().tasks().len(), 1);

    let a = multi.get("full").unwrap().get("source").unwrap().clone();
    let b = multi.get("narrow").unwrap().get("source").unwrap().clone();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn duplicate_config_names_are_rejected() {
    let env = env();
    let configs = vec![
        env.config("same", json!({"tasks": "pipeline.*", "x": 1})),
        env.config("same", json!({"tasks": "pipeline.*", "x": 2})),
    ];
    assert!(matches!(
        MultiChain::new(&configs).unwrap_err(),
        ChainError::DuplicateChainName(_)
    ));
}

#[test]
fn latest_picks_alphabetically_last() {
    let env = env();
    let configs = vec![
        env.config("run_2026_01", json!({"tasks": "pipeline.*", "x": 1})),
        env.config("run_2026_02", json!({"tasks": "pipeline.*", "x": 2})),
        env.config("baseline", json!({"tasks": "pipeline.*", "x": 3})),
    ];
    let multi = MultiChain::new(&configs).unwrap();

    assert_eq!(multi.latest(None).unwrap().name(), "run_2026_02");
    assert_eq!(multi.latest(Some("run")).unwrap().name(), "run_2026_02");
    assert_eq!(multi.latest(Some("base")).unwrap().name(), "baseline");
}

#[test]
fn force_broadcasts_to_every_member() {
    let env = env();
    let configs = vec![
        env.config("a", json!({"tasks": "pipeline.*", "x": 2})),
        env.config("b", json!({"tasks": "pipeline.*", "x": 4})),
    ];
    let multi = MultiChain::new(&configs).unwrap();

    multi.get("a").unwrap().get("total").unwrap().value().unwrap();
    multi.get("b").unwrap().get("total").unwrap().value().unwrap();
    assert_eq!(env.count("source"), 2);

    multi.force(["source"], true, false).unwrap();
    assert_eq!(env.count("source"), 4);
    assert_eq!(env.count("total"), 4);
}
