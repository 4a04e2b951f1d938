//! Lock discipline: at most one computation per fingerprint, concurrent
//! requesters wait and then load the persisted artifact.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use taskchain::{Config, Registry, ReturnKind, RunOutput, TaskSpec};

#[test]
fn concurrent_requests_run_the_task_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    let shared = runs.clone();
    registry.register_task(
        TaskSpec::new("slow.NapTask", move |_| {
            shared.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            Ok(RunOutput::Value(json!("rested")))
        })
        .returns(ReturnKind::Str),
    );
    let registry = registry.finish();

    let tmp = tempfile::tempdir().unwrap();
    let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
    let data = json!({"tasks": "slow.NapTask"});

    // Two independent chains over the same artifact root, evaluated from two
    // threads at once. The advisory lock serializes them, the loser of the
    // race loads what the winner persisted.
    let mut handles = Vec::new();
    for _ in 0..2 {
        let registry = registry.clone();
        let root = root.clone();
        let data = data.clone();
        handles.push(thread::spawn(move || {
            let config = Config::builder(root, &registry)
                .load_data("base", data)
                .unwrap();
            let chain = config.chain().unwrap();
            let value = chain.get("nap").unwrap().value().unwrap();
            value.as_json().unwrap().clone()
        }));
    }

    for handle in handles {
        assert_eq!(handle.join().unwrap(), json!("rested"));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Exactly one run recorded in the run-info sidecar as well.
    let config = Config::builder(root, &registry)
        .load_data("base", json!({"tasks": "slow.NapTask"}))
        .unwrap();
    let chain = config.chain().unwrap();
    let info = chain.get("nap").unwrap().run_info().unwrap();
    assert_eq!(info.task.name, "nap");
}
