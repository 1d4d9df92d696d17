use std::collections::HashMap;

use prereduce::net::{Comm, LocalComm};
use prereduce::stage::ReducePreStage;
use prereduce::{KeyMode, ReduceConfig};

struct Outcome {
    worker: usize,
    received: Vec<(u64, u64)>,
    spills: usize,
    shared_flagged: Vec<u64>,
}

/// Every worker counts `inputs[worker]` with a spilling pre-stage and
/// shuffles partition `i` to worker `i`.
async fn run_cluster(inputs: Vec<Vec<u64>>, memory: usize, shared: Vec<u64>) -> Vec<Outcome> {
    let spill_dir = tempfile::tempdir().unwrap();
    let comms = LocalComm::cluster(inputs.len());
    let mut handles = Vec::new();
    for (comm, input) in comms.into_iter().zip(inputs) {
        let config = ReduceConfig::default().with_spill_dir(spill_dir.path());
        let shared = shared.clone();
        handles.push(tokio::spawn(async move {
            let mut shuffle = comm.new_cat_stream().unwrap();
            let mut stage = ReducePreStage::new(
                |v: &u64| *v,
                |a: &u64, b: &u64| a + b,
                shuffle.writers(),
                config,
            )
            .unwrap();
            stage.initialize(memory).unwrap();
            for key in input {
                stage.insert_pair((key, 1)).unwrap();
            }
            let spills = stage.table().num_spills();

            stage.flush_all(&comm).await.unwrap();
            let shared_flagged = shared
                .into_iter()
                .filter(|k| stage.is_possible_duplicate(k) == Some(true))
                .collect();
            stage.close_all().unwrap();

            let mut reader = shuffle.cat_reader();
            let mut received = Vec::new();
            while reader.has_next().await.unwrap() {
                received.push(reader.next::<(u64, u64)>().await.unwrap());
            }
            Outcome {
                worker: comm.worker_id(),
                received,
                spills,
                shared_flagged,
            }
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn counts_survive_spilling_and_shuffle() {
    let workers = 3;
    // keys 0..50 on every worker, 1000 + w only on worker w
    let inputs: Vec<Vec<u64>> = (0..workers as u64)
        .map(|w| {
            let mut keys: Vec<u64> = (0..50).chain(0..50).collect();
            keys.push(1000 + w);
            keys
        })
        .collect();
    let shared: Vec<u64> = (0..50).collect();
    let outcomes = run_cluster(inputs, 512, shared.clone()).await;

    let mut totals: HashMap<u64, u64> = HashMap::new();
    let mut reducer: HashMap<u64, usize> = HashMap::new();
    for outcome in &outcomes {
        assert!(outcome.spills > 0, "worker {} never spilled", outcome.worker);
        for (key, count) in &outcome.received {
            let owner = *reducer.entry(*key).or_insert(outcome.worker);
            assert_eq!(owner, outcome.worker, "key {key} reached two workers");
            *totals.entry(*key).or_default() += count;
        }
        assert_eq!(outcome.shared_flagged, shared, "shared keys missed");
    }
    for key in 0..50u64 {
        assert_eq!(totals[&key], 2 * workers as u64);
    }
    for w in 0..workers as u64 {
        assert_eq!(totals[&(1000 + w)], 1);
    }
    assert_eq!(totals.len(), 50 + workers);
}

#[tokio::test]
async fn roomy_tables_send_each_key_once() {
    let inputs = vec![vec![1, 2, 2, 3], vec![3, 4, 4, 4]];
    let outcomes = run_cluster(inputs, 1 << 16, vec![3]).await;

    let mut all: Vec<(u64, u64)> = outcomes.iter().flat_map(|o| o.received.clone()).collect();
    all.sort_unstable();
    // one pre-reduced pair per key and worker
    assert_eq!(all, vec![(1, 1), (2, 2), (3, 1), (3, 1), (4, 3)]);
    assert!(outcomes.iter().all(|o| o.spills == 0));
    assert!(outcomes.iter().all(|o| o.shared_flagged == vec![3]));
}

#[test]
fn robust_mode_config_roundtrip() {
    let config = ReduceConfig::from_json(r#"{"key_mode": "robust", "fpr_parameter": 16.0}"#).unwrap();
    assert_eq!(config.key_mode, KeyMode::Robust);
    assert!(config.detect_duplicates);
}
