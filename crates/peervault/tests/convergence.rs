//! Every device folds the same set of logs into the same view.

use proptest::prelude::*;

use peervault::core::{IdentitySeed, LogIdentity, StoredValue};
use peervault::store::{LogStore, MemoryStore, SharedLog};
use peervault::sync::merge;
use peervault_testkit::generators::histories;

fn distinct_timestamps(histories: &[Vec<StoredValue>]) -> bool {
    let mut seen: Vec<i64> = histories
        .iter()
        .flatten()
        .map(|v| v.written_at().as_millis())
        .collect();
    let total = seen.len();
    seen.sort_unstable();
    seen.dedup();
    seen.len() == total
}

async fn write_logs(histories: &[Vec<StoredValue>]) -> Vec<SharedLog> {
    let mut logs = Vec::new();
    for (i, history) in histories.iter().enumerate() {
        let log = MemoryStore::new()
            .open_local("vault", &IdentitySeed::from_bytes([i as u8; 32]))
            .await
            .unwrap();
        for value in history {
            log.append(&value.id().to_key(), &value.to_bytes().unwrap())
                .await
                .unwrap();
        }
        logs.push(log);
    }
    logs
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_device_sees_the_same_view(histories in histories(3, 4)) {
        prop_assume!(distinct_timestamps(&histories));

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let digests = rt.block_on(async {
            let logs = write_logs(&histories).await;
            let mut digests = Vec::new();
            for (i, local) in logs.iter().enumerate() {
                let peers: Vec<(LogIdentity, SharedLog)> = logs
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, log)| (log.identity(), log.clone()))
                    .collect();
                digests.push(merge(local, &peers).await.view.digest());
            }
            digests
        });

        prop_assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn merging_twice_is_identical(histories in histories(2, 3)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (first, second) = rt.block_on(async {
            let logs = write_logs(&histories).await;
            let peers = vec![(logs[1].identity(), logs[1].clone())];
            let first = merge(&logs[0], &peers).await.view;
            let second = merge(&logs[0], &peers).await.view;
            (first, second)
        });

        prop_assert_eq!(first.digest(), second.digest());
        prop_assert_eq!(first, second);
    }
}
