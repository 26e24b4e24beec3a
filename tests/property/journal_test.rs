// tests/property/journal_test.rs

//! Property-based tests for the journal codec
//! Tests round trips and that any single corrupted byte is rejected

use proptest::prelude::*;
use replgate::core::monitor::journal::{self, JournalSnapshot};
use replgate::core::monitor::server::ServerStatus;
use std::time::Duration;

fn snapshot() -> impl Strategy<Value = JournalSnapshot> {
    proptest::collection::btree_map("[a-z][a-z0-9_-]{0,15}", any::<u32>(), 0..10).prop_flat_map(
        |servers| {
            let servers: Vec<(String, ServerStatus)> = servers
                .into_iter()
                .map(|(name, bits)| (name, ServerStatus::from_bits_truncate(bits)))
                .collect();
            let names: Vec<String> = servers.iter().map(|(name, _)| name.clone()).collect();
            let master = if names.is_empty() {
                Just(None).boxed()
            } else {
                proptest::option::of(proptest::sample::select(names)).boxed()
            };
            (Just(servers), master)
                .prop_map(|(servers, master)| JournalSnapshot { servers, master })
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_encode_decode_roundtrip(snapshot in snapshot()) {
        let bytes = journal::encode(&snapshot).unwrap();
        prop_assert_eq!(journal::decode(&bytes), Some(snapshot));
    }

    #[test]
    fn test_any_flipped_byte_is_rejected(
        snapshot in snapshot(),
        position in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let mut bytes = journal::encode(&snapshot).unwrap().to_vec();
        let i = position.index(bytes.len());
        bytes[i] ^= mask;
        prop_assert_eq!(journal::decode(&bytes), None);
    }

    #[test]
    fn test_truncated_journal_is_rejected(
        snapshot in snapshot(),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = journal::encode(&snapshot).unwrap();
        let keep = cut.index(bytes.len());
        prop_assert_eq!(journal::decode(&bytes[..keep]), None);
    }

    #[test]
    fn test_file_roundtrip(snapshot in snapshot()) {
        let dir = tempfile::tempdir().unwrap();
        let path = journal::journal_path(dir.path(), "cluster");
        let loaded = runtime().block_on(async {
            journal::write(&path, &snapshot).await.unwrap();
            journal::load(&path, Duration::from_secs(60)).await
        });
        prop_assert_eq!(loaded, Some(snapshot));
    }
}
