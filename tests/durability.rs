//! Durability and restart behavior.

use chunklog::{Chunk, ChunkId, ChunkStore, StoreConfig, VecSink};
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tempfile::tempdir;

#[test]
fn clean_shutdown_survives_a_restart() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path());

    {
        let store = ChunkStore::open(config.clone()).unwrap();
        store.init_backup_range(2, 0).unwrap();
        let chunks: Vec<Chunk> = (1..=500u64)
            .map(|local| Chunk::new(ChunkId::from_parts(2, local), vec![local as u8; 40]))
            .collect();
        store.log_chunks(2, 0, &chunks).unwrap();
        store.close().unwrap();
    }

    // A fresh process: attach the existing files and recover.
    let store = ChunkStore::open(config).unwrap();
    assert!(store.init_backup_range(2, 0).unwrap());
    let sink = VecSink::new();
    let meta = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(meta.chunks, 500);

    let recovered = sink.into_chunks();
    assert_eq!(recovered.len(), 500);
    for chunk in &recovered {
        assert_eq!(chunk.payload, vec![chunk.cid.local_id() as u8; 40]);
    }
    store.close().unwrap();
}

#[test]
fn updates_before_shutdown_win_after_restart() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path());

    {
        let store = ChunkStore::open(config.clone()).unwrap();
        store.init_backup_range(2, 0).unwrap();
        for payload_byte in [0x01u8, 0x02, 0x03] {
            let chunks: Vec<Chunk> = (1..=100u64)
                .map(|local| Chunk::new(ChunkId::from_parts(2, local), vec![payload_byte; 32]))
                .collect();
            store.log_chunks(2, 0, &chunks).unwrap();
        }
        store.close().unwrap();
    }

    let store = ChunkStore::open(config).unwrap();
    store.init_backup_range(2, 0).unwrap();
    let sink = VecSink::new();
    let meta = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(meta.chunks, 100);
    assert!(sink
        .into_chunks()
        .iter()
        .all(|c| c.payload == vec![0x03; 32]));
    store.close().unwrap();
}

#[test]
fn migrated_chunks_keep_their_creator_node() {
    let dir = tempdir().unwrap();
    let store = ChunkStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    store.init_backup_range(2, 0).unwrap();

    // Chunks created by node 7 but now owned (and backed up) by node 2.
    let mut chunks: Vec<Chunk> = (1..=50u64)
        .map(|local| Chunk::new(ChunkId::from_parts(7, local), vec![0xAB; 24]))
        .collect();
    // Mixed with native chunks of node 2.
    chunks.extend((1..=50u64).map(|local| Chunk::new(ChunkId::from_parts(2, local), vec![0xCD; 24])));
    store.log_chunks(2, 0, &chunks).unwrap();

    let sink = VecSink::new();
    let meta = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(meta.chunks, 100);

    let recovered = sink.into_chunks();
    let foreign: Vec<_> = recovered.iter().filter(|c| c.cid.node_id() == 7).collect();
    assert_eq!(foreign.len(), 50);
    assert!(foreign.iter().all(|c| c.payload == vec![0xAB; 24]));
    store.close().unwrap();
}

#[test]
fn standalone_file_recovery_without_version_log() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path());
    {
        let store = ChunkStore::open(config.clone()).unwrap();
        store.init_backup_range(2, 3).unwrap();
        // Two versions; the file-based path must keep the newer one.
        for payload_byte in [0x10u8, 0x20] {
            let chunks: Vec<Chunk> = (1..=80u64)
                .map(|local| Chunk::new(ChunkId::from_parts(2, local), vec![payload_byte; 16]))
                .collect();
            store.log_chunks(2, 3, &chunks).unwrap();
        }
        store.close().unwrap();
    }

    let store = ChunkStore::open(config).unwrap();
    let chunks = store
        .recover_backup_range_from_file(&dir.path().join("0002_0003.sec"))
        .unwrap();
    assert_eq!(chunks.len(), 80);
    let cids: HashSet<u64> = chunks.iter().map(|c| c.cid.raw()).collect();
    assert_eq!(cids.len(), 80);
    assert!(chunks.iter().all(|c| c.payload == vec![0x20; 16]));
    store.close().unwrap();
}

#[test]
fn variable_sized_payloads_round_trip() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path());
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xC1D5);

    // Mostly small payloads, with a few above half a segment (the
    // chaining threshold for 64 KiB test segments).
    let chunks: Vec<Chunk> = (1..=300u64)
        .map(|local| {
            let len = if local % 50 == 0 {
                40 * 1024
            } else {
                rng.gen_range(1..=4096)
            };
            let byte = (local % 251) as u8;
            Chunk::new(ChunkId::from_parts(2, local), vec![byte; len])
        })
        .collect();

    {
        let store = ChunkStore::open(config.clone()).unwrap();
        store.init_backup_range(2, 0).unwrap();
        store.log_chunks(2, 0, &chunks).unwrap();
        store.close().unwrap();
    }

    let store = ChunkStore::open(config).unwrap();
    store.init_backup_range(2, 0).unwrap();
    let sink = VecSink::new();
    let meta = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(meta.chunks as usize, chunks.len());
    assert_eq!(meta.incomplete_chains, 0);

    let mut recovered = sink.into_chunks();
    recovered.sort_by_key(|c| c.cid);
    for (expected, got) in chunks.iter().zip(&recovered) {
        assert_eq!(expected.cid, got.cid);
        assert_eq!(expected.payload, got.payload);
    }
    store.close().unwrap();
}

#[test]
fn timestamps_enabled_round_trip() {
    let dir = tempdir().unwrap();
    let store =
        ChunkStore::open(StoreConfig::for_testing(dir.path()).with_timestamps(true)).unwrap();
    store.init_backup_range(2, 0).unwrap();

    let chunks: Vec<Chunk> = (1..=200u64)
        .map(|local| Chunk::new(ChunkId::from_parts(2, local), vec![0x5A; 56]))
        .collect();
    store.log_chunks(2, 0, &chunks).unwrap();

    let sink = VecSink::new();
    let meta = store.recover_backup_range(2, 0, &sink).unwrap();
    assert_eq!(meta.chunks, 200);
    assert!(sink.into_chunks().iter().all(|c| c.payload == vec![0x5A; 56]));
    store.close().unwrap();
}

#[test]
fn recovered_range_can_be_reattached_under_a_new_identity() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::for_testing(dir.path());
    {
        let store = ChunkStore::open(config.clone()).unwrap();
        store.init_backup_range(7, 1).unwrap();
        let chunks: Vec<Chunk> = (1..=60u64)
            .map(|local| Chunk::new(ChunkId::from_parts(7, local), vec![0x33; 20]))
            .collect();
        store.log_chunks(7, 1, &chunks).unwrap();
        store.close().unwrap();
    }

    // Node 2 takes over node 7's range after a failure.
    let store = ChunkStore::open(config).unwrap();
    assert!(store
        .init_recovered_backup_range(2, 5, 7, 1, false)
        .unwrap());

    let sink = VecSink::new();
    let meta = store.recover_backup_range(2, 5, &sink).unwrap();
    assert_eq!(meta.chunks, 60);
    // The chunks still belong to node 7 (their creator).
    assert!(sink.into_chunks().iter().all(|c| c.cid.node_id() == 7));

    // The original identity's files are gone.
    assert!(!dir.path().join("0007_0001.sec").exists());
    assert!(dir.path().join("0002_0005.sec").exists());
    store.close().unwrap();
}
