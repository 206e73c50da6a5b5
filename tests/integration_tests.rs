//! Black-box integration tests against the public `hdtn_node` API.
//!
//! Complements the inline `#[cfg(test)]` unit tests and the six
//! `spec.md` §8 scenario tests already covered beside their owning
//! modules (`dispatcher.rs`, `ltp/sender.rs`, `ltp/engine.rs`,
//! `ltp/fragment_map.rs`): this file exercises whole-component paths only
//! reachable through the crate's public surface, in particular storage
//! restart recovery and the CTEB-carrying custody-release path.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use hdtn_node::bundle::bpv6::{BundleFlags, BundleV6, CanonicalBlock, PrimaryBlock};
use hdtn_node::bundle::cteb::Cteb;
use hdtn_node::bundle::Eid;
use hdtn_node::config::{StorageConfig, StorageImplementation, StoreDiskConfig};
use hdtn_node::{CustodyTimers, SegmentAllocator, StorageEngine};

struct TempDir(std::path::PathBuf);
impl TempDir {
    fn path(&self) -> &std::path::Path {
        &self.0
    }
}
impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
fn tempdir(tag: &str) -> TempDir {
    let mut dir = std::env::temp_dir();
    dir.push(format!("hdtn-node-integration-{tag}-{:?}", std::thread::current().id()));
    std::fs::create_dir_all(&dir).unwrap();
    TempDir(dir)
}

fn storage_config(dir: &std::path::Path, restore: bool) -> StorageConfig {
    StorageConfig {
        storage_implementation: StorageImplementation::AsioSingleThreaded,
        try_to_restore_from_disk: restore,
        auto_delete_files_on_exit: true,
        total_storage_capacity_bytes: 1 << 20,
        storage_disk_config_vector: vec![StoreDiskConfig {
            name: "store0".into(),
            store_file_path: dir.join("store0.bin").to_string_lossy().to_string(),
        }],
        segment_size_bytes: 64,
        reserved_free_segments: 0,
        worker_threads: 2,
    }
}

fn bundle_with_cteb(dest: u64, custody_id: u64, payload_len: usize) -> Vec<u8> {
    let mut flags = BundleFlags::default().with_priority(1);
    flags.set(BundleFlags::CUSTODY_REQUESTED);
    let bundle = BundleV6 {
        primary: PrimaryBlock {
            flags,
            destination: Eid::new(dest, 1),
            source: Eid::new(1, 0),
            report_to: Eid::NULL,
            custodian: Eid::new(1, 0),
            creation_timestamp_secs: 0,
            creation_sequence: 0,
            lifetime_ms: 3_600_000,
            fragment_offset: 0,
            total_adu_length: 0,
        },
        canonical_blocks: vec![
            CanonicalBlock { block_type: 1, flags: 0, body: vec![9u8; payload_len] },
            Cteb { block_flags: 0, custody_id, creator_custodian_eid: "ipn:1.0".into() }
                .to_canonical_block(),
        ],
    };
    bundle.serialize()
}

/// A bundle stored, then "crash-restarted": a fresh `StorageEngine` opened
/// over the same files with `try_to_restore_from_disk` walks the footer
/// chain back and recovers both the bytes and the CTEB custody id (spec
/// §4.3 "Restart recovery").
#[tokio::test]
async fn restart_recovery_rebuilds_chain_and_custody_id() {
    let dir = tempdir("restart");
    let raw = bundle_with_cteb(42, 777, 200);

    {
        let engine = StorageEngine::open(&storage_config(dir.path(), false)).unwrap();
        let descriptor = engine
            .store_bundle(777, Eid::new(42, 1), 1, 9_999_999_999, true, raw.clone())
            .await
            .unwrap();
        assert!(descriptor.segment_chain.len() > 1, "64-byte segments must split a 200+-byte bundle");
    }

    let reopened = StorageEngine::open(&storage_config(dir.path(), true)).unwrap();
    let next_id = AtomicU64::new(1);
    let recovered = reopened.recover(&next_id).unwrap();
    assert_eq!(recovered.len(), 1);
    let descriptor = &recovered[0].descriptor;
    assert_eq!(descriptor.custody_id, 777, "custody id recovered from the CTEB, not reassigned");
    assert_eq!(descriptor.destination_eid, Eid::new(42, 1));
    assert!(descriptor.is_custodial);

    let bytes = reopened.read_bundle(descriptor, raw.len()).await.unwrap();
    assert_eq!(bytes, raw, "recovered chain reconstructs the exact original bytes");

    // Every id belonging to the recovered chain must read back as
    // allocated in the rebuilt bitmap, matching spec §3's invariant that
    // no allocated segment exists without a catalog descriptor pointing
    // at it once recovery has run.
    let before_free = reopened.allocator().free_count();
    reopened.free_chain(&descriptor.segment_chain).unwrap();
    assert!(reopened.allocator().free_count() > before_free);
}

/// Truncate-on-restart (the `tryToRestoreFromDisk = false` default path):
/// a bundle written before reopening without recovery is gone, and the
/// store file is usable fresh.
#[tokio::test]
async fn disabled_recovery_truncates_the_store() {
    let dir = tempdir("truncate");
    {
        let engine = StorageEngine::open(&storage_config(dir.path(), false)).unwrap();
        engine.store_bundle(1, Eid::new(1, 1), 0, 9_999_999_999, false, vec![5u8; 40]).await.unwrap();
    }
    let reopened = StorageEngine::open(&storage_config(dir.path(), false)).unwrap();
    let next_id = AtomicU64::new(1);
    let recovered = reopened.recover(&next_id).unwrap();
    assert!(recovered.is_empty(), "truncated store has nothing to recover");
}

/// Custody-timer boundary behavior from spec §8: `start(d, c);
/// advance_clock(T-1); poll_expired == None; advance_clock(1);
/// poll_expired == c`, driven entirely through the public `CustodyTimers`
/// API rather than the dispatcher's wrapping of it.
#[test]
fn custody_timer_expires_at_exactly_the_configured_timeout() {
    let mut timers = CustodyTimers::new(std::time::Duration::from_millis(50));
    let dest = Eid::new(9, 1);
    let start = Instant::now();
    assert!(timers.start(dest, 555, start));

    let just_before = start + std::time::Duration::from_millis(49);
    assert_eq!(timers.poll_expired(&[dest], just_before), None);

    let at_timeout = start + std::time::Duration::from_millis(50);
    assert_eq!(timers.poll_expired(&[dest], at_timeout), Some((dest, 555)));
    assert_eq!(timers.poll_expired(&[dest], at_timeout), None, "single pop, not re-armed");
}

/// Allocator boundary from spec §8: exactly `CAPACITY` successful
/// allocations, the next is `Full`, and a single free restores exactly
/// one more allocation slot with the freed id reissued.
#[test]
fn segment_allocator_exhausts_at_capacity_and_recovers_on_free() {
    let allocator = SegmentAllocator::new();
    let mut first_batch = Vec::with_capacity(1024);
    for _ in 0..1024 {
        first_batch.push(allocator.allocate().unwrap());
    }
    // Exhaust the remainder via the batch path (cheaper than one at a time
    // for the full 16M-id tree in a test).
    let remaining = hdtn_node::SEGMENT_ALLOCATOR_CAPACITY as usize - 1024;
    let rest = allocator.allocate_n(remaining).unwrap();
    assert_eq!(rest.len(), remaining);

    assert!(matches!(allocator.allocate(), Err(_)), "allocator must be full");

    let freed = first_batch[0];
    allocator.free(freed).unwrap();
    let reissued = allocator.allocate().unwrap();
    assert_eq!(reissued, freed, "free must restore availability for exactly one more allocation with the same id");
    assert!(matches!(allocator.allocate(), Err(_)), "full again after reissuing the one freed id");
}
