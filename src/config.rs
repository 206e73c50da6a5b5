//! Configuration structs for the core. Parsing/hot-reload is the embedding
//! binary's job (`src/bin/dtnd.rs`); these types just need to be `Deserialize`
//! so that job is a one-liner.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::bundle::eid::Eid;

/// Which `StorageEngine` implementation backs C3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageImplementation {
    /// A pool of blocking worker threads doing synchronous `pread`/`pwrite`.
    StdioMultiThreaded,
    /// A single background reactor doing non-blocking I/O.
    AsioSingleThreaded,
}

impl Default for StorageImplementation {
    fn default() -> Self {
        StorageImplementation::StdioMultiThreaded
    }
}

/// One striped store file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDiskConfig {
    pub name: String,
    pub store_file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub storage_implementation: StorageImplementation,
    pub try_to_restore_from_disk: bool,
    pub auto_delete_files_on_exit: bool,
    pub total_storage_capacity_bytes: u64,
    pub storage_disk_config_vector: Vec<StoreDiskConfig>,
    /// Size in bytes of one on-disk segment (`S`). Typically 4 KiB.
    #[serde(default = "default_segment_size")]
    pub segment_size_bytes: u32,
    /// Free-segment threshold below which new accepts are refused with
    /// `Backpressure` rather than displacing existing bundles.
    #[serde(default)]
    pub reserved_free_segments: u32,
    /// Number of worker threads for `StdioMultiThreaded` (2-8 recommended).
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_segment_size() -> u32 {
    4096
}

fn default_worker_threads() -> usize {
    4
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            storage_implementation: StorageImplementation::default(),
            try_to_restore_from_disk: false,
            auto_delete_files_on_exit: false,
            total_storage_capacity_bytes: 1 << 30,
            storage_disk_config_vector: vec![StoreDiskConfig {
                name: "store0".into(),
                store_file_path: "./store0.bin".into(),
            }],
            segment_size_bytes: default_segment_size(),
            reserved_free_segments: 1024,
            worker_threads: default_worker_threads(),
        }
    }
}

/// Convergence-layer protocol tags shared by induct and outduct endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceLayer {
    Udp,
    Ltp,
    TcpclV4,
    Stcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InductConfig {
    pub convergence_layer: ConvergenceLayer,
    pub bind_address: String,
    pub bind_port: u16,
    #[serde(default = "default_max_rx_bundle_size")]
    pub max_rx_bundle_size_bytes: u64,
}

fn default_max_rx_bundle_size() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutductConfig {
    pub convergence_layer: ConvergenceLayer,
    pub next_hop_eid: Eid,
    pub remote_address: String,
    pub remote_port: u16,
    /// Outduct pipeline capacity: max bundles in flight before `would_block`.
    #[serde(default = "default_pipeline_capacity")]
    pub max_number_of_bundles_in_pipeline: usize,
}

fn default_pipeline_capacity() -> usize {
    5
}

/// Tuning for one LTP engine instance (one UDP port).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtpEngineConfig {
    pub engine_id: u64,
    pub remote_engine_id: u64,
    pub bind_port: u16,
    pub ltp_data_segment_mtu: u32,
    pub ltp_report_segment_mtu: u32,
    pub one_way_light_time: DurationMs,
    pub one_way_margin_time: DurationMs,
    /// Every Nth transmitted data segment is flagged checkpoint; 0 disables
    /// discretionary checkpoints (the end-of-red-part checkpoint is always
    /// mandatory regardless of this value).
    pub checkpoint_every_nth_tx_packet: u32,
    pub max_retries_per_serial_number: u32,
    pub max_send_rate_bits_per_sec: u64,
    pub max_udp_packets_to_send_per_system_call: u32,
    pub session_inactivity: DurationMs,
    /// Capacity of the session-recreation preventer; 0 disables it.
    #[serde(default)]
    pub session_recreation_preventer_capacity: usize,
    /// 32-bit (ION-compatible, default) or 64-bit session numbers.
    #[serde(default)]
    pub use_64_bit_session_numbers: bool,
}

/// A millisecond duration that (de)serializes as a plain integer, the way
/// the `dtnd` CLI surface expresses every `*-ms`/`*-milliseconds` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationMs(pub u64);

impl From<DurationMs> for Duration {
    fn from(value: DurationMs) -> Self {
        Duration::from_millis(value.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: u64,
    pub storage: StorageConfig,
    pub inducts: Vec<InductConfig>,
    pub outducts: Vec<OutductConfig>,
    pub ltp_engines: Vec<LtpEngineConfig>,
    /// Bundle priority used when a helper app / ingress path does not set one.
    #[serde(default)]
    pub default_priority: u8,
    /// Capacity of the dispatcher's bounded ingress queue.
    #[serde(default = "default_ingress_queue_capacity")]
    pub ingress_queue_capacity: usize,
}

fn default_ingress_queue_capacity() -> usize {
    4096
}
