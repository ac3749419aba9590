//! Runtime configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tunables for one node of the cluster.
///
/// The same struct is used on the master (slave id 0) and on the slaves
/// (slave ids 1..=number_of_slaves).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of slaves in the cluster, excluding the master.
    pub number_of_slaves: u16,
    /// Identifier of this node. 0 is the master.
    pub local_slave: u16,
    /// Mappings buffered per destination before a batch is flushed.
    pub mapping_bundle_size: usize,
    /// In-memory entries per receiver queue before spilling to disk.
    pub receiver_queue_cache_size: usize,
    /// Directory for receiver queue and join spill files.
    pub spill_directory: PathBuf,
    /// Mappings an operator may emit per scheduling round.
    pub emitted_mappings_per_round: usize,
    /// In-memory mappings per join side before spilling.
    pub join_cache_size: usize,
    /// Hash buckets per join side.
    pub join_bucket_count: usize,
    /// Reusable mapping buffers kept per pool.
    pub mapping_pool_size: usize,
    /// Keep-alive interval of the coordinator towards the client, in millis.
    pub keep_alive_interval_millis: u64,
    /// Sleep of an idle worker thread, in millis.
    pub idle_sleep_millis: u64,
    /// Load difference above which neighboring worker threads rebalance.
    pub unbalance_threshold: u64,
    /// Worker threads per node. 0 means `max(1, cpus - 1)`.
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            number_of_slaves: 1,
            local_slave: 0,
            mapping_bundle_size: 100,
            receiver_queue_cache_size: 1000,
            spill_directory: std::env::temp_dir().join("tessera"),
            emitted_mappings_per_round: 100,
            join_cache_size: 1000,
            join_bucket_count: 16,
            mapping_pool_size: 256,
            keep_alive_interval_millis: 5000,
            idle_sleep_millis: 10,
            unbalance_threshold: 100,
            worker_threads: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::cmp::max(1, num_cpus::get().saturating_sub(1))
        }
    }

    /// Bytes in a containment bitmap for this cluster size.
    pub fn containment_len(&self) -> usize {
        crate::mapping::containment_len(self.number_of_slaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_object() {
        let conf: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(100, conf.mapping_bundle_size);
        assert_eq!(1, conf.number_of_slaves);
    }

    #[test]
    fn partial_config_overrides() {
        let conf: RuntimeConfig =
            serde_json::from_str(r#"{"number_of_slaves": 4, "worker_threads": 2}"#).unwrap();
        assert_eq!(4, conf.number_of_slaves);
        assert_eq!(2, conf.effective_worker_threads());
    }
}
