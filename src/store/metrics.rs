// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use lazy_static::lazy_static;
use prometheus::core::{AtomicU64, GenericCounter, GenericGauge, GenericGaugeVec};
use prometheus::Opts;

lazy_static! {
    pub static ref CLEANUP_SCAN_BYTES: Box<GenericGaugeVec<AtomicU64>> = {
        let cleanup_scan_bytes = Box::new(
            GenericGaugeVec::<AtomicU64>::new(
                Opts::new(
                    "cleanup_scan_bytes",
                    "Total bytes seen by the last cleanup scan of a store view",
                ),
                &["view"],
            )
            .expect("Defining the cleanup_scan_bytes metric must succeed"),
        );
        prometheus::default_registry()
            .register(cleanup_scan_bytes.clone())
            .expect(
                "Registering the cleanup_scan_bytes metric with the metrics registry must succeed",
            );
        cleanup_scan_bytes
    };
    pub static ref CLEANUP_DELETED_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let cleanup_deleted_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "cleanup_deleted_total",
                "Total number of files deleted by cleanup jobs",
            )
            .expect("Defining the cleanup_deleted_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(cleanup_deleted_total.clone())
            .expect(
                "Registering the cleanup_deleted_total metric with the metrics registry must succeed",
            );
        cleanup_deleted_total
    };
    pub static ref MEMORY_CACHE_USED_BYTES: Box<GenericGauge<AtomicU64>> = {
        let memory_cache_used_bytes = Box::new(
            GenericGauge::<AtomicU64>::new(
                "memory_cache_used_bytes",
                "Bytes held by live memory cache entries, reservations included",
            )
            .expect("Defining the memory_cache_used_bytes metric must succeed"),
        );
        prometheus::default_registry()
            .register(memory_cache_used_bytes.clone())
            .expect(
                "Registering the memory_cache_used_bytes metric with the metrics registry must succeed",
            );
        memory_cache_used_bytes
    };
    pub static ref DRAIN_ERROR_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let drain_error_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "drain_error_total",
                "Memory cache entries dropped after exhausting drain retries",
            )
            .expect("Defining the drain_error_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(drain_error_total.clone())
            .expect(
                "Registering the drain_error_total metric with the metrics registry must succeed",
            );
        drain_error_total
    };
}
