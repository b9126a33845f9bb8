// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use lazy_static::lazy_static;
use prometheus::core::{AtomicU64, GenericCounter, GenericGauge};

lazy_static! {
    pub static ref PROBE_FAILURE_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let probe_failure_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "probe_failure_total",
                "Total number of failed health probes",
            )
            .expect("Defining the probe_failure_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(probe_failure_total.clone())
            .expect(
                "Registering the probe_failure_total metric with the metrics registry must succeed",
            );
        probe_failure_total
    };
    pub static ref HEALTHY_HOSTS: Box<GenericGauge<AtomicU64>> = {
        let healthy_hosts = Box::new(
            GenericGauge::<AtomicU64>::new(
                "healthy_hosts",
                "Number of healthy hosts published by the health monitor",
            )
            .expect("Defining the healthy_hosts metric must succeed"),
        );
        prometheus::default_registry()
            .register(healthy_hosts.clone())
            .expect("Registering the healthy_hosts metric with the metrics registry must succeed");
        healthy_hosts
    };
}
