// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use lazy_static::lazy_static;
use prometheus::core::{AtomicU64, GenericCounter, GenericGauge};

lazy_static! {
    pub static ref RING_REFRESH_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let ring_refresh_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "ring_refresh_total",
                "Total number of hash ring snapshot refreshes",
            )
            .expect("Defining the ring_refresh_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(ring_refresh_total.clone())
            .expect(
                "Registering the ring_refresh_total metric with the metrics registry must succeed",
            );
        ring_refresh_total
    };
    pub static ref RING_MEMBERS: Box<GenericGauge<AtomicU64>> = {
        let ring_members = Box::new(
            GenericGauge::<AtomicU64>::new("ring_members", "Number of addresses on the hash ring")
                .expect("Defining the ring_members metric must succeed"),
        );
        prometheus::default_registry()
            .register(ring_members.clone())
            .expect("Registering the ring_members metric with the metrics registry must succeed");
        ring_members
    };
}
