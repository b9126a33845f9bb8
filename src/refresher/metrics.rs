// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use lazy_static::lazy_static;
use prometheus::core::{AtomicU64, GenericCounter};
use prometheus::{Histogram, HistogramOpts};

lazy_static! {
    pub static ref REFRESH_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let refresh_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "refresh_total",
                "Total number of blob refreshes dispatched",
            )
            .expect("Defining the refresh_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(refresh_total.clone())
            .expect("Registering the refresh_total metric with the metrics registry must succeed");
        refresh_total
    };
    pub static ref REFRESH_FAILURE_TOTAL: Box<GenericCounter<AtomicU64>> = {
        let refresh_failure_total = Box::new(
            GenericCounter::<AtomicU64>::new(
                "refresh_failure_total",
                "Total number of dispatched blob refreshes that failed",
            )
            .expect("Defining the refresh_failure_total metric must succeed"),
        );
        prometheus::default_registry()
            .register(refresh_failure_total.clone())
            .expect(
                "Registering the refresh_failure_total metric with the metrics registry must succeed",
            );
        refresh_failure_total
    };
    pub static ref REFRESH_DURATION_SECONDS: Box<Histogram> = {
        let refresh_duration_seconds = Box::new(
            Histogram::with_opts(HistogramOpts {
                common_opts: prometheus::Opts::new(
                    "refresh_duration_seconds",
                    "Duration of successful blob refreshes, download through post-hooks",
                ),
                buckets: vec![],
            })
            .expect("Defining the refresh_duration_seconds metric must succeed"),
        );
        prometheus::default_registry()
            .register(refresh_duration_seconds.clone())
            .expect(
                "Registering the refresh_duration_seconds metric with the metrics registry must succeed",
            );
        refresh_duration_seconds
    };
}
