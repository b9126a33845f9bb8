// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Health inferred from client-reported failures.
//!
//! Callers report failed requests through [`PassiveFilter::failed`]; an
//! address collecting `fails` failures inside the rolling window is excluded
//! from [`PassiveFilter::run`] results until the window elapses.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use serde::Deserialize;

use super::HealthFilter;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PassiveFilterConfig {
    /// Failures within `fail_timeout` that mark an address unhealthy.
    pub fails: usize,
    /// Rolling failure window, and how long an unhealthy mark lasts.
    pub fail_timeout: Duration,
}

impl Default for PassiveFilterConfig {
    fn default() -> Self {
        Self {
            fails: 3,
            fail_timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Default)]
struct AddrState {
    failures: VecDeque<Instant>,
    unhealthy_since: Option<Instant>,
}

/// Failure-count-driven health filter.
pub struct PassiveFilter {
    config: PassiveFilterConfig,
    state: Mutex<HashMap<String, AddrState>>,
}

impl PassiveFilter {
    pub fn new(config: PassiveFilterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failed client call against `addr`.
    pub fn failed(&self, addr: &str) {
        self.failed_at(addr, Instant::now());
    }

    fn failed_at(&self, addr: &str, now: Instant) {
        let mut state = self.state.lock();
        let entry = state.entry(addr.to_string()).or_default();

        let cutoff = now.checked_sub(self.config.fail_timeout);
        while let Some(first) = entry.failures.front() {
            if cutoff.map(|c| *first < c).unwrap_or(false) {
                entry.failures.pop_front();
            } else {
                break;
            }
        }

        entry.failures.push_back(now);
        while entry.failures.len() > self.config.fails {
            entry.failures.pop_front();
        }

        if entry.failures.len() >= self.config.fails {
            debug!("passive filter marked {addr} unhealthy");
            entry.unhealthy_since = Some(now);
        }
    }

    /// Returns `addrs` minus currently-unhealthy members. If that would
    /// leave nothing, the full input is returned instead: a caller must
    /// always have a candidate to try.
    pub fn run(&self, addrs: &BTreeSet<String>) -> BTreeSet<String> {
        self.run_at(addrs, Instant::now())
    }

    fn run_at(&self, addrs: &BTreeSet<String>, now: Instant) -> BTreeSet<String> {
        let mut state = self.state.lock();
        let mut healthy = addrs.clone();
        for addr in addrs {
            if let Some(entry) = state.get_mut(addr) {
                if let Some(since) = entry.unhealthy_since {
                    if now.duration_since(since) > self.config.fail_timeout {
                        entry.unhealthy_since = None;
                        entry.failures.clear();
                    } else {
                        healthy.remove(addr);
                    }
                }
            }
        }
        if healthy.is_empty() {
            addrs.clone()
        } else {
            healthy
        }
    }
}

#[async_trait]
impl HealthFilter for PassiveFilter {
    async fn run(&self, addrs: &BTreeSet<String>) -> BTreeSet<String> {
        PassiveFilter::run(self, addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn filter(fails: usize, fail_timeout: Duration) -> PassiveFilter {
        PassiveFilter::new(PassiveFilterConfig { fails, fail_timeout })
    }

    #[test]
    fn excluded_after_exactly_fails_failures() {
        let f = filter(3, Duration::from_secs(10));
        let set = addrs(&["x:80", "y:80"]);
        let base = Instant::now();

        f.failed_at("x:80", base);
        f.failed_at("x:80", base + Duration::from_secs(1));
        assert_eq!(f.run_at(&set, base + Duration::from_secs(1)), set);

        f.failed_at("x:80", base + Duration::from_secs(2));
        assert_eq!(
            f.run_at(&set, base + Duration::from_secs(2)),
            addrs(&["y:80"])
        );
    }

    #[test]
    fn old_failures_age_out_of_the_window() {
        let f = filter(3, Duration::from_secs(10));
        let set = addrs(&["x:80", "y:80"]);
        let base = Instant::now();

        f.failed_at("x:80", base);
        f.failed_at("x:80", base + Duration::from_secs(1));
        // Third failure lands after the first left the window.
        f.failed_at("x:80", base + Duration::from_secs(12));
        assert_eq!(f.run_at(&set, base + Duration::from_secs(12)), set);
    }

    #[test]
    fn reincluded_after_fail_timeout() {
        let f = filter(3, Duration::from_secs(10));
        let set = addrs(&["x:80", "y:80"]);
        let base = Instant::now();

        for i in 0..3 {
            f.failed_at("x:80", base + Duration::from_secs(i));
        }
        assert_eq!(
            f.run_at(&set, base + Duration::from_secs(3)),
            addrs(&["y:80"])
        );
        assert_eq!(f.run_at(&set, base + Duration::from_secs(14)), set);
    }

    #[test]
    fn never_returns_empty_set() {
        let f = filter(1, Duration::from_secs(10));
        let set = addrs(&["x:80", "y:80"]);
        let base = Instant::now();

        f.failed_at("x:80", base);
        f.failed_at("y:80", base);
        assert_eq!(f.run_at(&set, base + Duration::from_secs(1)), set);
    }
}
