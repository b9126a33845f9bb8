// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Scheduler collaboration.
//!
//! The peer-transfer scheduler is an external process; the origin core only
//! notifies it when a blob becomes available and relays operational reload
//! requests. Hook failures never undo a commit — the cache entry is already
//! durable when hooks fire.

use std::sync::Arc;

use async_trait::async_trait;

use crate::digest::Digest;

/// Post-commit hook run by the refresher, in registration order, once the
/// blob is committed to the cache.
#[async_trait]
pub trait BlobReadyHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_blob_ready(&self, digest: &Digest) -> anyhow::Result<()>;
}

/// Client for the external scheduler process.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Announces a freshly cached blob for seeding.
    async fn notify_blob_ready(&self, digest: &Digest) -> anyhow::Result<()>;

    /// Applies a new scheduler configuration, as forwarded from the host's
    /// operational endpoint.
    async fn reload(&self, config: serde_json::Value) -> anyhow::Result<()>;
}

/// Adapts a [`SchedulerClient`] into a refresher post-hook.
pub struct SchedulerHook {
    client: Arc<dyn SchedulerClient>,
}

impl SchedulerHook {
    pub fn new(client: Arc<dyn SchedulerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobReadyHook for SchedulerHook {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn on_blob_ready(&self, digest: &Digest) -> anyhow::Result<()> {
        self.client.notify_blob_ready(digest).await
    }
}
