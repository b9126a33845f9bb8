// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::Duration;

use async_trait::async_trait;

/// A single liveness check against one address. Any error is a failed probe;
/// errors never propagate past the filter.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, addr: &str) -> anyhow::Result<()>;
}

/// Default probe: `GET http://<addr>/health`, healthy on any 2xx.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, addr: &str) -> anyhow::Result<()> {
        let url = format!("http://{addr}/health");
        self.client.get(&url).send().await?.error_for_status()?;
        Ok(())
    }
}
