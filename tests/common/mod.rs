//! Shared fixtures: a trust domain CA plus one local agent per workload.

#![allow(dead_code)]

use std::time::Duration;

use tempfile::TempDir;
use workload_mtls::config::{BackoffConfig, SourceConfig};
use workload_mtls::mtls::{IssuedSvid, LocalCa};
use workload_mtls::workload_api::LocalAgent;
use workload_mtls::{SpiffeId, TrustDomain, X509Source};

/// A trust domain with its CA and a scratch directory for agent sockets.
pub struct TestDomain {
    pub ca: LocalCa,
    dir: TempDir,
}

impl TestDomain {
    pub fn new(trust_domain: &str) -> Self {
        Self {
            ca: LocalCa::new(TrustDomain::new(trust_domain).unwrap()).unwrap(),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn issue(&self, id: &str) -> IssuedSvid {
        self.ca.issue_svid(&SpiffeId::parse(id).unwrap()).unwrap()
    }

    /// Start an agent that serves `id` and this domain's bundle.
    pub async fn agent_for(&self, name: &str, id: &str) -> LocalAgent {
        self.agent_with_bundles(name, id, &[&self.ca]).await
    }

    /// Start an agent that serves `id`, issued here, alongside the bundles
    /// of `cas` (which need not include this domain's own CA).
    pub async fn agent_with_bundles(&self, name: &str, id: &str, cas: &[&LocalCa]) -> LocalAgent {
        let agent = LocalAgent::bind(self.dir.path().join(format!("{name}.sock")))
            .await
            .unwrap();
        agent.publish_context(&[self.issue(id)], cas);
        agent
    }

    /// Start an agent for `id` and open a source against it.
    pub async fn workload(&self, name: &str, id: &str) -> (LocalAgent, X509Source) {
        self.workload_with_bundles(name, id, &[&self.ca]).await
    }

    /// [`TestDomain::workload`] with explicit bundles.
    pub async fn workload_with_bundles(
        &self,
        name: &str,
        id: &str,
        cas: &[&LocalCa],
    ) -> (LocalAgent, X509Source) {
        let agent = self.agent_with_bundles(name, id, cas).await;
        let source = X509Source::open(&fast_config(&agent)).await.unwrap();
        (agent, source)
    }
}

/// Source config pointed at `agent`, with millisecond backoff.
pub fn fast_config(agent: &LocalAgent) -> SourceConfig {
    SourceConfig {
        initial_fetch_timeout: Duration::from_secs(5),
        backoff: BackoffConfig {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..SourceConfig::with_endpoint(agent.endpoint())
    }
}
