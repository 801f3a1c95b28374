//! Status probe for load balancers and the `status` command.
//!
//! ```json
//! {"status": "DEGRADED",
//!  "components": {"memory": "HEALTHY", "gateway": "DEGRADED", "search": "HEALTHY"},
//!  "memory": {...}, "providers": {...}, "lexical": {...}, "write_queue": {...}}
//! ```
//!
//! The overall status is the worst component status. Memory follows its
//! own lifecycle; the gateway is `UNAVAILABLE` when no provider can take a
//! call and `DEGRADED` when some circuits are open; search is `DEGRADED`
//! while lexical scoring is disabled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use coordination::gateway::CircuitState;
use coordination::memory::MemoryHealth;
use coordination::search::LexicalStatus;
use coordination::{
    HybridSearchService, LlmGateway, MemoryOrchestrator, ProviderStatus, ServiceStatus,
};
use serde::Serialize;

use crate::memory_writer::{MemoryWriteQueue, QueueStats};
use crate::sanitize::{sanitize_message, DEFAULT_MAX_CHARS};

/// Per-component status.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub memory: ServiceStatus,
    pub gateway: ServiceStatus,
    pub search: ServiceStatus,
}

/// Full probe output.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: ServiceStatus,
    pub components: ComponentStatus,
    pub memory: MemoryHealth,
    pub providers: BTreeMap<String, ProviderStatus>,
    pub lexical: LexicalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_queue: Option<QueueStats>,
    /// Reachability of provider endpoints, when checked.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, bool>,
}

/// Gateway status from its providers' health.
pub fn gateway_status(providers: &BTreeMap<String, ProviderStatus>) -> ServiceStatus {
    let usable = providers
        .values()
        .filter(|p| p.available && p.circuit != CircuitState::Open)
        .count();
    if usable == 0 {
        ServiceStatus::Unavailable
    } else if usable < providers.len() {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Healthy
    }
}

pub fn search_status(lexical: &LexicalStatus) -> ServiceStatus {
    match lexical {
        LexicalStatus::Disabled { .. } => ServiceStatus::Degraded,
        LexicalStatus::Pending | LexicalStatus::Initializing | LexicalStatus::Enabled => {
            ServiceStatus::Healthy
        }
    }
}

/// Check an OpenAI-compatible endpoint with `GET {base_url}/models`.
pub async fn check_endpoint(client: &reqwest::Client, base_url: &str) -> bool {
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    match client
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

pub struct StatusProbe {
    memory: Arc<MemoryOrchestrator>,
    gateway: Arc<LlmGateway>,
    search: Arc<HybridSearchService>,
    writes: Option<MemoryWriteQueue>,
    endpoints: Vec<(String, String)>,
}

impl StatusProbe {
    pub fn new(
        memory: Arc<MemoryOrchestrator>,
        gateway: Arc<LlmGateway>,
        search: Arc<HybridSearchService>,
    ) -> Self {
        Self {
            memory,
            gateway,
            search,
            writes: None,
            endpoints: Vec::new(),
        }
    }

    pub fn with_write_queue(mut self, queue: MemoryWriteQueue) -> Self {
        self.writes = Some(queue);
        self
    }

    /// Also check these `(name, base_url)` endpoints on every report.
    pub fn with_endpoints(mut self, endpoints: Vec<(String, String)>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub async fn report(&self) -> StatusReport {
        let mut memory = self.memory.health();
        memory.error = memory
            .error
            .map(|e| sanitize_message(&e, DEFAULT_MAX_CHARS));
        let providers = self.gateway.health();
        let lexical = self.search.lexical_status().await;

        let components = ComponentStatus {
            memory: memory.status,
            gateway: gateway_status(&providers),
            search: search_status(&lexical),
        };
        let status = components
            .memory
            .max(components.gateway)
            .max(components.search);

        let mut endpoints = BTreeMap::new();
        if !self.endpoints.is_empty() {
            let client = reqwest::Client::new();
            for (name, url) in &self.endpoints {
                endpoints.insert(name.clone(), check_endpoint(&client, url).await);
            }
        }

        StatusReport {
            status,
            components,
            memory,
            providers,
            lexical,
            write_queue: self.writes.as_ref().map(MemoryWriteQueue::stats),
            endpoints,
        }
    }
}
