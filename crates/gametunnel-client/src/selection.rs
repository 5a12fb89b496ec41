//! Relay endpoint selection.

use crate::error::{ClientError, Result};
use gametunnel_core::CandidateEndpoint;

/// Pick the lowest-latency reachable candidate.
///
/// Ties keep catalog order.
///
/// # Errors
///
/// [`ClientError::NoneAvailable`] when no candidate has a finite latency.
pub fn select(candidates: &[CandidateEndpoint]) -> Result<&CandidateEndpoint> {
    rank(candidates)
        .into_iter()
        .next()
        .ok_or(ClientError::NoneAvailable)
}

/// Reachable candidates ordered by ascending latency (stable)
#[must_use]
pub fn rank(candidates: &[CandidateEndpoint]) -> Vec<&CandidateEndpoint> {
    let mut reachable: Vec<_> = candidates.iter().filter(|c| c.is_reachable()).collect();
    reachable.sort_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms));
    reachable
}

/// Catalog of candidate endpoints with selection helpers
#[derive(Debug, Clone, Default)]
pub struct EndpointSelector {
    endpoints: Vec<CandidateEndpoint>,
}

impl EndpointSelector {
    /// Create a selector over a catalog
    #[must_use]
    pub fn new(endpoints: Vec<CandidateEndpoint>) -> Self {
        Self { endpoints }
    }

    /// Add an endpoint, replacing any existing one with the same name
    pub fn add_endpoint(&mut self, endpoint: CandidateEndpoint) {
        match self.endpoints.iter_mut().find(|e| e.name == endpoint.name) {
            Some(existing) => *existing = endpoint,
            None => self.endpoints.push(endpoint),
        }
    }

    /// Remove an endpoint by name
    pub fn remove_endpoint(&mut self, name: &str) -> Option<CandidateEndpoint> {
        let index = self.endpoints.iter().position(|e| e.name == name)?;
        Some(self.endpoints.remove(index))
    }

    /// All endpoints in catalog order
    #[must_use]
    pub fn endpoints(&self) -> &[CandidateEndpoint] {
        &self.endpoints
    }

    /// Mutable access for probing
    pub fn endpoints_mut(&mut self) -> &mut [CandidateEndpoint] {
        &mut self.endpoints
    }

    /// Number of endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Reachable endpoints, best first
    #[must_use]
    pub fn rank(&self) -> Vec<&CandidateEndpoint> {
        rank(&self.endpoints)
    }

    /// Best reachable endpoint
    ///
    /// # Errors
    ///
    /// [`ClientError::NoneAvailable`] if every endpoint is unreachable.
    pub fn select_best(&self) -> Result<&CandidateEndpoint> {
        select(&self.endpoints)
    }

    /// Up to `count` reachable endpoints after the best one
    #[must_use]
    pub fn select_fallbacks(&self, count: usize) -> Vec<&CandidateEndpoint> {
        self.rank().into_iter().skip(1).take(count).collect()
    }

    /// Endpoint with the given name
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownEndpoint`] if the name is not in the catalog.
    pub fn find_by_name(&self, name: &str) -> Result<&CandidateEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ClientError::UnknownEndpoint(name.to_string()))
    }

    /// Endpoints in a region, catalog order
    #[must_use]
    pub fn find_by_region(&self, region: &str) -> Vec<&CandidateEndpoint> {
        self.endpoints.iter().filter(|e| e.region == region).collect()
    }
}
