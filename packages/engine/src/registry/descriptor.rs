// packages/engine/src/registry/descriptor.rs
//! Agent descriptors
//!
//! A descriptor is replaced as a whole on re-registration and never
//! mutated in place, so the registry hands out `Arc<AgentDescriptor>`.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Ordered dependability classification (`low < standard < high`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReliabilityTier {
    Low,
    #[default]
    Standard,
    High,
}

impl fmt::Display for ReliabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReliabilityTier::Low => "low",
            ReliabilityTier::Standard => "standard",
            ReliabilityTier::High => "high",
        };
        f.write_str(name)
    }
}

/// A registered worker agent ("cyborg")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique identifier
    pub id: String,

    /// Capability tags; a task matches when its requirements are a subset
    pub capabilities: BTreeSet<String>,

    /// Declared latency budget in milliseconds
    #[serde(default)]
    pub latency_budget_ms: u64,

    /// Declared maximum concurrent streams
    #[serde(default = "default_max_streams")]
    pub max_concurrent_streams: u32,

    #[serde(default)]
    pub reliability_tier: ReliabilityTier,

    /// Free-form tags, not used for matching
    #[serde(default)]
    pub tags: Vec<String>,

    /// Opaque deployment reference
    pub deployment_ref: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_max_streams() -> u32 {
    1
}

impl AgentDescriptor {
    pub fn new<I, S>(id: impl Into<String>, capabilities: I, deployment_ref: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            latency_budget_ms: 0,
            max_concurrent_streams: default_max_streams(),
            reliability_tier: ReliabilityTier::default(),
            tags: Vec::new(),
            deployment_ref: deployment_ref.into(),
            display_name: None,
            category: None,
            description: None,
        }
    }

    pub fn with_tier(mut self, tier: ReliabilityTier) -> Self {
        self.reliability_tier = tier;
        self
    }

    pub fn with_latency_budget(mut self, budget: Duration) -> Self {
        self.latency_budget_ms = budget.as_millis() as u64;
        self
    }

    pub fn with_max_streams(mut self, streams: u32) -> Self {
        self.max_concurrent_streams = streams;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }

    /// True when every required capability is declared by this agent
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Required fields: identifier, at least one capability, deployment reference
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| EngineError::InvalidDescriptor {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("identifier cannot be empty"));
        }
        if self.capabilities.is_empty() {
            return Err(invalid("capability set cannot be empty"));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(invalid("capability tags cannot be blank"));
        }
        if self.deployment_ref.trim().is_empty() {
            return Err(invalid("deployment reference cannot be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tier_ordering() {
        assert!(ReliabilityTier::Low < ReliabilityTier::Standard);
        assert!(ReliabilityTier::Standard < ReliabilityTier::High);
        assert_eq!(ReliabilityTier::default(), ReliabilityTier::Standard);
    }

    #[test]
    fn test_superset_match() {
        let agent = AgentDescriptor::new("ocr-1", ["a", "b", "c"], "deploy/ocr");
        assert!(agent.covers(&caps(&["a", "b"])));
        assert!(agent.covers(&caps(&[])));
        assert!(!agent.covers(&caps(&["a", "d"])));
    }

    #[test]
    fn test_validation() {
        assert!(AgentDescriptor::new("x", ["a"], "ref").validate().is_ok());

        let empty_id = AgentDescriptor::new("", ["a"], "ref");
        assert!(matches!(empty_id.validate(), Err(EngineError::InvalidDescriptor { .. })));

        let no_caps = AgentDescriptor::new("x", Vec::<String>::new(), "ref");
        assert!(no_caps.validate().is_err());

        let no_deploy = AgentDescriptor::new("x", ["a"], " ");
        assert!(no_deploy.validate().is_err());
    }

    #[test]
    fn test_yaml_record() {
        let yaml = r#"
id: summarizer
capabilities: [text.summarize, lang.en]
latency_budget_ms: 250
max_concurrent_streams: 4
reliability_tier: high
tags: [nlp]
deployment_ref: k8s://agents/summarizer
"#;
        let agent: AgentDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(agent.reliability_tier, ReliabilityTier::High);
        assert_eq!(agent.latency_budget(), Duration::from_millis(250));
        assert!(agent.capabilities.contains("lang.en"));
        assert!(agent.validate().is_ok());
    }
}
