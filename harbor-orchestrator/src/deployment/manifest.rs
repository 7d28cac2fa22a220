//! The durable record of what one deployment created.

use chrono::{DateTime, Utc};
use harbor_protocol::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::id::DeploymentId;
use crate::error::ManifestError;
use crate::network::Ipv4Network;

/// Resource groups of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    CreatedContainers,
    CreatedNetworks,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::CreatedContainers => "created_containers",
            Category::CreatedNetworks => "created_networks",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One created resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Container {
        id: String,
        name: String,
    },
    Network {
        id: String,
        name: String,
        subnet: Ipv4Network,
    },
}

impl Resource {
    pub fn id(&self) -> &str {
        match self {
            Resource::Container { id, .. } | Resource::Network { id, .. } => id,
        }
    }
}

/// A resource and the label (the owning service's name) it is looked up by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub label: String,
    pub resource: Resource,
}

/// Created resources grouped by category, in insertion order within each category.
///
/// Concurrent writers share it behind a mutex; see `Deployment`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTable {
    #[serde(flatten)]
    entries: BTreeMap<Category, Vec<ResourceEntry>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, category: Category, label: impl Into<String>, resource: Resource) {
        self.entries.entry(category).or_default().push(ResourceEntry {
            label: label.into(),
            resource,
        });
    }

    pub fn entries(&self, category: Category) -> &[ResourceEntry] {
        self.entries.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    /// The single resource recorded under `label` in `category`.
    pub fn find(&self, category: Category, label: &str) -> Result<&Resource, ManifestError> {
        let mut matches = self
            .entries(category)
            .iter()
            .filter(|entry| entry.label == label);

        let first = matches.next().ok_or_else(|| ManifestError::NotFound {
            category,
            label: label.to_string(),
        })?;

        let others = matches.count();
        if others > 0 {
            return Err(ManifestError::Ambiguous {
                category,
                label: label.to_string(),
                count: others + 1,
            });
        }

        Ok(&first.resource)
    }

    /// The id of the container created for `service`.
    pub fn container_id(&self, service: &str) -> Result<&str, ManifestError> {
        match self.find(Category::CreatedContainers, service)? {
            Resource::Container { id, .. } => Ok(id),
            Resource::Network { .. } => Err(ManifestError::WrongKind {
                category: Category::CreatedContainers,
                label: service.to_string(),
            }),
        }
    }

    /// Name of the private network owned by `service`, if it created one.
    pub fn network_name(&self, service: &str) -> Option<&str> {
        match self.find(Category::CreatedNetworks, service) {
            Ok(Resource::Network { name, .. }) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// What gets persisted, once, at the end of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentManifest {
    id: DeploymentId,
    created_at: DateTime<Utc>,
    config: Config,
    resources: ResourceTable,
    outcome: Outcome,
}

impl DeploymentManifest {
    pub fn new(
        id: DeploymentId,
        created_at: DateTime<Utc>,
        config: Config,
        resources: ResourceTable,
        outcome: Outcome,
    ) -> Self {
        Self {
            id,
            created_at,
            config,
            resources,
            outcome,
        }
    }

    pub fn id(&self) -> DeploymentId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn summary(&self) -> DeploymentSummary {
        DeploymentSummary {
            id: self.id,
            created_at: self.created_at,
            outcome: self.outcome.clone(),
            services: self.config.services().keys().cloned().collect(),
        }
    }
}

/// The listing view of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentSummary {
    pub id: DeploymentId,
    pub created_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub services: Vec<String>,
}
