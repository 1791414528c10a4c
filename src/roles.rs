//! Role-to-folder access filtering.
//!
//! Maps a caller's roles onto the set of folder tags their context may
//! be assembled from. The mapping itself lives in an external
//! collaborator ([`RoleMappingSource`]); this module only interprets it.
//! Filtering elsewhere in the pipeline is exact folder-tag membership,
//! never content-based.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{FolderScope, PUBLIC_TAG, WILDCARD_TOKEN};

/// One role's grant: folder tags, or the wildcard token for full access.
#[derive(Debug, Clone)]
pub struct RoleMapping {
    pub role: String,
    pub folders: Vec<String>,
}

/// Read-only mapping collaborator.
#[async_trait]
pub trait RoleMappingSource: Send + Sync {
    async fn all_mappings(&self) -> Result<Vec<RoleMapping>>;
}

/// Mapping source backed by the `[roles]` table of the config file.
pub struct ConfigRoleMappings {
    mappings: Vec<RoleMapping>,
}

impl ConfigRoleMappings {
    pub fn new(roles: &HashMap<String, Vec<String>>) -> Self {
        let mappings = roles
            .iter()
            .map(|(role, folders)| RoleMapping {
                role: role.clone(),
                folders: folders.clone(),
            })
            .collect();
        Self { mappings }
    }
}

#[async_trait]
impl RoleMappingSource for ConfigRoleMappings {
    async fn all_mappings(&self) -> Result<Vec<RoleMapping>> {
        Ok(self.mappings.clone())
    }
}

/// Resolves a set of roles to a [`FolderScope`].
pub struct RoleFilter {
    source: Arc<dyn RoleMappingSource>,
}

impl RoleFilter {
    pub fn new(source: Arc<dyn RoleMappingSource>) -> Self {
        Self { source }
    }

    /// Resolve roles to allowed folders. The `public` tag is always
    /// included; a wildcard grant on any matched role short-circuits to
    /// full access. Role names are compared case-insensitively.
    ///
    /// A mapping-source failure degrades to public-only access rather
    /// than propagating, so a broken collaborator can never widen or
    /// hard-fail a request.
    pub async fn folders_for_roles(&self, roles: &[String]) -> FolderScope {
        let mappings = match self.source.all_mappings().await {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(error = %err, "role mapping lookup failed; limiting to public");
                return public_only();
            }
        };

        let wanted: BTreeSet<String> = roles.iter().map(|r| r.trim().to_lowercase()).collect();
        let mut folders: BTreeSet<String> = BTreeSet::new();
        folders.insert(PUBLIC_TAG.to_string());

        for mapping in &mappings {
            if !wanted.contains(&mapping.role.trim().to_lowercase()) {
                continue;
            }
            for folder in &mapping.folders {
                let folder = folder.trim();
                if folder == WILDCARD_TOKEN {
                    return FolderScope::Wildcard;
                }
                if !folder.is_empty() {
                    folders.insert(folder.to_lowercase());
                }
            }
        }

        FolderScope::Folders(folders)
    }
}

fn public_only() -> FolderScope {
    FolderScope::Folders(BTreeSet::from([PUBLIC_TAG.to_string()]))
}
