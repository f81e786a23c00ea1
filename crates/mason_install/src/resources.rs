//! The engine's named resource set, built from a settings file or defaults.

use mason_core::CancelToken;
use mason_resources::{Resource, ResourceSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub downloads: ResourceSettings,
    pub web_requests: ResourceSettings,
    pub vfs: ResourceSettings,
    pub file_hashing: ResourceSettings,
    pub file_extractor: ResourceSettings,
    pub installer: ResourceSettings,
}

/// One governor per resource class. User intervention is always serial.
#[derive(Clone)]
pub struct EngineResources {
    pub downloads: Resource,
    pub web_requests: Resource,
    pub vfs: Resource,
    pub file_hashing: Resource,
    pub file_extractor: Resource,
    pub installer: Resource,
    pub user_intervention: Resource,
}

impl EngineResources {
    pub fn new(settings: &EngineSettings, token: CancelToken) -> Self {
        Self {
            downloads: Resource::new("Downloads", settings.downloads, token.clone()),
            web_requests: Resource::new("Web Requests", settings.web_requests, token.clone()),
            vfs: Resource::new("VFS", settings.vfs, token.clone()),
            file_hashing: Resource::new("File Hashing", settings.file_hashing, token.clone()),
            file_extractor: Resource::new(
                "File Extractor",
                settings.file_extractor,
                token.clone(),
            ),
            installer: Resource::new("Installer", settings.installer, token.clone()),
            user_intervention: Resource::new(
                "User Intervention",
                ResourceSettings {
                    max_tasks: 1,
                    max_throughput: 0,
                },
                token,
            ),
        }
    }

    pub fn status_reports(&self) -> Vec<mason_resources::StatusReport> {
        vec![
            self.downloads.status_report(),
            self.web_requests.status_report(),
            self.vfs.status_report(),
            self.file_hashing.status_report(),
            self.file_extractor.status_report(),
            self.installer.status_report(),
            self.user_intervention.status_report(),
        ]
    }
}
