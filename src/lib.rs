//! Core engine for cloud lab management: staff and trainee lab
//! directories, the guided provisioning workflow, per-user template VM
//! sessions, and VM power control. Hosts embed [`LabEngine`] and wire it to
//! the platform service over HTTP or to a scripted stand-in in tests.

pub mod access;
pub mod config;
pub mod directory;
pub mod error;
pub mod model;
pub mod power;
pub mod remote;
pub mod session;
pub mod workflow;

pub use error::{LabError, Result};

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::access::{FamilyTable, Principal};
use crate::config::Config;
use crate::directory::{DirectoryShared, LabDirectory};
use crate::power::PowerDispatcher;
use crate::remote::{CloudCompute, LabAutomation, PlatformClient};
use crate::session::{MemorySessionStore, SessionStore, TemplateVmSession};
use crate::workflow::ProvisioningWorkflow;

pub struct LabEngine {
    pub config: Config,
    pub compute: Arc<dyn CloudCompute>,
    pub automation: Arc<dyn LabAutomation>,
    pub families: FamilyTable,
    /// Directory cache, publication beacon and delete fences, shared by
    /// every directory handle this engine produces.
    pub directory_state: Arc<DirectoryShared>,
    pub session_store: Arc<dyn SessionStore>,
}

impl LabEngine {
    pub fn new(
        config: Config,
        compute: Arc<dyn CloudCompute>,
        automation: Arc<dyn LabAutomation>,
    ) -> Self {
        let families = config.access.family_table();
        Self {
            config,
            compute,
            automation,
            families,
            directory_state: Arc::new(DirectoryShared::new()),
            session_store: Arc::new(MemorySessionStore::new()),
        }
    }

    /// Engine talking to the platform service configured in `[remote]`.
    pub fn connect(config: Config) -> anyhow::Result<Self> {
        let client = Arc::new(PlatformClient::new(&config.remote)?);
        Ok(Self::new(config, client.clone(), client))
    }

    /// Replace the default in-memory session store.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = store;
        self
    }

    pub fn directory(&self) -> LabDirectory {
        LabDirectory::new(
            self.compute.clone(),
            self.automation.clone(),
            self.families.clone(),
            self.directory_state.clone(),
        )
    }

    /// A fresh provisioning workflow for the principal, starting at
    /// identity selection.
    pub fn workflow(&self, principal: Principal) -> ProvisioningWorkflow {
        ProvisioningWorkflow::new(
            self.automation.clone(),
            self.compute.clone(),
            &self.families,
            principal,
            &self.config.workflow,
        )
    }

    /// Open the principal's template VM session.
    pub async fn session(&self, principal: &Principal) -> TemplateVmSession {
        TemplateVmSession::open(
            self.compute.clone(),
            self.session_store.clone(),
            &principal.id,
            &self.config.session,
        )
        .await
    }

    pub fn power(&self) -> PowerDispatcher {
        PowerDispatcher::new(self.compute.clone())
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the given
/// level when set.
pub fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;
    use crate::remote::ScriptedPlatform;

    #[tokio::test]
    async fn test_engine_wires_components_from_one_platform() {
        let platform = Arc::new(ScriptedPlatform::new());
        let engine = LabEngine::new(Config::default(), platform.clone(), platform.clone());

        let principal = Principal {
            id: "dana".to_string(),
            role: Role::Admin,
            course_tag: "tichnut".to_string(),
            section: None,
        };

        let session = engine.session(&principal).await;
        assert_eq!(session.user_id(), "dana");

        let workflow = engine.workflow(principal);
        assert_eq!(workflow.step().to_string(), "select_identity");

        engine.power().start("vm-1").await.unwrap();
        assert_eq!(platform.call_count("power_start"), 1);
    }

    #[tokio::test]
    async fn test_directory_handles_share_state() {
        use crate::model::{Lab, TagMap, VmRecord};

        let platform = Arc::new(ScriptedPlatform::new());
        let engine = LabEngine::new(Config::default(), platform.clone(), platform.clone());
        platform.seed_lab(Lab {
            lab_id: "net01".to_string(),
            course_id: "tichnut-a".to_string(),
            tags: TagMap::new(),
            vms: vec![VmRecord {
                id: "vm-1".to_string(),
                name: "ws01".to_string(),
                size: None,
                private_ip: None,
                public_ip: None,
                power_state: "running".to_string(),
                provisioning_state: None,
                tags: TagMap::new(),
            }],
        });

        let trainee = Principal::new("dana", Role::Trainee, "tichnut-a");
        let commander = Principal::new("c-1", Role::Commander, "tichnut-a");

        let a = engine.directory();
        let b = engine.directory();
        a.list_for_trainee(&trainee).await.unwrap();
        b.list_for_trainee(&trainee).await.unwrap();
        assert_eq!(platform.call_count("list_published_labs"), 1);

        // A publish through one handle invalidates the cache behind the
        // other.
        b.publish(&commander, "tichnut-a", "net01").await.unwrap();
        let labs = a.list_for_trainee(&trainee).await.unwrap();
        assert_eq!(platform.call_count("list_published_labs"), 2);
        assert_eq!(labs.len(), 1);
    }
}
