//! External collaborator contracts.
//!
//! The engine never talks to the cloud or the provisioning automation
//! directly. Everything goes through two narrow async traits: compute
//! queries and lifecycle commands on one side, lab provisioning and
//! teardown automation on the other. Production wires both to the platform
//! HTTP API via [`PlatformClient`]; tests script them with
//! [`ScriptedPlatform`].

mod http;
pub mod mock;

pub use http::PlatformClient;
pub use mock::ScriptedPlatform;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Lab, PowerState, TagMap, VmRecord};

/// Windows or Linux template base.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OsKind {
    Windows,
    Linux,
}

impl std::fmt::Display for OsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Windows => write!(f, "windows"),
            Self::Linux => write!(f, "linux"),
        }
    }
}

/// Local administrator credentials for a new template VM. Write-only: the
/// engine forwards them on create and never reads them back.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminCredential {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Request payload for creating a template VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemplateVm {
    pub os_kind: OsKind,
    /// Platform default image for the OS kind when absent.
    #[serde(default)]
    pub image: Option<String>,
    /// Platform default size when absent.
    #[serde(default)]
    pub size: Option<String>,
    pub credential: AdminCredential,
}

/// A template VM as the platform describes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub resource_group: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub power_state: String,
    #[serde(default)]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub tags: TagMap,
}

impl VmDescriptor {
    pub fn power(&self) -> PowerState {
        PowerState::parse(&self.power_state)
    }

    /// True once the platform reports provisioning complete.
    pub fn provisioned(&self) -> bool {
        self.provisioning_state
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("succeeded"))
            .unwrap_or(false)
    }
}

/// Template VM status response. A missing VM is not an error: the platform
/// answers `{"exists": false}` and the session manager resets on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TemplateVmStatus {
    Present(VmDescriptor),
    Absent { exists: bool },
}

impl TemplateVmStatus {
    pub fn absent() -> Self {
        TemplateVmStatus::Absent { exists: false }
    }

    pub fn descriptor(&self) -> Option<&VmDescriptor> {
        match self {
            TemplateVmStatus::Present(vm) => Some(vm),
            TemplateVmStatus::Absent { .. } => None,
        }
    }
}

/// A published snapshot a lab module can be built from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Acceptance receipt for asynchronous provisioning and teardown. The
/// request is tracked out-of-band; the engine only keeps the reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProvisionReceipt {
    #[serde(default, alias = "merge_request_url")]
    pub tracking_url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Fully validated lab provisioning request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateLabRequest {
    pub course_id: String,
    pub lab_id: String,
    pub module_id: String,
    pub expires_at: DateTime<Utc>,
    /// Module-specific parameters, shaped by the module schema.
    pub params: serde_json::Value,
}

/// Compute-side collaborator: lab queries, enrollment, publication tags,
/// power commands, and the per-user template VM lifecycle. Every method
/// either succeeds or surfaces the upstream failure unchanged; nothing here
/// retries.
#[async_trait]
pub trait CloudCompute: Send + Sync {
    /// Labs currently provisioned, optionally restricted to one course.
    async fn list_running_labs(&self, course: Option<&str>) -> Result<Vec<Lab>>;
    /// Published labs of one course, for the enrollment view.
    async fn list_published_labs(&self, course: &str) -> Result<Vec<Lab>>;
    /// Claim a free VM in the lab for the user. `None` means no capacity.
    async fn enroll(&self, course: &str, lab_id: &str, user_id: &str)
        -> Result<Option<VmRecord>>;
    async fn publish_lab(&self, course: &str, lab_id: &str) -> Result<()>;
    async fn unpublish_lab(&self, course: &str, lab_id: &str) -> Result<()>;
    /// Fire a start command. Returns on acceptance, not completion.
    async fn power_start(&self, vm_id: &str) -> Result<()>;
    /// Fire a stop command. Deallocation releases the billing reservation;
    /// a plain power-off keeps it.
    async fn power_stop(&self, vm_id: &str, deallocate: bool) -> Result<()>;
    /// Create the user's template VM. Idempotent upstream: if one already
    /// exists its descriptor comes back instead of an error.
    async fn create_template_vm(&self, user_id: &str, spec: &NewTemplateVm)
        -> Result<VmDescriptor>;
    async fn template_vm_status(&self, user_id: &str) -> Result<TemplateVmStatus>;
    /// Snapshot the user's template VM under the given name and tear the
    /// VM down. Returns on acceptance of the snapshot.
    async fn publish_snapshot(&self, user_id: &str, snapshot_name: &str) -> Result<SnapshotRef>;
    /// Tear the user's template VM down without snapshotting.
    async fn discard_template_vm(&self, user_id: &str) -> Result<()>;
    /// Snapshots available to the course, optionally filtered by name.
    async fn search_snapshots(&self, course: &str, query: Option<&str>)
        -> Result<Vec<SnapshotRef>>;
}

/// Automation-side collaborator: asynchronous lab provisioning and
/// teardown. Acceptance is the commit point; progress is tracked through
/// the returned receipt, never polled by the engine.
#[async_trait]
pub trait LabAutomation: Send + Sync {
    async fn create_lab(&self, request: &CreateLabRequest) -> Result<ProvisionReceipt>;
    async fn delete_lab(&self, course: &str, lab_id: &str) -> Result<ProvisionReceipt>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_vm_status_decodes_soft_not_found() {
        let status: TemplateVmStatus = serde_json::from_str(r#"{"exists": false}"#).unwrap();
        assert_eq!(status, TemplateVmStatus::absent());
        assert!(status.descriptor().is_none());
    }

    #[test]
    fn test_template_vm_status_decodes_descriptor() {
        let status: TemplateVmStatus = serde_json::from_str(
            r#"{
                "id": "/subscriptions/s/vm/tl-dana-4821",
                "name": "tl-dana-4821",
                "power_state": "PowerState/running",
                "provisioning_state": "Succeeded"
            }"#,
        )
        .unwrap();
        let vm = status.descriptor().unwrap();
        assert_eq!(vm.name, "tl-dana-4821");
        assert_eq!(vm.power(), PowerState::Running);
        assert!(vm.provisioned());
    }

    #[test]
    fn test_provision_receipt_accepts_legacy_field_name() {
        let receipt: ProvisionReceipt =
            serde_json::from_str(r#"{"merge_request_url": "https://git/mr/7", "branch": "lab/x"}"#)
                .unwrap();
        assert_eq!(receipt.tracking_url.as_deref(), Some("https://git/mr/7"));
        assert_eq!(receipt.branch.as_deref(), Some("lab/x"));
    }

    #[test]
    fn test_admin_credential_debug_redacts_password() {
        let cred = AdminCredential {
            username: "labadmin".into(),
            password: "hunter2".into(),
        };
        let dump = format!("{cred:?}");
        assert!(dump.contains("labadmin"));
        assert!(!dump.contains("hunter2"));
        assert!(dump.contains("<redacted>"));
    }
}
