//! Lab provisioning workflow.
//!
//! A strictly ordered four-step state machine owned by one caller:
//! identity first, then module, then parameters, then a terminal pending
//! state once the platform accepts the request. `back` steps to the
//! immediately preceding step only. Submission is atomic: one accepted
//! provisioning call moves the workflow to pending, and any failure leaves
//! it in the parameter step with the draft intact and nothing committed
//! upstream.

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::{self, normalize_course, CourseScope, FamilyTable, Principal};
use crate::config::WorkflowConfig;
use crate::error::{LabError, Result};
use crate::remote::{CloudCompute, CreateLabRequest, LabAutomation, ProvisionReceipt, SnapshotRef};

lazy_static! {
    static ref LAB_ID_REGEX: Regex = Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").unwrap();
    static ref DISK_NAME_REGEX: Regex = Regex::new(r"^[a-z0-9][a-z0-9-]{0,39}$").unwrap();
}

/// Highest data disk LUN the platform accepts.
const MAX_DISK_LUN: u8 = 63;

/// One provisionable lab module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSchema {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
}

/// Fixed module registry. Adding a module means adding a row here and a
/// parameter model for it.
pub const MODULES: &[ModuleSchema] = &[ModuleSchema {
    id: "windows-snapshot",
    title: "Windows from snapshot",
    description: "A set of identical Windows VMs restored from a published OS snapshot",
}];

pub fn module_by_id(id: &str) -> Option<&'static ModuleSchema> {
    MODULES.iter().find(|m| m.id == id)
}

/// VM sizes offered by the parameter step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum VmSize {
    #[default]
    #[serde(rename = "Standard_D2s_v5")]
    D2sV5,
    #[serde(rename = "Standard_D4s_v5")]
    D4sV5,
    #[serde(rename = "Standard_D8s_v5")]
    D8sV5,
    #[serde(rename = "Standard_B2ms")]
    B2ms,
}

impl VmSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::D2sV5 => "Standard_D2s_v5",
            Self::D4sV5 => "Standard_D4s_v5",
            Self::D8sV5 => "Standard_D8s_v5",
            Self::B2ms => "Standard_B2ms",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiskCaching {
    ReadWrite,
    ReadOnly,
    None,
}

/// Extra data disk attached to every VM in the lab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataDiskSpec {
    pub name: String,
    pub lun: u8,
    pub caching: DiskCaching,
    pub size_gb: u32,
}

/// Parameter draft for the windows-snapshot module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotModuleDraft {
    pub vm_count: u32,
    pub vm_size: VmSize,
    pub snapshot: Option<SnapshotRef>,
    /// Strictly-future check happens at submission; unset falls back to
    /// the configured default offset from the submission instant.
    pub expires_at: Option<DateTime<Utc>>,
    pub data_disks: Vec<DataDiskSpec>,
}

impl Default for SnapshotModuleDraft {
    fn default() -> Self {
        Self {
            vm_count: 1,
            vm_size: VmSize::default(),
            snapshot: None,
            expires_at: None,
            data_disks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LabIdentity {
    course_id: String,
    lab_id: String,
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    SelectIdentity,
    SelectModule {
        identity: LabIdentity,
    },
    ConfigureParameters {
        identity: LabIdentity,
        module: &'static ModuleSchema,
        draft: SnapshotModuleDraft,
    },
    Pending {
        identity: LabIdentity,
        receipt: ProvisionReceipt,
    },
}

/// Externally visible workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStep {
    SelectIdentity,
    SelectModule,
    ConfigureParameters,
    Pending,
}

impl std::fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelectIdentity => write!(f, "select_identity"),
            Self::SelectModule => write!(f, "select_module"),
            Self::ConfigureParameters => write!(f, "configure_parameters"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// Lowercase a free-typed lab name into a path-safe slug.
pub fn slugify_lab_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

pub struct ProvisioningWorkflow {
    automation: Arc<dyn LabAutomation>,
    compute: Arc<dyn CloudCompute>,
    scope: CourseScope,
    principal: Principal,
    default_expiry: Duration,
    draft_id: Uuid,
    state: State,
}

impl ProvisioningWorkflow {
    pub fn new(
        automation: Arc<dyn LabAutomation>,
        compute: Arc<dyn CloudCompute>,
        families: &FamilyTable,
        principal: Principal,
        config: &WorkflowConfig,
    ) -> Self {
        let scope = access::resolve(families, &principal);
        Self {
            automation,
            compute,
            scope,
            principal,
            default_expiry: Duration::minutes(config.default_expiry_minutes),
            draft_id: Uuid::new_v4(),
            state: State::SelectIdentity,
        }
    }

    pub fn step(&self) -> WorkflowStep {
        match &self.state {
            State::SelectIdentity => WorkflowStep::SelectIdentity,
            State::SelectModule { .. } => WorkflowStep::SelectModule,
            State::ConfigureParameters { .. } => WorkflowStep::ConfigureParameters,
            State::Pending { .. } => WorkflowStep::Pending,
        }
    }

    /// The acceptance receipt, once pending.
    pub fn receipt(&self) -> Option<&ProvisionReceipt> {
        match &self.state {
            State::Pending { receipt, .. } => Some(receipt),
            _ => None,
        }
    }

    /// Current parameter draft, while in the parameter step.
    pub fn draft(&self) -> Option<&SnapshotModuleDraft> {
        match &self.state {
            State::ConfigureParameters { draft, .. } => Some(draft),
            _ => None,
        }
    }

    fn wrong_step(&self, expected: WorkflowStep) -> LabError {
        LabError::validation(format!(
            "workflow is at step {}, expected {expected}",
            self.step()
        ))
    }

    /// Step one: pick the course and lab name. The course must lie inside
    /// the caller's scope; the name is slugged into the lab identifier.
    pub fn select_identity(&mut self, course: &str, lab_name: &str) -> Result<()> {
        if !matches!(self.state, State::SelectIdentity) {
            return Err(self.wrong_step(WorkflowStep::SelectIdentity));
        }

        let course_id = normalize_course(course);
        if course_id.is_empty() {
            return Err(LabError::validation_field("course", "course must not be empty"));
        }
        self.scope.require("provision_lab", &course_id)?;

        let lab_id = slugify_lab_name(lab_name);
        if !LAB_ID_REGEX.is_match(&lab_id) {
            return Err(LabError::validation_field(
                "lab_name",
                "lab name must reduce to letters, digits and hyphens (max 63 chars)",
            ));
        }

        self.state = State::SelectModule {
            identity: LabIdentity { course_id, lab_id },
        };
        Ok(())
    }

    /// Step two: pick a module from the registry.
    pub fn select_module(&mut self, module_id: &str) -> Result<()> {
        let State::SelectModule { identity } = &self.state else {
            return Err(self.wrong_step(WorkflowStep::SelectModule));
        };
        let module = module_by_id(module_id).ok_or_else(|| {
            LabError::validation_field("module", format!("unknown module {module_id}"))
        })?;

        self.state = State::ConfigureParameters {
            identity: identity.clone(),
            module,
            draft: SnapshotModuleDraft::default(),
        };
        Ok(())
    }

    /// Snapshot search for the parameter step. Results are the only way a
    /// snapshot enters the draft.
    pub async fn search_snapshots(&self, query: Option<&str>) -> Result<Vec<SnapshotRef>> {
        let State::ConfigureParameters { identity, .. } = &self.state else {
            return Err(self.wrong_step(WorkflowStep::ConfigureParameters));
        };
        self.compute
            .search_snapshots(&identity.course_id, query)
            .await
    }

    pub fn set_vm_count(&mut self, vm_count: u32) -> Result<()> {
        let draft = self.draft_mut()?;
        if vm_count < 1 {
            return Err(LabError::validation_field("vm_count", "at least one VM is required"));
        }
        draft.vm_count = vm_count;
        Ok(())
    }

    pub fn set_vm_size(&mut self, size: VmSize) -> Result<()> {
        self.draft_mut()?.vm_size = size;
        Ok(())
    }

    pub fn set_snapshot(&mut self, snapshot: SnapshotRef) -> Result<()> {
        self.draft_mut()?.snapshot = Some(snapshot);
        Ok(())
    }

    pub fn set_expires_at(&mut self, expires_at: DateTime<Utc>) -> Result<()> {
        self.draft_mut()?.expires_at = Some(expires_at);
        Ok(())
    }

    pub fn add_data_disk(&mut self, disk: DataDiskSpec) -> Result<()> {
        if !DISK_NAME_REGEX.is_match(&disk.name) {
            return Err(LabError::validation_field(
                "data_disks",
                format!("invalid disk name {:?}", disk.name),
            ));
        }
        if disk.lun > MAX_DISK_LUN {
            return Err(LabError::validation_field(
                "data_disks",
                format!("lun {} exceeds the maximum of {MAX_DISK_LUN}", disk.lun),
            ));
        }
        if disk.size_gb < 1 {
            return Err(LabError::validation_field(
                "data_disks",
                "disk size must be at least 1 GB",
            ));
        }
        let draft = self.draft_mut()?;
        if draft.data_disks.iter().any(|d| d.lun == disk.lun) {
            return Err(LabError::validation_field(
                "data_disks",
                format!("lun {} is already taken", disk.lun),
            ));
        }
        draft.data_disks.push(disk);
        Ok(())
    }

    pub fn clear_data_disks(&mut self) -> Result<()> {
        self.draft_mut()?.data_disks.clear();
        Ok(())
    }

    /// Step back to the immediately preceding step. The parameter draft is
    /// dropped when leaving the parameter step; the pending state is
    /// terminal.
    pub fn back(&mut self) -> Result<()> {
        self.state = match std::mem::replace(&mut self.state, State::SelectIdentity) {
            State::SelectIdentity => {
                return Err(LabError::validation("already at the first step"));
            }
            State::SelectModule { .. } => State::SelectIdentity,
            State::ConfigureParameters { identity, .. } => State::SelectModule { identity },
            State::Pending { identity, receipt } => {
                self.state = State::Pending { identity, receipt };
                return Err(LabError::validation("a pending workflow cannot step back"));
            }
        };
        Ok(())
    }

    /// Submit the draft. Expiry is evaluated against the submission
    /// instant and must be strictly in the future; an unset expiry falls
    /// back to the configured default offset. On success the workflow is
    /// pending and the receipt is returned; on failure the state and the
    /// draft are untouched.
    pub async fn submit(&mut self) -> Result<ProvisionReceipt> {
        let State::ConfigureParameters { identity, module, draft } = &self.state else {
            return Err(self.wrong_step(WorkflowStep::ConfigureParameters));
        };

        let now = Utc::now();
        let expires_at = draft.expires_at.unwrap_or(now + self.default_expiry);
        validate_expiry(expires_at, now)?;

        let snapshot = draft.snapshot.as_ref().ok_or_else(|| {
            LabError::validation_field("snapshot", "an OS snapshot must be selected")
        })?;

        let request = CreateLabRequest {
            course_id: identity.course_id.clone(),
            lab_id: identity.lab_id.clone(),
            module_id: module.id.to_string(),
            expires_at,
            params: json!({
                "vm_count": draft.vm_count,
                "vm_size": draft.vm_size.as_str(),
                "os_snapshot_id": snapshot.id.clone(),
                "data_disks": draft.data_disks.clone(),
            }),
        };

        info!(draft = %self.draft_id, course = %request.course_id, lab_id = %request.lab_id,
            module = %request.module_id, user = %self.principal.id, "Submitting lab request");

        match self.automation.create_lab(&request).await {
            Ok(receipt) => {
                info!(draft = %self.draft_id, lab_id = %request.lab_id,
                    tracking_url = receipt.tracking_url.as_deref().unwrap_or("-"),
                    "Lab request accepted");
                self.state = State::Pending {
                    identity: LabIdentity {
                        course_id: request.course_id,
                        lab_id: request.lab_id,
                    },
                    receipt: receipt.clone(),
                };
                Ok(receipt)
            }
            Err(err) => {
                warn!(draft = %self.draft_id, lab_id = %request.lab_id, error = %err,
                    "Lab request failed, draft retained");
                Err(err)
            }
        }
    }

    fn draft_mut(&mut self) -> Result<&mut SnapshotModuleDraft> {
        let step = self.step();
        match &mut self.state {
            State::ConfigureParameters { draft, .. } => Ok(draft),
            _ => Err(LabError::validation(format!(
                "workflow is at step {step}, expected configure_parameters"
            ))),
        }
    }
}

/// Expiry must lie strictly after the evaluation instant.
fn validate_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if expires_at <= now {
        return Err(LabError::validation_field(
            "expires_at",
            "expiry must be in the future",
        ));
    }
    Ok(())
}
