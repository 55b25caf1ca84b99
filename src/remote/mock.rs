//! Scriptable in-memory platform for tests.
//!
//! Implements both collaborator traits over plain in-process state. Tests
//! seed labs and snapshots, queue template VM status responses, inject
//! per-operation failures, and assert on recorded calls. The scripted
//! behavior follows the real platform: enrollment claims a free VM by
//! writing the assignment tag, publication tags every VM in the lab, and a
//! second create for the same user returns the existing template VM.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::error::{LabError, Result};
use crate::model::{tag_lookup, Lab, VmRecord, ASSIGNED_USER_KEYS};

use super::{
    CloudCompute, CreateLabRequest, LabAutomation, NewTemplateVm, ProvisionReceipt, SnapshotRef,
    TemplateVmStatus, VmDescriptor,
};

#[derive(Default)]
struct ScriptState {
    labs: Vec<Lab>,
    snapshots: Vec<SnapshotRef>,
    template_vm: Option<VmDescriptor>,
    status_script: VecDeque<TemplateVmStatus>,
    failures: HashMap<String, String>,
    calls: Vec<String>,
    power_commands: Vec<(String, Option<bool>)>,
    create_requests: Vec<CreateLabRequest>,
}

/// In-memory stand-in for the platform service.
#[derive(Default)]
pub struct ScriptedPlatform {
    state: Mutex<ScriptState>,
}

impl ScriptedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_lab(&self, lab: Lab) {
        self.state.lock().labs.push(lab);
    }

    pub fn seed_snapshot(&self, snapshot: SnapshotRef) {
        self.state.lock().snapshots.push(snapshot);
    }

    pub fn set_template_vm(&self, vm: Option<VmDescriptor>) {
        self.state.lock().template_vm = vm;
    }

    /// Queue a status response. Queued responses are served in order before
    /// the live template VM state is consulted.
    pub fn push_status(&self, status: TemplateVmStatus) {
        self.state.lock().status_script.push_back(status);
    }

    /// Make every subsequent call of the operation fail with the message.
    pub fn fail_on(&self, operation: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, operation: &str) {
        self.state.lock().failures.remove(operation);
    }

    /// Simulate the platform completing an accepted teardown.
    pub fn remove_lab(&self, course: &str, lab_id: &str) {
        self.state
            .lock()
            .labs
            .retain(|lab| !(lab.course_id == course && lab.lab_id == lab_id));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Power commands received so far as (vm id, deallocate). `None` marks
    /// a start command.
    pub fn power_commands(&self) -> Vec<(String, Option<bool>)> {
        self.state.lock().power_commands.clone()
    }

    /// The most recent provisioning request, if any.
    pub fn last_create_request(&self) -> Option<CreateLabRequest> {
        self.state.lock().create_requests.last().cloned()
    }

    fn enter(&self, operation: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(operation.to_string());
        match state.failures.get(operation) {
            Some(message) => Err(LabError::upstream(operation, message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CloudCompute for ScriptedPlatform {
    async fn list_running_labs(&self, course: Option<&str>) -> Result<Vec<Lab>> {
        self.enter("list_running_labs")?;
        let state = self.state.lock();
        Ok(state
            .labs
            .iter()
            .filter(|lab| course.map(|c| lab.course_id == c).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_published_labs(&self, course: &str) -> Result<Vec<Lab>> {
        self.enter("list_published_labs")?;
        let state = self.state.lock();
        Ok(state
            .labs
            .iter()
            .filter(|lab| lab.course_id == course && lab.published())
            .cloned()
            .collect())
    }

    async fn enroll(
        &self,
        course: &str,
        lab_id: &str,
        user_id: &str,
    ) -> Result<Option<VmRecord>> {
        self.enter("enroll")?;
        let mut state = self.state.lock();
        let lab = state
            .labs
            .iter_mut()
            .find(|lab| lab.course_id == course && lab.lab_id == lab_id)
            .ok_or_else(|| LabError::upstream("enroll", format!("404 - lab {lab_id} not found")))?;

        if let Some(vm) = lab.vms.iter().find(|vm| vm.assigned_user() == Some(user_id)) {
            return Ok(Some(vm.clone()));
        }
        let free = lab
            .vms
            .iter_mut()
            .find(|vm| tag_lookup(&vm.tags, ASSIGNED_USER_KEYS).is_none());
        match free {
            Some(vm) => {
                vm.tags
                    .insert("AssignedUser".to_string(), user_id.to_string());
                Ok(Some(vm.clone()))
            }
            None => Ok(None),
        }
    }

    async fn publish_lab(&self, course: &str, lab_id: &str) -> Result<()> {
        self.enter("publish_lab")?;
        self.set_published("publish_lab", course, lab_id, true)
    }

    async fn unpublish_lab(&self, course: &str, lab_id: &str) -> Result<()> {
        self.enter("unpublish_lab")?;
        self.set_published("unpublish_lab", course, lab_id, false)
    }

    async fn power_start(&self, vm_id: &str) -> Result<()> {
        self.enter("power_start")?;
        self.state
            .lock()
            .power_commands
            .push((vm_id.to_string(), None));
        Ok(())
    }

    async fn power_stop(&self, vm_id: &str, deallocate: bool) -> Result<()> {
        self.enter("power_stop")?;
        self.state
            .lock()
            .power_commands
            .push((vm_id.to_string(), Some(deallocate)));
        Ok(())
    }

    async fn create_template_vm(
        &self,
        user_id: &str,
        spec: &NewTemplateVm,
    ) -> Result<VmDescriptor> {
        self.enter("create_template_vm")?;
        let mut state = self.state.lock();
        if let Some(existing) = &state.template_vm {
            return Ok(existing.clone());
        }
        let vm = VmDescriptor {
            id: format!("vm-tmpl-{user_id}"),
            name: format!("tmpl-{user_id}"),
            resource_group: None,
            size: spec.size.clone(),
            private_ip: None,
            public_ip: None,
            power_state: "PowerState/starting".to_string(),
            provisioning_state: Some("Creating".to_string()),
            tags: Default::default(),
        };
        state.template_vm = Some(vm.clone());
        Ok(vm)
    }

    async fn template_vm_status(&self, _user_id: &str) -> Result<TemplateVmStatus> {
        self.enter("template_vm_status")?;
        let mut state = self.state.lock();
        if let Some(scripted) = state.status_script.pop_front() {
            return Ok(scripted);
        }
        Ok(match &state.template_vm {
            Some(vm) => TemplateVmStatus::Present(vm.clone()),
            None => TemplateVmStatus::absent(),
        })
    }

    async fn publish_snapshot(&self, _user_id: &str, snapshot_name: &str) -> Result<SnapshotRef> {
        self.enter("publish_snapshot")?;
        let mut state = self.state.lock();
        if state.template_vm.is_none() {
            return Err(LabError::upstream(
                "publish_snapshot",
                "404 - no template VM to snapshot",
            ));
        }
        state.template_vm = None;
        Ok(SnapshotRef {
            id: format!("snap-{snapshot_name}"),
            name: snapshot_name.to_string(),
            course: None,
            created_at: None,
        })
    }

    async fn discard_template_vm(&self, _user_id: &str) -> Result<()> {
        self.enter("discard_template_vm")?;
        self.state.lock().template_vm = None;
        Ok(())
    }

    async fn search_snapshots(
        &self,
        course: &str,
        query: Option<&str>,
    ) -> Result<Vec<SnapshotRef>> {
        self.enter("search_snapshots")?;
        let state = self.state.lock();
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.course.as_deref().map(|c| c == course).unwrap_or(true))
            .filter(|s| query.map(|q| s.name.contains(q)).unwrap_or(true))
            .cloned()
            .collect())
    }
}

impl ScriptedPlatform {
    fn set_published(&self, operation: &str, course: &str, lab_id: &str, on: bool) -> Result<()> {
        let mut state = self.state.lock();
        let lab = state
            .labs
            .iter_mut()
            .find(|lab| lab.course_id == course && lab.lab_id == lab_id)
            .ok_or_else(|| {
                LabError::upstream(operation, format!("404 - lab {lab_id} not found"))
            })?;
        for vm in &mut lab.vms {
            if on {
                vm.tags.insert("Published".to_string(), "true".to_string());
            } else {
                vm.tags.remove("Published");
                vm.tags.remove("published");
                vm.tags.remove("IsPublished");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LabAutomation for ScriptedPlatform {
    async fn create_lab(&self, request: &CreateLabRequest) -> Result<ProvisionReceipt> {
        self.enter("create_lab")?;
        self.state.lock().create_requests.push(request.clone());
        Ok(ProvisionReceipt {
            tracking_url: Some(format!(
                "https://git.example.net/labs/-/merge_requests/{}",
                request.lab_id
            )),
            branch: Some(format!("lab/{}/{}", request.course_id, request.lab_id)),
        })
    }

    async fn delete_lab(&self, course: &str, lab_id: &str) -> Result<ProvisionReceipt> {
        self.enter("delete_lab")?;
        Ok(ProvisionReceipt {
            tracking_url: Some(format!(
                "https://git.example.net/labs/-/merge_requests/delete-{lab_id}"
            )),
            branch: Some(format!("delete/{course}/{lab_id}")),
        })
    }
}
