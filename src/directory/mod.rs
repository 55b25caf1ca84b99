//! Lab directory service.
//!
//! Two views over the platform's lab inventory. Staff see every running
//! lab inside their resolved scope with free-text, course, and address
//! filters. Trainees see only the published labs of their own course plus
//! the VM assigned to them. Publication changes bump a shared beacon so
//! cached trainee listings refetch on the next read instead of serving a
//! stale view. Accepted teardowns fence the lab against new enrollments
//! until a refresh no longer reports it.

use arc_swap::ArcSwap;
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use chrono::{DateTime, Utc};

use crate::access::{self, normalize_course, CourseScope, FamilyTable, Principal};
use crate::error::{LabError, Result};
use crate::model::{Lab, VmRecord};
use crate::remote::{CloudCompute, LabAutomation, ProvisionReceipt};

/// Optional restrictions on the staff listing. All filters are narrowing.
#[derive(Debug, Clone, Default)]
pub struct StaffFilters {
    /// Restrict to one course. Must lie inside the caller's scope.
    pub course: Option<String>,
    /// Display-only narrowing to one family section.
    pub section: Option<String>,
    /// Case-insensitive substring match on the lab identifier.
    pub text: Option<String>,
    /// Substring match on any VM address in the lab.
    pub address: Option<String>,
}

/// One published lab as a trainee sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraineeLab {
    pub lab_id: String,
    pub course_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// The caller's VM in this lab, once enrolled.
    pub assigned_vm: Option<VmRecord>,
}

/// Outcome of an enrollment attempt against a published lab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollOutcome {
    Assigned(VmRecord),
    /// Every VM in the lab is already claimed.
    Full,
}

struct CourseCache {
    beacon: u64,
    labs: Vec<Lab>,
}

/// State shared by every directory handle minted from one engine.
pub struct DirectoryShared {
    /// Bumped on every publication change; cached listings older than the
    /// current value are refetched.
    beacon: AtomicU64,
    cache: ArcSwap<HashMap<String, Arc<CourseCache>>>,
    /// Labs with an accepted teardown, keyed (course, lab id) normalized.
    pending_delete: DashSet<(String, String)>,
}

impl DirectoryShared {
    pub fn new() -> Self {
        Self {
            beacon: AtomicU64::new(0),
            cache: ArcSwap::from_pointee(HashMap::new()),
            pending_delete: DashSet::new(),
        }
    }
}

impl Default for DirectoryShared {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LabDirectory {
    compute: Arc<dyn CloudCompute>,
    automation: Arc<dyn LabAutomation>,
    families: FamilyTable,
    shared: Arc<DirectoryShared>,
}

impl LabDirectory {
    pub fn new(
        compute: Arc<dyn CloudCompute>,
        automation: Arc<dyn LabAutomation>,
        families: FamilyTable,
        shared: Arc<DirectoryShared>,
    ) -> Self {
        Self {
            compute,
            automation,
            families,
            shared,
        }
    }

    /// Running labs inside the caller's scope, filtered. Scope violations
    /// are rejected before any platform call.
    pub async fn list_for_staff(
        &self,
        principal: &Principal,
        filters: &StaffFilters,
    ) -> Result<Vec<Lab>> {
        let scope = access::resolve(&self.families, principal);
        if scope.is_empty() {
            return Err(LabError::access_denied(
                "list_labs",
                format!("role {} holds no management scope", principal.role),
            ));
        }

        let scope = match &filters.section {
            Some(section) => {
                let narrowed = scope.narrow_to_section(section, &self.families);
                if narrowed.is_empty() {
                    return Ok(Vec::new());
                }
                narrowed
            }
            None => scope,
        };

        let fetch_course = match &filters.course {
            Some(raw) => {
                let course = normalize_course(raw);
                scope.require("list_labs", &course)?;
                Some(course)
            }
            None => match &scope {
                CourseScope::Courses(set) if set.len() == 1 => set.iter().next().cloned(),
                _ => None,
            },
        };

        let labs = self
            .compute
            .list_running_labs(fetch_course.as_deref())
            .await?;
        let labs: Vec<Lab> = labs
            .into_iter()
            .filter(|lab| scope.allows(&lab.course_id))
            .collect();

        self.release_fences(&labs, |course| match &fetch_course {
            Some(c) => course == c,
            None => scope.allows(course),
        });

        let mut labs: Vec<Lab> = labs
            .into_iter()
            .filter(|lab| match &filters.text {
                Some(text) => lab.lab_id.to_lowercase().contains(&text.to_lowercase()),
                None => true,
            })
            .filter(|lab| match &filters.address {
                Some(addr) => lab.vms.iter().any(|vm| {
                    vm.private_ip.as_deref().map(|ip| ip.contains(addr)).unwrap_or(false)
                        || vm.public_ip.as_deref().map(|ip| ip.contains(addr)).unwrap_or(false)
                }),
                None => true,
            })
            .collect();
        labs.sort_by(|a, b| {
            (a.course_id.as_str(), a.lab_id.as_str()).cmp(&(b.course_id.as_str(), b.lab_id.as_str()))
        });
        Ok(labs)
    }

    /// Published labs of the caller's own course, with the caller's
    /// assigned VM hydrated. Served from cache until a publication change
    /// moves the beacon.
    pub async fn list_for_trainee(&self, principal: &Principal) -> Result<Vec<TraineeLab>> {
        let course = principal.normalized_course();
        if course.is_empty() {
            return Ok(Vec::new());
        }

        let labs = self.fetch_published(&course).await?;
        Ok(labs
            .iter()
            .map(|lab| TraineeLab {
                lab_id: lab.lab_id.clone(),
                course_id: lab.course_id.clone(),
                expires_at: lab.expires_at(),
                assigned_vm: lab.vm_assigned_to(&principal.id).cloned(),
            })
            .collect())
    }

    /// Claim a VM in a published lab of the caller's course. Idempotent:
    /// an existing assignment is returned without a platform call.
    pub async fn enroll(&self, principal: &Principal, lab_id: &str) -> Result<EnrollOutcome> {
        let course = principal.normalized_course();
        if course.is_empty() {
            return Err(LabError::access_denied(
                "enroll",
                "caller carries no course",
            ));
        }

        let fence_key = (course.clone(), lab_id.to_string());
        if self.shared.pending_delete.contains(&fence_key) {
            return Err(LabError::stale(
                "enroll",
                format!("lab {lab_id} has an accepted teardown"),
            ));
        }

        let labs = self.fetch_published(&course).await?;
        let lab = labs
            .iter()
            .find(|lab| lab.lab_id == lab_id)
            .ok_or_else(|| {
                LabError::stale(
                    "enroll",
                    format!("lab {lab_id} is not published for course {course}"),
                )
            })?;

        if let Some(vm) = lab.vm_assigned_to(&principal.id) {
            debug!(user = %principal.id, lab_id = %lab_id, "Enrollment already assigned");
            return Ok(EnrollOutcome::Assigned(vm.clone()));
        }

        match self.compute.enroll(&course, lab_id, &principal.id).await? {
            Some(vm) => {
                info!(user = %principal.id, course = %course, lab_id = %lab_id, vm = %vm.name,
                    "Enrollment assigned");
                self.invalidate_course(&course);
                Ok(EnrollOutcome::Assigned(vm))
            }
            None => {
                info!(user = %principal.id, course = %course, lab_id = %lab_id,
                    "Enrollment rejected, lab is full");
                Ok(EnrollOutcome::Full)
            }
        }
    }

    /// Open the lab for trainee enrollment. The platform tags every VM in
    /// the lab; the flag is re-derived from those tags on every read.
    pub async fn publish(&self, principal: &Principal, course: &str, lab_id: &str) -> Result<()> {
        self.set_published(principal, course, lab_id, true).await
    }

    /// Withdraw the lab from the trainee view.
    pub async fn unpublish(&self, principal: &Principal, course: &str, lab_id: &str) -> Result<()> {
        self.set_published(principal, course, lab_id, false).await
    }

    async fn set_published(
        &self,
        principal: &Principal,
        course: &str,
        lab_id: &str,
        on: bool,
    ) -> Result<()> {
        let operation = if on { "publish_lab" } else { "unpublish_lab" };
        let course = normalize_course(course);
        let scope = access::resolve(&self.families, principal);
        scope.require(operation, &course)?;

        if on {
            self.compute.publish_lab(&course, lab_id).await?;
        } else {
            self.compute.unpublish_lab(&course, lab_id).await?;
        }
        let beacon = self.shared.beacon.fetch_add(1, Ordering::SeqCst) + 1;
        info!(course = %course, lab_id = %lab_id, published = on, beacon = beacon,
            "Lab publication changed");
        Ok(())
    }

    /// Request asynchronous teardown of the lab. The request is accepted,
    /// not completed: the lab stays visible until the platform finishes,
    /// but new enrollments are fenced off immediately.
    pub async fn request_delete(
        &self,
        principal: &Principal,
        course: &str,
        lab_id: &str,
    ) -> Result<ProvisionReceipt> {
        let course = normalize_course(course);
        let scope = access::resolve(&self.families, principal);
        scope.require("delete_lab", &course)?;

        let receipt = self.automation.delete_lab(&course, lab_id).await?;
        self.shared
            .pending_delete
            .insert((course.clone(), lab_id.to_string()));
        info!(course = %course, lab_id = %lab_id,
            tracking_url = receipt.tracking_url.as_deref().unwrap_or("-"),
            "Lab teardown accepted");
        Ok(receipt)
    }

    async fn fetch_published(&self, course: &str) -> Result<Vec<Lab>> {
        let beacon = self.shared.beacon.load(Ordering::SeqCst);
        if let Some(entry) = self.shared.cache.load().get(course) {
            if entry.beacon == beacon {
                return Ok(entry.labs.clone());
            }
        }

        let labs = self.compute.list_published_labs(course).await?;
        self.release_fences(&labs, |c| c == course);

        let current = self.shared.cache.load_full();
        let mut next: HashMap<String, Arc<CourseCache>> = (*current).clone();
        next.insert(
            course.to_string(),
            Arc::new(CourseCache {
                beacon,
                labs: labs.clone(),
            }),
        );
        self.shared.cache.store(Arc::new(next));
        Ok(labs)
    }

    fn invalidate_course(&self, course: &str) {
        let current = self.shared.cache.load_full();
        if !current.contains_key(course) {
            return;
        }
        let mut next = (*current).clone();
        next.remove(course);
        self.shared.cache.store(Arc::new(next));
    }

    /// Drop fence entries for labs a fresh listing no longer reports.
    fn release_fences(&self, labs: &[Lab], observed: impl Fn(&str) -> bool) {
        self.shared.pending_delete.retain(|(course, lab_id)| {
            if !observed(course) {
                return true;
            }
            labs.iter().any(|lab| {
                normalize_course(&lab.course_id) == *course && lab.lab_id == *lab_id
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;
    use crate::model::TagMap;
    use crate::remote::ScriptedPlatform;

    fn vm(id: &str, tags: &[(&str, &str)]) -> VmRecord {
        VmRecord {
            id: id.to_string(),
            name: id.to_string(),
            size: None,
            private_ip: Some(format!("10.1.0.{}", id.len())),
            public_ip: None,
            power_state: "running".to_string(),
            provisioning_state: None,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn lab(course: &str, lab_id: &str, vms: Vec<VmRecord>) -> Lab {
        Lab {
            lab_id: lab_id.to_string(),
            course_id: course.to_string(),
            tags: TagMap::new(),
            vms,
        }
    }

    fn directory(platform: &Arc<ScriptedPlatform>) -> LabDirectory {
        LabDirectory::new(
            platform.clone(),
            platform.clone(),
            FamilyTable::default(),
            Arc::new(DirectoryShared::new()),
        )
    }

    #[tokio::test]
    async fn test_empty_scope_is_rejected_without_platform_calls() {
        let platform = Arc::new(ScriptedPlatform::new());
        let dir = directory(&platform);
        let trainee = Principal::new("t-1", Role::Trainee, "tichnut-a");

        let err = dir
            .list_for_staff(&trainee, &StaffFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::AccessDenied { .. }));
        assert_eq!(platform.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_course_filter_outside_scope_is_rejected_without_platform_calls() {
        let platform = Arc::new(ScriptedPlatform::new());
        let dir = directory(&platform);
        let commander = Principal::new("c-1", Role::Commander, "Cyber");

        let filters = StaffFilters {
            course: Some("tichnut-a".to_string()),
            ..Default::default()
        };
        let err = dir.list_for_staff(&commander, &filters).await.unwrap_err();
        assert!(matches!(err, LabError::AccessDenied { .. }));
        assert_eq!(platform.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_staff_listing_intersects_scope() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab("tichnut-a", "net01", vec![vm("vm-a", &[])]));
        platform.seed_lab(lab("tichnut-b", "net02", vec![vm("vm-b", &[])]));
        platform.seed_lab(lab("cyber", "recon01", vec![vm("vm-c", &[])]));
        let dir = directory(&platform);

        let commander = Principal::new("c-1", Role::Commander, "Tichnut");
        let labs = dir
            .list_for_staff(&commander, &StaffFilters::default())
            .await
            .unwrap();
        let ids: Vec<&str> = labs.iter().map(|l| l.lab_id.as_str()).collect();
        assert_eq!(ids, vec!["net01", "net02"]);
    }

    #[tokio::test]
    async fn test_section_filter_narrows_display() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab("tichnut-a", "net01", vec![]));
        platform.seed_lab(lab("tichnut-b", "net02", vec![]));
        let dir = directory(&platform);

        let commander = Principal::new("c-1", Role::Commander, "tichnut");
        let filters = StaffFilters {
            section: Some("b".to_string()),
            ..Default::default()
        };
        let labs = dir.list_for_staff(&commander, &filters).await.unwrap();
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].lab_id, "net02");
    }

    #[tokio::test]
    async fn test_text_and_address_filters() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab("cyber", "recon01", vec![vm("edge", &[])]));
        platform.seed_lab(lab("cyber", "forensics02", vec![vm("disk", &[])]));
        let dir = directory(&platform);
        let commander = Principal::new("c-1", Role::Commander, "cyber");

        let filters = StaffFilters {
            text: Some("RECON".to_string()),
            ..Default::default()
        };
        let labs = dir.list_for_staff(&commander, &filters).await.unwrap();
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].lab_id, "recon01");

        let filters = StaffFilters {
            address: Some("10.1.0.4".to_string()),
            ..Default::default()
        };
        let labs = dir.list_for_staff(&commander, &filters).await.unwrap();
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].lab_id, "forensics02");
    }

    #[tokio::test]
    async fn test_trainee_sees_only_published_own_course() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab(
            "devops",
            "pipeline01",
            vec![vm("vm-1", &[("Published", "true"), ("AssignedUser", "dana")])],
        ));
        platform.seed_lab(lab("devops", "hidden02", vec![vm("vm-2", &[])]));
        platform.seed_lab(lab(
            "cyber",
            "recon01",
            vec![vm("vm-3", &[("Published", "true")])],
        ));
        let dir = directory(&platform);

        let trainee = Principal::new("dana", Role::Trainee, "DevOps");
        let labs = dir.list_for_trainee(&trainee).await.unwrap();
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].lab_id, "pipeline01");
        assert_eq!(
            labs[0].assigned_vm.as_ref().map(|vm| vm.id.as_str()),
            Some("vm-1")
        );
    }

    #[tokio::test]
    async fn test_trainee_listing_is_cached_until_beacon_moves() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab(
            "devops",
            "pipeline01",
            vec![vm("vm-1", &[("Published", "true")])],
        ));
        let shared = Arc::new(DirectoryShared::new());
        let dir = LabDirectory::new(
            platform.clone(),
            platform.clone(),
            FamilyTable::default(),
            shared,
        );
        let trainee = Principal::new("dana", Role::Trainee, "devops");

        dir.list_for_trainee(&trainee).await.unwrap();
        dir.list_for_trainee(&trainee).await.unwrap();
        assert_eq!(platform.call_count("list_published_labs"), 1);

        // A publication change moves the beacon and forces a refetch.
        platform.seed_lab(lab(
            "devops",
            "pipeline02",
            vec![vm("vm-9", &[("Published", "true")])],
        ));
        let commander = Principal::new("c-1", Role::Commander, "devops");
        dir.publish(&commander, "devops", "pipeline02").await.unwrap();

        let labs = dir.list_for_trainee(&trainee).await.unwrap();
        assert_eq!(labs.len(), 2);
        assert_eq!(platform.call_count("list_published_labs"), 2);
    }

    #[tokio::test]
    async fn test_enroll_is_idempotent_without_second_platform_call() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab(
            "devops",
            "pipeline01",
            vec![vm("vm-1", &[("Published", "true")])],
        ));
        let dir = directory(&platform);
        let trainee = Principal::new("dana", Role::Trainee, "devops");

        let first = dir.enroll(&trainee, "pipeline01").await.unwrap();
        assert!(matches!(first, EnrollOutcome::Assigned(_)));
        assert_eq!(platform.call_count("enroll"), 1);

        let second = dir.enroll(&trainee, "pipeline01").await.unwrap();
        assert!(matches!(second, EnrollOutcome::Assigned(_)));
        assert_eq!(platform.call_count("enroll"), 1);
    }

    #[tokio::test]
    async fn test_enroll_reports_full_when_no_capacity() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab(
            "devops",
            "pipeline01",
            vec![vm("vm-1", &[("Published", "true"), ("AssignedUser", "omer")])],
        ));
        let dir = directory(&platform);
        let trainee = Principal::new("dana", Role::Trainee, "devops");

        let outcome = dir.enroll(&trainee, "pipeline01").await.unwrap();
        assert_eq!(outcome, EnrollOutcome::Full);
    }

    #[tokio::test]
    async fn test_accepted_delete_fences_enrollment() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab(
            "devops",
            "pipeline01",
            vec![vm("vm-1", &[("Published", "true")])],
        ));
        let dir = directory(&platform);
        let commander = Principal::new("c-1", Role::Commander, "devops");
        let trainee = Principal::new("dana", Role::Trainee, "devops");

        let receipt = dir
            .request_delete(&commander, "devops", "pipeline01")
            .await
            .unwrap();
        assert!(receipt.tracking_url.is_some());

        let err = dir.enroll(&trainee, "pipeline01").await.unwrap_err();
        assert!(matches!(err, LabError::Stale { .. }));
        assert_eq!(platform.call_count("enroll"), 0);

        // The lab stays visible in the staff view until torn down.
        let labs = dir
            .list_for_staff(&commander, &StaffFilters::default())
            .await
            .unwrap();
        assert_eq!(labs.len(), 1);
    }

    #[tokio::test]
    async fn test_fence_releases_after_teardown_completes() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab(
            "devops",
            "pipeline01",
            vec![vm("vm-1", &[("Published", "true")])],
        ));
        let dir = directory(&platform);
        let commander = Principal::new("c-1", Role::Commander, "devops");

        dir.request_delete(&commander, "devops", "pipeline01")
            .await
            .unwrap();
        platform.remove_lab("devops", "pipeline01");

        let labs = dir
            .list_for_staff(&commander, &StaffFilters::default())
            .await
            .unwrap();
        assert!(labs.is_empty());
        assert!(dir.shared.pending_delete.is_empty());
    }

    #[tokio::test]
    async fn test_admin_lists_every_course() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab("tichnut-a", "net01", vec![]));
        platform.seed_lab(lab("cyber", "recon01", vec![]));
        let dir = directory(&platform);

        let admin = Principal::new("root", Role::Admin, "");
        let labs = dir
            .list_for_staff(&admin, &StaffFilters::default())
            .await
            .unwrap();
        assert_eq!(labs.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_requires_scope() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.seed_lab(lab("tichnut-a", "net01", vec![vm("vm-1", &[])]));
        let dir = directory(&platform);

        let outsider = Principal::new("c-2", Role::Commander, "cyber");
        let err = dir
            .publish(&outsider, "tichnut-a", "net01")
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::AccessDenied { .. }));
        assert_eq!(platform.call_count("publish_lab"), 0);
    }
}
