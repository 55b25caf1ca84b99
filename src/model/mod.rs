//! Domain records shared across labdesk services.
//!
//! Labs and their VMs arrive from the platform as JSON with free-form tag
//! maps. All lab metadata rides on tags: identity, course, timestamps,
//! publication, and trainee assignment. Tag keys drifted across platform
//! versions, so every logical attribute is read through a list of accepted
//! keys. Publication is never stored on the lab itself: it is derived from
//! the VM tags on every read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form platform tag map.
pub type TagMap = BTreeMap<String, String>;

/// Accepted keys for the lab identity tag.
pub const LAB_ID_KEYS: &[&str] = &["LabId", "lab_id", "LabID", "labId"];
/// Accepted keys for the course tag.
pub const COURSE_KEYS: &[&str] = &["LabCourse", "lab_course", "Course", "course"];
/// Accepted keys for the creation timestamp tag.
pub const CREATED_AT_KEYS: &[&str] = &["CreatedAt", "created_at", "CreatedOnDate"];
/// Accepted keys for the expiry timestamp tag.
pub const EXPIRES_AT_KEYS: &[&str] = &["ExpiresAt", "expires_at", "ExpiryDate"];
/// Accepted keys for the publication flag tag.
pub const PUBLISHED_KEYS: &[&str] = &["Published", "published", "IsPublished"];
/// Accepted keys for the trainee assignment tag.
pub const ASSIGNED_USER_KEYS: &[&str] = &["AssignedUser", "assigned_user", "AssignedTo"];

/// Tag values accepted as true for flag tags, compared lowercase.
const TRUTHY: &[&str] = &["true", "1", "yes"];

/// Look a logical attribute up through its accepted key list, first hit wins.
pub fn tag_lookup<'a>(tags: &'a TagMap, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| tags.get(*k))
        .map(|v| v.as_str())
}

/// True when the tag holds a truthy value under any accepted key.
pub fn tag_flag(tags: &TagMap, keys: &[&str]) -> bool {
    tag_lookup(tags, keys)
        .map(|v| TRUTHY.contains(&v.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn tag_instant(tags: &TagMap, keys: &[&str]) -> Option<DateTime<Utc>> {
    tag_lookup(tags, keys)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Coarse VM power state as the engine reasons about it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    Starting,
    Stopped,
    Unknown,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Starting => write!(f, "starting"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<String> for PowerState {
    fn from(s: String) -> Self {
        PowerState::parse(&s)
    }
}

impl PowerState {
    /// Parse a wire power state. The platform sends either a bare word or
    /// an instance-view code like `PowerState/deallocated`; the transitional
    /// and deallocated forms all fold into `Stopped`. Anything unrecognized
    /// is `Unknown`, never an error.
    pub fn parse(raw: &str) -> Self {
        let word = raw.rsplit('/').next().unwrap_or(raw).trim().to_lowercase();
        match word.as_str() {
            "running" => Self::Running,
            "starting" => Self::Starting,
            "stopped" | "stopping" | "deallocated" | "deallocating" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

/// One virtual machine inside a lab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    /// Raw wire power state, see [`VmRecord::power`].
    #[serde(default)]
    pub power_state: String,
    #[serde(default)]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub tags: TagMap,
}

impl VmRecord {
    pub fn power(&self) -> PowerState {
        PowerState::parse(&self.power_state)
    }

    pub fn is_published(&self) -> bool {
        tag_flag(&self.tags, PUBLISHED_KEYS)
    }

    pub fn assigned_user(&self) -> Option<&str> {
        tag_lookup(&self.tags, ASSIGNED_USER_KEYS)
    }
}

/// A lab as listed by the platform: group-level tags plus its VMs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lab {
    pub lab_id: String,
    pub course_id: String,
    #[serde(default)]
    pub tags: TagMap,
    #[serde(default)]
    pub vms: Vec<VmRecord>,
}

impl Lab {
    /// Derived on every read: a lab is published when any of its VMs carries
    /// a truthy publication tag. Nothing stores this flag.
    pub fn published(&self) -> bool {
        self.vms.iter().any(|vm| vm.is_published())
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        tag_instant(&self.tags, CREATED_AT_KEYS)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        tag_instant(&self.tags, EXPIRES_AT_KEYS)
    }

    /// True once the expiry instant has passed. Labs without an expiry tag
    /// never expire.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|t| t <= now).unwrap_or(false)
    }

    /// The VM assigned to the given user, if any.
    pub fn vm_assigned_to(&self, user_id: &str) -> Option<&VmRecord> {
        self.vms
            .iter()
            .find(|vm| vm.assigned_user() == Some(user_id))
    }
}
