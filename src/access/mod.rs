//! Course identity and access scope resolution.
//!
//! Every management operation is gated on a [`CourseScope`] resolved once
//! per principal from role and course tag. Course identifiers are free text
//! at the edges (directory group names, platform tags, user input) and are
//! normalized here before any comparison. Course families group sibling
//! sections of the same course; the family registry is a data table so a
//! new course never requires a code change.

pub mod claims;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{LabError, Result};

/// Canonical course identifier form: lowercase, single hyphens between
/// words, no edge hyphens. Idempotent, so already-normalized ids pass
/// through unchanged.
pub fn normalize_course(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() || ch == '_' || ch == '-' {
            pending_sep = !out.is_empty();
        } else {
            if pending_sep {
                out.push('-');
                pending_sep = false;
            }
            out.extend(ch.to_lowercase());
        }
    }
    out
}

/// One course family: a base name plus its section suffixes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CourseFamily {
    pub name: String,
    pub sections: Vec<String>,
}

impl CourseFamily {
    /// Full course ids of every section, `<family>-<section>`.
    pub fn section_ids(&self) -> Vec<String> {
        self.sections
            .iter()
            .map(|s| format!("{}-{}", self.name, s))
            .collect()
    }
}

/// The built-in family registry: the tichnut course with sections a-d.
pub fn default_families() -> Vec<CourseFamily> {
    vec![CourseFamily {
        name: "tichnut".to_string(),
        sections: vec!["a", "b", "c", "d"]
            .into_iter()
            .map(String::from)
            .collect(),
    }]
}

/// Registry of course families. Seeded with the built-in default and
/// replaceable from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyTable {
    families: Vec<CourseFamily>,
}

impl Default for FamilyTable {
    fn default() -> Self {
        Self {
            families: default_families(),
        }
    }
}

impl FamilyTable {
    pub fn new(families: Vec<CourseFamily>) -> Self {
        Self { families }
    }

    /// The family whose bare name equals the normalized id, if any.
    pub fn bare_family(&self, course_id: &str) -> Option<&CourseFamily> {
        self.families.iter().find(|f| f.name == course_id)
    }

    /// Split a sectioned course id into its family and section suffix.
    /// Returns `None` for ids outside every family.
    pub fn split_section<'a>(&'a self, course_id: &'a str) -> Option<(&'a CourseFamily, &'a str)> {
        self.families.iter().find_map(|f| {
            let rest = course_id.strip_prefix(f.name.as_str())?.strip_prefix('-')?;
            f.sections
                .iter()
                .any(|s| s == rest)
                .then_some((f, rest))
        })
    }
}

/// Principal role as carried by identity claims. Unrecognized role strings
/// resolve to `Unknown`, which holds no management scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Commander,
    Member,
    Trainee,
    Unknown,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Commander => write!(f, "commander"),
            Self::Member => write!(f, "member"),
            Self::Trainee => write!(f, "trainee"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.as_str() {
            "admin" => Self::Admin,
            "commander" => Self::Commander,
            "member" => Self::Member,
            "trainee" => Self::Trainee,
            _ => Self::Unknown,
        }
    }
}

/// Immutable caller identity, fixed at authentication time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    /// Course tag as carried by the identity claims, not yet normalized.
    pub course_tag: String,
    /// Section suffix when the claims carried one.
    #[serde(default)]
    pub section: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role, course_tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            course_tag: course_tag.into(),
            section: None,
        }
    }

    pub fn normalized_course(&self) -> String {
        normalize_course(&self.course_tag)
    }
}

/// The set of course ids a principal may manage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourseScope {
    /// Every course, no enumeration.
    Unrestricted,
    /// Exactly these normalized course ids. May be empty.
    Courses(BTreeSet<String>),
}

impl CourseScope {
    pub fn empty() -> Self {
        CourseScope::Courses(BTreeSet::new())
    }

    pub fn of<I: IntoIterator<Item = S>, S: Into<String>>(ids: I) -> Self {
        CourseScope::Courses(ids.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CourseScope::Unrestricted => false,
            CourseScope::Courses(set) => set.is_empty(),
        }
    }

    /// Whether the scope covers the given course. The id is normalized
    /// before comparison.
    pub fn allows(&self, course_id: &str) -> bool {
        match self {
            CourseScope::Unrestricted => true,
            CourseScope::Courses(set) => set.contains(&normalize_course(course_id)),
        }
    }

    /// Narrow to courses of one section suffix for display. Narrowing only:
    /// ids outside every family drop out, and an unrestricted scope stays
    /// unrestricted since it cannot be enumerated here.
    pub fn narrow_to_section(&self, section: &str, families: &FamilyTable) -> CourseScope {
        match self {
            CourseScope::Unrestricted => CourseScope::Unrestricted,
            CourseScope::Courses(set) => CourseScope::Courses(
                set.iter()
                    .filter(|id| {
                        families
                            .split_section(id)
                            .map(|(_, s)| s == section)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect(),
            ),
        }
    }

    /// Error out unless the scope covers the course, naming the operation.
    pub fn require(&self, operation: &str, course_id: &str) -> Result<()> {
        if self.allows(course_id) {
            Ok(())
        } else {
            Err(LabError::access_denied(
                operation,
                format!("course {} is outside the caller's scope", normalize_course(course_id)),
            ))
        }
    }
}

/// Resolve the management scope for a principal. Fail closed: anything
/// that does not positively match a rule resolves to the empty scope.
pub fn resolve(families: &FamilyTable, principal: &Principal) -> CourseScope {
    if principal.role == Role::Admin {
        return CourseScope::Unrestricted;
    }

    let course = principal.normalized_course();
    if course.is_empty() {
        return CourseScope::empty();
    }

    match principal.role {
        Role::Commander => {
            if let Some(family) = families.bare_family(&course) {
                CourseScope::of(family.section_ids())
            } else {
                CourseScope::of([course])
            }
        }
        _ => CourseScope::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commander(course: &str) -> Principal {
        Principal::new("cmd-1", Role::Commander, course)
    }

    #[test]
    fn test_normalize_lowercases_and_hyphenates() {
        assert_eq!(normalize_course("Tichnut"), "tichnut");
        assert_eq!(normalize_course("TICHNUT_B"), "tichnut-b");
        assert_eq!(normalize_course("  Tichnut  B "), "tichnut-b");
        assert_eq!(normalize_course("tichnut---b"), "tichnut-b");
        assert_eq!(normalize_course("-tichnut-"), "tichnut");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["Tichnut B", "TICHNUT_B", "cyber", "  x__y  z "] {
            let once = normalize_course(raw);
            assert_eq!(normalize_course(&once), once);
        }
    }

    #[test]
    fn test_normalize_empty_and_separator_only() {
        assert_eq!(normalize_course(""), "");
        assert_eq!(normalize_course("  __--  "), "");
    }

    #[test]
    fn test_admin_gets_unrestricted_scope() {
        let families = FamilyTable::default();
        let p = Principal::new("root", Role::Admin, "");
        assert_eq!(resolve(&families, &p), CourseScope::Unrestricted);
        assert!(resolve(&families, &p).allows("anything-at-all"));
    }

    #[test]
    fn test_bare_family_commander_gets_all_sections() {
        let families = FamilyTable::default();
        let scope = resolve(&families, &commander("Tichnut"));
        assert_eq!(
            scope,
            CourseScope::of(["tichnut-a", "tichnut-b", "tichnut-c", "tichnut-d"])
        );
    }

    #[test]
    fn test_section_commander_gets_own_section_only() {
        let families = FamilyTable::default();
        let scope = resolve(&families, &commander("Tichnut-B"));
        assert_eq!(scope, CourseScope::of(["tichnut-b"]));
        assert!(scope.allows("TICHNUT_B"));
        assert!(!scope.allows("tichnut-a"));
    }

    #[test]
    fn test_non_family_commander_gets_singleton_scope() {
        let families = FamilyTable::default();
        let scope = resolve(&families, &commander("Cyber"));
        assert_eq!(scope, CourseScope::of(["cyber"]));
        assert!(!scope.allows("tichnut-a"));
    }

    #[test]
    fn test_trainee_member_unknown_resolve_empty() {
        let families = FamilyTable::default();
        for role in [Role::Trainee, Role::Member, Role::Unknown] {
            let p = Principal::new("u-1", role, "tichnut-a");
            assert!(resolve(&families, &p).is_empty());
        }
    }

    #[test]
    fn test_empty_normalizing_course_tag_resolves_empty() {
        let families = FamilyTable::default();
        assert!(resolve(&families, &commander("  __  ")).is_empty());
    }

    #[test]
    fn test_section_narrowing_never_widens() {
        let families = FamilyTable::default();
        let scope = resolve(&families, &commander("tichnut"));
        let narrowed = scope.narrow_to_section("b", &families);
        assert_eq!(narrowed, CourseScope::of(["tichnut-b"]));

        // Ids outside every family drop out instead of matching everything.
        let mixed = CourseScope::of(["tichnut-b", "cyber"]);
        assert_eq!(
            mixed.narrow_to_section("b", &families),
            CourseScope::of(["tichnut-b"])
        );

        let unrestricted = CourseScope::Unrestricted.narrow_to_section("a", &families);
        assert_eq!(unrestricted, CourseScope::Unrestricted);
    }

    #[test]
    fn test_require_names_operation_and_course() {
        let scope = CourseScope::of(["cyber"]);
        let err = scope.require("list_labs", "Tichnut-A").unwrap_err();
        match err {
            LabError::AccessDenied { operation, reason } => {
                assert_eq!(operation, "list_labs");
                assert!(reason.contains("tichnut-a"));
            }
            other => panic!("expected AccessDenied, got {other:?}"),
        }
    }

    #[test]
    fn test_role_round_trip_fails_closed() {
        assert_eq!(Role::from("commander".to_string()), Role::Commander);
        assert_eq!(Role::from("instructor".to_string()), Role::Unknown);
        assert_eq!(Role::Commander.to_string(), "commander");
    }

    #[test]
    fn test_family_split_section() {
        let families = FamilyTable::default();
        let (family, section) = families.split_section("tichnut-c").unwrap();
        assert_eq!(family.name, "tichnut");
        assert_eq!(section, "c");
        assert!(families.split_section("tichnut-z").is_none());
        assert!(families.split_section("cyber").is_none());
    }
}
