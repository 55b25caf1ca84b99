//! Principal derivation from identity directory groups.
//!
//! The identity provider exposes membership as flat group names like
//! `staff-tichnut-b` or `admins`. Role and course ride in the name itself:
//! a fixed role prefix, then an optional course remainder. An admin group
//! wins over everything else; within the other roles the strongest role
//! present wins, and the first group of that role supplies the course.

use lazy_static::lazy_static;
use regex::Regex;

use super::{normalize_course, FamilyTable, Principal, Role};

lazy_static! {
    static ref GROUP_PATTERN: Regex =
        Regex::new(r"(?i)^(admins|staff|students|members)(?:[-_](.+))?$").unwrap();
}

/// Role and course carried by a single group name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupClaim {
    pub role: Role,
    pub course_tag: String,
}

/// Parse one directory group name. Returns `None` for groups that carry no
/// role prefix.
pub fn parse_group(name: &str) -> Option<GroupClaim> {
    let caps = GROUP_PATTERN.captures(name.trim())?;
    let role = match caps.get(1)?.as_str().to_lowercase().as_str() {
        "admins" => Role::Admin,
        "staff" => Role::Commander,
        "students" => Role::Trainee,
        "members" => Role::Member,
        _ => return None,
    };
    let course_tag = caps
        .get(2)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Some(GroupClaim { role, course_tag })
}

fn role_rank(role: Role) -> u8 {
    match role {
        Role::Admin => 4,
        Role::Commander => 3,
        Role::Trainee => 2,
        Role::Member => 1,
        Role::Unknown => 0,
    }
}

/// Derive a [`Principal`] from a user id and the directory groups the
/// identity provider reported for it. Users with no role-bearing group get
/// `Role::Unknown` and an empty course tag, which resolves to the empty
/// scope downstream.
pub fn derive_principal(user_id: &str, groups: &[String], families: &FamilyTable) -> Principal {
    let mut best: Option<GroupClaim> = None;
    for group in groups {
        let Some(claim) = parse_group(group) else {
            continue;
        };
        let stronger = best
            .as_ref()
            .map(|b| role_rank(claim.role) > role_rank(b.role))
            .unwrap_or(true);
        if stronger {
            best = Some(claim);
        }
    }

    let (role, course_tag) = match best {
        Some(claim) => (claim.role, claim.course_tag),
        None => (Role::Unknown, String::new()),
    };

    let normalized = normalize_course(&course_tag);
    let section = families
        .split_section(&normalized)
        .map(|(_, s)| s.to_string());

    Principal {
        id: user_id.to_string(),
        role,
        course_tag,
        section,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_group_roles() {
        assert_eq!(
            parse_group("staff-tichnut-b"),
            Some(GroupClaim {
                role: Role::Commander,
                course_tag: "tichnut-b".into()
            })
        );
        assert_eq!(
            parse_group("students-cyber"),
            Some(GroupClaim {
                role: Role::Trainee,
                course_tag: "cyber".into()
            })
        );
        assert_eq!(
            parse_group("Admins"),
            Some(GroupClaim {
                role: Role::Admin,
                course_tag: String::new()
            })
        );
        assert_eq!(parse_group("helpdesk-tier2"), None);
    }

    #[test]
    fn test_admin_group_wins_over_everything() {
        let families = FamilyTable::default();
        let p = derive_principal(
            "u-7",
            &groups(&["students-tichnut-a", "admins", "staff-cyber"]),
            &families,
        );
        assert_eq!(p.role, Role::Admin);
        assert_eq!(p.course_tag, "");
    }

    #[test]
    fn test_staff_wins_over_students() {
        let families = FamilyTable::default();
        let p = derive_principal(
            "u-8",
            &groups(&["students-tichnut-a", "staff-tichnut-b"]),
            &families,
        );
        assert_eq!(p.role, Role::Commander);
        assert_eq!(p.course_tag, "tichnut-b");
        assert_eq!(p.section.as_deref(), Some("b"));
    }

    #[test]
    fn test_bare_family_staff_group_has_no_section() {
        let families = FamilyTable::default();
        let p = derive_principal("u-9", &groups(&["staff-tichnut"]), &families);
        assert_eq!(p.role, Role::Commander);
        assert_eq!(p.course_tag, "tichnut");
        assert_eq!(p.section, None);
    }

    #[test]
    fn test_no_role_bearing_group_fails_closed() {
        let families = FamilyTable::default();
        let p = derive_principal("u-10", &groups(&["helpdesk", "everyone"]), &families);
        assert_eq!(p.role, Role::Unknown);
        assert_eq!(p.course_tag, "");
        assert!(crate::access::resolve(&families, &p).is_empty());
    }

    #[test]
    fn test_underscore_separator_is_accepted() {
        let p = parse_group("staff_tichnut_c").unwrap();
        assert_eq!(p.role, Role::Commander);
        assert_eq!(normalize_course(&p.course_tag), "tichnut-c");
    }
}
