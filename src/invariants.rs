use anyhow::anyhow;
use serde::Serialize;
use serde_json::json;

use crate::error::{LibError, Result};
use crate::models::PersonId;

pub const MAX_PARENTS: u32 = 2;

/// Neighbourhood of a child read inside the linking transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLinkSnapshot {
    pub child_exists: bool,
    pub parent_exists: bool,
    pub parent_count: u32,
    pub relationship_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpouseLinkSnapshot {
    pub person_exists: bool,
    pub spouse_exists: bool,
    pub relationship_exists: bool,
}

/// Shared by parent and spouse unlinking; `anchor` is the child or the person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkSnapshot {
    pub anchor_exists: bool,
    pub other_exists: bool,
    pub relationship_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    Parent,
    Spouse,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum RelationshipViolation {
    SelfParent {
        #[serde(rename = "personId")]
        person_id: PersonId,
    },
    SelfSpouse {
        #[serde(rename = "personId")]
        person_id: PersonId,
    },
    ChildNotFound,
    ParentNotFound,
    PersonNotFound,
    SpouseNotFound,
    ParentAlreadyLinked,
    SpouseAlreadyLinked,
    ParentLimitExceeded {
        #[serde(rename = "parentCount")]
        parent_count: u32,
    },
    RelationshipNotFound,
}

impl RelationshipViolation {
    pub const fn violation_code(&self) -> &'static str {
        match self {
            RelationshipViolation::SelfParent { .. } => "self_parent",
            RelationshipViolation::SelfSpouse { .. } => "self_spouse",
            RelationshipViolation::ChildNotFound => "child_not_found",
            RelationshipViolation::ParentNotFound => "parent_not_found",
            RelationshipViolation::PersonNotFound => "person_not_found",
            RelationshipViolation::SpouseNotFound => "spouse_not_found",
            RelationshipViolation::ParentAlreadyLinked => "parent_already_linked",
            RelationshipViolation::SpouseAlreadyLinked => "spouse_already_linked",
            RelationshipViolation::ParentLimitExceeded { .. } => "parent_limit_exceeded",
            RelationshipViolation::RelationshipNotFound => "relationship_not_found",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            RelationshipViolation::SelfParent { .. } => "Person cannot be their own parent",
            RelationshipViolation::SelfSpouse { .. } => "Person cannot be their own spouse",
            RelationshipViolation::ChildNotFound => "Child not found",
            RelationshipViolation::ParentNotFound => "Parent not found",
            RelationshipViolation::PersonNotFound => "Person not found",
            RelationshipViolation::SpouseNotFound => "Spouse not found",
            RelationshipViolation::ParentAlreadyLinked => "Parent relationship already exists",
            RelationshipViolation::SpouseAlreadyLinked => "Spouse relationship already exists",
            RelationshipViolation::ParentLimitExceeded { .. } => {
                "A person cannot have more than two parents"
            }
            RelationshipViolation::RelationshipNotFound => "Relationship not found",
        }
    }

    pub fn into_error(self) -> LibError {
        let public = self.public_message();
        let source = anyhow!("relationship rule rejected mutation: {:?}", self);
        let err = match self {
            RelationshipViolation::SelfParent { .. }
            | RelationshipViolation::SelfSpouse { .. }
            | RelationshipViolation::ParentLimitExceeded { .. } => LibError::invalid(public, source),
            RelationshipViolation::ParentAlreadyLinked
            | RelationshipViolation::SpouseAlreadyLinked => LibError::conflict(public, source),
            RelationshipViolation::ChildNotFound
            | RelationshipViolation::ParentNotFound
            | RelationshipViolation::PersonNotFound
            | RelationshipViolation::SpouseNotFound
            | RelationshipViolation::RelationshipNotFound => LibError::not_found(public, source),
        };
        let details = serde_json::to_value(&self).unwrap_or_else(|_| json!({}));
        err.with_details(details)
    }
}

impl From<RelationshipViolation> for LibError {
    fn from(value: RelationshipViolation) -> Self {
        value.into_error()
    }
}

pub fn ensure_not_self_parent(child_id: PersonId, parent_id: PersonId) -> Result<()> {
    if child_id == parent_id {
        return Err(RelationshipViolation::SelfParent {
            person_id: child_id,
        }
        .into());
    }
    Ok(())
}

pub fn ensure_not_self_spouse(person_id: PersonId, spouse_id: PersonId) -> Result<()> {
    if person_id == spouse_id {
        return Err(RelationshipViolation::SelfSpouse { person_id }.into());
    }
    Ok(())
}

/// First violated rule, checked in priority order, or `None` when the edge may be created.
pub fn parent_link_violation(snapshot: &ParentLinkSnapshot) -> Option<RelationshipViolation> {
    if !snapshot.child_exists {
        return Some(RelationshipViolation::ChildNotFound);
    }
    if !snapshot.parent_exists {
        return Some(RelationshipViolation::ParentNotFound);
    }
    if snapshot.relationship_exists {
        return Some(RelationshipViolation::ParentAlreadyLinked);
    }
    if snapshot.parent_count >= MAX_PARENTS {
        return Some(RelationshipViolation::ParentLimitExceeded {
            parent_count: snapshot.parent_count,
        });
    }
    None
}

pub fn spouse_link_violation(snapshot: &SpouseLinkSnapshot) -> Option<RelationshipViolation> {
    if !snapshot.person_exists {
        return Some(RelationshipViolation::PersonNotFound);
    }
    if !snapshot.spouse_exists {
        return Some(RelationshipViolation::SpouseNotFound);
    }
    if snapshot.relationship_exists {
        return Some(RelationshipViolation::SpouseAlreadyLinked);
    }
    None
}

pub fn unlink_violation(
    kind: RelationshipKind,
    snapshot: &UnlinkSnapshot,
) -> Option<RelationshipViolation> {
    if !snapshot.anchor_exists {
        return Some(match kind {
            RelationshipKind::Parent => RelationshipViolation::ChildNotFound,
            RelationshipKind::Spouse => RelationshipViolation::PersonNotFound,
        });
    }
    if !snapshot.other_exists {
        return Some(match kind {
            RelationshipKind::Parent => RelationshipViolation::ParentNotFound,
            RelationshipKind::Spouse => RelationshipViolation::SpouseNotFound,
        });
    }
    if !snapshot.relationship_exists {
        return Some(RelationshipViolation::RelationshipNotFound);
    }
    None
}

pub fn ensure_parent_link(snapshot: &ParentLinkSnapshot) -> Result<()> {
    match parent_link_violation(snapshot) {
        Some(violation) => {
            tracing::debug!(violation = violation.violation_code(), "parent link rejected");
            Err(violation.into())
        }
        None => Ok(()),
    }
}

pub fn ensure_spouse_link(snapshot: &SpouseLinkSnapshot) -> Result<()> {
    match spouse_link_violation(snapshot) {
        Some(violation) => {
            tracing::debug!(violation = violation.violation_code(), "spouse link rejected");
            Err(violation.into())
        }
        None => Ok(()),
    }
}

pub fn ensure_unlink(kind: RelationshipKind, snapshot: &UnlinkSnapshot) -> Result<()> {
    match unlink_violation(kind, snapshot) {
        Some(violation) => {
            tracing::debug!(
                ?kind,
                violation = violation.violation_code(),
                "unlink rejected"
            );
            Err(violation.into())
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::error::ErrorKind;

    fn linkable_parent() -> ParentLinkSnapshot {
        ParentLinkSnapshot {
            child_exists: true,
            parent_exists: true,
            parent_count: 0,
            relationship_exists: false,
        }
    }

    #[test]
    fn self_parent_is_a_validation_error() {
        let id = PersonId(Uuid::new_v4());
        let err = ensure_not_self_parent(id, id).expect_err("self parent should fail");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(err.public, "Person cannot be their own parent");
        assert!(ensure_not_self_parent(id, PersonId(Uuid::new_v4())).is_ok());
    }

    #[test]
    fn self_spouse_is_a_validation_error() {
        let id = PersonId(Uuid::new_v4());
        let err = ensure_not_self_spouse(id, id).expect_err("self spouse should fail");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn parent_link_accepts_up_to_two_parents() {
        assert!(parent_link_violation(&linkable_parent()).is_none());
        let one = ParentLinkSnapshot {
            parent_count: 1,
            ..linkable_parent()
        };
        assert!(parent_link_violation(&one).is_none());
    }

    #[test]
    fn parent_link_rejects_third_parent() {
        let full = ParentLinkSnapshot {
            parent_count: 2,
            ..linkable_parent()
        };
        assert_eq!(
            parent_link_violation(&full),
            Some(RelationshipViolation::ParentLimitExceeded { parent_count: 2 })
        );
        let err = ensure_parent_link(&full).expect_err("third parent should fail");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(
            err.details,
            Some(json!({"violation": "parent_limit_exceeded", "parentCount": 2}))
        );
    }

    #[test]
    fn parent_link_checks_in_priority_order() {
        let nothing = ParentLinkSnapshot {
            child_exists: false,
            parent_exists: false,
            parent_count: 2,
            relationship_exists: true,
        };
        assert_eq!(
            parent_link_violation(&nothing),
            Some(RelationshipViolation::ChildNotFound)
        );

        let no_parent = ParentLinkSnapshot {
            child_exists: true,
            ..nothing
        };
        assert_eq!(
            parent_link_violation(&no_parent),
            Some(RelationshipViolation::ParentNotFound)
        );

        // Duplicate wins over cardinality when both hold.
        let duplicate = ParentLinkSnapshot {
            parent_exists: true,
            ..no_parent
        };
        let err = ensure_parent_link(&duplicate).expect_err("duplicate should fail");
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.public, "Parent relationship already exists");
    }

    #[test]
    fn spouse_link_rules() {
        let ok = SpouseLinkSnapshot {
            person_exists: true,
            spouse_exists: true,
            relationship_exists: false,
        };
        assert!(ensure_spouse_link(&ok).is_ok());

        let missing_spouse = SpouseLinkSnapshot {
            spouse_exists: false,
            ..ok
        };
        let err = ensure_spouse_link(&missing_spouse).expect_err("missing spouse");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.public, "Spouse not found");

        let existing = SpouseLinkSnapshot {
            relationship_exists: true,
            ..ok
        };
        let err = ensure_spouse_link(&existing).expect_err("duplicate spouse");
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[test]
    fn unlink_reports_missing_pieces_in_order() {
        let snapshot = UnlinkSnapshot {
            anchor_exists: false,
            other_exists: false,
            relationship_exists: false,
        };
        assert_eq!(
            unlink_violation(RelationshipKind::Parent, &snapshot),
            Some(RelationshipViolation::ChildNotFound)
        );
        assert_eq!(
            unlink_violation(RelationshipKind::Spouse, &snapshot),
            Some(RelationshipViolation::PersonNotFound)
        );

        let anchor_only = UnlinkSnapshot {
            anchor_exists: true,
            ..snapshot
        };
        assert_eq!(
            unlink_violation(RelationshipKind::Parent, &anchor_only),
            Some(RelationshipViolation::ParentNotFound)
        );

        let no_edge = UnlinkSnapshot {
            other_exists: true,
            ..anchor_only
        };
        let err = ensure_unlink(RelationshipKind::Spouse, &no_edge).expect_err("no edge");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.public, "Relationship not found");

        let present = UnlinkSnapshot {
            relationship_exists: true,
            ..no_edge
        };
        assert!(ensure_unlink(RelationshipKind::Parent, &present).is_ok());
    }
}
