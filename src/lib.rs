#[cfg(feature = "api")]
pub mod api;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod invariants;
pub mod models;
#[cfg(feature = "sqlx")]
pub mod operations;

pub mod prelude {
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, HasPool, PedigreeApp};
    pub use crate::config::{ServerConfig, StoreConfig};
    #[cfg(feature = "sqlx")]
    pub use crate::db::{
        connect, create_pedigree_tables, create_person, delete_person, edit_person, get_parents,
        get_person, get_spouses, link_parent, link_spouse, list_persons, ping, unlink_parent,
        unlink_spouse,
    };
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::invariants::{
        MAX_PARENTS, ParentLinkSnapshot, RelationshipKind, RelationshipViolation,
        SpouseLinkSnapshot, UnlinkSnapshot,
    };
    pub use crate::models::{
        CreatePersonPayload, Detail, EditPersonPayload, ErrorEnvelope, FieldUpdate,
        ListPersonsQuery, Pagination, ParentLink, Parents, Person, PersonId, PersonsPage, Removed,
        Sex, SortDirection, SortKey, SpouseLink, Spouses,
    };
    #[cfg(feature = "sqlx")]
    pub use crate::operations::{PedigreeOperation, PedigreeOperationResult, PedigreeOperations};
}
