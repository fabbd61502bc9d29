use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db;
use crate::error::Result;
use crate::models::{
    CreatePersonPayload, EditPersonPayload, ListPersonsQuery, Pagination, ParentLink, Parents,
    Person, PersonId, PersonsPage, SpouseLink, Spouses,
};

/// Tool-friendly pedigree actions, one variant per store operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum PedigreeOperation {
    CreatePerson {
        payload: CreatePersonPayload,
    },
    GetPerson {
        person_id: PersonId,
    },
    EditPerson {
        person_id: PersonId,
        payload: EditPersonPayload,
    },
    DeletePerson {
        person_id: PersonId,
    },
    ListPersons {
        #[serde(default)]
        query: ListPersonsQuery,
    },
    LinkParent {
        child_id: PersonId,
        parent_id: PersonId,
    },
    UnlinkParent {
        child_id: PersonId,
        parent_id: PersonId,
    },
    GetParents {
        child_id: PersonId,
    },
    LinkSpouse {
        person_id: PersonId,
        spouse_id: PersonId,
    },
    UnlinkSpouse {
        person_id: PersonId,
        spouse_id: PersonId,
    },
    GetSpouses {
        person_id: PersonId,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PedigreeOperationResult {
    Person {
        person: Person,
    },
    PersonsPage {
        data: Vec<Person>,
        pagination: Pagination,
    },
    ParentLink {
        link: ParentLink,
    },
    Parents {
        parents: Parents,
    },
    SpouseLink {
        link: SpouseLink,
    },
    Spouses {
        spouses: Spouses,
    },
    Removed {
        removed: u64,
    },
}

#[derive(Clone)]
pub struct PedigreeOperations {
    pool: Arc<SqlitePool>,
}

impl PedigreeOperations {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub fn from_pool(pool: &SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool.clone()),
        }
    }

    pub fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }

    pub async fn execute(&self, operation: PedigreeOperation) -> Result<PedigreeOperationResult> {
        match operation {
            PedigreeOperation::CreatePerson { payload } => {
                let person = self.create_person(payload).await?;
                Ok(PedigreeOperationResult::Person { person })
            }
            PedigreeOperation::GetPerson { person_id } => {
                let person = self.get_person(person_id).await?;
                Ok(PedigreeOperationResult::Person { person })
            }
            PedigreeOperation::EditPerson { person_id, payload } => {
                let person = self.edit_person(person_id, payload).await?;
                Ok(PedigreeOperationResult::Person { person })
            }
            PedigreeOperation::DeletePerson { person_id } => {
                let person = self.delete_person(person_id).await?;
                Ok(PedigreeOperationResult::Person { person })
            }
            PedigreeOperation::ListPersons { query } => {
                let page = self.list_persons(query).await?;
                Ok(PedigreeOperationResult::PersonsPage {
                    data: page.data,
                    pagination: page.pagination,
                })
            }
            PedigreeOperation::LinkParent {
                child_id,
                parent_id,
            } => {
                let link = self.link_parent(child_id, parent_id).await?;
                Ok(PedigreeOperationResult::ParentLink { link })
            }
            PedigreeOperation::UnlinkParent {
                child_id,
                parent_id,
            } => {
                let removed = self.unlink_parent(child_id, parent_id).await?;
                Ok(PedigreeOperationResult::Removed { removed })
            }
            PedigreeOperation::GetParents { child_id } => {
                let parents = self.get_parents(child_id).await?;
                Ok(PedigreeOperationResult::Parents { parents })
            }
            PedigreeOperation::LinkSpouse {
                person_id,
                spouse_id,
            } => {
                let link = self.link_spouse(person_id, spouse_id).await?;
                Ok(PedigreeOperationResult::SpouseLink { link })
            }
            PedigreeOperation::UnlinkSpouse {
                person_id,
                spouse_id,
            } => {
                let removed = self.unlink_spouse(person_id, spouse_id).await?;
                Ok(PedigreeOperationResult::Removed { removed })
            }
            PedigreeOperation::GetSpouses { person_id } => {
                let spouses = self.get_spouses(person_id).await?;
                Ok(PedigreeOperationResult::Spouses { spouses })
            }
        }
    }

    pub async fn create_person(&self, payload: CreatePersonPayload) -> Result<Person> {
        db::create_person(&self.pool, payload).await
    }

    pub async fn get_person(&self, person_id: PersonId) -> Result<Person> {
        db::get_person(&self.pool, person_id).await
    }

    pub async fn edit_person(
        &self,
        person_id: PersonId,
        payload: EditPersonPayload,
    ) -> Result<Person> {
        db::edit_person(&self.pool, person_id, payload).await
    }

    pub async fn delete_person(&self, person_id: PersonId) -> Result<Person> {
        db::delete_person(&self.pool, person_id).await
    }

    pub async fn list_persons(&self, query: ListPersonsQuery) -> Result<PersonsPage> {
        db::list_persons(&self.pool, query).await
    }

    pub async fn link_parent(&self, child_id: PersonId, parent_id: PersonId) -> Result<ParentLink> {
        db::link_parent(&self.pool, child_id, parent_id).await
    }

    pub async fn unlink_parent(&self, child_id: PersonId, parent_id: PersonId) -> Result<u64> {
        db::unlink_parent(&self.pool, child_id, parent_id).await
    }

    pub async fn get_parents(&self, child_id: PersonId) -> Result<Parents> {
        db::get_parents(&self.pool, child_id).await
    }

    pub async fn link_spouse(
        &self,
        person_id: PersonId,
        spouse_id: PersonId,
    ) -> Result<SpouseLink> {
        db::link_spouse(&self.pool, person_id, spouse_id).await
    }

    pub async fn unlink_spouse(&self, person_id: PersonId, spouse_id: PersonId) -> Result<u64> {
        db::unlink_spouse(&self.pool, person_id, spouse_id).await
    }

    pub async fn get_spouses(&self, person_id: PersonId) -> Result<Spouses> {
        db::get_spouses(&self.pool, person_id).await
    }

    /// Store connectivity check.
    pub async fn ping(&self) -> Result<String> {
        db::ping(&self.pool).await
    }
}
