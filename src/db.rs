use std::str::FromStr;

use anyhow::anyhow;
use chrono::{TimeDelta, Utc};
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::config::StoreConfig;
use crate::error::{LibError, Result};
use crate::invariants::{
    self, ParentLinkSnapshot, RelationshipKind, SpouseLinkSnapshot, UnlinkSnapshot,
};
use crate::models::{
    CreatePersonPayload, EditPersonPayload, FieldUpdate, ListPersonsQuery, Pagination, ParentLink,
    Parents, Person, PersonFilter, PersonId, PersonsPage, RawPersonRecord, Range, SpouseLink,
    Spouses, format_date, format_timestamp,
};

macro_rules! person_columns {
    () => {
        "id, name, sex, is_alive, birth_date, death_date, created_at, updated_at"
    };
    ($alias:literal) => {
        concat!(
            $alias, ".id, ", $alias, ".name, ", $alias, ".sex, ", $alias, ".is_alive, ",
            $alias, ".birth_date, ", $alias, ".death_date, ", $alias, ".created_at, ",
            $alias, ".updated_at"
        )
    };
}

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_pedigree_tables(pool: &SqlitePool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Opens the store handle. The caller owns the pool and closes it at shutdown.
pub async fn connect(config: &StoreConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(|err| db_err("Invalid database url", err))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout);

    let pool = if config.is_in_memory() {
        // Every in-memory connection is its own database, so keep exactly one alive.
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<std::time::Duration>)
            .max_lifetime(None::<std::time::Duration>)
            .connect_with(options)
            .await
    } else {
        SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options.journal_mode(SqliteJournalMode::Wal))
            .await
    }
    .map_err(|err| db_err("Failed to connect to database", err))?;

    tracing::info!(
        database_url = %config.database_url,
        max_connections = config.max_connections,
        "opened pedigree store"
    );
    Ok(pool)
}

/// Connectivity check; returns the storage engine version.
pub async fn ping(pool: &SqlitePool) -> Result<String> {
    let version: String = sqlx::query_scalar("SELECT sqlite_version()")
        .fetch_one(pool)
        .await
        .map_err(|err| db_err("Failed to reach database", err))?;
    Ok(format!("sqlite {}", version))
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

/// Constraint failures here mean the rule check and the schema disagree.
fn edge_write_err(public: &'static str, err: sqlx::Error) -> LibError {
    let (unique, rejected) = match err.as_database_error() {
        Some(db) => (
            db.is_unique_violation(),
            db.is_check_violation() || db.message().contains("parent_limit_exceeded"),
        ),
        None => (false, false),
    };
    if unique {
        LibError::conflict("Relationship already exists", anyhow!(err))
    } else if rejected {
        LibError::invalid("Relationship violates graph constraints", anyhow!(err))
    } else {
        db_err(public, err)
    }
}

async fn begin(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>> {
    pool.begin()
        .await
        .map_err(|err| db_err("Failed to start transaction", err))
}

async fn commit(tx: Transaction<'static, Sqlite>) -> Result<()> {
    tx.commit()
        .await
        .map_err(|err| db_err("Failed to commit transaction", err))
}

/// Takes the store write lock for the rest of the transaction and reports whether the
/// person exists. SQLite has no row locks, so any write statement serializes writers.
async fn lock_person(conn: &mut SqliteConnection, id: PersonId) -> Result<bool> {
    let result = sqlx::query("UPDATE persons SET name = name WHERE id = ?")
        .bind(id.as_db_value())
        .execute(&mut *conn)
        .await
        .map_err(|err| db_err("Failed to lock person", err))?;
    Ok(result.rows_affected() > 0)
}

async fn fetch_person(conn: &mut SqliteConnection, id: PersonId) -> Result<Option<Person>> {
    let row = sqlx::query_as::<_, RawPersonRecord>(concat!(
        "SELECT ",
        person_columns!(),
        " FROM persons WHERE id = ?"
    ))
    .bind(id.as_db_value())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to query person", err))?;

    row.map(RawPersonRecord::normalize).transpose()
}

async fn person_exists(conn: &mut SqliteConnection, id: PersonId) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM persons WHERE id = ?")
        .bind(id.as_db_value())
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| db_err("Failed to query person", err))?;
    Ok(count > 0)
}

async fn fetch_people(
    conn: &mut SqliteConnection,
    sql: &'static str,
    binds: &[String],
) -> Result<Vec<Person>> {
    let mut query = sqlx::query_as::<_, RawPersonRecord>(sql);
    for value in binds {
        query = query.bind(value.clone());
    }
    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| db_err("Failed to query related people", err))?;

    rows.into_iter().map(RawPersonRecord::normalize).collect()
}

fn person_not_found(id: PersonId) -> LibError {
    LibError::not_found("Person not found", anyhow!("person {} not found", id))
}

pub async fn create_person(pool: &SqlitePool, payload: CreatePersonPayload) -> Result<Person> {
    let person = payload.normalize()?;
    let person_id = PersonId::new();
    let now = format_timestamp(Utc::now());

    let mut tx = begin(pool).await?;
    let row = sqlx::query_as::<_, RawPersonRecord>(concat!(
        "INSERT INTO persons (id, name, name_folded, sex, is_alive, birth_date, death_date, created_at, updated_at) ",
        "VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING ",
        person_columns!()
    ))
    .bind(person_id.as_db_value())
    .bind(&person.name)
    .bind(person.name.to_lowercase())
    .bind(person.sex.as_db_value())
    .bind(person.is_alive)
    .bind(person.birth_date.map(format_date))
    .bind(person.death_date.map(format_date))
    .bind(&now)
    .bind(&now)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|err| db_err("Failed to create person", err))?;

    let row = row.ok_or_else(|| {
        LibError::internal(
            "Error creating person",
            anyhow!("insert of person {} returned no row", person_id),
        )
    })?;
    let created = row.normalize()?;
    commit(tx).await?;

    tracing::info!(person_id = %created.id, "person created");
    Ok(created)
}

pub async fn get_person(pool: &SqlitePool, person_id: PersonId) -> Result<Person> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|err| db_err("Failed to acquire connection", err))?;
    fetch_person(&mut conn, person_id)
        .await?
        .ok_or_else(|| person_not_found(person_id))
}

pub async fn edit_person(
    pool: &SqlitePool,
    person_id: PersonId,
    payload: EditPersonPayload,
) -> Result<Person> {
    let changes = payload.normalize()?;

    let mut tx = begin(pool).await?;
    if !lock_person(&mut tx, person_id).await? {
        return Err(person_not_found(person_id));
    }
    let current = fetch_person(&mut tx, person_id)
        .await?
        .ok_or_else(|| person_not_found(person_id))?;

    // updatedAt must move forward even when two edits land in the same microsecond.
    let updated_at = Utc::now().max(current.updated_at + TimeDelta::microseconds(1));

    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE persons SET updated_at = ");
    builder.push_bind(format_timestamp(updated_at));
    if let Some(name) = changes.name {
        builder
            .push(", name_folded = ")
            .push_bind(name.to_lowercase())
            .push(", name = ")
            .push_bind(name);
    }
    if let Some(sex) = changes.sex {
        builder.push(", sex = ").push_bind(sex.as_db_value());
    }
    if let Some(is_alive) = changes.is_alive {
        builder.push(", is_alive = ").push_bind(is_alive);
    }
    push_date_update(&mut builder, "birth_date", changes.birth_date);
    push_date_update(&mut builder, "death_date", changes.death_date);
    builder.push(" WHERE id = ").push_bind(person_id.as_db_value());
    builder.push(concat!(" RETURNING ", person_columns!()));

    let row = builder
        .build_query_as::<RawPersonRecord>()
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to update person", err))?
        .ok_or_else(|| person_not_found(person_id))?;
    let updated = row.normalize()?;
    commit(tx).await?;

    tracing::info!(person_id = %person_id, "person updated");
    Ok(updated)
}

fn push_date_update(
    builder: &mut QueryBuilder<'_, Sqlite>,
    column: &'static str,
    update: FieldUpdate<chrono::NaiveDate>,
) {
    match update {
        FieldUpdate::Unchanged => {}
        FieldUpdate::Clear => {
            builder.push(", ").push(column).push(" = NULL");
        }
        FieldUpdate::Set(date) => {
            builder
                .push(", ")
                .push(column)
                .push(" = ")
                .push_bind(format_date(date));
        }
    }
}

/// Removes the person and every incident edge; returns the record as it was.
pub async fn delete_person(pool: &SqlitePool, person_id: PersonId) -> Result<Person> {
    let mut tx = begin(pool).await?;
    if !lock_person(&mut tx, person_id).await? {
        return Err(person_not_found(person_id));
    }
    let snapshot = fetch_person(&mut tx, person_id)
        .await?
        .ok_or_else(|| person_not_found(person_id))?;
    let key = person_id.as_db_value();

    let parent_edges = sqlx::query("DELETE FROM parent_edges WHERE parent_id = ? OR child_id = ?")
        .bind(&key)
        .bind(&key)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to detach parent relationships", err))?
        .rows_affected();

    let spouse_edges = sqlx::query("DELETE FROM spouse_edges WHERE person_id = ? OR spouse_id = ?")
        .bind(&key)
        .bind(&key)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to detach spouse relationships", err))?
        .rows_affected();

    sqlx::query("DELETE FROM persons WHERE id = ?")
        .bind(&key)
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to delete person", err))?;

    commit(tx).await?;

    tracing::info!(
        person_id = %person_id,
        parent_edges,
        spouse_edges,
        "person deleted"
    );
    Ok(snapshot)
}

pub async fn list_persons(pool: &SqlitePool, query: ListPersonsQuery) -> Result<PersonsPage> {
    let query = query.normalize()?;
    let page = query.page;

    // Count and page come from the same read transaction.
    let mut tx = begin(pool).await?;

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM persons WHERE 1 = 1");
    push_person_filters(&mut count, &query.filter);
    let (total,) = count
        .build_query_as::<(i64,)>()
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to count people", err))?;

    let mut data = QueryBuilder::<Sqlite>::new(concat!(
        "SELECT ",
        person_columns!(),
        " FROM persons WHERE 1 = 1"
    ));
    push_person_filters(&mut data, &query.filter);
    data.push(" ORDER BY ")
        .push(page.sort_by.as_column())
        .push(" ")
        .push(page.sort_dir.as_sql())
        .push(", id ")
        .push(page.sort_dir.as_sql());
    data.push(" LIMIT ")
        .push_bind(i64::from(page.page_size))
        .push(" OFFSET ")
        .push_bind(page.offset());

    let rows = data
        .build_query_as::<RawPersonRecord>()
        .fetch_all(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to list people", err))?;
    commit(tx).await?;

    let data = rows
        .into_iter()
        .map(RawPersonRecord::normalize)
        .collect::<Result<Vec<_>>>()?;
    let total = u64::try_from(total).map_err(|err| {
        LibError::internal(
            "Person count out of range",
            anyhow!("count query returned {}: {}", total, err),
        )
    })?;

    Ok(PersonsPage {
        data,
        pagination: Pagination::new(page.page, page.page_size, total),
    })
}

fn push_person_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &PersonFilter) {
    if let Some(name) = &filter.name {
        builder
            .push(" AND instr(name_folded, ")
            .push_bind(name.to_lowercase())
            .push(") > 0");
    }
    if let Some(sex) = filter.sex {
        builder.push(" AND sex = ").push_bind(sex.as_db_value());
    }
    if let Some(is_alive) = filter.is_alive {
        builder.push(" AND is_alive = ").push_bind(is_alive);
    }
    push_range(builder, "birth_date", &filter.birth_date, format_date);
    push_range(builder, "death_date", &filter.death_date, format_date);
    push_range(builder, "created_at", &filter.created_at, format_timestamp);
    push_range(builder, "updated_at", &filter.updated_at, format_timestamp);
}

fn push_range<T: Copy>(
    builder: &mut QueryBuilder<'_, Sqlite>,
    column: &'static str,
    range: &Range<T>,
    format: fn(T) -> String,
) {
    if let Some(from) = range.from {
        builder
            .push(" AND ")
            .push(column)
            .push(" >= ")
            .push_bind(format(from));
    }
    if let Some(to) = range.to {
        builder
            .push(" AND ")
            .push(column)
            .push(" <= ")
            .push_bind(format(to));
    }
}

async fn parent_count(conn: &mut SqliteConnection, child_id: PersonId) -> Result<u32> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parent_edges WHERE child_id = ?")
        .bind(child_id.as_db_value())
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| db_err("Failed to count parents", err))?;
    u32::try_from(count).map_err(|err| {
        LibError::internal(
            "Parent count out of range",
            anyhow!("child {} has {} parents: {}", child_id, count, err),
        )
    })
}

async fn parent_edge_exists(
    conn: &mut SqliteConnection,
    child_id: PersonId,
    parent_id: PersonId,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM parent_edges WHERE parent_id = ? AND child_id = ?",
    )
    .bind(parent_id.as_db_value())
    .bind(child_id.as_db_value())
    .fetch_one(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to query parent relationship", err))?;
    Ok(count > 0)
}

async fn spouse_edge_exists(
    conn: &mut SqliteConnection,
    person_id: PersonId,
    spouse_id: PersonId,
) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM spouse_edges
        WHERE (person_id = ? AND spouse_id = ?)
           OR (person_id = ? AND spouse_id = ?)
        "#,
    )
    .bind(person_id.as_db_value())
    .bind(spouse_id.as_db_value())
    .bind(spouse_id.as_db_value())
    .bind(person_id.as_db_value())
    .fetch_one(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to query spouse relationship", err))?;
    Ok(count > 0)
}

pub async fn link_parent(
    pool: &SqlitePool,
    child_id: PersonId,
    parent_id: PersonId,
) -> Result<ParentLink> {
    invariants::ensure_not_self_parent(child_id, parent_id)?;

    let mut tx = begin(pool).await?;
    let child_exists = lock_person(&mut tx, child_id).await?;
    let parent = fetch_person(&mut tx, parent_id).await?;
    let existing_count = parent_count(&mut tx, child_id).await?;
    let relationship_exists = parent_edge_exists(&mut tx, child_id, parent_id).await?;

    invariants::ensure_parent_link(&ParentLinkSnapshot {
        child_exists,
        parent_exists: parent.is_some(),
        parent_count: existing_count,
        relationship_exists,
    })?;

    sqlx::query("INSERT INTO parent_edges (parent_id, child_id, created_at) VALUES (?, ?, ?)")
        .bind(parent_id.as_db_value())
        .bind(child_id.as_db_value())
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|err| edge_write_err("Failed to create parent relationship", err))?;

    let child = fetch_person(&mut tx, child_id)
        .await?
        .ok_or_else(|| person_not_found(child_id))?;
    let parent = parent.ok_or_else(|| LibError::message("Parent disappeared mid-transaction"))?;
    commit(tx).await?;

    let parent_count = existing_count + 1;
    tracing::info!(
        child_id = %child_id,
        parent_id = %parent_id,
        parent_count,
        "parent linked"
    );
    Ok(ParentLink {
        child,
        parent,
        parent_count,
    })
}

pub async fn unlink_parent(
    pool: &SqlitePool,
    child_id: PersonId,
    parent_id: PersonId,
) -> Result<u64> {
    let mut tx = begin(pool).await?;
    let child_exists = lock_person(&mut tx, child_id).await?;
    let parent_exists = person_exists(&mut tx, parent_id).await?;

    let removed = sqlx::query("DELETE FROM parent_edges WHERE parent_id = ? AND child_id = ?")
        .bind(parent_id.as_db_value())
        .bind(child_id.as_db_value())
        .execute(&mut *tx)
        .await
        .map_err(|err| db_err("Failed to delete parent relationship", err))?
        .rows_affected();

    invariants::ensure_unlink(
        RelationshipKind::Parent,
        &UnlinkSnapshot {
            anchor_exists: child_exists,
            other_exists: parent_exists,
            relationship_exists: removed > 0,
        },
    )?;
    commit(tx).await?;

    tracing::info!(child_id = %child_id, parent_id = %parent_id, "parent unlinked");
    Ok(removed)
}

pub async fn get_parents(pool: &SqlitePool, child_id: PersonId) -> Result<Parents> {
    let mut tx = begin(pool).await?;
    let child = fetch_person(&mut tx, child_id)
        .await?
        .ok_or_else(|| person_not_found(child_id))?;
    let parents = fetch_people(
        &mut tx,
        concat!(
            "SELECT ",
            person_columns!("p"),
            " FROM parent_edges e JOIN persons p ON p.id = e.parent_id",
            " WHERE e.child_id = ? ORDER BY p.created_at ASC, p.id ASC"
        ),
        &[child_id.as_db_value()],
    )
    .await?;
    commit(tx).await?;

    Ok(Parents { child, parents })
}

pub async fn link_spouse(
    pool: &SqlitePool,
    person_id: PersonId,
    spouse_id: PersonId,
) -> Result<SpouseLink> {
    invariants::ensure_not_self_spouse(person_id, spouse_id)?;

    let mut tx = begin(pool).await?;
    let person_exists = lock_person(&mut tx, person_id).await?;
    let spouse = fetch_person(&mut tx, spouse_id).await?;
    let relationship_exists = spouse_edge_exists(&mut tx, person_id, spouse_id).await?;

    invariants::ensure_spouse_link(&SpouseLinkSnapshot {
        person_exists,
        spouse_exists: spouse.is_some(),
        relationship_exists,
    })?;

    sqlx::query("INSERT INTO spouse_edges (person_id, spouse_id, created_at) VALUES (?, ?, ?)")
        .bind(person_id.as_db_value())
        .bind(spouse_id.as_db_value())
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|err| edge_write_err("Failed to create spouse relationship", err))?;

    let person = fetch_person(&mut tx, person_id)
        .await?
        .ok_or_else(|| person_not_found(person_id))?;
    let spouse = spouse.ok_or_else(|| LibError::message("Spouse disappeared mid-transaction"))?;
    commit(tx).await?;

    tracing::info!(person_id = %person_id, spouse_id = %spouse_id, "spouse linked");
    Ok(SpouseLink { person, spouse })
}

pub async fn unlink_spouse(
    pool: &SqlitePool,
    person_id: PersonId,
    spouse_id: PersonId,
) -> Result<u64> {
    let mut tx = begin(pool).await?;
    let anchor_exists = lock_person(&mut tx, person_id).await?;
    let spouse_exists = person_exists(&mut tx, spouse_id).await?;

    let removed = sqlx::query(
        r#"
        DELETE FROM spouse_edges
        WHERE (person_id = ? AND spouse_id = ?)
           OR (person_id = ? AND spouse_id = ?)
        "#,
    )
    .bind(person_id.as_db_value())
    .bind(spouse_id.as_db_value())
    .bind(spouse_id.as_db_value())
    .bind(person_id.as_db_value())
    .execute(&mut *tx)
    .await
    .map_err(|err| db_err("Failed to delete spouse relationship", err))?
    .rows_affected();

    invariants::ensure_unlink(
        RelationshipKind::Spouse,
        &UnlinkSnapshot {
            anchor_exists,
            other_exists: spouse_exists,
            relationship_exists: removed > 0,
        },
    )?;
    commit(tx).await?;

    tracing::info!(person_id = %person_id, spouse_id = %spouse_id, "spouse unlinked");
    Ok(removed)
}

pub async fn get_spouses(pool: &SqlitePool, person_id: PersonId) -> Result<Spouses> {
    let mut tx = begin(pool).await?;
    let person = fetch_person(&mut tx, person_id)
        .await?
        .ok_or_else(|| person_not_found(person_id))?;
    let spouses = fetch_people(
        &mut tx,
        concat!(
            "SELECT ",
            person_columns!("p"),
            " FROM persons p WHERE p.id IN (",
            "SELECT spouse_id FROM spouse_edges WHERE person_id = ? ",
            "UNION SELECT person_id FROM spouse_edges WHERE spouse_id = ?",
            ") ORDER BY p.created_at ASC, p.id ASC"
        ),
        &[person_id.as_db_value(), person_id.as_db_value()],
    )
    .await?;
    commit(tx).await?;

    Ok(Spouses { person, spouses })
}
