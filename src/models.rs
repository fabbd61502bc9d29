use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{LibError, Result};

pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersonId(pub Uuid);

impl PersonId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Hyphenated lowercase form used as the stored key.
    pub fn as_db_value(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl Default for PersonId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PersonId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

impl From<Uuid> for PersonId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "male" => Some(Sex::Male),
            "female" => Some(Sex::Female),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub sex: Sex,
    pub is_alive: bool,
    pub birth_date: Option<NaiveDate>,
    pub death_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A person row exactly as the store hands it back, before any coercion.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RawPersonRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub sex: Option<String>,
    pub is_alive: Option<bool>,
    pub birth_date: Option<String>,
    pub death_date: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl RawPersonRecord {
    /// Converts a stored row into the typed record.
    ///
    /// Optional dates that cannot be read are dropped. Identity, name, sex, living status
    /// and both timestamps are required; a row missing any of them is corrupt.
    pub fn normalize(self) -> Result<Person> {
        let raw_id = self
            .id
            .ok_or_else(|| LibError::corrupt_record(anyhow!("person row has no id")))?;
        let id = PersonId::from_str(&raw_id).map_err(|err| {
            LibError::corrupt_record(anyhow!("person row id {:?} is not a uuid: {}", raw_id, err))
        })?;

        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| LibError::corrupt_record(anyhow!("person {} has no name", id)))?;
        let sex = self
            .sex
            .as_deref()
            .and_then(Sex::from_db_value)
            .ok_or_else(|| {
                LibError::corrupt_record(anyhow!("person {} has invalid sex {:?}", id, self.sex))
            })?;
        let is_alive = self.is_alive.ok_or_else(|| {
            LibError::corrupt_record(anyhow!("person {} has no living status", id))
        })?;

        let created_at = self
            .created_at
            .as_deref()
            .and_then(coerce_timestamp)
            .ok_or_else(|| {
                LibError::corrupt_record(anyhow!(
                    "person {} has unreadable createdAt {:?}",
                    id,
                    self.created_at
                ))
            })?;
        let updated_at = self
            .updated_at
            .as_deref()
            .and_then(coerce_timestamp)
            .ok_or_else(|| {
                LibError::corrupt_record(anyhow!(
                    "person {} has unreadable updatedAt {:?}",
                    id,
                    self.updated_at
                ))
            })?;

        Ok(Person {
            id,
            name,
            sex,
            is_alive,
            birth_date: self.birth_date.as_deref().and_then(coerce_date),
            death_date: self.death_date.as_deref().and_then(coerce_date),
            created_at,
            updated_at,
        })
    }
}

pub fn coerce_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    coerce_timestamp(value).map(|timestamp| timestamp.date_naive())
}

pub fn coerce_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.with_timezone(&Utc));
    }
    // SQLite's CURRENT_TIMESTAMP layout, always UTC.
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Fixed-width layout so stored timestamps order lexically.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Three-state edit field: absent leaves the value alone, `null` clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    Unchanged,
    Clear,
    Set(T),
}

impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        FieldUpdate::Unchanged
    }
}

impl<T> FieldUpdate<T> {
    pub const fn is_unchanged(&self) -> bool {
        matches!(self, FieldUpdate::Unchanged)
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            FieldUpdate::Set(value) => Some(value),
            _ => None,
        }
    }
}

impl<'de, T> Deserialize<'de> for FieldUpdate<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => FieldUpdate::Set(value),
            None => FieldUpdate::Clear,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePersonPayload {
    pub name: String,
    pub sex: Sex,
    pub is_alive: bool,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
    #[serde(default)]
    pub death_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct NewPerson {
    pub name: String,
    pub sex: Sex,
    pub is_alive: bool,
    pub birth_date: Option<NaiveDate>,
    pub death_date: Option<NaiveDate>,
}

impl CreatePersonPayload {
    pub fn normalize(self) -> Result<NewPerson> {
        Ok(NewPerson {
            name: normalize_name(self.name)?,
            sex: self.sex,
            is_alive: self.is_alive,
            birth_date: self.birth_date,
            death_date: self.death_date,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EditPersonPayload {
    #[serde(default)]
    pub name: FieldUpdate<String>,
    #[serde(default)]
    pub sex: FieldUpdate<Sex>,
    #[serde(default)]
    pub is_alive: FieldUpdate<bool>,
    #[serde(default)]
    pub birth_date: FieldUpdate<NaiveDate>,
    #[serde(default)]
    pub death_date: FieldUpdate<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonChanges {
    pub name: Option<String>,
    pub sex: Option<Sex>,
    pub is_alive: Option<bool>,
    pub birth_date: FieldUpdate<NaiveDate>,
    pub death_date: FieldUpdate<NaiveDate>,
}

impl EditPersonPayload {
    pub fn normalize(self) -> Result<PersonChanges> {
        if self.name.is_unchanged()
            && self.sex.is_unchanged()
            && self.is_alive.is_unchanged()
            && self.birth_date.is_unchanged()
            && self.death_date.is_unchanged()
        {
            return Err(LibError::invalid(
                "No editable fields provided",
                anyhow!("edit payload had no fields"),
            ));
        }

        let name = match self.name {
            FieldUpdate::Unchanged => None,
            FieldUpdate::Clear => return Err(required_field_cleared("name")),
            FieldUpdate::Set(name) => Some(normalize_name(name)?),
        };
        let sex = match self.sex {
            FieldUpdate::Unchanged => None,
            FieldUpdate::Clear => return Err(required_field_cleared("sex")),
            FieldUpdate::Set(sex) => Some(sex),
        };
        let is_alive = match self.is_alive {
            FieldUpdate::Unchanged => None,
            FieldUpdate::Clear => return Err(required_field_cleared("isAlive")),
            FieldUpdate::Set(is_alive) => Some(is_alive),
        };

        Ok(PersonChanges {
            name,
            sex,
            is_alive,
            birth_date: self.birth_date,
            death_date: self.death_date,
        })
    }
}

fn required_field_cleared(field: &'static str) -> LibError {
    LibError::invalid(
        "Required person fields cannot be cleared",
        anyhow!("edit payload set {} to null", field),
    )
}

fn normalize_name(name: String) -> Result<String> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(LibError::invalid(
            "Person name is required",
            anyhow!("empty person name"),
        ));
    }
    Ok(name)
}

/// Keys the person listing may be ordered by. Anything else fails to deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortKey {
    #[serde(rename = "createdAt")]
    CreatedAt,
    #[default]
    #[serde(rename = "updatedAt")]
    UpdatedAt,
    #[serde(rename = "name")]
    Name,
}

impl SortKey {
    pub const fn as_column(self) -> &'static str {
        match self {
            SortKey::CreatedAt => "created_at",
            SortKey::UpdatedAt => "updated_at",
            SortKey::Name => "name",
        }
    }
}

impl FromStr for SortKey {
    type Err = LibError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "createdAt" => Ok(SortKey::CreatedAt),
            "updatedAt" => Ok(SortKey::UpdatedAt),
            "name" => Ok(SortKey::Name),
            other => Err(LibError::invalid(
                "sortBy must be one of createdAt, updatedAt, name",
                anyhow!("rejected sort key {:?}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub const fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPersonsQuery {
    pub name: Option<String>,
    pub sex: Option<Sex>,
    pub is_alive: Option<bool>,
    #[serde(rename = "birthDate_from")]
    pub birth_date_from: Option<NaiveDate>,
    #[serde(rename = "birthDate_to")]
    pub birth_date_to: Option<NaiveDate>,
    #[serde(rename = "deathDate_from")]
    pub death_date_from: Option<NaiveDate>,
    #[serde(rename = "deathDate_to")]
    pub death_date_to: Option<NaiveDate>,
    #[serde(rename = "createdAt_from", default, deserialize_with = "lower_bound")]
    pub created_at_from: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt_to", default, deserialize_with = "upper_bound")]
    pub created_at_to: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt_from", default, deserialize_with = "lower_bound")]
    pub updated_at_from: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt_to", default, deserialize_with = "upper_bound")]
    pub updated_at_to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub sort_by: Option<SortKey>,
    pub sort_dir: Option<SortDirection>,
}

/// Reads a timestamp range bound. A bare `YYYY-MM-DD` covers the whole UTC day: midnight for
/// a lower bound, the last microsecond for an upper one.
pub fn parse_timestamp_bound(value: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Some(timestamp.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)?
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)?
    };
    Some(date.and_time(time).and_utc())
}

fn timestamp_bound<'de, D>(
    deserializer: D,
    end_of_day: bool,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| {
            parse_timestamp_bound(&raw, end_of_day)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp {:?}", raw)))
        })
        .transpose()
}

fn lower_bound<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    timestamp_bound(deserializer, false)
}

fn upper_bound<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    timestamp_bound(deserializer, true)
}

/// Inclusive bounds; either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range<T> {
    pub from: Option<T>,
    pub to: Option<T>,
}

impl<T> Default for Range<T> {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
        }
    }
}

impl<T> Range<T> {
    pub fn new(from: Option<T>, to: Option<T>) -> Self {
        Self { from, to }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersonFilter {
    pub name: Option<String>,
    pub sex: Option<Sex>,
    pub is_alive: Option<bool>,
    pub birth_date: Range<NaiveDate>,
    pub death_date: Range<NaiveDate>,
    pub created_at: Range<DateTime<Utc>>,
    pub updated_at: Range<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub sort_by: SortKey,
    pub sort_dir: SortDirection,
}

impl PageRequest {
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)).saturating_mul(i64::from(self.page_size))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonQuery {
    pub filter: PersonFilter,
    pub page: PageRequest,
}

impl ListPersonsQuery {
    pub fn normalize(self) -> Result<PersonQuery> {
        let page = self.page.unwrap_or(1);
        if page < 1 {
            return Err(LibError::invalid(
                "page must be at least 1",
                anyhow!("page {} below minimum", page),
            ));
        }
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(LibError::invalid(
                "pageSize must be between 1 and 100",
                anyhow!("pageSize {} out of range", page_size),
            ));
        }

        let name = self
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        Ok(PersonQuery {
            filter: PersonFilter {
                name,
                sex: self.sex,
                is_alive: self.is_alive,
                birth_date: Range::new(self.birth_date_from, self.birth_date_to),
                death_date: Range::new(self.death_date_from, self.death_date_to),
                created_at: Range::new(self.created_at_from, self.created_at_to),
                updated_at: Range::new(self.updated_at_from, self.updated_at_to),
            },
            page: PageRequest {
                page,
                page_size,
                sort_by: self.sort_by.unwrap_or_default(),
                sort_dir: self.sort_dir.unwrap_or_default(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

impl Pagination {
    pub fn new(page: u32, page_size: u32, total: u64) -> Self {
        let total_pages = total.div_ceil(u64::from(page_size.max(1))).max(1);
        Self {
            page,
            page_size,
            total,
            total_pages,
            has_next_page: u64::from(page) < total_pages,
            has_prev_page: page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonsPage {
    pub data: Vec<Person>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentLink {
    pub child: Person,
    pub parent: Person,
    pub parent_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Parents {
    pub child: Person,
    pub parents: Vec<Person>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpouseLink {
    pub person: Person,
    pub spouse: Person,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Spouses {
    pub person: Person,
    pub spouses: Vec<Person>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Removed {
    pub removed: u64,
}

/// Success envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Detail<T> {
    pub detail: T,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Failure envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    /// Internal failures keep an opaque message and drop any details.
    pub fn from_error(err: &LibError) -> Self {
        let (message, details) = if err.kind.is_internal() {
            ("Unknown error occurred.", None)
        } else {
            (err.public, err.details.clone())
        };
        Self {
            error: ErrorBody {
                code: err.code,
                message,
                details,
            },
        }
    }
}
