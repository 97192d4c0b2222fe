//! Attestation model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, SqliteExecutor};
use typed_builder::TypedBuilder;

use crate::error::StoreError;

/// An immutable claim record.
///
/// Created through [`crate::BoundedStore::insert`], never mutated, deleted
/// only by cap enforcement. The tuple (primary actor, first context) is the
/// key bounded-storage accounting runs on.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Attestation {
    /// 32-character ASID, unique.
    pub id: String,

    /// Non-empty ordered sequence of entities the claim is about.
    #[sqlx(json)]
    pub subjects: Vec<String>,

    #[sqlx(json)]
    #[builder(default)]
    pub predicates: Vec<String>,

    #[sqlx(json)]
    #[builder(default)]
    pub contexts: Vec<String>,

    /// Attesting actors. Empty at construction means self-certifying: the
    /// bounded store sets the actor to the attestation's own id on insert.
    #[sqlx(json)]
    #[builder(default)]
    pub actors: Vec<String>,

    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,

    #[builder(default)]
    pub source: String,

    #[sqlx(json)]
    #[builder(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Attestation {
    /// The actor bounded-storage accounting keys on.
    pub fn primary_actor(&self) -> Option<&str> {
        self.actors.first().map(String::as_str)
    }

    /// Whether this attestation certifies itself (actor equals own id).
    pub fn is_self_certifying(&self) -> bool {
        self.primary_actor() == Some(self.id.as_str())
    }

    /// Insert the raw row. No cap enforcement; the bounded store calls this
    /// inside its enforcement transaction.
    pub(crate) async fn insert_row<'e, E>(&self, executor: E) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO attestations (id, subjects, predicates, contexts, actors, timestamp, source, attributes)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.id)
        .bind(Json(&self.subjects))
        .bind(Json(&self.predicates))
        .bind(Json(&self.contexts))
        .bind(Json(&self.actors))
        .bind(self.timestamp)
        .bind(&self.source)
        .bind(Json(&self.attributes))
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Fetch by id.
    pub async fn get<'e, E>(executor: E, id: &str) -> Result<Self, StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, subjects, predicates, contexts, actors, timestamp, source, attributes
            FROM attestations
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Whether an attestation with this id exists.
    pub async fn exists<'e, E>(executor: E, id: &str) -> Result<bool, StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM attestations WHERE id = ?")
            .bind(id)
            .fetch_optional(executor)
            .await?;
        Ok(found.is_some())
    }

    /// Total number of stored attestations.
    pub async fn count<'e, E>(executor: E) -> Result<i64, StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attestations")
            .fetch_one(executor)
            .await?;
        Ok(count)
    }
}
