//! Storage enforcement telemetry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteExecutor};

use crate::error::StoreError;

/// Which cap an enforcement deletion was taken under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ActorContextLimit,
    ActorContextsLimit,
    EntityActorsLimit,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ActorContextLimit => "actor_context_limit",
            EventType::ActorContextsLimit => "actor_contexts_limit",
            EventType::EntityActorsLimit => "entity_actors_limit",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "actor_context_limit" => Ok(EventType::ActorContextLimit),
            "actor_contexts_limit" => Ok(EventType::ActorContextsLimit),
            "entity_actors_limit" => Ok(EventType::EntityActorsLimit),
            _ => Err(format!("unknown storage event type: {s}")),
        }
    }
}

impl TryFrom<String> for EventType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One row per enforcement deletion pass.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StorageEvent {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub event_type: EventType,
    pub actor: Option<String>,
    pub context: Option<String>,
    pub entity: Option<String>,
    pub deletions_count: i64,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StorageEvent {
    /// Record an enforcement deletion.
    pub(crate) async fn record<'e, E>(
        executor: E,
        event_type: EventType,
        actor: Option<&str>,
        context: Option<&str>,
        entity: Option<&str>,
        deletions_count: i64,
    ) -> Result<(), sqlx::Error>
    where
        E: SqliteExecutor<'e>,
    {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO storage_events (event_type, actor, context, entity, deletions_count, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event_type.as_str())
        .bind(actor)
        .bind(context)
        .bind(entity)
        .bind(deletions_count)
        .bind(now)
        .bind(now)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Most recent enforcement events, newest first.
    pub async fn recent<'e, E>(executor: E, limit: i64) -> Result<Vec<Self>, StoreError>
    where
        E: SqliteExecutor<'e>,
    {
        let events = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, event_type, actor, context, entity, deletions_count, timestamp, created_at
            FROM storage_events
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(executor)
        .await?;

        Ok(events)
    }
}
