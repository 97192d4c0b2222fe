//! Bounded-storage enforcement.
//!
//! Every insert runs inside one transaction: write the row, then walk the
//! three caps in order, evicting and recording telemetry until each count is
//! back under its limit. A failure anywhere rolls the whole insert back.
//!
//! Cap semantics:
//! 1. `actor_context_limit` - attestations per (actor, context) pair; oldest
//!    evicted first. Self-certifying rows are exempt from this cap only.
//! 2. `actor_contexts_limit` - distinct contexts per actor; the
//!    least-recently-used context is evicted wholesale.
//! 3. `entity_actors_limit` - distinct actors per subject entity; the
//!    least-recently-involved actor's attestations about that entity are
//!    evicted, oldest first.

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::attestation::Attestation;
use crate::error::StoreError;
use crate::events::{EventType, StorageEvent};
use crate::store::Store;
use crate::warnings::{self, StorageWarning};

/// Membership predicate fragments. `json_extract(actors, '$[0]') IS NOT id`
/// excludes self-certifying rows from (actor, context) accounting.
pub(crate) const PAIR_COUNT_SQL: &str = r#"
    SELECT COUNT(*)
    FROM attestations a
    WHERE EXISTS (SELECT 1 FROM json_each(a.actors) WHERE json_each.value = ?1)
      AND EXISTS (SELECT 1 FROM json_each(a.contexts) WHERE json_each.value = ?2)
      AND json_extract(a.actors, '$[0]') IS NOT a.id
"#;

const PAIR_EVICT_SQL: &str = r#"
    DELETE FROM attestations
    WHERE id IN (
        SELECT a.id
        FROM attestations a
        WHERE EXISTS (SELECT 1 FROM json_each(a.actors) WHERE json_each.value = ?1)
          AND EXISTS (SELECT 1 FROM json_each(a.contexts) WHERE json_each.value = ?2)
          AND json_extract(a.actors, '$[0]') IS NOT a.id
        ORDER BY a.timestamp ASC, a.id ASC
        LIMIT ?3
    )
"#;

const DISTINCT_CONTEXTS_SQL: &str = r#"
    SELECT COUNT(DISTINCT ctx.value)
    FROM attestations a, json_each(a.contexts) AS ctx
    WHERE EXISTS (SELECT 1 FROM json_each(a.actors) WHERE json_each.value = ?1)
"#;

const LRU_CONTEXT_SQL: &str = r#"
    SELECT ctx.value
    FROM attestations a, json_each(a.contexts) AS ctx
    WHERE EXISTS (SELECT 1 FROM json_each(a.actors) WHERE json_each.value = ?1)
    GROUP BY ctx.value
    ORDER BY MAX(a.timestamp) ASC, ctx.value ASC
    LIMIT 1
"#;

const ACTOR_CONTEXT_EVICT_SQL: &str = r#"
    DELETE FROM attestations
    WHERE id IN (
        SELECT a.id
        FROM attestations a
        WHERE EXISTS (SELECT 1 FROM json_each(a.actors) WHERE json_each.value = ?1)
          AND EXISTS (SELECT 1 FROM json_each(a.contexts) WHERE json_each.value = ?2)
    )
"#;

const DISTINCT_ACTORS_SQL: &str = r#"
    SELECT COUNT(DISTINCT act.value)
    FROM attestations a, json_each(a.actors) AS act
    WHERE EXISTS (SELECT 1 FROM json_each(a.subjects) WHERE json_each.value = ?1)
"#;

const LRU_ACTOR_SQL: &str = r#"
    SELECT act.value
    FROM attestations a, json_each(a.actors) AS act
    WHERE EXISTS (SELECT 1 FROM json_each(a.subjects) WHERE json_each.value = ?1)
    GROUP BY act.value
    ORDER BY MAX(a.timestamp) ASC, act.value ASC
    LIMIT 1
"#;

const ENTITY_ACTOR_EVICT_SQL: &str = r#"
    DELETE FROM attestations
    WHERE id IN (
        SELECT a.id
        FROM attestations a
        WHERE EXISTS (SELECT 1 FROM json_each(a.subjects) WHERE json_each.value = ?1)
          AND EXISTS (SELECT 1 FROM json_each(a.actors) WHERE json_each.value = ?2)
        ORDER BY a.timestamp ASC, a.id ASC
    )
"#;

/// Hard caps on the attestation graph.
#[derive(Debug, Clone, Copy)]
pub struct BoundedLimits {
    /// Attestations per (actor, context) pair.
    pub actor_context_limit: i64,
    /// Distinct contexts per actor.
    pub actor_contexts_limit: i64,
    /// Distinct actors per subject entity.
    pub entity_actors_limit: i64,
}

impl Default for BoundedLimits {
    fn default() -> Self {
        Self {
            actor_context_limit: 64,
            actor_contexts_limit: 64,
            entity_actors_limit: 64,
        }
    }
}

/// Attestation writer that keeps the graph under [`BoundedLimits`].
#[derive(Clone)]
pub struct BoundedStore {
    pool: SqlitePool,
    limits: BoundedLimits,
}

impl BoundedStore {
    pub fn new(store: &Store, limits: BoundedLimits) -> Self {
        Self {
            pool: store.pool().clone(),
            limits,
        }
    }

    pub fn limits(&self) -> BoundedLimits {
        self.limits
    }

    /// Insert an attestation, enforcing every cap before commit.
    ///
    /// An attestation built with no actors is self-certifying: its actor is
    /// set to its own id here, which exempts it from the (actor, context)
    /// cap.
    pub async fn insert(&self, mut attestation: Attestation) -> Result<Attestation, StoreError> {
        if attestation.subjects.is_empty() {
            return Err(StoreError::EmptySubjects);
        }
        if attestation.actors.is_empty() {
            attestation.actors = vec![attestation.id.clone()];
        }

        let mut tx = self.pool.begin().await?;
        attestation.insert_row(&mut *tx).await?;

        if !attestation.is_self_certifying() {
            for actor in dedup(&attestation.actors) {
                for context in dedup(&attestation.contexts) {
                    self.enforce_actor_context(&mut tx, actor, context).await?;
                }
            }
        }

        for actor in dedup(&attestation.actors) {
            self.enforce_actor_contexts(&mut tx, actor).await?;
        }

        for entity in dedup(&attestation.subjects) {
            self.enforce_entity_actors(&mut tx, entity).await?;
        }

        tx.commit().await?;
        Ok(attestation)
    }

    /// Cap 1: attestations per (actor, context) pair.
    async fn enforce_actor_context(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        actor: &str,
        context: &str,
    ) -> Result<(), StoreError> {
        let cap = EventType::ActorContextLimit;
        let key = || format!("{actor}/{context}");

        let count: i64 = sqlx::query_scalar(PAIR_COUNT_SQL)
            .bind(actor)
            .bind(context)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| cap_error(cap, key(), 0, e))?;

        let excess = count - self.limits.actor_context_limit;
        if excess <= 0 {
            return Ok(());
        }

        let deleted = sqlx::query(PAIR_EVICT_SQL)
            .bind(actor)
            .bind(context)
            .bind(excess)
            .execute(&mut **tx)
            .await
            .map_err(|e| cap_error(cap, key(), count, e))?
            .rows_affected() as i64;

        debug!(actor, context, deleted, "actor/context cap enforced");
        StorageEvent::record(&mut **tx, cap, Some(actor), Some(context), None, deleted)
            .await
            .map_err(|e| cap_error(cap, key(), count, e))?;

        Ok(())
    }

    /// Cap 2: distinct contexts per actor. Evicts the least-recently-used
    /// context wholesale until the distinct count fits.
    async fn enforce_actor_contexts(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        actor: &str,
    ) -> Result<(), StoreError> {
        let cap = EventType::ActorContextsLimit;

        loop {
            let distinct: i64 = sqlx::query_scalar(DISTINCT_CONTEXTS_SQL)
                .bind(actor)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| cap_error(cap, actor.to_string(), 0, e))?;

            if distinct <= self.limits.actor_contexts_limit {
                return Ok(());
            }

            let lru: Option<String> = sqlx::query_scalar(LRU_CONTEXT_SQL)
                .bind(actor)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| cap_error(cap, actor.to_string(), distinct, e))?;

            let Some(context) = lru else {
                return Ok(());
            };

            let deleted = sqlx::query(ACTOR_CONTEXT_EVICT_SQL)
                .bind(actor)
                .bind(&context)
                .execute(&mut **tx)
                .await
                .map_err(|e| cap_error(cap, actor.to_string(), distinct, e))?
                .rows_affected() as i64;

            debug!(actor, context = %context, deleted, "actor contexts cap enforced");
            StorageEvent::record(&mut **tx, cap, Some(actor), Some(&context), None, deleted)
                .await
                .map_err(|e| cap_error(cap, actor.to_string(), distinct, e))?;
        }
    }

    /// Cap 3: distinct actors per entity. Evicts the least-recently-involved
    /// actor's attestations about the entity, oldest overall first.
    async fn enforce_entity_actors(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entity: &str,
    ) -> Result<(), StoreError> {
        let cap = EventType::EntityActorsLimit;

        loop {
            let distinct: i64 = sqlx::query_scalar(DISTINCT_ACTORS_SQL)
                .bind(entity)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| cap_error(cap, entity.to_string(), 0, e))?;

            if distinct <= self.limits.entity_actors_limit {
                return Ok(());
            }

            let lru: Option<String> = sqlx::query_scalar(LRU_ACTOR_SQL)
                .bind(entity)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| cap_error(cap, entity.to_string(), distinct, e))?;

            let Some(actor) = lru else {
                return Ok(());
            };

            let deleted = sqlx::query(ENTITY_ACTOR_EVICT_SQL)
                .bind(entity)
                .bind(&actor)
                .execute(&mut **tx)
                .await
                .map_err(|e| cap_error(cap, entity.to_string(), distinct, e))?
                .rows_affected() as i64;

            debug!(entity, actor = %actor, deleted, "entity actors cap enforced");
            StorageEvent::record(&mut **tx, cap, Some(&actor), None, Some(entity), deleted)
                .await
                .map_err(|e| cap_error(cap, entity.to_string(), distinct, e))?;
        }
    }

    /// Advisory soft warnings for the (actor, context) pairs on an
    /// attestation. Non-transactional; call after a successful insert.
    pub async fn warnings_for(
        &self,
        attestation: &Attestation,
    ) -> Result<Vec<StorageWarning>, StoreError> {
        let mut out = Vec::new();
        if attestation.is_self_certifying() {
            return Ok(out);
        }

        for actor in dedup(&attestation.actors) {
            for context in dedup(&attestation.contexts) {
                if let Some(warning) = warnings::check_pair(
                    &self.pool,
                    actor,
                    context,
                    self.limits.actor_context_limit,
                )
                .await?
                {
                    out.push(warning);
                }
            }
        }

        Ok(out)
    }
}

fn cap_error(cap: EventType, key: String, count: i64, source: sqlx::Error) -> StoreError {
    StoreError::CapEnforcement {
        cap,
        key,
        count,
        source,
    }
}

/// First occurrence of each value, preserving order.
fn dedup(values: &[String]) -> Vec<&str> {
    let mut seen = Vec::with_capacity(values.len());
    for v in values {
        if !seen.contains(&v.as_str()) {
            seen.push(v.as_str());
        }
    }
    seen
}
