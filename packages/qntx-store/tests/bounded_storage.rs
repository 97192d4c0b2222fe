//! Bounded-storage enforcement against a real database.

use chrono::{Duration, Utc};
use qntx_store::asid::{self, AsidInput, IdPrefix};
use qntx_store::{Attestation, BoundedLimits, BoundedStore, EventType, Store, StorageEvent};

async fn store() -> Store {
    let store = Store::open_in_memory().await.unwrap();
    store.migrate().await.unwrap();
    store
}

fn attestation(subject: &str, context: &str, actor: &str, offset_mins: i64) -> Attestation {
    let id = asid::generate(
        IdPrefix::Attestation,
        &AsidInput {
            subject,
            predicate: "observed",
            context,
            actor,
        },
    );
    Attestation::builder()
        .id(id)
        .subjects(vec![subject.to_string()])
        .predicates(vec!["observed".to_string()])
        .contexts(vec![context.to_string()])
        .actors(vec![actor.to_string()])
        .timestamp(Utc::now() - Duration::minutes(200) + Duration::minutes(offset_mins))
        .source("test")
        .build()
}

#[tokio::test]
async fn actor_context_cap_evicts_oldest() {
    let store = store().await;
    let bounded = BoundedStore::new(&store, BoundedLimits::default());

    let mut first_id = None;
    for i in 0..65 {
        let a = bounded
            .insert(attestation("pkg:demo", "ctx:main", "actor:a", i))
            .await
            .unwrap();
        if i == 0 {
            first_id = Some(a.id);
        }
    }

    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM attestations a
        WHERE EXISTS (SELECT 1 FROM json_each(a.actors) WHERE value = 'actor:a')
          AND EXISTS (SELECT 1 FROM json_each(a.contexts) WHERE value = 'ctx:main')
        "#,
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(count, 64);

    // The earliest attestation is the one that was evicted.
    let first = first_id.unwrap();
    assert!(!Attestation::exists(store.pool(), &first).await.unwrap());

    let events = StorageEvent::recent(store.pool(), 10).await.unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.event_type, EventType::ActorContextLimit);
    assert_eq!(event.actor.as_deref(), Some("actor:a"));
    assert_eq!(event.context.as_deref(), Some("ctx:main"));
    assert_eq!(event.deletions_count, 1);
}

#[tokio::test]
async fn self_certifying_attestations_bypass_actor_context_cap() {
    let store = store().await;
    let bounded = BoundedStore::new(&store, BoundedLimits::default());

    for i in 0..100 {
        let mut a = attestation("pkg:demo", "ctx:main", "unused", i);
        a.actors = Vec::new(); // empty actor = self-certifying
        let inserted = bounded.insert(a).await.unwrap();
        assert!(inserted.is_self_certifying());
    }

    assert_eq!(Attestation::count(store.pool()).await.unwrap(), 100);
    let events = StorageEvent::recent(store.pool(), 10).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn actor_contexts_cap_evicts_least_recently_used_context() {
    let store = store().await;
    let limits = BoundedLimits {
        actor_contexts_limit: 3,
        ..BoundedLimits::default()
    };
    let bounded = BoundedStore::new(&store, limits);

    // ctx:0 is the least recently used once ctx:3 arrives.
    for i in 0..4 {
        bounded
            .insert(attestation("pkg:demo", &format!("ctx:{i}"), "actor:a", i))
            .await
            .unwrap();
    }

    let distinct: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(DISTINCT ctx.value)
        FROM attestations a, json_each(a.contexts) AS ctx
        WHERE EXISTS (SELECT 1 FROM json_each(a.actors) WHERE value = 'actor:a')
        "#,
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(distinct, 3);

    let events = StorageEvent::recent(store.pool(), 10).await.unwrap();
    let event = events
        .iter()
        .find(|e| e.event_type == EventType::ActorContextsLimit)
        .expect("contexts cap event");
    assert_eq!(event.actor.as_deref(), Some("actor:a"));
    assert_eq!(event.context.as_deref(), Some("ctx:0"));
    assert_eq!(event.deletions_count, 1);
}

#[tokio::test]
async fn entity_actors_cap_evicts_least_recently_involved_actor() {
    let store = store().await;
    let limits = BoundedLimits {
        entity_actors_limit: 2,
        ..BoundedLimits::default()
    };
    let bounded = BoundedStore::new(&store, limits);

    for (i, actor) in ["actor:old", "actor:mid", "actor:new"].iter().enumerate() {
        bounded
            .insert(attestation("pkg:shared", &format!("ctx:{i}"), actor, i as i64))
            .await
            .unwrap();
    }

    let distinct: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(DISTINCT act.value)
        FROM attestations a, json_each(a.actors) AS act
        WHERE EXISTS (SELECT 1 FROM json_each(a.subjects) WHERE value = 'pkg:shared')
        "#,
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(distinct, 2);

    let events = StorageEvent::recent(store.pool(), 10).await.unwrap();
    let event = events
        .iter()
        .find(|e| e.event_type == EventType::EntityActorsLimit)
        .expect("entity actors event");
    assert_eq!(event.entity.as_deref(), Some("pkg:shared"));
    assert_eq!(event.actor.as_deref(), Some("actor:old"));
}

#[tokio::test]
async fn caps_hold_for_every_key_under_mixed_load() {
    let store = store().await;
    let limits = BoundedLimits {
        actor_context_limit: 3,
        actor_contexts_limit: 2,
        entity_actors_limit: 2,
    };
    let bounded = BoundedStore::new(&store, limits);

    let mut t = 0;
    for actor in ["actor:a", "actor:b", "actor:c"] {
        for context in ["ctx:0", "ctx:1", "ctx:2"] {
            for entity in ["pkg:x", "pkg:y"] {
                for _ in 0..4 {
                    let inserted = bounded
                        .insert(attestation(entity, context, actor, t))
                        .await
                        .unwrap();
                    assert!(qntx_store::asid::is_valid(&inserted.id));
                    t += 1;
                }
            }
        }
    }

    // Every (actor, context) pair stays under the pair cap.
    let pair_counts: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM attestations a, json_each(a.actors) AS act, json_each(a.contexts) AS ctx
        GROUP BY act.value, ctx.value
        "#,
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert!(pair_counts.iter().all(|&c| c <= limits.actor_context_limit));

    // Every actor stays under the distinct-context cap.
    let context_counts: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT COUNT(DISTINCT ctx.value)
        FROM attestations a, json_each(a.actors) AS act, json_each(a.contexts) AS ctx
        GROUP BY act.value
        "#,
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert!(context_counts
        .iter()
        .all(|&c| c <= limits.actor_contexts_limit));

    // Every entity stays under the distinct-actor cap.
    let actor_counts: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT COUNT(DISTINCT act.value)
        FROM attestations a, json_each(a.subjects) AS sub, json_each(a.actors) AS act
        GROUP BY sub.value
        "#,
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert!(actor_counts.iter().all(|&c| c <= limits.entity_actors_limit));
}

#[tokio::test]
async fn insert_rejects_empty_subjects() {
    let store = store().await;
    let bounded = BoundedStore::new(&store, BoundedLimits::default());

    let mut a = attestation("pkg:demo", "ctx:main", "actor:a", 0);
    a.subjects = Vec::new();
    let err = bounded.insert(a).await.unwrap_err();
    assert!(matches!(err, qntx_store::StoreError::EmptySubjects));
}

#[tokio::test]
async fn round_trip_preserves_arrays_and_attributes() {
    let store = store().await;
    let bounded = BoundedStore::new(&store, BoundedLimits::default());

    let mut a = attestation("pkg:demo", "ctx:main", "actor:a", 0);
    a.subjects = vec!["pkg:demo".to_string(), "pkg:extra".to_string()];
    a.attributes.insert(
        "confidence".to_string(),
        serde_json::Value::from(0.95_f64),
    );

    let inserted = bounded.insert(a.clone()).await.unwrap();
    let fetched = Attestation::get(store.pool(), &inserted.id).await.unwrap();
    assert_eq!(fetched.subjects, a.subjects);
    assert_eq!(fetched.attributes, a.attributes);
    assert_eq!(fetched.actors, vec!["actor:a".to_string()]);
}

#[tokio::test]
async fn warning_reported_between_half_and_full() {
    let store = store().await;
    let limits = BoundedLimits {
        actor_context_limit: 10,
        ..BoundedLimits::default()
    };
    let bounded = BoundedStore::new(&store, limits);

    let mut last = None;
    for i in 0..5 {
        let mut a = attestation("pkg:demo", "ctx:hot", "actor:a", i);
        // Recent activity so the day window sees all five rows.
        a.timestamp = Utc::now() - Duration::minutes(5 - i);
        last = Some(bounded.insert(a).await.unwrap());
    }

    let warnings = bounded.warnings_for(&last.unwrap()).await.unwrap();
    assert_eq!(warnings.len(), 1);
    let w = &warnings[0];
    assert_eq!(w.current, 5);
    assert_eq!(w.limit, 10);
    assert_eq!(w.actor, "actor:a");
    assert_eq!(w.context, "ctx:hot");
    assert!(w.rate_per_hour > 0.0);
    // All activity landed in the last day, so the pair is accelerating.
    assert!(w.acceleration_factor.is_some());
    assert!(w.time_until_full.is_some());
}

#[tokio::test]
async fn no_warning_below_half_of_cap() {
    let store = store().await;
    let limits = BoundedLimits {
        actor_context_limit: 10,
        ..BoundedLimits::default()
    };
    let bounded = BoundedStore::new(&store, limits);

    let mut last = None;
    for i in 0..4 {
        let mut a = attestation("pkg:demo", "ctx:cool", "actor:a", i);
        a.timestamp = Utc::now() - Duration::minutes(10 - i);
        last = Some(bounded.insert(a).await.unwrap());
    }

    let warnings = bounded.warnings_for(&last.unwrap()).await.unwrap();
    assert!(warnings.is_empty());
}
