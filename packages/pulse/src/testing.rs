//! Test support shared by the integration suites.

use qntx_store::asid::{self, AsidInput, IdPrefix};
use qntx_store::Store;

use crate::job::Job;

/// A migrated in-memory store.
pub async fn memory_store() -> Store {
    let store = Store::open_in_memory()
        .await
        .expect("in-memory store opens");
    store.migrate().await.expect("migrations apply");
    store
}

/// A queued job for `handler` with a fresh `JB` id.
pub fn job(handler: &str, payload: &[u8]) -> Job {
    let id = asid::generate(
        IdPrefix::Job,
        &AsidInput {
            subject: handler,
            predicate: "run",
            context: "test",
            actor: "tester",
        },
    );
    Job::builder()
        .id(id)
        .handler_name(handler.to_string())
        .source("test")
        .payload(payload.to_vec())
        .build()
}
