//! Identity store boundary
//!
//! The pipeline only reads persons; resolution and merging belong to the
//! identity steps and the store itself.

use crate::error::PipelineResult;
use crate::event::Person;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read access to person records keyed by `(team_id, distinct_id)`
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Fetch the person currently associated with a distinct id, if any
    async fn fetch_person(&self, team_id: i64, distinct_id: &str)
        -> PipelineResult<Option<Person>>;
}

/// Process-local identity store
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    persons: RwLock<HashMap<(i64, String), Person>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a distinct id with a person, replacing any previous mapping
    pub async fn insert(&self, distinct_id: impl Into<String>, person: Person) {
        let mut persons = self.persons.write().await;
        persons.insert((person.team_id, distinct_id.into()), person);
    }

    pub async fn len(&self) -> usize {
        self.persons.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.persons.read().await.is_empty()
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn fetch_person(
        &self,
        team_id: i64,
        distinct_id: &str,
    ) -> PipelineResult<Option<Person>> {
        let persons = self.persons.read().await;
        Ok(persons.get(&(team_id, distinct_id.to_string())).cloned())
    }
}
