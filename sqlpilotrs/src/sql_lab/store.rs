//! Persistence of Query rows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Result, SqlPilotError};

use super::query::{Query, QueryId};

/// One read-modify-write applied to a row.
pub type QueryMutation = Box<dyn FnOnce(&mut Query) + Send>;

/// Every write is a single atomic commit of one row.
#[async_trait]
pub trait QueryStore: Send + Sync {
    /// Persist a new row and return it with its assigned id.
    async fn insert(&self, query: Query) -> Result<Query>;

    async fn get(&self, id: QueryId) -> Result<Option<Query>>;

    /// Apply `mutation` to the stored row and return the updated copy.
    async fn modify(&self, id: QueryId, mutation: QueryMutation) -> Result<Query>;

    /// Most recent row submitted under `client_id`.
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Query>>;
}

#[derive(Debug, Default)]
pub struct InMemoryQueryStore {
    rows: Mutex<HashMap<QueryId, Query>>,
    next_id: AtomicU64,
}

impl InMemoryQueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }
}

#[async_trait]
impl QueryStore for InMemoryQueryStore {
    async fn insert(&self, mut query: Query) -> Result<Query> {
        query.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows.lock().await.insert(query.id, query.clone());
        tracing::debug!(query_id = query.id, status = %query.status, "query row inserted");
        Ok(query)
    }

    async fn get(&self, id: QueryId) -> Result<Option<Query>> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn modify(&self, id: QueryId, mutation: QueryMutation) -> Result<Query> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| SqlPilotError::NotFound(format!("query {id}")))?;
        mutation(row);
        Ok(row.clone())
    }

    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Query>> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|q| q.client_id.as_deref() == Some(client_id))
            .max_by_key(|q| q.id)
            .cloned())
    }
}
