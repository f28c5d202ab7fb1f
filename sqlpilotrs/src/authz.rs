//! Authorization seam. Identity and role management live outside the crate;
//! the pipeline and chart runtime only ask yes/no questions.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SqlPilotError};
use crate::models::Dataset;

/// The caller on whose behalf SQL runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
}

impl User {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize_database(&self, user: &User, database: &str) -> Result<()>;

    async fn authorize_dataset(&self, user: &User, dataset: &Dataset) -> Result<()> {
        self.authorize_database(user, &dataset.database).await
    }
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize_database(&self, _user: &User, _database: &str) -> Result<()> {
        Ok(())
    }
}

/// Fixed per-user database grants.
#[derive(Debug, Clone, Default)]
pub struct DatabaseGrants {
    grants: HashMap<String, HashSet<String>>,
}

impl DatabaseGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, username: impl Into<String>, database: impl Into<String>) -> Self {
        self.grants
            .entry(username.into())
            .or_default()
            .insert(database.into());
        self
    }
}

#[async_trait]
impl Authorizer for DatabaseGrants {
    async fn authorize_database(&self, user: &User, database: &str) -> Result<()> {
        let allowed = self
            .grants
            .get(&user.username)
            .is_some_and(|dbs| dbs.contains(database));
        if allowed {
            Ok(())
        } else {
            tracing::warn!(user = %user.username, database, "database access denied");
            Err(SqlPilotError::Permission(format!(
                "user {} cannot access database {database}",
                user.username
            )))
        }
    }
}
