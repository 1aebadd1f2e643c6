use std::{fmt::Display, sync::Arc};

use async_trait::async_trait;
use tokio_postgres::{types::Type, Error, Row};

use crate::models::user_model::User;

use super::tables::ETables;

#[allow(non_camel_case_types)]
pub enum UserColumns {
    ID,
    EMAIL,
    USERNAME,
    DATE_JOINED,
}

impl Display for UserColumns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl UserColumns {
    pub fn as_str(&self) -> &str {
        match *self {
            Self::ID => "id",
            Self::EMAIL => "email",
            Self::USERNAME => "username",
            Self::DATE_JOINED => "date_joined",
        }
    }
}

/// Baseline schema applied before any user supplied migration.
pub fn create_users_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {users} (
            {id} SERIAL PRIMARY KEY,
            {email} TEXT NOT NULL UNIQUE,
            {username} TEXT NOT NULL,
            {date_joined} TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );",
        users = ETables::USERS,
        id = UserColumns::ID,
        email = UserColumns::EMAIL,
        username = UserColumns::USERNAME,
        date_joined = UserColumns::DATE_JOINED,
    )
}

/// Inserts the user unless the email is taken. Returns the inserted row, or nothing on conflict.
pub async fn insert_user_if_absent_query(
    postgres_client: &tokio_postgres::Client,
    email: &str,
) -> Result<Vec<Row>, Error> {
    postgres_client
        .query_typed(
            format!(
                "INSERT INTO {users} ({email}, {username}) VALUES ($1, $1)
                ON CONFLICT ({email}) DO NOTHING
                RETURNING {id}, {email}, {username}, {date_joined}",
                users = ETables::USERS,
                email = UserColumns::EMAIL,
                username = UserColumns::USERNAME,
                id = UserColumns::ID,
                date_joined = UserColumns::DATE_JOINED,
            )
            .as_str(),
            &[(&email, Type::TEXT)],
        )
        .await
}

pub async fn get_user_by_email_query(
    postgres_client: &tokio_postgres::Client,
    email: &str,
) -> Result<Row, Error> {
    postgres_client
        .query_one(
            format!(
                "SELECT {id}, {email}, {username}, {date_joined} FROM {users} WHERE {email} = $1",
                users = ETables::USERS,
                email = UserColumns::EMAIL,
                username = UserColumns::USERNAME,
                id = UserColumns::ID,
                date_joined = UserColumns::DATE_JOINED,
            )
            .as_str(),
            &[&email],
        )
        .await
}

fn user_from_row(row: &Row) -> User {
    User {
        id: row.get::<&str, i32>(UserColumns::ID.as_str()),
        email: row.get::<&str, String>(UserColumns::EMAIL.as_str()),
        username: row.get::<&str, String>(UserColumns::USERNAME.as_str()),
        date_joined: row.get(UserColumns::DATE_JOINED.as_str()),
    }
}

/// Storage the seed step writes through. `get_or_create` must be safe to repeat.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Returns the user and whether this call created it.
    async fn get_or_create(&self, email: &str) -> Result<(User, bool), Error>;
}

pub struct PostgresUserRepository {
    pub postgres_client: Arc<tokio_postgres::Client>,
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn get_or_create(&self, email: &str) -> Result<(User, bool), Error> {
        let inserted = insert_user_if_absent_query(&self.postgres_client, email).await?;
        if let Some(row) = inserted.first() {
            return Ok((user_from_row(row), true));
        }
        //lost the race or already seeded, the unique constraint guarantees the row exists
        let row = get_user_by_email_query(&self.postgres_client, email).await?;
        Ok((user_from_row(&row), false))
    }
}
