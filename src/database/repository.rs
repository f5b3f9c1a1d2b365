use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{FromRow, PgPool};
use std::marker::PhantomData;
use thiserror::Error;
use uuid::Uuid;

use crate::database::session::TenantSession;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("Field '{0}' cannot be written")]
    FieldNotWritable(String),

    #[error("No writable fields supplied")]
    EmptyWrite,

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// A table living in every tenant database
pub trait Entity: for<'r> FromRow<'r, PgRow> + Serialize + Send + Unpin + 'static {
    const TABLE: &'static str;

    /// Columns accepted by [`Handle::insert`] and [`Handle::update`]
    const WRITABLE: &'static [&'static str];
}

/// Entity-scoped accessor over a tenant's pool
pub struct Handle<T> {
    session: TenantSession,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T: Entity> Handle<T> {
    pub fn new(session: TenantSession) -> Self {
        Self {
            session,
            _phantom: PhantomData,
        }
    }

    pub fn session(&self) -> &TenantSession {
        &self.session
    }

    fn pool(&self) -> &PgPool {
        self.session.pool()
    }

    pub async fn find_all(&self, limit: i64) -> Result<Vec<T>, HandleError> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY created_at DESC LIMIT $1",
            quote(T::TABLE)
        );
        let rows = sqlx::query_as::<_, T>(&sql)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<T>, HandleError> {
        let sql = format!("SELECT * FROM {} WHERE id = $1", quote(T::TABLE));
        let row = sqlx::query_as::<_, T>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn insert(&self, fields: &Map<String, Value>) -> Result<T, HandleError> {
        let columns = writable_columns::<T>(fields)?;
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
            quote(T::TABLE),
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            placeholders.join(", ")
        );

        let mut q = sqlx::query_as::<_, T>(&sql);
        for column in &columns {
            q = bind_value(q, &fields[*column]);
        }
        Ok(q.fetch_one(self.pool()).await?)
    }

    pub async fn update(&self, id: Uuid, fields: &Map<String, Value>) -> Result<Option<T>, HandleError> {
        let columns = writable_columns::<T>(fields)?;
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ${}", quote(c), i + 2))
            .collect();
        let sql = format!(
            "UPDATE {} SET {}, updated_at = now() WHERE id = $1 RETURNING *",
            quote(T::TABLE),
            assignments.join(", ")
        );

        let mut q = sqlx::query_as::<_, T>(&sql).bind(id);
        for column in &columns {
            q = bind_value(q, &fields[*column]);
        }
        Ok(q.fetch_optional(self.pool()).await?)
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, HandleError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", quote(T::TABLE));
        let result = sqlx::query(&sql).bind(id).execute(self.pool()).await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Keys of `fields` in a stable order, rejecting anything outside `T::WRITABLE`
fn writable_columns<T: Entity>(fields: &Map<String, Value>) -> Result<Vec<&str>, HandleError> {
    if fields.is_empty() {
        return Err(HandleError::EmptyWrite);
    }
    let mut columns = Vec::with_capacity(fields.len());
    for key in fields.keys() {
        if !T::WRITABLE.contains(&key.as_str()) {
            return Err(HandleError::FieldNotWritable(key.clone()));
        }
        columns.push(key.as_str());
    }
    Ok(columns)
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn bind_value<'q, O>(
    q: sqlx::query::QueryAs<'q, sqlx::Postgres, O, PgArguments>,
    v: &'q Value,
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, O, PgArguments>
where
    O: for<'r> FromRow<'r, PgRow>,
{
    match v {
        Value::Null => {
            let none: Option<String> = None;
            q.bind(none)
        }
        Value::Bool(b) => q.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(n.to_string())
            }
        }
        Value::String(s) => q.bind(s),
        Value::Array(_) | Value::Object(_) => q.bind(v.clone()),
    }
}
