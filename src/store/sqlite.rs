use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use super::{MAX_UPDATE_ATTEMPTS, Mutation, StateStore};
use crate::error::StoreError;
use crate::models::MailboxState;

const COLUMNS: &str = "address, credential_token, scan_all_mail, starred_label_id, contact_label_id, \
     last_thread_time, no_runs_before, last_run, subscription_expiry, lease_expiry, version";

/// SQLite-backed [`StateStore`].
///
/// Each row carries a `version` counter; updates are written with
/// `WHERE version = ?` and retried when another writer got there first.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch(&self, address: &str) -> Result<(MailboxState, i64), StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM mailboxes WHERE address = ?"))
            .bind(address)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(address.to_string()))?;
        let version: i64 = row.try_get(10)?;
        Ok((row_to_state(&row)?, version))
    }

    async fn fetch_all(&self, filter: &str, binds: &[i64]) -> Result<Vec<MailboxState>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM mailboxes WHERE {filter} ORDER BY address ASC");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_state).collect()
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, address: &str) -> Result<MailboxState, StoreError> {
        Ok(self.fetch(address).await?.0)
    }

    async fn put(&self, state: &MailboxState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO mailboxes (address, credential_token, scan_all_mail, starred_label_id, contact_label_id,
                 last_thread_time, no_runs_before, last_run, subscription_expiry, lease_expiry, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
             ON CONFLICT(address) DO UPDATE SET credential_token=excluded.credential_token,
                 scan_all_mail=excluded.scan_all_mail, starred_label_id=excluded.starred_label_id,
                 contact_label_id=excluded.contact_label_id, last_thread_time=excluded.last_thread_time,
                 no_runs_before=excluded.no_runs_before, last_run=excluded.last_run,
                 subscription_expiry=excluded.subscription_expiry, lease_expiry=excluded.lease_expiry,
                 version=mailboxes.version + 1",
        )
        .bind(&state.address)
        .bind(&state.credential_token)
        .bind(state.scan_all_mail)
        .bind(&state.starred_label_id)
        .bind(&state.contact_label_id)
        .bind(to_millis(state.last_thread_time))
        .bind(to_millis(state.no_runs_before))
        .bind(to_millis(state.last_run))
        .bind(to_millis(state.subscription_expiry))
        .bind(to_millis(state.lease_expiry))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, address: &str, mutate: Mutation<'_>) -> Result<MailboxState, StoreError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let (stored, version) = self.fetch(address).await?;
            let mut next = stored.clone();
            if !mutate(&mut next) || next == stored {
                return Ok(next);
            }

            let result = sqlx::query(
                "UPDATE mailboxes SET credential_token = ?, scan_all_mail = ?, starred_label_id = ?,
                     contact_label_id = ?, last_thread_time = ?, no_runs_before = ?, last_run = ?,
                     subscription_expiry = ?, lease_expiry = ?, version = version + 1
                 WHERE address = ? AND version = ?",
            )
            .bind(&next.credential_token)
            .bind(next.scan_all_mail)
            .bind(&next.starred_label_id)
            .bind(&next.contact_label_id)
            .bind(to_millis(next.last_thread_time))
            .bind(to_millis(next.no_runs_before))
            .bind(to_millis(next.last_run))
            .bind(to_millis(next.subscription_expiry))
            .bind(to_millis(next.lease_expiry))
            .bind(address)
            .bind(version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(next);
            }
            tracing::debug!(address, attempt, "optimistic update lost a race, retrying");
        }
        Err(StoreError::Conflict(address.to_string()))
    }

    async fn list_expiring(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<MailboxState>, StoreError> {
        self.fetch_all(
            "subscription_expiry > ? AND subscription_expiry < ?",
            &[after.timestamp_millis(), before.timestamp_millis()],
        )
        .await
    }

    async fn list_idle_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<MailboxState>, StoreError> {
        self.fetch_all("last_run IS NULL OR last_run < ?", &[cutoff.timestamp_millis()])
            .await
    }
}

fn to_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
    time.map(|t| t.timestamp_millis())
}

fn row_to_state(row: &SqliteRow) -> Result<MailboxState, StoreError> {
    let address: String = row.try_get(0)?;
    let time = |idx: usize| -> Result<Option<DateTime<Utc>>, StoreError> {
        let millis: Option<i64> = row.try_get(idx)?;
        millis
            .map(|ms| {
                DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
                    address: address.clone(),
                    reason: format!("timestamp {ms} out of range in column {idx}"),
                })
            })
            .transpose()
    };

    Ok(MailboxState {
        credential_token: row.try_get(1)?,
        scan_all_mail: row.try_get(2)?,
        starred_label_id: row.try_get(3)?,
        contact_label_id: row.try_get(4)?,
        last_thread_time: time(5)?,
        no_runs_before: time(6)?,
        last_run: time(7)?,
        subscription_expiry: time(8)?,
        lease_expiry: time(9)?,
        address: address.clone(),
    })
}
