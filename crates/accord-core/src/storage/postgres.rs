//! PostgreSQL agreement store.
//!
//! Aggregates are stored as JSONB documents with a relational lookup index beside them.
//! Every save runs in one transaction guarded by the `version` column.

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::traits::AgreementStore;
use super::{index_keys, IndexKind};
use crate::audit::{AuditEntry, AuditHead};
use crate::error::{AccordError, Result};
use crate::types::{
    normalize_email, Account, AccountId, AgreementId, AgreementRecord, IdentityVerification,
};

const UNIQUE_VIOLATION: &str = "23505";

fn storage_err(context: &str) -> impl Fn(sqlx::Error) -> AccordError + '_ {
    move |e| AccordError::Storage(format!("postgres {context} failed: {e}"))
}

/// Unique-key collisions surface as conflicts; anything else is a storage fault.
fn write_err(context: &str) -> impl Fn(sqlx::Error) -> AccordError + '_ {
    move |e| {
        let unique = e
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code == UNIQUE_VIOLATION)
            .unwrap_or(false);
        if unique {
            AccordError::Conflict(format!("{context}: {e}"))
        } else {
            AccordError::Storage(format!("postgres {context} failed: {e}"))
        }
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    value
        .try_into()
        .map_err(|_| AccordError::Storage(format!("{what} exceeds postgres BIGINT range")))
}

fn from_i64(value: i64, what: &str) -> Result<u64> {
    value
        .try_into()
        .map_err(|_| AccordError::Storage(format!("negative {what} in storage")))
}

fn to_document<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| AccordError::Serialization(e.to_string()))
}

fn from_row<T: serde::de::DeserializeOwned>(row: &PgRow, column: &str) -> Result<T> {
    let value: serde_json::Value = row
        .try_get(column)
        .map_err(|e| AccordError::Storage(format!("postgres decode {column} failed: {e}")))?;
    serde_json::from_value(value).map_err(|e| AccordError::Serialization(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct PostgresAgreementStore {
    pool: PgPool,
}

impl PostgresAgreementStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(storage_err("connect"))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS accord_agreements (
                agreement_id TEXT PRIMARY KEY,
                initiator_id TEXT NOT NULL,
                status TEXT NOT NULL,
                version BIGINT NOT NULL,
                document JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS accord_agreement_index (
                kind TEXT NOT NULL,
                lookup_key TEXT NOT NULL,
                agreement_id TEXT NOT NULL REFERENCES accord_agreements (agreement_id) ON DELETE CASCADE,
                PRIMARY KEY (kind, lookup_key, agreement_id)
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_accord_index_unique_refs
            ON accord_agreement_index (kind, lookup_key)
            WHERE kind IN ('invite_token', 'payment_ref', 'envelope')
            "#,
            "CREATE INDEX IF NOT EXISTS idx_accord_index_agreement ON accord_agreement_index (agreement_id)",
            r#"
            CREATE TABLE IF NOT EXISTS accord_audit_entries (
                agreement_id TEXT NOT NULL REFERENCES accord_agreements (agreement_id) ON DELETE CASCADE,
                entry_index BIGINT NOT NULL,
                entry_id TEXT NOT NULL UNIQUE,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                entry JSONB NOT NULL,
                PRIMARY KEY (agreement_id, entry_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS accord_accounts (
                account_id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                document JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS accord_verifications (
                verification_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                external_ref TEXT NOT NULL,
                document JSONB NOT NULL,
                UNIQUE (provider, external_ref)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_err("schema create"))?;
        }
        Ok(())
    }

    async fn write_agreement(
        tx: &mut Transaction<'_, Postgres>,
        record: &AgreementRecord,
        version: u64,
    ) -> Result<()> {
        let id = record.id().to_string();
        let mut stored = record.clone();
        stored.version = version;
        let document = to_document(&stored)?;

        let result = if record.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO accord_agreements (agreement_id, initiator_id, status, version, document, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (agreement_id) DO NOTHING
                "#,
            )
            .bind(&id)
            .bind(record.agreement.initiator_id.to_string())
            .bind(record.status().name())
            .bind(to_i64(version, "version")?)
            .bind(&document)
            .bind(record.agreement.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(write_err("agreement insert"))?
        } else {
            sqlx::query(
                r#"
                UPDATE accord_agreements
                SET status = $2, version = $3, document = $4, updated_at = $5
                WHERE agreement_id = $1 AND version = $6
                "#,
            )
            .bind(&id)
            .bind(record.status().name())
            .bind(to_i64(version, "version")?)
            .bind(&document)
            .bind(record.agreement.updated_at)
            .bind(to_i64(record.version, "version")?)
            .execute(&mut **tx)
            .await
            .map_err(write_err("agreement update"))?
        };

        if result.rows_affected() == 0 {
            return Err(AccordError::Conflict(format!(
                "agreement '{id}' changed since version {}",
                record.version
            )));
        }
        Ok(())
    }

    async fn write_index(tx: &mut Transaction<'_, Postgres>, record: &AgreementRecord) -> Result<()> {
        let id = record.id().to_string();
        sqlx::query("DELETE FROM accord_agreement_index WHERE agreement_id = $1")
            .bind(&id)
            .execute(&mut **tx)
            .await
            .map_err(storage_err("index clear"))?;

        for (kind, key) in index_keys(record) {
            sqlx::query(
                "INSERT INTO accord_agreement_index (kind, lookup_key, agreement_id) VALUES ($1, $2, $3)",
            )
            .bind(kind.name())
            .bind(&key)
            .bind(&id)
            .execute(&mut **tx)
            .await
            .map_err(write_err("index insert"))?;
        }
        Ok(())
    }

    async fn write_audit(tx: &mut Transaction<'_, Postgres>, audit: &[AuditEntry]) -> Result<()> {
        for entry in audit {
            sqlx::query(
                r#"
                INSERT INTO accord_audit_entries (
                    agreement_id, entry_index, entry_id, previous_hash, entry_hash, entry_timestamp, entry
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(entry.agreement_id.to_string())
            .bind(to_i64(entry.index, "audit index")?)
            .bind(&entry.entry_id)
            .bind(&entry.previous_hash)
            .bind(&entry.entry_hash)
            .bind(entry.timestamp)
            .bind(to_document(entry)?)
            .execute(&mut **tx)
            .await
            .map_err(write_err("audit insert"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AgreementStore for PostgresAgreementStore {
    fn label(&self) -> &'static str {
        "postgres"
    }

    async fn save(&self, record: &AgreementRecord, audit: &[AuditEntry]) -> Result<u64> {
        let id = record.id();
        if let Some(entry) = audit.iter().find(|e| e.agreement_id != id) {
            return Err(AccordError::Conflict(format!(
                "audit entry {} belongs to agreement '{}'",
                entry.index, entry.agreement_id
            )));
        }

        let version = record.version + 1;
        let mut tx = self.pool.begin().await.map_err(storage_err("begin"))?;

        Self::write_agreement(&mut tx, record, version).await?;
        Self::write_index(&mut tx, record).await?;

        if let Some(first) = audit.first() {
            let head = sqlx::query(
                "SELECT entry_index, entry_hash FROM accord_audit_entries WHERE agreement_id = $1 ORDER BY entry_index DESC LIMIT 1",
            )
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err("audit head"))?;
            let (next_index, last_hash) = match head {
                Some(row) => {
                    let index: i64 = row.try_get("entry_index").map_err(storage_err("decode entry_index"))?;
                    let hash: String = row.try_get("entry_hash").map_err(storage_err("decode entry_hash"))?;
                    (from_i64(index, "audit index")? + 1, Some(hash))
                }
                None => (0, None),
            };
            if first.index != next_index || first.previous_hash != last_hash {
                return Err(AccordError::Conflict(format!(
                    "audit entry {} does not extend the chain of agreement '{id}'",
                    first.index
                )));
            }
            Self::write_audit(&mut tx, audit).await?;
        }

        tx.commit().await.map_err(storage_err("commit"))?;
        Ok(version)
    }

    async fn load(&self, id: AgreementId) -> Result<Option<AgreementRecord>> {
        let row = sqlx::query("SELECT document FROM accord_agreements WHERE agreement_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("agreement load"))?;
        row.map(|row| from_row(&row, "document")).transpose()
    }

    async fn delete(&self, id: AgreementId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accord_agreements WHERE agreement_id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err("agreement delete"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, kind: IndexKind, key: &str) -> Result<Vec<AgreementId>> {
        let rows = sqlx::query(
            "SELECT agreement_id FROM accord_agreement_index WHERE kind = $1 AND lookup_key = $2 ORDER BY agreement_id",
        )
        .bind(kind.name())
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("index lookup"))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("agreement_id")
                    .map_err(storage_err("decode agreement_id"))?;
                AgreementId::parse(&id)
            })
            .collect()
    }

    async fn audit_head(&self, id: AgreementId) -> Result<Option<AuditHead>> {
        let row = sqlx::query(
            "SELECT entry_index, entry_hash FROM accord_audit_entries WHERE agreement_id = $1 ORDER BY entry_index DESC LIMIT 1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("audit head"))?;

        match row {
            Some(row) => {
                let index: i64 = row.try_get("entry_index").map_err(storage_err("decode entry_index"))?;
                Ok(Some(AuditHead {
                    index: from_i64(index, "audit index")?,
                    entry_hash: row.try_get("entry_hash").map_err(storage_err("decode entry_hash"))?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn load_audit(&self, id: AgreementId) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT entry FROM accord_audit_entries WHERE agreement_id = $1 ORDER BY entry_index ASC",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("audit load"))?;

        rows.iter().map(|row| from_row(row, "entry")).collect()
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        let mut stored = account.clone();
        stored.email = normalize_email(&account.email);
        sqlx::query(
            r#"
            INSERT INTO accord_accounts (account_id, email, document)
            VALUES ($1, $2, $3)
            ON CONFLICT (account_id) DO UPDATE SET email = EXCLUDED.email, document = EXCLUDED.document
            "#,
        )
        .bind(stored.id.to_string())
        .bind(&stored.email)
        .bind(to_document(&stored)?)
        .execute(&self.pool)
        .await
        .map_err(write_err("account upsert"))?;
        Ok(())
    }

    async fn load_account(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT document FROM accord_accounts WHERE account_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("account load"))?;
        row.map(|row| from_row(&row, "document")).transpose()
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT document FROM accord_accounts WHERE email = $1")
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("account lookup"))?;
        row.map(|row| from_row(&row, "document")).transpose()
    }

    async fn insert_verification(&self, verification: &IdentityVerification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accord_verifications (verification_id, account_id, provider, external_ref, document)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(verification.id.to_string())
        .bind(verification.account_id.to_string())
        .bind(&verification.provider)
        .bind(&verification.external_ref)
        .bind(to_document(verification)?)
        .execute(&self.pool)
        .await
        .map_err(write_err("verification insert"))?;
        Ok(())
    }

    async fn find_verification(
        &self,
        provider: &str,
        external_ref: &str,
    ) -> Result<Option<IdentityVerification>> {
        let row = sqlx::query(
            "SELECT document FROM accord_verifications WHERE provider = $1 AND external_ref = $2",
        )
        .bind(provider)
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("verification lookup"))?;
        row.map(|row| from_row(&row, "document")).transpose()
    }

    async fn save_verification(
        &self,
        verification: &IdentityVerification,
        account: Option<&Account>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err("begin"))?;

        let updated = sqlx::query(
            "UPDATE accord_verifications SET document = $2 WHERE verification_id = $1",
        )
        .bind(verification.id.to_string())
        .bind(to_document(verification)?)
        .execute(&mut *tx)
        .await
        .map_err(storage_err("verification update"))?;
        if updated.rows_affected() == 0 {
            return Err(AccordError::Storage(format!(
                "verification '{}' not found",
                verification.id
            )));
        }

        if let Some(account) = account {
            let updated = sqlx::query(
                "UPDATE accord_accounts SET document = $2 WHERE account_id = $1",
            )
            .bind(account.id.to_string())
            .bind(to_document(account)?)
            .execute(&mut *tx)
            .await
            .map_err(storage_err("account update"))?;
            if updated.rows_affected() == 0 {
                return Err(AccordError::AccountNotFound(account.id.to_string()));
            }
        }

        tx.commit().await.map_err(storage_err("commit"))?;
        Ok(())
    }
}
