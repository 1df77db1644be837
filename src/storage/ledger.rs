use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    Member,
    Admin,
}

impl AccountRole {
    fn parse(value: &str) -> Self {
        match value {
            "admin" => AccountRole::Admin,
            _ => AccountRole::Member,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Member => "member",
            AccountRole::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAccount {
    pub user_id: String,
    pub credit_balance: i64,
    pub role: AccountRole,
}

impl UsageAccount {
    pub fn is_admin(&self) -> bool {
        self.role == AccountRole::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub user_id: String,
    pub request_id: String,
    pub feature: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// The usage gate: admits requests against a per-user credit balance and
/// deducts exactly once per provider-successful request. Admission and
/// deduction must both run against the same account row; the deduction is a
/// single conditional decrement at the storage layer so two concurrent
/// requests can never both spend the last credit.
pub struct CreditLedger {
    pool: SqlitePool,
}

impl CreditLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_account(
        &self,
        user_id: &str,
        credit_balance: i64,
        role: AccountRole,
    ) -> Result<()> {
        if credit_balance < 0 {
            return Err(Error::validation("credit balance cannot be negative"));
        }

        sqlx::query(
            "INSERT INTO accounts (user_id, credit_balance, role)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 credit_balance = excluded.credit_balance,
                 role = excluded.role,
                 updated_at = unixepoch()",
        )
        .bind(user_id)
        .bind(credit_balance)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;

        debug!(user_id, credit_balance, role = role.as_str(), "account upserted");
        Ok(())
    }

    pub async fn grant_credits(&self, user_id: &str, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Err(Error::validation("credit grant must be positive"));
        }

        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE accounts
             SET credit_balance = credit_balance + ?, updated_at = unixepoch()
             WHERE user_id = ?
             RETURNING credit_balance",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let balance = balance.ok_or_else(|| Error::account_unavailable(user_id))?;
        info!(user_id, amount, balance, "credits granted");
        Ok(balance)
    }

    pub async fn load_account(&self, user_id: &str) -> Result<UsageAccount> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT credit_balance, role FROM accounts WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((credit_balance, role)) => Ok(UsageAccount {
                user_id: user_id.to_string(),
                credit_balance,
                role: AccountRole::parse(&role),
            }),
            None => Err(Error::account_unavailable(user_id)),
        }
    }

    /// Must return `Ok` before any provider call is attempted. A ledger that
    /// cannot be read is a denial, not a provider failure.
    pub async fn check_admission(&self, user_id: &str) -> Result<()> {
        let account = match self.load_account(user_id).await {
            Ok(account) => account,
            Err(Error::Database(e)) => {
                warn!(user_id, error = %e, "ledger read failed during admission");
                return Err(Error::account_unavailable(format!("{}: {}", user_id, e)));
            }
            Err(e) => return Err(e),
        };

        if account.is_admin() {
            debug!(user_id, "admin account admitted without metering");
            return Ok(());
        }

        if account.credit_balance > 0 {
            Ok(())
        } else {
            debug!(user_id, "admission denied, no credits remaining");
            Err(Error::InsufficientCredits)
        }
    }

    /// Charges one credit after a provider call delivered a usable result.
    /// The `credit_balance > 0` guard makes the decrement conditional, so a
    /// request racing another spend of the same last credit fails here
    /// instead of driving the balance negative.
    pub async fn deduct(&self, user_id: &str) -> Result<i64> {
        let account = self.load_account(user_id).await?;
        if account.is_admin() {
            debug!(user_id, "admin account not metered");
            return Ok(account.credit_balance);
        }

        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE accounts
             SET credit_balance = credit_balance - 1, updated_at = unixepoch()
             WHERE user_id = ? AND credit_balance > 0
             RETURNING credit_balance",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match balance {
            Some(balance) => {
                info!(user_id, balance, "deducted one credit");
                Ok(balance)
            }
            None => {
                warn!(user_id, "deduct found no spendable credit");
                Err(Error::InsufficientCredits)
            }
        }
    }

    pub async fn record_usage(
        &self,
        user_id: &str,
        request_id: &str,
        feature: &str,
        model: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_events (user_id, request_id, feature, model)
             VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(request_id)
        .bind(feature)
        .bind(model)
        .execute(&self.pool)
        .await?;

        debug!(user_id, request_id, feature, model, "usage event recorded");
        Ok(())
    }

    pub async fn usage_history(&self, user_id: &str, limit: i64) -> Result<Vec<UsageEvent>> {
        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT user_id, request_id, feature, model, created_at
             FROM usage_events
             WHERE user_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, request_id, feature, model, created_at)| UsageEvent {
                user_id,
                request_id,
                feature,
                model,
                created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
            })
            .collect())
    }
}
