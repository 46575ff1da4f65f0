use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    Requests,
    Tokens,
    Cost,
}

impl QuotaType {
    /// Evaluation order for pre-checks.
    pub const CHECK_ORDER: [QuotaType; 3] = [Self::Tokens, Self::Requests, Self::Cost];

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "requests" => Some(Self::Requests),
            "tokens" => Some(Self::Tokens),
            "cost" => Some(Self::Cost),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Tokens => "tokens",
            Self::Cost => "cost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    None,
    Daily,
    Monthly,
}

impl QuotaPeriod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "daily" => Some(Self::Daily),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    pub fn period_key(&self, now: DateTime<Utc>) -> String {
        match self {
            Self::None => "total".to_string(),
            Self::Daily => now.format("%Y-%m-%d").to_string(),
            Self::Monthly => now.format("%Y-%m").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Quota {
    pub id: String,
    pub api_key_id: String,
    pub quota_type: QuotaType,
    pub period: QuotaPeriod,
    pub limit_value: i64,
    pub active: bool,
}

/// Amounts one request adds to each quota type.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaUsageDelta {
    pub requests: i64,
    pub tokens: i64,
    pub cost_nano: i64,
}

impl QuotaUsageDelta {
    pub fn amount_for(&self, quota_type: QuotaType) -> i64 {
        match quota_type {
            QuotaType::Requests => self.requests,
            QuotaType::Tokens => self.tokens,
            QuotaType::Cost => self.cost_nano,
        }
    }
}

#[derive(Clone)]
pub struct QuotaStore {
    pool: Pool<Sqlite>,
}

impl QuotaStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS quotas (
                id TEXT PRIMARY KEY,
                api_key_id TEXT NOT NULL,
                quota_type TEXT NOT NULL CHECK (quota_type IN ('requests', 'tokens', 'cost')),
                period TEXT NOT NULL CHECK (period IN ('none', 'daily', 'monthly')),
                limit_value INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'disabled')),
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS quota_usage (
                quota_id TEXT NOT NULL REFERENCES quotas(id) ON DELETE CASCADE,
                period_key TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (quota_id, period_key)
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_quotas_api_key ON quotas(api_key_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_quota(
        &self,
        api_key_id: &str,
        quota_type: QuotaType,
        period: QuotaPeriod,
        limit_value: i64,
    ) -> Result<Quota, String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"INSERT INTO quotas (id, api_key_id, quota_type, period, limit_value, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(api_key_id)
        .bind(quota_type.as_str())
        .bind(period.as_str())
        .bind(limit_value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(Quota {
            id,
            api_key_id: api_key_id.to_string(),
            quota_type,
            period,
            limit_value,
            active: true,
        })
    }

    pub async fn list_active_quotas(&self, api_key_id: &str) -> Result<Vec<Quota>, String> {
        let rows = sqlx::query(
            r#"SELECT id, api_key_id, quota_type, period, limit_value, status
               FROM quotas WHERE api_key_id = ? AND status = 'active'"#,
        )
        .bind(api_key_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_quota).collect()
    }

    pub async fn current_usage(&self, quota: &Quota, now: DateTime<Utc>) -> Result<i64, String> {
        let used: Option<i64> = sqlx::query_scalar(
            "SELECT used FROM quota_usage WHERE quota_id = ? AND period_key = ?",
        )
        .bind(&quota.id)
        .bind(quota.period.period_key(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(used.unwrap_or(0))
    }

    /// First quota type, in check order, that `delta` would push over its limit.
    pub async fn find_exceeded(
        &self,
        api_key_id: &str,
        delta: QuotaUsageDelta,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaType>, String> {
        let quotas = self.list_active_quotas(api_key_id).await?;
        for quota_type in QuotaType::CHECK_ORDER {
            for quota in quotas.iter().filter(|q| q.quota_type == quota_type) {
                let used = self.current_usage(quota, now).await?;
                if used.saturating_add(delta.amount_for(quota_type)) > quota.limit_value {
                    return Ok(Some(quota_type));
                }
            }
        }
        Ok(None)
    }

    /// Adds `delta` to every active quota of the key inside the caller's transaction.
    pub async fn consume_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        api_key_id: &str,
        delta: QuotaUsageDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Quota, i64)>, String> {
        let rows = sqlx::query(
            r#"SELECT id, api_key_id, quota_type, period, limit_value, status
               FROM quotas WHERE api_key_id = ? AND status = 'active'"#,
        )
        .bind(api_key_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| e.to_string())?;
        let mut consumed = Vec::new();
        for row in &rows {
            let quota = row_to_quota(row)?;
            let amount = delta.amount_for(quota.quota_type);
            if amount <= 0 {
                continue;
            }
            sqlx::query(
                r#"INSERT INTO quota_usage (quota_id, period_key, used, updated_at)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT(quota_id, period_key) DO UPDATE SET
                       used = used + excluded.used,
                       updated_at = excluded.updated_at"#,
            )
            .bind(&quota.id)
            .bind(quota.period.period_key(now))
            .bind(amount)
            .bind(now.to_rfc3339())
            .execute(&mut **tx)
            .await
            .map_err(|e| e.to_string())?;
            consumed.push((quota, amount));
        }
        Ok(consumed)
    }
}

fn row_to_quota(row: &sqlx::sqlite::SqliteRow) -> Result<Quota, String> {
    let type_raw: String = row.try_get("quota_type").map_err(|e| e.to_string())?;
    let period_raw: String = row.try_get("period").map_err(|e| e.to_string())?;
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    Ok(Quota {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        api_key_id: row.try_get("api_key_id").map_err(|e| e.to_string())?,
        quota_type: QuotaType::from_str(&type_raw)
            .ok_or_else(|| format!("invalid quota type: {type_raw}"))?,
        period: QuotaPeriod::from_str(&period_raw)
            .ok_or_else(|| format!("invalid quota period: {period_raw}"))?,
        limit_value: row.try_get("limit_value").map_err(|e| e.to_string())?,
        active: status == "active",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn period_keys() {
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 23, 59, 0).unwrap();
        assert_eq!(QuotaPeriod::None.period_key(now), "total");
        assert_eq!(QuotaPeriod::Daily.period_key(now), "2026-03-07");
        assert_eq!(QuotaPeriod::Monthly.period_key(now), "2026-03");
    }

    #[tokio::test]
    async fn tokens_are_checked_before_requests() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = QuotaStore::new(pool.clone()).await.unwrap();
        store
            .create_quota("key", QuotaType::Requests, QuotaPeriod::Daily, 1)
            .await
            .unwrap();
        store
            .create_quota("key", QuotaType::Tokens, QuotaPeriod::None, 100)
            .await
            .unwrap();
        let now = Utc::now();
        let delta = QuotaUsageDelta {
            requests: 1,
            tokens: 60,
            cost_nano: 0,
        };
        assert_eq!(store.find_exceeded("key", delta, now).await.unwrap(), None);

        let mut tx = pool.begin().await.unwrap();
        let consumed = store.consume_tx(&mut tx, "key", delta, now).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(consumed.len(), 2);

        // both are now exhausted; tokens wins
        assert_eq!(
            store.find_exceeded("key", delta, now).await.unwrap(),
            Some(QuotaType::Tokens)
        );
        let small = QuotaUsageDelta {
            requests: 1,
            tokens: 1,
            cost_nano: 0,
        };
        assert_eq!(
            store.find_exceeded("key", small, now).await.unwrap(),
            Some(QuotaType::Requests)
        );
    }
}
