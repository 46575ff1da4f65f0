use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub enabled: bool,
    /// Signed nano-dollar string balance.
    pub balance_nano_usd: String,
    /// Unlimited balance bypass flag.
    pub balance_unlimited: bool,
}

#[derive(Debug, Clone)]
pub struct UserBalance {
    pub user_id: String,
    pub balance_nano_usd: i128,
    pub balance_unlimited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                balance_nano_usd TEXT NOT NULL DEFAULT '0',
                balance_unlimited INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                last_used_at TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub fn hash_api_key(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    pub async fn create_user(&self, username: &str) -> Result<User, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO users (id, username, created_at, updated_at)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(username)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_user_by_id(&id)
            .await?
            .ok_or_else(|| "user not found after creation".to_string())
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, String> {
        let row = sqlx::query(
            r#"SELECT id, username, created_at, updated_at, enabled, balance_nano_usd,
                      balance_unlimited
               FROM users WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|row| row_to_user(&row)).transpose()
    }

    pub async fn set_balance_unlimited(&self, user_id: &str, unlimited: bool) -> Result<(), String> {
        sqlx::query("UPDATE users SET balance_unlimited = ?, updated_at = ? WHERE id = ?")
            .bind(if unlimited { 1 } else { 0 })
            .bind(Utc::now().to_rfc3339())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get_user_balance(&self, user_id: &str) -> Result<Option<UserBalance>, String> {
        let row =
            sqlx::query("SELECT id, balance_nano_usd, balance_unlimited FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let balance_raw: String = row
            .try_get("balance_nano_usd")
            .unwrap_or_else(|_| "0".to_string());
        let balance_nano_usd = parse_nano_usd(&balance_raw)?;
        Ok(Some(UserBalance {
            user_id: row.try_get("id").map_err(|e| e.to_string())?,
            balance_nano_usd,
            balance_unlimited: row.try_get::<i32, _>("balance_unlimited").unwrap_or(0) == 1,
        }))
    }

    /// Returns the key record and the raw key. The raw key is not stored.
    pub async fn create_api_key(&self, user_id: &str, name: &str) -> Result<(ApiKey, String), String> {
        let raw_key = format!(
            "sk-{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let id = uuid::Uuid::new_v4().to_string();
        let key_prefix: String = raw_key.chars().take(12).collect();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO api_keys (id, user_id, name, key_prefix, key_hash, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(name)
        .bind(&key_prefix)
        .bind(Self::hash_api_key(&raw_key))
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let row = sqlx::query(
            r#"SELECT id, user_id, name, key_prefix, created_at, last_used_at, enabled
               FROM api_keys WHERE id = ?"#,
        )
        .bind(&id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok((row_to_api_key(&row)?, raw_key))
    }

    pub async fn validate_api_key(&self, key: &str) -> Result<Option<(ApiKey, User)>, String> {
        if key.len() < 12 {
            return Ok(None);
        }
        let row = sqlx::query(
            r#"SELECT id, user_id, name, key_prefix, created_at, last_used_at, enabled
               FROM api_keys WHERE key_hash = ?"#,
        )
        .bind(Self::hash_api_key(key))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let api_key = row_to_api_key(&row)?;
        if !api_key.enabled {
            return Ok(None);
        }

        let user = match self.get_user_by_id(&api_key.user_id).await? {
            Some(u) => u,
            None => return Ok(None),
        };
        if !user.enabled {
            return Ok(None);
        }

        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&api_key.id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Some((api_key, user)))
    }
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, String> {
    Ok(User {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        username: row.try_get("username").map_err(|e| e.to_string())?,
        created_at: parse_rfc3339(row.try_get("created_at").map_err(|e| e.to_string())?)?,
        updated_at: parse_rfc3339(row.try_get("updated_at").map_err(|e| e.to_string())?)?,
        enabled: row.try_get::<i32, _>("enabled").map_err(|e| e.to_string())? == 1,
        balance_nano_usd: row
            .try_get("balance_nano_usd")
            .unwrap_or_else(|_| "0".to_string()),
        balance_unlimited: row.try_get::<i32, _>("balance_unlimited").unwrap_or(0) == 1,
    })
}

fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, String> {
    let last_used_at: Option<String> = row.try_get("last_used_at").map_err(|e| e.to_string())?;
    Ok(ApiKey {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        key_prefix: row.try_get("key_prefix").map_err(|e| e.to_string())?,
        created_at: parse_rfc3339(row.try_get("created_at").map_err(|e| e.to_string())?)?,
        last_used_at: last_used_at.map(parse_rfc3339).transpose()?,
        enabled: row.try_get::<i32, _>("enabled").map_err(|e| e.to_string())? == 1,
    })
}

pub(crate) fn parse_rfc3339(raw: String) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

pub fn parse_nano_usd(value: &str) -> Result<i128, String> {
    value
        .trim()
        .parse::<i128>()
        .map_err(|_| "invalid_nano_usd".to_string())
}

pub fn parse_usd_to_nano(value: &str) -> Result<i128, String> {
    let s = value.trim();
    if s.is_empty() {
        return Err("invalid_usd".to_string());
    }
    let (negative, rest) = if let Some(rem) = s.strip_prefix('-') {
        (true, rem)
    } else if let Some(rem) = s.strip_prefix('+') {
        (false, rem)
    } else {
        (false, s)
    };

    let (whole_raw, frac_raw) = rest.split_once('.').unwrap_or((rest, ""));
    if whole_raw.is_empty() && frac_raw.is_empty() {
        return Err("invalid_usd".to_string());
    }
    if !whole_raw.chars().all(|c| c.is_ascii_digit())
        || !frac_raw.chars().all(|c| c.is_ascii_digit())
    {
        return Err("invalid_usd".to_string());
    }

    let whole = if whole_raw.is_empty() {
        0i128
    } else {
        whole_raw
            .parse::<i128>()
            .map_err(|_| "invalid_usd".to_string())?
    };
    let mut frac: String = frac_raw.chars().take(9).collect();
    while frac.len() < 9 {
        frac.push('0');
    }
    let frac_value = frac
        .parse::<i128>()
        .map_err(|_| "invalid_usd".to_string())?;

    let base = whole
        .checked_mul(1_000_000_000)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or_else(|| "usd_overflow".to_string())?;
    if negative {
        base.checked_neg().ok_or_else(|| "usd_overflow".to_string())
    } else {
        Ok(base)
    }
}

pub fn format_nano_to_usd(nano: i128) -> String {
    let negative = nano < 0;
    let abs = nano.abs();
    let whole = abs / 1_000_000_000;
    let frac = abs % 1_000_000_000;
    let sign = if negative { "-" } else { "" };
    if frac == 0 {
        return format!("{sign}{whole}");
    }
    let frac_str = format!("{frac:09}");
    format!("{sign}{whole}.{}", frac_str.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usd_round_trips_through_nano() {
        assert_eq!(parse_usd_to_nano("1.5").unwrap(), 1_500_000_000);
        assert_eq!(parse_usd_to_nano("-0.000000001").unwrap(), -1);
        assert_eq!(parse_usd_to_nano(".25").unwrap(), 250_000_000);
        assert!(parse_usd_to_nano("1e3").is_err());
        assert_eq!(format_nano_to_usd(-1_500_000_000), "-1.5");
        assert_eq!(format_nano_to_usd(28_000), "0.000028");
        assert_eq!(format_nano_to_usd(2_000_000_000), "2");
    }

    #[tokio::test]
    async fn api_keys_resolve_by_hash_only() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = UserStore::new(pool).await.unwrap();
        let user = store.create_user("alice").await.unwrap();
        let (key, raw) = store.create_api_key(&user.id, "default").await.unwrap();
        assert!(raw.starts_with("sk-"));
        assert_eq!(key.key_prefix, &raw[..12]);

        let (resolved, owner) = store.validate_api_key(&raw).await.unwrap().unwrap();
        assert_eq!(resolved.id, key.id);
        assert_eq!(owner.id, user.id);
        assert!(store.validate_api_key("sk-not-a-real-key").await.unwrap().is_none());
    }
}
