use crate::config::{ModelConfig, ProviderFamily, ProviderHealth, ProviderStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub family: ProviderFamily,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    pub status: ProviderStatus,
    pub health: ProviderHealth,
    /// Lower is preferred.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSupport {
    pub id: String,
    pub provider_id: String,
    pub model_slug: String,
    pub enabled: bool,
    pub upstream_alias: Option<String>,
    pub config: ModelConfig,
    pub priority: i64,
}

/// One row of the model-provider index: a provider able to serve a model.
#[derive(Debug, Clone)]
pub struct ProviderCandidate {
    pub provider: Provider,
    pub support: ModelSupport,
}

impl ProviderCandidate {
    pub fn upstream_model(&self) -> &str {
        self.support
            .upstream_alias
            .as_deref()
            .filter(|alias| !alias.is_empty())
            .unwrap_or(&self.support.model_slug)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProviderInput {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub family: Option<ProviderFamily>,
    pub base_url: Option<String>,
    pub credential: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertModelSupportInput {
    pub provider_id: String,
    pub model_slug: String,
    #[serde(default)]
    pub upstream_alias: Option<String>,
    #[serde(default)]
    pub config: ModelConfig,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Read-only lookup from a model slug to its candidate providers,
/// ordered by (model support priority, provider priority).
#[async_trait]
pub trait ModelProviderIndex: Send + Sync {
    async fn candidates_for_model(&self, model_slug: &str)
    -> Result<Vec<ProviderCandidate>, String>;
}

#[derive(Clone)]
pub struct ProviderStore {
    pool: Pool<Sqlite>,
}

impl ProviderStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS providers (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                family TEXT,
                base_url TEXT,
                credential TEXT,
                status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'disabled')),
                health TEXT NOT NULL DEFAULT 'healthy' CHECK (health IN ('healthy', 'degraded', 'unhealthy')),
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS model_support (
                id TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
                model_slug TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                upstream_alias TEXT,
                config_json TEXT NOT NULL DEFAULT '{}',
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE (provider_id, model_slug)
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_model_support_model ON model_support(model_slug)",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_provider(&self, input: CreateProviderInput) -> Result<Provider, String> {
        let slug = input.slug.trim().to_string();
        if slug.is_empty() {
            return Err("slug is required".to_string());
        }
        let id = format!("prov_{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();
        let family = input
            .family
            .unwrap_or_else(|| ProviderFamily::infer(&slug, &input.name));

        sqlx::query(
            r#"INSERT INTO providers (id, slug, name, family, base_url, credential, priority,
                                      created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&slug)
        .bind(&input.name)
        .bind(family.as_str())
        .bind(&input.base_url)
        .bind(&input.credential)
        .bind(input.priority)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_provider(&id)
            .await?
            .ok_or_else(|| "provider not found after creation".to_string())
    }

    pub async fn get_provider(&self, id: &str) -> Result<Option<Provider>, String> {
        let row = sqlx::query(
            r#"SELECT id, slug, name, family, base_url, credential, status, health, priority,
                      created_at, updated_at
               FROM providers WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|row| row_to_provider(&row)).transpose()
    }

    pub async fn list_providers(&self) -> Result<Vec<Provider>, String> {
        let rows = sqlx::query(
            r#"SELECT id, slug, name, family, base_url, credential, status, health, priority,
                      created_at, updated_at
               FROM providers ORDER BY priority ASC, slug ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_provider).collect()
    }

    /// Written by the health-check and operator paths.
    pub async fn set_provider_health(&self, id: &str, health: ProviderHealth) -> Result<(), String> {
        self.update_provider_column(id, "health", health.as_str())
            .await
    }

    pub async fn set_provider_status(&self, id: &str, status: ProviderStatus) -> Result<(), String> {
        self.update_provider_column(id, "status", status.as_str())
            .await
    }

    async fn update_provider_column(
        &self,
        id: &str,
        column: &'static str,
        value: &str,
    ) -> Result<(), String> {
        let sql = format!("UPDATE providers SET {column} = ?, updated_at = ? WHERE id = ?");
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        if result.rows_affected() == 0 {
            return Err("provider not found".to_string());
        }
        Ok(())
    }

    pub async fn upsert_model_support(
        &self,
        input: UpsertModelSupportInput,
    ) -> Result<ModelSupport, String> {
        let id = format!("ms_{}", uuid::Uuid::new_v4().simple());
        let config_json = serde_json::to_string(&input.config).map_err(|e| e.to_string())?;
        sqlx::query(
            r#"INSERT INTO model_support (id, provider_id, model_slug, enabled, upstream_alias,
                                          config_json, priority, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(provider_id, model_slug) DO UPDATE SET
                   enabled = excluded.enabled,
                   upstream_alias = excluded.upstream_alias,
                   config_json = excluded.config_json,
                   priority = excluded.priority"#,
        )
        .bind(&id)
        .bind(&input.provider_id)
        .bind(&input.model_slug)
        .bind(if input.enabled { 1 } else { 0 })
        .bind(&input.upstream_alias)
        .bind(&config_json)
        .bind(input.priority)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let row = sqlx::query(
            r#"SELECT id, provider_id, model_slug, enabled, upstream_alias, config_json, priority
               FROM model_support WHERE provider_id = ? AND model_slug = ?"#,
        )
        .bind(&input.provider_id)
        .bind(&input.model_slug)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row_to_model_support(&row, "")
    }
}

#[async_trait]
impl ModelProviderIndex for ProviderStore {
    async fn candidates_for_model(
        &self,
        model_slug: &str,
    ) -> Result<Vec<ProviderCandidate>, String> {
        let rows = sqlx::query(
            r#"SELECT p.id, p.slug, p.name, p.family, p.base_url, p.credential, p.status,
                      p.health, p.priority, p.created_at, p.updated_at,
                      ms.id AS ms_id, ms.provider_id AS ms_provider_id,
                      ms.model_slug AS ms_model_slug, ms.enabled AS ms_enabled,
                      ms.upstream_alias AS ms_upstream_alias, ms.config_json AS ms_config_json,
                      ms.priority AS ms_priority
               FROM model_support ms
               JOIN providers p ON p.id = ms.provider_id
               WHERE ms.model_slug = ?
               ORDER BY ms.priority ASC, p.priority ASC, p.slug ASC"#,
        )
        .bind(model_slug)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            candidates.push(ProviderCandidate {
                provider: row_to_provider(row)?,
                support: row_to_model_support(row, "ms_")?,
            });
        }
        Ok(candidates)
    }
}

fn row_to_provider(row: &sqlx::sqlite::SqliteRow) -> Result<Provider, String> {
    let slug: String = row.try_get("slug").map_err(|e| e.to_string())?;
    let name: String = row.try_get("name").unwrap_or_default();
    let family_raw: Option<String> = row.try_get("family").unwrap_or(None);
    let family = family_raw
        .as_deref()
        .and_then(ProviderFamily::from_str)
        .unwrap_or_else(|| ProviderFamily::infer(&slug, &name));

    let status_raw: String = row.try_get("status").map_err(|e| e.to_string())?;
    let status = ProviderStatus::from_str(&status_raw)
        .ok_or_else(|| format!("invalid provider status: {status_raw}"))?;
    let health_raw: String = row.try_get("health").map_err(|e| e.to_string())?;
    let health = ProviderHealth::from_str(&health_raw)
        .ok_or_else(|| format!("invalid provider health: {health_raw}"))?;

    Ok(Provider {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        slug,
        name,
        family,
        base_url: row.try_get("base_url").map_err(|e| e.to_string())?,
        credential: row.try_get("credential").map_err(|e| e.to_string())?,
        status,
        health,
        priority: row.try_get("priority").map_err(|e| e.to_string())?,
        created_at: parse_timestamp(row, "created_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
    })
}

fn row_to_model_support(
    row: &sqlx::sqlite::SqliteRow,
    prefix: &str,
) -> Result<ModelSupport, String> {
    let col = |name: &str| format!("{prefix}{name}");
    let config_json: String = row
        .try_get(col("config_json").as_str())
        .unwrap_or_else(|_| "{}".to_string());
    Ok(ModelSupport {
        id: row.try_get(col("id").as_str()).map_err(|e| e.to_string())?,
        provider_id: row
            .try_get(col("provider_id").as_str())
            .map_err(|e| e.to_string())?,
        model_slug: row
            .try_get(col("model_slug").as_str())
            .map_err(|e| e.to_string())?,
        enabled: row
            .try_get::<i32, _>(col("enabled").as_str())
            .map_err(|e| e.to_string())?
            == 1,
        upstream_alias: row
            .try_get(col("upstream_alias").as_str())
            .map_err(|e| e.to_string())?,
        config: ModelConfig::from_json(&config_json)?,
        priority: row
            .try_get(col("priority").as_str())
            .map_err(|e| e.to_string())?,
    })
}

fn parse_timestamp(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<DateTime<Utc>, String> {
    let raw: String = row.try_get(column).map_err(|e| e.to_string())?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}
