use super::context::RequestType;
use super::{BillingError, BillingErrorKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

const NANO_SCALE: i128 = 1_000_000_000;

/// Prices in nano-USD. Token prices are per 1K tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model_slug: String,
    pub input_price_per_1k_nano: Option<i128>,
    pub output_price_per_1k_nano: Option<i128>,
    pub request_price_nano: Option<i128>,
    pub multiplier: f64,
}

impl ModelPricing {
    pub fn per_token(model_slug: &str, input_per_1k: i128, output_per_1k: i128) -> Self {
        Self {
            model_slug: model_slug.to_string(),
            input_price_per_1k_nano: Some(input_per_1k),
            output_price_per_1k_nano: Some(output_per_1k),
            request_price_nano: None,
            multiplier: 1.0,
        }
    }

    pub fn per_request(model_slug: &str, price: i128) -> Self {
        Self {
            model_slug: model_slug.to_string(),
            input_price_per_1k_nano: None,
            output_price_per_1k_nano: None,
            request_price_nano: Some(price),
            multiplier: 1.0,
        }
    }

    /// `(in/1000 * pIn + out/1000 * pOut) * multiplier` for token-priced
    /// requests, `pricePerUnit * multiplier` for fixed-price ones.
    pub fn cost_nano(
        &self,
        request_type: RequestType,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<i128, BillingError> {
        let base = if request_type.is_fixed_price() {
            self.request_price_nano.ok_or_else(|| self.missing())?
        } else {
            match (self.input_price_per_1k_nano, self.output_price_per_1k_nano) {
                (Some(pin), Some(pout)) => token_cost(input_tokens, pin, output_tokens, pout)?,
                _ => self.request_price_nano.ok_or_else(|| self.missing())?,
            }
        };
        scale_charge_with_multiplier(base, self.multiplier).ok_or_else(|| {
            BillingError::new(BillingErrorKind::Overflow, "cost multiplier overflow")
        })
    }

    fn missing(&self) -> BillingError {
        BillingError::new(
            BillingErrorKind::PricingNotFound,
            format!("pricing incomplete for model {}", self.model_slug),
        )
    }
}

fn token_cost(input: u64, pin: i128, output: u64, pout: i128) -> Result<i128, BillingError> {
    i128::from(input)
        .checked_mul(pin)
        .and_then(|a| i128::from(output).checked_mul(pout).and_then(|b| a.checked_add(b)))
        .map(|sum| sum / 1000)
        .ok_or_else(|| BillingError::new(BillingErrorKind::Overflow, "token cost overflow"))
}

/// Scales by a float multiplier quantised to nano precision.
pub fn scale_charge_with_multiplier(base_nano: i128, multiplier: f64) -> Option<i128> {
    if !multiplier.is_finite() || multiplier < 0.0 {
        return None;
    }
    let repr = format!("{multiplier:.9}");
    let (whole_raw, frac_raw) = repr.split_once('.').unwrap_or((repr.as_str(), "0"));
    let whole = whole_raw.parse::<i128>().ok()?;
    let frac = frac_raw.parse::<i128>().ok()?;
    let multiplier_nano = whole.checked_mul(NANO_SCALE)?.checked_add(frac)?;
    base_nano.checked_mul(multiplier_nano)?.checked_div(NANO_SCALE)
}

#[derive(Clone)]
pub struct PricingStore {
    pool: Pool<Sqlite>,
}

impl PricingStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS model_pricing (
                model_slug TEXT PRIMARY KEY,
                input_price_per_1k_nano TEXT,
                output_price_per_1k_nano TEXT,
                request_price_nano TEXT,
                multiplier REAL NOT NULL DEFAULT 1.0,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(Self { pool })
    }

    pub async fn upsert_pricing(&self, pricing: &ModelPricing) -> Result<(), String> {
        sqlx::query(
            r#"INSERT INTO model_pricing (model_slug, input_price_per_1k_nano,
                                          output_price_per_1k_nano, request_price_nano,
                                          multiplier, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(model_slug) DO UPDATE SET
                   input_price_per_1k_nano = excluded.input_price_per_1k_nano,
                   output_price_per_1k_nano = excluded.output_price_per_1k_nano,
                   request_price_nano = excluded.request_price_nano,
                   multiplier = excluded.multiplier,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&pricing.model_slug)
        .bind(pricing.input_price_per_1k_nano.map(|v| v.to_string()))
        .bind(pricing.output_price_per_1k_nano.map(|v| v.to_string()))
        .bind(pricing.request_price_nano.map(|v| v.to_string()))
        .bind(pricing.multiplier)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get_pricing(&self, model_slug: &str) -> Result<Option<ModelPricing>, String> {
        let row = sqlx::query(
            r#"SELECT model_slug, input_price_per_1k_nano, output_price_per_1k_nano,
                      request_price_nano, multiplier
               FROM model_pricing WHERE model_slug = ?"#,
        )
        .bind(model_slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let price = |column: &str| -> Result<Option<i128>, String> {
            let raw: Option<String> = row.try_get(column).map_err(|e| e.to_string())?;
            raw.map(|v| crate::users::parse_nano_usd(&v)).transpose()
        };
        Ok(Some(ModelPricing {
            model_slug: row.try_get("model_slug").map_err(|e| e.to_string())?,
            input_price_per_1k_nano: price("input_price_per_1k_nano")?,
            output_price_per_1k_nano: price("output_price_per_1k_nano")?,
            request_price_nano: price("request_price_nano")?,
            multiplier: row.try_get("multiplier").map_err(|e| e.to_string())?,
        }))
    }

    pub async fn require_pricing(&self, model_slug: &str) -> Result<ModelPricing, BillingError> {
        self.get_pricing(model_slug)
            .await
            .map_err(|e| BillingError::new(BillingErrorKind::Internal, e))?
            .ok_or_else(|| {
                BillingError::new(
                    BillingErrorKind::PricingNotFound,
                    format!("pricing not found for model {model_slug}"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_formula_matches_per_thousand_prices() {
        let pricing = ModelPricing::per_token("gpt-4o", 1_000_000, 2_000_000);
        assert_eq!(
            pricing.cost_nano(RequestType::Chat, 12, 8).unwrap(),
            28_000
        );
        let doubled = ModelPricing {
            multiplier: 2.0,
            ..pricing
        };
        assert_eq!(
            doubled.cost_nano(RequestType::Chat, 1000, 1000).unwrap(),
            6_000_000
        );
    }

    #[test]
    fn fixed_price_requires_request_price() {
        let tokens_only = ModelPricing::per_token("midjourney", 1, 1);
        let err = tokens_only
            .cost_nano(RequestType::Midjourney, 0, 0)
            .unwrap_err();
        assert_eq!(err.kind, BillingErrorKind::PricingNotFound);

        let fixed = ModelPricing {
            multiplier: 1.5,
            ..ModelPricing::per_request("midjourney", 50_000_000)
        };
        assert_eq!(
            fixed.cost_nano(RequestType::Midjourney, 0, 0).unwrap(),
            75_000_000
        );
        // text requests fall back to the request price
        assert_eq!(fixed.cost_nano(RequestType::Chat, 10, 10).unwrap(), 75_000_000);
    }

    #[tokio::test]
    async fn unreadable_multiplier_is_an_error_not_a_default() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = PricingStore::new(pool).await.unwrap();
        let pricing = ModelPricing {
            multiplier: 1.5,
            ..ModelPricing::per_token("gpt-4o", 1_000_000, 2_000_000)
        };
        store.upsert_pricing(&pricing).await.unwrap();
        let stored = store.get_pricing("gpt-4o").await.unwrap().unwrap();
        assert_eq!(stored.multiplier, 1.5);

        sqlx::query("UPDATE model_pricing SET multiplier = 'bogus' WHERE model_slug = 'gpt-4o'")
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(store.get_pricing("gpt-4o").await.is_err());
        let err = store.require_pricing("gpt-4o").await.unwrap_err();
        assert_eq!(err.kind, BillingErrorKind::Internal);
    }

    #[test]
    fn multiplier_is_quantised() {
        assert_eq!(scale_charge_with_multiplier(1_000, 0.5), Some(500));
        assert_eq!(scale_charge_with_multiplier(1_000, f64::NAN), None);
        assert_eq!(scale_charge_with_multiplier(1_000, -1.0), None);
        assert_eq!(scale_charge_with_multiplier(3, 1.0 / 3.0), Some(0));
    }
}
