use crate::config::{ProviderHealth, ProviderStatus};
use crate::error::GatewayError;
use crate::providers::{ModelProviderIndex, ProviderCandidate};
use std::sync::Arc;

/// Picks the first available candidate in strict priority order.
#[derive(Clone)]
pub struct ProviderSelector {
    index: Arc<dyn ModelProviderIndex>,
}

impl ProviderSelector {
    pub fn new(index: Arc<dyn ModelProviderIndex>) -> Self {
        Self { index }
    }

    pub async fn select(&self, model_slug: &str) -> Result<ProviderCandidate, GatewayError> {
        let candidates = self
            .index
            .candidates_for_model(model_slug)
            .await
            .map_err(GatewayError::Storage)?;
        if candidates.is_empty() {
            return Err(GatewayError::NoProviderForModel(model_slug.to_string()));
        }
        let total = candidates.len();
        let chosen = candidates.into_iter().find(is_available);
        match chosen {
            Some(candidate) => {
                tracing::debug!(
                    model = %model_slug,
                    provider = %candidate.provider.slug,
                    candidates = total,
                    "provider selected"
                );
                Ok(candidate)
            }
            None => {
                tracing::warn!(model = %model_slug, candidates = total, "all providers filtered out");
                Err(GatewayError::NoAvailableProvider(model_slug.to_string()))
            }
        }
    }
}

pub fn is_available(candidate: &ProviderCandidate) -> bool {
    let provider = &candidate.provider;
    provider.status == ProviderStatus::Active
        && provider.health != ProviderHealth::Unhealthy
        && candidate.support.enabled
        && provider
            .credential
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty())
        && provider
            .base_url
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ProviderFamily};
    use crate::providers::{ModelSupport, Provider};
    use async_trait::async_trait;
    use chrono::Utc;

    struct FixedIndex(Vec<ProviderCandidate>);

    #[async_trait]
    impl ModelProviderIndex for FixedIndex {
        async fn candidates_for_model(
            &self,
            model_slug: &str,
        ) -> Result<Vec<ProviderCandidate>, String> {
            Ok(self
                .0
                .iter()
                .filter(|c| c.support.model_slug == model_slug)
                .cloned()
                .collect())
        }
    }

    fn candidate(slug: &str, health: ProviderHealth) -> ProviderCandidate {
        ProviderCandidate {
            provider: Provider {
                id: format!("id-{slug}"),
                slug: slug.to_string(),
                name: slug.to_string(),
                family: ProviderFamily::OpenAi,
                base_url: Some("http://upstream".to_string()),
                credential: Some("secret".to_string()),
                status: ProviderStatus::Active,
                health,
                priority: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            support: ModelSupport {
                id: format!("ms-{slug}"),
                provider_id: format!("id-{slug}"),
                model_slug: "gpt-4o".to_string(),
                enabled: true,
                upstream_alias: None,
                config: ModelConfig::default(),
                priority: 0,
            },
        }
    }

    fn selector(candidates: Vec<ProviderCandidate>) -> ProviderSelector {
        ProviderSelector::new(Arc::new(FixedIndex(candidates)))
    }

    #[tokio::test]
    async fn selection_is_deterministic() {
        let s = selector(vec![
            candidate("first", ProviderHealth::Healthy),
            candidate("second", ProviderHealth::Healthy),
        ]);
        for _ in 0..5 {
            assert_eq!(s.select("gpt-4o").await.unwrap().provider.slug, "first");
        }
    }

    #[tokio::test]
    async fn unhealthy_top_candidate_falls_through() {
        let s = selector(vec![
            candidate("first", ProviderHealth::Unhealthy),
            candidate("second", ProviderHealth::Degraded),
        ]);
        assert_eq!(s.select("gpt-4o").await.unwrap().provider.slug, "second");
    }

    #[tokio::test]
    async fn distinguishes_missing_configuration_from_outage() {
        let mut disabled = candidate("first", ProviderHealth::Healthy);
        disabled.provider.status = ProviderStatus::Disabled;
        let mut no_key = candidate("second", ProviderHealth::Healthy);
        no_key.provider.credential = Some(" ".to_string());
        let mut off = candidate("third", ProviderHealth::Healthy);
        off.support.enabled = false;
        let s = selector(vec![disabled, no_key, off]);

        assert!(matches!(
            s.select("gpt-4o").await,
            Err(GatewayError::NoAvailableProvider(_))
        ));
        assert!(matches!(
            s.select("unknown").await,
            Err(GatewayError::NoProviderForModel(_))
        ));
    }
}
