use std::collections::HashSet;
use std::path::Path;

use crate::Config;

const CAPABILITIES: [&str; 5] = ["chat", "embedding", "image", "video", "audio"];

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, expansion or parsing
    /// fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::parse(&raw)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing or validation fails
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_cache()?;
        self.validate_routes()?;
        self.validate_billing()?;
        Ok(())
    }

    fn validate_cache(&self) -> anyhow::Result<()> {
        if !(0.0..1.0).contains(&self.cache.jitter_ratio) {
            anyhow::bail!("cache.jitter_ratio must be in [0, 1)");
        }

        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be greater than 0");
        }

        if self.circuit_breaker.half_open_success_count == 0 {
            anyhow::bail!("circuit_breaker.half_open_success_count must be greater than 0");
        }

        Ok(())
    }

    fn validate_routes(&self) -> anyhow::Result<()> {
        let mut routes = HashSet::new();

        for route in &self.routes {
            if !CAPABILITIES.contains(&route.capability.as_str()) {
                anyhow::bail!(
                    "route '{}' has unknown capability '{}'",
                    route.model,
                    route.capability
                );
            }

            if !routes.insert((route.capability.as_str(), route.model.as_str())) {
                anyhow::bail!("duplicate route for {} model '{}'", route.capability, route.model);
            }

            if route.candidates.is_empty() {
                anyhow::bail!("route '{}' has no candidates", route.model);
            }

            let mut ids = HashSet::new();
            for candidate in &route.candidates {
                let id = candidate.resolved_id();

                if !ids.insert(id.clone()) {
                    anyhow::bail!("route '{}' lists candidate '{id}' twice", route.model);
                }

                if !matches!(candidate.url.scheme(), "http" | "https") {
                    anyhow::bail!("candidate '{id}' must use an http or https URL");
                }

                if candidate.input_price < 0.0 || candidate.output_price < 0.0 {
                    anyhow::bail!("candidate '{id}' has a negative price");
                }

                if let Some(task) = &candidate.async_task
                    && !task.status_url.contains("{task_id}")
                {
                    anyhow::bail!("candidate '{id}' async_task.status_url must contain {{task_id}}");
                }
            }
        }

        Ok(())
    }

    fn validate_billing(&self) -> anyhow::Result<()> {
        let mut tenants = HashSet::new();
        for tenant in &self.billing.tenants {
            if !tenants.insert(tenant.id.as_str()) {
                anyhow::bail!("tenant '{}' is defined twice", tenant.id);
            }
            if tenant.credit_limit < 0.0 {
                anyhow::bail!("tenant '{}' has a negative credit limit", tenant.id);
            }
        }

        if self.billing.max_cas_retries == 0 {
            anyhow::bail!("billing.max_cas_retries must be greater than 0");
        }

        Ok(())
    }
}
