#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use analyst_center_domain::{
    ensure_non_empty, hash_bytes, hash_json, AnalystConfig, CapabilityDefinition,
    NormalizedConfigEnvelope, RunOverrides, MAX_SAMPLE_ROWS, PLANNER_TAG,
};
use anyhow::{anyhow, Result};

const NORMALIZATION_VERSION: u32 = 1;

/// Load analyst configuration YAML from disk and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or normalized.
pub fn load_config_from_path(path: &Path) -> Result<NormalizedConfigEnvelope> {
    let content = fs::read_to_string(path)
        .map_err(|err| anyhow!("failed to read config {}: {err}", path.display()))?;
    normalize_config_yaml(&content)
}

/// Normalize configuration YAML into deterministic canonical JSON + hash.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn normalize_config_yaml(yaml: &str) -> Result<NormalizedConfigEnvelope> {
    let source_yaml_hash = hash_bytes(yaml.as_bytes());
    let mut config: AnalystConfig =
        serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid config YAML structure: {err}"))?;

    validate_config(&config)?;
    normalize_config(&mut config);
    validate_config(&config)?;

    let normalized_json = serde_json::to_value(&config)?;
    let normalized_hash = hash_json(&normalized_json)?;

    Ok(NormalizedConfigEnvelope {
        source_yaml_hash,
        normalized_hash,
        config,
        normalized_json,
    })
}

/// Validate a configuration value built in code rather than loaded from YAML.
///
/// # Errors
/// Returns an error describing the first invalid field.
pub fn validate_config(config: &AnalystConfig) -> Result<()> {
    ensure_non_empty("config_name", &config.config_name)?;
    ensure_non_empty("config_version", &config.config_version)?;
    ensure_non_empty("generation.url", &config.generation.url)?;
    ensure_non_empty("planner.model_id", &config.planner.model_id)?;
    if let Some(search) = &config.search {
        ensure_non_empty("search.url", &search.url)?;
        if search.max_results == 0 {
            return Err(anyhow!("search.max_results MUST be at least 1"));
        }
    }

    if config.capabilities.is_empty() {
        return Err(anyhow!("at least one capability MUST be configured"));
    }

    let mut names = BTreeSet::new();
    for capability in &config.capabilities {
        validate_capability(capability)?;
        if !names.insert(capability.name.as_str()) {
            return Err(anyhow!("duplicate capability name: {}", capability.name));
        }
    }

    if config.limits.row_cap == 0 {
        return Err(anyhow!("limits.row_cap MUST be at least 1"));
    }
    if config.limits.sample_rows > MAX_SAMPLE_ROWS {
        return Err(anyhow!(
            "limits.sample_rows MUST NOT exceed {MAX_SAMPLE_ROWS}, got {}",
            config.limits.sample_rows
        ));
    }

    Ok(())
}

fn validate_capability(capability: &CapabilityDefinition) -> Result<()> {
    ensure_non_empty("capability name", &capability.name)?;
    ensure_non_empty("capability description", &capability.description)?;
    ensure_non_empty("capability model_id", &capability.model_id)?;
    if capability.name == PLANNER_TAG {
        return Err(anyhow!("capability name `{PLANNER_TAG}` is reserved"));
    }
    if capability.name.chars().any(char::is_whitespace) {
        return Err(anyhow!(
            "capability name `{}` MUST NOT contain whitespace",
            capability.name
        ));
    }
    if capability.max_attempts == 0 {
        return Err(anyhow!(
            "capability {} max_attempts MUST be at least 1",
            capability.name
        ));
    }
    Ok(())
}

fn normalize_config(config: &mut AnalystConfig) {
    config.normalization_version = NORMALIZATION_VERSION;
    config.config_name = config.config_name.trim().to_string();
    config.config_version = config.config_version.trim().to_string();

    for capability in &mut config.capabilities {
        capability.name = capability.name.trim().to_string();
        capability.description = capability.description.trim().to_string();
    }
    config
        .capabilities
        .sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
}

/// Resolve the capabilities enabled for one request.
///
/// An empty request list enables every configured capability. Unknown names
/// are rejected.
///
/// # Errors
/// Returns an error naming the first capability that is not configured.
pub fn resolve_enabled_capabilities(
    config: &AnalystConfig,
    requested: &[String],
) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(config
            .capabilities
            .iter()
            .map(|capability| capability.name.clone())
            .collect());
    }

    let known = config.capability_names();
    let mut enabled: Vec<String> = Vec::with_capacity(requested.len());
    for name in requested {
        let name = name.trim();
        if !known.contains(name) {
            return Err(anyhow!(
                "unknown capability `{name}`; configured capabilities are: {}",
                known.iter().copied().collect::<Vec<_>>().join(", ")
            ));
        }
        if !enabled.iter().any(|existing| existing == name) {
            enabled.push(name.to_string());
        }
    }
    Ok(enabled)
}

/// Validate overrides against the configuration they will be applied to.
///
/// # Errors
/// Returns an error for overrides that name unknown capabilities or are empty.
pub fn validate_overrides(config: &AnalystConfig, overrides: &RunOverrides) -> Result<()> {
    if let Some(model) = &overrides.planner_model {
        ensure_non_empty("overrides.planner_model", model)?;
    }
    for (name, model) in &overrides.capability_models {
        if config.capability(name).is_none() {
            return Err(anyhow!("model override names unknown capability `{name}`"));
        }
        ensure_non_empty("overrides.capability_models value", model)?;
    }
    if overrides.request_timeout_ms == Some(0) {
        return Err(anyhow!("overrides.request_timeout_ms MUST be at least 1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{normalize_config_yaml, resolve_enabled_capabilities, validate_overrides};
    use analyst_center_domain::{CapabilityKind, ReplanPolicyKind, RunOverrides};

    const YAML: &str = r"
config_name: analyst
config_version: v1
generation:
  url: http://localhost:8080/v1/chat/completions
planner:
  model_id: reasoner
capabilities:
  - name: search
    kind: search
    description: Searches the web for recent facts
    model_id: fast
  - name: sql
    kind: query
    description: Runs read-only SQL against the sales database
    model_id: coder
    max_attempts: 2
";

    #[test]
    fn normalize_hash_is_stable_and_sorted() {
        let first = normalize_config_yaml(YAML);
        let second = normalize_config_yaml(YAML);
        assert!(first.is_ok());
        assert!(second.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        let second = second.unwrap_or_else(|_| unreachable!());
        assert_eq!(first.normalized_hash, second.normalized_hash);

        let names: Vec<&str> = first
            .config
            .capabilities
            .iter()
            .map(|capability| capability.name.as_str())
            .collect();
        assert_eq!(names, vec!["search", "sql"]);
        assert_eq!(first.config.capabilities[1].kind, CapabilityKind::Query);
        assert_eq!(first.config.capabilities[0].max_attempts, 3);
        assert_eq!(first.config.limits.max_replans, 2);
        assert_eq!(first.config.limits.row_cap, 10_000);
        assert_eq!(first.config.replan_policy, ReplanPolicyKind::OnFailure);
    }

    #[test]
    fn reserved_planner_name_is_rejected() {
        let yaml = YAML.replace("name: search", "name: planner");
        let result = normalize_config_yaml(&yaml);
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_capability_names_are_rejected() {
        let yaml = YAML.replace("name: search", "name: sql");
        assert!(normalize_config_yaml(&yaml).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = format!("{YAML}unexpected: true\n");
        assert!(normalize_config_yaml(&yaml).is_err());
    }

    #[test]
    fn enabled_capabilities_resolve_against_config() {
        let envelope = normalize_config_yaml(YAML).unwrap_or_else(|_| unreachable!());
        let config = envelope.config;

        let all = resolve_enabled_capabilities(&config, &[]);
        assert_eq!(
            all.unwrap_or_else(|_| unreachable!()),
            vec!["search".to_string(), "sql".to_string()]
        );

        let subset =
            resolve_enabled_capabilities(&config, &["sql".to_string(), "sql".to_string()]);
        assert_eq!(
            subset.unwrap_or_else(|_| unreachable!()),
            vec!["sql".to_string()]
        );

        assert!(resolve_enabled_capabilities(&config, &["chart".to_string()]).is_err());
    }

    #[test]
    fn overrides_must_name_known_capabilities() {
        let envelope = normalize_config_yaml(YAML).unwrap_or_else(|_| unreachable!());
        let mut overrides = RunOverrides::default();
        overrides
            .capability_models
            .insert("chart".to_string(), "m".to_string());
        assert!(validate_overrides(&envelope.config, &overrides).is_err());
    }
}
