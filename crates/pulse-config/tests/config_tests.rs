#[cfg(test)]
mod tests {
    use pulse_config::schema::*;
    use pulse_config::ConfigLoader;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_pulse_config_defaults() {
        let config = PulseConfig::default();
        assert_eq!(config.daemon.loop_interval_secs, 30);
        assert_eq!(config.daemon.health_port, 9720);
        assert_eq!(config.drives.trigger_threshold, 5.0);
        assert_eq!(config.drives.pressure_rate, 0.05);
        assert_eq!(config.drives.success_decay, 0.7);
        assert_eq!(config.webhook.max_turns_per_hour, 10);
        assert_eq!(config.webhook.min_trigger_interval_secs, 300);
        assert_eq!(config.evaluator.mode, "rules");
    }

    #[test]
    fn test_default_categories_include_protected_set() {
        let config = PulseConfig::default();
        assert!(config.drives.categories["goals"].protected);
        assert!(config.drives.categories["growth"].protected);
        assert!(config.is_protected_drive("goals"));
        assert!(config.is_protected_drive("growth"));
        assert!(!config.is_protected_drive("curiosity"));
    }

    #[test]
    fn test_guardrail_defaults() {
        let g = GuardrailConfig::default();
        assert_eq!(g.max_mutations_per_hour, 10);
        assert_eq!(g.max_weight_delta, 0.1);
        assert_eq!(g.min_cooldown_secs, 60);
        assert_eq!(g.max_cooldown_secs, 7200);
        assert_eq!(g.min_turns_per_hour, 1);
        assert_eq!(g.max_turns_per_hour, 60);
    }

    #[test]
    fn test_weight_floor_protected_is_higher() {
        let config = PulseConfig::default();
        assert!(config.weight_floor(true) > config.weight_floor(false));
    }

    // ── TOML roundtrip tests ───────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = PulseConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: PulseConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.daemon.health_port, config.daemon.health_port);
        assert_eq!(
            restored.drives.trigger_threshold,
            config.drives.trigger_threshold
        );
        assert_eq!(restored.webhook.url, config.webhook.url);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[drives]
trigger_threshold = 6.0

[drives.categories.writing]
weight = 0.7

[webhook]
url = "http://localhost:9999/hooks/agent"
"#;
        let config: PulseConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.drives.trigger_threshold, 6.0);
        assert_eq!(config.webhook.url, "http://localhost:9999/hooks/agent");
        assert_eq!(config.drives.categories["writing"].weight, 0.7);
        // Defaults should fill in
        assert_eq!(config.daemon.loop_interval_secs, 30);
        assert_eq!(config.drives.max_pressure, 10.0);
        assert_eq!(config.webhook.max_turns_per_hour, 10);
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_validate_rejects_bad_mode() {
        let mut config = PulseConfig::default();
        config.evaluator.mode = "vibes".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_rate() {
        let mut config = PulseConfig::default();
        config.drives.pressure_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warns_on_missing_token() {
        let config = PulseConfig::default();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "webhook.token"));
    }

    // ── Loader tests ───────────────────────────────────────────

    #[test]
    fn test_loader_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[daemon]\nhealth_port = 9719").unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().daemon.health_port, 9719);
    }

    #[test]
    fn test_loader_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().daemon.health_port, 9720);
    }

    #[test]
    fn test_loader_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[evaluator]\nmode = \"oracle\"").unwrap();
        assert!(ConfigLoader::load(Some(&path)).is_err());
    }
}
