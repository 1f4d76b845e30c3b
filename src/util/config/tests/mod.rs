//! 配置单元测试
//!
//! 覆盖默认值、RON 读写、环境变量覆盖与校验

use std::collections::HashMap;

use super::*;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[cfg(test)]
mod default_tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = LoaderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_package_summary_size, 16384);
        assert_eq!(config.process_imports_loop_limit, 20);
        assert!(config.randomize_load_order.is_none());
    }

    #[test]
    fn test_derived_limits() {
        let config = LoaderConfig::default();
        assert_eq!(config.throttle_budget(), 30 * 1024 * 1024);
        let precache = config.precache_limits();
        assert_eq!(precache.max_block, 1024 * 1024);
        assert_eq!(precache.max_exports, 20);
        assert_eq!(precache.max_skip, 48 * 1024);
        let summary = config.summary_limits();
        assert!(summary.min_summary <= summary.max_summary);
    }
}

#[cfg(test)]
mod ron_tests {
    use super::*;

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = LoaderConfig::from_ron("(max_outstanding_precache_requests: 4, randomize_load_order: Some(9))").unwrap();
        assert_eq!(config.max_outstanding_precache_requests, 4);
        assert_eq!(config.randomize_load_order, Some(9));
        assert_eq!(config.max_export_count_precache, 20);
    }

    #[test]
    fn test_invalid_document_rejected() {
        assert!(matches!(LoaderConfig::from_ron("(max_header_size: \"big\")"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            LoaderConfig::from_ron("(max_outstanding_precache_requests: 0)"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.ron");
        let mut config = LoaderConfig::default();
        config.package_extension = "pak".to_string();
        config.save_file(&path).unwrap();
        assert_eq!(LoaderConfig::load_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = LoaderConfig::load_file(&dir.path().join("absent.ron"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}

#[cfg(test)]
mod env_tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        let mut config = LoaderConfig::default();
        config
            .apply_env_from(env(&[
                ("ASYNCLOAD_RANDOMIZE_SEED", "42"),
                ("ASYNCLOAD_BACKGROUND_THREAD", "yes"),
                ("ASYNCLOAD_STALL_MB", "1"),
            ]))
            .unwrap();
        assert_eq!(config.randomize_load_order, Some(42));
        assert!(config.use_background_thread);
        assert_eq!(config.throttle_budget(), 1024 * 1024);
    }

    #[test]
    fn test_env_can_disable_randomization() {
        let mut config = LoaderConfig {
            randomize_load_order: Some(1),
            ..Default::default()
        };
        config.apply_env_from(env(&[("ASYNCLOAD_RANDOMIZE_SEED", "off")])).unwrap();
        assert!(config.randomize_load_order.is_none());
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = LoaderConfig::default();
        let result = config.apply_env_from(env(&[("ASYNCLOAD_BACKGROUND_THREAD", "maybe")]));
        match result {
            Err(ConfigError::Env { key, value }) => {
                assert_eq!(key, "ASYNCLOAD_BACKGROUND_THREAD");
                assert_eq!(value, "maybe");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
