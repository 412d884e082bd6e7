use super::*;

use std::{collections::HashMap, time::Duration};

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn api_root_joins_base_url_and_path_without_double_slashes() {
    let mut settings = ClientSettings::for_base_url("https://build.example.com/");
    settings.base_path = "/api/v2/".into();
    assert_eq!(settings.api_root(), "https://build.example.com/api/v2");

    settings.base_path = String::new();
    assert_eq!(settings.api_root(), "https://build.example.com");
}

#[test]
fn live_root_swaps_http_scheme_for_websocket_scheme() {
    let settings = ClientSettings::for_base_url("https://build.example.com");
    assert_eq!(
        settings.live_root().expect("wss"),
        "wss://build.example.com/api"
    );

    let settings = ClientSettings::for_base_url("http://127.0.0.1:9000");
    assert_eq!(settings.live_root().expect("ws"), "ws://127.0.0.1:9000/api");

    let settings = ClientSettings::for_base_url("ftp://build.example.com");
    assert!(settings.live_root().is_err());
}

#[test]
fn file_values_override_defaults() {
    let file_cfg: FileSettings = toml::from_str(
        r#"
        base_url = "https://portal.example.com"
        history_page_size = 25

        [reconnect]
        enabled = false
        max_delay_ms = 2000
        "#,
    )
    .expect("parse toml");

    let mut settings = ClientSettings::default();
    apply_file_settings(&mut settings, file_cfg);

    assert_eq!(settings.base_url, "https://portal.example.com");
    assert_eq!(settings.history_page_size, 25);
    assert_eq!(settings.base_path, "/api");
    assert!(!settings.reconnect.enabled);
    assert_eq!(settings.reconnect.max_delay_ms, 2000);
    assert_eq!(settings.reconnect.max_attempts, 5);
}

#[test]
fn env_overrides_win_and_bad_numbers_are_ignored() {
    let mut settings = ClientSettings::default();
    settings.history_page_size = 25;
    apply_env_overrides(
        &mut settings,
        env(&[
            ("APP__BASE_URL", "https://staging.example.com"),
            ("APP__HISTORY_PAGE_SIZE", "not-a-number"),
            ("APP__REQUEST_TIMEOUT_SECS", " 5 "),
        ]),
    );

    assert_eq!(settings.base_url, "https://staging.example.com");
    assert_eq!(settings.history_page_size, 25);
    assert_eq!(settings.request_timeout_secs, 5);
}

#[test]
fn missing_config_file_yields_defaults_plus_env() {
    let path = std::env::temp_dir().join("client-config-that-does-not-exist.toml");
    let settings = load_settings_from(&path).expect("load");
    assert_eq!(settings.history_max_pages, ClientSettings::default().history_max_pages);
}

#[test]
fn reconnect_delay_doubles_until_capped_and_budget_runs_out() {
    let policy = ReconnectSettings {
        enabled: true,
        max_attempts: 4,
        base_delay_ms: 100,
        max_delay_ms: 300,
    };
    assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
    assert_eq!(policy.delay_for(1), Some(Duration::from_millis(200)));
    assert_eq!(policy.delay_for(2), Some(Duration::from_millis(300)));
    assert_eq!(policy.delay_for(3), Some(Duration::from_millis(300)));
    assert_eq!(policy.delay_for(4), None);
    assert_eq!(ReconnectSettings::disabled().delay_for(0), None);
}
