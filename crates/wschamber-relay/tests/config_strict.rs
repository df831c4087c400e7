#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use wschamber_relay::config;

#[test]
fn deny_unknown_fields_nested() {
    let bad = r#"
version: 1
listen: "0.0.0.0:8080"
families:
  - base_url: "/"
    max_connectionz: 3 # typo should fail
"#;

    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.http_status(), 400);
}

#[test]
fn ok_minimal_config() {
    let ok = r#"
version: 1
listen: "127.0.0.1:9000"
"#;
    let cfg = config::load_from_str(ok).expect("must parse");
    assert_eq!(cfg.listen, "127.0.0.1:9000");
    // Default families: the two-peer variant first, then the open family.
    assert_eq!(cfg.families.len(), 2);
    assert_eq!(cfg.families[0].base_url, "/2");
    assert_eq!(cfg.families[0].max_connections, 2);
    assert_eq!(cfg.families[0].max_queue_items, 0);
    assert_eq!(cfg.families[0].max_queue_data, 0);
    assert_eq!(cfg.families[1].base_url, "/");
}

#[test]
fn duplicate_family_base_urls_are_rejected() {
    let bad = r#"
version: 1
families:
  - base_url: "/"
  - base_url: "/"
"#;
    assert!(config::load_from_str(bad).is_err());
}

#[test]
fn invalid_listen_is_rejected() {
    let bad = r#"
version: 1
listen: "not-an-address"
"#;
    assert!(config::load_from_str(bad).is_err());
}

#[test]
fn cli_overrides_port_and_origins() {
    let mut cfg = config::RelayConfig::default();
    config::apply_cli_overrides(
        &mut cfg,
        &["9090".to_string(), "https://a.example,https://b.example".to_string()],
    )
    .expect("overrides apply");

    assert_eq!(cfg.listen, "0.0.0.0:9090");
    assert_eq!(
        cfg.permitted_origins,
        vec!["https://a.example".to_string(), "https://b.example".to_string()]
    );
    cfg.validate().expect("still valid");
}

#[test]
fn cli_rejects_bad_port_and_extra_args() {
    let mut cfg = config::RelayConfig::default();
    assert!(config::apply_cli_overrides(&mut cfg, &["not-a-port".into()]).is_err());

    let mut cfg = config::RelayConfig::default();
    assert!(config::apply_cli_overrides(
        &mut cfg,
        &["8080".into(), "".into(), "extra".into()]
    )
    .is_err());
}

#[test]
fn empty_origins_argument_allows_any() {
    let mut cfg = config::RelayConfig::default();
    cfg.permitted_origins = vec!["https://old.example".into()];
    config::apply_cli_overrides(&mut cfg, &["8080".into(), "".into()]).unwrap();
    assert!(cfg.permitted_origins.is_empty());
}
