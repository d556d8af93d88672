use clap::Parser;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.public_port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.enabled = Some(true);

    let overrides = ServeOverrides {
        public_port: Some(4321),
        log_level: Some("debug".to_string()),
        cache_enabled: Some(false),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.public_addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(!settings.cache.enabled);
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.public_addr.port(), DEFAULT_PUBLIC_PORT);
    assert_eq!(settings.server.admin_addr.port(), DEFAULT_ADMIN_PORT);
    assert!(settings.cache.enabled);
    assert_eq!(settings.cache.backend, CacheBackend::Memory);
    assert_eq!(settings.cache.default_ttl, Duration::ZERO);
    assert_eq!(settings.identity.resolve_timeout, Duration::from_millis(2_000));
    assert!(settings.csrf.enabled);
    assert_eq!(settings.csrf.marker, "__CSRF__");
    assert_eq!(settings.csrf.token_reuse, TokenReuse::Shared);
    assert_eq!(
        settings.csrf.content_types,
        vec!["text/html".to_string(), "application/xhtml+xml".to_string()]
    );
    assert_eq!(settings.csrf.headers, vec![HeaderName::from_static("x-csrf-token")]);
    assert!(settings.database.url.is_none());
    assert!(settings.upstream.base_url.is_none());
}

#[test]
fn postgres_backend_requires_database_url() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("postgres".to_string());

    let error = Settings::from_raw(raw.clone()).expect_err("missing url");
    assert!(matches!(error, LoadError::Invalid { key: "cache.backend", .. }));

    raw.database.url = Some("postgres://localhost/pagecache".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.backend, CacheBackend::Postgres);
}

#[test]
fn unknown_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("redis".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.backend", .. })
    ));
}

#[test]
fn default_ttl_cannot_exceed_max_ttl() {
    let mut raw = RawSettings::default();
    raw.cache.default_ttl_seconds = Some(120);
    raw.cache.max_ttl_seconds = Some(60);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.default_ttl_seconds", .. })
    ));
}

#[test]
fn csrf_marker_must_not_look_like_a_token() {
    for marker in ["", "deadbeef"] {
        let mut raw = RawSettings::default();
        raw.csrf.marker = Some(marker.to_string());
        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid { key: "csrf.marker", .. })
        ));
    }
}

#[test]
fn csrf_lists_are_normalized() {
    let mut raw = RawSettings::default();
    raw.csrf.token_reuse = Some("per_occurrence".to_string());
    raw.csrf.content_types = Some(vec![" Text/HTML ".to_string()]);
    raw.csrf.headers = Some(vec!["X-Form-Token".to_string()]);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.csrf.token_reuse, TokenReuse::PerOccurrence);
    assert_eq!(settings.csrf.content_types, vec!["text/html".to_string()]);
    assert_eq!(settings.csrf.headers, vec![HeaderName::from_static("x-form-token")]);
}

#[test]
fn upstream_url_must_be_http() {
    let mut raw = RawSettings::default();
    raw.upstream.base_url = Some("ftp://origin.internal".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "upstream.base_url", .. })
    ));

    let mut raw = RawSettings::default();
    raw.apply_serve_overrides(&ServeOverrides {
        upstream_url: Some("http://127.0.0.1:9000".to_string()),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.upstream.base_url.map(|url| url.to_string()),
        Some("http://127.0.0.1:9000/".to_string())
    );
}

#[test]
fn admin_and_public_addresses_must_differ() {
    let mut raw = RawSettings::default();
    raw.server.public_port = Some(9000);
    raw.server.admin_port = Some(9000);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["pagecache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_purge_arguments() {
    let args = CliArgs::parse_from([
        "pagecache",
        "purge",
        "--database-url",
        "postgres://example",
        "http://shop.test/products/*",
    ]);

    match args.command.expect("purge command") {
        Command::Purge(purge) => {
            assert_eq!(
                purge.database.database_url.as_deref(),
                Some("postgres://example")
            );
            assert_eq!(purge.pattern, "http://shop.test/products/*");
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_identity_commands() {
    let args = CliArgs::parse_from(["pagecache", "rotate-cache-id"]);
    assert!(matches!(args.command, Some(Command::RotateCacheId(_))));

    let args = CliArgs::parse_from(["pagecache", "cache-id", "--database-url", "postgres://x"]);
    match args.command.expect("cache-id command") {
        Command::CacheId(database) => {
            assert_eq!(database.database_url.as_deref(), Some("postgres://x"));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "pagecache",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--cache-enabled",
        "off",
        "--cache-backend",
        "postgres",
        "--database-url",
        "postgres://override",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(serve.overrides.cache_enabled, Some(false));
            assert_eq!(serve.overrides.cache_backend.as_deref(), Some("postgres"));
            assert_eq!(
                serve.overrides.database_url.as_deref(),
                Some("postgres://override")
            );
        }
        _ => panic!("wrong command parsed"),
    }
}
