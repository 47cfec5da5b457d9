use erp_gateway::protocol::MockTransport;
use erp_gateway::{EnvSource, ErrorKind, Gateway, GatewayConfig};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

#[tokio::test(start_paused = true)]
async fn test_gateway_from_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
default_instance = "prod"

[session]
idle_validate_secs = 30

[instances.prod]
url = "erp.example.com"
database = "prod"
username = "api"
password = "secret"
timeout = 10
verify_tls = false
"#
    )
    .unwrap();

    let config = GatewayConfig::load(file.path()).unwrap();
    let prod = &config.instances["prod"];
    assert_eq!(prod.url, "http://erp.example.com");
    assert_eq!(prod.timeout(), Duration::from_secs(10));
    assert!(!prod.verify_ssl);

    let mock = MockTransport::new();
    let gw = Gateway::with_env(config, Arc::new(mock.clone()), EnvSource::Disabled).unwrap();

    let first = gw.resolve_instance(None).await.unwrap();
    assert_eq!(first.instance(), "prod");

    // Idle past the configured period: validated, not re-authenticated
    tokio::time::advance(Duration::from_secs(31)).await;
    let second = gw.resolve_instance(None).await.unwrap();
    assert_eq!(second.generation(), first.generation());
    assert_eq!(mock.validate_count(), 1);
    assert_eq!(mock.auth_count(), 1);
}

#[test]
fn test_invalid_policy_rejected() {
    let err = GatewayConfig::from_toml_str(
        r#"
[retry]
max_attempts = 0
"#,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = GatewayConfig::from_toml_str(
        r#"
[retry]
backoff = "sometimes"
"#,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_missing_instance_file() {
    let err = GatewayConfig::load(std::path::Path::new("/nonexistent/gateway.toml")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
