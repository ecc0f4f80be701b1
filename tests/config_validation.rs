use std::sync::Arc;

use dimse::mock::{MockArchive, MockStudy};
use pacs_retriever::config::{Config, ConfigError};
use tokio_util::sync::CancellationToken;

fn load_config_from_str(toml: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(toml).expect("TOML parse error");
    config.validate()?;
    Ok(config)
}

#[test]
fn test_valid_config_passes() {
    let toml = r#"
        [remote]
        host = "127.0.0.1"
        port = 104
        ae_title = "ORTHANC"

        [query]
        study_date = "20240101-20240131"
    "#;

    assert!(load_config_from_str(toml).is_ok());
}

#[test]
fn test_missing_host_fails() {
    let toml = r#"
        [remote]
        port = 104
        ae_title = "ORTHANC"
    "#;

    let err = load_config_from_str(toml).unwrap_err();
    assert!(matches!(err, ConfigError::MissingRemote("host")));
}

#[test]
fn test_blank_ae_title_counts_as_missing() {
    let toml = r#"
        [remote]
        host = "pacs"
        port = 104
        ae_title = "   "
    "#;

    let err = load_config_from_str(toml).unwrap_err();
    assert!(matches!(err, ConfigError::MissingRemote("ae_title")));
}

#[test]
fn test_long_local_ae_title_fails() {
    let toml = r#"
        [remote]
        host = "pacs"
        port = 104
        ae_title = "ORTHANC"

        [local]
        ae_title = "THIS_AE_TITLE_IS_TOO_LONG"
    "#;

    let err = load_config_from_str(toml).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidAeTitle { side: "Local", .. }));
}

#[test]
fn test_invalid_dates_fail() {
    for (field, value) in [("from_date", "20241301"), ("to_date", "2024-01-31"), ("study_date", "202401")] {
        let toml = format!(
            r#"
            [remote]
            host = "pacs"
            port = 104
            ae_title = "ORTHANC"

            [query]
            {} = "{}"
            "#,
            field, value
        );
        let err = load_config_from_str(&toml).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidDate { .. }),
            "{} = {} should be rejected, got {:?}",
            field,
            value,
            err
        );
    }
}

#[test]
fn test_zero_timeout_fails() {
    let toml = r#"
        [remote]
        host = "pacs"
        port = 104
        ae_title = "ORTHANC"

        [retrieval]
        tool_timeout_secs = 0
    "#;

    assert!(matches!(
        load_config_from_str(toml).unwrap_err(),
        ConfigError::InvalidTimeout("Tool")
    ));
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("retriever.toml");
    std::fs::write(
        &path,
        "[remote]\nhost = \"pacs\"\nport = 4242\nae_title = \"ARCHIVE\"\n",
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.remote.port, Some(4242));

    let missing = Config::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(missing, ConfigError::Io { .. }));

    std::fs::write(&path, "[remote\nhost = ").unwrap();
    assert!(matches!(Config::load(&path).unwrap_err(), ConfigError::Parse(_)));
}

#[tokio::test]
async fn test_configuration_error_precedes_network_activity() {
    let archive = MockArchive::new(vec![MockStudy::new("1.2", "P1", Some("NM"))]);
    let mut config = Config::default();
    config.remote.port = Some(104);
    config.remote.ae_title = Some("ARCHIVE".into());

    let result = pacs_retriever::run_with_protocol(
        config,
        Arc::new(archive.clone()),
        CancellationToken::new(),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(archive.stats().associations_opened, 0);
    assert_eq!(archive.stats().find_requests, 0);
}
