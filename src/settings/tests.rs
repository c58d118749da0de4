use super::*;
use crate::config::paths;
use std::sync::atomic::{AtomicUsize, Ordering};

const TEST_TEMPLATE: &str = r#"
definitions:
  - path: /services/udpListener/preferredPort
    default_value: "50222"
    type: int
  - path: /services/unitOfMeasure/airTemperature/selection
    default_value: celsius
    allowed_values: [celsius, fahrenheit]
  - path: /services/build/channel
    default_value: stable
    editable: false
  - path: /services/database/rollup/connectionString
    default_value: ""
    secret: true
values:
  - path: /services/udpListener/preferredPort
    value: "50222"
"#;

fn source_in(dir: &tempfile::TempDir) -> Arc<FileSettingsSource> {
    Arc::new(FileSettingsSource::new(dir.path().join("settings.yaml")).with_template(TEST_TEMPLATE))
}

async fn repository(dir: &tempfile::TempDir) -> (Arc<SettingsRepository>, Arc<RelayBus>) {
    let bus = Arc::new(RelayBus::default());
    let repo = SettingsRepository::initialize(source_in(dir), Arc::clone(&bus))
        .await
        .unwrap();
    (repo, bus)
}

#[tokio::test]
async fn test_template_values_and_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, _) = repository(&dir).await;

    assert_eq!(
        repo.get_value_or_default(paths::UDP_LISTENER_PREFERRED_PORT).as_deref(),
        Some("50222")
    );
    assert_eq!(
        repo.get_value_or_default(paths::UNIT_AIR_TEMPERATURE).as_deref(),
        Some("celsius")
    );
    assert_eq!(repo.get_value_or_default("/services/unknown"), None);
    assert_eq!(repo.get_all_definitions().len(), 4);
    assert_eq!(repo.get_all_values().len(), 1);
}

#[tokio::test]
async fn test_apply_then_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, _) = repository(&dir).await;

    let changed = repo
        .apply_overrides(vec![SettingValue::new(paths::UDP_LISTENER_PREFERRED_PORT, "50223")])
        .await
        .unwrap();

    assert_eq!(changed, 1);
    assert_eq!(
        repo.get_value_or_default(paths::UDP_LISTENER_PREFERRED_PORT).as_deref(),
        Some("50223")
    );
}

#[tokio::test]
async fn test_override_ignores_template_value() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, _) = repository(&dir).await;

    assert_eq!(repo.get_override(paths::UDP_LISTENER_PREFERRED_PORT), None);
    assert_eq!(repo.get_override(paths::UNIT_AIR_TEMPERATURE), None);

    repo.apply_overrides(vec![SettingValue::new(paths::UDP_LISTENER_PREFERRED_PORT, "50300")])
        .await
        .unwrap();
    assert_eq!(
        repo.get_override(paths::UDP_LISTENER_PREFERRED_PORT).as_deref(),
        Some("50300")
    );

    // Setting it back to the template value clears the override.
    repo.apply_overrides(vec![SettingValue::new(paths::UDP_LISTENER_PREFERRED_PORT, "50222")])
        .await
        .unwrap();
    assert_eq!(repo.get_override(paths::UDP_LISTENER_PREFERRED_PORT), None);
}

#[tokio::test]
async fn test_overrides_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (repo, _) = repository(&dir).await;
        repo.apply_overrides(vec![SettingValue::new(paths::UNIT_AIR_TEMPERATURE, "fahrenheit")])
            .await
            .unwrap();
    }

    let (restarted, _) = repository(&dir).await;
    assert_eq!(
        restarted.get_value_or_default(paths::UNIT_AIR_TEMPERATURE).as_deref(),
        Some("fahrenheit")
    );
    // Template values not overridden are kept.
    assert_eq!(
        restarted
            .get_value_or_default(paths::UDP_LISTENER_PREFERRED_PORT)
            .as_deref(),
        Some("50222")
    );
}

#[tokio::test]
async fn test_malformed_override_file_falls_back_to_template() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("settings.yaml"), "values: [this is: not: valid").unwrap();

    let (repo, _) = repository(&dir).await;
    assert_eq!(
        repo.get_value_or_default(paths::UDP_LISTENER_PREFERRED_PORT).as_deref(),
        Some("50222")
    );
}

#[tokio::test]
async fn test_invalid_template_fails_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(
        FileSettingsSource::new(dir.path().join("settings.yaml")).with_template("definitions: 7"),
    );
    let result = SettingsRepository::initialize(source, Arc::new(RelayBus::default())).await;
    assert!(matches!(result, Err(SettingsError::Template(_))));
}

#[tokio::test]
async fn test_rejections_apply_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, _) = repository(&dir).await;

    let result = repo
        .apply_overrides(vec![
            SettingValue::new(paths::UDP_LISTENER_PREFERRED_PORT, "50300"),
            SettingValue::new(paths::UNIT_AIR_TEMPERATURE, "kelvin"),
        ])
        .await;

    assert!(matches!(result, Err(SettingsError::Rejected { .. })));
    assert_eq!(
        repo.get_value_or_default(paths::UDP_LISTENER_PREFERRED_PORT).as_deref(),
        Some("50222")
    );
}

#[tokio::test]
async fn test_type_and_editable_checks() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, _) = repository(&dir).await;

    assert!(repo
        .apply_overrides(vec![SettingValue::new(paths::UDP_LISTENER_PREFERRED_PORT, "abc")])
        .await
        .is_err());
    assert!(repo
        .apply_overrides(vec![SettingValue::new("/services/build/channel", "beta")])
        .await
        .is_err());
}

#[tokio::test]
async fn test_value_without_definition_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, _) = repository(&dir).await;

    repo.apply_overrides(vec![SettingValue::new("/services/dynamic/flag", "on")])
        .await
        .unwrap();
    let setting = repo.get_setting("/services/dynamic/flag").unwrap();
    assert_eq!(setting.value, "on");
    assert!(setting.definition.is_none());
}

#[tokio::test]
async fn test_one_notification_per_changed_value() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, _) = repository(&dir).await;

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    repo.register_for_change_messages(paths::UNIT_OF_MEASURE, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    repo.apply_overrides(vec![
        SettingValue::new(paths::UNIT_AIR_TEMPERATURE, "fahrenheit"),
        SettingValue::new(paths::UDP_LISTENER_PREFERRED_PORT, "50223"),
    ])
    .await
    .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Unchanged value: no notification.
    let changed = repo
        .apply_overrides(vec![SettingValue::new(paths::UNIT_AIR_TEMPERATURE, "fahrenheit")])
        .await
        .unwrap();
    assert_eq!(changed, 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_can_read_repository_during_notification() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, _) = repository(&dir).await;

    let observed = Arc::new(std::sync::Mutex::new(None));
    let slot = Arc::clone(&observed);
    let weak = Arc::downgrade(&repo);
    repo.register_for_change_messages(paths::UDP_LISTENER_PREFERRED_PORT, move |value| {
        if let Some(repo) = weak.upgrade() {
            *slot.lock().unwrap() = repo.get_value_or_default(&value.path);
        }
    });

    repo.apply_overrides(vec![SettingValue::new(paths::UDP_LISTENER_PREFERRED_PORT, "50400")])
        .await
        .unwrap();
    assert_eq!(observed.lock().unwrap().as_deref(), Some("50400"));
}

#[tokio::test]
async fn test_override_file_holds_only_the_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let (repo, _) = repository(&dir).await;

    repo.apply_overrides(vec![
        SettingValue::new(paths::UNIT_AIR_TEMPERATURE, "fahrenheit"),
        SettingValue::new(paths::UDP_LISTENER_PREFERRED_PORT, "50222"),
    ])
    .await
    .unwrap();

    let text = std::fs::read_to_string(dir.path().join("settings.yaml")).unwrap();
    let doc = SettingsDocument::from_yaml(&text).unwrap();
    assert_eq!(
        doc.values,
        vec![SettingValue::new(paths::UNIT_AIR_TEMPERATURE, "fahrenheit")]
    );
}

#[test]
fn test_merge_documents() {
    let template = SettingsDocument::from_yaml(TEST_TEMPLATE).unwrap();
    let overrides = SettingsDocument::from_yaml(
        r#"
definitions:
  - path: /services/udpListener/preferredPort
    default_value: "1"
  - path: /services/custom/thing
    default_value: "x"
values:
  - path: /services/udpListener/preferredPort
    value: "50999"
  - path: /services/custom/thing
    value: "y"
"#,
    )
    .unwrap();

    let merged = merge_documents(template, overrides);

    assert_eq!(merged.definitions.len(), 5);
    let port_def = merged
        .definitions
        .iter()
        .find(|d| d.path == paths::UDP_LISTENER_PREFERRED_PORT)
        .unwrap();
    assert_eq!(port_def.default_value.as_deref(), Some("50222"));
    assert_eq!(merged.values.len(), 2);
    assert_eq!(merged.values[0].value, "50999");
}
