//! Instance registry tests.
//!
//! No broker is needed: connections are pointed at a closed local port.

use mqttgate_core::{Error, InstanceConfig};
use mqttgate_gateway::{message_queue, ConnectionState, InstanceRegistry, MessageReceiver};
use mqttgate_storage::InstanceConfigStore;
use serde_json::json;

fn registry(dir: &tempfile::TempDir) -> (InstanceRegistry, MessageReceiver) {
    let store = InstanceConfigStore::open(dir.path().join("config.redb")).unwrap();
    let (queue, receiver) = message_queue();
    (InstanceRegistry::new(store, queue), receiver)
}

/// A broker address nothing listens on.
fn unreachable() -> InstanceConfig {
    InstanceConfig::new("127.0.0.1").with_port(1).with_topic("home/#")
}

#[tokio::test]
async fn test_delete_unknown_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx) = registry(&dir);
    registry.create("a", None, false).await.unwrap();

    assert!(matches!(registry.delete("ghost").await, Err(Error::NotFound(_))));
    assert_eq!(registry.list().await, vec!["a".to_string()]);
}

#[tokio::test]
async fn test_unknown_instance_operations() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx) = registry(&dir);

    assert!(matches!(registry.start("ghost").await, Err(Error::NotFound(_))));
    assert!(matches!(registry.stop("ghost").await, Err(Error::NotFound(_))));
    assert!(matches!(registry.add_topic("ghost", "a/b").await, Err(Error::NotFound(_))));
    assert!(matches!(registry.list_topics("ghost").await, Err(Error::NotFound(_))));
    assert!(matches!(
        registry.get_config_value("ghost", "port").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_create_duplicate_and_order() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx) = registry(&dir);
    registry.create("b", None, false).await.unwrap();
    registry.create("a", Some(InstanceConfig::new("broker.local")), false).await.unwrap();

    assert!(matches!(registry.create("b", None, false).await, Err(Error::Conflict(_))));
    assert!(matches!(registry.create("", None, false).await, Err(Error::InvalidConfig(_))));
    assert_eq!(registry.list().await, vec!["b".to_string(), "a".to_string()]);
    assert_eq!(
        registry.get_config_value("a", "broker_address").await.unwrap(),
        json!("broker.local")
    );
}

#[tokio::test]
async fn test_failed_start_leaves_instance_idle() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx) = registry(&dir);
    registry.create("plant", Some(unreachable()), false).await.unwrap();

    assert!(matches!(registry.start("plant").await, Err(Error::Transport(_))));
    let conn = registry.get("plant").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Idle);

    // Stopping an idle instance is a no-op
    registry.stop("plant").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_autostart_failure_keeps_registration() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx) = registry(&dir);

    assert!(registry.create("plant", Some(unreachable()), true).await.is_err());
    assert_eq!(registry.list().await, vec!["plant".to_string()]);
    assert_eq!(
        registry.get_config_value("plant", "autostart").await.unwrap(),
        json!(true)
    );
}

#[tokio::test]
async fn test_topic_management() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx) = registry(&dir);
    registry.create("a", None, false).await.unwrap();

    registry.add_topic("a", "home/+/power").await.unwrap();
    registry.add_topic("a", "office/#").await.unwrap();
    assert!(matches!(
        registry.add_topic("a", "office/#").await,
        Err(Error::Conflict(_))
    ));
    assert_eq!(
        registry.list_topics("a").await.unwrap(),
        vec!["home/+/power".to_string(), "office/#".to_string()]
    );

    registry.delete_topic("a", "home/+/power").await.unwrap();
    assert!(matches!(
        registry.delete_topic("a", "home/+/power").await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(registry.list_topics("a").await.unwrap(), vec!["office/#".to_string()]);
}

#[tokio::test]
async fn test_config_update() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx) = registry(&dir);
    registry.create("a", None, false).await.unwrap();

    registry
        .update_instance_config("a", "settings.qos", json!(1))
        .await
        .unwrap();
    assert_eq!(registry.get_config_value("a", "settings.qos").await.unwrap(), json!(1));
    assert!(matches!(
        registry.get_config_value("a", "settings.missing").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        registry.update_instance_config("a", "", json!(1)).await,
        Err(Error::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_deleted_instance_handle_cannot_start() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _rx) = registry(&dir);
    registry.create("plant", Some(unreachable()), false).await.unwrap();

    // A handle taken before the delete, as a concurrent start would hold
    let handle = registry.get("plant").await.unwrap();
    registry.delete("plant").await.unwrap();

    assert!(matches!(handle.start().await, Err(Error::NotFound(_))));
    assert_eq!(handle.state(), ConnectionState::Idle);
    assert!(registry.list().await.is_empty());
}

#[tokio::test]
async fn test_delete_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (registry, _rx) = registry(&dir);
        registry.create("keep", None, false).await.unwrap();
        registry.create("drop", None, false).await.unwrap();
        registry.delete("drop").await.unwrap();
    }

    let store = InstanceConfigStore::open(dir.path().join("config.redb")).unwrap();
    let (queue, _rx) = message_queue();
    let reopened = InstanceRegistry::open(store, queue).unwrap();
    assert_eq!(reopened.list().await, vec!["keep".to_string()]);
}

#[tokio::test]
async fn test_restore_honours_autostart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (registry, _rx) = registry(&dir);
        registry.create("auto", Some(unreachable()), false).await.unwrap();
        registry
            .update_instance_config("auto", "autostart", json!(true))
            .await
            .unwrap();
    }

    let store = InstanceConfigStore::open(dir.path().join("config.redb")).unwrap();
    let (queue, _rx) = message_queue();
    let restored = InstanceRegistry::restore(store, queue).await.unwrap();
    let status = restored.status().await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].state, ConnectionState::Idle);
}
