use crate::core::types::{ClipMetadata, TaskId, TaskStatus};

#[test]
fn test_status_transitions() {
    use TaskStatus::*;

    // valid
    assert!(Pending.can_transition(Uploading));
    assert!(Pending.can_transition(Paused));
    assert!(Uploading.can_transition(Completed));
    assert!(Uploading.can_transition(Failed));
    assert!(Uploading.can_transition(Pending));
    assert!(Uploading.can_transition(Paused));
    assert!(Failed.can_transition(Pending));
    assert!(Paused.can_transition(Pending));

    // invalid
    assert!(!Pending.can_transition(Completed));
    assert!(!Completed.can_transition(Uploading));
    assert!(!Completed.can_transition(Pending));
    assert!(!Failed.can_transition(Uploading));
    assert!(!Paused.can_transition(Uploading));
}

#[test]
fn test_task_id_generation() {
    let id1 = TaskId::new();
    let id2 = TaskId::new();

    assert_ne!(id1, id2);
    assert_eq!(id1, id1);

    let id_str = id1.to_string();
    assert!(!id_str.is_empty());
}

#[test]
fn test_metadata_extra_fields_are_flattened() {
    let metadata = ClipMetadata::new("clip-42")
        .with("title", serde_json::json!("Pasta night"))
        .with("durationSec", serde_json::json!(37));

    let value = serde_json::to_value(&metadata).unwrap();
    // 业务字段和 id 平铺在同一层
    assert_eq!(value["id"], "clip-42");
    assert_eq!(value["title"], "Pasta night");
    assert_eq!(value["durationSec"], 37);

    let parsed: ClipMetadata = serde_json::from_value(value).unwrap();
    assert_eq!(parsed, metadata);
}

#[test]
fn test_status_serde_names() {
    assert_eq!(
        serde_json::to_string(&TaskStatus::Pending).unwrap(),
        "\"pending\""
    );
    assert_eq!(
        serde_json::from_str::<TaskStatus>("\"uploading\"").unwrap(),
        TaskStatus::Uploading
    );
}
