use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Toggl APIから取得したtime entryを表す構造体。
///
/// `id`はpollをまたいで変わらない唯一の識別子。description/duration/tagsは
/// ユーザーが過去のentryを編集すると同じ`id`のまま変化する。
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TimeEntry {
    pub id: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub project_id: Option<i64>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 継続時間(秒)。実行中のentryは負の値になる。
    #[serde(default = "running_duration")]
    pub duration: i64,
}

fn running_duration() -> i64 {
    -1
}

#[cfg(test)]
mod tests {
    use super::TimeEntry;

    /// Toggl APIのレスポンスをデシリアライズできることを確認する。
    #[test]
    fn test_deserialize_entry() {
        let body = r#"{
            "id": 42,
            "description": "Coding",
            "project_id": 7,
            "start": "2024-01-02T09:00:00+00:00",
            "tags": ["rust"],
            "duration": 3600
        }"#;

        let entry: TimeEntry = serde_json::from_str(body).unwrap();

        assert_eq!(entry.id, 42);
        assert_eq!(entry.description, "Coding");
        assert_eq!(entry.project_id, Some(7));
        assert_eq!(entry.tags, vec!["rust".to_string()]);
        assert_eq!(entry.duration, 3600);
    }

    /// 実行中のentryのように省略可能なフィールドが無くてもデシリアライズできることを確認する。
    #[test]
    fn test_deserialize_running_entry() {
        let body = r#"{
            "id": 42,
            "start": "2024-01-02T09:00:00+00:00"
        }"#;

        let entry: TimeEntry = serde_json::from_str(body).unwrap();

        assert_eq!(entry.description, "");
        assert_eq!(entry.project_id, None);
        assert!(entry.tags.is_empty());
        assert_eq!(entry.duration, -1);
    }
}
