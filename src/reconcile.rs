use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};

use crate::aw_client::{AwRepository, Event, EventData};
use crate::status::StatusLine;
use crate::time_entry::TimeEntry;
use crate::toggl::ProjectMap;

/// bucketをremoteのtime entry一覧に同期させるための操作列。
#[derive(Debug, Default, PartialEq)]
pub struct SyncPlan {
    /// 削除するevent(aw-server採番のid)。
    pub deletions: Vec<i64>,
    /// 挿入するevent。入力のentry順を保つ。
    pub insertions: Vec<Event>,
}

/// project名とdescriptionから表示用のtitleを組み立てる。
///
/// aw-serverのUIはtitleが無いとeventを表示しないため、descriptionが空の
/// entryはproject名だけをtitleにする。
pub fn compose_title(project_name: &str, description: &str) -> String {
    if description.is_empty() {
        project_name.to_string()
    } else {
        format!("{} - {}", project_name, description)
    }
}

/// bucketの現状とremoteのentry一覧から、必要な削除と挿入を計算する。
///
/// - 未知のuidのentryは挿入する。
/// - 既知のuidのentryは、`update_existing`が偽なら何もしない。
///   真なら該当uidの既存eventを全て削除してから挿入し直す。
///   過去のrunが残した同一uidの重複eventもこの削除で1つに収束する。
pub fn plan(
    events: &[Event],
    entries: &[TimeEntry],
    projects: &ProjectMap,
    update_existing: bool,
) -> SyncPlan {
    let mut logged_events: HashMap<i64, Vec<i64>> = HashMap::new();
    for event in events {
        if let Some(event_id) = event.id {
            logged_events.entry(event.data.uid).or_default().push(event_id);
        }
    }

    let mut plan = SyncPlan::default();
    for entry in entries {
        let project_name = entry
            .project_id
            .and_then(|project_id| projects.get(&project_id))
            .cloned()
            .unwrap_or_default();
        let title = compose_title(&project_name, &entry.description);

        if let Some(event_ids) = logged_events.get(&entry.id) {
            if !update_existing {
                continue;
            }
            plan.deletions.extend(event_ids.iter().copied());
        }

        plan.insertions.push(Event {
            id: None,
            timestamp: entry.start,
            duration: Some(entry.duration as f64),
            data: EventData {
                project: project_name,
                title,
                tags: format!("{:?}", entry.tags),
                uid: entry.id,
            },
        });
    }

    // 同じuidが同一バッチに複数回現れても同じeventを二重に削除しない。
    plan.deletions.sort_unstable();
    plan.deletions.dedup();

    plan
}

/// remoteのtime entry一覧をbucketへ同期する。
///
/// 挿入したevent数を返す。storeの操作に失敗した場合はそのまま呼び出し元へ
/// 返し、復帰はループ側の方針に任せる。
pub async fn sync_entries<A, W>(
    aw: &A,
    bucket: &str,
    entries: &[TimeEntry],
    projects: &ProjectMap,
    update_existing: bool,
    status: &mut StatusLine<W>,
) -> Result<usize>
where
    A: AwRepository,
    W: Write,
{
    let events = aw
        .get_events(bucket)
        .await
        .context("Failed to list bucket events")?;
    let plan = plan(&events, entries, projects, update_existing);

    for event_id in &plan.deletions {
        aw.delete_event(bucket, *event_id)
            .await
            .with_context(|| format!("Failed to delete event {}", event_id))?;
    }

    let mut added_tasks = 0;
    for event in &plan.insertions {
        aw.insert_event(bucket, event)
            .await
            .context("Failed to insert event")?;
        added_tasks += 1;
        status.update(&format!(
            "Title: {}, Start: {}, Duration: {}",
            event.data.title,
            event.timestamp.to_rfc3339(),
            event.duration.unwrap_or_default()
        ));
    }
    status.update(&format!("Added {} task(s)", added_tasks));

    Ok(added_tasks)
}
