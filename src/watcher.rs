use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use log::error;
use tokio::sync::watch;

use crate::aw_client::{AwRepository, Event, EventData};
use crate::datetime;
use crate::status::StatusLine;
use crate::time_entry::TimeEntry;
use crate::toggl::{ProjectMap, TogglError, TogglRepository};

/// 一時的なエラーから復帰する時の短い待機時間。
const SHORT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// heartbeatのpulsetimeに加える余裕(秒)。
///
/// pulsetimeがpoll間隔より長くないと、同じentryの連続するtickが別eventに
/// 分かれてしまう。スケジューリングの揺れを吸収する分を足す。
const PULSETIME_MARGIN: f64 = 5.0;

/// tick内のfetch失敗の分類。分類ごとに復帰方法が異なる。
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FetchFailure {
    /// APIのエラー応答。待機せず即座にリトライする。
    Service,
    /// 通信エラー。poll間隔分待ってからリトライし、落ちた回線を叩き続けない。
    Transport,
    /// レスポンスの解釈失敗。一時的とみなし短い待機でリトライする。
    Decode,
    /// 想定外のエラー。詳細をlogへ出し、短い待機でリトライする。
    Unknown,
}

/// エラーを復帰方法別に分類する。
///
/// contextで包まれていてもchainを辿って`TogglError`を探す。
pub fn classify(err: &anyhow::Error) -> FetchFailure {
    for cause in err.chain() {
        if let Some(toggl_err) = cause.downcast_ref::<TogglError>() {
            return match toggl_err {
                TogglError::Service { .. } => FetchFailure::Service,
                TogglError::Transport(_) => FetchFailure::Transport,
                TogglError::Decode(_) => FetchFailure::Decode,
            };
        }
    }

    FetchFailure::Unknown
}

/// 停止シグナルを監視しながら待機する。停止が要求された場合は真を返す。
pub async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        result = stop.changed() => result.is_ok(),
    }
}

/// 現在のentryからheartbeatを送信する。entryが無いtickでは何も送らない。
///
/// project対応表は同じtickで取得したものだけを使う。対応表に無いprojectは
/// 落とさずにfallbackのラベルへ置き換える。
async fn send_heartbeat<A, W>(
    aw: &A,
    bucket: &str,
    entry: Option<TimeEntry>,
    projects: &ProjectMap,
    poll_time: f64,
    status: &mut StatusLine<W>,
) -> Result<()>
where
    A: AwRepository,
    W: Write,
{
    let Some(entry) = entry else {
        status.update("No current entries.");
        return Ok(());
    };

    let data = EventData {
        project: entry
            .project_id
            .and_then(|project_id| projects.get(&project_id))
            .cloned()
            .unwrap_or_else(|| "No project".to_string()),
        title: if entry.description.is_empty() {
            "No Name".to_string()
        } else {
            entry.description.clone()
        },
        tags: format!("{:?}", entry.tags),
        uid: entry.id,
    };
    status.update(&format!("Active Entry: {}", data.title));

    let event = Event {
        id: None,
        timestamp: datetime::now(),
        duration: None,
        data,
    };
    aw.heartbeat(bucket, &event, poll_time + PULSETIME_MARGIN)
        .await
        .context("Failed to send heartbeat")?;

    Ok(())
}

/// 定常状態のpollingループ。
///
/// 停止シグナル以外でこのループが終わることはない。fetchの失敗は分類して
/// 復帰し、heartbeatの失敗はlogに残してループを続ける。
pub async fn run<T, A, W>(
    toggl: &T,
    aw: &A,
    bucket: &str,
    poll_time: f64,
    status: &mut StatusLine<W>,
    stop: &mut watch::Receiver<bool>,
) -> Result<()>
where
    T: TogglRepository,
    A: AwRepository,
    W: Write,
{
    let poll_interval = Duration::from_secs_f64(poll_time);

    loop {
        if *stop.borrow() {
            return Ok(());
        }

        let fetched: Result<(Option<TimeEntry>, ProjectMap)> = async {
            let entry = toggl.read_current_entry().await?;
            let projects = toggl.read_projects().await?;
            Ok((entry, projects))
        }
        .await;

        let (entry, projects) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                match classify(&err) {
                    FetchFailure::Service => {
                        status.update("Problem with toggl api. Try again");
                    }
                    FetchFailure::Transport => {
                        error!(
                            "Connection error while trying to get current entry, \
                             check your internet connection."
                        );
                        if sleep_or_stop(poll_interval, stop).await {
                            return Ok(());
                        }
                    }
                    FetchFailure::Decode => {
                        error!("Error trying to decode toggl response");
                        if sleep_or_stop(SHORT_RETRY_DELAY, stop).await {
                            return Ok(());
                        }
                    }
                    FetchFailure::Unknown => {
                        error!("Unknown error: {:?}", err);
                        if sleep_or_stop(SHORT_RETRY_DELAY, stop).await {
                            return Ok(());
                        }
                    }
                }
                continue;
            }
        };

        if let Err(err) = send_heartbeat(aw, bucket, entry, &projects, poll_time, status).await {
            // heartbeatの失敗でループを止めない。
            error!("Failed to record heartbeat: {:?}", err);
        }

        if sleep_or_stop(poll_interval, stop).await {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use rstest::rstest;
    use tokio::sync::watch;

    use super::{classify, run, send_heartbeat, FetchFailure};
    use crate::aw_client::MockAwRepository;
    use crate::datetime::mock_datetime;
    use crate::status::StatusLine;
    use crate::time_entry::TimeEntry;
    use crate::toggl::{MockTogglRepository, ProjectMap, TogglError};

    fn running_entry(description: &str, project_id: Option<i64>) -> TimeEntry {
        TimeEntry {
            id: 42,
            description: description.to_string(),
            project_id,
            start: Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap(),
            tags: vec!["rust".to_string()],
            duration: -1,
        }
    }

    fn projects() -> ProjectMap {
        let mut projects = ProjectMap::new();
        projects.insert(7, "Work".to_string());
        projects
    }

    /// エラーの分類を確認する。contextで包んだ場合も分類できること。
    #[rstest]
    #[case::service(
        TogglError::Service { status: reqwest::StatusCode::FORBIDDEN, body: "".to_string() },
        FetchFailure::Service
    )]
    #[case::transport(TogglError::Transport("no route".to_string()), FetchFailure::Transport)]
    #[case::decode(TogglError::Decode("bad json".to_string()), FetchFailure::Decode)]
    fn test_classify(#[case] err: TogglError, #[case] expected: FetchFailure) {
        let plain = anyhow::Error::from(err.clone());
        assert_eq!(classify(&plain), expected);

        let wrapped = anyhow::Error::from(err).context("Failed to fetch current entry");
        assert_eq!(classify(&wrapped), expected);
    }

    /// 分類できないエラーは`Unknown`になることを確認する。
    #[test]
    fn test_classify_unknown_error() {
        let err = anyhow::anyhow!("something else happened");

        assert_eq!(classify(&err), FetchFailure::Unknown);
    }

    /// 実行中のentryがある場合、pulsetime付きでheartbeatが送られることを確認する。
    #[tokio::test]
    async fn test_send_heartbeat_active_entry() {
        let now = DateTime::parse_from_rfc3339("2024-01-02T10:00:00+00:00")
            .unwrap()
            .to_utc();
        mock_datetime::set_mock_time(now);

        let mut aw = MockAwRepository::new();
        aw.expect_heartbeat()
            .withf(move |bucket, event, pulsetime| {
                bucket == "mybucket"
                    && event.timestamp == now
                    && event.duration.is_none()
                    && event.data.project == "Work"
                    && event.data.title == "Coding"
                    && event.data.uid == 42
                    && *pulsetime == 305.0
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut writer = Vec::new();
        let mut status = StatusLine::new(&mut writer);
        send_heartbeat(
            &aw,
            "mybucket",
            Some(running_entry("Coding", Some(7))),
            &projects(),
            300.0,
            &mut status,
        )
        .await
        .unwrap();

        mock_datetime::clear_mock_time();
        assert!(String::from_utf8(writer)
            .unwrap()
            .contains("Active Entry: Coding"));
    }

    /// descriptionとprojectが無い場合のfallbackラベルを確認する。
    #[tokio::test]
    async fn test_send_heartbeat_fallback_labels() {
        let mut aw = MockAwRepository::new();
        aw.expect_heartbeat()
            .withf(|_, event, _| {
                event.data.project == "No project" && event.data.title == "No Name"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut writer = Vec::new();
        let mut status = StatusLine::new(&mut writer);
        send_heartbeat(
            &aw,
            "mybucket",
            Some(running_entry("", None)),
            &projects(),
            300.0,
            &mut status,
        )
        .await
        .unwrap();
    }

    /// 対応表に無いprojectを参照するentryもfallbackラベルになることを確認する。
    #[tokio::test]
    async fn test_send_heartbeat_stale_project_reference() {
        let mut aw = MockAwRepository::new();
        aw.expect_heartbeat()
            .withf(|_, event, _| event.data.project == "No project")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut writer = Vec::new();
        let mut status = StatusLine::new(&mut writer);
        send_heartbeat(
            &aw,
            "mybucket",
            Some(running_entry("Coding", Some(99))),
            &projects(),
            300.0,
            &mut status,
        )
        .await
        .unwrap();
    }

    /// entryが無いtickではheartbeatを送らないことを確認する。
    #[tokio::test]
    async fn test_send_heartbeat_idle_tick() {
        let mut aw = MockAwRepository::new();
        aw.expect_heartbeat().times(0);

        let mut writer = Vec::new();
        let mut status = StatusLine::new(&mut writer);
        send_heartbeat(&aw, "mybucket", None, &projects(), 300.0, &mut status)
            .await
            .unwrap();

        assert!(String::from_utf8(writer)
            .unwrap()
            .contains("No current entries."));
    }

    /// 停止シグナルが立っている場合、fetchせずに終了することを確認する。
    #[tokio::test]
    async fn test_run_stops_before_fetch() {
        let toggl = MockTogglRepository::new();
        let aw = MockAwRepository::new();
        let (stop_tx, mut stop_rx) = watch::channel(true);

        let mut writer = Vec::new();
        let mut status = StatusLine::new(&mut writer);
        run(&toggl, &aw, "mybucket", 300.0, &mut status, &mut stop_rx)
            .await
            .unwrap();

        drop(stop_tx);
    }

    /// 通信エラーでループが落ちず、poll間隔分待ってからリトライすることを確認する。
    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_from_transport_error() {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let mut toggl = MockTogglRepository::new();
        let mut calls = 0;
        toggl.expect_read_current_entry().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Err(TogglError::Transport("connection refused".to_string()))
            } else {
                // 2度目のtickまで到達したら停止を要求する。
                let _ = stop_tx.send(true);
                Ok(None)
            }
        });
        toggl
            .expect_read_projects()
            .times(1)
            .returning(|| Ok(ProjectMap::new()));

        let aw = MockAwRepository::new();
        let mut writer = Vec::new();
        let mut status = StatusLine::new(&mut writer);

        let started_at = tokio::time::Instant::now();
        run(&toggl, &aw, "mybucket", 300.0, &mut status, &mut stop_rx)
            .await
            .unwrap();

        // 通信エラー後のpoll間隔分の待機が1回入っている。
        assert!(started_at.elapsed() >= Duration::from_secs(300));
    }

    /// デコード失敗では短い待機でリトライすることを確認する。
    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_from_decode_error() {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let mut toggl = MockTogglRepository::new();
        let mut calls = 0;
        toggl.expect_read_current_entry().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Err(TogglError::Decode("bad json".to_string()))
            } else {
                let _ = stop_tx.send(true);
                Ok(None)
            }
        });
        toggl
            .expect_read_projects()
            .times(1)
            .returning(|| Ok(ProjectMap::new()));

        let aw = MockAwRepository::new();
        let mut writer = Vec::new();
        let mut status = StatusLine::new(&mut writer);

        let started_at = tokio::time::Instant::now();
        run(&toggl, &aw, "mybucket", 300.0, &mut status, &mut stop_rx)
            .await
            .unwrap();

        // リトライ前の待機は短く、poll間隔分は待たない。
        assert!(started_at.elapsed() >= Duration::from_millis(100));
        assert!(started_at.elapsed() < Duration::from_secs(300));
    }

    /// ステータス行の書き込み失敗がループを止めないことを確認する。
    ///
    /// stdoutが死んだパイプになった場合でも、APIエラーの報告と次のtickの
    /// 処理は続くこと。
    #[tokio::test]
    async fn test_run_survives_status_write_failure() {
        struct BrokenWriter;

        impl std::io::Write for BrokenWriter {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "broken pipe",
                ))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "broken pipe",
                ))
            }
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);

        let mut toggl = MockTogglRepository::new();
        let mut calls = 0;
        toggl.expect_read_current_entry().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                // APIエラーの報告はステータス行へ書くが、書けなくても続行する。
                Err(TogglError::Service {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: "".to_string(),
                })
            } else {
                let _ = stop_tx.send(true);
                Ok(None)
            }
        });
        toggl
            .expect_read_projects()
            .times(1)
            .returning(|| Ok(ProjectMap::new()));

        let aw = MockAwRepository::new();
        let mut status = StatusLine::new(BrokenWriter);
        run(&toggl, &aw, "mybucket", 300.0, &mut status, &mut stop_rx)
            .await
            .unwrap();
    }

    /// heartbeatの失敗がループを止めないことを確認する。
    #[tokio::test(start_paused = true)]
    async fn test_run_survives_heartbeat_failure() {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let mut toggl = MockTogglRepository::new();
        let mut calls = 0;
        toggl.expect_read_current_entry().times(2).returning(move || {
            calls += 1;
            if calls == 2 {
                let _ = stop_tx.send(true);
            }
            Ok(Some(running_entry("Coding", Some(7))))
        });
        toggl
            .expect_read_projects()
            .times(2)
            .returning(|| Ok(projects()));

        let mut aw = MockAwRepository::new();
        aw.expect_heartbeat()
            .times(2)
            .returning(|_, _, _| Err(anyhow::anyhow!("aw-server is down")));

        let mut writer = Vec::new();
        let mut status = StatusLine::new(&mut writer);
        run(&toggl, &aw, "mybucket", 300.0, &mut status, &mut stop_rx)
            .await
            .unwrap();
    }
}
