use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use chrono::{Datelike, Months, NaiveDate};
use log::error;
use tokio::sync::watch;

use crate::aw_client::AwRepository;
use crate::datetime;
use crate::reconcile::sync_entries;
use crate::status::StatusLine;
use crate::toggl::TogglRepository;
use crate::watcher::{classify, sleep_or_stop, FetchFailure};

/// 一時的なエラーから復帰する時の短い待機時間。
const SHORT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 指定された日付が属する月の1日を返す。
pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// 同期対象となる月ごとの日付範囲を返す。
///
/// `since`の属する月の1日から歩き、今月に到達したところで終了する(今月は
/// 含まない)。月の進め方は暦に従い、月の長さの違いや年またぎで日付が
/// ずれることはない。
pub fn month_ranges(since: NaiveDate, today: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let current_month = first_of_month(today);
    let mut ranges = Vec::new();

    let mut cursor = first_of_month(since);
    while cursor < current_month {
        let next = cursor
            .checked_add_months(Months::new(1))
            .unwrap_or(current_month);
        let last_day = next.pred_opt().unwrap_or(cursor);
        ranges.push((cursor, last_day));
        cursor = next;
    }

    ranges
}

/// 過去の月を順に同期するbackfillを実行する。
///
/// 各月でremoteのentryとproject対応表を取得し、bucketへ同期する。entryの
/// 無い月は報告するだけで成功として扱う。失敗した月は定常ループと同じ
/// 方針で分類して復帰し、同じ月からやり直す。
#[allow(clippy::too_many_arguments)]
pub async fn run<T, A, W>(
    toggl: &T,
    aw: &A,
    bucket: &str,
    since: NaiveDate,
    update_existing: bool,
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
    status.update(&format!(
        "Backfilling toggl data since {}...",
        first_of_month(since)
    ));

    let ranges = month_ranges(since, datetime::today());
    let mut index = 0;
    while index < ranges.len() {
        if *stop.borrow() {
            return Ok(());
        }

        let (first_day, last_day) = ranges[index];
        status.update(&format!(
            "Backfilling toggl data for {}...",
            first_day.format("%B %Y")
        ));

        match sync_month(toggl, aw, bucket, first_day, last_day, update_existing, status).await {
            Ok(()) => index += 1,
            Err(err) => match classify(&err) {
                FetchFailure::Service => {
                    status.update("Problem with toggl api. Try again");
                }
                FetchFailure::Transport => {
                    error!(
                        "Connection error while backfilling, check your internet connection."
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
            },
        }
    }
    status.update("Backfilling done.");

    Ok(())
}

/// 1ヶ月分のentryを取得してbucketへ同期する。
async fn sync_month<T, A, W>(
    toggl: &T,
    aw: &A,
    bucket: &str,
    first_day: NaiveDate,
    last_day: NaiveDate,
    update_existing: bool,
    status: &mut StatusLine<W>,
) -> Result<()>
where
    T: TogglRepository,
    A: AwRepository,
    W: Write,
{
    let entries = toggl.read_time_entries(first_day, last_day).await?;
    if entries.is_empty() {
        status.update(&format!(
            "No entries found for {}",
            first_day.format("%B %Y")
        ));
    }

    let projects = toggl.read_projects().await?;
    sync_entries(aw, bucket, &entries, &projects, update_existing, status).await?;

    Ok(())
}
