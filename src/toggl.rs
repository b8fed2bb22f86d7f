use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use log::debug;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::time_entry::TimeEntry;

/// project idからproject名への対応表。poll毎に再取得し、キャッシュしない。
pub type ProjectMap = HashMap<i64, String>;

/// リクエスト全体のタイムアウト。1回のリクエストがこれ以上処理を止めないようにする。
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Toggl APIとの通信で発生するエラー。
///
/// watcherのループは種別ごとに復帰方法を変えるため、原因別に分類して返す。
#[derive(Clone, Debug, PartialEq, Error)]
pub enum TogglError {
    /// APIがエラーステータスを返した。bodyは診断用にそのまま保持する。
    #[error("toggl api returned {status}: {body}")]
    Service { status: StatusCode, body: String },
    /// 接続やタイムアウトなどの通信エラー。
    #[error("failed to reach toggl api: {0}")]
    Transport(String),
    /// レスポンスをデシリアライズできなかった。
    #[error("failed to decode toggl api response: {0}")]
    Decode(String),
}

/// Toggl APIのプロジェクト情報をデシリアライズするための構造体。
#[derive(Debug, Deserialize)]
struct TogglProject {
    id: i64,
    name: String,
}

/// Toggl APIからtime entryを読み出すためのtrait。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TogglRepository {
    /// 指定された日付範囲(両端を含む)のtime entryを取得する。
    async fn read_time_entries(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<TimeEntry>, TogglError>;

    /// 現在実行中のtime entryを取得する。タイマーが動いていない場合は`None`を返す。
    async fn read_current_entry(&self) -> Result<Option<TimeEntry>, TogglError>;

    /// 全プロジェクトのid/name対応表を取得する。
    async fn read_projects(&self) -> Result<ProjectMap, TogglError>;
}

/// Toggl APIと通信するためのクライアント。
pub struct TogglClient {
    client: Client,
    api_url: String,
    api_token: String,
}

impl TogglClient {
    /// 新しい`TogglClient`を返す。
    pub fn new(api_token: &str) -> Result<Self> {
        Self::with_api_url("https://api.track.toggl.com/api/v9", api_token)
    }

    /// API URLを指定して`TogglClient`を返す。テストでmockサーバーに向ける時に利用する。
    pub fn with_api_url(api_url: &str, api_token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build http client")?;

        Ok(Self {
            client,
            api_url: api_url.to_string(),
            api_token: api_token.to_string(),
        })
    }

    fn request(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.api_url, path))
            .basic_auth(&self.api_token, Some("api_token"))
            .header(CONTENT_TYPE, "application/json")
    }

    async fn execute<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, TogglError> {
        let response = request
            .send()
            .await
            .map_err(|err| TogglError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TogglError::Service { status, body });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| TogglError::Decode(err.to_string()))
    }
}

#[async_trait]
impl TogglRepository for TogglClient {
    async fn read_time_entries(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<TimeEntry>, TogglError> {
        let request = self.request("/me/time_entries").query(&[
            ("start_date", start_date.format("%Y-%m-%d").to_string()),
            ("end_date", end_date.format("%Y-%m-%d").to_string()),
        ]);
        let entries: Vec<TimeEntry> = Self::execute(request).await?;
        debug!("Fetched {} time entries", entries.len());

        Ok(entries)
    }

    async fn read_current_entry(&self) -> Result<Option<TimeEntry>, TogglError> {
        // タイマーが動いていない場合、APIはbody `null`を返す。
        Self::execute(self.request("/me/time_entries/current")).await
    }

    async fn read_projects(&self) -> Result<ProjectMap, TogglError> {
        let projects: Vec<TogglProject> = Self::execute(self.request("/me/projects")).await?;

        Ok(projects
            .into_iter()
            .map(|project| (project.id, project.name))
            .collect())
    }
}
