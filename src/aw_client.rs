use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::CONTENT_TYPE, Client};
use serde::{Deserialize, Serialize};

/// リクエスト全体のタイムアウト。aw-serverが応答しない場合でも処理を止めない。
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// aw-serverに保存するeventのデータ部。
///
/// `uid`はToggl側のentry idで、再同期時に既存eventを探すためのキーになる。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub project: String,
    pub title: String,
    pub tags: String,
    pub uid: i64,
}

/// aw-serverに保存するevent。
///
/// `id`はaw-serverが採番するため、新規作成時は`None`のまま送信する。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub data: EventData,
}

/// bucket一覧のレスポンスをデシリアライズするための構造体。
#[derive(Debug, Deserialize)]
pub struct BucketInfo {
    pub id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
}

/// bucket作成リクエストのbody。
#[derive(Serialize)]
struct CreateBucketRequest<'a> {
    client: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    hostname: &'a str,
}

/// aw-serverのevent storeを操作するためのtrait。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AwRepository {
    /// bucket一覧を取得する。
    async fn get_buckets(&self) -> Result<HashMap<String, BucketInfo>>;

    /// 指定されたevent typeのbucketを作成する。
    async fn create_bucket(&self, bucket: &str, event_type: &str) -> Result<()>;

    /// bucket内の全eventを取得する。
    async fn get_events(&self, bucket: &str) -> Result<Vec<Event>>;

    /// eventを挿入する。
    async fn insert_event(&self, bucket: &str, event: &Event) -> Result<()>;

    /// aw-serverが採番したidを指定してeventを削除する。
    async fn delete_event(&self, bucket: &str, event_id: i64) -> Result<()>;

    /// heartbeatを送信する。
    ///
    /// 直前のeventとデータが一致し、かつpulsetime(秒)以内であれば、
    /// aw-server側で1つのeventにマージされる。
    async fn heartbeat(&self, bucket: &str, event: &Event, pulsetime: f64) -> Result<()>;
}

/// aw-serverと通信するためのクライアント。
pub struct AwClient {
    client: Client,
    api_url: String,
    client_name: String,
    hostname: String,
}

impl AwClient {
    /// 新しい`AwClient`を返す。
    ///
    /// `testing`が真の場合はテスト用aw-serverのポートに接続する。
    pub fn new(client_name: &str, testing: bool) -> Result<Self> {
        let port = if testing { 5666 } else { 5600 };
        Self::with_api_url(&format!("http://localhost:{}/api/0", port), client_name)
    }

    /// API URLを指定して`AwClient`を返す。テストでmockサーバーに向ける時に利用する。
    pub fn with_api_url(api_url: &str, client_name: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build http client")?;
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();

        Ok(Self {
            client,
            api_url: api_url.to_string(),
            client_name: client_name.to_string(),
            hostname,
        })
    }

    /// このwatcherが利用するbucket名を返す。
    pub fn bucket_name(&self) -> String {
        format!("{}_{}", self.client_name, self.hostname)
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!("{}/buckets/{}", self.api_url, bucket)
    }
}

#[async_trait]
impl AwRepository for AwClient {
    async fn get_buckets(&self) -> Result<HashMap<String, BucketInfo>> {
        let buckets = self
            .client
            .get(format!("{}/buckets/", self.api_url))
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .with_context(|| format!("Failed to send request to aw-server at {}", self.api_url))?
            .error_for_status()
            .context("Request returned an error status")?
            .json::<HashMap<String, BucketInfo>>()
            .await
            .context("Failed to deserialize bucket list")?;

        Ok(buckets)
    }

    async fn create_bucket(&self, bucket: &str, event_type: &str) -> Result<()> {
        self.client
            .post(self.bucket_url(bucket))
            .json(&CreateBucketRequest {
                client: &self.client_name,
                event_type,
                hostname: &self.hostname,
            })
            .send()
            .await
            .with_context(|| format!("Failed to send request to aw-server at {}", self.api_url))?
            .error_for_status()
            .with_context(|| format!("Failed to create bucket {}", bucket))?;

        Ok(())
    }

    async fn get_events(&self, bucket: &str) -> Result<Vec<Event>> {
        let events = self
            .client
            .get(format!("{}/events", self.bucket_url(bucket)))
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .with_context(|| format!("Failed to send request to aw-server at {}", self.api_url))?
            .error_for_status()
            .context("Request returned an error status")?
            .json::<Vec<Event>>()
            .await
            .context("Failed to deserialize events")?;

        Ok(events)
    }

    async fn insert_event(&self, bucket: &str, event: &Event) -> Result<()> {
        self.client
            .post(format!("{}/events", self.bucket_url(bucket)))
            .json(event)
            .send()
            .await
            .with_context(|| format!("Failed to send request to aw-server at {}", self.api_url))?
            .error_for_status()
            .with_context(|| format!("Failed to insert event into {}", bucket))?;

        Ok(())
    }

    async fn delete_event(&self, bucket: &str, event_id: i64) -> Result<()> {
        self.client
            .delete(format!("{}/events/{}", self.bucket_url(bucket), event_id))
            .send()
            .await
            .with_context(|| format!("Failed to send request to aw-server at {}", self.api_url))?
            .error_for_status()
            .with_context(|| format!("Failed to delete event {} from {}", event_id, bucket))?;

        Ok(())
    }

    async fn heartbeat(&self, bucket: &str, event: &Event, pulsetime: f64) -> Result<()> {
        self.client
            .post(format!("{}/heartbeat", self.bucket_url(bucket)))
            .query(&[("pulsetime", pulsetime.to_string())])
            .json(event)
            .send()
            .await
            .with_context(|| format!("Failed to send request to aw-server at {}", self.api_url))?
            .error_for_status()
            .with_context(|| format!("Failed to send heartbeat to {}", bucket))?;

        Ok(())
    }
}

/// bucketが存在しない場合に作成する。既に存在する場合は何もしない。
pub async fn ensure_bucket<A: AwRepository>(aw: &A, bucket: &str, event_type: &str) -> Result<()> {
    let buckets = aw.get_buckets().await.context("Failed to list buckets")?;
    if !buckets.contains_key(bucket) {
        aw.create_bucket(bucket, event_type)
            .await
            .with_context(|| format!("Failed to create bucket {}", bucket))?;
    }

    Ok(())
}
