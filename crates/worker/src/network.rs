use std::time::Duration;

use async_trait::async_trait;
use taskgate_core::{HttpResponse, NetworkOperations};
use taskgate_errors::{QueueError, QueueResult};
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// 基于 reqwest 的网络请求
///
/// 连接失败、超时和 5xx 响应视为可重试错误，其余响应原样返回给调用方。
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new() -> QueueResult<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> QueueResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("taskgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| QueueError::config_error(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn read_response(&self, url: &str, response: reqwest::Response) -> QueueResult<HttpResponse> {
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(url, e))?
            .to_vec();

        let response = HttpResponse { status, body };
        if status >= 500 {
            warn!("HTTP请求 {} 返回服务端错误 {}", url, status);
            return Err(QueueError::operation(format!("HTTP {url} 返回状态码 {status}")));
        }
        debug!("HTTP请求 {} 完成: 状态码 {}, {} 字节", url, status, response.body.len());
        Ok(response)
    }
}

fn request_error(url: &str, error: reqwest::Error) -> QueueError {
    if error.is_timeout() {
        QueueError::Timeout(format!("HTTP请求 {url} 超时"))
    } else if error.is_builder() {
        QueueError::NonRetryable(format!("无效的HTTP请求 {url}: {error}"))
    } else {
        QueueError::operation(format!("HTTP请求 {url} 失败: {error}"))
    }
}

#[async_trait]
impl NetworkOperations for HttpNetwork {
    async fn fetch(&self, url: &str) -> QueueResult<HttpResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;
        self.read_response(url, response).await
    }

    async fn post(&self, url: &str, body: &serde_json::Value) -> QueueResult<HttpResponse> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;
        self.read_response(url, response).await
    }
}
