use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Index Store 错误（容量满不算错误，由淘汰内部消化）
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("index store is closed")]
    Closed,
}

/// 时间短语解析失败
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("unrecognized time phrase: {0:?}")]
    Unrecognized(String),

    #[error("time phrase {phrase:?} is out of range: {reason}")]
    OutOfRange { phrase: String, reason: String },
}

impl TimeError {
    pub fn phrase(&self) -> &str {
        match self {
            TimeError::Unrecognized(p) => p,
            TimeError::OutOfRange { phrase, .. } => phrase,
        }
    }
}

/// 查询错误：除 `Unavailable` 外都是客户端错误
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid time phrase: {0:?}")]
    InvalidTime(String),

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("log store unavailable")]
    Unavailable,
}

impl QueryError {
    pub fn status(&self) -> StatusCode {
        match self {
            QueryError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<TimeError> for QueryError {
    fn from(e: TimeError) -> Self {
        QueryError::InvalidTime(e.phrase().to_string())
    }
}

impl From<StoreError> for QueryError {
    fn from(_: StoreError) -> Self {
        QueryError::Unavailable
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        (status, axum::Json(body)).into_response()
    }
}

/// 配置加载/校验错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invalid_time_is_client_error_naming_phrase() {
        let err: QueryError = TimeError::Unrecognized("next blue moon".into()).into();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("next blue moon"));
    }

    #[tokio::test]
    async fn closed_store_is_unavailable() {
        let err: QueryError = StoreError::Closed.into();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["status"], 503);
    }
}
