use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use shared::{
    domain::AuthUser,
    error::{ApiException, ErrorCode},
    protocol::{ChangeFilter, RowPredicate},
};
use tokio::sync::RwLock;
use url::Url;

use super::{BackendClient, FeedConnection, RealtimeSocket, RealtimeSocketOptions};

#[derive(Debug, Clone)]
pub struct RestBackendOptions {
    pub base_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    /// Defaults to `{base_url}/realtime/v1` on the websocket scheme.
    pub realtime_url: Option<String>,
}

/// PostgREST-style hosted backend reached over HTTP, with change feeds over websockets.
pub struct RestBackend {
    http: Client,
    base_url: Url,
    api_key: String,
    access_token: RwLock<Option<String>>,
    realtime: RealtimeSocket,
}

#[derive(Debug, Default, Deserialize)]
struct RestErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
}

impl RestBackend {
    pub fn new(options: RestBackendOptions) -> Result<Self> {
        let base_url = normalize_base_url(&options.base_url)?;
        let realtime_url = match options.realtime_url {
            Some(url) => url,
            None => default_realtime_url(&base_url)?,
        };
        Ok(Self {
            http: Client::new(),
            realtime: RealtimeSocket::new(RealtimeSocketOptions::new(
                realtime_url,
                options.api_key.clone(),
            )),
            base_url,
            api_key: options.api_key,
            access_token: RwLock::new(options.access_token),
        })
    }

    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid backend path: {path}"))
    }

    fn table_url(&self, table: &str) -> Result<Url> {
        self.endpoint(&format!("rest/v1/{table}"))
    }

    async fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self.access_token.read().await.clone();
        let bearer = token.unwrap_or_else(|| self.api_key.clone());
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }
}

#[async_trait]
impl BackendClient for RestBackend {
    async fn subscribe(&self, topic: &str, filter: &ChangeFilter) -> Result<FeedConnection> {
        let token = self.access_token.read().await.clone();
        self.realtime.subscribe(topic, filter, token.as_deref()).await
    }

    async fn select(&self, table: &str, predicates: &[RowPredicate]) -> Result<Vec<Value>> {
        let mut query = predicate_query(predicates);
        query.push(("select".to_string(), "*".to_string()));
        let request = self.http.get(self.table_url(table)?).query(&query);
        let response = self.authorize(request).await.send().await?;
        match into_json(response).await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(anyhow!("expected row array from {table}, got {other}")),
        }
    }

    async fn insert(&self, table: &str, payload: Value) -> Result<Value> {
        let request = self
            .http
            .post(self.table_url(table)?)
            .header("Prefer", "return=representation")
            .json(&payload);
        let response = self.authorize(request).await.send().await?;
        Ok(first_row(into_json(response).await?))
    }

    async fn upsert(&self, table: &str, payload: Value, on_conflict: &str) -> Result<Value> {
        let request = self
            .http
            .post(self.table_url(table)?)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&payload);
        let response = self.authorize(request).await.send().await?;
        Ok(first_row(into_json(response).await?))
    }

    async fn update(
        &self,
        table: &str,
        predicates: &[RowPredicate],
        payload: Value,
    ) -> Result<Value> {
        let request = self
            .http
            .patch(self.table_url(table)?)
            .query(&predicate_query(predicates))
            .header("Prefer", "return=representation")
            .json(&payload);
        let response = self.authorize(request).await.send().await?;
        Ok(first_row(into_json(response).await?))
    }

    async fn delete(&self, table: &str, predicates: &[RowPredicate]) -> Result<()> {
        if predicates.is_empty() {
            return Err(anyhow!("refusing unfiltered delete on {table}"));
        }
        let request = self
            .http
            .delete(self.table_url(table)?)
            .query(&predicate_query(predicates));
        let response = self.authorize(request).await.send().await?;
        into_json(response).await?;
        Ok(())
    }

    async fn call_rpc(&self, name: &str, args: Value) -> Result<Value> {
        let request = self
            .http
            .post(self.endpoint(&format!("rest/v1/rpc/{name}"))?)
            .json(&args);
        let response = self.authorize(request).await.send().await?;
        into_json(response).await
    }

    async fn current_user(&self) -> Result<Option<AuthUser>> {
        if self.access_token.read().await.is_none() {
            return Ok(None);
        }
        let request = self.http.get(self.endpoint("auth/v1/user")?);
        let response = self.authorize(request).await.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let body = into_json(response).await?;
        let user = serde_json::from_value(body).context("invalid auth user payload")?;
        Ok(Some(user))
    }
}

fn predicate_query(predicates: &[RowPredicate]) -> Vec<(String, String)> {
    predicates.iter().map(RowPredicate::query_pair).collect()
}

fn first_row(value: Value) -> Value {
    match value {
        Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        Value::Array(_) => Value::Null,
        other => other,
    }
}

async fn into_json(response: Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        let parsed = serde_json::from_str::<RestErrorBody>(&body).unwrap_or_default();
        let message = parsed
            .message
            .or(parsed.msg)
            .or(parsed.error_description)
            .unwrap_or_else(|| format!("{status}: {}", body.trim()));
        return Err(ApiException::new(ErrorCode::from_status(status.as_u16()), message).into());
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).context("backend returned invalid json")
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(anyhow!("backend url must start with http:// or https://"));
    }
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).with_context(|| format!("invalid backend url: {raw}"))
}

fn default_realtime_url(base_url: &Url) -> Result<String> {
    let base = base_url.as_str().trim_end_matches('/');
    let ws_base = if base.starts_with("https://") {
        base.replacen("https://", "wss://", 1)
    } else if base.starts_with("http://") {
        base.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("backend url must start with http:// or https://"));
    };
    Ok(format!("{ws_base}/realtime/v1"))
}

#[cfg(test)]
#[path = "../tests/rest_tests.rs"]
mod tests;
