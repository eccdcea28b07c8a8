//! Archives kept in an HTTP object store.
//!
//! Each archive is one JSON object at `{base}/{prefix}{id}.json`. Object stores do not
//! list cheaply over plain HTTP, so `{prefix}index.json` carries the newest-first
//! listing and is rewritten after every successful put.

use std::time::Duration;

use async_trait::async_trait;
use canvas_core::CanvasState;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::archive::{ArchiveBackend, ArchiveError, ArchiveMeta, ArchiveRecord};

const NAME: &str = "object_store";
const INDEX_OBJECT: &str = "index.json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ObjectStoreArchiveBackend {
    http: Client,
    base_url: String,
    prefix: String,
    token: Option<String>,
}

impl ObjectStoreArchiveBackend {
    pub fn new(
        base_url: impl Into<String>,
        prefix: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, ArchiveError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            prefix: prefix.into().trim_start_matches('/').to_string(),
            token,
        })
    }

    fn object_url(&self, object: &str) -> String {
        format!("{}/{}{}", self.base_url, self.prefix, object)
    }

    fn request(&self, method: Method, object: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.object_url(object));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn put_json<T: serde::Serialize>(
        &self,
        object: &str,
        body: &T,
    ) -> Result<(), ArchiveError> {
        let body = serde_json::to_vec(body).map_err(|e| ArchiveError::backend(NAME, e))?;
        let res = self
            .request(Method::PUT, object)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        expect_success(res).await.map(|_| ())
    }

    /// `Ok(None)` when the object does not exist.
    async fn get_json<T: DeserializeOwned>(&self, object: &str) -> Result<Option<T>, ArchiveError> {
        let res = self
            .request(Method::GET, object)
            .send()
            .await
            .map_err(|e| ArchiveError::backend(NAME, e))?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let res = expect_success(res).await?;
        res.json::<T>()
            .await
            .map(Some)
            .map_err(|e| ArchiveError::backend(NAME, e))
    }
}

async fn expect_success(res: Response) -> Result<Response, ArchiveError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(ArchiveError::backend(
        NAME,
        format!("unexpected status: {status} body={body}"),
    ))
}

#[async_trait]
impl ArchiveBackend for ObjectStoreArchiveBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn put(&self, meta: &ArchiveMeta, state: &CanvasState) -> Result<(), ArchiveError> {
        let record = ArchiveRecord::new(meta, state);
        self.put_json(&format!("{}.json", meta.id), &record).await?;

        let mut index: Vec<ArchiveMeta> = self.get_json(INDEX_OBJECT).await?.unwrap_or_default();
        index.retain(|m| m.id != meta.id);
        index.push(meta.clone());
        index.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.put_json(INDEX_OBJECT, &index).await
    }

    async fn get(&self, id: &str) -> Result<Option<CanvasState>, ArchiveError> {
        let record: Option<ArchiveRecord> = self.get_json(&format!("{id}.json")).await?;
        Ok(record.map(ArchiveRecord::into_state))
    }

    async fn list(&self) -> Result<Vec<ArchiveMeta>, ArchiveError> {
        let mut index: Vec<ArchiveMeta> = self.get_json(INDEX_OBJECT).await?.unwrap_or_default();
        index.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use canvas_core::Color;

    use super::*;

    #[test]
    fn object_urls_join_base_and_prefix() {
        let store =
            ObjectStoreArchiveBackend::new("http://store.local/bucket/", "/archives/", None)
                .unwrap();
        assert_eq!(
            store.object_url("canvas-1.json"),
            "http://store.local/bucket/archives/canvas-1.json"
        );
        let bare = ObjectStoreArchiveBackend::new("http://store.local", "", None).unwrap();
        assert_eq!(bare.object_url(INDEX_OBJECT), "http://store.local/index.json");
    }

    #[tokio::test]
    async fn unreachable_store_reports_backend_error() {
        let store =
            ObjectStoreArchiveBackend::new("http://127.0.0.1:9", "archives/", None).unwrap();
        let err = store
            .put(&ArchiveMeta::at(1), &CanvasState::blank(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Backend { backend: NAME, .. }));
        assert!(store.list().await.is_err());
    }

    #[tokio::test]
    #[ignore]
    async fn object_store_round_trip() {
        let url = std::env::var("OBJECT_STORE_URL").expect("set OBJECT_STORE_URL");
        let token = std::env::var("OBJECT_STORE_TOKEN").ok();
        let prefix = format!("test-{}/", uuid::Uuid::new_v4());
        let store = ObjectStoreArchiveBackend::new(url, prefix, token).unwrap();

        let mut state = CanvasState::blank(2, 2);
        state.colors[0][1] = Color::Orange;
        store.put(&ArchiveMeta::at(1), &state).await.unwrap();
        store.put(&ArchiveMeta::at(2), &state).await.unwrap();

        assert_eq!(store.get("canvas-1").await.unwrap(), Some(state));
        assert_eq!(store.get("canvas-3").await.unwrap(), None);
        assert_eq!(
            store.list().await.unwrap(),
            vec![ArchiveMeta::at(2), ArchiveMeta::at(1)]
        );
    }
}
