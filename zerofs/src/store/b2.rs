//! Backblaze B2 native-API client.
//!
//! Speaks the v2 JSON API over blocking HTTP. Credentials come from the
//! process environment (`B2_APPLICATION_KEY_ID` / `B2_APPLICATION_KEY`);
//! the session token is refreshed once on a 401 and calls are otherwise
//! single-shot, retries being the task queue's business.

use super::{Bucket, ObjectKind, ObjectStore, RemoteObject, Result, StoreError};
use base64::Engine as _;
use parking_lot::Mutex;
use reqwest::{blocking::Client, header::AUTHORIZATION, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::env;

const API_BASE: &str = "https://api.backblazeb2.com";

pub struct B2 {
    client: Client,
    key_id: String,
    key: String,
    auth: Mutex<Option<Auth>>,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Auth {
    account_id: String,
    api_url: String,
    download_url: String,
    authorization_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBucketsResponse {
    buckets: Vec<BucketEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketEntry {
    bucket_id: String,
    bucket_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFilesResponse {
    files: Vec<FileEntry>,
}

/// A row of `b2_list_file_names`, or the echo of an upload. Folder rows
/// carry null ids and timestamps.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileEntry {
    file_id: Option<String>,
    file_name: String,
    content_length: Option<u64>,
    upload_timestamp: Option<u64>,
    action: Option<String>,
}

impl FileEntry {
    fn into_remote(self) -> RemoteObject {
        RemoteObject {
            id: self.file_id.unwrap_or_default(),
            name: self.file_name,
            size: self.content_length.unwrap_or_default(),
            // milliseconds on the wire
            uploaded_at: self.upload_timestamp.unwrap_or_default() as f64 * 1e-3,
            kind: match self.action.as_deref() {
                Some("folder") => ObjectKind::Folder,
                _ => ObjectKind::File,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    upload_url: String,
    authorization_token: String,
}

/// B2 wants file names URL-encoded, with `/` kept verbatim.
fn encode_name(name: &str) -> String {
    name.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn check(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    Err(StoreError::Protocol {
        reason: format!("{status}: {body}"),
    })
}

impl B2 {
    /// Authorize against the account named in the environment. Fails
    /// fast on missing or rejected credentials.
    pub fn from_env() -> Result<Self> {
        let key_id =
            env::var("B2_APPLICATION_KEY_ID").map_err(|_| StoreError::MissingCredentials)?;
        let key = env::var("B2_APPLICATION_KEY").map_err(|_| StoreError::MissingCredentials)?;
        Self::with_credentials(key_id, key)
    }

    pub fn with_credentials(key_id: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let b2 = Self {
            // uploads of large bodies can outlive any sane default timeout
            client: Client::builder().timeout(None).build()?,
            key_id: key_id.into(),
            key: key.into(),
            auth: Mutex::new(None),
        };
        b2.authorize()?;
        Ok(b2)
    }

    fn authorize(&self) -> Result<Auth> {
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.key_id, self.key));
        let resp = self
            .client
            .get(format!("{API_BASE}/b2api/v2/b2_authorize_account"))
            .header(AUTHORIZATION, format!("Basic {basic}"))
            .send()?;
        let auth: Auth = check(resp)?.json()?;
        log::debug!("authorized account {}", auth.account_id);
        *self.auth.lock() = Some(auth.clone());
        Ok(auth)
    }

    fn auth_state(&self) -> Result<Auth> {
        if let Some(auth) = self.auth.lock().clone() {
            return Ok(auth);
        }
        self.authorize()
    }

    /// POST a JSON API function, re-authorizing once on an expired token.
    fn api_call<T: DeserializeOwned>(&self, function: &str, body: serde_json::Value) -> Result<T> {
        let mut auth = self.auth_state()?;
        let post = |auth: &Auth| {
            self.client
                .post(format!("{}/b2api/v2/{function}", auth.api_url))
                .header(AUTHORIZATION, auth.authorization_token.as_str())
                .json(&body)
                .send()
        };
        let mut resp = post(&auth)?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            auth = self.authorize()?;
            resp = post(&auth)?;
        }
        Ok(check(resp)?.json()?)
    }
}

impl ObjectStore for B2 {
    fn list_buckets(&self) -> Result<Vec<Bucket>> {
        let auth = self.auth_state()?;
        let resp: ListBucketsResponse = self.api_call(
            "b2_list_buckets",
            serde_json::json!({ "accountId": auth.account_id }),
        )?;
        Ok(resp
            .buckets
            .into_iter()
            .map(|b| Bucket {
                id: b.bucket_id,
                name: b.bucket_name,
            })
            .collect())
    }

    fn list_files(
        &self,
        bucket_id: &str,
        start_file_name: Option<&str>,
        prefix: Option<&str>,
        limit: usize,
        list_directory: bool,
    ) -> Result<Vec<RemoteObject>> {
        let mut body = serde_json::json!({
            "bucketId": bucket_id,
            "maxFileCount": limit,
        });
        if let Some(start) = start_file_name {
            body["startFileName"] = start.into();
        }
        if let Some(prefix) = prefix {
            body["prefix"] = prefix.into();
        }
        if list_directory {
            body["delimiter"] = "/".into();
        }
        let resp: ListFilesResponse = self.api_call("b2_list_file_names", body)?;
        Ok(resp.files.into_iter().map(FileEntry::into_remote).collect())
    }

    fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let mut auth = self.auth_state()?;
        let get = |auth: &Auth| {
            self.client
                .get(format!(
                    "{}/b2api/v2/b2_download_file_by_id?fileId={}",
                    auth.download_url,
                    urlencoding::encode(file_id)
                ))
                .header(AUTHORIZATION, auth.authorization_token.as_str())
                .send()
        };
        let mut resp = get(&auth)?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            auth = self.authorize()?;
            resp = get(&auth)?;
        }
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NoObject {
                id: file_id.to_string(),
            });
        }
        Ok(check(resp)?.bytes()?.to_vec())
    }

    fn upload(&self, bucket_id: &str, name: &str, data: &[u8]) -> Result<RemoteObject> {
        let target: UploadTarget =
            self.api_call("b2_get_upload_url", serde_json::json!({ "bucketId": bucket_id }))?;
        let sha1 = hex::encode(ring::digest::digest(
            &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            data,
        ));
        let resp = self
            .client
            .post(target.upload_url)
            .header(AUTHORIZATION, target.authorization_token)
            .header("X-Bz-File-Name", encode_name(name))
            .header("X-Bz-Content-Sha1", sha1)
            .header(reqwest::header::CONTENT_TYPE, "b2/x-auto")
            .body(data.to_vec())
            .send()?;
        let entry: FileEntry = check(resp)?.json()?;
        Ok(entry.into_remote())
    }

    fn delete(&self, file_id: &str, name: &str) -> Result<()> {
        let _: serde_json::Value = self.api_call(
            "b2_delete_file_version",
            serde_json::json!({ "fileId": file_id, "fileName": name }),
        )?;
        Ok(())
    }
}
