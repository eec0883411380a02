use crate::http::build_client;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::env;
use thiserror::Error;

pub static DRIVE_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("GOOGLE_DRIVE_API_ROOT")
        .unwrap_or_else(|_| "https://www.googleapis.com/drive/v3".to_string())
});

pub static DRIVE_UPLOAD_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("GOOGLE_DRIVE_UPLOAD_ROOT")
        .unwrap_or_else(|_| "https://www.googleapis.com/upload/drive/v3".to_string())
});

pub static GOOGLE_TOKEN_URL: Lazy<String> = Lazy::new(|| {
    env::var("GOOGLE_TOKEN_URL").unwrap_or_else(|_| "https://oauth2.googleapis.com/token".to_string())
});

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("missing google drive credentials in env")]
    MissingCredentials,
    #[error("drive request failed: {0}")]
    Request(String),
    #[error("invalid drive response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
}

/// Remote folder/file operations keyed by name, as the lifecycle sees them.
/// Folder resolution is find-before-create so a retried upload lands in the
/// existing folder.
#[async_trait]
pub trait RemoteFileStore: Send + Sync {
    /// Look up a folder by exact name without creating it.
    async fn find_folder(&self, name: &str) -> Result<Option<String>, DriveError>;

    async fn find_or_create_folder(&self, name: &str) -> Result<String, DriveError>;

    /// Grant write access to `email`. Safe to repeat for the same pair.
    async fn share_folder(&self, folder_id: &str, email: &str) -> Result<(), DriveError>;

    async fn upload_file(
        &self,
        folder_id: &str,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, DriveError>;

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, DriveError>;

    async fn delete_file(&self, file_id: &str) -> Result<(), DriveError>;
}

/// Google Drive REST client authenticated with an OAuth refresh token.
#[derive(Clone)]
pub struct GoogleDriveClient {
    http: Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct FileResource {
    id: String,
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

impl GoogleDriveClient {
    /// Credentials are read eagerly but validated lazily, so a box without
    /// Drive configured still boots; calls then fail `MissingCredentials`.
    pub fn from_env() -> Self {
        Self {
            http: build_client(),
            client_id: env::var("GOOGLE_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("GOOGLE_CLIENT_SECRET").unwrap_or_default(),
            refresh_token: env::var("GOOGLE_REFRESH_TOKEN").unwrap_or_default(),
        }
    }

    async fn access_token(&self) -> Result<String, DriveError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() || self.refresh_token.is_empty()
        {
            return Err(DriveError::MissingCredentials);
        }
        let body = [
            ("grant_type", "refresh_token"),
            ("refresh_token", self.refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(GOOGLE_TOKEN_URL.as_str())
            .form(&body)
            .send()
            .await
            .map_err(|err| DriveError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DriveError::Request(format!("HTTP {}", response.status())));
        }
        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| DriveError::Deserialize(err.to_string()))?;
        Ok(payload.access_token)
    }

    async fn query_folder(&self, name: &str, token: &str) -> Result<Option<String>, DriveError> {
        let query = format!(
            "name = '{}' and mimeType = '{FOLDER_MIME}' and trashed = false",
            escape_query_value(name)
        );
        let url = format!(
            "{}/files?q={}&fields=files(id,name)&pageSize=1",
            *DRIVE_ROOT,
            urlencoding::encode(&query)
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| DriveError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DriveError::Request(format!("HTTP {}", response.status())));
        }
        let payload: FileList = response
            .json()
            .await
            .map_err(|err| DriveError::Deserialize(err.to_string()))?;
        Ok(payload.files.into_iter().next().map(|file| file.id))
    }

    async fn create_folder(&self, name: &str, token: &str) -> Result<String, DriveError> {
        let url = format!("{}/files?fields=id", *DRIVE_ROOT);
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME }))
            .send()
            .await
            .map_err(|err| DriveError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DriveError::Request(format!("HTTP {}", response.status())));
        }
        let payload: FileResource = response
            .json()
            .await
            .map_err(|err| DriveError::Deserialize(err.to_string()))?;
        Ok(payload.id)
    }
}

#[async_trait]
impl RemoteFileStore for GoogleDriveClient {
    async fn find_folder(&self, name: &str) -> Result<Option<String>, DriveError> {
        let token = self.access_token().await?;
        self.query_folder(name, &token).await
    }

    async fn find_or_create_folder(&self, name: &str) -> Result<String, DriveError> {
        let token = self.access_token().await?;
        if let Some(existing) = self.query_folder(name, &token).await? {
            return Ok(existing);
        }
        self.create_folder(name, &token).await
    }

    async fn share_folder(&self, folder_id: &str, email: &str) -> Result<(), DriveError> {
        let token = self.access_token().await?;
        let url = format!("{}/files/{}/permissions", *DRIVE_ROOT, folder_id);
        let response = self
            .http
            .post(url)
            .bearer_auth(&token)
            .json(&json!({
                "role": "writer",
                "type": "user",
                "emailAddress": email,
            }))
            .send()
            .await
            .map_err(|err| DriveError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DriveError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn upload_file(
        &self,
        folder_id: &str,
        file_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, DriveError> {
        let token = self.access_token().await?;

        // Resumable upload: metadata first, then the bytes to the session
        // URL Google hands back in the Location header.
        let session_url = format!("{}/files?uploadType=resumable&fields=id", *DRIVE_UPLOAD_ROOT);
        let response = self
            .http
            .post(session_url)
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", content_type)
            .json(&json!({ "name": file_name, "parents": [folder_id] }))
            .send()
            .await
            .map_err(|err| DriveError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DriveError::Request(format!("HTTP {}", response.status())));
        }
        let upload_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
            .ok_or_else(|| {
                DriveError::Deserialize("missing resumable upload location".to_string())
            })?;

        let response = self
            .http
            .put(upload_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|err| DriveError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DriveError::Request(format!("HTTP {}", response.status())));
        }
        let payload: FileResource = response
            .json()
            .await
            .map_err(|err| DriveError::Deserialize(err.to_string()))?;
        Ok(payload.id)
    }

    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, DriveError> {
        let token = self.access_token().await?;
        let query = format!("'{}' in parents and trashed = false", folder_id);
        let url = format!(
            "{}/files?q={}&fields=files(id,name)&pageSize=1000",
            *DRIVE_ROOT,
            urlencoding::encode(&query)
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|err| DriveError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DriveError::Request(format!("HTTP {}", response.status())));
        }
        let payload: FileList = response
            .json()
            .await
            .map_err(|err| DriveError::Deserialize(err.to_string()))?;
        Ok(payload.files)
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), DriveError> {
        let token = self.access_token().await?;
        let url = format!("{}/files/{}", *DRIVE_ROOT, file_id);
        let response = self
            .http
            .delete(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|err| DriveError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DriveError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

/// Drive query values use single-quoted string literals; quotes and
/// backslashes inside them get a backslash escape.
fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_escaping_handles_quotes() {
        assert_eq!(escape_query_value("O'Brien"), "O\\'Brien");
        assert_eq!(escape_query_value(r"a\b"), r"a\\b");
        assert_eq!(escape_query_value("plain"), "plain");
    }
}
