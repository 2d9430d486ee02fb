use std::path::{Path, PathBuf};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{} is missing and no download URL is configured", .0.display())]
    MissingArtifact(PathBuf),
    #[error("invalid GITHUB_TOKEN header value")]
    InvalidToken,
    #[error("failed to download {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to download {url}: status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

async fn download_file(url: &str, path: &Path, token: Option<&str>) -> Result<(), ProvisionError> {
    tracing::info!(url, path = %path.display(), "Downloading model artifact");

    let mut header_map = HeaderMap::new();
    if let Some(token) = token {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ProvisionError::InvalidToken)?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let request_error = |source| ProvisionError::Request {
        url: url.to_string(),
        source,
    };

    let response = reqwest::Client::new()
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(request_error)?;

    if !response.status().is_success() {
        return Err(ProvisionError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let bytes = response.bytes().await.map_err(request_error)?;

    let write_error = |source| ProvisionError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
    }
    tokio::fs::write(path, bytes).await.map_err(write_error)?;

    Ok(())
}

/// Makes sure the model artifact exists locally, downloading it from `url`
/// when it does not.
pub async fn ensure_model_file(
    model_path: &Path,
    url: Option<&str>,
    token: Option<&str>,
) -> Result<(), ProvisionError> {
    if tokio::fs::try_exists(model_path).await.unwrap_or(false) {
        tracing::debug!(path = %model_path.display(), "Model artifact present");
        return Ok(());
    }

    match url {
        Some(url) => download_file(url, model_path, token).await,
        None => Err(ProvisionError::MissingArtifact(model_path.to_path_buf())),
    }
}
