use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::header::{COOKIE, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::config::PortalConfig;
use super::error::{PortalError, Result};
use super::types::{ProgressEvent, ProgressTx, emit};

/// Streams files over plain HTTP with the browser session's cookies.
pub struct Downloader {
    client: reqwest::Client,
    config: PortalConfig,
}

impl Downloader {
    pub fn new(config: PortalConfig) -> Result<Self> {
        // Redirects are followed by hand so the cookie header survives every hop.
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(config.nav_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Downloads `url` to `dest`, returning the byte count. Nothing is left at
    /// `dest` unless the whole non-empty body arrived.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        cookie_header: &str,
        progress: Option<&ProgressTx>,
    ) -> Result<u64> {
        let part = partial_path(dest);
        let limit = self.config.download_timeout;
        let outcome = match tokio::time::timeout(
            limit,
            self.fetch_to(url, dest, &part, cookie_header, progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PortalError::DownloadTimeout {
                url: url.to_string(),
                secs: limit.as_secs(),
            }),
        };

        match outcome {
            Ok(bytes) => {
                info!(%url, path = %dest.display(), bytes, "downloaded");
                emit(
                    progress,
                    ProgressEvent::DownloadFinished {
                        url: url.to_string(),
                        path: dest.display().to_string(),
                        bytes,
                    },
                );
                Ok(bytes)
            }
            Err(err) => {
                remove_quietly(&part).await;
                warn!(%url, error = %err, "download failed");
                emit(
                    progress,
                    ProgressEvent::DownloadFailed {
                        url: url.to_string(),
                        reason: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    async fn fetch_to(
        &self,
        url: &str,
        dest: &Path,
        part: &Path,
        cookie_header: &str,
        progress: Option<&ProgressTx>,
    ) -> Result<u64> {
        let mut current = Url::parse(url).map_err(|e| PortalError::InvalidUrl(format!("{url}: {e}")))?;
        let mut hops = 0usize;
        let response = loop {
            let mut request = self
                .client
                .get(current.clone())
                .header(USER_AGENT, self.config.user_agent.as_str());
            if !cookie_header.is_empty() {
                request = request.header(COOKIE, cookie_header);
            }
            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(PortalError::MissingRedirectLocation {
                        url: current.to_string(),
                    });
                };
                hops += 1;
                if hops > self.config.max_redirect_hops {
                    return Err(PortalError::TooManyRedirects {
                        url: url.to_string(),
                        hops: hops - 1,
                    });
                }
                let next = current
                    .join(location)
                    .map_err(|e| PortalError::InvalidUrl(format!("{location}: {e}")))?;
                debug!(from = %current, to = %next, status = status.as_u16(), "following redirect");
                current = next;
                continue;
            }
            if !status.is_success() {
                return Err(PortalError::HttpStatus {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }
            break response;
        };

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let total = response.content_length();
        emit(
            progress,
            ProgressEvent::DownloadStarted {
                url: url.to_string(),
                total,
            },
        );

        let mut file = tokio::fs::File::create(part).await?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            emit(
                progress,
                ProgressEvent::DownloadProgress {
                    url: url.to_string(),
                    downloaded,
                    total,
                },
            );
        }
        file.flush().await?;
        drop(file);

        if downloaded == 0 {
            return Err(PortalError::EmptyDownload {
                path: dest.display().to_string(),
            });
        }
        tokio::fs::rename(part, dest).await?;
        Ok(downloaded)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %err, "partial file not removed");
        }
    }
}
