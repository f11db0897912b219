use std::{
    path::{Component, Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Context;
use easel_project::{DownloadReport, FileSource};
use futures_util::StreamExt;
use reqwest::{StatusCode, header::CONTENT_LENGTH};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::best_effort;
use crate::config::Credentials;

/// URLs on this path are resolved to a list of mirrors before downloading.
const RESOLVER_MARKER: &str = "/comfyui-launcher/";
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);
const RESOLVER_TIMEOUT: Duration = Duration::from_secs(30);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
/// Longest silence tolerated while waiting for response headers or the next body chunk.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const HASH_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay: Duration::from_secs(1),
        }
    }

    /// `base_delay * 2^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

pub async fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = f.read(&mut buf).await.context("read for checksum")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn matches_checksum(path: &Path, expected: &str) -> bool {
    if !path.is_file() {
        return false;
    }
    match sha256_file(path).await {
        Ok(got) => got.eq_ignore_ascii_case(expected.trim()),
        Err(_) => false,
    }
}

/// Join a descriptor-relative path under `root`, refusing anything that
/// would escape it.
fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel.trim());
    if rel.as_os_str().is_empty() {
        return None;
    }
    let mut out = root.to_path_buf();
    for c in rel.components() {
        match c {
            Component::Normal(p) => out.push(p),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn temp_path_for(dest: &Path, attempt: u32) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{name}.{attempt}.part"))
}

#[derive(Debug, serde::Deserialize)]
struct ResolverResponse {
    #[serde(default)]
    urls: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Downloader {
    http: reqwest::Client,
    policy: RetryPolicy,
    read_timeout: Duration,
}

impl Downloader {
    pub fn new(http: reqwest::Client, policy: RetryPolicy) -> Self {
        Self {
            http,
            policy,
            read_timeout: READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Fetch `url` into `dest`. Returns `false` once every attempt has failed;
    /// never leaves a partial file at `dest`.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_sha256: Option<&str>,
        headers: &[(String, String)],
    ) -> bool {
        let expected = expected_sha256.map(str::trim).filter(|s| !s.is_empty());
        if let Some(sha) = expected
            && matches_checksum(dest, sha).await
        {
            tracing::info!(dest = %dest.display(), "file already present with matching checksum");
            return true;
        }
        if let Some(parent) = dest.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(dest = %dest.display(), error = %e, "cannot create destination dir");
            return false;
        }

        for attempt in 0..self.policy.max_retries {
            let tmp = temp_path_for(dest, attempt);
            let res = self.attempt(url, &tmp, dest, expected, headers).await;
            match res {
                Ok(bytes) => {
                    tracing::info!(url, dest = %dest.display(), bytes, attempt, "download complete");
                    return true;
                }
                Err(e) => {
                    best_effort::remove_file(&tmp).await;
                    tracing::warn!(url, attempt, error = %format!("{e:#}"), "download attempt failed");
                    if attempt + 1 < self.policy.max_retries {
                        tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }
        tracing::error!(url, dest = %dest.display(), attempts = self.policy.max_retries, "download failed");
        false
    }

    async fn content_length(&self, url: &str, headers: &[(String, String)]) -> Option<u64> {
        let mut req = self.http.head(url).timeout(HEAD_TIMEOUT);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    }

    async fn attempt(
        &self,
        url: &str,
        tmp: &Path,
        dest: &Path,
        expected: Option<&str>,
        headers: &[(String, String)],
    ) -> anyhow::Result<u64> {
        let total = self.content_length(url, headers).await;

        let mut req = self.http.get(url);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = tokio::time::timeout(self.read_timeout, req.send())
            .await
            .map_err(|_| anyhow::anyhow!("no response within {:?}", self.read_timeout))?
            .context("request")?
            .error_for_status()
            .context("status")?;

        let mut f = tokio::fs::File::create(tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        let mut stream = resp.bytes_stream();
        let started_at = Instant::now();
        let mut last_log = started_at;
        let mut downloaded = 0u64;
        loop {
            let next = tokio::time::timeout(self.read_timeout, stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("body stalled for {:?}", self.read_timeout))?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.context("read body chunk")?;
            f.write_all(&chunk).await.context("write temp file")?;
            downloaded = downloaded.saturating_add(chunk.len() as u64);

            let now = Instant::now();
            if now.duration_since(last_log) >= PROGRESS_INTERVAL {
                let elapsed = now.duration_since(started_at).as_secs_f64();
                let mb_per_sec = downloaded as f64 / elapsed.max(0.001) / (1024.0 * 1024.0);
                tracing::info!(
                    url,
                    downloaded,
                    total = total.unwrap_or(0),
                    mb_per_sec = (mb_per_sec * 100.0).round() / 100.0,
                    "downloading"
                );
                last_log = now;
            }
        }
        f.flush().await.context("flush temp file")?;
        drop(f);

        if downloaded == 0 {
            anyhow::bail!("empty download");
        }
        if let Some(want) = expected {
            let got = sha256_file(tmp).await?;
            if !got.eq_ignore_ascii_case(want) {
                anyhow::bail!("sha256 mismatch: expected {want}, got {got}");
            }
        }

        match tokio::fs::remove_file(dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("remove previous file"),
        }
        tokio::fs::rename(tmp, dest)
            .await
            .with_context(|| format!("move into {}", dest.display()))?;
        Ok(downloaded)
    }

    /// Candidate URLs for one alternative. `None` means the resolver
    /// reported a server error and the alternative should be skipped.
    pub async fn resolve(&self, url: &str) -> Option<Vec<String>> {
        if !url.contains(RESOLVER_MARKER) {
            return Some(vec![url.to_string()]);
        }
        let resp = match self.http.get(url).timeout(RESOLVER_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(url, error = %e, "resolver request failed, using url directly");
                return Some(vec![url.to_string()]);
            }
        };
        let status = resp.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::warn!(url, "resolver server error, skipping alternative");
            return None;
        }
        if !status.is_success() {
            tracing::warn!(url, %status, "resolver returned error status, using url directly");
            return Some(vec![url.to_string()]);
        }
        let urls: Vec<String> = match resp.json::<ResolverResponse>().await {
            Ok(r) => r
                .urls
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => {
                tracing::warn!(url, "resolver response is not json, using url directly");
                Vec::new()
            }
        };
        if urls.is_empty() {
            return Some(vec![url.to_string()]);
        }
        Some(urls)
    }

    /// Download every file group under `app_dir`. Alternatives are tried in
    /// order until one succeeds; groups with no success are reported missing.
    pub async fn download_files(
        &self,
        app_dir: &Path,
        groups: &[Vec<FileSource>],
        credentials: &Credentials,
    ) -> DownloadReport {
        let mut report = DownloadReport::default();
        let total = groups.len();
        if total == 0 {
            tracing::info!("no files to download");
            return report;
        }

        for (idx, group) in groups.iter().enumerate() {
            let mut current: Option<&str> = None;
            let mut done = false;

            for source in group {
                let (Some(url), Some(rel)) = (
                    source.download_url.as_deref(),
                    source.dest_relative_path.as_deref(),
                ) else {
                    tracing::warn!(?source, "incomplete file entry, skipping");
                    continue;
                };
                current = Some(rel);
                let url = url.trim();
                if url.is_empty() {
                    tracing::warn!(dest = rel, "empty download url");
                    continue;
                }
                let Some(dest) = safe_join(app_dir, rel) else {
                    tracing::warn!(dest = rel, "destination escapes the application dir");
                    continue;
                };
                let sha = source
                    .sha256
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty());

                if let Some(sha) = sha
                    && matches_checksum(&dest, sha).await
                {
                    tracing::info!(dest = rel, "file already present with matching checksum");
                    done = true;
                    break;
                }

                let Some(candidates) = self.resolve(url).await else {
                    continue;
                };
                for candidate in candidates {
                    let headers = credentials.headers_for(&candidate);
                    if self.fetch(&candidate, &dest, sha, &headers).await {
                        done = true;
                        break;
                    }
                }
                if done {
                    break;
                }
            }

            if !done
                && let Some(rel) = current
            {
                tracing::warn!(dest = rel, "file could not be downloaded");
                report.missing_files.insert(rel.to_string());
            }
            tracing::info!(done = idx + 1, total, "file groups processed");
        }

        tracing::info!(
            ok = total - report.missing_files.len(),
            missing = report.missing_files.len(),
            "downloads finished"
        );
        report
    }
}
