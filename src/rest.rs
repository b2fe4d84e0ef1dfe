//! Bootstrap information supplied by the REST collaborator.
//!
//! The gateway needs four pieces of data before it can open a socket: the
//! wire URL, the recommended shard count, the identify concurrency budget,
//! and the caller's guild count. Everything else about the REST surface is
//! out of scope, so it is modeled as the [`Bootstrap`] trait with a thin
//! [`RestBootstrap`] implementation over `reqwest`.

use std::error::Error as StdError;
use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;

use crate::error::{Error, Kind};
use crate::Result;

/// Identify concurrency budget returned by the server.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SessionStartLimit {
    /// Total identify calls allowed per reset window
    pub total: u32,
    /// Identify calls remaining in the current window
    pub remaining: u32,
    /// Milliseconds until the window resets
    pub reset_after: u64,
    /// Number of identify calls permitted per 5-second bucket
    pub max_concurrency: u32,
}

/// Everything the gateway needs before opening a socket.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapInfo {
    /// Base wire URL, without query parameters
    pub url: String,
    /// Server-recommended shard count
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
    /// Caller's guild count; not part of the wire response, filled in by the
    /// provider
    #[serde(default)]
    pub guild_count: u64,
}

/// Source of bootstrap information, queried once per `connect()`.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    async fn fetch(&self) -> Result<BootstrapInfo>;
}

/// REST-backed [`Bootstrap`] hitting `GET {base}/gateway/bot`.
pub struct RestBootstrap {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
    guild_count: u64,
}

impl RestBootstrap {
    /// `base_url` is the API root (no trailing slash); `guild_count` is the
    /// caller's current guild count, used for shard computation.
    pub fn new(base_url: impl Into<String>, token: SecretString, guild_count: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token,
            guild_count,
        }
    }
}

#[async_trait]
impl Bootstrap for RestBootstrap {
    async fn fetch(&self) -> Result<BootstrapInfo> {
        let url = format!("{}/gateway/bot", self.base_url);
        let response = self
            .http
            .get(&url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bot {}", self.token.expose_secret()),
            )
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(%status, %message, "bootstrap request failed");
            return Err(BootstrapFailed { status, message }.into());
        }

        let mut info = response.json::<BootstrapInfo>().await?;
        info.guild_count = self.guild_count;

        tracing::debug!(
            url = %info.url,
            shards = info.shards,
            max_concurrency = info.session_start_limit.max_concurrency,
            "fetched gateway bootstrap info"
        );

        Ok(info)
    }
}

/// Non-success status from the bootstrap endpoint.
#[non_exhaustive]
#[derive(Debug)]
pub struct BootstrapFailed {
    pub status: StatusCode,
    pub message: String,
}

impl fmt::Display for BootstrapFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bootstrap request failed with {}: {}",
            self.status, self.message
        )
    }
}

impl StdError for BootstrapFailed {}

impl From<BootstrapFailed> for Error {
    fn from(err: BootstrapFailed) -> Self {
        Error::with_source(Kind::Bootstrap, err)
    }
}

/// Fixed [`Bootstrap`] for tests and single-process setups that already know
/// their gateway URL.
#[derive(Debug, Clone)]
pub struct StaticBootstrap(pub BootstrapInfo);

#[async_trait]
impl Bootstrap for StaticBootstrap {
    async fn fetch(&self) -> Result<BootstrapInfo> {
        Ok(self.0.clone())
    }
}

impl StaticBootstrap {
    /// Single-shard bootstrap pointing at `url` with an unlimited budget.
    #[must_use]
    pub fn single(url: impl Into<String>) -> Self {
        Self(BootstrapInfo {
            url: url.into(),
            shards: 1,
            session_start_limit: SessionStartLimit {
                total: 1000,
                remaining: 1000,
                reset_after: 0,
                max_concurrency: 1,
            },
            guild_count: 0,
        })
    }
}
