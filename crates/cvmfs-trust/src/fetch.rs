//! Fetching remote documents.
//!
//! Trust documents (whitelists) live next to the repository they describe and are fetched by
//! URL.  The [`Fetch`] trait is the seam between trust logic and transport: the trust code only
//! needs "bytes or a typed failure, within bounded time".  [`HttpFetcher`] is the production
//! implementation; tests substitute an in-memory one.

use std::{fs, thread, time::Duration};

use log::{debug, warn};
use reqwest::{blocking::Client, StatusCode, Url};

/// Errors from fetching a document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The URL could not be parsed or has an unsupported scheme.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The request did not complete within the configured timeout.
    #[error("timed out fetching {0}")]
    Timeout(String),
    /// The server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    Http {
        /// The requested URL.
        url: String,
        /// The HTTP status code.
        status: u16,
    },
    /// Connection-level failure.
    #[error("failed to fetch {url}: {reason}")]
    Transport {
        /// The requested URL.
        url: String,
        /// Backend error text.
        reason: String,
    },
    /// A `file://` URL could not be read.
    #[error("failed to read {url}: {reason}")]
    Io {
        /// The requested URL.
        url: String,
        /// Backend error text.
        reason: String,
    },
}

impl FetchError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            Self::InvalidUrl { .. } | Self::Io { .. } => false,
        }
    }
}

/// Something that can retrieve a document by URL.
pub trait Fetch {
    /// Fetches the complete body at `url`.
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

impl<F: Fetch + ?Sized> Fetch for &F {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(url)
    }
}

/// Number of additional attempts after a transient failure.
pub const DEFAULT_RETRIES: u32 = 2;

/// Default bound on a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Blocking HTTP(S) and `file://` fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    retries: u32,
}

impl HttpFetcher {
    /// Creates a fetcher whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            retries: DEFAULT_RETRIES,
        })
    }

    /// Sets the number of retries after a transient failure.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn fetch_once(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let fail = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout(url.to_string())
            } else {
                FetchError::Transport {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self.client.get(url.clone()).send().map_err(fail)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().map_err(fail)?.to_vec())
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        match parsed.scheme() {
            "file" => {
                let path = parsed.to_file_path().map_err(|()| FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: "not a local path".to_string(),
                })?;
                debug!("reading {path:?}");
                fs::read(&path).map_err(|e| FetchError::Io {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            "http" | "https" => {
                let mut attempt = 0;
                loop {
                    debug!("fetching {parsed} (attempt {})", attempt + 1);
                    match self.fetch_once(&parsed) {
                        Err(err) if err.is_transient() && attempt < self.retries => {
                            warn!("{err}; retrying");
                            attempt += 1;
                            thread::sleep(RETRY_BACKOFF);
                        }
                        result => return result,
                    }
                }
            }
            other => Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            }),
        }
    }
}
