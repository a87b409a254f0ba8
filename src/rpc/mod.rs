/// Provider Client Module
///
/// This module handles all interactions with upstream block-explorer APIs.
/// Each adapter decodes its provider's envelope once into a [`PageOutcome`];
/// the client turns outcomes into rows, in-place rate-limit retries with key
/// rotation, or immediate hard failures.
pub mod etherscan;
pub mod jsonrpc;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::FetchError;
use crate::etl::transform;
use crate::keys::{ApiKey, ApiKeyPool};
use crate::models::{Chain, ProviderKind, TransferEvent};

/// Providers only index this many results per query window
pub const RESULT_WINDOW: usize = 10_000;

const RATE_LIMIT_RETRIES: u32 = 3;
const RATE_LIMIT_SLEEP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// One page of a block-window query
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    /// 1-based
    pub page: u32,
    pub page_size: usize,
    pub sort: SortOrder,
    pub start_block: u64,
    /// `None` means up to the chain head
    pub end_block: Option<u64>,
}

impl PageRequest {
    pub fn ascending(start_block: u64, end_block: Option<u64>, page_size: usize) -> Self {
        Self { page: 1, page_size, sort: SortOrder::Asc, start_block, end_block }
    }

    /// Copy of the request with the page size clamped to the provider cap
    pub fn clamped(&self, kind: ProviderKind) -> Self {
        let mut req = self.clone();
        req.page_size = req.page_size.clamp(1, kind.max_page_size());
        req.page = req.page.max(1);
        req
    }
}

/// Transfers from one page, plus how many rows the provider actually sent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    /// Rows before validation and dedup; page fullness is judged on this
    pub received: usize,
    pub events: Vec<TransferEvent>,
}

/// Provider response after decoding, independent of envelope shape
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome<T = FetchedPage> {
    Rows(T),
    /// "No records" style answer, a terminal success
    Empty,
    RateLimited(String),
    HardError { code: String, message: String },
}

/// Anything that can serve pages of transfers for a chain
#[async_trait]
pub trait TransferSource: Send + Sync {
    async fn fetch_page(&self, chain: &Chain, request: &PageRequest) -> Result<FetchedPage, FetchError>;

    /// Current head block, for providers whose block windows must be bounded
    async fn head_block(&self, _chain: &Chain) -> Result<Option<u64>, FetchError> {
        Ok(None)
    }

    /// Count transfers for a chain, bounded by the provider's result window
    ///
    /// The figure is exact below the window and saturates at it above. Range
    /// limited providers only count their newest block window.
    async fn fetch_total_count(&self, chain: &Chain) -> Result<u64, FetchError> {
        let page_size = chain.kind.max_page_size();
        let max_pages = (RESULT_WINDOW / page_size).max(1) as u32;
        let (start_block, end_block) = newest_window(self, chain).await?;
        let mut total = 0u64;

        for page in 1..=max_pages {
            let request = PageRequest { page, page_size, sort: SortOrder::Asc, start_block, end_block };
            let fetched = self.fetch_page(chain, &request).await?;
            total += fetched.events.len() as u64;

            if fetched.received < page_size || !chain.kind.paginates() {
                break;
            }
        }

        Ok(total)
    }
}

/// Block window holding the newest transfers
///
/// Unbounded for explorers; the last `max_block_range` blocks below the head
/// for providers that refuse wider windows.
pub async fn newest_window<S>(source: &S, chain: &Chain) -> Result<(u64, Option<u64>), FetchError>
where
    S: TransferSource + ?Sized,
{
    let Some(range) = chain.kind.max_block_range() else {
        return Ok((0, None));
    };
    match source.head_block(chain).await? {
        Some(head) => Ok((head.saturating_sub(range - 1), Some(head))),
        None => Ok((0, None)),
    }
}

pub struct ProviderClient {
    http: reqwest::Client,
    keys: Arc<ApiKeyPool>,
    rate_limit_retries: u32,
    rate_limit_sleep: Duration,
}

impl ProviderClient {
    /// Create a client drawing credentials from `keys`
    pub fn new(keys: Arc<ApiKeyPool>, timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, keys, rate_limit_retries: RATE_LIMIT_RETRIES, rate_limit_sleep: RATE_LIMIT_SLEEP })
    }

    /// Issue `call` with rotated keys until it yields rows, nothing, or a hard error
    ///
    /// Rate limits cool the key down and retry after a short sleep. When no
    /// other key is free the just-limited key is retried, so a single-key
    /// provider is not reported as out of credentials.
    async fn with_rotation<T, F, Fut>(&self, chain: &Chain, what: &str, call: F) -> Result<Option<T>, FetchError>
    where
        F: Fn(ApiKey) -> Fut,
        Fut: Future<Output = Result<PageOutcome<T>, FetchError>>,
    {
        let mut attempt = 0;
        let mut limited: Option<ApiKey> = None;

        loop {
            let key = match self.keys.next(&chain.provider).or_else(|| limited.take()) {
                Some(key) => key,
                None => return Err(FetchError::NoCredentials(chain.provider.clone())),
            };

            tracing::debug!(chain = %chain.name, provider = %chain.provider, key = %key.masked(), "Calling {}", what);

            match call(key.clone()).await? {
                PageOutcome::Rows(value) => return Ok(Some(value)),
                PageOutcome::Empty => return Ok(None),
                PageOutcome::HardError { code, message } => {
                    tracing::error!(
                        chain = %chain.name,
                        provider = %chain.provider,
                        key = %key.masked(),
                        "Upstream rejected {} ({}): {}",
                        what,
                        code,
                        message
                    );
                    return Err(FetchError::Upstream { provider: chain.provider.clone(), code, message });
                }
                PageOutcome::RateLimited(reason) => {
                    self.keys.mark_failed(&key, &reason, None);
                    attempt += 1;

                    if attempt > self.rate_limit_retries {
                        return Err(FetchError::RateLimited { provider: chain.provider.clone(), reason });
                    }

                    tracing::warn!(
                        chain = %chain.name,
                        provider = %chain.provider,
                        key = %key.masked(),
                        "Rate limited, retrying ({}/{})",
                        attempt,
                        self.rate_limit_retries
                    );
                    tokio::time::sleep(self.rate_limit_sleep).await;
                    limited = Some(key);
                }
            }
        }
    }

    /// Fetch one page of transfers, normalised and ordered as requested
    pub async fn fetch_page(&self, chain: &Chain, request: &PageRequest) -> Result<FetchedPage, FetchError> {
        let request = request.clamped(chain.kind);
        let http = &self.http;
        let req = &request;

        tracing::debug!(
            chain = %chain.name,
            start_block = request.start_block,
            end_block = ?request.end_block,
            page = request.page,
            "Fetching transfer page"
        );

        let fetched = self
            .with_rotation(chain, "transfer page", move |key| async move {
                match chain.kind {
                    ProviderKind::EtherscanPro | ProviderKind::Etherscan => {
                        etherscan::fetch(http, chain, req, &key).await
                    }
                    ProviderKind::JsonRpc => jsonrpc::fetch(http, chain, req, &key).await,
                }
            })
            .await?;

        Ok(match fetched {
            Some(page) => FetchedPage {
                received: page.received,
                events: transform::enforce_order(chain, &request, page.events),
            },
            None => FetchedPage::default(),
        })
    }

    /// Latest block number from a JSON-RPC node
    pub async fn fetch_head_block(&self, chain: &Chain) -> Result<u64, FetchError> {
        let http = &self.http;
        let head = self
            .with_rotation(chain, "eth_blockNumber", move |key| async move {
                jsonrpc::fetch_head(http, chain, &key).await
            })
            .await?;

        head.ok_or_else(|| FetchError::Upstream {
            provider: chain.provider.clone(),
            code: "malformed_response".to_string(),
            message: "eth_blockNumber returned no result".to_string(),
        })
    }
}

#[async_trait]
impl TransferSource for ProviderClient {
    async fn fetch_page(&self, chain: &Chain, request: &PageRequest) -> Result<FetchedPage, FetchError> {
        ProviderClient::fetch_page(self, chain, request).await
    }

    async fn head_block(&self, chain: &Chain) -> Result<Option<u64>, FetchError> {
        match chain.kind {
            ProviderKind::JsonRpc => self.fetch_head_block(chain).await.map(Some),
            ProviderKind::EtherscanPro | ProviderKind::Etherscan => Ok(None),
        }
    }
}

/// Map a non-success HTTP status to an outcome; `None` means decode the body
pub(crate) fn classify_status<T>(status: reqwest::StatusCode) -> Option<PageOutcome<T>> {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Some(PageOutcome::RateLimited("HTTP 429".to_string()));
    }
    if status.is_client_error() || status.is_server_error() {
        return Some(PageOutcome::HardError {
            code: format!("http_{}", status.as_u16()),
            message: status.canonical_reason().unwrap_or("request failed").to_string(),
        });
    }
    None
}
