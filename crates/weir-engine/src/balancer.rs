// Load balancer: picks an upstream for a channel, respecting per-source
// concurrency caps, priority ordering, per-session exclusions, and a lap
// retry policy with exponential backoff.

use crate::backoff::BackoffStrategy;
use crate::concurrency::ConcurrencyManager;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::source::{Session, SourceCatalog, StreamSource};
use reqwest::{Client, Method, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

const LAP_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const LAP_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// A successfully opened upstream.
///
/// The response body is unread; ownership transfers to whichever writer loop
/// ends up consuming it.
pub struct BalancedSource {
    pub response: Response,
    pub url: Url,
    pub index: String,
    pub sub_index: String,
}

impl BalancedSource {
    pub fn source_key(&self) -> String {
        format!("{}|{}", self.index, self.sub_index)
    }
}

/// Shared upstream HTTP client: follows redirects, bounds the dial, and
/// presents the configured user agent.
pub fn create_client(config: &RelayConfig) -> Result<Client, RelayError> {
    Ok(Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?)
}

pub struct LoadBalancer {
    client: Client,
    catalog: Arc<dyn SourceCatalog>,
    concurrency: Arc<ConcurrencyManager>,
    max_laps: u32,
    /// Bound on one attempt's wait for response headers. The client's
    /// connect timeout only covers the dial; a server that accepts and then
    /// stalls must not hold up the whole lap.
    attempt_timeout: Duration,
}

impl LoadBalancer {
    pub fn new(
        config: &RelayConfig,
        catalog: Arc<dyn SourceCatalog>,
        concurrency: Arc<ConcurrencyManager>,
    ) -> Result<Self, RelayError> {
        Ok(Self {
            client: create_client(config)?,
            catalog,
            concurrency,
            max_laps: config.max_retries,
            attempt_timeout: config.connect_timeout + Duration::from_secs(5),
        })
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.concurrency
    }

    /// Candidates for `stream_id`, most desirable first.
    ///
    /// Sources sort by `priority − live subscriptions` of their index,
    /// descending; declaration order breaks ties.
    fn order_sources(&self, mut sources: Vec<StreamSource>) -> Vec<StreamSource> {
        sources.sort_by_key(|source| std::cmp::Reverse(self.concurrency.priority_value(&source.index)));
        sources
    }

    /// Open an upstream for `stream_id`.
    ///
    /// Any received HTTP response wins, whatever its status; classifying
    /// non-2xx bodies is the coordinator's concern. Transport failures skip
    /// to the next candidate. A lap in which every candidate was excluded
    /// clears the session's tested set before backing off, so a request can
    /// never starve permanently on stale exclusions.
    pub async fn balance(
        &self,
        stream_id: &str,
        method: Method,
        session: &mut Session,
        token: &CancellationToken,
    ) -> Result<BalancedSource, RelayError> {
        let sources = self.catalog.sources_for(stream_id).await;
        if sources.is_empty() {
            return Err(RelayError::NoSources {
                stream_id: stream_id.to_owned(),
            });
        }
        for source in &sources {
            self.concurrency
                .declare(&source.index, source.max_concurrency, source.priority);
        }
        let sources = self.order_sources(sources);

        let mut backoff = BackoffStrategy::new(LAP_BACKOFF_INITIAL, LAP_BACKOFF_MAX);
        let mut lap = 0u32;

        while self.max_laps == 0 || lap < self.max_laps {
            let mut all_skipped = true;

            for source in &sources {
                let key = source.source_key();
                if session.is_tested(&key) {
                    continue;
                }
                if self.concurrency.check_concurrency(&source.index) {
                    debug!(stream_id, source = %key, "Source at concurrency cap, skipping");
                    continue;
                }
                all_skipped = false;

                let url = match Url::parse(&source.url) {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(stream_id, url = %source.url, error = %e, "Skipping malformed source URL");
                        continue;
                    }
                };

                let request = self.client.request(method.clone(), url.clone());
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(RelayError::Cancelled),
                    sent = tokio::time::timeout(self.attempt_timeout, request.send()) => sent,
                };

                match sent {
                    Ok(Ok(response)) => {
                        debug!(
                            stream_id,
                            source = %key,
                            url = %url,
                            status = response.status().as_u16(),
                            "Upstream selected"
                        );
                        return Ok(BalancedSource {
                            response,
                            url,
                            index: source.index.clone(),
                            sub_index: source.sub_index.clone(),
                        });
                    }
                    Ok(Err(e)) => {
                        warn!(stream_id, source = %key, url = %url, error = %e, "Upstream dial failed");
                    }
                    Err(_) => {
                        warn!(stream_id, source = %key, url = %url, "Upstream did not answer in time");
                    }
                }
            }

            if all_skipped {
                debug!(
                    stream_id,
                    tested = session.tested_count(),
                    "Every candidate excluded this lap, clearing session"
                );
                session.clear();
            }

            if !backoff.sleep(token).await {
                return Err(RelayError::Cancelled);
            }
            lap += 1;
        }

        Err(RelayError::source_exhausted(format!(
            "{} sources tried over {} laps for stream {stream_id}",
            sources.len(),
            self.max_laps
        )))
    }
}
