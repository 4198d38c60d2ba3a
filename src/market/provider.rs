use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::time::{sleep, Duration};

use crate::models::{Candle, Quote, Timeframe};
use crate::Result;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Upstream market data source.
///
/// Batched quote reads are preferred; the default batch implementation just
/// loops for providers without a multi-symbol endpoint.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: u32,
    ) -> Result<Vec<Candle>>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote>;

    async fn get_quotes(&self, symbols: &[String]) -> Result<Vec<Quote>> {
        let mut quotes = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            quotes.push(self.get_quote(symbol).await?);
        }
        Ok(quotes)
    }
}

/// HTTP market data client
#[derive(Clone)]
pub struct HttpMarketData {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct CandleDto {
    #[serde(rename = "time")]
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    symbol: String,
    candles: Vec<CandleDto>,
}

#[derive(Debug, Deserialize)]
struct QuoteDto {
    symbol: String,
    bid: f64,
    ask: f64,
    #[serde(rename = "time")]
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    quotes: Vec<QuoteDto>,
}

impl HttpMarketData {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Retry wrapper with exponential backoff for transient failures
    async fn with_retries<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                        tracing::warn!(
                            "Attempt {}/{} failed for {}: {}. Retrying in {}ms...",
                            attempt,
                            MAX_RETRIES,
                            what,
                            last_error.as_ref().unwrap(),
                            backoff_ms
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "all retry attempts failed".into()))
    }

    async fn fetch_candles_once(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: u32,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/candles?symbol={}&timeframe={}&count={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            count
        );

        let response: CandlesResponse = self.client.get(&url).send().await?.json().await?;

        Ok(response
            .candles
            .into_iter()
            .map(|c| Candle {
                symbol: response.symbol.clone(),
                timestamp: c.timestamp,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
            })
            .collect())
    }

    async fn fetch_quote_once(&self, symbol: &str) -> Result<Quote> {
        let url = format!("{}/quote?symbol={}", self.base_url, symbol);
        let dto: QuoteDto = self.client.get(&url).send().await?.json().await?;
        Ok(Quote {
            symbol: dto.symbol,
            bid: dto.bid,
            ask: dto.ask,
            timestamp: dto.timestamp,
        })
    }

    async fn fetch_quotes_once(&self, symbols: &[String]) -> Result<Vec<Quote>> {
        let url = format!("{}/quotes?symbols={}", self.base_url, symbols.join(","));
        let response: QuotesResponse = self.client.get(&url).send().await?.json().await?;
        Ok(response
            .quotes
            .into_iter()
            .map(|dto| Quote {
                symbol: dto.symbol,
                bid: dto.bid,
                ask: dto.ask,
                timestamp: dto.timestamp,
            })
            .collect())
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketData {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: u32,
    ) -> Result<Vec<Candle>> {
        self.with_retries("candles", || self.fetch_candles_once(symbol, timeframe, count))
            .await
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        self.with_retries("quote", || self.fetch_quote_once(symbol))
            .await
    }

    /// One round-trip for every symbol with a pending plan
    async fn get_quotes(&self, symbols: &[String]) -> Result<Vec<Quote>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        self.with_retries("quotes", || self.fetch_quotes_once(symbols))
            .await
    }
}
