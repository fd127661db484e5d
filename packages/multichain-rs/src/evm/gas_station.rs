//! Gas price oracle polled over HTTP
//!
//! Expects an Etherscan-style body:
//! `{"result":{"SafeGasPrice":"12","ProposeGasPrice":"13.5","FastGasPrice":"15"}}`
//! with prices in gwei.

use bigdecimal::{BigDecimal, ToPrimitive};
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::redact::redact_url;

pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Which of the oracle's prices to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPriceSelector {
    Safe,
    Propose,
    Fast,
}

impl FromStr for GasPriceSelector {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SafeGasPrice" => Ok(GasPriceSelector::Safe),
            "ProposeGasPrice" => Ok(GasPriceSelector::Propose),
            "FastGasPrice" => Ok(GasPriceSelector::Fast),
            other => Err(eyre!("Invalid gas price selector: {:?}", other)),
        }
    }
}

impl GasPriceSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            GasPriceSelector::Safe => "SafeGasPrice",
            GasPriceSelector::Propose => "ProposeGasPrice",
            GasPriceSelector::Fast => "FastGasPrice",
        }
    }
}

#[derive(Clone)]
pub struct GasStationConfig {
    pub url: String,
    pub polling_interval: Duration,
    pub request_timeout: Duration,
    /// Highest accepted price, in gwei
    pub max_gas_price: u64,
    pub selector: GasPriceSelector,
    /// Factor applied to the gwei price to obtain wei
    pub multiplier: u128,
}

impl fmt::Debug for GasStationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GasStationConfig")
            .field("url", &redact_url(&self.url))
            .field("polling_interval", &self.polling_interval)
            .field("request_timeout", &self.request_timeout)
            .field("max_gas_price", &self.max_gas_price)
            .field("selector", &self.selector)
            .field("multiplier", &self.multiplier)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GasOracleResult {
    safe_gas_price: String,
    propose_gas_price: String,
    fast_gas_price: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GasOracleResponse {
    result: GasOracleResult,
}

pub struct GasStation {
    config: GasStationConfig,
    client: Client,
    latest: RwLock<Option<GasOracleResult>>,
}

impl GasStation {
    pub fn new(config: GasStationConfig) -> Result<Self> {
        if config.polling_interval < MIN_POLLING_INTERVAL {
            return Err(eyre!(
                "Gas station polling interval must be at least {:?}",
                MIN_POLLING_INTERVAL
            ));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .wrap_err("Failed to create HTTP client")?;

        Ok(Self {
            config,
            client,
            latest: RwLock::new(None),
        })
    }

    /// Fetch the oracle once and cache the answer
    pub async fn refresh(&self) -> Result<()> {
        let response: GasOracleResponse = self
            .client
            .get(&self.config.url)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .wrap_err("Gas station request failed")?
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .wrap_err("Gas station returned an unexpected body")?;

        debug!(
            safe = %response.result.safe_gas_price,
            propose = %response.result.propose_gas_price,
            fast = %response.result.fast_gas_price,
            "Fetched gas prices"
        );
        *self.latest.write().await = Some(response.result);
        Ok(())
    }

    /// Current price in wei, from the last successful fetch
    pub async fn current_gas_price(&self) -> Result<u128> {
        let latest = self.latest.read().await;
        let result = latest
            .as_ref()
            .ok_or_else(|| eyre!("Latest gas prices were not fetched"))?;
        let raw = match self.config.selector {
            GasPriceSelector::Safe => &result.safe_gas_price,
            GasPriceSelector::Propose => &result.propose_gas_price,
            GasPriceSelector::Fast => &result.fast_gas_price,
        };
        gwei_to_wei(
            raw,
            self.config.max_gas_price,
            self.config.multiplier,
            self.config.selector,
        )
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if let Err(e) = self.refresh().await {
                error!(error = %e, "Gas station fetch failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Gas station loop stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.polling_interval) => {}
            }
        }
    }
}

fn gwei_to_wei(raw: &str, max_gwei: u64, multiplier: u128, selector: GasPriceSelector) -> Result<u128> {
    let price = BigDecimal::from_str(raw.trim())
        .map_err(|e| eyre!("Invalid gas price {:?}: {}", raw, e))?;
    if price > BigDecimal::from(max_gwei) {
        return Err(eyre!(
            "Gas price is higher than the maximum set: maximum {}, fetched {}, selector {}",
            max_gwei,
            price,
            selector.as_str()
        ));
    }
    (price * BigDecimal::from(multiplier))
        .with_scale(0)
        .to_u128()
        .ok_or_else(|| eyre!("Gas price {:?} out of range", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parsing() {
        assert_eq!(
            "SafeGasPrice".parse::<GasPriceSelector>().unwrap(),
            GasPriceSelector::Safe
        );
        assert!("SlowGasPrice".parse::<GasPriceSelector>().is_err());
    }

    #[test]
    fn test_gwei_to_wei() {
        let wei = gwei_to_wei("13.5", 300, 1_000_000_000, GasPriceSelector::Safe).unwrap();
        assert_eq!(wei, 13_500_000_000);
    }

    #[test]
    fn test_price_above_maximum_rejected() {
        let err = gwei_to_wei("301", 300, 1_000_000_000, GasPriceSelector::Fast).unwrap_err();
        assert!(err.to_string().contains("higher than the maximum"));
    }

    #[test]
    fn test_polling_interval_lower_bound() {
        let config = GasStationConfig {
            url: "http://localhost".to_string(),
            polling_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(2),
            max_gas_price: 300,
            selector: GasPriceSelector::Safe,
            multiplier: 1_000_000_000,
        };
        assert!(GasStation::new(config).is_err());
    }

    #[tokio::test]
    async fn test_price_unavailable_before_first_fetch() {
        let station = GasStation::new(GasStationConfig {
            url: "http://localhost".to_string(),
            polling_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(2),
            max_gas_price: 300,
            selector: GasPriceSelector::Safe,
            multiplier: 1_000_000_000,
        })
        .unwrap();
        assert!(station.current_gas_price().await.is_err());
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{"status":"1","result":{"LastBlock":"1","SafeGasPrice":"12","ProposeGasPrice":"13","FastGasPrice":"15"}}"#;
        let parsed: GasOracleResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.result.fast_gas_price, "15");
    }

    #[test]
    fn test_debug_hides_api_key() {
        let config = GasStationConfig {
            url: "https://api.etherscan.io/api?module=gastracker&apikey=SECRET".to_string(),
            polling_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(2),
            max_gas_price: 300,
            selector: GasPriceSelector::Safe,
            multiplier: 1_000_000_000,
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("SECRET"));
        assert!(debug.contains("api.etherscan.io"));
    }
}
