use std::collections::{BTreeSet, HashMap};

use crate::api::{BinanceClient, CoinMarketCapClient, CoinQuote, MarketData};
use crate::config::DiscoveryConfig;
use crate::models::Bar;
use crate::Result;

const QUOTE_ASSET: &str = "USDT";

/// A coin that passed every discovery filter
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Futures symbol, e.g. `ARBUSDT`
    pub symbol: String,
    pub base: String,
    pub rank: u32,
    pub price: f64,
}

/// Base asset of a plain USDT pair; settlement-dated contracts are skipped
pub fn usdt_base(symbol: &str) -> Option<&str> {
    let base = symbol.strip_suffix(QUOTE_ASSET)?;
    (!base.is_empty() && !base.contains('_')).then_some(base)
}

/// Base assets traded against USDT on both markets, sorted
pub fn common_bases(spot: &[String], futures: &[String]) -> Vec<String> {
    let spot: BTreeSet<&str> = spot.iter().filter_map(|s| usdt_base(s)).collect();
    futures
        .iter()
        .filter_map(|s| usdt_base(s))
        .filter(|base| spot.contains(base))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Keep coins inside the rank band and above the price floor, best rank first
pub fn rank_filter(quotes: &HashMap<String, CoinQuote>, config: &DiscoveryConfig) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = quotes
        .iter()
        .filter(|(_, q)| q.price > config.min_price)
        .filter(|(_, q)| q.rank > config.min_rank && q.rank < config.max_rank)
        .map(|(base, q)| Candidate {
            symbol: format!("{}{}", base, QUOTE_ASSET),
            base: base.clone(),
            rank: q.rank,
            price: q.price,
        })
        .collect();
    candidates.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.base.cmp(&b.base)));
    candidates
}

/// True when the busiest week traded `ratio` times the first listed week or more
///
/// No history counts as a spike.
pub fn has_volume_spike(weekly: &[Bar], ratio: f64) -> bool {
    let Some(first) = weekly.first() else {
        return true;
    };
    let peak = weekly.iter().map(|b| b.volume).fold(f64::NEG_INFINITY, f64::max);
    peak >= first.volume * ratio
}

/// Builds a trading universe from exchange listings and market cap data
pub struct UniverseDiscovery {
    spot: BinanceClient,
    futures: BinanceClient,
    cmc: CoinMarketCapClient,
    config: DiscoveryConfig,
}

impl UniverseDiscovery {
    pub fn new(
        spot: BinanceClient,
        futures: BinanceClient,
        cmc: CoinMarketCapClient,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            spot,
            futures,
            cmc,
            config,
        }
    }

    /// Listed on spot and futures, ranked, priced, and free of volume spikes
    ///
    /// A coin whose weekly history cannot be fetched is dropped.
    pub async fn discover(&self) -> Result<Vec<Candidate>> {
        let spot = self.spot.spot_symbols().await?;
        let futures = self.futures.futures_symbols().await?;
        let bases = common_bases(&spot, &futures);
        tracing::info!("🔍 {} USDT pairs listed on spot and futures", bases.len());

        let quotes = self.cmc.quotes(&bases).await?;
        let ranked = rank_filter(&quotes, &self.config);
        tracing::info!(
            "📊 {} inside ranks {}..{} above ${}",
            ranked.len(),
            self.config.min_rank,
            self.config.max_rank,
            self.config.min_price
        );

        let mut universe = Vec::with_capacity(ranked.len());
        for candidate in ranked {
            match self
                .futures
                .fetch_bars(&candidate.symbol, "1w", self.config.history_weeks)
                .await
            {
                Ok(weekly) if !has_volume_spike(&weekly, self.config.spike_ratio) => {
                    universe.push(candidate);
                }
                Ok(_) => {
                    tracing::debug!(symbol = %candidate.symbol, "Dropped for weekly volume spike");
                }
                Err(e) => {
                    tracing::warn!("⚠️  Weekly history for {} unavailable: {}", candidate.symbol, e);
                }
            }
        }

        tracing::info!("✅ Discovered {} instruments", universe.len());
        Ok(universe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn weeks(volumes: &[f64]) -> Vec<Bar> {
        let start = Utc::now() - Duration::weeks(volumes.len() as i64);
        volumes
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let open = start + Duration::weeks(i as i64);
                Bar::new("ARBUSDT", open, open + Duration::weeks(1), 1.0, 1.0, 1.0, 1.0)
                    .with_volumes(*v, 0.0, 0.0)
            })
            .collect()
    }

    // ========================================================================
    // Filters
    // ========================================================================

    #[test]
    fn test_usdt_base() {
        assert_eq!(usdt_base("ARBUSDT"), Some("ARB"));
        assert_eq!(usdt_base("BTCUSDT_250328"), None);
        assert_eq!(usdt_base("ETHBTC"), None);
        assert_eq!(usdt_base("USDT"), None);
    }

    #[test]
    fn test_common_bases_intersects_markets() {
        let spot = strings(&["ARBUSDT", "DOGEUSDT", "ETHBTC", "SPOTONLYUSDT"]);
        let futures = strings(&["DOGEUSDT", "ARBUSDT", "ETHUSDT", "BTCUSDT_250328", "ARBUSDC"]);

        assert_eq!(common_bases(&spot, &futures), strings(&["ARB", "DOGE"]));
    }

    #[test]
    fn test_rank_band_is_exclusive() {
        let quotes: HashMap<String, CoinQuote> = [
            ("TOP", 50, 10.0),
            ("MID", 51, 1.0),
            ("LOW", 999, 0.5),
            ("TAIL", 1000, 0.5),
            ("DUST", 300, 0.0001),
            ("SUB", 120, 0.00011),
        ]
        .into_iter()
        .map(|(base, rank, price)| (base.to_string(), CoinQuote { rank, price }))
        .collect();

        let kept: Vec<String> = rank_filter(&quotes, &DiscoveryConfig::default())
            .into_iter()
            .map(|c| c.symbol)
            .collect();

        assert_eq!(kept, strings(&["MIDUSDT", "SUBUSDT", "LOWUSDT"]));
    }

    #[test]
    fn test_weekly_volume_spike() {
        assert!(!has_volume_spike(&weeks(&[100.0, 900.0, 4000.0]), 50.0));
        assert!(has_volume_spike(&weeks(&[100.0, 5000.0, 300.0]), 50.0));
        assert!(has_volume_spike(&weeks(&[0.0, 1.0]), 50.0));
        assert!(has_volume_spike(&[], 50.0));
    }

    // ========================================================================
    // End to end against mocked endpoints
    // ========================================================================

    fn kline_row(volume: f64) -> String {
        format!(
            r#"[1700000000000, "1.0", "1.0", "1.0", "1.0", "{}", 1700604799999, "1.0", 1, "0.0", "0.0", "0"]"#,
            volume
        )
    }

    #[tokio::test]
    async fn test_discover_applies_every_filter() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[{"symbol":"ARBUSDT","price":"0.75"},{"symbol":"PEPEUSDT","price":"0.00001"},
                    {"symbol":"OPUSDT","price":"1.5"},{"symbol":"DOGEUSDT","price":"0.12"}]"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/fapi/v1/ticker/price")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[{"symbol":"ARBUSDT","price":"0.75"},{"symbol":"PEPEUSDT","price":"0.00001"},
                    {"symbol":"OPUSDT","price":"1.5"},{"symbol":"DOGEUSDT","price":"0.12"}]"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v2/cryptocurrency/quotes/latest")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"data": {
                    "ARB": [{"cmc_rank": 60, "quote": {"USD": {"price": 0.75}}}],
                    "OP": [{"cmc_rank": 70, "quote": {"USD": {"price": 1.5}}}],
                    "PEPE": [{"cmc_rank": 80, "quote": {"USD": {"price": 0.00001}}}],
                    "DOGE": [{"cmc_rank": 9, "quote": {"USD": {"price": 0.12}}}]
                }}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/fapi/v1/klines")
            .match_query(mockito::Matcher::UrlEncoded("symbol".into(), "ARBUSDT".into()))
            .with_status(200)
            .with_body(format!("[{},{}]", kline_row(100.0), kline_row(800.0)))
            .create_async()
            .await;
        server
            .mock("GET", "/fapi/v1/klines")
            .match_query(mockito::Matcher::UrlEncoded("symbol".into(), "OPUSDT".into()))
            .with_status(200)
            .with_body(format!("[{},{}]", kline_row(10.0), kline_row(900.0)))
            .create_async()
            .await;

        let binance = BinanceClient::new(server.url(), 6000)
            .unwrap()
            .with_backoff(tokio::time::Duration::from_millis(1));
        let cmc = CoinMarketCapClient::new(server.url(), "test_key")
            .unwrap()
            .with_backoff(tokio::time::Duration::from_millis(1));
        let discovery =
            UniverseDiscovery::new(binance.clone(), binance, cmc, DiscoveryConfig::default());

        let universe = discovery.discover().await.unwrap();

        // DOGE ranks too high, PEPE is too cheap, OP spiked 90x
        assert_eq!(universe.len(), 1);
        assert_eq!(universe[0].symbol, "ARBUSDT");
        assert_eq!(universe[0].rank, 60);
    }
}
