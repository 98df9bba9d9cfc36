use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::binance::{millis, parse_num};
use super::BarFeed;
use crate::models::Bar;
use crate::Result;

const CHANNEL_CAPACITY: usize = 1024;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct CombinedFrame {
    #[allow(dead_code)]
    stream: String,
    data: KlineEvent,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q")]
    quote_volume: String,
    #[serde(rename = "V")]
    buy_volume: String,
    #[serde(rename = "x")]
    is_final: bool,
}

/// Binance futures kline websocket, one combined stream for the whole universe
#[derive(Debug, Clone)]
pub struct BinanceKlineFeed {
    ws_base_url: String,
    final_bars_only: bool,
}

impl BinanceKlineFeed {
    pub fn new(ws_base_url: impl Into<String>, final_bars_only: bool) -> Self {
        Self {
            ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
            final_bars_only,
        }
    }

    fn stream_url(&self, symbols: &[String], interval: &str) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@kline_{}", s.to_lowercase(), interval))
            .collect();
        format!("{}/stream?streams={}", self.ws_base_url, streams.join("/"))
    }

    /// Connect, forward bars, reconnect with backoff until the receiver goes away
    async fn run(self, url: String, tx: mpsc::Sender<Bar>) {
        let mut retry_delay = Duration::from_secs(1);

        loop {
            match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    tracing::info!("✅ Kline stream connected");
                    retry_delay = Duration::from_secs(1);
                    let (_, mut read) = ws_stream.split();

                    while let Some(message) = read.next().await {
                        let message = match message {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::warn!("Kline stream error: {}", e);
                                break;
                            }
                        };
                        let Some(bar) = self.handle_message(&message) else {
                            continue;
                        };
                        if tx.send(bar).await.is_err() {
                            tracing::info!("Bar receiver dropped, closing kline stream");
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!("Kline stream connect error: {}", e),
            }

            if tx.is_closed() {
                return;
            }
            tracing::info!("Kline stream reconnecting in {}s", retry_delay.as_secs());
            sleep(retry_delay).await;
            retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    fn handle_message(&self, message: &Message) -> Option<Bar> {
        if !message.is_text() {
            return None;
        }
        let text = message.to_text().ok()?;
        match parse_kline_frame(text) {
            Ok(Some(bar)) if bar.is_final || !self.final_bars_only => Some(bar),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Dropping kline frame: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl BarFeed for BinanceKlineFeed {
    async fn subscribe(&self, symbols: &[String], interval: &str) -> Result<mpsc::Receiver<Bar>> {
        let url = self.stream_url(symbols, interval);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tracing::info!(
            "👁️ Subscribing to {} pairs on {} bars",
            symbols.len(),
            interval
        );
        tokio::spawn(self.clone().run(url, tx));

        Ok(rx)
    }
}

/// Parse one combined-stream frame; `Ok(None)` for non-kline events
fn parse_kline_frame(text: &str) -> Result<Option<Bar>> {
    let frame: CombinedFrame = serde_json::from_str(text)
        .map_err(|e| crate::BotError::Data(format!("invalid kline frame: {}", e)))?;
    if frame.data.event_type != "kline" {
        return Ok(None);
    }

    let k = frame.data.kline;
    let bar = Bar {
        open_time: millis(k.open_time)?,
        open: parse_num("open", &k.open)?,
        high: parse_num("high", &k.high)?,
        low: parse_num("low", &k.low)?,
        close: parse_num("close", &k.close)?,
        volume: parse_num("volume", &k.volume)?,
        buy_volume: parse_num("buy_volume", &k.buy_volume)?,
        quote_volume: parse_num("quote_volume", &k.quote_volume)?,
        close_time: millis(k.close_time)?,
        is_final: k.is_final,
        symbol: k.symbol,
    };

    bar.validate().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: &str = r#"{
        "stream": "btcusdt@kline_1m",
        "data": {
            "e": "kline", "E": 1700000060001, "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000059999, "s": "BTCUSDT", "i": "1m",
                "f": 1, "L": 2, "o": "100.0", "c": "101.5", "h": "102.0", "l": "99.5",
                "v": "12.0", "n": 40, "x": true, "q": "1212.0", "V": "7.0", "Q": "707.0", "B": "0"
            }
        }
    }"#;

    #[test]
    fn test_stream_url() {
        let feed = BinanceKlineFeed::new("wss://fstream.binance.com/", true);
        let url = feed.stream_url(&["BTCUSDT".into(), "ETHUSDT".into()], "1m");
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@kline_1m/ethusdt@kline_1m"
        );
    }

    #[test]
    fn test_parse_kline_frame() {
        let bar = parse_kline_frame(FRAME).unwrap().unwrap();
        assert_eq!(bar.symbol, "BTCUSDT");
        assert_eq!(bar.close, 101.5);
        assert_eq!(bar.quote_volume, 1212.0);
        assert_eq!(bar.buy_volume, 7.0);
        assert!(bar.is_final);
        assert_eq!(bar.close_time.timestamp_millis(), 1700000059999);
    }

    #[test]
    fn test_malformed_frame_rejected() {
        let bad = FRAME.replace(r#""h": "102.0""#, r#""h": "98.0""#);
        assert!(parse_kline_frame(&bad).is_err());
        assert!(parse_kline_frame("not json").is_err());
    }

    #[test]
    fn test_forming_bar_filtered() {
        let forming = FRAME.replace(r#""x": true"#, r#""x": false"#);
        let message = Message::text(forming);

        let strict = BinanceKlineFeed::new("wss://x", true);
        assert!(strict.handle_message(&message).is_none());

        let loose = BinanceKlineFeed::new("wss://x", false);
        assert!(loose.handle_message(&message).is_some());
    }
}
