//! Time-series store over SQLite: append-only OHLCV, indicator, and
//! order-book measurements with the window queries the risk core
//! needs.

use crate::domain::ports::{MarketStore, OhlcvPoint, OrderBookTop};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::{Row, SqlitePool};

/// Sample standard deviation; `None` below two points.
pub fn sample_stddev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

pub struct SqliteMarketStore {
    pool: SqlitePool,
}

impl SqliteMarketStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one order-book top-of-book snapshot.
    pub async fn write_orderbook(
        &self,
        symbol: &str,
        exchange: &str,
        timestamp: DateTime<Utc>,
        top: &OrderBookTop,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO orderbook (
                symbol, exchange, ts_ms, bid_price, bid_volume,
                ask_price, ask_volume, spread
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(exchange)
        .bind(timestamp.timestamp_millis())
        .bind(top.bid_price)
        .bind(top.bid_volume)
        .bind(top.ask_price)
        .bind(top.ask_volume)
        .bind(top.spread)
        .execute(&self.pool)
        .await
        .context("Failed to write orderbook point")?;
        Ok(())
    }
}

#[async_trait]
impl MarketStore for SqliteMarketStore {
    async fn write_ohlcv(&self, point: &OhlcvPoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO ohlcv (
                symbol, exchange, interval, ts_ms, open, high, low, close, volume
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&point.symbol)
        .bind(&point.exchange)
        .bind(&point.interval)
        .bind(point.timestamp.timestamp_millis())
        .bind(point.open)
        .bind(point.high)
        .bind(point.low)
        .bind(point.close)
        .bind(point.volume)
        .execute(&self.pool)
        .await
        .context("Failed to write ohlcv point")?;
        Ok(())
    }

    async fn write_indicator(
        &self,
        symbol: &str,
        name: &str,
        timestamp: DateTime<Utc>,
        value: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO indicators (symbol, name, ts_ms, value)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(name)
        .bind(timestamp.timestamp_millis())
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to write indicator point")?;
        Ok(())
    }

    async fn last_close(&self, symbol: &str, window: Duration) -> Result<Option<f64>> {
        let cutoff = (Utc::now() - window).timestamp_millis();
        let row = sqlx::query(
            r#"
            SELECT close FROM ohlcv
            WHERE symbol = ? AND ts_ms >= ?
            ORDER BY ts_ms DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("close")?),
            None => None,
        })
    }

    async fn last_indicator(
        &self,
        symbol: &str,
        name: &str,
        window: Duration,
    ) -> Result<Option<f64>> {
        let cutoff = (Utc::now() - window).timestamp_millis();
        let row = sqlx::query(
            r#"
            SELECT value FROM indicators
            WHERE symbol = ? AND name = ? AND ts_ms >= ?
            ORDER BY ts_ms DESC
            LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(name)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    async fn close_stddev(&self, symbol: &str, window: Duration) -> Result<Option<f64>> {
        let cutoff = (Utc::now() - window).timestamp_millis();
        let rows = sqlx::query(
            r#"
            SELECT close FROM ohlcv
            WHERE symbol = ? AND ts_ms >= ?
            ORDER BY ts_ms
            "#,
        )
        .bind(symbol)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut closes = Vec::with_capacity(rows.len());
        for row in rows {
            closes.push(row.try_get::<f64, _>("close")?);
        }
        Ok(sample_stddev(&closes))
    }

    async fn ohlcv_range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OhlcvPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ohlcv
            WHERE symbol = ? AND ts_ms >= ? AND ts_ms <= ?
            ORDER BY ts_ms
            "#,
        )
        .bind(symbol)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: i64 = row.try_get("ts_ms")?;
            points.push(OhlcvPoint {
                symbol: row.try_get("symbol")?,
                exchange: row.try_get("exchange")?,
                interval: row.try_get("interval")?,
                timestamp: Utc
                    .timestamp_millis_opt(ts)
                    .single()
                    .unwrap_or_else(Utc::now),
                open: row.try_get("open")?,
                high: row.try_get("high")?,
                low: row.try_get("low")?,
                close: row.try_get("close")?,
                volume: row.try_get("volume")?,
            });
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::Database;

    #[test]
    fn test_sample_stddev() {
        assert_eq!(sample_stddev(&[]), None);
        assert_eq!(sample_stddev(&[1.0]), None);
        let sd = sample_stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.13808993).abs() < 1e-6);
    }

    fn point(symbol: &str, offset_secs: i64, close: f64) -> OhlcvPoint {
        OhlcvPoint {
            symbol: symbol.to_string(),
            exchange: "binance".to_string(),
            interval: "1m".to_string(),
            timestamp: Utc::now() - Duration::seconds(offset_secs),
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 10.0,
        }
    }

    #[tokio::test]
    async fn test_last_close_respects_window() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteMarketStore::new(db.pool.clone());

        store.write_ohlcv(&point("BTC/USDT", 7200, 49000.0)).await.unwrap();
        store.write_ohlcv(&point("BTC/USDT", 60, 50000.0)).await.unwrap();

        let close = store
            .last_close("BTC/USDT", Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(close, Some(50000.0));

        // Nothing fresh for an unknown symbol.
        assert_eq!(
            store.last_close("ETH/USDT", Duration::hours(1)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_last_indicator() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteMarketStore::new(db.pool.clone());

        store
            .write_indicator("BTC/USDT", "atr", Utc::now() - Duration::minutes(5), 950.0)
            .await
            .unwrap();
        store
            .write_indicator("BTC/USDT", "atr", Utc::now(), 1000.0)
            .await
            .unwrap();

        let atr = store
            .last_indicator("BTC/USDT", "atr", Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(atr, Some(1000.0));

        let stale = store
            .last_indicator("BTC/USDT", "rsi", Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stale, None);
    }

    #[tokio::test]
    async fn test_orderbook_snapshot_write() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteMarketStore::new(db.pool.clone());

        store
            .write_orderbook(
                "BTC/USDT",
                "binance",
                Utc::now(),
                &OrderBookTop {
                    bid_price: 49990.0,
                    bid_volume: 1.5,
                    ask_price: 50010.0,
                    ask_volume: 0.8,
                    spread: 20.0,
                },
            )
            .await
            .unwrap();

        let row = sqlx::query("SELECT spread FROM orderbook WHERE symbol = 'BTC/USDT'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.try_get::<f64, _>("spread").unwrap(), 20.0);
    }

    #[tokio::test]
    async fn test_close_stddev_and_range() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteMarketStore::new(db.pool.clone());

        for (i, close) in [100.0, 102.0, 104.0, 98.0].iter().enumerate() {
            store
                .write_ohlcv(&point("BTC/USDT", 300 - i as i64 * 60, *close))
                .await
                .unwrap();
        }

        let sd = store
            .close_stddev("BTC/USDT", Duration::hours(1))
            .await
            .unwrap()
            .unwrap();
        assert!(sd > 0.0);

        let range = store
            .ohlcv_range(
                "BTC/USDT",
                Utc::now() - Duration::hours(1),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(range.len(), 4);
        // Range comes back in time order.
        assert!(range.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
