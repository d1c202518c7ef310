//! Stream key builders.
//!
//! A stream key names one logical feed on a combined-stream socket, for
//! example `btcusdt@depth@100ms`. Spot and futures keys use lowercase
//! symbols; options symbols are kept as given.

use crate::network::MarketFamily;

/// Book levels carried by each options depth event
pub const OPTIONS_DEPTH_LEVELS: u32 = 100;

fn symbol_for(family: MarketFamily, symbol: &str) -> String {
    match family {
        MarketFamily::Options => symbol.to_string(),
        _ => symbol.to_lowercase(),
    }
}

/// Diff depth stream used by the order book cache.
///
/// Options have no diff stream; their key is a full top-N book refresh.
pub fn depth_stream(family: MarketFamily, symbol: &str, speed_ms: u64) -> String {
    let symbol = symbol_for(family, symbol);
    match family {
        MarketFamily::Options => format!("{}@depth{}@{}ms", symbol, OPTIONS_DEPTH_LEVELS, speed_ms),
        _ if speed_ms >= 1000 => format!("{}@depth", symbol),
        _ => format!("{}@depth@{}ms", symbol, speed_ms),
    }
}

/// Partial book depth stream (top `levels` levels)
pub fn partial_depth_stream(family: MarketFamily, symbol: &str, levels: u32) -> String {
    format!("{}@depth{}", symbol_for(family, symbol), levels)
}

pub fn trade_stream(family: MarketFamily, symbol: &str) -> String {
    format!("{}@trade", symbol_for(family, symbol))
}

pub fn agg_trade_stream(family: MarketFamily, symbol: &str) -> String {
    format!("{}@aggTrade", symbol_for(family, symbol))
}

/// Kline stream, e.g. `btcusdt@kline_1m`
pub fn kline_stream(family: MarketFamily, symbol: &str, interval: &str) -> String {
    format!("{}@kline_{}", symbol_for(family, symbol), interval)
}

pub fn book_ticker_stream(family: MarketFamily, symbol: &str) -> String {
    format!("{}@bookTicker", symbol_for(family, symbol))
}

pub fn ticker_stream(family: MarketFamily, symbol: &str) -> String {
    format!("{}@ticker", symbol_for(family, symbol))
}

pub fn mini_ticker_stream(family: MarketFamily, symbol: &str) -> String {
    format!("{}@miniTicker", symbol_for(family, symbol))
}

/// Futures mark price stream
pub fn mark_price_stream(family: MarketFamily, symbol: &str) -> String {
    format!("{}@markPrice", symbol_for(family, symbol))
}

/// Market-wide mini ticker stream
pub fn all_mini_tickers_stream() -> String {
    "!miniTicker@arr".to_string()
}
