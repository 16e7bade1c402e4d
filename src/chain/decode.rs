//! Decoding for the `OrderFilled` event per the contract in spec §4.4 /
//! §6: `(orderHash, maker, taker, makerAssetId, takerAssetId,
//! makerAmountFilled, takerAmountFilled, fee)`.
//!
//! Grounded on the manual log-slicing approach in
//! `thesSmartApe-polymarket-copy-trading-bot-rust`'s `parse_event`, with
//! `alloy::primitives::U256` replaced by `num_bigint::BigUint` (the
//! teacher's existing big-integer dependency) and raw byte decode done
//! via the `hex` crate rather than a hand-rolled nibble table.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use num_bigint::BigUint;

use crate::fixed_point::{notional_micros, Micros, PriceMicros};

/// A raw log entry as delivered by `eth_subscribe("logs", ...)`.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub removed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletSide {
    Maker,
    Taker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A fully decoded `OrderFilled` log, narrowed to the tracked wallet's
/// perspective.
#[derive(Debug, Clone)]
pub struct DecodedFill {
    pub order_hash: String,
    pub maker: String,
    pub taker: String,
    pub outcome_token_id: Arc<str>,
    pub wallet_side: WalletSide,
    pub trade_side: TradeSide,
    pub usdc_amount_micros: Micros,
    pub token_amount_micros: Micros,
    pub price_micros: PriceMicros,
    pub fee_micros: Micros,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

const COLLATERAL_ASSET_ID: &str = "0";

thread_local! {
    /// Bounded token-id decode cache keyed by the raw 32-byte asset id,
    /// mirroring the copy-trading bot's thread-local `Arc<str>` cache --
    /// avoids re-stringifying the same outcome token on every fill.
    static TOKEN_ID_CACHE: RefCell<HashMap<[u8; 32], Arc<str>>> =
        RefCell::new(HashMap::with_capacity(256));
}

const TOKEN_ID_CACHE_CAP: usize = 2_000;

/// Decode one raw log into a [`DecodedFill`] from the perspective of
/// whichever side (maker/taker) the log's topics identify as the tracked
/// wallet. Returns `None` for malformed payloads, `removed` logs, or
/// logs where neither makerAssetId nor takerAssetId is the collateral id
/// (i.e. not a simple outcome-token trade).
pub fn decode_order_filled(log: &RawLog) -> Option<DecodedFill> {
    if log.removed {
        return None;
    }
    if log.topics.len() < 4 {
        return None;
    }

    let order_hash = log.topics[1].clone();
    let maker = topic_to_address(&log.topics[2])?;
    let taker = topic_to_address(&log.topics[3])?;

    let data = log.data.trim_start_matches("0x");
    if data.len() < 64 * 5 {
        return None;
    }

    let maker_asset_id = hex_word_to_biguint(data, 0)?;
    let taker_asset_id = hex_word_to_biguint(data, 1)?;
    let maker_amount = hex_word_to_biguint(data, 2)?;
    let taker_amount = hex_word_to_biguint(data, 3)?;
    let fee = hex_word_to_biguint(data, 4)?;

    let maker_is_collateral = maker_asset_id == BigUint::from(0u32);
    let taker_is_collateral = taker_asset_id == BigUint::from(0u32);

    // Exactly one side must be the collateral id; a log with neither or
    // both is not a simple outcome-token trade and is dropped.
    let (wallet_side, outcome_asset_bytes, outcome_asset_id, usdc_amount, token_amount) =
        if maker_is_collateral && !taker_is_collateral {
            (WalletSide::Taker, word_bytes(data, 1)?, taker_asset_id, &maker_amount, &taker_amount)
        } else if taker_is_collateral && !maker_is_collateral {
            (WalletSide::Maker, word_bytes(data, 0)?, maker_asset_id, &maker_amount, &taker_amount)
        } else {
            return None;
        };
    let _ = COLLATERAL_ASSET_ID;

    let trade_side = infer_trade_side(wallet_side, maker_is_collateral);

    let usdc_micros = biguint_to_micros(usdc_amount)?;
    let token_micros = biguint_to_micros(token_amount)?;
    if token_micros <= 0 {
        return None;
    }
    let price_micros = (((usdc_micros as i128) * 1_000_000i128) / token_micros as i128) as PriceMicros;

    let outcome_token_id = cache_token_id(&outcome_asset_bytes, &outcome_asset_id);

    Some(DecodedFill {
        order_hash,
        maker,
        taker,
        outcome_token_id,
        wallet_side,
        trade_side,
        usdc_amount_micros: usdc_micros,
        token_amount_micros: token_micros,
        price_micros,
        fee_micros: biguint_to_micros(&fee).unwrap_or(0),
        block_number: log.block_number,
        tx_hash: log.tx_hash.clone(),
        log_index: log.log_index,
    })
}

/// BUY when the tracked wallet's leg is the outcome-token leg (i.e. the
/// *other* party supplied collateral); SELL when the tracked wallet
/// supplied the outcome token and received collateral.
fn infer_trade_side(wallet_side: WalletSide, maker_is_collateral: bool) -> TradeSide {
    match (wallet_side, maker_is_collateral) {
        // Wallet is maker, and maker's leg is collateral -> wallet paid
        // cash, received tokens -> BUY.
        (WalletSide::Maker, true) => TradeSide::Buy,
        // Wallet is maker, maker's leg is the outcome token -> wallet
        // sold tokens for cash -> SELL.
        (WalletSide::Maker, false) => TradeSide::Sell,
        // Wallet is taker; taker's leg is whichever the maker's isn't.
        (WalletSide::Taker, true) => TradeSide::Sell,
        (WalletSide::Taker, false) => TradeSide::Buy,
    }
}

fn topic_to_address(topic: &str) -> Option<String> {
    let clean = topic.trim_start_matches("0x");
    if clean.len() < 40 {
        return None;
    }
    Some(format!("0x{}", &clean[clean.len() - 40..]))
}

/// Extract the raw 32 bytes of the `index`th 32-byte word in a hex data
/// blob (no `0x` prefix).
fn word_bytes(data: &str, index: usize) -> Option<[u8; 32]> {
    let start = index * 64;
    let end = start + 64;
    let slice = data.get(start..end)?;
    let decoded = hex::decode(slice).ok()?;
    decoded.try_into().ok()
}

fn hex_word_to_biguint(data: &str, index: usize) -> Option<BigUint> {
    word_bytes(data, index).map(|bytes| BigUint::from_bytes_be(&bytes))
}

fn biguint_to_micros(value: &BigUint) -> Option<Micros> {
    // On-chain amounts are already 6-decimal USDC/outcome-token units, so
    // no rescaling is needed -- the BigUint *is* the micros value.
    let digits = value.to_u64_digits();
    match digits.len() {
        0 => Some(0),
        1 => Some(digits[0] as Micros),
        _ => value.to_string().parse::<i128>().ok().map(|v| v.min(i64::MAX as i128) as Micros),
    }
}

fn cache_token_id(bytes: &[u8; 32], value: &BigUint) -> Arc<str> {
    TOKEN_ID_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if let Some(s) = cache.get(bytes) {
            return Arc::clone(s);
        }
        if cache.len() >= TOKEN_ID_CACHE_CAP {
            cache.clear();
        }
        let s: Arc<str> = value.to_string().into();
        cache.insert(*bytes, Arc::clone(&s));
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(value: u64) -> String {
        format!("{:064x}", value)
    }

    fn build_log(maker_asset: u64, taker_asset: u64, maker_amt: u64, taker_amt: u64) -> RawLog {
        let data = format!(
            "0x{}{}{}{}{}",
            word(maker_asset),
            word(taker_asset),
            word(maker_amt),
            word(taker_amt),
            word(0)
        );
        RawLog {
            address: "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E".to_string(),
            topics: vec![
                "0xaaaa".to_string(),
                "0xbbbb".to_string(),
                format!("0x{:0>64}", "1111111111111111111111111111111111111111"),
                format!("0x{:0>64}", "2222222222222222222222222222222222222222"),
            ],
            data,
            block_number: 100,
            tx_hash: "0xdeadbeef".to_string(),
            log_index: 0,
            removed: false,
        }
    }

    #[test]
    fn maker_buys_with_collateral_decodes_as_buy() {
        // maker gives 10 USDC (collateral, assetId 0), receives 20 tokens.
        let log = build_log(0, 555, 10_000_000, 20_000_000);
        let fill = decode_order_filled(&log).unwrap();
        assert_eq!(fill.wallet_side, WalletSide::Taker);
        assert_eq!(fill.trade_side, TradeSide::Buy);
        assert_eq!(fill.usdc_amount_micros, 10_000_000);
        assert_eq!(fill.token_amount_micros, 20_000_000);
        assert_eq!(fill.price_micros, 500_000);
    }

    #[test]
    fn taker_sells_tokens_for_collateral_decodes_as_sell() {
        // maker gives 20 tokens (assetId 555), taker gives 10 USDC (collateral).
        let log = build_log(555, 0, 20_000_000, 10_000_000);
        let fill = decode_order_filled(&log).unwrap();
        assert_eq!(fill.wallet_side, WalletSide::Maker);
        assert_eq!(fill.trade_side, TradeSide::Sell);
    }

    #[test]
    fn removed_logs_are_dropped() {
        let mut log = build_log(0, 555, 10_000_000, 20_000_000);
        log.removed = true;
        assert!(decode_order_filled(&log).is_none());
    }

    #[test]
    fn logs_with_neither_leg_as_collateral_are_dropped() {
        let log = build_log(111, 222, 10_000_000, 20_000_000);
        assert!(decode_order_filled(&log).is_none());
    }
}
