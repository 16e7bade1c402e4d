//! On-chain fill detection (C4): raw `eth_subscribe("logs", ...)` over a
//! plain WebSocket, decoding Polymarket `OrderFilled` events without a
//! full Ethereum client crate -- the teacher repo carries no `alloy`/
//! `ethers`/`web3` dependency and neither does this.

pub mod decode;
pub mod fill_subscriber;

pub use decode::{decode_order_filled, DecodedFill, RawLog, TradeSide, WalletSide};
pub use fill_subscriber::{ChainCheckpointStore, FillSubscriber, FillSubscriberConfig};

/// keccak256("OrderFilled(bytes32,address,address,uint256,uint256,uint256,uint256,uint256)")
pub const ORDER_FILLED_TOPIC: &str =
    "0xd0a08e8c493f9c94f29311604c9de1b4e8c8d4c06bd0c789af57f2d65bfec0f6";

/// Legacy CTF exchange.
pub const EXCHANGE_ADDR_LEGACY: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";
/// Neg-risk CTF exchange.
pub const EXCHANGE_ADDR_NEG_RISK: &str = "0xC5d563A36AE78145C45a50134d48A1215220f80a";

/// Zero-pad a 20-byte hex address (with or without `0x`) out to a 32-byte
/// topic value, lower-cased, as required for `eth_subscribe` topic filters.
pub fn address_to_topic(addr: &str) -> String {
    let clean = addr.trim_start_matches("0x").to_lowercase();
    format!("0x{:0>64}", clean)
}
