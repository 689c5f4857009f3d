//! OKX orderbook checksum
//!
//! OKX asserts a CRC32 over the top-25 levels of each side after every
//! update. The checksum string interleaves bid and ask pairs level by level
//! (`bid_price:bid_qty:ask_price:ask_qty:...`); when one side has fewer than
//! 25 levels the remaining pairs of the other side are appended in order.
//! The exchange truncates the CRC to a signed 32-bit value.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Number of levels per side covered by the checksum.
const CHECKSUM_DEPTH: usize = 25;

/// Compute the OKX book checksum for the given sides.
///
/// Bids are consumed best-first (highest price), asks best-first (lowest
/// price), matching the order the exchange documents.
pub fn okx_book_checksum(
    bids: &BTreeMap<Decimal, Decimal>,
    asks: &BTreeMap<Decimal, Decimal>,
) -> i32 {
    let mut bid_iter = bids.iter().rev().take(CHECKSUM_DEPTH);
    let mut ask_iter = asks.iter().take(CHECKSUM_DEPTH);

    let mut parts: Vec<String> = Vec::with_capacity(CHECKSUM_DEPTH * 4);
    loop {
        let bid = bid_iter.next();
        let ask = ask_iter.next();
        if bid.is_none() && ask.is_none() {
            break;
        }
        if let Some((price, qty)) = bid {
            parts.push(price.to_string());
            parts.push(qty.to_string());
        }
        if let Some((price, qty)) = ask {
            parts.push(price.to_string());
            parts.push(qty.to_string());
        }
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(parts.join(":").as_bytes());
    hasher.finalize() as i32
}
