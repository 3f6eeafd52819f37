//! Signal-feed frame decoding.
//!
//! Frames are MessagePack maps of the shape
//!
//! ```text
//! { "<pair>" | "<pair>-perp":
//!     { "<venue>": [ [bids_map, asks_map], latency_ms, last_update_ts_ms ], ... }, ... }
//! ```
//!
//! where `bids_map`/`asks_map` map prices (string or numeric keys) to the
//! USDT notional resting at the level. A frame may carry any number of
//! pairs. Malformed venue entries are skipped; only an unreadable top level
//! is an error.

use anyhow::{anyhow, Result};
use rmpv::Value;

/// One venue's delta set from a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueUpdate {
    pub venue: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub latency_ms: f64,
    pub last_update_ts_ms: i64,
}

/// All venue updates for one pair topic in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PairUpdate {
    pub topic: String,
    pub venues: Vec<VenueUpdate>,
}

/// Decode a raw frame into per-topic venue updates.
pub fn decode_frame(raw: &[u8]) -> Result<Vec<PairUpdate>> {
    let mut cursor = raw;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| anyhow!("not a msgpack value: {e}"))?;

    let Value::Map(pairs) = value else {
        return Err(anyhow!("frame top level is not a map"));
    };

    let mut updates = Vec::with_capacity(pairs.len());
    for (topic_key, venues_value) in pairs {
        let Some(topic) = topic_key.as_str() else {
            continue;
        };
        let Value::Map(venues) = venues_value else {
            continue;
        };

        let mut parsed = Vec::with_capacity(venues.len());
        for (venue_key, venue_value) in venues {
            let Some(venue) = venue_key.as_str() else {
                continue;
            };
            if let Some(update) = parse_venue_entry(venue, &venue_value) {
                parsed.push(update);
            }
        }

        updates.push(PairUpdate {
            topic: topic.to_string(),
            venues: parsed,
        });
    }

    Ok(updates)
}

/// `[[bids_map, asks_map], latency_ms, last_update_ts_ms]`
fn parse_venue_entry(venue: &str, value: &Value) -> Option<VenueUpdate> {
    let Value::Array(items) = value else {
        return None;
    };
    if items.len() < 3 {
        return None;
    }

    let Value::Array(sides) = &items[0] else {
        return None;
    };
    if sides.len() < 2 {
        return None;
    }

    let bids = parse_side(&sides[0]);
    let asks = parse_side(&sides[1]);
    let latency_ms = items[1].as_f64()?;
    let last_update_ts_ms = items[2].as_i64().or_else(|| items[2].as_f64().map(|f| f as i64))?;

    Some(VenueUpdate {
        venue: venue.to_string(),
        bids,
        asks,
        latency_ms,
        last_update_ts_ms,
    })
}

/// Price→notional map with string or numeric price keys. Non-positive or
/// unparsable prices are dropped; an empty or missing map is fine.
fn parse_side(value: &Value) -> Vec<(f64, f64)> {
    let Value::Map(entries) = value else {
        return Vec::new();
    };

    let mut levels = Vec::with_capacity(entries.len());
    for (key, val) in entries {
        let price = match key {
            Value::String(s) => s.as_str().and_then(|s| s.parse::<f64>().ok()),
            other => other.as_f64(),
        };
        let Some(price) = price else { continue };
        if price <= 0.0 {
            continue;
        }
        let Some(notional) = val.as_f64() else { continue };
        levels.push((price, notional));
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    fn side(levels: &[(&str, f64)]) -> Value {
        Value::Map(
            levels
                .iter()
                .map(|(p, n)| (Value::from(*p), Value::from(*n)))
                .collect(),
        )
    }

    fn venue_entry(bids: Value, asks: Value, latency: f64, ts: i64) -> Value {
        Value::Array(vec![
            Value::Array(vec![bids, asks]),
            Value::from(latency),
            Value::from(ts),
        ])
    }

    #[test]
    fn decodes_single_pair_single_venue() {
        let frame = Value::Map(vec![(
            Value::from("doge-usdt"),
            Value::Map(vec![(
                Value::from("okx"),
                venue_entry(
                    side(&[("0.2360", 55.0)]),
                    side(&[("0.2363", 40.0)]),
                    12.5,
                    1_700_000_000_000,
                ),
            )]),
        )]);

        let updates = decode_frame(&encode(&frame)).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].topic, "doge-usdt");
        let venue = &updates[0].venues[0];
        assert_eq!(venue.venue, "okx");
        assert_eq!(venue.bids, vec![(0.2360, 55.0)]);
        assert_eq!(venue.asks, vec![(0.2363, 40.0)]);
        assert_eq!(venue.latency_ms, 12.5);
        assert_eq!(venue.last_update_ts_ms, 1_700_000_000_000);
    }

    #[test]
    fn accepts_numeric_price_keys() {
        let bids = Value::Map(vec![(Value::from(0.2360f64), Value::from(55.0f64))]);
        let frame = Value::Map(vec![(
            Value::from("doge-usdt-perp"),
            Value::Map(vec![(
                Value::from("binance"),
                venue_entry(bids, side(&[]), 8.0, 1),
            )]),
        )]);

        let updates = decode_frame(&encode(&frame)).unwrap();
        assert_eq!(updates[0].venues[0].bids, vec![(0.2360, 55.0)]);
    }

    #[test]
    fn multiple_pairs_in_one_frame() {
        let frame = Value::Map(vec![
            (
                Value::from("xrp-usdt"),
                Value::Map(vec![(
                    Value::from("okx"),
                    venue_entry(side(&[("0.51", 30.0)]), side(&[]), 5.0, 2),
                )]),
            ),
            (
                Value::from("xrp-usdt-perp"),
                Value::Map(vec![(
                    Value::from("bitget"),
                    venue_entry(side(&[]), side(&[("0.52", 25.0)]), 6.0, 3),
                )]),
            ),
        ]);

        let updates = decode_frame(&encode(&frame)).unwrap();
        let topics: Vec<&str> = updates.iter().map(|u| u.topic.as_str()).collect();
        assert_eq!(topics, vec!["xrp-usdt", "xrp-usdt-perp"]);
    }

    #[test]
    fn malformed_venue_entry_is_skipped() {
        let frame = Value::Map(vec![(
            Value::from("ada-usdt"),
            Value::Map(vec![
                (Value::from("broken"), Value::Array(vec![Value::from(1)])),
                (
                    Value::from("okx"),
                    venue_entry(side(&[("0.33", 10.0)]), side(&[]), 4.0, 9),
                ),
            ]),
        )]);

        let updates = decode_frame(&encode(&frame)).unwrap();
        assert_eq!(updates[0].venues.len(), 1);
        assert_eq!(updates[0].venues[0].venue, "okx");
    }

    #[test]
    fn non_positive_prices_are_dropped() {
        let bids = Value::Map(vec![
            (Value::from("0"), Value::from(10.0f64)),
            (Value::from("-1.5"), Value::from(10.0f64)),
            (Value::from("0.5"), Value::from(10.0f64)),
        ]);
        let frame = Value::Map(vec![(
            Value::from("ada-usdt"),
            Value::Map(vec![(
                Value::from("okx"),
                venue_entry(bids, side(&[]), 1.0, 1),
            )]),
        )]);

        let updates = decode_frame(&encode(&frame)).unwrap();
        assert_eq!(updates[0].venues[0].bids, vec![(0.5, 10.0)]);
    }

    #[test]
    fn zero_notional_levels_survive_decoding() {
        // Zero means "delete this level" downstream, so the codec keeps it.
        let frame = Value::Map(vec![(
            Value::from("ada-usdt"),
            Value::Map(vec![(
                Value::from("okx"),
                venue_entry(side(&[("0.33", 0.0)]), side(&[]), 1.0, 1),
            )]),
        )]);

        let updates = decode_frame(&encode(&frame)).unwrap();
        assert_eq!(updates[0].venues[0].bids, vec![(0.33, 0.0)]);
    }

    #[test]
    fn garbage_frame_is_an_error() {
        let not_a_map = encode(&Value::Array(vec![Value::from(1)]));
        assert!(decode_frame(&not_a_map).is_err());
        assert!(decode_frame(&[]).is_err());
    }
}
