//! Human-readable result stream, written once after sealing.
//!
//! Walks the sorted price chain top-down and marks every bid:
//! `✔` winning, `✘` losing, `✂` superseded by a later bid from the same
//! bidder. Prefixed by a summary block with the clearing statistics.

use chrono::{DateTime, Utc};
use std::io::{self, Write};

use crate::engine::config::local_offset;
use crate::engine::store::{Bid, Store};

pub fn dump_all<W: Write>(out: &mut W, store: &Store) -> io::Result<()> {
    let Some(tail) = store.tail_bid() else {
        writeln!(out, "*** no tail bid")?;
        return Ok(());
    };

    let rows = store.price_rows();
    let capacity = store.capacity();

    let mut success = 0u32;
    let mut total_price = 0u64;
    for row in &rows {
        for bid in &row.bids {
            if bid.active && success < capacity {
                success += 1;
                total_price += bid.price as u64;
            }
        }
    }

    // Clearing-block counters: deals at the clearing price, and the
    // within-second tally used as the public tie-breaker.
    let mut min_price_deals = 0u32;
    let mut last_second_bids = 0u32;
    let mut last_second_deals = 0u32;
    let mut min_price_valid = 0u64;
    if let Some(row) = rows.iter().find(|r| r.price == tail.price) {
        min_price_valid = row.valid;
        for bid in &row.bids {
            let wins = bid.time < tail.time || is_same_bid(bid, &tail);
            if wins {
                min_price_deals += 1;
            }
            if unix_second(bid.time) == unix_second(tail.time) {
                last_second_bids += 1;
                if wins {
                    last_second_deals += 1;
                }
            }
        }
    }

    writeln!(out, "=============================")?;
    writeln!(
        out,
        "AVG PRICE {:.2}",
        total_price as f64 / success.max(1) as f64
    )?;
    writeln!(out, "MIN PRICE {}", tail.price)?;
    writeln!(
        out,
        "TAIL BID {} @ {} No. {}",
        tail.price,
        fmt_time_secs(tail.time),
        last_second_deals
    )?;
    writeln!(out, "MIN PRICE BIDS {min_price_valid}")?;
    writeln!(out, "MIN PRICE DEALS {min_price_deals}")?;
    writeln!(out, "MIN PRICE LAST SECOND BIDS {last_second_bids}")?;
    writeln!(out, "MIN PRICE LAST SECOND DEALS {last_second_deals}")?;
    writeln!(out, "=============================")?;
    writeln!(out)?;

    writeln!(out, "=============Dump=============")?;
    let mut success = 0u32;
    for row in &rows {
        writeln!(
            out,
            "====Batch {:>5} {:>6} {:>6}====",
            row.price, row.total, row.valid
        )?;
        for bid in &row.bids {
            let mark = if !bid.active {
                "✂"
            } else if success < capacity {
                success += 1;
                "✔"
            } else {
                "✘"
            };
            writeln!(
                out,
                "{}   {}  {:>5}    {}",
                fmt_time_micros(bid.time),
                bid.client,
                bid.price,
                mark
            )?;
        }
    }
    writeln!(out, "=============================")?;
    Ok(())
}

/// Bid identity without serials: (client, sequence) is unique per bid.
fn is_same_bid(a: &Bid, b: &Bid) -> bool {
    a.client == b.client && a.sequence == b.sequence
}

fn unix_second(t: Option<DateTime<Utc>>) -> i64 {
    t.map(|t| t.timestamp()).unwrap_or(0)
}

fn fmt_time_secs(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.with_timezone(&local_offset()).format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

fn fmt_time_micros(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| {
        t.with_timezone(&local_offset())
            .format("%H:%M:%S%.6f")
            .to_string()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn dump_marks_every_outcome() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let store = Store::new(2);
        let mut t = base;
        for (client, price, sequence) in [(1, 5, 1), (2, 3, 1), (3, 2, 1), (1, 6, 2)] {
            store.add(Bid {
                serial: 0,
                client,
                price,
                time: Some(t),
                sequence,
                active: true,
            });
            t += Duration::seconds(1);
        }
        store.sort_all_blocks();
        store.judge();

        let mut buffer = Vec::new();
        dump_all(&mut buffer, &store).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("AVG PRICE 4.50"), "{text}");
        assert!(text.contains("MIN PRICE 3"), "{text}");
        assert!(text.contains('✔'));
        assert!(text.contains('✘'));
        assert!(text.contains('✂'));
    }

    #[test]
    fn dump_without_tail_notes_it() {
        let store = Store::new(3);
        let mut buffer = Vec::new();
        dump_all(&mut buffer, &store).unwrap();
        assert!(String::from_utf8(buffer).unwrap().contains("no tail bid"));
    }
}
