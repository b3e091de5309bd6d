use anyhow::Result;
use tracing::info;

/// Keys the deals API caches under. Stale once the backfill writes.
pub const DEALS_CACHE_PATTERN: &str = "deals:*";

const SCAN_COUNT: usize = 500;

/// Deletes every key matching `pattern`, walking the keyspace with SCAN so
/// Redis is never blocked by a KEYS call. Returns the number of keys removed.
pub async fn invalidate_pattern(client: &redis::Client, pattern: &str) -> Result<u64> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let mut cursor: u64 = 0;
    let mut removed: u64 = 0;

    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(&mut conn)
            .await?;

        if !keys.is_empty() {
            let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
            removed += deleted;
        }
        if next == 0 {
            break;
        }
        cursor = next;
    }

    info!("Invalidated {removed} cache keys matching {pattern}");
    Ok(removed)
}
