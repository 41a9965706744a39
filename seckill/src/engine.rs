//! Atomic flash-sale scripts.
//!
//! Campaign state lives entirely in Redis under
//! `seckill:{productId}:{stock|total|price|start|end|users}`; the hot path
//! never touches persistent storage. Both mutations are single Lua scripts,
//! so every check-then-act sequence is atomic: no interleaving of two
//! buyers can oversell or let one user win twice.

use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the flash-sale engine.
#[derive(Error, Debug)]
pub enum SeckillError {
    /// Redis was unreachable or the script failed.
    #[error("flash-sale store error: {0}")]
    Store(String),

    /// No campaign is initialised for the product.
    #[error("no campaign for product {0}")]
    NoCampaign(String),
}

impl From<redis::RedisError> for SeckillError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Outcome of one reserve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Stock decremented, user recorded.
    Won,
    /// Fixed-window budget exceeded.
    RateLimited,
    /// The user already holds a win for this product.
    AlreadyPurchased,
    /// Outside the campaign window (or no campaign).
    NotActive,
    /// Stock is exhausted.
    OutOfStock,
}

impl ReserveOutcome {
    fn parse(raw: &str) -> Result<Self, SeckillError> {
        match raw {
            "OK" => Ok(Self::Won),
            "RATE_LIMITED" => Ok(Self::RateLimited),
            "ALREADY_PURCHASED" => Ok(Self::AlreadyPurchased),
            "NOT_ACTIVE" => Ok(Self::NotActive),
            "OUT_OF_STOCK" => Ok(Self::OutOfStock),
            other => Err(SeckillError::Store(format!(
                "unexpected script result: {other}"
            ))),
        }
    }
}

/// Campaign parameters for the admin init endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSpec {
    /// Product on sale.
    pub product_id: String,
    /// Units available.
    pub stock: i64,
    /// Sale price per unit, in cents.
    pub price: i64,
    /// Window start (unix seconds).
    pub start: i64,
    /// Window end (unix seconds).
    pub end: i64,
}

/// Campaign state for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStatus {
    /// Units still available.
    pub stock_remaining: i64,
    /// Units the campaign started with.
    pub total_stock: i64,
    /// Sale price per unit, in cents.
    #[serde(skip_serializing)]
    pub price: i64,
    /// Whether `now` is inside the window.
    pub is_active: bool,
}

/// The reserve script. Checks run in a fixed order:
/// rate limit, then duplicate, then window, then stock check & decrement.
const RESERVE_SCRIPT: &str = r"
local rate_enabled = ARGV[5] == '1'
if rate_enabled then
    local count = redis.call('INCR', KEYS[1])
    if count == 1 then
        redis.call('EXPIRE', KEYS[1], tonumber(ARGV[4]))
    end
    if count > tonumber(ARGV[3]) then
        return 'RATE_LIMITED'
    end
end

if redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 1 then
    return 'ALREADY_PURCHASED'
end

local start = redis.call('GET', KEYS[4])
local finish = redis.call('GET', KEYS[5])
if not start or not finish then
    return 'NOT_ACTIVE'
end
local now = tonumber(ARGV[2])
if now < tonumber(start) or now > tonumber(finish) then
    return 'NOT_ACTIVE'
end

local stock = tonumber(redis.call('GET', KEYS[2]) or '0')
if stock <= 0 then
    return 'OUT_OF_STOCK'
end
redis.call('DECR', KEYS[2])
redis.call('SADD', KEYS[3], ARGV[1])
return 'OK'
";

/// The release script. Stock is only credited when the user actually held
/// a win, which makes replays of the same release a no-op.
const RELEASE_SCRIPT: &str = r"
local removed = redis.call('SREM', KEYS[2], ARGV[1])
if removed == 1 then
    redis.call('INCRBY', KEYS[1], tonumber(ARGV[2]))
end
return removed
";

fn campaign_key(product_id: &str, field: &str) -> String {
    format!("seckill:{product_id}:{field}")
}

fn rate_key(user_id: &str) -> String {
    format!("seckill:rate:{user_id}")
}

/// The flash-sale reservation engine.
#[derive(Clone)]
pub struct SeckillEngine {
    connection: ConnectionManager,
    reserve: Script,
    release: Script,
    rate_limit: u32,
    rate_window_seconds: u32,
    rate_enabled: bool,
}

impl SeckillEngine {
    /// Connect the engine to Redis.
    ///
    /// # Errors
    ///
    /// [`SeckillError::Store`] on connection failure.
    pub async fn connect(
        url: &str,
        rate_limit: u32,
        rate_window_seconds: u32,
        rate_enabled: bool,
    ) -> Result<Self, SeckillError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::new(connection, rate_limit, rate_window_seconds, rate_enabled))
    }

    /// Build the engine over an existing connection manager.
    #[must_use]
    pub fn new(
        connection: ConnectionManager,
        rate_limit: u32,
        rate_window_seconds: u32,
        rate_enabled: bool,
    ) -> Self {
        Self {
            connection,
            reserve: Script::new(RESERVE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            rate_limit,
            rate_window_seconds,
            rate_enabled,
        }
    }

    /// One atomic reserve attempt.
    ///
    /// # Errors
    ///
    /// [`SeckillError::Store`] when Redis is unreachable.
    pub async fn reserve(
        &self,
        product_id: &str,
        user_id: &str,
        now_unix: i64,
    ) -> Result<ReserveOutcome, SeckillError> {
        let mut connection = self.connection.clone();
        let raw: String = self
            .reserve
            .key(rate_key(user_id))
            .key(campaign_key(product_id, "stock"))
            .key(campaign_key(product_id, "users"))
            .key(campaign_key(product_id, "start"))
            .key(campaign_key(product_id, "end"))
            .arg(user_id)
            .arg(now_unix)
            .arg(self.rate_limit)
            .arg(self.rate_window_seconds)
            .arg(if self.rate_enabled { "1" } else { "0" })
            .invoke_async(&mut connection)
            .await?;
        ReserveOutcome::parse(&raw)
    }

    /// Atomic, idempotent release: removes the user's win (no-op if
    /// absent) and credits the stock back.
    ///
    /// Returns whether a win was actually released.
    ///
    /// # Errors
    ///
    /// [`SeckillError::Store`] when Redis is unreachable.
    pub async fn release(
        &self,
        product_id: &str,
        user_id: &str,
        quantity: i64,
    ) -> Result<bool, SeckillError> {
        let mut connection = self.connection.clone();
        let removed: i64 = self
            .release
            .key(campaign_key(product_id, "stock"))
            .key(campaign_key(product_id, "users"))
            .arg(user_id)
            .arg(quantity.max(1))
            .invoke_async(&mut connection)
            .await?;
        Ok(removed == 1)
    }

    /// Initialise (or re-initialise) a campaign: sets stock, total, price,
    /// and window, and clears the winner set.
    ///
    /// # Errors
    ///
    /// [`SeckillError::Store`] when Redis is unreachable.
    pub async fn init_campaign(&self, spec: &CampaignSpec) -> Result<(), SeckillError> {
        let mut connection = self.connection.clone();
        redis::pipe()
            .atomic()
            .set(campaign_key(&spec.product_id, "stock"), spec.stock)
            .set(campaign_key(&spec.product_id, "total"), spec.stock)
            .set(campaign_key(&spec.product_id, "price"), spec.price)
            .set(campaign_key(&spec.product_id, "start"), spec.start)
            .set(campaign_key(&spec.product_id, "end"), spec.end)
            .del(campaign_key(&spec.product_id, "users"))
            .query_async::<()>(&mut connection)
            .await?;

        tracing::info!(
            product_id = %spec.product_id,
            stock = spec.stock,
            price = spec.price,
            "Flash-sale campaign initialised"
        );
        Ok(())
    }

    /// Campaign status for the public endpoint and the won-event payload.
    ///
    /// # Errors
    ///
    /// [`SeckillError::NoCampaign`] when no campaign exists for the
    /// product.
    pub async fn status(
        &self,
        product_id: &str,
        now_unix: i64,
    ) -> Result<CampaignStatus, SeckillError> {
        let mut connection = self.connection.clone();
        let (stock, total, price, start, end): (
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        ) = redis::cmd("MGET")
            .arg(campaign_key(product_id, "stock"))
            .arg(campaign_key(product_id, "total"))
            .arg(campaign_key(product_id, "price"))
            .arg(campaign_key(product_id, "start"))
            .arg(campaign_key(product_id, "end"))
            .query_async(&mut connection)
            .await?;

        let (Some(total), Some(start), Some(end)) = (total, start, end) else {
            return Err(SeckillError::NoCampaign(product_id.to_string()));
        };

        Ok(CampaignStatus {
            stock_remaining: stock.unwrap_or(0),
            total_stock: total,
            price: price.unwrap_or(0),
            is_active: now_unix >= start && now_unix <= end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_parse_from_script_results() {
        assert_eq!(ReserveOutcome::parse("OK").ok(), Some(ReserveOutcome::Won));
        assert_eq!(
            ReserveOutcome::parse("OUT_OF_STOCK").ok(),
            Some(ReserveOutcome::OutOfStock)
        );
        assert_eq!(
            ReserveOutcome::parse("ALREADY_PURCHASED").ok(),
            Some(ReserveOutcome::AlreadyPurchased)
        );
        assert!(ReserveOutcome::parse("???").is_err());
    }

    #[test]
    fn keys_are_namespaced_per_product() {
        assert_eq!(campaign_key("p-1", "stock"), "seckill:p-1:stock");
        assert_eq!(campaign_key("p-1", "users"), "seckill:p-1:users");
        assert_eq!(rate_key("u-1"), "seckill:rate:u-1");
    }

    #[test]
    fn reserve_script_checks_in_contract_order() {
        // Rate limit first, then duplicate, then window, then stock.
        let rate = RESERVE_SCRIPT.find("RATE_LIMITED").unwrap_or(usize::MAX);
        let dup = RESERVE_SCRIPT.find("ALREADY_PURCHASED").unwrap_or(0);
        let window = RESERVE_SCRIPT.find("NOT_ACTIVE").unwrap_or(0);
        let stock = RESERVE_SCRIPT.find("OUT_OF_STOCK").unwrap_or(0);
        assert!(rate < dup && dup < window && window < stock);
    }

    #[test]
    fn release_script_only_credits_on_actual_removal() {
        // The INCRBY must be conditional on SREM having removed the user,
        // otherwise replayed releases would inflate stock.
        let srem = RELEASE_SCRIPT.find("SREM").unwrap_or(usize::MAX);
        let cond = RELEASE_SCRIPT.find("if removed == 1").unwrap_or(0);
        let incr = RELEASE_SCRIPT.find("INCRBY").unwrap_or(0);
        assert!(srem < cond && cond < incr);
    }
}
