//! Server-side scripts executed atomically by Redis

/// Flash-sale admission.
///
/// KEYS: stock, window, buyers, order stream
/// ARGV: buyer id, coupon id, now (ms), admission token, buyer-set retention (ms)
///
/// Returns 0 admitted, 1 sold out, 2 duplicate, 3 not yet open, 4 closed,
/// 5 coupon state missing.
pub const ADMIT: &str = r#"
local window = redis.call('HMGET', KEYS[2], 'begin', 'end')
if not window[1] or not window[2] then
    return 5
end
local begin_ms = tonumber(window[1])
local end_ms = tonumber(window[2])
local now = tonumber(ARGV[3])
if now < begin_ms then
    return 3
end
if now >= end_ms then
    return 4
end

local stock = tonumber(redis.call('GET', KEYS[1]) or '0')
if stock <= 0 then
    return 1
end

if redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 1 then
    return 2
end

redis.call('DECR', KEYS[1])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('PEXPIREAT', KEYS[3], end_ms + tonumber(ARGV[5]))
redis.call('XADD', KEYS[4], '*', 'buyerId', ARGV[1], 'couponId', ARGV[2], 'token', ARGV[4])
return 0
"#;

/// Seed window + stock for a coupon.
///
/// KEYS: stock, window, buyers
/// ARGV: begin (ms), end (ms), stock, expire-at (ms), overwrite flag ("1"/"0")
pub const SEED_COUPON: &str = r#"
if ARGV[5] ~= '1' and redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
if ARGV[5] == '1' then
    redis.call('DEL', KEYS[3])
end
redis.call('HSET', KEYS[2], 'begin', ARGV[1], 'end', ARGV[2])
redis.call('SET', KEYS[1], ARGV[3])
redis.call('PEXPIREAT', KEYS[1], ARGV[4])
redis.call('PEXPIREAT', KEYS[2], ARGV[4])
return 1
"#;

/// KEYS: stock, window. ARGV: amount. Returns the new stock or -1 when unseeded.
pub const RESTOCK: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 0 then
    return -1
end
return redis.call('INCRBY', KEYS[1], ARGV[1])
"#;

/// KEYS: lock key. ARGV: owner token.
pub const UNLOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// KEYS: lock key. ARGV: owner token, ttl (ms).
pub const EXTEND_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Add to a filter and to every rebuild staged for it.
///
/// KEYS: filter, set of staging keys. ARGV: items.
/// Returns how many items were new to the filter.
pub const BLOOM_ADD: &str = r#"
local flags = redis.call('BF.MADD', KEYS[1], unpack(ARGV))
for _, staging in ipairs(redis.call('SMEMBERS', KEYS[2])) do
    if redis.call('EXISTS', staging) == 1 then
        redis.call('BF.MADD', staging, unpack(ARGV))
    else
        redis.call('SREM', KEYS[2], staging)
    end
end
local added = 0
for _, flag in ipairs(flags) do
    if flag == 1 then
        added = added + 1
    end
end
return added
"#;

/// Swap a staged filter in. RENAME keeps the staging TTL, so it is cleared.
///
/// KEYS: staging, filter, set of staging keys.
/// Returns 1 when swapped, 0 when the staging filter had expired.
pub const BLOOM_COMMIT: &str = r#"
redis.call('SREM', KEYS[3], KEYS[1])
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('RENAME', KEYS[1], KEYS[2])
redis.call('PERSIST', KEYS[2])
return 1
"#;

/// KEYS: stream. ARGV: group, entry id. Deletes the entry only when this
/// call acknowledged it.
pub const ACK_AND_DELETE: &str = r#"
local acked = redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
if acked == 1 then
    redis.call('XDEL', KEYS[1], ARGV[2])
end
return acked
"#;
