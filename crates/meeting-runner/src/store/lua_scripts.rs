//! Lua scripts for version-checked meeting writes.
//!
//! Each script runs atomically inside Redis: every precondition is checked
//! before the first write, so a rejected commit leaves no partial state.

/// Create a meeting if it does not exist.
///
/// Arguments:
/// - KEYS[1]: Version key (`meeting:{id}:version`)
/// - KEYS[2]: Record key (`meeting:{id}:record`)
/// - KEYS[3]: Attendance hash (`meeting:{id}:attendance`)
/// - ARGV[1]: Meeting JSON
/// - ARGV[2..]: Attendance user id / JSON pairs
///
/// Returns:
/// - 1: Created
/// - 0: Already exists
pub const CREATE_MEETING: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end

redis.call('SET', KEYS[1], 0)
redis.call('SET', KEYS[2], ARGV[1])
for i = 2, #ARGV, 2 do
    redis.call('HSET', KEYS[3], ARGV[i], ARGV[i+1])
end
return 1
"#;

/// Commit one batch if the meeting version matches.
///
/// Arguments:
/// - KEYS[1]: Version key
/// - KEYS[2]: Record key
/// - KEYS[3]: Turn log hash (`meeting:{id}:turn_logs`)
/// - KEYS[4]: Turn log order list (`meeting:{id}:turn_log_order`)
/// - KEYS[5]: Attendance hash
/// - KEYS[6]: Feedback hash (`meeting:{id}:feedback`)
/// - KEYS[7..]: One stretch goal hash per goal (`user:{owner}:stretch_goals`)
/// - ARGV[1]: Expected version
/// - ARGV[2]: Meeting JSON (version already set to expected + 1)
/// - ARGV[3..6]: Counts of turn logs, attendees, goals, feedback
/// - ARGV[7..]: id / JSON pairs in that order
///
/// Returns `{status, value}`:
/// - `{1, new_version}`: Committed
/// - `{0, current_version}`: Version conflict
/// - `{-2, n}`: n-th turn log (1-based) would overwrite a finalized log
/// - `{-3, 0}`: Meeting does not exist
/// - `{-1, 0}`: Malformed arguments
pub const COMMIT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 0 then
    return {-3, 0}
end

local expected = tonumber(ARGV[1])
local n_logs = tonumber(ARGV[3])
local n_att = tonumber(ARGV[4])
local n_goals = tonumber(ARGV[5])
local n_feedback = tonumber(ARGV[6])
if expected == nil or n_logs == nil or n_att == nil or n_goals == nil or n_feedback == nil then
    return {-1, 0}
end

local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current == nil then
    return {-1, 0}
end
if current ~= expected then
    return {0, current}
end

-- Finalized turn logs are immutable
local idx = 7
for i = 1, n_logs do
    local existing = redis.call('HGET', KEYS[3], ARGV[idx])
    if existing then
        local decoded = cjson.decode(existing)
        if decoded['end_time'] ~= nil and decoded['end_time'] ~= cjson.null then
            return {-2, i}
        end
    end
    idx = idx + 2
end

local new_version = current + 1
redis.call('SET', KEYS[1], new_version)
redis.call('SET', KEYS[2], ARGV[2])

idx = 7
for i = 1, n_logs do
    if redis.call('HEXISTS', KEYS[3], ARGV[idx]) == 0 then
        redis.call('RPUSH', KEYS[4], ARGV[idx])
    end
    redis.call('HSET', KEYS[3], ARGV[idx], ARGV[idx + 1])
    idx = idx + 2
end
for i = 1, n_att do
    redis.call('HSET', KEYS[5], ARGV[idx], ARGV[idx + 1])
    idx = idx + 2
end
for i = 1, n_goals do
    redis.call('HSET', KEYS[6 + i], ARGV[idx], ARGV[idx + 1])
    idx = idx + 2
end
for i = 1, n_feedback do
    redis.call('HSET', KEYS[6], ARGV[idx], ARGV[idx + 1])
    idx = idx + 2
end

return {1, new_version}
"#;
