//! Redis-backed meeting store.
//!
//! # Key Patterns
//!
//! - `meeting:{id}:version` - Commit counter (compare-and-set guard)
//! - `meeting:{id}:record` - Meeting aggregate (JSON)
//! - `meeting:{id}:attendance` - HASH user id -> attendee JSON
//! - `meeting:{id}:turn_logs` - HASH log id -> turn log JSON
//! - `meeting:{id}:turn_log_order` - LIST of log ids in insertion order
//! - `meeting:{id}:feedback` - HASH feedback id -> JSON
//! - `user:{id}:stretch_goals` - HASH goal id -> JSON
//!
//! Writes go through the `COMMIT` Lua script so the version check and every
//! record in the batch land atomically.
//!
//! The `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently; each call clones it rather than locking.

use super::{lua_scripts, CommitBatch, MeetingStore, StoreError};
use crate::model::{Attendee, Feedback, Meeting, StretchGoal, TurnLog};
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::{MeetingId, TurnLogId, UserId};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, instrument, warn};

mod keys {
    use common::types::{MeetingId, UserId};

    pub fn version(id: MeetingId) -> String {
        format!("meeting:{id}:version")
    }
    pub fn record(id: MeetingId) -> String {
        format!("meeting:{id}:record")
    }
    pub fn attendance(id: MeetingId) -> String {
        format!("meeting:{id}:attendance")
    }
    pub fn turn_logs(id: MeetingId) -> String {
        format!("meeting:{id}:turn_logs")
    }
    pub fn turn_log_order(id: MeetingId) -> String {
        format!("meeting:{id}:turn_log_order")
    }
    pub fn feedback(id: MeetingId) -> String {
        format!("meeting:{id}:feedback")
    }
    pub fn stretch_goals(owner: UserId) -> String {
        format!("user:{owner}:stretch_goals")
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Codec(format!("encode failed: {e}")))
}

fn decode<T: DeserializeOwned>(json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Codec(format!("decode failed: {e}")))
}

fn backend(operation: &'static str) -> impl Fn(redis::RedisError) -> StoreError {
    move |e| {
        warn!(
            target: "runner.store.redis",
            error = %e,
            operation,
            "Redis call failed"
        );
        StoreError::Backend(format!("{operation} failed: {e}"))
    }
}

/// KEYS and ARGV for one `COMMIT` invocation.
#[derive(Debug, PartialEq, Eq)]
struct CommitInvocation {
    keys: Vec<String>,
    args: Vec<String>,
    /// Turn log ids in ARGV order, for mapping a finalized-log rejection.
    log_ids: Vec<TurnLogId>,
}

fn commit_invocation(batch: &CommitBatch) -> Result<CommitInvocation, StoreError> {
    let id = batch.meeting_id();
    let mut meeting = batch.meeting.clone();
    meeting.version = batch.expected_version + 1;

    let mut keys = vec![
        keys::version(id),
        keys::record(id),
        keys::turn_logs(id),
        keys::turn_log_order(id),
        keys::attendance(id),
        keys::feedback(id),
    ];
    let mut args = vec![
        batch.expected_version.to_string(),
        encode(&meeting)?,
        batch.turn_logs.len().to_string(),
        batch.attendance.len().to_string(),
        batch.stretch_goals.len().to_string(),
        batch.feedback.len().to_string(),
    ];

    for log in &batch.turn_logs {
        args.push(log.id.to_string());
        args.push(encode(log)?);
    }
    for attendee in &batch.attendance {
        args.push(attendee.user_id.to_string());
        args.push(encode(attendee)?);
    }
    for goal in &batch.stretch_goals {
        keys.push(keys::stretch_goals(goal.owner_id));
        args.push(goal.id.to_string());
        args.push(encode(goal)?);
    }
    for entry in &batch.feedback {
        args.push(entry.id.to_string());
        args.push(encode(entry)?);
    }

    Ok(CommitInvocation {
        keys,
        args,
        log_ids: batch.turn_logs.iter().map(|l| l.id).collect(),
    })
}

/// Meeting store on Redis.
#[derive(Clone)]
pub struct RedisMeetingStore {
    connection: MultiplexedConnection,
    commit_script: Script,
    create_script: Script,
}

impl std::fmt::Debug for RedisMeetingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisMeetingStore").finish_non_exhaustive()
    }
}

impl RedisMeetingStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the client cannot be opened or the
    /// connection fails.
    pub async fn connect(redis_url: &SecretString) -> Result<Self, StoreError> {
        let client = Client::open(redis_url.expose_secret()).map_err(|e| {
            // The URL may carry credentials; never log it.
            error!(
                target: "runner.store.redis",
                error = %e,
                "Failed to open Redis client"
            );
            StoreError::Backend(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "runner.store.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                StoreError::Backend(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            commit_script: Script::new(lua_scripts::COMMIT),
            create_script: Script::new(lua_scripts::CREATE_MEETING),
        })
    }

    /// Round-trip a PING.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if Redis does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend("ping"))?;
        Ok(())
    }

    async fn hash_values<T: DeserializeOwned>(&self, key: String) -> Result<Vec<T>, StoreError> {
        let mut conn = self.connection.clone();
        let rows: Vec<String> = conn.hvals(key).await.map_err(backend("hvals"))?;
        rows.iter().map(|json| decode(json)).collect()
    }

    async fn ensure_exists(&self, id: MeetingId) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let exists: bool = conn
            .exists(keys::record(id))
            .await
            .map_err(backend("exists"))?;
        if exists {
            Ok(())
        } else {
            Err(StoreError::MeetingNotFound(id))
        }
    }
}

#[async_trait]
impl MeetingStore for RedisMeetingStore {
    #[instrument(skip_all, fields(meeting_id = %meeting.id))]
    async fn create_meeting(
        &self,
        meeting: Meeting,
        attendance: Vec<Attendee>,
    ) -> Result<(), StoreError> {
        let id = meeting.id;
        let mut meeting = meeting;
        meeting.version = 0;

        let mut invocation = self.create_script.prepare_invoke();
        invocation
            .key(keys::version(id))
            .key(keys::record(id))
            .key(keys::attendance(id))
            .arg(encode(&meeting)?);
        for attendee in &attendance {
            invocation
                .arg(attendee.user_id.to_string())
                .arg(encode(attendee)?);
        }

        let mut conn = self.connection.clone();
        let created: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(backend("create_meeting"))?;

        if created == 1 {
            debug!(target: "runner.store.redis", meeting_id = %id, "Created meeting");
            Ok(())
        } else {
            Err(StoreError::MeetingExists(id))
        }
    }

    #[instrument(skip_all, fields(meeting_id = %id))]
    async fn read_meeting(&self, id: MeetingId) -> Result<Meeting, StoreError> {
        let mut conn = self.connection.clone();
        let (version, record): (Option<u64>, Option<String>) = conn
            .mget(&[keys::version(id), keys::record(id)])
            .await
            .map_err(backend("mget"))?;

        let record = record.ok_or(StoreError::MeetingNotFound(id))?;
        let mut meeting: Meeting = decode(&record)?;
        meeting.version = version.unwrap_or(0);
        Ok(meeting)
    }

    async fn list_attendance(&self, id: MeetingId) -> Result<Vec<Attendee>, StoreError> {
        self.ensure_exists(id).await?;
        let mut rows: Vec<Attendee> = self.hash_values(keys::attendance(id)).await?;
        rows.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.user_id.cmp(&b.user_id)));
        Ok(rows)
    }

    async fn list_turn_logs(&self, id: MeetingId) -> Result<Vec<TurnLog>, StoreError> {
        self.ensure_exists(id).await?;
        let mut conn = self.connection.clone();
        let order: Vec<String> = conn
            .lrange(keys::turn_log_order(id), 0, -1)
            .await
            .map_err(backend("lrange"))?;
        let mut by_id: HashMap<String, String> = conn
            .hgetall(keys::turn_logs(id))
            .await
            .map_err(backend("hgetall"))?;

        order
            .iter()
            .filter_map(|log_id| by_id.remove(log_id))
            .map(|json| decode(&json))
            .collect()
    }

    async fn list_stretch_goals(&self, id: MeetingId) -> Result<Vec<StretchGoal>, StoreError> {
        let owners: Vec<UserId> = self
            .list_attendance(id)
            .await?
            .into_iter()
            .map(|a| a.user_id)
            .collect();
        if owners.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for owner in &owners {
            pipe.hvals(keys::stretch_goals(*owner));
        }
        let mut conn = self.connection.clone();
        let rows: Vec<Vec<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(backend("pipeline_hvals"))?;

        let mut goals = rows
            .iter()
            .flatten()
            .map(|json| decode::<StretchGoal>(json))
            .collect::<Result<Vec<_>, _>>()?;
        goals.sort_by_key(|g| (g.created_at, g.id));
        Ok(goals)
    }

    async fn list_feedback(&self, id: MeetingId) -> Result<Vec<Feedback>, StoreError> {
        self.ensure_exists(id).await?;
        let mut rows: Vec<Feedback> = self.hash_values(keys::feedback(id)).await?;
        rows.sort_by_key(|f| (f.recorded_at, f.id));
        Ok(rows)
    }

    #[instrument(skip_all, fields(meeting_id = %batch.meeting_id(), expected_version = batch.expected_version))]
    async fn commit(&self, batch: CommitBatch) -> Result<u64, StoreError> {
        let id = batch.meeting_id();
        let invocation = commit_invocation(&batch)?;

        let mut script = self.commit_script.prepare_invoke();
        for key in &invocation.keys {
            script.key(key);
        }
        for arg in &invocation.args {
            script.arg(arg);
        }

        let mut conn = self.connection.clone();
        let result: Vec<i64> = script
            .invoke_async(&mut conn)
            .await
            .map_err(backend("commit"))?;

        let status = result.first().copied().unwrap_or(-1);
        let value = result.get(1).copied().unwrap_or(0);
        let value_u64 = u64::try_from(value).unwrap_or(0);

        match status {
            1 => {
                debug!(
                    target: "runner.store.redis",
                    meeting_id = %id,
                    version = value,
                    "Committed batch"
                );
                Ok(value_u64)
            }
            0 => {
                warn!(
                    target: "runner.store.redis",
                    meeting_id = %id,
                    expected = batch.expected_version,
                    actual = value,
                    "Version conflict on commit"
                );
                Err(StoreError::VersionConflict {
                    expected: batch.expected_version,
                    actual: value_u64,
                })
            }
            -2 => {
                let index = usize::try_from(value - 1).unwrap_or(usize::MAX);
                let log_id = invocation
                    .log_ids
                    .get(index)
                    .copied()
                    .unwrap_or_default();
                Err(StoreError::FinalizedLog(log_id))
            }
            -3 => Err(StoreError::MeetingNotFound(id)),
            _ => {
                error!(
                    target: "runner.store.redis",
                    meeting_id = %id,
                    status,
                    "Commit script rejected arguments"
                );
                Err(StoreError::Backend("malformed commit".to_string()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{Phase, PriorityTier, StretchGoalStatus};
    use chrono::Utc;
    use common::types::StretchGoalId;

    fn batch() -> CommitBatch {
        let meeting = Meeting::scheduled(MeetingId::new(), UserId::new(), Utc::now(), 90);
        let mut batch = CommitBatch::for_meeting(meeting);
        batch.expected_version = 6;
        batch
    }

    #[test]
    fn test_key_patterns() {
        let id = MeetingId::new();
        assert_eq!(keys::version(id), format!("meeting:{id}:version"));
        assert_eq!(keys::turn_log_order(id), format!("meeting:{id}:turn_log_order"));
        let owner = UserId::new();
        assert_eq!(keys::stretch_goals(owner), format!("user:{owner}:stretch_goals"));
    }

    #[test]
    fn test_commit_invocation_sets_next_version_on_record() {
        let batch = batch();
        let invocation = commit_invocation(&batch).unwrap();

        assert_eq!(invocation.args.first().unwrap(), "6");
        let record: Meeting = decode(invocation.args.get(1).unwrap()).unwrap();
        assert_eq!(record.version, 7);
        assert_eq!(invocation.keys.len(), 6);
    }

    #[test]
    fn test_commit_invocation_layout() {
        let mut batch = batch();
        let owner = UserId::new();
        let now = Utc::now();
        batch.put_turn_log(TurnLog::turn_started(
            batch.meeting_id(),
            Phase::LightningRound,
            owner,
            now,
            60,
            PriorityTier::P2,
        ));
        batch.put_stretch_goal(StretchGoal {
            id: StretchGoalId::new(),
            owner_id: owner,
            description: "Read before bed".to_string(),
            status: StretchGoalStatus::Active,
            created_at: now,
            updated_at: now,
        });

        let invocation = commit_invocation(&batch).unwrap();

        // Counts: 1 log, 0 attendees, 1 goal, 0 feedback.
        assert_eq!(invocation.args.get(2..6).unwrap(), ["1", "0", "1", "0"]);
        // Header + one pair per record.
        assert_eq!(invocation.args.len(), 6 + 2 * 2);
        assert_eq!(invocation.keys.last().unwrap(), &keys::stretch_goals(owner));
        assert_eq!(invocation.log_ids.len(), 1);
    }
}
