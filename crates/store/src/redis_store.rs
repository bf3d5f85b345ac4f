//! Redis-backed entity store.
//!
//! Entities are hashes under `job:{id}` / `variant:{id}`, with per-status
//! index sets (`jobs:running` etc.) maintained by the conditional-update Lua
//! script so the periodic sweep can scan without KEYS. Conditional updates
//! are compare-and-set scripts, making each orchestrator write atomic.
//! Change publication is the committing writer's job (stage handlers publish
//! to NATS); this store never emits feed events.

use crate::EntityStore;
use adweave_core::config::RedisConfig;
use adweave_core::error::{AdweaveError, AdweaveResult};
use adweave_core::stage::Stage;
use adweave_core::types::{CopyContext, EntityStatus, Job, JobVariant, OverlayContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

const JOB_CAS_SCRIPT: &str = r#"
local key = KEYS[1]
if redis.call('HGET', key, 'status') == ARGV[1]
   and (redis.call('HGET', key, 'current_step') or '') == ARGV[2] then
    redis.call('HSET', key, 'status', ARGV[3], 'updated_at', ARGV[4])
    if ARGV[5] == '1' then
        redis.call('HINCRBY', key, 'retry_count', 1)
    end
    redis.call('SMOVE', 'jobs:' .. ARGV[1], 'jobs:' .. ARGV[3], ARGV[6])
    return 1
end
return 0
"#;

const VARIANT_CAS_SCRIPT: &str = r#"
local key = KEYS[1]
if redis.call('HGET', key, 'status') == ARGV[1]
   and (redis.call('HGET', key, 'current_step') or '') == ARGV[2] then
    redis.call('HSET', key, 'status', ARGV[3], 'updated_at', ARGV[4])
    if ARGV[5] == '1' then
        redis.call('HINCRBY', key, 'retry_count', 1)
    end
    return 1
end
return 0
"#;

/// Redis entity store used in production deployments.
pub struct RedisStore {
    conn: ConnectionManager,
    job_cas: redis::Script,
    variant_cas: redis::Script,
}

impl RedisStore {
    /// Connect and verify reachability.
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");
        let client = redis::Client::open(url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            job_cas: redis::Script::new(JOB_CAS_SCRIPT),
            variant_cas: redis::Script::new(VARIANT_CAS_SCRIPT),
        })
    }

    async fn hash(&self, key: &str) -> AdweaveResult<Option<HashMap<String, String>>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| AdweaveError::Store(e.to_string()))?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }
}

fn parse_status(s: &str) -> AdweaveResult<EntityStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| AdweaveError::Store(format!("unknown status value: {s}")))
}

fn parse_step(s: Option<&String>) -> AdweaveResult<Option<Stage>> {
    match s.map(String::as_str) {
        None | Some("") => Ok(None),
        Some(name) => name
            .parse::<Stage>()
            .map(Some)
            .map_err(AdweaveError::Store),
    }
}

fn parse_time(s: Option<&String>) -> DateTime<Utc> {
    s.and_then(|v| v.parse::<DateTime<Utc>>().ok())
        .unwrap_or_else(Utc::now)
}

fn field<'a>(map: &'a HashMap<String, String>, key: &str, entity: &str) -> AdweaveResult<&'a String> {
    map.get(key)
        .ok_or_else(|| AdweaveError::Store(format!("{entity} hash missing field {key}")))
}

fn job_from_hash(id: Uuid, map: &HashMap<String, String>) -> AdweaveResult<Job> {
    Ok(Job {
        id,
        tenant_id: field(map, "tenant_id", "job")?.clone(),
        status: parse_status(field(map, "status", "job")?)?,
        current_step: parse_step(map.get("current_step"))?,
        retry_count: map
            .get("retry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        created_at: parse_time(map.get("created_at")),
        updated_at: parse_time(map.get("updated_at")),
    })
}

fn variant_from_hash(id: Uuid, map: &HashMap<String, String>) -> AdweaveResult<JobVariant> {
    Ok(JobVariant {
        id,
        job_id: field(map, "job_id", "variant")?
            .parse()
            .map_err(|_| AdweaveError::Store("variant hash has malformed job_id".into()))?,
        creation_order: map
            .get("creation_order")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        status: parse_status(field(map, "status", "variant")?)?,
        current_step: parse_step(map.get("current_step"))?,
        retry_count: map
            .get("retry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        img_asset_id: map
            .get("img_asset_id")
            .filter(|v| !v.is_empty())
            .and_then(|v| v.parse().ok()),
        updated_at: parse_time(map.get("updated_at")),
    })
}

fn step_arg(step: Option<Stage>) -> &'static str {
    step.map(|s| s.as_str()).unwrap_or("")
}

#[async_trait]
impl EntityStore for RedisStore {
    async fn get_job(&self, id: Uuid) -> AdweaveResult<Option<Job>> {
        match self.hash(&format!("job:{id}")).await? {
            Some(map) => Ok(Some(job_from_hash(id, &map)?)),
            None => Ok(None),
        }
    }

    async fn get_variant(&self, id: Uuid) -> AdweaveResult<Option<JobVariant>> {
        match self.hash(&format!("variant:{id}")).await? {
            Some(map) => Ok(Some(variant_from_hash(id, &map)?)),
            None => Ok(None),
        }
    }

    async fn variants_of(&self, job_id: Uuid) -> AdweaveResult<Vec<JobVariant>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(format!("job:{job_id}:variants"))
            .await
            .map_err(|e| AdweaveError::Store(e.to_string()))?;

        let mut variants = Vec::with_capacity(ids.len());
        for raw in ids {
            let id: Uuid = raw
                .parse()
                .map_err(|_| AdweaveError::Store(format!("malformed variant id in index: {raw}")))?;
            if let Some(v) = self.get_variant(id).await? {
                variants.push(v);
            }
        }
        variants.sort_by_key(|v| v.creation_order);
        Ok(variants)
    }

    async fn update_job_if(
        &self,
        id: Uuid,
        expect_step: Option<Stage>,
        expect_status: EntityStatus,
        new_status: EntityStatus,
        bump_retry: bool,
    ) -> AdweaveResult<bool> {
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .job_cas
            .key(format!("job:{id}"))
            .arg(expect_status.to_string())
            .arg(step_arg(expect_step))
            .arg(new_status.to_string())
            .arg(Utc::now().to_rfc3339())
            .arg(if bump_retry { "1" } else { "0" })
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AdweaveError::Store(e.to_string()))?;
        Ok(applied == 1)
    }

    async fn update_variant_if(
        &self,
        id: Uuid,
        expect_step: Option<Stage>,
        expect_status: EntityStatus,
        new_status: EntityStatus,
        bump_retry: bool,
    ) -> AdweaveResult<bool> {
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .variant_cas
            .key(format!("variant:{id}"))
            .arg(expect_status.to_string())
            .arg(step_arg(expect_step))
            .arg(new_status.to_string())
            .arg(Utc::now().to_rfc3339())
            .arg(if bump_retry { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AdweaveError::Store(e.to_string()))?;
        Ok(applied == 1)
    }

    async fn bump_variant_retry(&self, id: Uuid) -> AdweaveResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hincr(format!("variant:{id}"), "retry_count", 1)
            .await
            .map_err(|e| AdweaveError::Store(e.to_string()))?;
        Ok(())
    }

    async fn running_jobs(&self) -> AdweaveResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers("jobs:running")
            .await
            .map_err(|e| AdweaveError::Store(e.to_string()))?;

        let mut jobs = Vec::with_capacity(ids.len());
        for raw in ids {
            let id: Uuid = raw
                .parse()
                .map_err(|_| AdweaveError::Store(format!("malformed job id in index: {raw}")))?;
            if let Some(job) = self.get_job(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn resolve_overlay(&self, variant_id: Uuid) -> AdweaveResult<Option<OverlayContext>> {
        let asset_id = match self.get_variant(variant_id).await?.and_then(|v| v.img_asset_id) {
            Some(id) => id,
            None => return Ok(None),
        };
        let mut conn = self.conn.clone();
        let proposal: Option<String> = conn
            .get(format!("asset:{asset_id}:proposal"))
            .await
            .map_err(|e| AdweaveError::Store(e.to_string()))?;
        let proposal_id = match proposal.as_deref().and_then(|p| p.parse::<Uuid>().ok()) {
            Some(id) => id,
            None => return Ok(None),
        };
        let overlay: Option<String> = conn
            .get(format!("proposal:{proposal_id}:overlay"))
            .await
            .map_err(|e| AdweaveError::Store(e.to_string()))?;
        Ok(overlay
            .as_deref()
            .and_then(|o| o.parse::<Uuid>().ok())
            .map(|overlay_id| OverlayContext { overlay_id }))
    }

    async fn resolve_copy(
        &self,
        job_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> AdweaveResult<Option<CopyContext>> {
        let map = match self.hash(&format!("job:{job_id}:copy")).await? {
            Some(map) => map,
            None => return Ok(None),
        };
        let text = match map.get("text") {
            Some(text) => text.clone(),
            None => return Ok(None),
        };
        let variant_id = match variant_id {
            Some(id) => id,
            None => return Ok(None),
        };
        let asset_id = match self.get_variant(variant_id).await?.and_then(|v| v.img_asset_id) {
            Some(id) => id,
            None => return Ok(None),
        };
        let mut conn = self.conn.clone();
        let proposal: Option<String> = conn
            .get(format!("asset:{asset_id}:proposal"))
            .await
            .map_err(|e| AdweaveError::Store(e.to_string()))?;
        let proposal_id = match proposal.as_deref().and_then(|p| p.parse::<Uuid>().ok()) {
            Some(id) => id,
            None => return Ok(None),
        };
        Ok(Some(CopyContext {
            text,
            proposal_id,
            x_align: map.get("x_align").cloned(),
            y_align: map.get("y_align").cloned(),
        }))
    }
}
