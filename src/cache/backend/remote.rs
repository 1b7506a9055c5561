//! Redis adapter.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};

use super::{BackendError, BoxedConnection, KeyTtl, KvConnection};
use crate::cache::pool::Manager;

/// Opens multiplexed Redis connections on demand.
pub struct RedisManager {
    client: Client,
}

impl RedisManager {
    /// Parse the URL; no connection is made until the pool asks for one.
    pub fn open(url: &str) -> Result<Self, BackendError> {
        let client = Client::open(url).map_err(|err| BackendError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Manager for RedisManager {
    type Connection = BoxedConnection;

    async fn create(&self) -> Result<BoxedConnection, BackendError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        Ok(Box::new(RedisConnection { conn }))
    }

    async fn validate(&self, conn: &mut BoxedConnection) -> Result<(), BackendError> {
        conn.ping().await
    }
}

pub struct RedisConnection {
    conn: MultiplexedConnection,
}

fn command_error(command: &'static str, err: RedisError) -> BackendError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        BackendError::Unavailable(err.to_string())
    } else {
        BackendError::Command {
            command,
            detail: err.to_string(),
        }
    }
}

#[async_trait]
impl KvConnection for RedisConnection {
    async fn ping(&mut self) -> Result<(), BackendError> {
        let reply: String = redis::cmd("PING")
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("PING", err))?;
        if reply.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(BackendError::Command {
                command: "PING",
                detail: format!("unexpected reply `{reply}`"),
            })
        }
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, BackendError> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("GET", err))
    }

    async fn set_px(&mut self, key: &str, value: &str, ttl_ms: u64) -> Result<(), BackendError> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms.max(1))
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("SET", err))?;
        Ok(())
    }

    async fn del(&mut self, keys: &[String]) -> Result<u64, BackendError> {
        if keys.is_empty() {
            return Ok(0);
        }
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("DEL", err))
    }

    async fn sadd(&mut self, key: &str, member: &str) -> Result<(), BackendError> {
        let _: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("SADD", err))?;
        Ok(())
    }

    async fn smembers(&mut self, key: &str) -> Result<Vec<String>, BackendError> {
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("SMEMBERS", err))
    }

    async fn pttl(&mut self, key: &str) -> Result<KeyTtl, BackendError> {
        let ttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("PTTL", err))?;
        // -2: missing, -1: no expiry.
        Ok(match ttl {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(ms.unsigned_abs()),
        })
    }

    async fn pexpire(&mut self, key: &str, ttl_ms: u64) -> Result<bool, BackendError> {
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms.max(1))
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("PEXPIRE", err))?;
        Ok(applied == 1)
    }

    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), BackendError> {
        redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("SCAN", err))
    }

    async fn used_memory(&mut self) -> Result<Option<u64>, BackendError> {
        let info: String = redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut self.conn)
            .await
            .map_err(|err| command_error("INFO", err))?;
        Ok(parse_used_memory(&info))
    }
}

fn parse_used_memory(info: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("used_memory:"))
        .and_then(|value| value.trim().parse().ok())
}
