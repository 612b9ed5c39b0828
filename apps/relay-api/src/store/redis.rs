//! Redis-backed `CoordStore`.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::AsyncCommands;

use crate::error::Error;

use super::{CoordStore, Subscription};

pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        tracing::info!("redis connection established");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl CoordStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, Error> {
        // GET/DEL must be atomic or a concurrent re-registration could be
        // deleted out from under its writer.
        let script = redis::Script::new(
            r"if redis.call('GET', KEYS[1]) == ARGV[1] then
                  return redis.call('DEL', KEYS[1])
              else
                  return 0
              end",
        );
        let mut conn = self.conn.clone();
        let deleted: i64 = script.key(key).arg(expected).invoke_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, Error> {
        let pubsub = self.client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();
        Ok(Box::new(RedisSubscription { sink, stream }))
    }
}

struct RedisSubscription {
    sink: PubSubSink,
    stream: PubSubStream,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<(), Error> {
        self.sink.subscribe(channel).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), Error> {
        self.sink.unsubscribe(channel).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<(String, String)> {
        loop {
            let msg = self.stream.next().await?;
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => return Some((channel, payload)),
                Err(e) => {
                    tracing::warn!(%channel, ?e, "undecodable pub/sub payload skipped");
                    continue;
                }
            }
        }
    }
}
