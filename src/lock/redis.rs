use fred::clients::Client;
use fred::interfaces::{KeysInterface, LuaInterface};
use fred::types::{Expiration, SetOptions};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::lock::LockStore;
use crate::lock::lua::{
    EXTEND_SCRIPT, EXTEND_SCRIPT_HASH, RELEASE_SCRIPT, RELEASE_SCRIPT_HASH, eval_cached,
};
use crate::store::Error;

/// A lock store on top of redis.
///
/// Acquisition is `SET key token PX ttl NX`; the compare operations run as
/// Lua scripts so the token check and the write happen in one step on the
/// server. A script the server has forgotten is loaded again on demand.
/// Expiry is enforced by redis itself.
pub struct RedisLockStore<C = Client>
where
    C: KeysInterface + LuaInterface + Send + Sync + 'static,
{
    client: Arc<C>,
}

impl<C> RedisLockStore<C>
where
    C: KeysInterface + LuaInterface + Send + Sync + 'static,
{
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

impl<C> LockStore for RedisLockStore<C>
where
    C: KeysInterface + LuaInterface + Send + Sync + 'static,
{
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Error> {
        let reply: Option<String> = self
            .client
            .set(
                key,
                token,
                Some(Expiration::PX(millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await?;

        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, Error> {
        let removed: i64 = eval_cached(
            &*self.client,
            &RELEASE_SCRIPT_HASH,
            RELEASE_SCRIPT,
            vec![key],
            vec![token],
        )
        .await?;

        Ok(removed == 1)
    }

    async fn compare_and_expire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, Error> {
        let extended: i64 = eval_cached(
            &*self.client,
            &EXTEND_SCRIPT_HASH,
            EXTEND_SCRIPT,
            vec![key],
            (token, millis(ttl)),
        )
        .await?;

        Ok(extended == 1)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.client.get(key).await?)
    }
}

impl<C> Clone for RedisLockStore<C>
where
    C: KeysInterface + LuaInterface + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<C> fmt::Debug for RedisLockStore<C>
where
    C: KeysInterface + LuaInterface + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLockStore").finish_non_exhaustive()
    }
}
