use fred::error::Error;
use fred::interfaces::LuaInterface;
use fred::types::{FromValue, MultipleKeys, MultipleValues};
use tokio::sync::OnceCell;

pub(crate) static RELEASE_SCRIPT_HASH: OnceCell<String> = OnceCell::const_new();
pub(crate) static EXTEND_SCRIPT_HASH: OnceCell<String> = OnceCell::const_new();

pub(crate) static RELEASE_SCRIPT: &str = r#"
    local key = KEYS[1]
    local token = ARGV[1]

    if redis.call('GET', key) == token then
        return redis.call('DEL', key)
    end

    return 0
"#;

pub(crate) static EXTEND_SCRIPT: &str = r#"
    local key = KEYS[1]
    local token = ARGV[1]
    local millis = tonumber(ARGV[2])

    if redis.call('GET', key) == token then
        return redis.call('PEXPIRE', key, millis)
    end

    return 0
"#;

/// Returns the SHA1 of `script`, loading it into the server the first time.
///
/// The hash is cached for the life of the process; [`eval_cached`] reloads
/// the script body when the server has lost it.
async fn script_hash<C>(
    client: &C,
    once_cell: &'static OnceCell<String>,
    script: &'static str,
) -> Result<&'static String, Error>
where
    C: LuaInterface + Send + Sync,
{
    once_cell
        .get_or_try_init(|| async {
            let hash = fred::util::sha1_hash(script);
            let exists: Vec<bool> = client.script_exists(&hash).await?;
            if !exists.first().copied().unwrap_or(false) {
                let _: () = client.script_load(script).await?;
            }
            Ok::<String, Error>(hash)
        })
        .await
}

/// Whether `err` is the server reporting an unknown script hash.
///
/// Happens after a restart, a failover to a replica that never saw the
/// script, or `SCRIPT FLUSH`.
pub(crate) fn is_missing_script(err: &Error) -> bool {
    err.details().starts_with("NOSCRIPT")
}

/// Runs a cached script with `EVALSHA`, loading it again and retrying once if
/// the server no longer knows it.
pub(crate) async fn eval_cached<R, C, K, V>(
    client: &C,
    once_cell: &'static OnceCell<String>,
    script: &'static str,
    keys: K,
    args: V,
) -> Result<R, Error>
where
    R: FromValue,
    C: LuaInterface + Send + Sync,
    K: Into<MultipleKeys> + Send,
    V: TryInto<MultipleValues> + Send,
    V::Error: Into<Error> + Send,
{
    let hash = script_hash(client, once_cell, script).await?;
    let keys: MultipleKeys = keys.into();
    let args: MultipleValues = args.try_into().map_err(Into::into)?;

    match client.evalsha(hash, keys.clone(), args.clone()).await {
        Err(err) if is_missing_script(&err) => {
            tracing::warn!("lock script missing on the server; reloading");
            let _: () = client.script_load(script).await?;
            client.evalsha(hash, keys, args).await
        }
        result => result,
    }
}
