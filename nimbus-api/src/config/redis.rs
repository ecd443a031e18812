use redis::Client;

/// Create Redis client from URL
pub fn create_client(redis_url: &str) -> Result<Client, redis::RedisError> {
    Client::open(redis_url)
}

/// Round-trips a PING; used by readiness.
pub async fn ping(client: &Client) -> Result<(), redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}
