use tokio_util::sync::CancellationToken;

use transit_common::config::NotifierConfig;
use transit_common::consumer::Consumer;
use transit_common::db;
use transit_common::redis_pool::create_redis_pool;
use transit_common::shutdown::cancel_on_signal;
use transit_common::stream::RedisStream;
use transit_notifier::arrivals::ArrivalsClient;
use transit_notifier::delivery::DeliveryHandler;
use transit_notifier::push::WebPushGateway;
use transit_notifier::store::PgNotificationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    transit_common::init_tracing("transit_notifier=info,transit_common=info");

    tracing::info!("Notification worker starting...");

    let config = NotifierConfig::from_env()?;

    let pool = db::create_pool(&config.app.database_url, config.app.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.app.redis_url).await?;

    // Fails fast on a bad key pair instead of on the first send
    let push = WebPushGateway::new(
        &config.vapid_public_key,
        &config.vapid_private_key,
        &config.vapid_email,
        config.http_timeout,
    )?;
    let arrivals = ArrivalsClient::new(
        config.arrivals_api_url.clone(),
        config.api_key.clone(),
        config.http_timeout,
    )?;
    let mut handler = DeliveryHandler::new(
        push,
        PgNotificationStore::new(pool.clone()),
        arrivals,
        config.icon.clone(),
    );

    let log = RedisStream::new(
        redis,
        config.stream.stream_name.clone(),
        config.stream.consumer_group.clone(),
        config.stream.consumer_name.clone(),
    );
    tracing::info!(
        stream = %log.stream(),
        consumer = %log.consumer(),
        "Consuming notification jobs"
    );

    let token = CancellationToken::new();
    cancel_on_signal(token.clone());

    let stats = Consumer::new(log, &config.stream).run(&mut handler, token).await?;

    pool.close().await;
    tracing::info!(
        delivered = stats.acknowledged,
        discarded = stats.discarded,
        failed = stats.failed,
        "Notification worker stopped."
    );
    Ok(())
}
