use tokio_util::sync::CancellationToken;

use transit_common::config::EtlConfig;
use transit_common::consumer::Consumer;
use transit_common::db;
use transit_common::redis_pool::create_redis_pool;
use transit_common::shutdown::cancel_on_signal;
use transit_common::stream::RedisStream;
use transit_etl::cycle::{EtlJobHandler, EtlWorker};
use transit_etl::fetch::SnapshotClient;
use transit_etl::publish::ChangePublisher;
use transit_etl::store::VehicleStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    transit_common::init_tracing("transit_etl=info,transit_common=info");

    tracing::info!("Telemetry ETL worker starting...");

    // Load configuration
    let config = EtlConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.app.database_url, config.app.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    // Connect to Redis (stream log + publish channel)
    let redis = create_redis_pool(&config.app.redis_url).await?;

    let client = SnapshotClient::new(
        config.vehicle_api_url.clone(),
        config.api_key.clone(),
        config.http_timeout,
    )?;
    let worker = EtlWorker::new(
        client,
        VehicleStore::new(pool.clone()),
        ChangePublisher::new(redis.clone(), config.publish_channel.clone()),
        config.agency_timezone,
    );
    let mut handler = EtlJobHandler::new(worker, config.job_name.clone(), redis.clone());

    let log = RedisStream::new(
        redis,
        config.stream.stream_name.clone(),
        config.stream.consumer_group.clone(),
        config.stream.consumer_name.clone(),
    );
    tracing::info!(
        stream = %log.stream(),
        consumer = %log.consumer(),
        job = %config.job_name,
        "Consuming ETL jobs"
    );

    let token = CancellationToken::new();
    cancel_on_signal(token.clone());

    let stats = Consumer::new(log, &config.stream).run(&mut handler, token).await?;

    pool.close().await;
    tracing::info!(jobs = stats.acknowledged, "Telemetry ETL worker stopped.");
    Ok(())
}
