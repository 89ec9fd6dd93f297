use tokio_util::sync::CancellationToken;

use transit_common::config::SchedulerConfig;
use transit_common::db;
use transit_common::redis_pool::create_redis_pool;
use transit_common::shutdown::cancel_on_signal;
use transit_common::stream::StreamProducer;
use transit_scheduler::producer::{NotificationEnqueuer, PendingNotificationProducer};
use transit_scheduler::scheduler::JobScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    transit_common::init_tracing("transit_scheduler=info,transit_common=info");

    tracing::info!("Job scheduler starting...");

    let config = SchedulerConfig::from_env()?;

    let pool = db::create_pool(&config.app.database_url, config.app.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.app.redis_url).await?;
    let producer = StreamProducer::new(redis, config.stream_max_len);

    let token = CancellationToken::new();
    cancel_on_signal(token.clone());

    let mut scheduler = JobScheduler::new(producer.clone());
    scheduler
        .schedule_recurring(&config.etl_job_name, &config.etl_stream, config.etl_interval)
        .await?;

    let enqueuer = NotificationEnqueuer::new(
        producer,
        config.notification_stream.clone(),
        config.notification_reenqueue_cooldown,
        config.notification_max_enqueues,
    );
    let notifications = PendingNotificationProducer::new(
        pool.clone(),
        enqueuer,
        config.notification_poll_interval,
        config.notification_grace,
    );
    let notifications = tokio::spawn(notifications.run(token.clone()));

    tracing::info!(recurring = scheduler.scheduled_count(), "Scheduler running");
    token.cancelled().await;

    scheduler.shutdown().await;
    if let Err(e) = notifications.await {
        tracing::warn!(error = %e, "Pending-notification producer task failed");
    }

    pool.close().await;
    tracing::info!("Job scheduler stopped.");
    Ok(())
}
