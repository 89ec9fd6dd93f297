use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Cancel `token` on SIGINT or SIGTERM.
///
/// Workers check the token between messages, so whatever is in flight when
/// the signal arrives is allowed to finish.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal, starting graceful shutdown");
        token.cancel();
    });
}

/// Resolve once `signal` fires. A listener that could not be installed never
/// resolves, so it cannot trigger a shutdown on its own.
async fn delivered<F>(signal: F, name: &str)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        tracing::error!(signal = name, error = %e, "Unable to listen for signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let terminate = async {
        let mut stream = signal(SignalKind::terminate())?;
        stream.recv().await;
        Ok(())
    };

    tokio::select! {
        _ = delivered(tokio::signal::ctrl_c(), "SIGINT") => {}
        _ = delivered(terminate, "SIGTERM") => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    delivered(tokio::signal::ctrl_c(), "SIGINT").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn failed_listener() -> impl Future<Output = std::io::Result<()>> {
        std::future::ready(Err(std::io::Error::other("signal driver unavailable")))
    }

    #[tokio::test]
    async fn test_failed_listener_never_fires() {
        let waited = tokio::time::timeout(Duration::from_millis(50), delivered(failed_listener(), "SIGINT")).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_other_listener_still_fires_after_one_fails() {
        let fired = tokio::time::timeout(Duration::from_millis(50), async {
            tokio::select! {
                _ = delivered(failed_listener(), "SIGINT") => "SIGINT",
                _ = delivered(std::future::ready(Ok(())), "SIGTERM") => "SIGTERM",
            }
        })
        .await;
        assert_eq!(fired.unwrap(), "SIGTERM");
    }
}
