//! Connection task: connect, handshake, then deliver frames until EOF

use std::sync::Arc;

use contracts::{frame, ClientConfig};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SubscriberError};
use crate::subscription::SubscriptionEntry;

#[instrument(
    name = "subscription",
    skip_all,
    fields(subscription_id = entry.id(), token = ?entry.token())
)]
pub(crate) async fn run(entry: Arc<SubscriptionEntry>, config: ClientConfig) {
    let result = stream_frames(&entry, &config).await;
    entry.set_connected(false);

    match result {
        Ok(()) if entry.is_active() => info!("Producer closed the stream"),
        Ok(()) => debug!("Subscription cancelled"),
        Err(e) => {
            observability::record_subscriber_error();
            warn!(error = %e, "Subscription connection failed");
        }
    }
}

async fn stream_frames(entry: &SubscriptionEntry, config: &ClientConfig) -> Result<()> {
    let token = entry.token();
    let endpoint = token.endpoint();

    let timeout = config.connect_timeout();
    let socket = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| SubscriberError::ConnectTimeout {
            endpoint,
            timeout_ms: config.connect_timeout_ms,
        })?
        .map_err(|e| SubscriberError::connect(endpoint, e))?;

    if let Err(e) = socket.set_nodelay(config.tcp_nodelay) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    // The write half stays open for the whole subscription; dropping it
    // would signal EOF and the producer would close the session.
    let (mut reader, mut writer) = socket.into_split();
    frame::write_handshake(&mut writer, token.stream_id()).await?;
    entry.set_connected(true);
    debug!(%endpoint, "Handshake sent");

    while let Some(buffer) = frame::read_frame(&mut reader, config.max_frame_size).await? {
        if !entry.deliver(buffer) {
            break;
        }
    }

    drop(writer);
    Ok(())
}
