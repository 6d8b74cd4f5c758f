//! Pubsub Subscriptions
//!
//! Two websocket subscriptions on the receiving address feed one channel:
//! - `accountSubscribe` (balance changes, no signature)
//! - `logsSubscribe` with a mentions filter (one signature per message)
//!
//! Each subscription runs in its own task and is owned by a
//! [`SubscriptionHandle`]. A stream that ends is re-established after a
//! back-off. Shutdown unsubscribes and closes the connection explicitly.

use futures_util::{Stream, StreamExt};
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{
    RpcAccountInfoConfig, RpcTransactionLogsConfig, RpcTransactionLogsFilter,
};
use solana_client::rpc_response::Response;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ingest::DepositIngestor;
use super::notification::Notification;

/// Buffered notifications between the subscriptions and the ingest task
const CHANNEL_CAPACITY: usize = 1024;

/// Upper bound for the reconnect back-off
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Subscription source on the receiving address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Account,
    Logs,
}

impl SubscriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::Account => "account",
            SubscriptionKind::Logs => "logs",
        }
    }
}

/// How a subscription session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Shutdown requested or nobody is listening any more
    Stopped,
    /// The server closed the stream
    StreamEnded,
}

/// Owned handle to one running subscription
pub struct SubscriptionHandle {
    kind: SubscriptionKind,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Unsubscribe, close the connection and wait for the task
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = self.task.await {
            warn!(subscription = self.kind.as_str(), error = %e, "Subscription task failed");
        }
        info!(subscription = self.kind.as_str(), "Subscription released");
    }
}

/// Owned handle to the whole watcher
pub struct WatcherHandle {
    subscriptions: Vec<SubscriptionHandle>,
    ingest_task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Release every subscription, then drain the ingest task
    pub async fn shutdown(self) {
        for subscription in self.subscriptions {
            subscription.shutdown().await;
        }
        // Every sender is gone now, so the ingest loop ends after draining.
        if let Err(e) = self.ingest_task.await {
            warn!(error = %e, "Ingest task failed");
        }
    }
}

/// Watches the receiving address over websocket
pub struct DepositWatcher {
    ws_url: String,
    address: Pubkey,
    reconnect_delay: Duration,
}

impl DepositWatcher {
    pub fn new(ws_url: impl Into<String>, address: Pubkey) -> Self {
        Self {
            ws_url: ws_url.into(),
            address,
            reconnect_delay: Duration::from_secs(1),
        }
    }

    /// Set the initial reconnect back-off
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Start both subscriptions and the ingest task
    pub fn start(&self, ingestor: Arc<DepositIngestor>) -> WatcherHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let ingest_task = tokio::spawn(ingestor.consume(rx));

        let subscriptions = [SubscriptionKind::Account, SubscriptionKind::Logs]
            .into_iter()
            .map(|kind| self.spawn_subscription(kind, tx.clone()))
            .collect();

        info!(address = %self.address, ws_url = %self.ws_url, "Deposit watcher started");

        WatcherHandle {
            subscriptions,
            ingest_task,
        }
    }

    fn spawn_subscription(
        &self,
        kind: SubscriptionKind,
        tx: mpsc::Sender<Notification>,
    ) -> SubscriptionHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_subscription(
            kind,
            self.ws_url.clone(),
            self.address,
            tx,
            stop_rx,
            self.reconnect_delay,
        ));

        SubscriptionHandle {
            kind,
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Keep one subscription alive until told to stop
async fn run_subscription(
    kind: SubscriptionKind,
    ws_url: String,
    address: Pubkey,
    tx: mpsc::Sender<Notification>,
    mut stop: oneshot::Receiver<()>,
    initial_delay: Duration,
) {
    let mut delay = initial_delay;

    loop {
        let connected = tokio::select! {
            _ = &mut stop => return,
            connected = PubsubClient::new(&ws_url) => connected,
        };
        let client = match connected {
            Ok(client) => client,
            Err(e) => {
                warn!(subscription = kind.as_str(), error = %e, "Websocket connect failed");
                if backoff(&mut stop, &mut delay).await {
                    return;
                }
                continue;
            }
        };

        let end = match kind {
            SubscriptionKind::Account => {
                let config = RpcAccountInfoConfig {
                    commitment: Some(CommitmentConfig::confirmed()),
                    ..Default::default()
                };
                match client.account_subscribe(&address, Some(config)).await {
                    Ok((mut stream, unsubscribe)) => {
                        info!(subscription = kind.as_str(), "Subscribed");
                        delay = initial_delay;
                        let end = forward(
                            &mut stream,
                            |update: Response<_>| Notification::AccountChange {
                                slot: update.context.slot,
                            },
                            &tx,
                            &mut stop,
                        )
                        .await;
                        drop(stream);
                        unsubscribe().await;
                        Some(end)
                    }
                    Err(e) => {
                        warn!(subscription = kind.as_str(), error = %e, "Subscribe failed");
                        None
                    }
                }
            }
            SubscriptionKind::Logs => {
                let filter = RpcTransactionLogsFilter::Mentions(vec![address.to_string()]);
                let config = RpcTransactionLogsConfig {
                    commitment: Some(CommitmentConfig::confirmed()),
                };
                match client.logs_subscribe(filter, config).await {
                    Ok((mut stream, unsubscribe)) => {
                        info!(subscription = kind.as_str(), "Subscribed");
                        delay = initial_delay;
                        let end = forward(&mut stream, Notification::from_logs, &tx, &mut stop).await;
                        drop(stream);
                        unsubscribe().await;
                        Some(end)
                    }
                    Err(e) => {
                        warn!(subscription = kind.as_str(), error = %e, "Subscribe failed");
                        None
                    }
                }
            }
        };

        if let Err(e) = client.shutdown().await {
            debug!(subscription = kind.as_str(), error = %e, "Websocket close failed");
        }

        if end == Some(SessionEnd::Stopped) {
            return;
        }
        warn!(subscription = kind.as_str(), "Subscription lost, reconnecting");
        if backoff(&mut stop, &mut delay).await {
            return;
        }
    }
}

/// Forward stream items into the channel until stopped or the stream ends
async fn forward<S, T, F>(
    stream: &mut S,
    to_notification: F,
    tx: &mpsc::Sender<Notification>,
    stop: &mut oneshot::Receiver<()>,
) -> SessionEnd
where
    S: Stream<Item = T> + Unpin,
    F: Fn(T) -> Notification,
{
    loop {
        tokio::select! {
            _ = &mut *stop => return SessionEnd::Stopped,
            item = stream.next() => match item {
                Some(item) => tokio::select! {
                    _ = &mut *stop => return SessionEnd::Stopped,
                    sent = tx.send(to_notification(item)) => {
                        if sent.is_err() {
                            return SessionEnd::Stopped;
                        }
                    }
                },
                None => return SessionEnd::StreamEnded,
            },
        }
    }
}

/// Sleep for the current delay, doubling it for next time
///
/// Returns true when a stop arrived during the wait.
async fn backoff(stop: &mut oneshot::Receiver<()>, delay: &mut Duration) -> bool {
    let wait = *delay;
    *delay = (*delay * 2).min(MAX_RECONNECT_DELAY);

    tokio::select! {
        _ = stop => true,
        _ = tokio::time::sleep(wait) => false,
    }
}
