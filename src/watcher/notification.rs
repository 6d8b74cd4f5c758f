//! Subscription Notifications
//!
//! One variant per subscription source. Account changes carry no signature,
//! log entries carry exactly one.

use solana_client::rpc_response::{Response, RpcLogsResponse};

/// Event delivered by a subscription on the receiving address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Balance or data of the receiving account changed
    AccountChange { slot: u64 },
    /// A transaction mentioning the receiving address was confirmed
    LogEntry {
        signature: String,
        slot: u64,
        failed: bool,
    },
}

impl Notification {
    /// Build from a logs subscription message
    pub fn from_logs(response: Response<RpcLogsResponse>) -> Self {
        Notification::LogEntry {
            signature: response.value.signature,
            slot: response.context.slot,
            failed: response.value.err.is_some(),
        }
    }

    /// Slot the notification was produced at
    pub fn slot(&self) -> u64 {
        match self {
            Notification::AccountChange { slot } | Notification::LogEntry { slot, .. } => *slot,
        }
    }

    /// Subscription the notification came from
    pub fn source(&self) -> &'static str {
        match self {
            Notification::AccountChange { .. } => "account",
            Notification::LogEntry { .. } => "logs",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_client::rpc_response::RpcResponseContext;
    use solana_sdk::transaction::TransactionError;

    fn logs_response(err: Option<TransactionError>) -> Response<RpcLogsResponse> {
        Response {
            context: RpcResponseContext {
                slot: 42,
                api_version: None,
            },
            value: RpcLogsResponse {
                signature: "5sig".to_string(),
                err,
                logs: vec!["Program 11111111111111111111111111111111 success".to_string()],
            },
        }
    }

    #[test]
    fn test_from_logs() {
        let notification = Notification::from_logs(logs_response(None));
        assert_eq!(
            notification,
            Notification::LogEntry {
                signature: "5sig".to_string(),
                slot: 42,
                failed: false,
            }
        );
        assert_eq!(notification.slot(), 42);
        assert_eq!(notification.source(), "logs");

        let failed = Notification::from_logs(logs_response(Some(TransactionError::AccountNotFound)));
        assert!(matches!(failed, Notification::LogEntry { failed: true, .. }));
    }
}
