//! Outbound notification channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Result, Task};

/// Messages published to the rest of the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    /// A build finished and the service can roll to the new deploy version.
    Upgrade {
        tenant_id: String,
        service_id: String,
        event_id: String,
        deploy_version: String,
        action: String,
    },
    /// Outcome of a service source check.
    CheckResult {
        event_id: String,
        tenant_id: String,
        check_id: String,
        success: bool,
        language: Option<String>,
        message: String,
    },
    /// Outcome of an image or slug share.
    ShareResult {
        event_id: String,
        share_id: String,
        success: bool,
        location: Option<String>,
        message: String,
    },
}

/// Trait for the outbound message channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish an outbound message.
    async fn publish(&self, message: Outbound) -> Result<()>;

    /// Hand a task back to the upstream source so it is delivered again later.
    async fn redeliver(&self, task: Task) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_is_tagged() {
        let msg = Outbound::Upgrade {
            tenant_id: "t".into(),
            service_id: "s".into(),
            event_id: "e".into(),
            deploy_version: "20240101".into(),
            action: "upgrade".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "upgrade");
        assert_eq!(value["deploy_version"], "20240101");
    }
}
