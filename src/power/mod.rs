//! Power and lifecycle command dispatch.
//!
//! Commands are fire-and-poll: the dispatcher returns once the platform
//! accepts the command, and callers observe the transition through later
//! listings. A stop deallocates by default, which releases the compute
//! reservation; a plain power-off keeps the VM allocated.

use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::remote::CloudCompute;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    #[default]
    Deallocate,
    PowerOff,
}

impl std::fmt::Display for StopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deallocate => write!(f, "deallocate"),
            Self::PowerOff => write!(f, "power_off"),
        }
    }
}

pub struct PowerDispatcher {
    compute: Arc<dyn CloudCompute>,
}

impl PowerDispatcher {
    pub fn new(compute: Arc<dyn CloudCompute>) -> Self {
        Self { compute }
    }

    /// Fire a start command for the VM. Acceptance only; the VM reaches
    /// running state out-of-band.
    pub async fn start(&self, vm_id: &str) -> Result<()> {
        info!(vm_id = %vm_id, "Requesting VM start");
        self.compute.power_start(vm_id).await?;
        info!(vm_id = %vm_id, "VM start accepted");
        Ok(())
    }

    /// Fire a stop command for the VM.
    pub async fn stop(&self, vm_id: &str, mode: StopMode) -> Result<()> {
        info!(vm_id = %vm_id, mode = %mode, "Requesting VM stop");
        self.compute
            .power_stop(vm_id, mode == StopMode::Deallocate)
            .await?;
        info!(vm_id = %vm_id, mode = %mode, "VM stop accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LabError;
    use crate::remote::ScriptedPlatform;

    #[tokio::test]
    async fn test_stop_deallocates_by_default() {
        let platform = Arc::new(ScriptedPlatform::new());
        let dispatcher = PowerDispatcher::new(platform.clone());

        dispatcher.stop("vm-3", StopMode::default()).await.unwrap();
        assert_eq!(
            platform.power_commands(),
            vec![("vm-3".to_string(), Some(true))]
        );
    }

    #[tokio::test]
    async fn test_power_off_keeps_allocation() {
        let platform = Arc::new(ScriptedPlatform::new());
        let dispatcher = PowerDispatcher::new(platform.clone());

        dispatcher.stop("vm-3", StopMode::PowerOff).await.unwrap();
        dispatcher.start("vm-4").await.unwrap();
        assert_eq!(
            platform.power_commands(),
            vec![
                ("vm-3".to_string(), Some(false)),
                ("vm-4".to_string(), None)
            ]
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_surfaces_unchanged() {
        let platform = Arc::new(ScriptedPlatform::new());
        platform.fail_on("power_start", "409 - operation in progress");
        let dispatcher = PowerDispatcher::new(platform.clone());

        let err = dispatcher.start("vm-5").await.unwrap_err();
        match err {
            LabError::Upstream { operation, message } => {
                assert_eq!(operation, "power_start");
                assert_eq!(message, "409 - operation in progress");
            }
            other => panic!("expected Upstream, got {other:?}"),
        }
    }
}
