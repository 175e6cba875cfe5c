//! Permission gate - OS authorization state per capability
//!
//! Reads and prompts through the platform `PermissionProvider`, folding the
//! per-identifier results into one state per capability. Never retries a
//! prompt on its own.

use crate::domain::error::ScanError;
use crate::domain::types::{Capability, PermissionState};
use crate::io::permissions::{combine_states, PermissionProvider, Platform};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct PermissionGate {
    provider: Arc<dyn PermissionProvider>,
    platform: Platform,
    camera_tx: watch::Sender<PermissionState>,
    bluetooth_tx: watch::Sender<PermissionState>,
}

impl PermissionGate {
    pub fn new(provider: Arc<dyn PermissionProvider>, platform: Platform) -> Self {
        let (camera_tx, _) = watch::channel(PermissionState::Undetermined);
        let (bluetooth_tx, _) = watch::channel(PermissionState::Undetermined);
        let gate = Self { provider, platform, camera_tx, bluetooth_tx };
        gate.check_status(Capability::Camera);
        gate.check_status(Capability::Bluetooth);
        gate
    }

    /// Current state from the OS cache; never prompts
    pub fn check_status(&self, capability: Capability) -> PermissionState {
        let state = combine_states(
            self.platform
                .permissions_for(capability)
                .into_iter()
                .map(|id| self.provider.check(id)),
        );
        self.publish(capability, state);
        state
    }

    /// Prompt for every identifier not yet granted. Returns immediately when
    /// the capability is already granted or permanently denied.
    pub async fn request_access(&self, capability: Capability) -> PermissionState {
        let current = self.check_status(capability);
        if current.is_resolved() {
            return current;
        }

        for id in self.platform.permissions_for(capability) {
            if self.provider.check(id).is_granted() {
                continue;
            }
            let answer = self.provider.request(id).await;
            info!(
                capability = %capability,
                permission = %id.as_str(),
                state = %answer.as_str(),
                "permission_prompt_resolved"
            );
        }

        let state = self.check_status(capability);
        if !state.is_granted() {
            warn!(capability = %capability, state = %state.as_str(), "permission_not_granted");
        }
        state
    }

    /// Prompt if needed and map anything but a grant to an error
    pub async fn require(&self, capability: Capability) -> Result<(), ScanError> {
        match self.request_access(capability).await {
            PermissionState::Granted => Ok(()),
            PermissionState::DeniedPermanently => {
                Err(ScanError::PermissionDeniedPermanently(capability))
            }
            PermissionState::Denied | PermissionState::Undetermined => {
                Err(ScanError::PermissionDenied(capability))
            }
        }
    }

    pub fn watch(&self, capability: Capability) -> watch::Receiver<PermissionState> {
        self.sender(capability).subscribe()
    }

    pub fn current(&self, capability: Capability) -> PermissionState {
        *self.sender(capability).borrow()
    }

    fn sender(&self, capability: Capability) -> &watch::Sender<PermissionState> {
        match capability {
            Capability::Camera => &self.camera_tx,
            Capability::Bluetooth => &self.bluetooth_tx,
        }
    }

    fn publish(&self, capability: Capability, state: PermissionState) {
        self.sender(capability).send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }
}
