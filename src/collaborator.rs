//! Outbound collaborator boundary
//!
//! Process lifecycle reporting and security-event telemetry are owned by other
//! components. The engine only calls out to them through [`CollaboratorSink`]
//! and never hands them copies, handles or storage internals.

use crate::error::PerErrc;
use crate::id::StorageId;

/// Lifecycle states reported by the maintenance entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// A maintenance operation started
    MaintenanceRunning,
    /// The maintenance operation ended
    MaintenanceDone,
}

/// A detection worth reporting to security telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityEvent {
    pub storage: StorageId,
    pub element: String,
    pub code: PerErrc,
    pub copies: Vec<u8>,
}

pub trait CollaboratorSink: Send + Sync {
    fn report_state(&self, storage: &StorageId, state: LifecycleState);

    fn report_security_event(&self, event: &SecurityEvent);
}
