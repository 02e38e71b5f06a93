//! Application callback registry
//!
//! Holds at most one recovery-report callback, one application-data-update
//! callback and one collaborator sink. A later registration replaces the
//! earlier one. Callbacks are cloned out of the lock before they run, so a
//! callback may itself open storages or re-register.

use std::sync::{Arc, RwLock};

use crate::collaborator::{CollaboratorSink, LifecycleState, SecurityEvent};
use crate::id::StorageId;
use crate::locks;
use crate::observability::{log_event, Event};
use crate::redundancy::RecoveryReportKind;

pub type RecoveryReportCallback = dyn Fn(&StorageId, RecoveryReportKind, &[String], &[u8]) + Send + Sync;

pub type ApplicationDataUpdateCallback = dyn Fn(&StorageId, &str) + Send + Sync;

#[derive(Default)]
pub struct CallbackRegistry {
    recovery: RwLock<Option<Arc<RecoveryReportCallback>>>,
    update: RwLock<Option<Arc<ApplicationDataUpdateCallback>>>,
    collaborator: RwLock<Option<Arc<dyn CollaboratorSink>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called as `f(storage, kind, element_names, copy_indices)`.
    pub fn register_recovery_report_callback<F>(&self, f: F)
    where
        F: Fn(&StorageId, RecoveryReportKind, &[String], &[u8]) + Send + Sync + 'static,
    {
        *locks::write(&self.recovery) = Some(Arc::new(f));
    }

    /// Called as `f(storage, previous_application_version)`.
    pub fn register_application_data_update_callback<F>(&self, f: F)
    where
        F: Fn(&StorageId, &str) + Send + Sync + 'static,
    {
        *locks::write(&self.update) = Some(Arc::new(f));
    }

    pub fn set_collaborator(&self, sink: Arc<dyn CollaboratorSink>) {
        *locks::write(&self.collaborator) = Some(sink);
    }

    /// Drop every registration.
    pub fn clear(&self) {
        *locks::write(&self.recovery) = None;
        *locks::write(&self.update) = None;
        *locks::write(&self.collaborator) = None;
    }

    pub(crate) fn report_recovery(
        &self,
        storage: &StorageId,
        kind: RecoveryReportKind,
        elements: &[String],
        copies: &[u8],
    ) {
        let event = if kind.is_failure() {
            Event::RecoveryFailed
        } else {
            Event::RecoveryComplete
        };
        let names = elements.join(",");
        let copy_list = copies.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",");
        log_event(
            event,
            &[
                ("storage", storage.as_str()),
                ("kind", kind.as_str()),
                ("elements", &names),
                ("copies", &copy_list),
            ],
        );

        let callback = locks::read(&self.recovery).clone();
        if let Some(cb) = callback {
            cb(storage, kind, elements, copies);
        }
    }

    /// Returns whether a callback was registered.
    pub(crate) fn notify_update(&self, storage: &StorageId, previous_version: &str) -> bool {
        let callback = locks::read(&self.update).clone();
        match callback {
            Some(cb) => {
                cb(storage, previous_version);
                true
            }
            None => false,
        }
    }

    pub(crate) fn report_state(&self, storage: &StorageId, state: LifecycleState) {
        let sink = locks::read(&self.collaborator).clone();
        if let Some(sink) = sink {
            sink.report_state(storage, state);
        }
    }

    pub(crate) fn report_security_event(&self, event: &SecurityEvent) {
        let sink = locks::read(&self.collaborator).clone();
        if let Some(sink) = sink {
            sink.report_security_event(event);
        }
    }
}
