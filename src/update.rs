//! Installation and version migration
//!
//! Every storage header records the application version that opened it last.
//! Opening a storage compares that stamp with the deployed version:
//!
//! - no header: the storage is installed from its deployment defaults
//! - same version: nothing to do
//! - other version: the application data update callback runs, then the
//!   header is re-stamped
//!
//! The callback runs after the opened instance is registered in the catalog,
//! so it may open the same storage and migrate its content.

use std::sync::Arc;

use crate::context::StorageContext;
use crate::error::PerResult;
use crate::observability::{log_event, Event};
use crate::redundancy::{HeaderStore, StorageHeader};

/// Result of the version check done on open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HeaderState {
    /// Freshly installed from deployment defaults
    Installed,
    /// Stamped with the deployed version
    Current,
    /// Stamped with another version
    Outdated { previous: String },
}

/// Install the storage if it has no header yet, otherwise compare versions.
///
/// `install` writes the deployment defaults and runs before the header is
/// stored, so an interrupted installation is simply repeated.
pub(crate) fn ensure_header<F>(ctx: &Arc<StorageContext>, headers: &HeaderStore, install: F) -> PerResult<HeaderState>
where
    F: FnOnce() -> PerResult<()>,
{
    headers.prepare()?;
    match headers.load()? {
        None => {
            install()?;
            headers.store(&StorageHeader::new(
                ctx.kind,
                ctx.copies() as u8,
                ctx.application_version.as_str(),
            ))?;
            log_event(
                Event::StorageInstall,
                &[("storage", ctx.id.as_str()), ("version", &ctx.application_version)],
            );
            Ok(HeaderState::Installed)
        }
        Some(header) if header.application_version == ctx.application_version => Ok(HeaderState::Current),
        Some(header) => Ok(HeaderState::Outdated {
            previous: header.application_version,
        }),
    }
}

/// Hand an outdated storage to the application, then re-stamp it.
pub(crate) fn run_migration(ctx: &Arc<StorageContext>, headers: &HeaderStore, previous: &str) -> PerResult<()> {
    log_event(
        Event::MigrationStart,
        &[
            ("storage", ctx.id.as_str()),
            ("from", previous),
            ("to", &ctx.application_version),
        ],
    );
    let invoked = ctx.callbacks.notify_update(&ctx.id, previous);

    let header = match headers.load()? {
        Some(header) => header.stamped(&ctx.application_version),
        None => StorageHeader::new(ctx.kind, ctx.copies() as u8, ctx.application_version.as_str()),
    };
    headers.store(&header)?;

    log_event(
        Event::MigrationComplete,
        &[
            ("storage", ctx.id.as_str()),
            ("version", &ctx.application_version),
            ("callback", if invoked { "invoked" } else { "none" }),
        ],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallbackRegistry;
    use crate::protection::NoProtection;
    use crate::redundancy::test_support::context_with;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_install_then_current() {
        let dir = TempDir::new().unwrap();
        let ctx = crate::redundancy::test_support::context(dir.path(), 3);
        let headers = HeaderStore::new(ctx.clone());

        let mut installed = false;
        let state = ensure_header(&ctx, &headers, || {
            installed = true;
            Ok(())
        })
        .unwrap();
        assert_eq!(state, HeaderState::Installed);
        assert!(installed);

        let state = ensure_header(&ctx, &headers, || panic!("installed twice")).unwrap();
        assert_eq!(state, HeaderState::Current);
    }

    #[test]
    fn test_outdated_runs_callback_and_restamps() {
        let dir = TempDir::new().unwrap();
        let callbacks = Arc::new(CallbackRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        callbacks.register_application_data_update_callback(move |id, previous| {
            sink.lock().unwrap().push((id.to_string(), previous.to_string()));
        });
        let ctx = context_with(dir.path(), 3, false, Arc::new(NoProtection), callbacks);
        let headers = HeaderStore::new(ctx.clone());
        headers
            .store(&StorageHeader::new(ctx.kind, 3, "0.9.0"))
            .unwrap();

        let state = ensure_header(&ctx, &headers, || Ok(())).unwrap();
        assert_eq!(
            state,
            HeaderState::Outdated {
                previous: "0.9.0".into()
            }
        );
        run_migration(&ctx, &headers, "0.9.0").unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("test/store".to_string(), "0.9.0".to_string())]
        );
        assert_eq!(headers.load().unwrap().unwrap().application_version, "1.0.0");
        assert_eq!(ensure_header(&ctx, &headers, || Ok(())).unwrap(), HeaderState::Current);
    }
}
