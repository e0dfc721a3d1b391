//! External-change bus shared by every facade of one table.
//!
//! Each registration is tagged with the identity of the facade that made it.
//! A change is fanned out to every registration whose identity differs from
//! the writer's; registrations without an identity never fire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tabkv_core::{ChangeEvent, FacadeIdentity, StorageError, TabKvResult};

use crate::{ExternalChangeListener, Subscription};

struct Registration {
    id: u64,
    owner: Option<FacadeIdentity>,
    listener: ExternalChangeListener,
}

/// Listener registry for one shared table.
#[derive(Default)]
pub struct ExternalChangeBus {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl ExternalChangeBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` on behalf of `owner`.
    ///
    /// The returned subscription removes exactly this registration.
    pub fn register(
        self: &Arc<Self>,
        owner: Option<FacadeIdentity>,
        listener: ExternalChangeListener,
    ) -> TabKvResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .push(Registration {
                id,
                owner,
                listener,
            });

        let bus = Arc::downgrade(self);
        Ok(Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.registrations
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|r| r.id != id);
            }
        }))
    }

    /// Deliver `event` to every listener not owned by `origin`.
    ///
    /// Listeners run synchronously in registration order. The registry lock
    /// is released before any listener runs, so listeners may write to the
    /// table or (un)register themselves.
    pub fn notify(&self, origin: Option<&FacadeIdentity>, event: &ChangeEvent) -> TabKvResult<()> {
        let Some(origin) = origin else {
            return Ok(());
        };

        let targets: Vec<ExternalChangeListener> = self
            .registrations
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .iter()
            .filter(|r| matches!(&r.owner, Some(owner) if owner != origin))
            .map(|r| Arc::clone(&r.listener))
            .collect();

        for listener in targets {
            listener(event);
        }
        Ok(())
    }

    /// Number of registrations, including ones that can never fire.
    pub fn len(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
