// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of decoded deposit events to registered handlers.
//!
//! Each registration pairs an event handler with an error handler. Domain
//! events go to the event handlers of their kind; feed faults go to the error
//! handlers of every live registration, so a transport failure never shows
//! up as an event. The registration table is swapped atomically on
//! subscribe and cancel, delivery works on a snapshot.

use crate::error::GatewayError;
use crate::events::{DomainEvent, EventKind};
use crate::metrics::GatewayMetrics;
use crate::types::RawEthLog;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Handlers run inline on the gateway's single dispatch task, one after the
/// other. A slow handler holds back delivery of every later event and error,
/// so long-running work belongs on a task the handler spawns or feeds.
pub type EventHandler = Arc<dyn Fn(DomainEvent) -> anyhow::Result<()> + Send + Sync>;
/// Runs on the dispatch task, like [`EventHandler`].
pub type ErrorHandler = Arc<dyn Fn(GatewayError) + Send + Sync>;

struct Registration {
    id: u64,
    cancel: CancellationToken,
    handler: EventHandler,
    on_error: ErrorHandler,
}

type RegistrationTable = HashMap<EventKind, Vec<Arc<Registration>>>;

struct RegistryInner {
    next_id: AtomicU64,
    table: ArcSwap<RegistrationTable>,
    metrics: Arc<GatewayMetrics>,
}

impl RegistryInner {
    fn remove(&self, kind: EventKind, id: u64) {
        let mut removed = false;
        self.table.rcu(|table| {
            let mut next = RegistrationTable::clone(table);
            if let Some(registrations) = next.get_mut(&kind) {
                let before = registrations.len();
                registrations.retain(|r| r.id != id);
                removed = registrations.len() != before;
                if registrations.is_empty() {
                    next.remove(&kind);
                }
            }
            next
        });
        if removed {
            self.metrics.active_subscriptions.dec();
        }
    }
}

/// A live registration of one handler against one event kind.
///
/// Dropping the handle leaves the registration in place; call
/// [`Subscription::cancel`] to stop delivery.
pub struct Subscription {
    id: u64,
    kind: EventKind,
    cancel: CancellationToken,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops delivery of events dispatched after this call. A handler
    /// invocation already running is not interrupted.
    pub fn cancel(self) {
        self.cancel.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.kind, self.id);
        }
        debug!("[SubscriptionRegistry] Cancelled {} subscription #{}", self.kind, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(0),
                table: ArcSwap::from_pointee(RegistrationTable::new()),
                metrics,
            }),
        }
    }

    pub fn subscribe<H, E>(&self, kind: EventKind, handler: H, on_error: E) -> Subscription
    where
        H: Fn(DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(GatewayError) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let registration = Arc::new(Registration {
            id,
            cancel: cancel.clone(),
            handler: Arc::new(handler),
            on_error: Arc::new(on_error),
        });
        self.inner.table.rcu(|table| {
            let mut next = RegistrationTable::clone(table);
            next.entry(kind).or_default().push(registration.clone());
            next
        });
        self.inner.metrics.active_subscriptions.inc();
        debug!("[SubscriptionRegistry] Registered {} subscription #{}", kind, id);

        Subscription {
            id,
            kind,
            cancel,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscription_count(&self, kind: EventKind) -> usize {
        self.inner
            .table
            .load()
            .get(&kind)
            .map(|registrations| {
                registrations
                    .iter()
                    .filter(|r| !r.cancel.is_cancelled())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Decodes `log` and delivers the event. Undecodable logs are logged
    /// and dropped. Returns the number of handlers invoked.
    pub fn deliver_log(&self, log: &RawEthLog) -> usize {
        match DomainEvent::try_from_eth_log(log) {
            Ok(event) => self.deliver(event),
            Err(e) => {
                let e = GatewayError::from(e);
                self.inner.metrics.events_undecodable.inc();
                warn!(
                    "[SubscriptionRegistry] Dropping undecodable log: tx_hash={:?}, block={}, error={}",
                    log.tx_hash, log.block_number, e
                );
                0
            }
        }
    }

    /// Invokes every live handler registered for the event's kind, once
    /// each. A failing or panicking handler does not affect the others.
    pub fn deliver(&self, event: DomainEvent) -> usize {
        let kind = event.kind();
        let kind_label = kind.to_string();
        self.inner
            .metrics
            .events_received
            .with_label_values(&[&kind_label])
            .inc();

        let table = self.inner.table.load();
        let Some(registrations) = table.get(&kind) else {
            debug!(
                "[SubscriptionRegistry] No subscribers for {} of deposit {}",
                kind,
                event.deposit_address()
            );
            return 0;
        };

        let mut invoked = 0;
        for registration in registrations.iter() {
            if registration.cancel.is_cancelled() {
                continue;
            }
            invoked += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| (registration.handler)(event.clone())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.inner
                        .metrics
                        .handler_failures
                        .with_label_values(&[&kind_label])
                        .inc();
                    warn!(
                        "[SubscriptionRegistry] Handler #{} failed on {} of deposit {}: {:?}",
                        registration.id,
                        kind,
                        event.deposit_address(),
                        e
                    );
                }
                Err(_) => {
                    self.inner
                        .metrics
                        .handler_failures
                        .with_label_values(&[&kind_label])
                        .inc();
                    error!(
                        "[SubscriptionRegistry] Handler #{} panicked on {} of deposit {}",
                        registration.id,
                        kind,
                        event.deposit_address()
                    );
                }
            }
        }
        invoked
    }

    /// Reports a feed fault to the error handler of every live subscription.
    pub fn deliver_error(&self, error: GatewayError) -> usize {
        self.inner.metrics.transport_errors.inc();
        warn!("[SubscriptionRegistry] Log feed fault: {}", error);

        let table = self.inner.table.load();
        let mut notified = 0;
        for registration in table.values().flatten() {
            if registration.cancel.is_cancelled() {
                continue;
            }
            notified += 1;
            let on_error = &registration.on_error;
            if catch_unwind(AssertUnwindSafe(|| on_error(error.clone()))).is_err() {
                error!(
                    "[SubscriptionRegistry] Error handler of subscription #{} panicked",
                    registration.id
                );
            }
        }
        notified
    }
}
