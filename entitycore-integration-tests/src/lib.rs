//! Integration test fixtures for `EntityCore`
//!
//! A small account domain exercising the full pipeline: a base entity type
//! with a derived type reached mid-stream through a promotion event, a
//! terminal close event, a wired-up replayer registry, and a counting
//! decorator over any event log so tests can assert when the log was
//! actually consulted.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use entitycore::cache::EntityCache;
use entitycore::entity::{Entity, EntityTypeInfo};
use entitycore::errors::{EventLogResult, ReplayError};
use entitycore::event::{DomainEvent, EventKind, PendingEvent};
use entitycore::event_log::{EventLog, EventStream, EventToAppend};
use entitycore::replayer::ReplayerRegistry;
use entitycore::store::EntityStore;
use entitycore::types::{StreamId, StreamRevision};
use entitycore_memory::InMemoryEventLog;

/// Base entity type of the account hierarchy.
pub static ACCOUNT: EntityTypeInfo = EntityTypeInfo::root("Account");
/// Derived entity type reached through a promotion event.
pub static SAVINGS_ACCOUNT: EntityTypeInfo = EntityTypeInfo::derived("SavingsAccount", &ACCOUNT);

/// Kind tag for [`AccountOpened`].
pub const ACCOUNT_OPENED: EventKind = EventKind::new("AccountOpened");
/// Kind tag for [`AccountCredited`].
pub const ACCOUNT_CREDITED: EventKind = EventKind::new("AccountCredited");
/// Kind tag for [`AccountPromoted`].
pub const ACCOUNT_PROMOTED: EventKind = EventKind::new("AccountPromoted");
/// Kind tag for [`AccountClosed`].
pub const ACCOUNT_CLOSED: EventKind = EventKind::new("AccountClosed");

/// A new account came into existence.
#[derive(Debug, Clone)]
pub struct AccountOpened {
    /// Stream the account lives in.
    pub account: String,
    /// Display name of the owner.
    pub owner: String,
}

impl DomainEvent for AccountOpened {
    fn kind(&self) -> EventKind {
        ACCOUNT_OPENED
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Money arrived.
#[derive(Debug, Clone)]
pub struct AccountCredited {
    /// Amount in minor units.
    pub amount: i64,
}

impl DomainEvent for AccountCredited {
    fn kind(&self) -> EventKind {
        ACCOUNT_CREDITED
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The account was refined into a savings account.
#[derive(Debug, Clone)]
pub struct AccountPromoted {
    /// Interest rate in basis points.
    pub rate_bps: u32,
}

impl DomainEvent for AccountPromoted {
    fn kind(&self) -> EventKind {
        ACCOUNT_PROMOTED
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Terminal event: the account is gone.
#[derive(Debug, Clone)]
pub struct AccountClosed;

impl DomainEvent for AccountClosed {
    fn kind(&self) -> EventKind {
        ACCOUNT_CLOSED
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The base account projection.
#[derive(Debug)]
pub struct Account {
    id: StreamId,
    /// Display name of the owner.
    pub owner: String,
    /// Balance in minor units.
    pub balance: i64,
    pending: Vec<PendingEvent>,
}

impl Account {
    /// Creates a brand-new account, recording its opening event.
    pub fn open(account: &str, owner: &str) -> Self {
        let mut opened = Self::from_opened(&AccountOpened {
            account: account.to_string(),
            owner: owner.to_string(),
        });
        opened.pending.push(PendingEvent::new(AccountOpened {
            account: account.to_string(),
            owner: owner.to_string(),
        }));
        opened
    }

    /// Replay construction: no pending events.
    pub fn from_opened(event: &AccountOpened) -> Self {
        Self {
            id: StreamId::try_new(event.account.clone()).expect("fixture stream id"),
            owner: event.owner.clone(),
            balance: 0,
            pending: Vec::new(),
        }
    }

    /// Business mutation: updates the balance and records the event.
    pub fn credit(&mut self, amount: i64) {
        self.apply_credit(&AccountCredited { amount });
        self.pending
            .push(PendingEvent::new(AccountCredited { amount }));
    }

    /// Replay application: state only.
    pub fn apply_credit(&mut self, event: &AccountCredited) {
        self.balance += event.amount;
    }

    /// Records a promotion; the refined type appears on the next replay.
    pub fn promote(&mut self, rate_bps: u32) {
        self.pending
            .push(PendingEvent::new(AccountPromoted { rate_bps }));
    }
}

impl Entity for Account {
    fn type_info(&self) -> &'static EntityTypeInfo {
        &ACCOUNT
    }

    fn stream_id(&self) -> &StreamId {
        &self.id
    }

    fn pending_events(&self) -> Vec<PendingEvent> {
        self.pending.clone()
    }

    fn clear_pending_events(&mut self) {
        self.pending.clear();
    }

    fn removal_event(&self) -> PendingEvent {
        PendingEvent::new(AccountClosed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The refined account projection, reached via [`AccountPromoted`].
#[derive(Debug)]
pub struct SavingsAccount {
    id: StreamId,
    /// Display name of the owner.
    pub owner: String,
    /// Balance in minor units.
    pub balance: i64,
    /// Interest rate in basis points.
    pub rate_bps: u32,
    pending: Vec<PendingEvent>,
}

impl SavingsAccount {
    /// Replay construction from the base account at promotion time.
    pub fn from_account(account: &Account, rate_bps: u32) -> Self {
        Self {
            id: account.stream_id().clone(),
            owner: account.owner.clone(),
            balance: account.balance,
            rate_bps,
            pending: Vec::new(),
        }
    }

    /// Business mutation: updates the balance and records the event.
    pub fn credit(&mut self, amount: i64) {
        self.apply_credit(&AccountCredited { amount });
        self.pending
            .push(PendingEvent::new(AccountCredited { amount }));
    }

    /// Replay application: state only.
    pub fn apply_credit(&mut self, event: &AccountCredited) {
        self.balance += event.amount;
    }
}

impl Entity for SavingsAccount {
    fn type_info(&self) -> &'static EntityTypeInfo {
        &SAVINGS_ACCOUNT
    }

    fn stream_id(&self) -> &StreamId {
        &self.id
    }

    fn pending_events(&self) -> Vec<PendingEvent> {
        self.pending.clone()
    }

    fn clear_pending_events(&mut self) {
        self.pending.clear();
    }

    fn removal_event(&self) -> PendingEvent {
        PendingEvent::new(AccountClosed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn apply_failed(kind: EventKind, message: &'static str) -> ReplayError {
    ReplayError::ApplyFailed {
        kind,
        source: message.into(),
    }
}

/// Builds a registry wired for the account domain.
///
/// The credit replayer is registered against the base type only, so it
/// serves both concrete types through the ancestry walk. Promotion swaps
/// the concrete type mid-fold; close is terminal.
pub fn account_registry() -> ReplayerRegistry {
    let registry = ReplayerRegistry::new();
    registry.register_event::<AccountOpened, _>(ACCOUNT_OPENED, &ACCOUNT, |event, _prior| {
        Ok(Some(Box::new(Account::from_opened(event))))
    });
    registry.register_event::<AccountCredited, _>(ACCOUNT_CREDITED, &ACCOUNT, |event, prior| {
        let mut boxed = prior
            .ok_or_else(|| apply_failed(ACCOUNT_CREDITED, "credit before the account existed"))?;
        if let Some(account) = boxed.as_any_mut().downcast_mut::<Account>() {
            account.apply_credit(event);
        } else if let Some(savings) = boxed.as_any_mut().downcast_mut::<SavingsAccount>() {
            savings.apply_credit(event);
        } else {
            return Err(apply_failed(ACCOUNT_CREDITED, "credit on unknown entity type"));
        }
        Ok(Some(boxed))
    });
    registry.register_event::<AccountPromoted, _>(ACCOUNT_PROMOTED, &ACCOUNT, |event, prior| {
        let boxed = prior
            .ok_or_else(|| apply_failed(ACCOUNT_PROMOTED, "promotion before the account existed"))?;
        let account = boxed
            .as_any()
            .downcast_ref::<Account>()
            .ok_or_else(|| apply_failed(ACCOUNT_PROMOTED, "promotion of a non-base account"))?;
        Ok(Some(Box::new(SavingsAccount::from_account(
            account,
            event.rate_bps,
        ))))
    });
    registry
        .register_event::<AccountClosed, _>(ACCOUNT_CLOSED, &ACCOUNT, |_event, _prior| Ok(None));
    registry
}

/// Decorator over any event log that counts stream reads and appends.
pub struct CountingLog {
    inner: Arc<dyn EventLog>,
    reads: AtomicUsize,
    appends: AtomicUsize,
}

impl CountingLog {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn EventLog>) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
        }
    }

    /// Number of `read_stream` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `append` calls so far.
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventLog for CountingLog {
    async fn read_stream(&self, stream_id: &StreamId) -> EventLogResult<EventStream> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.inner.read_stream(stream_id).await
    }

    async fn revision(&self, stream_id: &StreamId) -> EventLogResult<StreamRevision> {
        self.inner.revision(stream_id).await
    }

    async fn append(
        &self,
        events: Vec<EventToAppend>,
        expected: StreamRevision,
    ) -> EventLogResult<StreamRevision> {
        self.appends.fetch_add(1, Ordering::Relaxed);
        self.inner.append(events, expected).await
    }
}

/// Everything a test needs: the memory log, a counting decorator over it,
/// and a shared cache folding through the account registry.
pub struct Harness {
    /// The backing in-memory log (for direct seeding and listener wiring).
    pub log: Arc<InMemoryEventLog>,
    /// The counting decorator every component reads through.
    pub counting: Arc<CountingLog>,
    /// The shared entity cache.
    pub cache: Arc<EntityCache>,
}

impl Harness {
    /// Builds a harness; the invalidation feed is not wired.
    pub fn new() -> Self {
        init_tracing();
        let log = Arc::new(InMemoryEventLog::new());
        let counting = Arc::new(CountingLog::new(
            Arc::clone(&log) as Arc<dyn EventLog>
        ));
        let cache = Arc::new(EntityCache::new(
            Arc::clone(&counting) as Arc<dyn EventLog>,
            Arc::new(account_registry()),
        ));
        Self {
            log,
            counting,
            cache,
        }
    }

    /// Builds a harness with the memory log's commit listener wired to
    /// cache invalidation, the way a production invalidation feed would
    /// be.
    pub fn wired() -> Self {
        let harness = Self::new();
        let cache = Arc::downgrade(&harness.cache);
        harness.log.on_commit(move |stream_id| {
            if let Some(cache) = Weak::upgrade(&cache) {
                cache.invalidate(stream_id);
            }
        });
        harness
    }

    /// Opens a fresh transaction over the shared collaborators.
    pub fn store(&self) -> EntityStore {
        EntityStore::new(
            Arc::clone(&self.counting) as Arc<dyn EventLog>,
            Arc::clone(&self.cache),
        )
    }

    /// Stream id helper.
    pub fn stream(raw: &str) -> StreamId {
        StreamId::try_new(raw).expect("fixture stream id")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
