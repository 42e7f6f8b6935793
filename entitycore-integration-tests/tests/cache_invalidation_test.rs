//! The shared cache across transactions: pooled reuse, absent-stream
//! caching, and invalidation driven by the log's commit feed.

use entitycore::cache::CheckoutOrigin;
use entitycore::entity::Entity;
use entitycore::types::StreamRevision;
use entitycore_integration_tests::{Account, Harness};

fn rev(n: u64) -> StreamRevision {
    StreamRevision::try_new(n).unwrap()
}

#[tokio::test]
async fn sequential_transactions_reuse_the_pooled_instance() {
    let harness = Harness::new();
    let id = Harness::stream("acct-1");

    let mut setup = harness.store();
    setup.add(Account::open("acct-1", "ada")).unwrap();
    setup.save_changes(StreamRevision::initial()).await.unwrap();
    setup.dispose();

    // First reader replays; disposal returns the clean instance to the
    // pool.
    let mut txn = harness.store();
    txn.get_by_id::<Account>(&id).await.unwrap().unwrap();
    txn.dispose();
    let reads_after_first = harness.counting.reads();

    // Second reader is served from the pool without a log read.
    let mut txn = harness.store();
    txn.get_by_id::<Account>(&id).await.unwrap().unwrap();
    txn.dispose();
    assert_eq!(harness.counting.reads(), reads_after_first);
}

#[tokio::test]
async fn absent_streams_are_answered_from_the_recorded_absence() {
    let harness = Harness::new();
    let id = Harness::stream("ghost");

    let mut txn = harness.store();
    assert!(txn.get_by_id::<Account>(&id).await.unwrap().is_none());
    let reads_after_first = harness.counting.reads();

    assert!(txn.get_by_id::<Account>(&id).await.unwrap().is_none());
    let mut other = harness.store();
    assert!(other.get_by_id::<Account>(&id).await.unwrap().is_none());
    assert_eq!(
        harness.counting.reads(),
        reads_after_first,
        "repeat lookups of a nonexistent stream must not re-read the log"
    );
}

#[tokio::test]
async fn commit_feed_invalidates_and_forces_a_fresh_read() {
    let harness = Harness::wired();
    let id = Harness::stream("acct-1");

    let mut setup = harness.store();
    setup.add(Account::open("acct-1", "ada")).unwrap();
    setup.save_changes(StreamRevision::initial()).await.unwrap();
    setup.dispose();

    // Park an instance at revision 1.
    let mut reader = harness.store();
    reader.get_by_id::<Account>(&id).await.unwrap().unwrap();
    reader.dispose();
    assert_eq!(harness.cache.recorded_revision(&id), Some(rev(1)));

    // A writer commits; the commit listener invalidates the stream.
    let mut writer = harness.store();
    let account = writer.get_by_id::<Account>(&id).await.unwrap().unwrap();
    account.credit(40);
    writer.update(&id).unwrap();
    writer.save_changes(rev(1)).await.unwrap();
    writer.dispose();
    assert_eq!(harness.cache.recorded_revision(&id), None);

    // The next reader replays from the log and sees the new state.
    let checkout = harness.cache.checkout(&id).await.unwrap();
    assert_eq!(checkout.origin, CheckoutOrigin::Replayed);
    assert_eq!(checkout.revision, rev(2));
    let account = checkout.entity.unwrap();
    let account = account.as_any().downcast_ref::<Account>().unwrap();
    assert_eq!(account.balance, 40);
}

#[tokio::test]
async fn stale_instance_is_dropped_at_release_after_invalidation() {
    let harness = Harness::wired();
    let id = Harness::stream("acct-1");

    let mut setup = harness.store();
    setup.add(Account::open("acct-1", "ada")).unwrap();
    setup.save_changes(StreamRevision::initial()).await.unwrap();
    setup.dispose();

    // Reader checks out at revision 1 and holds the instance while a
    // writer commits revision 2.
    let mut reader = harness.store();
    reader.get_by_id::<Account>(&id).await.unwrap().unwrap();

    let mut writer = harness.store();
    let account = writer.get_by_id::<Account>(&id).await.unwrap().unwrap();
    account.credit(40);
    writer.update(&id).unwrap();
    writer.save_changes(rev(1)).await.unwrap();
    writer.dispose();

    // Disposal tries to release the revision-1 instance; the cache must
    // drop it rather than let it re-enter circulation.
    reader.dispose();

    let checkout = harness.cache.checkout(&id).await.unwrap();
    assert_eq!(checkout.origin, CheckoutOrigin::Replayed);
    let account = checkout.entity.unwrap();
    let account = account.as_any().downcast_ref::<Account>().unwrap();
    assert_eq!(account.balance, 40, "stale state must never be served");
}
