use super::*;
use crate::backend::memory::MemoryBackend;
use crate::backend::{Backend, StaticAuth};
use time::OffsetDateTime;

const DEBOUNCE: Duration = Duration::from_millis(800);

struct Fixture {
    tables: Arc<MemoryBackend>,
    pruner: Pruner,
    floor: Uuid,
}

fn fixture() -> Fixture {
    let tables = Arc::new(MemoryBackend::new());
    let backend = Backend::memory(tables.clone(), Arc::new(StaticAuth(Some(Uuid::new_v4()))));
    let pruner = Pruner::new(AreaPresenceStore::new(&backend, true), DEBOUNCE, 3);
    Fixture { tables, pruner, floor: Uuid::new_v4() }
}

impl Fixture {
    fn abandoned_user(&self) -> Uuid {
        let user = Uuid::new_v4();
        let long_ago = OffsetDateTime::now_utc() - time::Duration::hours(2);
        self.tables.seed_presence(user, self.floor, 20.0, 20.0, long_ago);
        user
    }

    fn remaining_users(&self) -> HashSet<Uuid> {
        self.tables.area_rows().iter().map(|r| r.user_id).collect()
    }
}

fn entry(user_id: Uuid, source: PresenceSource, stale: bool) -> MergedPresence {
    MergedPresence {
        user_id,
        display_name: "User".into(),
        avatar_url: None,
        role: None,
        floor_id: None,
        x: 0.0,
        y: 0.0,
        is_walking: false,
        target_x: None,
        target_y: None,
        status_message: None,
        source,
        is_stale: stale,
        last_seen_at: None,
    }
}

#[test]
fn candidates_are_stale_persistent_only_and_never_me() {
    let me = Uuid::new_v4();
    let stale = Uuid::new_v4();
    let merged = vec![
        entry(me, PresenceSource::Persistent, true),
        entry(stale, PresenceSource::Persistent, true),
        entry(Uuid::new_v4(), PresenceSource::Persistent, false),
        entry(Uuid::new_v4(), PresenceSource::Realtime, false),
        entry(Uuid::new_v4(), PresenceSource::Merged, false),
    ];
    assert_eq!(prune_candidates(&merged, Some(me)), vec![stale]);
}

#[tokio::test]
async fn pass_removes_at_most_batch() {
    let f = fixture();
    let users: Vec<Uuid> = (0..5).map(|_| f.abandoned_user()).collect();

    let removed = f.pruner.run_pass(&users).await;
    assert_eq!(removed, users[..3].to_vec());
    assert_eq!(f.remaining_users(), users[3..].iter().copied().collect());

    let removed = f.pruner.run_pass(&users).await;
    assert_eq!(removed, users[3..].to_vec(), "attempted users are skipped");
    assert!(f.remaining_users().is_empty());
}

#[tokio::test]
async fn failed_removal_rolls_back_attempt() {
    let f = fixture();
    let user = f.abandoned_user();
    f.tables.fail_deletes_for(user);

    assert!(f.pruner.run_pass(&[user]).await.is_empty());
    assert!(!f.pruner.was_attempted(user));

    f.tables.allow_deletes_for(user);
    assert_eq!(f.pruner.run_pass(&[user]).await, vec![user]);
    assert!(f.remaining_users().is_empty());
}

#[tokio::test(start_paused = true)]
async fn schedule_waits_for_quiet_stale_set() {
    let f = fixture();
    let a = f.abandoned_user();
    let b = f.abandoned_user();

    f.pruner.schedule(vec![a]);
    tokio::time::sleep(Duration::from_millis(500)).await;
    f.pruner.schedule(vec![a, b]);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(f.remaining_users().len(), 2, "timer restarted on change");

    f.pruner.schedule(vec![a, b]);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(f.remaining_users().is_empty(), "unchanged set keeps the timer");
}

#[tokio::test(start_paused = true)]
async fn cancel_drops_pending_pass() {
    let f = fixture();
    let a = f.abandoned_user();
    f.pruner.schedule(vec![a]);
    f.pruner.cancel();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(f.remaining_users().len(), 1);
}
