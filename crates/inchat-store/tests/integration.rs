//! Integration tests for the inchat-store crate.
//!
//! These run against a real SQLite database on disk (via tempfile) and
//! exercise the versioning protocol, long-poll waits and the chat flows
//! across reopened connections.

use std::sync::Arc;
use std::time::Duration;

use inchat_store::{
    ChatConfig, ChatError, ChatService, Channel, Database, LoginResult, RepoError, Repository,
    Role, SqliteRepository, delete_latest, migration, update_with,
};

const PASSWORD: &str = "Tr0ub4dor&3";

fn config(dir: &tempfile::TempDir) -> ChatConfig {
    ChatConfig {
        database_path: dir.path().join("inchat.db"),
        password_iterations: 1_000,
        update_attempts: 32,
        ..ChatConfig::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Database lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn migrations_are_idempotent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inchat.db");

    let db = Database::open_and_migrate(path.clone()).await.unwrap();
    db.run_migrations().await.unwrap();
    drop(db);

    let db = Database::open_and_migrate(path).await.unwrap();
    let version = db.execute(|conn| migration::current_version(conn)).await.unwrap();
    assert_eq!(version, migration::LATEST_VERSION);
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inchat.db");

    let saved = {
        let repo = SqliteRepository::<Channel>::new(Database::open_and_migrate(path.clone()).await.unwrap());
        repo.save(Channel::new("general")).await.unwrap()
    };

    let repo = SqliteRepository::<Channel>::new(Database::open_and_migrate(path).await.unwrap());
    assert_eq!(repo.get(saved.identity()).await.unwrap(), saved);
}

// ═══════════════════════════════════════════════════════════════════════
//  Versioning protocol
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_writer_on_the_same_version_sees_the_winner() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("inchat.db")).await.unwrap();
    let repo = SqliteRepository::<Channel>::new(db);

    // Both callers read (A, V0).
    let v0 = repo.save(Channel::new("general")).await.unwrap();
    let first_read = repo.get(v0.identity()).await.unwrap();
    let second_read = repo.get(v0.identity()).await.unwrap();

    // The second caller commits V1.
    let v1 = repo
        .update(&second_read, Channel::new("general-renamed"))
        .await
        .unwrap();

    // The first caller's write on V0 is refused with (A, V1).
    let err = repo
        .update(&first_read, Channel::new("general-other"))
        .await
        .unwrap_err();
    let RepoError::Conflict(current) = err else {
        panic!("expected a conflict, got {err}");
    };
    assert_eq!(current.identity(), v0.identity());
    assert_eq!(current.version(), v1.version());
    assert_eq!(current.value().name, "general-renamed");

    // Recomputing on the carried record goes through.
    let v2 = repo
        .update(&current, Channel::new("general-other"))
        .await
        .unwrap();
    assert_eq!(repo.get(v0.identity()).await.unwrap(), v2);
}

#[tokio::test]
async fn deleted_entities_stay_gone() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("inchat.db")).await.unwrap();
    let repo = Arc::new(SqliteRepository::<Channel>::new(db));
    let v0 = repo.save(Channel::new("general")).await.unwrap();

    let deleters: Vec<_> = (0..4)
        .map(|_| {
            let repo = Arc::clone(&repo);
            let v0 = v0.clone();
            tokio::spawn(async move { repo.delete(&v0).await })
        })
        .collect();
    let mut succeeded = 0;
    for handle in deleters {
        match handle.await.unwrap() {
            Ok(()) => succeeded += 1,
            Err(err) => assert!(err.is_not_found(), "unexpected error: {err}"),
        }
    }
    assert_eq!(succeeded, 1);
    assert!(repo.get(v0.identity()).await.unwrap_err().is_not_found());
    assert!(repo
        .update(&v0, Channel::new("zombie"))
        .await
        .unwrap_err()
        .is_not_found());
}

// ═══════════════════════════════════════════════════════════════════════
//  Long-poll waits
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stale_wait_returns_without_parking() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("inchat.db")).await.unwrap();
    let repo = SqliteRepository::<Channel>::new(db);
    let v0 = repo.save(Channel::new("general")).await.unwrap();
    let v1 = repo.update(&v0, Channel::new("lobby")).await.unwrap();

    let seen = repo
        .wait_for_next_version(v0.identity(), v0.version(), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(seen, v1);
    assert_eq!(repo.waiter().tracked(), 0);
}

#[tokio::test]
async fn many_waiters_wake_on_one_update_and_leave_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("inchat.db")).await.unwrap();
    let repo = Arc::new(SqliteRepository::<Channel>::new(db));
    let v0 = repo.save(Channel::new("general")).await.unwrap();

    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let repo = Arc::clone(&repo);
            let v0 = v0.clone();
            tokio::spawn(async move {
                repo.wait_for_next_version(v0.identity(), v0.version(), Duration::from_secs(5))
                    .await
            })
        })
        .collect();
    while repo.waiter().waiting(v0.identity()) < 5 {
        tokio::task::yield_now().await;
    }

    let v1 = repo.update(&v0, Channel::new("lobby")).await.unwrap();
    for waiter in waiters {
        assert!(waiter.await.unwrap().unwrap().same_snapshot(&v1));
    }
    assert_eq!(repo.waiter().tracked(), 0);

    let err = repo
        .wait_for_next_version(v1.identity(), v1.version(), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Timeout { .. }));
    assert_eq!(repo.waiter().tracked(), 0);
}

#[tokio::test]
async fn follower_keeps_up_with_writers_and_sees_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("inchat.db")).await.unwrap();
    let repo = Arc::new(SqliteRepository::<Channel>::new(db));
    let v0 = repo.save(Channel::new("general")).await.unwrap();

    let follower = {
        let repo = Arc::clone(&repo);
        let id = v0.identity();
        let mut known = v0.version();
        tokio::spawn(async move {
            loop {
                match repo.wait_for_next_version(id, known, Duration::from_secs(5)).await {
                    Ok(next) => known = next.version(),
                    Err(err) => return err,
                }
            }
        })
    };

    let writers: Vec<_> = (0..8)
        .map(|n| {
            let repo = Arc::clone(&repo);
            let v0 = v0.clone();
            tokio::spawn(async move {
                update_with(&*repo, v0, 64, move |c: &Channel| Channel::new(format!("{}-{n}", c.name))).await
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }
    let last = repo.get(v0.identity()).await.unwrap();
    delete_latest(&*repo, last, 3).await.unwrap();

    // Ends on the deletion, never on a timeout behind a stale notification.
    assert!(follower.await.unwrap().is_not_found());
    assert_eq!(repo.waiter().tracked(), 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Chat flows
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn chat_conversation_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let chat = Arc::new(ChatService::open(config(&dir)).await.unwrap());

    let alice_session = chat.register("alice", PASSWORD).await.unwrap();
    let bob_session = chat.register("bobby", PASSWORD).await.unwrap();
    let alice = chat.account(alice_session.value().account).await.unwrap();
    let bob = chat.account(bob_session.value().account).await.unwrap();

    let channel = chat.create_channel(&alice, "general").await.unwrap();
    let joined = chat
        .join_channel(&bob, channel.identity(), Role::Participant)
        .await
        .unwrap();

    // Bob long-polls while Alice posts.
    let poll = {
        let chat = Arc::clone(&chat);
        let (id, known) = (joined.identity(), joined.version());
        tokio::spawn(async move { chat.wait_next_channel_version(id, known).await })
    };
    while chat.channels().waiter().waiting(channel.identity()) == 0 {
        tokio::task::yield_now().await;
    }
    let posted = chat
        .post_message(&alice, channel.identity(), "welcome, bobby")
        .await
        .unwrap();
    let seen = poll.await.unwrap().unwrap();
    assert!(seen.same_snapshot(&posted));

    let events = chat.events(channel.identity()).await.unwrap();
    let senders: Vec<&str> = events.iter().map(|e| e.value().sender.as_str()).collect();
    assert_eq!(senders, ["alice", "bobby", "alice"]);
    assert_eq!(events[2].value().content(), Some("welcome, bobby"));

    chat.logout(bob_session.clone()).await.unwrap();
    assert!(matches!(
        chat.restore_session(bob_session.identity()).await,
        Err(ChatError::NotFound { .. })
    ));
}

#[tokio::test]
async fn throttle_blocks_then_recovers_with_short_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.throttle.max_failures = 3;
    config.throttle.cooldown_secs = 1;
    let chat = ChatService::open(config).await.unwrap();
    chat.register("alice", PASSWORD).await.unwrap();

    assert_eq!(
        chat.login("alice", "wrong-pass").await.unwrap(),
        LoginResult::Denied { failures: 1 }
    );
    assert_eq!(
        chat.login("alice", "wrong-pass").await.unwrap(),
        LoginResult::Denied { failures: 2 }
    );
    assert!(matches!(
        chat.login("alice", "wrong-pass").await.unwrap(),
        LoginResult::Blocked { .. }
    ));

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(matches!(
        chat.login("alice", PASSWORD).await.unwrap(),
        LoginResult::Allowed { .. }
    ));
}

#[tokio::test]
async fn state_is_shared_across_service_instances() {
    let dir = tempfile::tempdir().unwrap();
    let session = {
        let chat = ChatService::open(config(&dir)).await.unwrap();
        chat.register("alice", PASSWORD).await.unwrap()
    };

    let chat = ChatService::open(config(&dir)).await.unwrap();
    assert_eq!(chat.restore_session(session.identity()).await.unwrap(), session);
    assert!(matches!(
        chat.register("alice", PASSWORD).await,
        Err(ChatError::Duplicate { .. })
    ));
}
