//! Crash-and-restart durability: queued messages survive a process
//! boundary and are re-attempted exactly once.

mod common;

use common::{dead_addr, fast_options, wait_for, PostScript, TestServer};
use courier::storage::database_path;
use courier::{Database, Messenger};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_queued_messages_survive_restart_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = database_path(dir.path());
    let offline_addr = dead_addr().await;

    // first run: the server is unreachable, two messages get queued
    {
        let db = Arc::new(Database::open(&db_path).unwrap());
        let messenger = Messenger::start(fast_options(&offline_addr, "alice"), db.clone())
            .await
            .unwrap();
        messenger.send("bob", "first").await.unwrap();
        messenger.send("bob", "second").await.unwrap();
        assert_eq!(
            db.outbox_list_pending(messenger.user_id()).unwrap().len(),
            2
        );
        messenger.shutdown().await;
    }

    // second run, same database file, server now reachable: the replay
    // delivers both messages in their original order
    let server = TestServer::start().await;
    let db = Arc::new(Database::open(&db_path).unwrap());
    let messenger = Messenger::start(fast_options(&server.addr, "alice"), db.clone())
        .await
        .unwrap();

    assert!(
        wait_for(WAIT, || { server.posts().len() == 2 }).await,
        "replayed messages were not delivered"
    );
    let bodies: Vec<String> = server.posts().into_iter().map(|(_, body)| body).collect();
    assert_eq!(bodies, vec!["first", "second"]);

    // exactly once: nothing further arrives and no durable record remains
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.posts().len(), 2);
    assert!(
        wait_for(WAIT, || {
            db.outbox_list_pending(messenger.user_id()).unwrap().is_empty()
        })
        .await
    );

    messenger.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_send_is_durable_before_any_network_activity() {
    let offline_addr = dead_addr().await;
    let db = Arc::new(Database::open_in_memory().unwrap());
    let messenger = Messenger::start(fast_options(&offline_addr, "alice"), db.clone())
        .await
        .unwrap();

    let entry = messenger.send("bob", "keep me").await.unwrap();

    // the durable entry exists the moment send() returns
    let stored = db.outbox_entry(entry.outbox_id).unwrap();
    assert_eq!(stored.body, "keep me");
    assert_eq!(stored.attempts, 0);

    messenger.shutdown().await;
}

#[tokio::test]
async fn test_failed_entry_survives_restart_until_manually_retried() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = database_path(dir.path());

    let server = TestServer::start().await;
    server.set_default_post(PostScript::Error("mailbox full"));

    let outbox_id;
    {
        let db = Arc::new(Database::open(&db_path).unwrap());
        let mut options = fast_options(&server.addr, "alice");
        options.max_retries = 1;
        let messenger = Messenger::start(options, db.clone()).await.unwrap();
        let entry = messenger.send("bob", "stubborn").await.unwrap();
        outbox_id = entry.outbox_id;

        let user_id = messenger.user_id();
        assert!(
            wait_for(WAIT, || {
                db.outbox_list_failed(user_id).unwrap().len() == 1
            })
            .await,
            "entry never reached the failed state"
        );
        messenger.shutdown().await;
    }

    // failed entries are not replayed automatically...
    server.set_default_post(PostScript::Ok);
    let db = Arc::new(Database::open(&db_path).unwrap());
    let messenger = Messenger::start(fast_options(&server.addr, "alice"), db.clone())
        .await
        .unwrap();
    let user_id = messenger.user_id();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.posts().is_empty());
    assert_eq!(db.outbox_list_failed(user_id).unwrap().len(), 1);
    messenger.shutdown().await;

    // ...but a manual reset puts them back on the replay path
    db.outbox_reset(outbox_id).unwrap();
    let messenger = Messenger::start(fast_options(&server.addr, "alice"), db.clone())
        .await
        .unwrap();
    assert!(
        wait_for(WAIT, || { server.posts().len() == 1 }).await,
        "reset entry was not delivered"
    );
    assert_eq!(server.posts()[0].1, "stubborn");

    messenger.shutdown().await;
    server.stop().await;
}
