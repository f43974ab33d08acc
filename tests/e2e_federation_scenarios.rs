//! E2E federation scenarios between a node and a fake remote server

mod common;

use std::time::Duration;

use axum::http::Method;
use common::{FakeRemote, SignaturePolicy, TestNode};
use hearth::data::{ActorRepository, PUBLIC_ADDRESS};
use hearth::error::AppError;
use hearth::federation::verify_parts;
use hearth::service::{NewNote, Visibility};
use serde_json::json;

#[tokio::test]
async fn test_direct_note_is_posted_once_and_verifies() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    node.register("alice").await;
    let bob = remote.add_actor("bob", false);

    let (note, batch) = node
        .state
        .notes
        .post(
            "alice",
            NewNote {
                content: "hello bob".to_string(),
                visibility: Visibility::Direct,
                mentions: vec![bob.clone()],
                in_reply_to: None,
            },
        )
        .await
        .unwrap();

    let results = batch.wait().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].success, "delivery failed: {:?}", results[0].error);
    assert_eq!(results[0].status_code, Some(202));
    assert_eq!(results[0].recipients, vec![bob.clone()]);

    let posts = remote.posts();
    assert_eq!(posts.len(), 1);
    let post = &posts[0];
    assert_eq!(post.path, "/users/bob/inbox");
    assert_eq!(
        post.headers.get("content-type").unwrap(),
        "application/activity+json"
    );

    let public_key = node.public_key("alice").await;
    assert!(verify_parts(
        &public_key,
        &Method::POST,
        &post.path,
        &post.headers,
        &post.body
    ));

    let activity = post.json();
    assert_eq!(activity["type"], "Create");
    assert_eq!(activity["actor"], node.state.urls.actor("alice"));
    assert_eq!(activity["object"]["id"], note.id);
    assert_eq!(activity["to"], json!([bob]));
}

#[tokio::test]
async fn test_shared_inbox_receives_one_post_for_many_followers() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    node.register("alice").await;
    let bob = remote.add_actor("bob", true);
    let carol = remote.add_actor("carol", true);
    let dave = remote.add_actor("dave", false);

    for follower in [&bob, &carol, &dave] {
        node.state.actors.add_follower("alice", follower).await.unwrap();
    }

    let (_, batch) = node
        .state
        .notes
        .post(
            "alice",
            NewNote {
                content: "hello followers".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let results = batch.wait().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success));

    let shared = results
        .iter()
        .find(|r| r.endpoint.as_deref() == Some(format!("{}/inbox", remote.base).as_str()))
        .unwrap();
    assert_eq!(shared.recipients, vec![bob, carol]);

    let mut paths: Vec<String> = remote.posts().into_iter().map(|p| p.path).collect();
    paths.sort();
    assert_eq!(paths, vec!["/inbox", "/users/dave/inbox"]);
}

#[tokio::test]
async fn test_unreachable_recipient_does_not_block_others() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    node.register("alice").await;
    let bob = remote.add_actor("bob", false);
    let ghost = remote.actor_id("ghost");

    let (_, batch) = node
        .state
        .notes
        .post(
            "alice",
            NewNote {
                content: "anyone there?".to_string(),
                visibility: Visibility::Direct,
                mentions: vec![ghost.clone(), bob.clone()],
                in_reply_to: None,
            },
        )
        .await
        .unwrap();

    let results = batch.wait().await;
    assert_eq!(results.len(), 2);

    let failed = results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed.recipients, vec![ghost]);
    assert_eq!(failed.status_code, Some(404));

    let delivered = results.iter().find(|r| r.success).unwrap();
    assert_eq!(delivered.recipients, vec![bob]);
    assert_eq!(remote.posts().len(), 1);
}

#[tokio::test]
async fn test_inbound_create_on_shared_inbox_reaches_local_addressees() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    let alice = node.register("alice").await;
    let carol = node.register("carol").await;
    let dave = remote.add_actor("dave", true);
    let eve = remote.add_actor("eve", false);

    let object_id = format!("{}/objects/1", remote.base);
    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/activity", object_id),
        "type": "Create",
        "actor": dave,
        "to": [alice, carol, eve, node.state.urls.actor("nobody")],
        "object": {
            "id": object_id,
            "type": "Note",
            "attributedTo": dave,
            "content": "hi all"
        }
    });

    let response = remote
        .signed_post("dave", &node.url("/inbox"), &activity)
        .await;
    assert_eq!(response.status(), 200);

    for username in ["alice", "carol"] {
        let actor = node.state.actors.find_by_username(username).await.unwrap();
        assert_eq!(actor.inbox, vec![object_id.clone()]);
    }

    // The signer's key was fetched unsigned first
    assert_eq!(remote.gets("/users/dave").len(), 1);
    assert!(remote.posts().is_empty());
}

#[tokio::test]
async fn test_inbound_create_on_personal_inbox_reaches_owner() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    node.register("alice").await;
    let dave = remote.add_actor("dave", false);

    let object_id = format!("{}/objects/2", remote.base);
    let activity = json!({
        "id": format!("{}/activity", object_id),
        "type": "Create",
        "actor": dave,
        "to": PUBLIC_ADDRESS,
        "object": object_id
    });

    let response = remote
        .signed_post("dave", &node.url("/users/alice/inbox"), &activity)
        .await;
    assert_eq!(response.status(), 200);

    let alice = node.state.actors.find_by_username("alice").await.unwrap();
    assert_eq!(alice.inbox, vec![object_id]);
}

#[tokio::test]
async fn test_inbound_activity_signed_with_wrong_key_is_rejected() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    let alice = node.register("alice").await;
    let dave = remote.add_actor("dave", false);

    // dave's advertised key changes after signing
    let activity = json!({
        "id": format!("{}/objects/3/activity", remote.base),
        "type": "Create",
        "actor": dave,
        "to": [alice],
        "object": format!("{}/objects/3", remote.base)
    });
    let forged = remote.signed_post_after_rotation("dave", &node.url("/inbox"), &activity).await;
    assert_eq!(forged.status(), 401);

    let alice = node.state.actors.find_by_username("alice").await.unwrap();
    assert!(alice.inbox.is_empty());
}

#[tokio::test]
async fn test_follow_is_recorded_and_accepted() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    let alice = node.register("alice").await;
    let bob = remote.add_actor("bob", false);

    let follow_id = format!("{}/follows/1", remote.base);
    let follow = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": follow_id,
        "type": "Follow",
        "actor": bob,
        "object": alice
    });

    let response = remote
        .signed_post("bob", &node.url("/users/alice/inbox"), &follow)
        .await;
    assert_eq!(response.status(), 200);

    let actor = node.state.actors.find_by_username("alice").await.unwrap();
    assert_eq!(actor.followers, vec![bob.clone()]);

    let posts = remote.wait_for_posts(1).await;
    assert_eq!(posts.len(), 1);
    let accept = posts[0].json();
    assert_eq!(accept["type"], "Accept");
    assert_eq!(accept["actor"], alice);
    assert_eq!(accept["object"]["id"], follow_id);
    assert_eq!(accept["to"], json!([bob]));

    let public_key = node.public_key("alice").await;
    assert!(verify_parts(
        &public_key,
        &Method::POST,
        &posts[0].path,
        &posts[0].headers,
        &posts[0].body
    ));
}

#[tokio::test]
async fn test_follow_without_auto_accept_sends_nothing() {
    let node = TestNode::with_config(|config| config.instance.auto_accept_follow = false).await;
    let remote = FakeRemote::start().await;
    let alice = node.register("alice").await;
    let bob = remote.add_actor("bob", false);

    let follow = json!({
        "id": format!("{}/follows/2", remote.base),
        "type": "Follow",
        "actor": bob,
        "object": alice
    });
    let response = remote.signed_post("bob", &node.url("/inbox"), &follow).await;
    assert_eq!(response.status(), 200);

    let actor = node.state.actors.find_by_username("alice").await.unwrap();
    assert_eq!(actor.followers, vec![bob]);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(remote.posts().is_empty());
}

#[tokio::test]
async fn test_fetch_escalates_to_signed_exactly_once() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    let bob = remote.add_actor("bob", false);
    remote.set_policy(SignaturePolicy::RequireSigned);

    let actor = node.state.resolver.fetch_actor(&bob).await.unwrap();
    assert_eq!(actor.id, bob);
    assert_eq!(actor.delivery_endpoint(), Some(format!("{}/inbox", bob).as_str()));

    let gets = remote.gets("/users/bob");
    assert_eq!(gets.len(), 2);
    assert!(!gets[0].is_signed());
    assert!(gets[1].is_signed());

    // Signed as the instance actor
    let instance_key = node.public_key("instance.actor").await;
    assert!(verify_parts(
        &instance_key,
        &Method::GET,
        &gets[1].path,
        &gets[1].headers,
        &[]
    ));
    let signature = gets[1].headers.get("signature").unwrap().to_str().unwrap();
    assert!(signature.contains(&node.state.urls.key_id("instance.actor")));
}

#[tokio::test]
async fn test_fetch_gives_up_after_one_signed_retry() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    let bob = remote.add_actor("bob", false);
    remote.set_policy(SignaturePolicy::AlwaysReject);

    let result = node.state.resolver.fetch(&bob, "instance.actor", false).await;
    assert!(matches!(result, Err(AppError::Federation(_))));
    assert_eq!(remote.gets("/users/bob").len(), 2);
}

#[tokio::test]
async fn test_forced_signed_fetch_is_not_retried() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    let bob = remote.add_actor("bob", false);
    remote.set_policy(SignaturePolicy::AlwaysReject);

    let result = node.state.resolver.fetch(&bob, "instance.actor", true).await;
    assert!(matches!(result, Err(AppError::Federation(_))));

    let gets = remote.gets("/users/bob");
    assert_eq!(gets.len(), 1);
    assert!(gets[0].is_signed());
}

#[tokio::test]
async fn test_fetch_does_not_retry_http_errors() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    let ghost = remote.actor_id("ghost");

    let result = node.state.resolver.fetch(&ghost, "instance.actor", false).await;
    assert!(matches!(
        result,
        Err(AppError::RemoteStatus { status: 404, .. })
    ));
    assert_eq!(remote.gets("/users/ghost").len(), 1);
}

#[tokio::test]
async fn test_public_note_reaches_single_follower_only() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    node.register("alice").await;
    let bob = remote.add_actor("bob", false);
    node.state.actors.add_follower("alice", &bob).await.unwrap();

    let (note, batch) = node
        .state
        .notes
        .post(
            "alice",
            NewNote {
                content: "public hello".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(note.to, vec![PUBLIC_ADDRESS]);

    let results = batch.wait().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].recipients, vec![bob]);

    let posts = remote.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].path, "/users/bob/inbox");
    assert!(posts[0].is_signed());
}

#[tokio::test]
async fn test_inbox_collection_lists_received_objects() {
    let node = TestNode::new().await;
    let remote = FakeRemote::start().await;
    let alice = node.register("alice").await;
    remote.add_actor("dave", false);

    let mut object_ids = Vec::new();
    for n in 1..=2 {
        let object_id = format!("{}/objects/{}", remote.base, n);
        let activity = json!({
            "type": "Create",
            "actor": remote.actor_id("dave"),
            "to": [alice],
            "object": object_id
        });
        let response = remote
            .signed_post("dave", &node.url("/inbox"), &activity)
            .await;
        assert_eq!(response.status(), 200);
        object_ids.push(object_id);
    }

    let head: serde_json::Value = node
        .client
        .get(node.url("/users/alice/inbox"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(head["totalItems"], 2);

    let page: serde_json::Value = node
        .client
        .get(node.url("/users/alice/inbox?page=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    object_ids.reverse();
    assert_eq!(page["orderedItems"], json!(object_ids));
}

#[tokio::test]
async fn test_deliveries_respect_concurrency_cap() {
    let node = TestNode::with_config(|config| config.federation.max_concurrent_deliveries = 2).await;
    let remote = FakeRemote::start().await;
    node.register("alice").await;
    remote.set_inbox_delay(Duration::from_millis(200));

    for n in 0..5 {
        let follower = remote.add_actor(&format!("follower{}", n), false);
        node.state.actors.add_follower("alice", &follower).await.unwrap();
    }

    let (_, batch) = node
        .state
        .notes
        .post(
            "alice",
            NewNote {
                content: "slow inboxes".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let results = batch.wait().await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(remote.posts().len(), 5);

    let peak = remote.peak_in_flight();
    assert!(peak >= 1);
    assert!(peak <= 2, "saw {} concurrent deliveries", peak);
}
