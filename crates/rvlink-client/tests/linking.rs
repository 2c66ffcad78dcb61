//! Invite KX, re-KX and ratchet resets between clients sharing an
//! in-process relay.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use rvlink_client::read_invite;
use rvlink_crypto::identity::LocalIdentity;
use rvlink_net::testkit::MemRelay;
use rvlink_types::config::ClientConfig;
use rvlink_types::events::ClientEvent;
use rvlink_types::{GroupChatId, RvId, RvlinkError};
use rvlink_wire::invite::OobPublicIdentityInvite;

use common::{eventually, link, offline_client, Call, FixedIdentity, MemRendezvous, Peer, TestResult};

#[tokio::test]
async fn invite_links_both_sides() -> TestResult {
    let relay = MemRelay::new();
    let mut alice = Peer::spawn(&relay, "alice").await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;

    link(&mut alice, &mut bob).await?;

    let bob_uid = bob.client.local_uid();
    let alice_uid = alice.client.local_uid();
    assert_eq!(alice.client.user_by_id(&bob_uid)?.nick(), "bob");
    assert_eq!(bob.client.user_by_nick("alice")?.uid(), alice_uid);
    assert!(alice.client.list_kxs()?.is_empty());
    assert!(bob.client.list_kxs()?.is_empty());

    // Both ratchets were seeded from the same exchange.
    let ct = alice.client.encrypt_for(&bob_uid, b"hello bob").await?;
    assert_eq!(bob.client.decrypt_from(&alice_uid, &ct).await?, b"hello bob");
    let ct = bob.client.encrypt_for(&alice_uid, b"hi alice").await?;
    assert_eq!(alice.client.decrypt_from(&bob_uid, &ct).await?, b"hi alice");
    assert!(alice.client.user_by_id(&bob_uid)?.last_decrypt().await.is_some());
    Ok(())
}

#[tokio::test]
async fn accepting_own_invite_is_rejected() -> TestResult {
    let relay = MemRelay::new();
    let alice = Peer::spawn(&relay, "alice").await?;

    let mut buf = Vec::new();
    alice.client.create_invite(&mut buf, None)?;
    let invite = read_invite(buf.as_slice())?;
    let err = alice.client.accept_invite(invite).await.err();
    assert!(matches!(err, Some(RvlinkError::InvalidIdentity { .. })));
    Ok(())
}

#[tokio::test]
async fn prepaid_invite_is_fetched_once() -> TestResult {
    let relay = MemRelay::new();
    let mut alice = Peer::spawn(&relay, "alice").await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;

    let (created, key) = alice.client.create_prepaid_invite(Vec::new(), None).await?;
    let encoded = key.encode()?;
    let key = rvlink_wire::invite::PaidInviteKey::decode(&encoded)?;

    let mut sink = Vec::new();
    let fetched = bob.client.fetch_prepaid_invite(&key, &mut sink).await?;
    assert_eq!(fetched.initial_rendezvous, created.initial_rendezvous);
    assert_eq!(read_invite(sink.as_slice())?.public.identity, alice.client.local_uid());

    let again = bob.client.fetch_prepaid_invite(&key, Vec::new()).await;
    assert!(again.is_err_and(|e| e.is_not_found()));

    bob.client.accept_invite(fetched).await?;
    let (uid, _, is_new) = alice.wait_kx_completed().await?;
    assert_eq!(uid, bob.client.local_uid());
    assert!(is_new);
    bob.wait_kx_completed().await?;
    Ok(())
}

#[tokio::test]
async fn second_kx_keeps_entry_and_alias() -> TestResult {
    let relay = MemRelay::new();
    let mut alice = Peer::spawn(&relay, "alice").await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;
    link(&mut alice, &mut bob).await?;

    let alice_uid = alice.client.local_uid();
    let before = bob.client.user_by_id(&alice_uid)?;
    bob.client.rename_user(&alice_uid, "ally")?;

    let mut buf = Vec::new();
    alice.client.create_invite(&mut buf, None)?;
    bob.client.accept_invite(read_invite(buf.as_slice())?).await?;

    let (_, nick, is_new) = bob.wait_kx_completed().await?;
    assert!(!is_new);
    assert_eq!(nick, "ally");
    let (_, _, is_new) = alice.wait_kx_completed().await?;
    assert!(!is_new);

    let after = bob.client.user_by_nick("ally")?;
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(bob.client.list_user_ids(), vec![alice_uid]);

    let ct = bob.client.encrypt_for(&alice_uid, b"after re-kx").await?;
    assert_eq!(alice.client.decrypt_from(&bob.client.local_uid(), &ct).await?, b"after re-kx");
    Ok(())
}

#[tokio::test]
async fn reset_swaps_ratchet_in_place() -> TestResult {
    let relay = MemRelay::new();
    let mut alice = Peer::spawn(&relay, "alice").await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;
    link(&mut alice, &mut bob).await?;

    let alice_uid = alice.client.local_uid();
    let bob_uid = bob.client.local_uid();
    let alice_on_bob = bob.client.user_by_id(&alice_uid)?;
    let bob_on_alice = alice.client.user_by_id(&bob_uid)?;
    let stale = bob.client.encrypt_for(&alice_uid, b"old ratchet").await?;

    bob.client.reset_ratchet(&alice_uid).await?;
    let (uid, _, is_new) = alice.wait_kx_completed().await?;
    assert_eq!(uid, bob_uid);
    assert!(!is_new);
    let (uid, _, is_new) = bob.wait_kx_completed().await?;
    assert_eq!(uid, alice_uid);
    assert!(!is_new);

    assert!(Arc::ptr_eq(&alice_on_bob, &bob.client.user_by_id(&alice_uid)?));
    assert!(Arc::ptr_eq(&bob_on_alice, &alice.client.user_by_id(&bob_uid)?));
    assert!(alice.client.decrypt_from(&bob_uid, &stale).await.is_err());

    let ct = alice.client.encrypt_for(&bob_uid, b"new ratchet").await?;
    assert_eq!(bob.client.decrypt_from(&alice_uid, &ct).await?, b"new ratchet");
    assert!(bob.client.list_kxs()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn reset_of_unknown_peer_fails() -> TestResult {
    let relay = MemRelay::new();
    let alice = Peer::spawn(&relay, "alice").await?;
    let err = alice.client.reset_ratchet(&rvlink_types::UserId::new([5; 32])).await;
    assert!(err.is_err_and(|e| e.is_not_found()));
    Ok(())
}

#[tokio::test]
async fn bulk_reset_reports_progress() -> TestResult {
    let relay = MemRelay::new();
    let mut alice = Peer::spawn(&relay, "alice").await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;
    link(&mut alice, &mut bob).await?;
    let bob_uid = bob.client.local_uid();

    let (tx, mut rx) = mpsc::channel(4);
    let report = alice
        .client
        .reset_all_old_ratchets(Duration::ZERO, Some(tx))
        .await?;
    assert_eq!(report.attempted, vec![bob_uid]);
    assert!(report.first_error.is_none());
    assert_eq!(rx.recv().await, Some(bob_uid));

    let (uid, _, is_new) = bob.wait_kx_completed().await?;
    assert_eq!(uid, alice.client.local_uid());
    assert!(!is_new);
    alice.wait_kx_completed().await?;

    // The finished reset left no stored attempt behind, and bob is still
    // silent, so a second pass picks the peer up again.
    let again = alice
        .client
        .reset_all_old_ratchets(Duration::from_secs(3600), None)
        .await?;
    assert_eq!(again.into_result()?, vec![bob_uid]);
    Ok(())
}

#[tokio::test]
async fn queued_actions_run_after_kx() -> TestResult {
    let relay = MemRelay::new();
    let mut alice = Peer::spawn(&relay, "alice").await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;

    let gc = GroupChatId::new([4; 32]);
    let mut buf = Vec::new();
    let invite = alice.client.create_invite(&mut buf, None)?;
    alice.client.add_invite_on_kx(&invite.initial_rendezvous, gc)?;
    bob.client.accept_invite(read_invite(buf.as_slice())?).await?;
    alice.wait_kx_completed().await?;
    bob.wait_kx_completed().await?;

    let bob_uid = bob.client.local_uid();
    let services = Arc::clone(&alice.services);
    assert!(eventually(|| services.calls().contains(&Call::InviteToGroupChat(bob_uid, gc))).await);
    // New peers are subscribed to automatically.
    assert!(eventually(|| services.calls().contains(&Call::SubscribeToPosts(bob_uid))).await);
    let alice_ref = alice.client.clone();
    assert!(eventually(|| alice_ref.is_subscribed_to_posts(&bob_uid).unwrap_or(false)).await);
    Ok(())
}

#[tokio::test]
async fn subscribing_twice_emits_once() -> TestResult {
    let relay = MemRelay::new();
    let config = ClientConfig {
        auto_subscribe_to_posts: false,
        ..Default::default()
    };
    let mut alice = Peer::spawn_with(&relay, "alice", config).await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;
    link(&mut alice, &mut bob).await?;
    let bob_uid = bob.client.local_uid();

    assert!(!alice.client.is_subscribed_to_posts(&bob_uid)?);
    alice.client.subscribe_to_posts(&bob_uid).await?;
    alice.client.subscribe_to_posts(&bob_uid).await?;
    assert!(alice.client.is_subscribed_to_posts(&bob_uid)?);

    let mut changes = 0;
    while let Ok(ev) = alice.events.try_recv() {
        if matches!(ev, ClientEvent::PostsSubscriptionChanged { uid, subscribed: true } if uid == bob_uid) {
            changes += 1;
        }
    }
    assert_eq!(changes, 1);
    let calls = alice.services.calls();
    assert_eq!(calls.iter().filter(|c| **c == Call::SubscribeToPosts(bob_uid)).count(), 2);
    Ok(())
}

#[tokio::test]
async fn block_forgets_peer() -> TestResult {
    let relay = MemRelay::new();
    let mut alice = Peer::spawn(&relay, "alice").await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;
    link(&mut alice, &mut bob).await?;
    let bob_uid = bob.client.local_uid();

    alice.client.block(&bob_uid).await?;
    let blocked = alice
        .wait_event(|ev| match ev {
            ClientEvent::PeerBlocked { uid } => Some(*uid),
            _ => None,
        })
        .await?;
    assert_eq!(blocked, bob_uid);
    assert!(alice.client.user_by_id(&bob_uid).is_err_and(|e| e.is_not_found()));
    assert!(alice.client.list_user_ids().is_empty());
    assert!(alice.client.block(&bob_uid).await.is_err_and(|e| e.is_not_found()));
    Ok(())
}

#[tokio::test]
async fn failed_half_kx_can_be_retried() -> TestResult {
    let rendezvous = Arc::new(MemRendezvous::default());
    let (bob, _services, _cancel) = offline_client("bob", Arc::clone(&rendezvous)).await?;
    let invite = OobPublicIdentityInvite {
        public: LocalIdentity::generate("Alice", "alice").public(),
        initial_rendezvous: RvId::random(),
        funds: None,
    };
    let initial_rv = invite.initial_rendezvous;

    rendezvous.fail_next_pushes(1);
    let first = bob.accept_invite(invite.clone()).await;
    assert!(first.is_err_and(|e| e.is_kx()));
    assert!(bob.list_kxs()?.is_empty());
    assert_eq!(rendezvous.pushed_to(&initial_rv), 0);

    bob.accept_invite(invite.clone()).await?;
    let kxs = bob.list_kxs()?;
    assert_eq!(kxs.len(), 1);
    assert_eq!(kxs[0].initial_rv, initial_rv);
    assert!(rendezvous.is_subscribed(&kxs[0].rv));
    assert_eq!(rendezvous.pushed_to(&initial_rv), 1);

    let again = bob.accept_invite(invite).await;
    assert!(again.is_err_and(|e| e.is_already_exists()));
    Ok(())
}

#[tokio::test]
async fn second_kx_with_new_nick_keeps_earliest_as_alias() -> TestResult {
    let relay = MemRelay::new();
    let secrets = LocalIdentity::generate("Alice", "alice").secrets();
    let mut alice = Peer::spawn_as(&relay, Arc::new(FixedIdentity(secrets.clone())), ClientConfig::default()).await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;
    link(&mut alice, &mut bob).await?;

    let alice_uid = alice.client.local_uid();
    let before = bob.client.user_by_id(&alice_uid)?;
    drop(alice);

    let mut renamed = secrets;
    renamed.nick = "alicia".into();
    let mut alicia = Peer::spawn_as(&relay, Arc::new(FixedIdentity(renamed)), ClientConfig::default()).await?;
    assert_eq!(alicia.client.local_uid(), alice_uid);
    assert_eq!(alicia.client.local_nick(), "alicia");

    let mut buf = Vec::new();
    alicia.client.create_invite(&mut buf, None)?;
    bob.client.accept_invite(read_invite(buf.as_slice())?).await?;
    let (uid, nick, is_new) = bob.wait_kx_completed().await?;
    assert_eq!(uid, alice_uid);
    assert!(!is_new);
    assert_eq!(nick, "alice");
    alicia.wait_kx_completed().await?;

    let after = bob.client.user_by_id(&alice_uid)?;
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(bob.client.list_user_ids().len(), 1);
    let entry = bob.db.view(|tx| tx.address_book_entry(&alice_uid))?;
    assert_eq!(entry.id.nick, "alicia");
    assert_eq!(entry.nick_alias.as_deref(), Some("alice"));
    Ok(())
}

#[tokio::test]
async fn kx_search_completes_when_target_links() -> TestResult {
    let relay = MemRelay::new();
    let mut alice = Peer::spawn(&relay, "alice").await?;
    let mut bob = Peer::spawn(&relay, "bob").await?;
    let carol = Peer::spawn(&relay, "carol").await?;
    link(&mut alice, &mut bob).await?;

    let bob_uid = bob.client.local_uid();
    let carol_uid = carol.client.local_uid();
    let gc = GroupChatId::new([9; 32]);
    alice.client.note_unkxd_member(carol_uid, Some(gc))?;

    let asked = alice.client.start_kx_search(carol_uid).await?;
    assert_eq!(asked, vec![bob_uid]);
    assert!(alice.services.calls().contains(&Call::RequestMediateKx(bob_uid, carol_uid)));
    let unkxd = alice.db.view(|tx| tx.unkxd_user(&carol_uid))?;
    assert_eq!(unkxd.map(|u| (u.gc, u.mediate_requests)), Some((Some(gc), 1)));

    let twice = alice.client.start_kx_search(carol_uid).await;
    assert!(twice.is_err_and(|e| e.is_already_exists()));
    let linked = alice.client.start_kx_search(bob_uid).await;
    assert!(linked.is_err_and(|e| e.is_already_exists()));

    let mut buf = Vec::new();
    carol.client.create_invite(&mut buf, None)?;
    alice.client.accept_invite(read_invite(buf.as_slice())?).await?;
    let target = alice
        .wait_event(|ev| match ev {
            ClientEvent::KxSearchCompleted { target } => Some(*target),
            _ => None,
        })
        .await?;
    assert_eq!(target, carol_uid);
    let (uid, _, is_new) = alice.wait_kx_completed().await?;
    assert_eq!(uid, carol_uid);
    assert!(is_new);
    assert!(alice.db.view(|tx| tx.kx_search(&carol_uid))?.is_none());
    assert!(alice.db.view(|tx| tx.unkxd_user(&carol_uid))?.is_none());
    Ok(())
}
