//! End-to-end flows over the in-process transport: room join backfill,
//! correction handling, admin gating and presence tracking.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mucbot::bot::{Bot, RunOutcome};
use mucbot::config::Config;
use mucbot::transport::mock::MockTransport;
use mucbot::transport::{
    Affiliation, InboundMessage, PresenceUpdate, Role, TransportEvent,
};

const ROOM: &str = "room@muc.example.org";

fn test_config(dir: &tempfile::TempDir, extra: &str) -> Config {
    let raw = format!(
        r#"
identity = "bot@example.org"
nick = "mucbot"
db_path = "{}/bot.db"
admins = ["admin@example.org"]

[rooms."{ROOM}"]

{extra}
"#,
        dir.path().display()
    );
    toml::from_str(&raw).expect("test config parses")
}

fn correction(room: &str, nick: &str, id: &str, replaces: &str, body: &str) -> InboundMessage {
    let mut msg = InboundMessage::groupchat(room, nick, id, body);
    msg.replace_id = Some(replaces.to_string());
    msg
}

/// Run the bot until the scripted events are drained, then stop it.
async fn run_until_idle(bot: Bot) -> RunOutcome {
    let ctx = bot.context();
    let handle = tokio::spawn(async move { bot.run().await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    ctx.request_shutdown();
    handle.await.unwrap().unwrap()
}

#[tokio::test]
async fn backfill_replay_is_idempotent_and_corrections_apply() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, "");
    let transport = Arc::new(MockTransport::new("bot@example.org"));

    let backfill = vec![
        InboundMessage::groupchat(ROOM, "alice", "m1", "hello"),
        InboundMessage::groupchat(ROOM, "alice", "m2", "wrld"),
        correction(ROOM, "alice", "m3", "m2", "world"),
        // duplicate delivery of m1 inside the same backfill
        InboundMessage::groupchat(ROOM, "alice", "m1", "hello"),
    ];
    transport.set_backfill(ROOM, backfill.clone());

    let bot = Bot::new(config, transport.clone(), CancellationToken::new()).unwrap();
    let ctx = bot.context();
    let outcome = run_until_idle(bot).await;
    assert_eq!(outcome, RunOutcome::Shutdown);

    let m1 = ctx.history.entry(ROOM, "m1").unwrap().unwrap();
    assert_eq!(m1.body, "hello");
    let m2 = ctx.history.entry(ROOM, "m2").unwrap().unwrap();
    assert_eq!(m2.body, "world");
    assert_eq!(m2.edit_history.len(), 1);
    assert!(m2.edit_history.values().any(|body| body == "wrld"));

    // a second join replays the same backfill without changing anything
    transport.set_backfill(ROOM, backfill);
    ctx.join_room(ROOM).await.unwrap();
    let m2 = ctx.history.entry(ROOM, "m2").unwrap().unwrap();
    assert_eq!(m2.body, "world");
    assert_eq!(m2.edit_history.len(), 1);
}

#[tokio::test]
async fn admin_commands_from_non_admins_do_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, "");
    let transport = Arc::new(MockTransport::new("bot@example.org"));
    transport.set_identity(ROOM, "mallory", "mallory@example.org");
    transport.script(TransportEvent::GroupchatMessage(InboundMessage::groupchat(
        ROOM, "mallory", "m1", ".shutdown",
    )));
    transport.script(TransportEvent::GroupchatMessage(InboundMessage::groupchat(
        ROOM, "mallory", "m2", ".echo owned",
    )));

    let bot = Bot::new(config, transport.clone(), CancellationToken::new()).unwrap();
    let outcome = run_until_idle(bot).await;

    // the bot was not shut down by the command; we stopped it ourselves
    assert_eq!(outcome, RunOutcome::Shutdown);
    assert!(transport.sent_bodies().is_empty());
}

#[tokio::test]
async fn admin_echo_answers_in_the_room() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, "");
    let transport = Arc::new(MockTransport::new("bot@example.org"));
    transport.set_identity(ROOM, "root", "admin@example.org");
    transport.script(TransportEvent::GroupchatMessage(InboundMessage::groupchat(
        ROOM, "root", "m1", ".echo all systems go",
    )));

    let bot = Bot::new(config, transport.clone(), CancellationToken::new()).unwrap();
    run_until_idle(bot).await;

    assert_eq!(transport.sent_bodies(), vec!["all systems go".to_string()]);
}

#[tokio::test]
async fn disabling_a_plugin_in_a_room_blocks_its_commands_too() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, r#"disabled_plugins = ["debug"]"#);
    let transport = Arc::new(MockTransport::new("bot@example.org"));
    transport.set_identity(ROOM, "root", "admin@example.org");
    transport.script(TransportEvent::GroupchatMessage(InboundMessage::groupchat(
        ROOM, "root", "m1", ".echo should be blocked",
    )));

    let bot = Bot::new(config, transport.clone(), CancellationToken::new()).unwrap();
    run_until_idle(bot).await;

    // even an admin cannot run commands of a plugin the room disabled
    assert!(transport.sent_bodies().is_empty());
}

#[tokio::test]
async fn tells_are_delivered_when_the_recipient_speaks() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, "");
    let transport = Arc::new(MockTransport::new("bot@example.org"));

    let bot = Bot::new(config, transport.clone(), CancellationToken::new()).unwrap();
    let ctx = bot.context();
    let handle = tokio::spawn(async move { bot.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(
        transport
            .emit(TransportEvent::GroupchatMessage(InboundMessage::groupchat(
                ROOM, "alice", "m1", ".tell bob see you tomorrow",
            )))
            .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        transport
            .emit(TransportEvent::GroupchatMessage(InboundMessage::groupchat(
                ROOM, "bob", "m2", "good morning",
            )))
            .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    ctx.request_shutdown();
    handle.await.unwrap().unwrap();

    let bodies = transport.sent_bodies();
    assert_eq!(bodies.len(), 2);
    assert!(bodies[0].contains("pass that on"));
    assert!(bodies[1].contains("alice left you a message"));
    assert!(bodies[1].contains("see you tomorrow"));
}

#[tokio::test]
async fn presence_transitions_are_tracked_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, "");
    let transport = Arc::new(MockTransport::new("bot@example.org"));

    let update = PresenceUpdate {
        room: ROOM.to_string(),
        nick: "alice".to_string(),
        new_nick: None,
        jid: Some("alice@example.org".to_string()),
        role: Role::Participant,
        affiliation: Affiliation::Member,
        status: "available".to_string(),
    };
    transport.script(TransportEvent::Presence(update.clone()));
    transport.script(TransportEvent::Presence(PresenceUpdate {
        role: Role::Moderator,
        ..update
    }));

    let bot = Bot::new(config, transport, CancellationToken::new()).unwrap();
    let ctx = bot.context();
    run_until_idle(bot).await;

    let state = ctx.presence.state(ROOM, "alice@example.org").unwrap();
    assert_eq!(state.role, Role::Moderator);
    assert_eq!(state.affiliation, Affiliation::Member);
    assert!(state.first_seen > 0);
}

#[tokio::test]
async fn bridged_messages_are_recorded_under_the_real_sender() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &dir,
        r#"
[gateways.bridge]
pattern = "<{nick}> {body}"
"#,
    );
    let transport = Arc::new(MockTransport::new("bot@example.org"));
    transport.script(TransportEvent::GroupchatMessage(InboundMessage::groupchat(
        ROOM, "bridge", "m1", "<carol> greetings from the other side",
    )));

    let bot = Bot::new(config, transport, CancellationToken::new()).unwrap();
    let ctx = bot.context();
    run_until_idle(bot).await;

    let entry = ctx.history.entry(ROOM, "m1").unwrap().unwrap();
    assert_eq!(entry.nick, "carol");
    assert_eq!(entry.body, "greetings from the other side");
}
