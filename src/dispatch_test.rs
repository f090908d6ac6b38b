use super::*;
use serde_json::json;

type Log = Arc<Mutex<Vec<String>>>;

fn recorder(log: &Log, name: &str) -> Handler {
    let log = Arc::clone(log);
    let name = name.to_owned();
    Arc::new(move |envelope: &Envelope| {
        log.lock().expect("log lock").push(format!("{name}:{}", envelope.topic()));
    })
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().expect("log lock").clone()
}

// =============================================================================
// ORDERING
// =============================================================================

#[test]
fn topic_handlers_run_in_order_then_wildcard() {
    let dispatcher = TopicDispatcher::new();
    let log = Log::default();
    dispatcher.subscribe("status", recorder(&log, "H1"));
    dispatcher.subscribe("status", recorder(&log, "H2"));
    dispatcher.subscribe(WILDCARD_TOPIC, recorder(&log, "H3"));

    let invoked = dispatcher.dispatch(&Envelope::new("status", json!("thinking")));
    assert_eq!(invoked, 3);
    assert_eq!(entries(&log), vec!["H1:status", "H2:status", "H3:status"]);
}

#[test]
fn unknown_topic_reaches_only_wildcard() {
    let dispatcher = TopicDispatcher::new();
    let log = Log::default();
    dispatcher.subscribe("status", recorder(&log, "H1"));
    dispatcher.subscribe(WILDCARD_TOPIC, recorder(&log, "H3"));

    dispatcher.dispatch(&Envelope::new("unknown_topic", json!(null)));
    assert_eq!(entries(&log), vec!["H3:unknown_topic"]);
}

#[test]
fn unknown_topic_without_wildcard_is_dropped() {
    let dispatcher = TopicDispatcher::new();
    assert_eq!(dispatcher.dispatch(&Envelope::new("nobody", json!(1))), 0);
}

#[test]
fn wildcard_envelope_is_not_delivered_twice() {
    let dispatcher = TopicDispatcher::new();
    let log = Log::default();
    dispatcher.subscribe(WILDCARD_TOPIC, recorder(&log, "W"));

    dispatcher.dispatch(&Envelope::new(WILDCARD_TOPIC, json!(null)));
    assert_eq!(entries(&log), vec!["W:*"]);
}

#[test]
fn duplicate_registration_is_invoked_per_registration() {
    let dispatcher = TopicDispatcher::new();
    let log = Log::default();
    let handler = recorder(&log, "H");
    dispatcher.subscribe("message", Arc::clone(&handler));
    dispatcher.subscribe("message", handler);

    dispatcher.dispatch(&Envelope::new("message", json!("hi")));
    assert_eq!(entries(&log).len(), 2);
}

// =============================================================================
// UNSUBSCRIBE
// =============================================================================

#[test]
fn unsubscribe_removes_every_registration_by_identity() {
    let dispatcher = TopicDispatcher::new();
    let log = Log::default();
    let target = recorder(&log, "target");
    let other = recorder(&log, "other");
    dispatcher.subscribe("message", Arc::clone(&target));
    dispatcher.subscribe("message", Arc::clone(&other));
    dispatcher.subscribe("message", Arc::clone(&target));

    assert!(dispatcher.unsubscribe("message", &target));
    assert_eq!(dispatcher.handler_count("message"), 1);

    dispatcher.dispatch(&Envelope::new("message", json!("hi")));
    assert_eq!(entries(&log), vec!["other:message"]);
}

#[test]
fn unsubscribe_unknown_handler_is_noop() {
    let dispatcher = TopicDispatcher::new();
    let log = Log::default();
    assert!(!dispatcher.unsubscribe("message", &recorder(&log, "x")));
}

#[test]
fn handler_may_unsubscribe_itself_during_dispatch() {
    let dispatcher = TopicDispatcher::new();
    let calls = Arc::new(Mutex::new(0_u32));
    let slot: Arc<Mutex<Option<Handler>>> = Arc::default();

    let handler = dispatcher.subscribe_fn("typing", {
        let dispatcher = dispatcher.clone();
        let calls = Arc::clone(&calls);
        let slot = Arc::clone(&slot);
        move |_envelope: &Envelope| {
            *calls.lock().expect("calls lock") += 1;
            if let Some(me) = slot.lock().expect("slot lock").take() {
                dispatcher.unsubscribe("typing", &me);
            }
        }
    });
    *slot.lock().expect("slot lock") = Some(handler);

    dispatcher.dispatch(&Envelope::new("typing", json!(true)));
    dispatcher.dispatch(&Envelope::new("typing", json!(true)));
    assert_eq!(*calls.lock().expect("calls lock"), 1);
    assert_eq!(dispatcher.handler_count("typing"), 0);
}

// =============================================================================
// ISOLATION
// =============================================================================

#[test]
fn panicking_handler_does_not_stop_delivery() {
    let dispatcher = TopicDispatcher::new();
    let log = Log::default();
    dispatcher.subscribe_fn("status", |_envelope: &Envelope| panic!("handler exploded"));
    dispatcher.subscribe("status", recorder(&log, "after"));
    dispatcher.subscribe(WILDCARD_TOPIC, recorder(&log, "wild"));

    let invoked = dispatcher.dispatch(&Envelope::new("status", json!("x")));
    assert_eq!(invoked, 3);
    assert_eq!(entries(&log), vec!["after:status", "wild:status"]);
}

#[test]
fn dispatch_line_drops_malformed_input() {
    let dispatcher = TopicDispatcher::new();
    let log = Log::default();
    dispatcher.subscribe(WILDCARD_TOPIC, recorder(&log, "W"));

    assert_eq!(dispatcher.dispatch_line("{not json"), 0);
    assert_eq!(dispatcher.dispatch_line(r#"{"content":"no type"}"#), 0);
    assert_eq!(dispatcher.dispatch_line(r#"{"type":"message","content":"hi"}"#), 1);
    assert_eq!(entries(&log), vec!["W:message"]);
}

// =============================================================================
// CHANNEL
// =============================================================================

#[tokio::test]
async fn subscribe_channel_delivers_envelopes() {
    let dispatcher = TopicDispatcher::new();
    let mut rx = dispatcher.subscribe_channel("message");

    dispatcher.dispatch(&Envelope::new("message", json!("one")));
    dispatcher.dispatch(&Envelope::new("status", json!("ignored")));
    dispatcher.dispatch(&Envelope::new("message", json!("two")));

    assert_eq!(rx.recv().await.expect("first").content(), &json!("one"));
    assert_eq!(rx.recv().await.expect("second").content(), &json!("two"));
    assert!(rx.try_recv().is_err());
}

#[test]
fn dropped_channel_receiver_unsubscribes_on_next_dispatch() {
    let dispatcher = TopicDispatcher::new();
    let rx = dispatcher.subscribe_channel("message");
    assert_eq!(dispatcher.handler_count("message"), 1);

    drop(rx);
    dispatcher.dispatch(&Envelope::new("message", json!("late")));
    assert_eq!(dispatcher.handler_count("message"), 0);
}
