mod support;

use std::sync::Arc;
use std::time::Duration;

use lightvm_host::{
    start, BridgeError, ClientConfig, ConnectTarget, DatabaseSave, VmLoader, VmStatus,
};
use serde_json::json;
use tokio::sync::mpsc;

use support::{collector, echo_vm, next, vm, vm_with_closed, Activity, RecordingTransports};

struct Harness {
    config: ClientConfig,
    transports: RecordingTransports,
    activity: mpsc::UnboundedReceiver<Activity>,
    best_blocks: mpsc::UnboundedReceiver<u32>,
}

fn harness(chain_spec: &str) -> Harness {
    let (transports, activity) = RecordingTransports::new();
    let (on_best_block, best_blocks) = collector();
    let config = ClientConfig::new(chain_spec)
        .with_best_block_callback(on_best_block)
        .with_transports(Arc::new(transports.clone()));
    Harness {
        config,
        transports,
        activity,
        best_blocks,
    }
}

fn ws_target() -> ConnectTarget {
    ConnectTarget::WebSocket {
        url: "ws://1.2.3.4:30333".into(),
    }
}

#[tokio::test]
async fn init_receives_startup_parameters() {
    let mut h = harness("abcdef");
    let _controller = start(&echo_vm(), h.config.with_max_log_level(4))
        .await
        .unwrap();

    assert_eq!(next(&mut h.best_blocks).await, 6);
    assert_eq!(next(&mut h.best_blocks).await, 4);
    // Zero-delay timer started during init.
    assert_eq!(next(&mut h.best_blocks).await, 1001);
}

#[tokio::test]
async fn opens_exactly_one_websocket_connection() {
    let mut h = harness("{}");
    let _controller = start(&echo_vm(), h.config).await.unwrap();

    assert_eq!(next(&mut h.activity).await, Activity::Opened(0, ws_target()));
    assert_eq!(next(&mut h.best_blocks).await, 2);
    assert_eq!(next(&mut h.best_blocks).await, 3);
    assert_eq!(next(&mut h.best_blocks).await, 1001);
    assert!(h.activity.try_recv().is_err());
}

#[tokio::test]
async fn pause_reaches_vm_once() {
    let mut h = harness("{}");
    let controller = start(&echo_vm(), h.config).await.unwrap();
    for expected in [2, 3, 1001] {
        assert_eq!(next(&mut h.best_blocks).await, expected);
    }

    controller.set_syncing_paused(true).unwrap();
    controller.set_syncing_paused(false).unwrap();

    // Events are delivered in order, so the second update proves the first
    // was delivered exactly once.
    assert_eq!(next(&mut h.best_blocks).await, 101);
    assert_eq!(next(&mut h.best_blocks).await, 100);
}

#[tokio::test]
async fn connection_events_reach_vm() {
    let mut h = harness("{}");
    let _controller = start(&echo_vm(), h.config).await.unwrap();
    assert_eq!(next(&mut h.activity).await, Activity::Opened(0, ws_target()));

    let events = h.transports.events(0);
    events.open();
    assert_eq!(next(&mut h.activity).await, Activity::Sent(0, b"/ip4".to_vec()));

    events.message(b"ping".to_vec());
    assert_eq!(next(&mut h.activity).await, Activity::Sent(0, b"ping".to_vec()));

    // The VM answers a remote close with connection_close.
    events.closed();
    assert_eq!(next(&mut h.activity).await, Activity::Closed(0));
}

#[tokio::test]
async fn events_after_close_are_dropped() {
    let mut h = harness("{}");
    let controller = start(&echo_vm(), h.config).await.unwrap();
    assert_eq!(next(&mut h.activity).await, Activity::Opened(0, ws_target()));

    let events = h.transports.events(0);
    events.closed();
    assert_eq!(next(&mut h.activity).await, Activity::Closed(0));

    events.message(b"late".to_vec());
    events.open();
    // Flush the queue with a request whose effect is observable.
    for expected in [2, 3, 1001] {
        assert_eq!(next(&mut h.best_blocks).await, expected);
    }
    controller.set_syncing_paused(true).unwrap();
    assert_eq!(next(&mut h.best_blocks).await, 101);
    assert!(h.activity.try_recv().is_err());
}

#[tokio::test]
async fn send_after_remote_close_is_silently_dropped() {
    let mut h = harness("{}");
    let bytecode = vm_with_closed(support::ECHO_INIT, support::ECHO_TIMER, support::SEND_ON_CLOSED);
    let controller = start(&bytecode, h.config).await.unwrap();
    assert_eq!(next(&mut h.activity).await, Activity::Opened(0, ws_target()));
    for expected in [2, 3, 1001] {
        assert_eq!(next(&mut h.best_blocks).await, expected);
    }

    h.transports.events(0).closed();
    // The write is handed to the closed transport, which drops it.
    assert_eq!(next(&mut h.activity).await, Activity::Sent(0, b"/ip4".to_vec()));
    assert_eq!(next(&mut h.best_blocks).await, 500);
    assert!(controller.is_active());

    // The instance keeps running and the connection stays registered.
    controller.set_syncing_paused(true).unwrap();
    assert_eq!(next(&mut h.best_blocks).await, 101);
    assert!(controller.is_active());
    assert!(h.activity.try_recv().is_err());
}

#[tokio::test]
async fn empty_database_content_is_not_allocated() {
    let mut h = harness("{}");
    let bytecode = vm(support::DATABASE_PARAMS_INIT, support::ECHO_TIMER);
    let _controller = start(&bytecode, h.config.with_database_content(""))
        .await
        .unwrap();
    assert_eq!(next(&mut h.best_blocks).await, 0);
    assert_eq!(next(&mut h.best_blocks).await, 0);

    // Non-empty content lands right after the two-byte chain spec.
    let mut h = harness("{}");
    let _controller = start(&bytecode, h.config.with_database_content("x"))
        .await
        .unwrap();
    assert_eq!(next(&mut h.best_blocks).await, 4098);
    assert_eq!(next(&mut h.best_blocks).await, 1);
}

#[tokio::test]
async fn database_content_round_trips_through_sink() {
    let (on_save, mut saves) = collector::<DatabaseSave>();
    let sink = move |payload: DatabaseSave| -> lightvm_host::Result<()> {
        on_save(payload);
        Ok(())
    };
    let h = harness("{}");
    let config = h
        .config
        .with_database_content(r#"{"chain": {"finalized": 12}}"#)
        .with_database_sink(Arc::new(sink));

    let _controller = start(&echo_vm(), config).await.unwrap();
    let saved = next(&mut saves).await;
    assert_eq!(saved.chain, json!({ "finalized": 12 }));
    assert!(saved.blocks.is_empty());
}

#[tokio::test]
async fn json_rpc_round_trip() {
    let (on_response, mut responses) = collector::<String>();
    let h = harness("{}");
    let controller = start(&echo_vm(), h.config.with_json_rpc_callback(on_response))
        .await
        .unwrap();

    controller
        .send_json_rpc(r#"{"jsonrpc":"2.0","id":1,"method":"system_health"}"#)
        .unwrap();
    assert_eq!(
        next(&mut responses).await,
        r#"{"jsonrpc":"2.0","id":1,"method":"system_health"}"#
    );
}

#[tokio::test]
async fn fault_during_init_fails_start() {
    let h = harness("{}");
    let err = start(&vm(support::FAULT_INIT, support::ECHO_TIMER), h.config)
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::RuntimeFault("init failed".into()));
}

#[tokio::test]
async fn forced_exit_is_terminal() {
    let mut h = harness("{}");
    let controller = start(&vm(support::ECHO_INIT, support::EXIT_TIMER), h.config)
        .await
        .unwrap();
    assert_eq!(next(&mut h.activity).await, Activity::Opened(0, ws_target()));

    assert_eq!(controller.termination().await, BridgeError::FatalExit(7));
    assert_eq!(
        controller.status(),
        VmStatus::Terminated {
            reason: BridgeError::FatalExit(7)
        }
    );
    // Open connections are force-closed.
    assert_eq!(next(&mut h.activity).await, Activity::Closed(0));

    // Nothing reaches the VM any more.
    assert_eq!(
        controller.set_syncing_paused(true),
        Err(BridgeError::Terminated)
    );
    h.transports.events(0).open();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.activity.try_recv().is_err());
}

#[tokio::test]
async fn trap_in_export_is_runtime_fault() {
    let h = harness("{}");
    let controller = start(&vm(support::ECHO_INIT, support::TRAP_TIMER), h.config)
        .await
        .unwrap();
    assert!(matches!(
        controller.termination().await,
        BridgeError::RuntimeFault(_)
    ));
}

#[tokio::test]
async fn bad_file_descriptor_is_terminal() {
    let h = harness("{}");
    let controller = start(&vm(support::ECHO_INIT, support::BAD_FD_TIMER), h.config)
        .await
        .unwrap();
    assert_eq!(
        controller.termination().await,
        BridgeError::BadFileDescriptor(3)
    );
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let mut h = harness("{}");
    let controller = start(&echo_vm(), h.config).await.unwrap();
    assert_eq!(next(&mut h.activity).await, Activity::Opened(0, ws_target()));

    controller.shutdown();
    assert_eq!(controller.termination().await, BridgeError::Terminated);
    assert_eq!(next(&mut h.activity).await, Activity::Closed(0));
}

#[tokio::test]
async fn loader_starts_independent_instances() {
    let loader = VmLoader::new(&echo_vm()).unwrap();

    let mut first = harness("a");
    let mut second = harness("bb");
    let a = loader.start(first.config).await.unwrap();
    let b = loader.start(second.config).await.unwrap();
    assert_ne!(a.session_id(), b.session_id());

    assert_eq!(next(&mut first.best_blocks).await, 1);
    assert_eq!(next(&mut second.best_blocks).await, 2);

    // Terminating one leaves the other running.
    a.shutdown();
    a.termination().await;
    b.set_syncing_paused(true).unwrap();
    for expected in [3, 1001, 101] {
        assert_eq!(next(&mut second.best_blocks).await, expected);
    }
}
