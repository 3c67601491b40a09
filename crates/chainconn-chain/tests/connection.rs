//! Connection lifecycle against in-memory backends.

mod common;

use std::time::Duration;

use chainconn_chain::{
    Backend, BackendEvent, BackendKind, BootstrapRequest, ChainError, SubstrateApi,
};
use chainconn_core::{ConnectionConfig, ConnectionStatus};
use common::{GENESIS, MockFactory, WAIT, init_tracing, request, request_for, wait_state};
use serde_json::json;

const URL: &str = "wss://rpc.polkadot.io";

async fn ready_api(factory: &std::sync::Arc<MockFactory>) -> SubstrateApi {
    let api = SubstrateApi::with_factory(request(URL), factory.clone()).expect("build api");
    tokio::time::timeout(WAIT, api.is_ready())
        .await
        .expect("api did not become ready")
        .expect("readiness failed");
    api
}

#[tokio::test]
async fn test_becomes_ready_with_chain_properties() {
    init_tracing();
    let factory = MockFactory::new();
    let api = SubstrateApi::with_factory(request(URL), factory.clone()).unwrap();

    let info = tokio::time::timeout(WAIT, api.is_ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.chain_slug, "polkadot");
    assert_eq!(info.system_chain, "Polkadot");
    assert_eq!(info.spec_version, "1002000");
    assert_eq!(info.properties.ss58_format, 0);
    assert_eq!(info.default_format_balance.decimals, vec![10]);
    assert_eq!(info.default_format_balance.unit, "DOT");

    assert!(api.is_api_ready());
    assert!(api.is_api_connected());
    assert_eq!(api.retry(), 0);
    assert_eq!(api.registry().chain_ss58(), 0);
    assert_eq!(api.registry().chain_tokens(), vec!["DOT".to_string()]);

    let chain = api.rpc_method("system.chain").unwrap();
    assert_eq!(chain.call(vec![]).await.unwrap(), json!("Polkadot"));
    assert!(matches!(
        api.rpc_method("evm.call"),
        Err(ChainError::UnknownApi(_))
    ));
}

#[tokio::test]
async fn test_drops_below_limit_stay_disconnected() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;
    let mut state = api.subscribe_state();

    let legacy = factory.legacy();
    for _ in 0..9 {
        legacy.emit(BackendEvent::Disconnected);
    }

    let snapshot = wait_state(&mut state, |s| s.retry == 9).await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(!api.is_api_ready());
}

#[tokio::test]
async fn test_too_many_drops_become_unstable() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;
    let mut state = api.subscribe_state();

    let legacy = factory.legacy();
    for _ in 0..10 {
        legacy.emit(BackendEvent::Disconnected);
    }

    let snapshot = wait_state(&mut state, |s| s.status == ConnectionStatus::Unstable).await;
    assert_eq!(snapshot.retry, 10);

    // A late reconnect does not leave the unstable state.
    legacy.emit(BackendEvent::Connected);
    api.connect().await.unwrap();
    assert_eq!(api.connection_status(), ConnectionStatus::Unstable);

    let pending = tokio::time::timeout(Duration::from_millis(200), api.is_ready()).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn test_recover_from_unstable() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;
    let mut state = api.subscribe_state();

    let legacy = factory.legacy();
    for _ in 0..10 {
        legacy.emit(BackendEvent::Disconnected);
    }
    wait_state(&mut state, |s| s.status == ConnectionStatus::Unstable).await;

    let info = tokio::time::timeout(WAIT, api.recover_connect())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.system_chain, "Polkadot");
    assert_eq!(api.connection_status(), ConnectionStatus::Connected);
    assert_eq!(api.retry(), 0);
    assert_eq!(factory.builds(), 1);
}

#[tokio::test]
async fn test_reconnect_reuses_chain_info() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;
    let mut state = api.subscribe_state();

    let legacy = factory.legacy();
    let dynamic = factory.dynamic();
    let calls = legacy.rpc_calls() + dynamic.rpc_calls();

    legacy.emit(BackendEvent::Disconnected);
    wait_state(&mut state, |s| s.status == ConnectionStatus::Disconnected).await;
    assert!(!api.is_api_ready());

    let waiter = api.is_ready();
    legacy.emit(BackendEvent::Connected);

    let info = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    assert_eq!(info.system_chain, "Polkadot");
    assert_eq!(api.retry(), 0);
    assert_eq!(legacy.rpc_calls() + dynamic.rpc_calls(), calls);
}

#[tokio::test]
async fn test_waiter_from_dropped_cycle_never_resolves() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;
    let mut state = api.subscribe_state();

    let legacy = factory.legacy();
    legacy.emit(BackendEvent::Disconnected);
    wait_state(&mut state, |s| s.status == ConnectionStatus::Disconnected).await;

    let stale = api.is_ready();
    legacy.emit(BackendEvent::Disconnected);
    wait_state(&mut state, |s| s.retry == 2).await;
    legacy.emit(BackendEvent::Connected);
    wait_state(&mut state, |s| s.status == ConnectionStatus::Connected).await;

    tokio::time::timeout(WAIT, api.is_ready())
        .await
        .unwrap()
        .unwrap();
    let stale = tokio::time::timeout(Duration::from_millis(200), stale).await;
    assert!(stale.is_err());
}

#[tokio::test]
async fn test_update_to_same_url_is_noop() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;

    assert!(!api.update_api_url(URL).await.unwrap());
    assert_eq!(factory.builds(), 1);
    assert!(api.is_api_ready());
}

#[tokio::test]
async fn test_update_url_rebuilds_backends() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;
    let old = factory.legacy();
    let old_calls = old.rpc_calls();

    assert!(api.update_api_url("wss://polkadot-rpc.dwellir.com").await.unwrap());
    assert_eq!(factory.builds(), 2);
    assert_eq!(api.api_url(), "wss://polkadot-rpc.dwellir.com");
    assert!(!old.is_connected());

    let info = tokio::time::timeout(WAIT, api.is_ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.system_chain, "Polkadot");
    assert!(factory.legacy().rpc_calls() > 0);
    assert_eq!(old.rpc_calls(), old_calls);
    assert_eq!(
        factory.urls(),
        vec![URL.to_string(), "wss://polkadot-rpc.dwellir.com".to_string()]
    );
}

#[tokio::test]
async fn test_update_url_build_failure_keeps_connection() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;

    assert!(api.update_api_url("").await.is_err());
    assert!(api.api_error().is_some());
    assert_eq!(api.api_url(), URL);
    assert_eq!(api.connection_status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_fill_failure_rejects_readiness() {
    init_tracing();
    let factory = MockFactory::failing();
    let api = SubstrateApi::with_factory(request(URL), factory.clone()).unwrap();

    let err = tokio::time::timeout(WAIT, api.is_ready())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ChainError::NotReady(_)));
    assert!(
        api.api_error()
            .is_some_and(|e| e.contains("runtime version unavailable"))
    );
    assert!(!api.is_api_ready());
}

#[tokio::test]
async fn test_disconnect_does_not_count_retry() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;

    api.disconnect().await.unwrap();
    assert_eq!(api.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(api.retry(), 0);
    assert!(!factory.legacy().is_connected());
    assert!(!factory.dynamic().is_connected());

    api.connect().await.unwrap();
    let info = tokio::time::timeout(WAIT, api.is_ready()).await.unwrap();
    assert!(info.is_ok());
    assert_eq!(api.connection_status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_dynamic_canonical_ignores_legacy_drops() {
    init_tracing();
    let factory = MockFactory::new();
    let api = SubstrateApi::with_factory(request_for("kate", URL), factory.clone()).unwrap();
    tokio::time::timeout(WAIT, api.is_ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(api.canonical().kind(), BackendKind::Dynamic);
    let mut state = api.subscribe_state();

    let legacy = factory.legacy();
    for _ in 0..3 {
        legacy.emit(BackendEvent::Disconnected);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(api.connection_status(), ConnectionStatus::Connected);
    assert_eq!(api.retry(), 0);
    assert!(api.is_api_ready());

    factory.dynamic().emit(BackendEvent::Disconnected);
    let snapshot = wait_state(&mut state, |s| s.retry == 1).await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(!api.is_api_ready());
}

#[tokio::test]
async fn test_readiness_waits_for_both_backends() {
    init_tracing();
    let factory = MockFactory::holding_ready(BackendKind::Dynamic);
    let api = SubstrateApi::with_factory(request(URL), factory.clone()).unwrap();
    let mut state = api.subscribe_state();

    wait_state(&mut state, |s| s.status == ConnectionStatus::Connected).await;
    let waiter = api.is_ready();

    let pending = tokio::time::timeout(Duration::from_millis(200), api.is_ready()).await;
    assert!(pending.is_err());
    assert!(!api.is_api_ready());
    // No chain info is read before the barrier opens.
    assert_eq!(factory.legacy().rpc_calls() + factory.dynamic().rpc_calls(), 0);

    factory.dynamic().release_ready();
    let info = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    assert_eq!(info.system_chain, "Polkadot");
    assert!(api.is_api_ready());
}

#[tokio::test]
async fn test_exported_metadata_seeds_next_bootstrap() {
    init_tracing();
    let factory = MockFactory::new();
    let api = ready_api(&factory).await;

    let item = api.export_metadata().await.unwrap();
    assert_eq!(item.genesis_hash, GENESIS);
    assert_eq!(item.spec_version, 1002000);
    assert_eq!(item.hex_value, "0x6d657461");

    let mut pinned = request(URL);
    pinned.metadata = Some(item.clone());
    let second = SubstrateApi::with_factory(pinned, factory.clone()).unwrap();
    tokio::time::timeout(WAIT, second.is_ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(factory.pinned(), vec![None, Some(item)]);
}

#[tokio::test]
async fn test_unreachable_endpoint_becomes_unstable() {
    init_tracing();
    let api = SubstrateApi::new(BootstrapRequest {
        chain_slug: "polkadot".into(),
        api_url: "ws://127.0.0.1:1".into(),
        config: ConnectionConfig {
            auto_connect_ms: 50,
            connect_timeout_ms: 200,
            max_retries: 2,
            ..Default::default()
        },
        metadata: None,
    })
    .unwrap();
    let mut state = api.subscribe_state();

    let snapshot = wait_state(&mut state, |s| s.status == ConnectionStatus::Unstable).await;
    assert_eq!(snapshot.retry, 3);

    // Detached: the transport stops dialing.
    let mut events = api.legacy().events();
    let quiet = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(quiet.is_err());
    assert!(!api.canonical().is_connected());
    assert_eq!(api.connection_status(), ConnectionStatus::Unstable);
    assert_eq!(api.retry(), 3);
}
