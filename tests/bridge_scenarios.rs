//! End-to-end scenarios against the mock bus: telegrams flowing into metrics,
//! bus outages, configuration conflicts and shutdown.

use knx_bridge::knx::mock::MockTransport;
use knx_bridge::logging::init_test_logger;
use knx_bridge::{
    BridgeError, DatapointValue, ExporterConfig, GroupAddress, MetricsBridge, Poller,
    SessionState, Telegram,
};
use prometheus::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const BASE: &str = r#"
connection:
  endpoint: mock:0
poll_interval: 20ms
session:
  initial_backoff: 10ms
  max_backoff: 50ms
  request_timeout: 1s
"#;

fn config(addresses: &str) -> ExporterConfig {
    ExporterConfig::from_yaml_str(&format!("{BASE}address_configs:\n{addresses}")).unwrap()
}

fn addr(text: &str) -> GroupAddress {
    text.parse().unwrap()
}

fn sample(registry: &Registry, name: &str) -> Option<f64> {
    registry
        .gather()
        .into_iter()
        .find(|f| f.get_name() == name)
        .map(|f| f.get_metric()[0].get_gauge().get_value())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

struct Running {
    bus: MockTransport,
    bridge: Arc<MetricsBridge>,
    registry: Registry,
    poller: Poller,
    session: JoinHandle<Result<(), BridgeError>>,
}

async fn start(addresses: &str) -> Running {
    init_test_logger();
    let bus = MockTransport::new();
    let bridge = MetricsBridge::new(config(addresses), Arc::new(bus.clone())).unwrap();
    let registry = Registry::new();
    bridge.register_into(&registry).unwrap();
    let runner = bridge.clone();
    let session = tokio::spawn(async move { runner.run().await });
    let poller = Poller::new(bridge.clone());
    poller.start();
    wait_until(|| bridge.session().state() == SessionState::Connected).await;
    Running {
        bus,
        bridge,
        registry,
        poller,
        session,
    }
}

#[tokio::test]
async fn scenario_boolean_telegram_becomes_metric() {
    let run = start("  1/1/1:\n    name: light\n    dpt: 1.001\n").await;
    assert_eq!(sample(&run.registry, "knx_light"), None);

    assert!(run.bus.inject(Telegram::write(addr("1/1/1"), vec![0x01])));
    wait_until(|| sample(&run.registry, "knx_light") == Some(1.0)).await;
    assert_eq!(sample(&run.registry, "knx_bus_connected"), Some(1.0));

    run.poller.stop().await;
    run.bridge.close().await;
    run.session.await.unwrap().unwrap();
}

#[tokio::test]
async fn scenario_bus_outage_keeps_last_values() {
    let run = start(
        "  1/1/1:\n    name: light\n    dpt: 1.001\n  2/0/1:\n    name: temperature\n    dpt: 9.001\n    read_active: true\n    max_age: 1h\n",
    )
    .await;
    run.bus.set_response(addr("2/0/1"), vec![0x0C, 0x1A]);
    run.bus.inject(Telegram::write(addr("1/1/1"), vec![0x01]));
    wait_until(|| sample(&run.registry, "knx_temperature") == Some(21.0)).await;
    wait_until(|| sample(&run.registry, "knx_light") == Some(1.0)).await;

    run.bus.set_online(false);
    run.bus.drop_connection();
    wait_until(|| run.bridge.session().state() != SessionState::Connected).await;
    sleep(Duration::from_millis(100)).await;

    // Values survive the outage and the bridge keeps trying to reconnect.
    assert_eq!(sample(&run.registry, "knx_light"), Some(1.0));
    assert_eq!(sample(&run.registry, "knx_temperature"), Some(21.0));
    assert_eq!(sample(&run.registry, "knx_bus_connected"), Some(0.0));
    assert!(!run.session.is_finished());

    run.bus.set_online(true);
    wait_until(|| run.bus.connect_count() >= 2).await;
    wait_until(|| run.bridge.session().state() == SessionState::Connected).await;
    run.bus.inject(Telegram::write(addr("1/1/1"), vec![0x00]));
    wait_until(|| sample(&run.registry, "knx_light") == Some(0.0)).await;

    run.poller.stop().await;
    run.bridge.close().await;
    run.session.await.unwrap().unwrap();
}

#[tokio::test]
async fn scenario_listen_only_value_is_reported_stale() {
    let run = start("  1/1/1:\n    name: light\n    dpt: 1.001\n    max_age: 50ms\n").await;
    assert_eq!(sample(&run.registry, "knx_value_stale"), None);

    run.bus.inject(Telegram::write(addr("1/1/1"), vec![0x01]));
    wait_until(|| sample(&run.registry, "knx_light") == Some(1.0)).await;
    wait_until(|| sample(&run.registry, "knx_value_stale") == Some(1.0)).await;
    wait_until(|| run.bridge.snapshot(addr("1/1/1")).is_some_and(|c| c.stale)).await;
    // The last value stays exported next to the stale marker.
    assert_eq!(sample(&run.registry, "knx_light"), Some(1.0));

    run.bus.inject(Telegram::write(addr("1/1/1"), vec![0x00]));
    wait_until(|| sample(&run.registry, "knx_light") == Some(0.0)).await;
    assert!(!run.bridge.snapshot(addr("1/1/1")).unwrap().stale);

    run.poller.stop().await;
    run.bridge.close().await;
    run.session.await.unwrap().unwrap();
}

#[tokio::test]
async fn scenario_close_returns_after_connect_loop_is_dropped() {
    let run = start("  1/1/1:\n    name: light\n    dpt: 1.001\n").await;
    run.session.abort();
    let _ = run.session.await;

    run.poller.stop().await;
    timeout(Duration::from_secs(1), run.bridge.close())
        .await
        .expect("close hung");
    assert_eq!(run.bridge.session().state(), SessionState::Closed);
}

#[tokio::test]
async fn scenario_duplicate_identity_fails_before_connecting() {
    let bus = MockTransport::new();
    let result = MetricsBridge::new(
        config("  1/1/1:\n    name: light\n    dpt: 1.001\n  1/1/2:\n    name: light\n    dpt: 1.001\n"),
        Arc::new(bus.clone()),
    );
    assert!(matches!(
        result,
        Err(BridgeError::DuplicateMetricIdentity { .. })
    ));
    assert_eq!(bus.connect_count(), 0);
}

#[tokio::test]
async fn scenario_stop_then_close_ends_all_writes() {
    let run = start(
        "  1/1/1:\n    name: light\n    dpt: 1.001\n  2/0/1:\n    name: temperature\n    dpt: 9.001\n    read_active: true\n    max_age: 10ms\n",
    )
    .await;
    run.bus.set_response(addr("2/0/1"), vec![0x0C, 0x1A]);
    run.bus.inject(Telegram::write(addr("1/1/1"), vec![0x01]));
    wait_until(|| run.bridge.snapshot(addr("2/0/1")).is_some()).await;
    wait_until(|| run.bridge.snapshot(addr("1/1/1")).is_some()).await;

    run.poller.stop().await;
    run.bridge.close().await;
    timeout(Duration::from_secs(1), run.session)
        .await
        .expect("connect loop still running")
        .unwrap()
        .unwrap();
    assert_eq!(run.bridge.session().state(), SessionState::Closed);

    let light = run.bridge.snapshot(addr("1/1/1"));
    let temperature = run.bridge.snapshot(addr("2/0/1"));
    assert!(!run.bus.inject(Telegram::write(addr("1/1/1"), vec![0x00])));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(run.bridge.snapshot(addr("1/1/1")), light);
    assert_eq!(run.bridge.snapshot(addr("2/0/1")), temperature);
    assert!(matches!(
        run.bridge.read_now(addr("2/0/1")).await,
        Err(BridgeError::SessionClosed)
    ));
}

#[tokio::test]
async fn concurrent_reads_do_not_block_each_other() {
    let addresses: String = (1..=5)
        .map(|i| format!("  3/0/{i}:\n    name: level_{i}\n    dpt: 5.001\n"))
        .collect();
    let run = start(&addresses).await;
    run.bus.set_response_delay(Duration::from_millis(150));
    for i in 1..=5 {
        run.bus.set_response(addr(&format!("3/0/{i}")), vec![0xFF]);
    }

    let started = Instant::now();
    let reads: Vec<_> = (1..=5)
        .map(|i| {
            let bridge = run.bridge.clone();
            tokio::spawn(async move { bridge.read_now(addr(&format!("3/0/{i}"))).await })
        })
        .collect();
    for read in reads {
        read.await.unwrap().unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(600));
    for i in 1..=5 {
        assert_eq!(
            run.bridge.snapshot(addr(&format!("3/0/{i}"))).unwrap().value,
            DatapointValue::Float(100.0)
        );
    }

    run.poller.stop().await;
    run.bridge.close().await;
    run.session.await.unwrap().unwrap();
}

#[test]
fn scrapes_see_whole_values_during_writes() {
    let bridge = MetricsBridge::new(
        config("  1/2/3:\n    name: counter\n    dpt: 12.001\n"),
        Arc::new(MockTransport::new()),
    )
    .unwrap();
    let registry = Arc::new(Registry::new());
    bridge.register_into(&registry).unwrap();

    let writer = {
        let bridge = bridge.clone();
        std::thread::spawn(move || {
            for value in [0u32, u32::MAX, 0x0000_FFFF, 0xFFFF_0000].repeat(250) {
                bridge.on_telegram(Telegram::write(addr("1/2/3"), value.to_be_bytes().to_vec()));
            }
        })
    };
    let allowed = [0.0, f64::from(u32::MAX), 65535.0, f64::from(0xFFFF_0000u32)];
    for _ in 0..500 {
        if let Some(v) = sample(&registry, "knx_counter") {
            assert!(allowed.contains(&v), "torn value {v}");
        }
    }
    writer.join().unwrap();
    assert_eq!(bridge.message_count("incoming", true), 1000);
}
