//! End-to-end tests: orchestrator, channels, filtering and throttling wired
//! together over the in-process transport.

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use siem_event_streaming::conditions::{AnalyticEvaluator, ConditionOperator, FilterCondition};
use siem_event_streaming::config::ThresholdTiers;
use siem_event_streaming::models::{NetworkData, SystemData, ThreatData};
use siem_event_streaming::protocol::ClientStreamConfig;
use siem_event_streaming::{
    ChannelConfig, ChannelTransport, ClientType, ControlCommand, EventPayload, FilterAction, FilterDecision,
    MetricsUpdate, OutboundMessage, Severity, SmartFilterRule, StreamEvent, StreamingConfig, StreamingOrchestrator,
    ThrottleLevel,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn threat(severity: Severity) -> StreamEvent {
    StreamEvent::new(
        EventPayload::Threat(ThreatData {
            threat_id: "T-2001".to_string(),
            category: "ransomware".to_string(),
            severity,
            confidence: 0.7,
            indicators: vec![],
            source_ip: Some("198.51.100.7".to_string()),
            target: None,
            attributes: Map::new(),
        }),
        "edr",
    )
}

fn network(bytes: u64) -> StreamEvent {
    StreamEvent::new(
        EventPayload::Network(NetworkData {
            source_ip: "10.1.2.3".to_string(),
            destination_ip: "192.0.2.10".to_string(),
            protocol: "udp".to_string(),
            port: Some(53),
            bytes,
            severity: Severity::Low,
            attributes: Map::new(),
        }),
        "netflow",
    )
}

fn heartbeat() -> StreamEvent {
    StreamEvent::new(
        EventPayload::System(SystemData {
            component: "collector".to_string(),
            message: "heartbeat".to_string(),
            severity: Severity::Info,
            attributes: Map::new(),
        }),
        "core",
    )
}

fn quiet_config() -> StreamingConfig {
    let mut config = StreamingConfig::default();
    config.filtering.install_default_rules = false;
    config
}

async fn connect(
    config: StreamingConfig,
    client_id: &str,
    client_type: ClientType,
) -> (Arc<StreamingOrchestrator>, Arc<ChannelTransport>, mpsc::Receiver<OutboundMessage>) {
    let transport = Arc::new(ChannelTransport::new(256));
    let orchestrator = Arc::new(StreamingOrchestrator::new(config, transport.clone()).unwrap());
    let mut rx = transport.register(client_id);
    orchestrator.connect_client(client_id, None, client_type).await.unwrap();
    let welcome = rx.try_recv().unwrap();
    assert_eq!(welcome.kind(), "welcome");
    (orchestrator, transport, rx)
}

fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn mobile_client_under_sustained_latency_is_throttled_to_critical() {
    let (orchestrator, _transport, _rx) = connect(StreamingConfig::default(), "phone", ClientType::Mobile).await;

    for _ in 0..10 {
        orchestrator.throttling().update_metrics("phone", MetricsUpdate::latency(2500.0));
    }

    let recommendation = orchestrator.get_throttle_recommendation("phone");
    assert_eq!(recommendation.throttle_level, ThrottleLevel::Critical);
    assert_eq!(recommendation.adjustment_factor, 0.14);
    assert_eq!(recommendation.time_to_recheck, 5000);
    assert_eq!(recommendation.recommended_rate, 140);
}

#[tokio::test]
async fn throttle_adjustment_command_reports_and_pushes_update() {
    let (orchestrator, _transport, mut rx) = connect(StreamingConfig::default(), "api-1", ClientType::Api).await;

    let result = orchestrator
        .handle_command(
            "api-1",
            ControlCommand::RequestThrottleAdjustment {
                metrics: Some(MetricsUpdate::latency(600.0)),
            },
        )
        .await;
    assert!(result.success);
    assert_eq!(result.data.as_ref().unwrap()["recommended_rate"], 900);
    assert_eq!(result.data.as_ref().unwrap()["throttle_level"], "moderate");

    let kinds: Vec<&str> = drain(&mut rx).iter().map(|m| m.kind()).collect();
    assert_eq!(kinds, vec!["command_result", "throttle_update"]);
}

#[tokio::test]
async fn higher_priority_block_wins_over_lower_priority_tag() {
    let (orchestrator, _transport, mut rx) = connect(quiet_config(), "c1", ClientType::Web).await;
    let filtering = orchestrator.filtering();

    assert_ok!(filtering.add_rule(
        SmartFilterRule::new("tag_threats", "Tag threats", 50)
            .with_condition(FilterCondition::equals("type", "threat"))
            .with_action(FilterAction::Tag {
                tags: vec!["seen".to_string()],
            }),
    ));
    assert_ok!(filtering.add_rule(
        SmartFilterRule::new("block_threats", "Block threats", 100)
            .with_condition(FilterCondition::equals("type", "threat"))
            .with_action(FilterAction::Block),
    ));

    let report = orchestrator.process_event(threat(Severity::High)).await;
    assert_eq!(report.blocked, 1);
    assert!(drain(&mut rx).is_empty());

    let stats = filtering.get_statistics();
    assert_eq!(stats.rules["block_threats"].events_matched, 1);
    assert_eq!(stats.rules.get("tag_threats").map(|s| s.events_processed).unwrap_or(0), 0);
}

#[tokio::test]
async fn half_matched_weight_does_not_trigger_rule() {
    let (orchestrator, _transport, mut rx) = connect(quiet_config(), "c1", ClientType::Web).await;

    assert_ok!(orchestrator.filtering().add_rule(
        SmartFilterRule::new("half", "Half match", 10)
            .with_condition(FilterCondition::equals("type", "network"))
            .with_condition(FilterCondition::equals("data.protocol", "tcp"))
            .with_action(FilterAction::Block),
    ));

    let report = orchestrator.process_event(network(512)).await;
    assert_eq!(report.blocked, 0);
    assert_eq!(report.delivered, 1);

    match drain(&mut rx).pop() {
        Some(OutboundMessage::Event { filter, .. }) => {
            let summary = filter.unwrap();
            assert_eq!(summary.action, FilterDecision::Allow);
            assert!(summary.matched_rules.is_empty());
        }
        other => panic!("expected an event, got {:?}", other),
    }
}

#[tokio::test]
async fn aggregation_window_batches_in_order_and_skips_filtering() {
    let (orchestrator, _transport, mut rx) = connect(quiet_config(), "batcher", ClientType::Api).await;

    let result = orchestrator
        .handle_command(
            "batcher",
            ControlCommand::ConfigureStreams {
                config: ClientStreamConfig {
                    channels: vec![ChannelConfig::new("network-batch")
                        .with_filters(vec![FilterCondition::equals("type", "network")])
                        .with_aggregation(30_000)],
                    filter: None,
                    replace_existing: true,
                },
            },
        )
        .await;
    assert!(result.success);
    drain(&mut rx);

    for bytes in [100, 200, 300] {
        let report = orchestrator.process_event(network(bytes)).await;
        assert_eq!(report.routed, 0);
    }
    orchestrator.process_event(threat(Severity::High)).await;
    assert!(drain(&mut rx).is_empty());

    let report = orchestrator.flush_aggregations_at(Utc::now() + Duration::seconds(31)).await;
    assert_eq!(report.aggregations, 1);

    let messages = drain(&mut rx);
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        OutboundMessage::Aggregation { aggregation, .. } => {
            assert_eq!(aggregation.count, 3);
            assert_eq!(aggregation.window_end - aggregation.window_start, Duration::seconds(30));
            let sizes: Vec<Value> = aggregation
                .events
                .iter()
                .map(|e| e.field_view().unwrap()["data"]["bytes"].clone())
                .collect();
            assert_eq!(sizes, vec![json!(100), json!(200), json!(300)]);
        }
        other => panic!("expected an aggregation, got {:?}", other),
    }

    assert_eq!(orchestrator.filtering().get_statistics().events_processed, 0);
}

#[tokio::test]
async fn closed_channel_stops_routing_and_reclose_returns_false() {
    let (orchestrator, _transport, mut rx) = connect(quiet_config(), "c1", ClientType::Cli).await;
    let channel_id = orchestrator.channels().get_client_channels("c1")[0].id.clone();

    let first = orchestrator
        .handle_command("c1", ControlCommand::CloseChannel { channel_id: channel_id.clone() })
        .await;
    assert!(first.success);
    assert_eq!(first.data.unwrap()["closed"], true);

    let second = orchestrator
        .handle_command("c1", ControlCommand::CloseChannel { channel_id: channel_id.clone() })
        .await;
    assert!(!second.success);
    assert!(second.error.is_none());
    assert_eq!(second.data.unwrap()["closed"], false);

    assert!(orchestrator.channels().get_client_metrics("c1").channels.is_empty());
    drain(&mut rx);

    let report = orchestrator.process_event(network(1)).await;
    assert_eq!(report.routed, 0);
    assert!(drain(&mut rx).is_empty());
}

struct SlowGeoBackend;

impl AnalyticEvaluator for SlowGeoBackend {
    fn geospatial_within(
        &self,
        _event: &StreamEvent,
        _field_value: &Value,
        _area: Option<&Value>,
    ) -> siem_event_streaming::Result<bool> {
        std::thread::sleep(std::time::Duration::from_millis(20));
        Ok(false)
    }
}

#[tokio::test]
async fn filtering_failure_delivers_original_event_unfiltered() {
    let mut config = quiet_config();
    config.filtering.max_evaluation_time_ms = 1;

    let transport = Arc::new(ChannelTransport::new(16));
    let orchestrator =
        StreamingOrchestrator::with_analytics(config, transport.clone(), Arc::new(SlowGeoBackend)).unwrap();
    let mut rx = transport.register("c1");
    orchestrator.connect_client("c1", None, ClientType::Web).await.unwrap();
    drain(&mut rx);

    assert_ok!(orchestrator.filtering().add_rule(
        SmartFilterRule::new("geo_fence", "Block outside the fence", 10)
            .with_condition(FilterCondition::new(
                "data.source_ip",
                ConditionOperator::GeospatialWithin,
                Some(json!({"lat": 52.5, "lon": 13.4, "radius_km": 50})),
            ))
            .with_action(FilterAction::Block),
    ));

    let original = network(4096);
    let report = orchestrator.process_event(original.clone()).await;
    assert_eq!(report.fail_open, 1);
    assert_eq!(report.delivered, 1);

    match drain(&mut rx).pop() {
        Some(OutboundMessage::Event { event, filter, .. }) => {
            assert!(filter.is_none());
            assert_eq!(event.metadata.correlation_id, original.metadata.correlation_id);
            assert_eq!(event.payload, original.payload);
        }
        other => panic!("expected the unfiltered event, got {:?}", other),
    }
    assert_eq!(orchestrator.metrics().snapshot().fail_open_deliveries, 1);
    assert!(!orchestrator.throttling().metrics_window("c1").is_empty());
}

/// Slow only for events from one source address.
struct SlowForSource(&'static str);

impl AnalyticEvaluator for SlowForSource {
    fn geospatial_within(
        &self,
        _event: &StreamEvent,
        field_value: &Value,
        _area: Option<&Value>,
    ) -> siem_event_streaming::Result<bool> {
        if field_value.as_str() == Some(self.0) {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        Ok(false)
    }
}

fn subscribe_to(event_type: &str) -> ControlCommand {
    ControlCommand::ConfigureStreams {
        config: ClientStreamConfig {
            channels: vec![ChannelConfig::new(format!("{}-only", event_type))
                .with_filters(vec![FilterCondition::equals("type", event_type)])],
            filter: None,
            replace_existing: true,
        },
    }
}

#[tokio::test]
async fn slow_filtering_throttles_only_the_affected_client() {
    let mut config = quiet_config();
    config.throttling.latency_thresholds = ThresholdTiers::new(2.0, 4.0, 6.0, 8.0);

    let transport = Arc::new(ChannelTransport::new(64));
    let orchestrator =
        StreamingOrchestrator::with_analytics(config, transport.clone(), Arc::new(SlowForSource("10.1.2.3")))
            .unwrap();
    let _slow_rx = transport.register("slow");
    let _fast_rx = transport.register("fast");
    orchestrator.connect_client("slow", None, ClientType::Web).await.unwrap();
    orchestrator.connect_client("fast", None, ClientType::Web).await.unwrap();
    assert!(orchestrator.handle_command("slow", subscribe_to("network")).await.success);
    assert!(orchestrator.handle_command("fast", subscribe_to("threat")).await.success);

    assert_ok!(orchestrator.filtering().add_rule(
        SmartFilterRule::new("geo_fence", "Tag traffic inside the fence", 10)
            .with_condition(FilterCondition::new(
                "data.source_ip",
                ConditionOperator::GeospatialWithin,
                Some(json!({"lat": 52.5, "lon": 13.4, "radius_km": 50})),
            ))
            .with_action(FilterAction::Tag {
                tags: vec!["in-fence".to_string()],
            }),
    ));

    for _ in 0..3 {
        assert_eq!(orchestrator.process_event(network(512)).await.delivered, 1);
        assert_eq!(orchestrator.process_event(threat(Severity::High)).await.delivered, 1);
    }
    assert_eq!(orchestrator.metrics().snapshot().fail_open_deliveries, 0);

    let slow = orchestrator.get_throttle_recommendation("slow");
    assert_eq!(slow.throttle_level, ThrottleLevel::Critical);
    assert_eq!(slow.recommended_rate, 200);
    assert_eq!(orchestrator.throttling().metrics_window("slow").len(), 3);

    let fast = orchestrator.get_throttle_recommendation("fast");
    assert_eq!(fast.throttle_level, ThrottleLevel::None);
    assert_eq!(fast.recommended_rate, 1000);
    assert_eq!(orchestrator.throttling().metrics_window("fast").len(), 3);
}

#[tokio::test]
async fn blocked_events_feed_no_throttling_sample() {
    let (orchestrator, _transport, _rx) = connect(quiet_config(), "c1", ClientType::Web).await;
    assert_ok!(orchestrator.filtering().add_rule(
        SmartFilterRule::new("drop_network", "Drop network", 10)
            .with_condition(FilterCondition::equals("type", "network"))
            .with_action(FilterAction::Block),
    ));

    let report = orchestrator.process_event(network(64)).await;
    assert_eq!(report.blocked, 1);
    assert!(orchestrator.throttling().metrics_window("c1").is_empty());

    let report = orchestrator.process_event(threat(Severity::Medium)).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(orchestrator.throttling().metrics_window("c1").len(), 1);
}

#[tokio::test]
async fn evicted_idle_client_keeps_its_type_when_samples_resume() {
    let (orchestrator, _transport, _rx) = connect(quiet_config(), "phone", ClientType::Mobile).await;

    let evicted = orchestrator.throttling().evict_inactive(Utc::now() + Duration::minutes(6));
    assert_eq!(evicted, vec!["phone".to_string()]);

    let report = orchestrator.process_event(network(1)).await;
    assert_eq!(report.delivered, 1);

    let metrics = orchestrator.throttling().get_client_metrics("phone").unwrap();
    assert_eq!(metrics.client_type, ClientType::Mobile);
    let recommendation = orchestrator.get_throttle_recommendation("phone");
    assert_eq!(recommendation.adjustment_factor, 0.7);
    assert_eq!(recommendation.recommended_rate, 700);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_during_filtering_leaves_no_throttling_state() {
    let mut config = quiet_config();
    config.filtering.max_evaluation_time_ms = 1_000;

    let transport = Arc::new(ChannelTransport::new(16));
    let orchestrator = Arc::new(
        StreamingOrchestrator::with_analytics(config, transport.clone(), Arc::new(SlowForSource("10.1.2.3")))
            .unwrap(),
    );
    let _rx = transport.register("c1");
    orchestrator.connect_client("c1", None, ClientType::Web).await.unwrap();
    assert_ok!(orchestrator.filtering().add_rule(
        SmartFilterRule::new("geo_fence", "Tag traffic inside the fence", 10)
            .with_condition(FilterCondition::new(
                "data.source_ip",
                ConditionOperator::GeospatialWithin,
                Some(json!({"lat": 52.5, "lon": 13.4})),
            ))
            .with_action(FilterAction::Tag {
                tags: vec!["in-fence".to_string()],
            }),
    ));

    let producer = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.process_event(network(1)).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(3)).await;
    assert!(orchestrator.disconnect_client("c1"));
    producer.await.unwrap();

    assert!(!orchestrator.throttling().is_tracked("c1"));
}

#[tokio::test]
async fn default_rules_suppress_heartbeat_noise() {
    let (orchestrator, _transport, mut rx) = connect(StreamingConfig::default(), "c1", ClientType::Web).await;

    let report = orchestrator.process_event(heartbeat()).await;
    assert_eq!(report.blocked, 1);

    let report = orchestrator.process_event(threat(Severity::Critical)).await;
    assert_eq!(report.delivered, 1);
    match drain(&mut rx).pop() {
        Some(OutboundMessage::Event { event, .. }) => {
            assert!(event.metadata.tags.contains(&"critical-threat".to_string()));
            assert!(event.metadata.processed_at.is_some());
        }
        other => panic!("expected a tagged threat, got {:?}", other),
    }
}

#[tokio::test]
async fn clients_cannot_touch_each_others_channels() {
    let transport = Arc::new(ChannelTransport::new(16));
    let orchestrator = StreamingOrchestrator::new(quiet_config(), transport.clone()).unwrap();
    let _a = transport.register("alice");
    let mut b = transport.register("bob");
    let alice_channel = orchestrator.connect_client("alice", None, ClientType::Web).await.unwrap();
    orchestrator.connect_client("bob", None, ClientType::Web).await.unwrap();
    drain(&mut b);

    let result = orchestrator
        .handle_command("bob", ControlCommand::CloseChannel { channel_id: alice_channel.id.clone() })
        .await;
    assert!(!result.success);
    assert_eq!(result.error.unwrap()["code"], "PERMISSION_DENIED");

    // The rejection is also sent to the caller.
    match b.try_recv() {
        Ok(OutboundMessage::CommandResult(sent)) => assert_eq!(sent.command, "close_channel"),
        other => panic!("expected a command result, got {:?}", other),
    }

    let report = orchestrator.process_event(network(10)).await;
    assert_eq!(report.delivered, 2);
}

#[tokio::test]
async fn preferences_follow_the_user_across_reconnects() {
    let transport = Arc::new(ChannelTransport::new(16));
    let orchestrator = StreamingOrchestrator::new(quiet_config(), transport.clone()).unwrap();
    let mut rx = transport.register("laptop");
    orchestrator
        .connect_client("laptop", Some("analyst-7".to_string()), ClientType::Web)
        .await
        .unwrap();

    let preferences = serde_json::from_value(json!({ "severity_minimum": "high" })).unwrap();
    let result = orchestrator
        .handle_command("laptop", ControlCommand::UpdateSmartFilters { preferences })
        .await;
    assert!(result.success);

    assert!(orchestrator.disconnect_client("laptop"));
    assert!(orchestrator.filtering().get_user_preferences("analyst-7").is_some());

    orchestrator
        .connect_client("laptop", Some("analyst-7".to_string()), ClientType::Web)
        .await
        .unwrap();
    drain(&mut rx);

    let report = orchestrator.process_event(network(1)).await;
    assert_eq!(report.blocked, 1);
    let report = orchestrator.process_event(threat(Severity::Critical)).await;
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn unknown_client_commands_and_bad_configs_are_rejected() {
    let transport = Arc::new(ChannelTransport::new(16));
    let orchestrator = StreamingOrchestrator::new(quiet_config(), transport.clone()).unwrap();

    let result = orchestrator.handle_command("nobody", ControlCommand::GetFilteringStats).await;
    assert!(!result.success);

    let _rx = transport.register("c1");
    orchestrator.connect_client("c1", None, ClientType::Web).await.unwrap();
    assert_err!(orchestrator.connect_client("c1", None, ClientType::Web).await);

    let result = orchestrator
        .handle_command(
            "c1",
            ControlCommand::CreateChannel {
                config: ChannelConfig::new("too-long").with_aggregation(10 * 60 * 1000),
            },
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.error.unwrap()["code"], "VALIDATION_ERROR");

    let mut bad = StreamingConfig::default();
    bad.throttling.max_events_per_second = 0;
    assert!(StreamingOrchestrator::new(bad, transport).is_err());
}
