//! Property tests for throttle classification and rate recommendation.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use siem_event_streaming::config::ThrottlingConfig;
use siem_event_streaming::throttling::{client_type_multiplier_tenths, recommended_rate};
use siem_event_streaming::{AdaptiveThrottlingEngine, ClientType, MetricsUpdate, ThrottleLevel};

fn client_type() -> impl Strategy<Value = ClientType> {
    prop_oneof![
        Just(ClientType::Cli),
        Just(ClientType::Web),
        Just(ClientType::Api),
        Just(ClientType::Mobile),
    ]
}

fn level() -> impl Strategy<Value = ThrottleLevel> {
    prop_oneof![
        Just(ThrottleLevel::None),
        Just(ThrottleLevel::Light),
        Just(ThrottleLevel::Moderate),
        Just(ThrottleLevel::Heavy),
        Just(ThrottleLevel::Critical),
    ]
}

proptest! {
    #[test]
    fn level_is_most_severe_signal(
        latency in 0.0f64..5000.0,
        error_rate in 0.0f64..50.0,
        queue_depth in 0u64..10_000,
        client_type in client_type(),
    ) {
        let config = ThrottlingConfig::default();
        let engine = AdaptiveThrottlingEngine::new(config.clone());
        let update = MetricsUpdate {
            connection_latency: Some(latency),
            error_rate: Some(error_rate),
            queue_depth: Some(queue_depth),
            client_type: Some(client_type),
            ..Default::default()
        };

        let recommendation = engine.update_metrics("c", update).unwrap();
        let expected = ThrottleLevel::classify(latency, &config.latency_thresholds)
            .max(ThrottleLevel::classify(error_rate, &config.error_rate_thresholds))
            .max(ThrottleLevel::classify(queue_depth as f64, &config.queue_depth_thresholds));

        prop_assert_eq!(recommendation.throttle_level, expected);
        prop_assert_eq!(recommendation.time_to_recheck, expected.time_to_recheck_ms());
        prop_assert_eq!(
            recommendation.recommended_rate,
            recommended_rate(config.max_events_per_second, expected, client_type)
        );
    }

    #[test]
    fn classification_is_monotonic(a in 0.0f64..10_000.0, b in 0.0f64..10_000.0) {
        let tiers = ThrottlingConfig::default().latency_thresholds;
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(ThrottleLevel::classify(low, &tiers) <= ThrottleLevel::classify(high, &tiers));
    }

    #[test]
    fn rate_matches_floor_formula(max_rate in 1u32..100_000, level in level(), client_type in client_type()) {
        let rate = recommended_rate(max_rate, level, client_type);

        // floor(max * percent/100 * tenths/10), evaluated exactly
        let numerator = max_rate as u64 * level.base_factor_percent() * client_type_multiplier_tenths(client_type);
        let expected = (numerator / 1000).max(1);
        prop_assert_eq!(rate as u64, expected);
        prop_assert!(rate >= 1);

        if level > ThrottleLevel::None {
            let less_severe = match level {
                ThrottleLevel::Critical => ThrottleLevel::Heavy,
                ThrottleLevel::Heavy => ThrottleLevel::Moderate,
                ThrottleLevel::Moderate => ThrottleLevel::Light,
                _ => ThrottleLevel::None,
            };
            prop_assert!(rate <= recommended_rate(max_rate, less_severe, client_type));
        }
    }

    #[test]
    fn window_never_holds_stale_snapshots(offsets in prop::collection::vec(0i64..20_000, 1..40)) {
        let config = ThrottlingConfig::default();
        let window_ms = config.window_size_ms as i64;
        let engine = AdaptiveThrottlingEngine::new(config);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut now = start;
        for offset in offsets {
            now = now + Duration::milliseconds(offset);
            engine.update_metrics_at("c", MetricsUpdate::latency(100.0), now);

            let window = engine.metrics_window("c");
            prop_assert!(!window.is_empty());
            prop_assert!(window.iter().all(|s| now - s.timestamp <= Duration::milliseconds(window_ms)));
        }
    }
}

#[test]
fn documented_examples() {
    assert_eq!(recommended_rate(1000, ThrottleLevel::Moderate, ClientType::Api), 900);
    assert_eq!(recommended_rate(1000, ThrottleLevel::Critical, ClientType::Mobile), 140);
    assert_eq!(recommended_rate(1, ThrottleLevel::Critical, ClientType::Mobile), 1);

    let engine = AdaptiveThrottlingEngine::new(ThrottlingConfig::default());
    let recommendation = engine.get_recommendation("never-seen");
    assert_eq!(recommendation.throttle_level, ThrottleLevel::None);
    assert_eq!(recommendation.recommended_rate, 1000);
}
