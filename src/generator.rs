//! Synthetic security event source for demos and soak runs.
//!
//! Emits a small random batch every few seconds, spread across all five
//! event types, and feeds it through the orchestrator like any producer.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::GeneratorConfig;
use crate::models::{
    BehaviorData, EventPayload, EventType, IntelligenceData, NetworkData, Severity, StreamEvent, SystemData,
    ThreatData,
};
use crate::orchestrator::StreamingOrchestrator;

const SEVERITIES: [Severity; 5] = [
    Severity::Info,
    Severity::Low,
    Severity::Medium,
    Severity::High,
    Severity::Critical,
];

const THREAT_CATEGORIES: &[&str] = &["malware", "phishing", "ransomware", "lateral_movement", "exfiltration"];
const ACTIVITIES: &[&str] = &["login", "file_access", "privilege_escalation", "mass_download", "after_hours_access"];
const USERS: &[&str] = &["alice", "bob", "carol", "svc-backup", "admin"];
const PROTOCOLS: &[&str] = &["tcp", "udp", "icmp"];
const PORTS: &[u16] = &[22, 53, 80, 443, 445, 3389, 8080];
const FEEDS: &[&str] = &["abuse.ch", "otx", "misp-community", "internal"];
const COMPONENTS: &[&str] = &["collector", "parser", "router", "storage"];
const SYSTEM_MESSAGES: &[&str] = &[
    "heartbeat",
    "keep-alive from collector",
    "parser backlog above threshold",
    "storage node rejoined cluster",
    "configuration reloaded",
];

pub struct EventGenerator {
    config: GeneratorConfig,
    rng: StdRng,
}

impl EventGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic generator, for tests.
    pub fn seeded(config: GeneratorConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_interval(&mut self) -> Duration {
        let ms = self.rng.gen_range(self.config.min_interval_ms..=self.config.max_interval_ms);
        Duration::from_millis(ms)
    }

    pub fn generate_batch(&mut self) -> Vec<StreamEvent> {
        let size = self.rng.gen_range(self.config.min_batch..=self.config.max_batch);
        (0..size).map(|_| self.generate_event()).collect()
    }

    pub fn generate_event(&mut self) -> StreamEvent {
        let event_type = *EventType::ALL.choose(&mut self.rng).unwrap_or(&EventType::System);
        self.generate(event_type)
    }

    pub fn generate(&mut self, event_type: EventType) -> StreamEvent {
        let severity = *SEVERITIES.choose(&mut self.rng).unwrap_or(&Severity::Medium);
        let rng = &mut self.rng;

        let (payload, source) = match event_type {
            EventType::Threat => (
                EventPayload::Threat(ThreatData {
                    threat_id: format!("T-{:05}", rng.gen_range(1..100_000)),
                    category: pick(rng, THREAT_CATEGORIES).to_string(),
                    severity,
                    confidence: (rng.gen_range(50..=100) as f64) / 100.0,
                    indicators: vec![random_ip(rng), format!("{}.bad.example", pick(rng, USERS))],
                    source_ip: Some(random_ip(rng)),
                    target: Some(format!("host-{:02}", rng.gen_range(1..50))),
                    attributes: attributes(json!({ "engine": "edr" })),
                }),
                "edr",
            ),
            EventType::Behavior => (
                EventPayload::Behavior(BehaviorData {
                    user: pick(rng, USERS).to_string(),
                    activity: pick(rng, ACTIVITIES).to_string(),
                    anomaly_score: (rng.gen_range(0..=100) as f64) / 100.0,
                    severity,
                    attributes: attributes(json!({ "baseline_days": rng.gen_range(7..90) })),
                }),
                "ueba",
            ),
            EventType::Network => (
                EventPayload::Network(NetworkData {
                    source_ip: random_ip(rng),
                    destination_ip: random_ip(rng),
                    protocol: pick(rng, PROTOCOLS).to_string(),
                    port: PORTS.choose(&mut *rng).copied(),
                    bytes: rng.gen_range(64..10_485_760),
                    severity,
                    attributes: Map::new(),
                }),
                "netflow",
            ),
            EventType::Intelligence => (
                EventPayload::Intelligence(IntelligenceData {
                    indicator: random_ip(rng),
                    indicator_type: "ipv4".to_string(),
                    feed: pick(rng, FEEDS).to_string(),
                    severity,
                    attributes: attributes(json!({ "ttl_hours": rng.gen_range(1..168) })),
                }),
                "threat-intel",
            ),
            EventType::System => (
                EventPayload::System(SystemData {
                    component: pick(rng, COMPONENTS).to_string(),
                    message: pick(rng, SYSTEM_MESSAGES).to_string(),
                    severity,
                    attributes: Map::new(),
                }),
                "core",
            ),
        };

        StreamEvent::new(payload, source)
    }

    /// Produce batches into the orchestrator until cancelled.
    pub fn spawn(
        mut self,
        orchestrator: Arc<StreamingOrchestrator>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        info!(
            "Starting event generator ({}-{} events every {}-{}ms)",
            self.config.min_batch, self.config.max_batch, self.config.min_interval_ms, self.config.max_interval_ms
        );
        tokio::spawn(async move {
            loop {
                let wait = self.next_interval();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        for event in self.generate_batch() {
                            let report = orchestrator.process_event(event).await;
                            debug!("Generated event: {:?}", report);
                        }
                    }
                }
            }
            info!("Event generator stopped");
        })
    }
}

fn pick<'a>(rng: &mut StdRng, values: &[&'a str]) -> &'a str {
    values.choose(rng).copied().unwrap_or("unknown")
}

fn random_ip(rng: &mut StdRng) -> String {
    format!(
        "{}.{}.{}.{}",
        rng.gen_range(1..224),
        rng.gen_range(0..=255),
        rng.gen_range(0..=255),
        rng.gen_range(1..255)
    )
}

fn attributes(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_respect_configured_ranges() {
        let config = GeneratorConfig::default();
        let mut generator = EventGenerator::seeded(config.clone(), 7);

        for _ in 0..50 {
            let batch = generator.generate_batch();
            assert!((config.min_batch..=config.max_batch).contains(&batch.len()));

            let wait = generator.next_interval().as_millis() as u64;
            assert!((config.min_interval_ms..=config.max_interval_ms).contains(&wait));
        }
    }

    #[test]
    fn test_every_type_is_produced() {
        let mut generator = EventGenerator::seeded(GeneratorConfig::default(), 42);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(generator.generate_event().event_type());
        }
        assert_eq!(seen.len(), EventType::ALL.len());
    }

    #[test]
    fn test_generated_events_are_routable() {
        let mut generator = EventGenerator::seeded(GeneratorConfig::default(), 1);
        for event_type in EventType::ALL {
            let event = generator.generate(event_type);
            assert_eq!(event.event_type(), event_type);
            assert!(event.field_view().is_ok());
        }
    }
}
