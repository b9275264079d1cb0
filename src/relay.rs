//! The relay event loop
//!
//! One task drives everything: input lines, transport events, the resend
//! timer and shutdown are multiplexed with `tokio::select!`, so the client,
//! its registry and the transport are never shared and need no locks.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::mqtt_span;
use crate::protocol::EventRecord;
use crate::routing::{EventRouter, RouteError};
use crate::transport::mqtt::{MqttClient, NetworkTransport};
use crate::transport::Transport;
use std::future::Future;
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

/// Counters reported when the relay stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    /// Records parsed and routed
    pub records: u64,
    /// Publications handed to the client
    pub publications: u64,
    /// Lines or records skipped as invalid
    pub rejected: u64,
    /// Publications the client refused to send, e.g. oversized payloads
    pub dropped: u64,
}

/// Reads event records and publishes them through one MQTT client
pub struct Relay<T: Transport> {
    client: MqttClient<T>,
    router: EventRouter,
    summary: RelaySummary,
}

/// Wire up a relay for `config` over the network transport
pub fn build_relay(config: &RelayConfig) -> RelayResult<Relay<NetworkTransport>> {
    let hostname = config.hostname()?;
    let options = config.connection_options(&hostname)?;
    let topics = config.topics(&hostname)?;

    info!(
        "Publishing MQTT data to {}{}",
        options.address,
        if options.tls.is_some() { " (TLS)" } else { "" }
    );
    for (channel, template) in [
        ("device info", &topics.devices),
        ("events", &topics.events),
        ("states", &topics.states),
    ] {
        if let Some(template) = template {
            info!("Publishing {} to MQTT topic \"{}\"", channel, template);
        }
    }

    let client = MqttClient::from_options(options)?;
    Ok(Relay::new(client, EventRouter::new(topics, hostname)))
}

impl<T: Transport> Relay<T> {
    pub fn new(client: MqttClient<T>, router: EventRouter) -> Self {
        Self {
            client,
            router,
            summary: RelaySummary::default(),
        }
    }

    pub fn client(&self) -> &MqttClient<T> {
        &self.client
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn summary(&self) -> RelaySummary {
        self.summary
    }

    /// Run until `shutdown` resolves, or until input ends and nothing is
    /// left in flight.
    ///
    /// Shutdown does not flush: unacknowledged publishes are dropped.
    pub async fn run<R, S>(&mut self, input: R, shutdown: S) -> RelayResult<RelaySummary>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        let options = self.client.options();
        let span = mqtt_span!(
            broker = %options.address,
            client_id = %options.client_id,
            qos = options.qos
        );

        let outcome = self.run_loop(input, shutdown).instrument(span).await;
        self.client.shutdown();

        info!(
            records = self.summary.records,
            publications = self.summary.publications,
            rejected = self.summary.rejected,
            dropped = self.summary.dropped,
            "Relay stopped"
        );
        outcome.map(|()| self.summary)
    }

    async fn run_loop<R, S>(&mut self, input: R, shutdown: S) -> RelayResult<()>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut lines = input.lines();
        let mut input_open = true;
        let mut resend_timer = self.client.resend_interval().map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        self.client.start();

        loop {
            if !input_open && self.client.in_flight_len() == 0 {
                info!("Input finished and nothing in flight");
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                event = self.client.next_event() => {
                    self.client.handle_event(event).await;
                }
                _ = tick(&mut resend_timer) => {
                    let resent = self.client.resend_expired(Instant::now()).await;
                    if resent > 0 {
                        debug!("MQTT resent {} publishes ({} inflight)", resent, self.client.in_flight_len());
                    }
                }
                line = lines.next_line(), if input_open => match line {
                    Ok(Some(line)) => self.handle_line(&line).await,
                    Ok(None) => {
                        input_open = false;
                        if self.client.in_flight_len() > 0 {
                            info!(
                                "Input finished, waiting for {} unacknowledged publishes",
                                self.client.in_flight_len()
                            );
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::InvalidData => {
                        warn!("Skipping unreadable input line: {}", e);
                        self.summary.rejected += 1;
                    }
                    Err(e) => return Err(RelayError::Input(e)),
                },
            }
        }
    }

    /// Parse and publish one input line. Blank lines are ignored; bad lines
    /// are logged and counted.
    pub async fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let record: EventRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping invalid record: {}", e);
                self.summary.rejected += 1;
                return;
            }
        };

        if let Err(e) = self.handle_record(&record).await {
            warn!("Skipping record: {}", e);
            self.summary.rejected += 1;
        }
    }

    /// Route one record and publish the result; returns how many
    /// publications the client accepted
    pub async fn handle_record(&mut self, record: &EventRecord) -> Result<usize, RouteError> {
        let publications = self.router.route(record)?;
        self.summary.records += 1;

        let mut published = 0;
        for publication in &publications {
            match self
                .client
                .publish(&publication.topic, &publication.payload)
                .await
            {
                Ok(_) => published += 1,
                Err(_) => self.summary.dropped += 1,
            }
        }
        self.summary.publications += published as u64;
        Ok(published)
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
