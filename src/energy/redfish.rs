//! Out-of-band platform power via a Redfish BMC.
//!
//! A background task polls `/redfish/v1/Systems` and each system's
//! chassis `Power` resource at the configured interval, remembering the
//! last consumed watts per system and integrating them into a synthetic
//! cumulative counter. `read_cumulative` never blocks on the network.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{EnergyReader, MilliJoules, Zone, ZoneReadings};

#[derive(Debug, Deserialize)]
struct ResourceCollection {
    #[serde(rename = "Members", default)]
    members: Vec<ResourceRef>,
}

#[derive(Debug, Deserialize)]
struct ResourceRef {
    #[serde(rename = "@odata.id")]
    odata_id: String,
}

#[derive(Debug, Deserialize)]
struct PowerResource {
    #[serde(rename = "PowerControl", default)]
    power_control: Vec<PowerControl>,
}

#[derive(Debug, Deserialize)]
struct PowerControl {
    #[serde(rename = "PowerConsumedWatts")]
    power_consumed_watts: Option<f64>,
}

#[derive(Debug, Default)]
struct PollState {
    /// Last consumed watts per system id.
    watts_per_system: std::collections::BTreeMap<String, f64>,
    total_mj: f64,
    last_update: Option<Instant>,
}

impl PollState {
    fn apply(&mut self, watts_per_system: std::collections::BTreeMap<String, f64>) {
        let now = Instant::now();
        if let Some(last) = self.last_update {
            let watts: f64 = self.watts_per_system.values().sum();
            self.total_mj += watts * now.duration_since(last).as_secs_f64() * 1000.0;
        }
        self.watts_per_system = watts_per_system;
        self.last_update = Some(now);
    }

    fn settle(&mut self) -> MilliJoules {
        // Carry the last known watts forward to the read instant so the
        // counter keeps moving between polls.
        let now = Instant::now();
        if let Some(last) = self.last_update {
            let watts: f64 = self.watts_per_system.values().sum();
            self.total_mj += watts * now.duration_since(last).as_secs_f64() * 1000.0;
            self.last_update = Some(now);
        }
        self.total_mj as MilliJoules
    }
}

/// Redfish-backed platform energy source.
pub struct RedfishPlatform {
    state: Arc<Mutex<PollState>>,
    cancel: CancellationToken,
}

impl RedfishPlatform {
    /// Validate connectivity with one poll, then start the background
    /// poller.
    pub async fn connect(
        creds: crate::config::RedfishConfig,
        probe_interval: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(creds.skip_ssl_verify)
            .timeout(Duration::from_secs(10))
            .build()
            .context("building Redfish HTTP client")?;

        let initial = poll_power(&client, &creds)
            .await
            .context("initial Redfish probe")?;

        let state = Arc::new(Mutex::new(PollState::default()));
        state.lock().expect("redfish state lock").apply(initial);

        let cancel = CancellationToken::new();
        let poller_state = state.clone();
        let poller_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match poll_power(&client, &creds).await {
                            Ok(watts) => {
                                poller_state.lock().expect("redfish state lock").apply(watts);
                            }
                            Err(e) => {
                                tracing::warn!(host = %creds.host, error = %e, "Redfish poll failed");
                            }
                        }
                    }
                    _ = poller_cancel.cancelled() => {
                        tracing::debug!("Redfish poller stopped");
                        break;
                    }
                }
            }
        });

        Ok(Self { state, cancel })
    }
}

impl EnergyReader for RedfishPlatform {
    fn name(&self) -> &'static str {
        "redfish"
    }

    fn is_supported(&self) -> bool {
        // Connectivity was validated in connect().
        true
    }

    fn read_cumulative(&mut self) -> anyhow::Result<ZoneReadings> {
        let total = self.state.lock().expect("redfish state lock").settle();
        Ok(ZoneReadings::from([(Zone::Platform, total)]))
    }

    fn stop(&mut self) {
        self.cancel.cancel();
    }
}

/// One full poll: list systems, then read each chassis Power resource.
async fn poll_power(
    client: &reqwest::Client,
    creds: &crate::config::RedfishConfig,
) -> anyhow::Result<std::collections::BTreeMap<String, f64>> {
    let systems: ResourceCollection = get_json(
        client,
        creds,
        &format!("{}/redfish/v1/Systems", creds.host),
    )
    .await
    .context("listing systems")?;

    let mut watts_per_system = std::collections::BTreeMap::new();
    for member in systems.members {
        let Some(id) = member.odata_id.rsplit('/').find(|s| !s.is_empty()) else {
            continue;
        };
        let power: PowerResource = get_json(
            client,
            creds,
            &format!("{}/redfish/v1/Chassis/{}/Power", creds.host, id),
        )
        .await
        .with_context(|| format!("reading chassis {id} power"))?;

        let watts: f64 = power
            .power_control
            .iter()
            .filter_map(|pc| pc.power_consumed_watts)
            .sum();
        watts_per_system.insert(id.to_string(), watts);
    }
    Ok(watts_per_system)
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    creds: &crate::config::RedfishConfig,
    url: &str,
) -> anyhow::Result<T> {
    let response = client
        .get(url)
        .basic_auth(&creds.username, Some(&creds.password))
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?;
    response
        .json()
        .await
        .with_context(|| format!("decoding {url}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_resource_decoding() {
        let raw = r#"{
            "PowerControl": [
                {"PowerConsumedWatts": 212.5, "PowerCapacityWatts": 900},
                {"PowerConsumedWatts": 30.0}
            ]
        }"#;
        let power: PowerResource = serde_json::from_str(raw).unwrap();
        let watts: f64 = power
            .power_control
            .iter()
            .filter_map(|pc| pc.power_consumed_watts)
            .sum();
        assert_eq!(watts, 242.5);
    }

    #[test]
    fn test_collection_decoding() {
        let raw = r#"{"Members": [{"@odata.id": "/redfish/v1/Systems/1"}]}"#;
        let collection: ResourceCollection = serde_json::from_str(raw).unwrap();
        assert_eq!(collection.members.len(), 1);
        assert_eq!(
            collection.members[0].odata_id.rsplit('/').next().unwrap(),
            "1"
        );
    }

    #[test]
    fn test_missing_power_control_tolerated() {
        let power: PowerResource = serde_json::from_str("{}").unwrap();
        assert!(power.power_control.is_empty());
    }
}
