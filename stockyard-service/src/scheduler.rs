//! Scheduler daemon
//!
//! Replays a templated request set on a fixed cadence through the HTTP
//! front-end, exactly as an external client would: the daemon owns an HTTP
//! session, posts every item once per interval between the start and stop
//! offsets of the day, and shuts the session down when its cycles are
//! exhausted. Failures are not retried here; they surface as error-tagged
//! pipeline responses.

use chrono::Duration as ChronoDuration;
use std::time::Duration;

use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::model::RequestWire;
use crate::planner::ExpectedTable;
use crate::timefmt;

/// Delay before the first cycle, giving vendors time to come up
pub const START_OFFSET_S: u64 = 5;

/// A recurring request set bounded to a daily window
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Offset-of-day of the first cycle
    pub start: ChronoDuration,
    /// Offset-of-day after which no cycle fires
    pub stop: ChronoDuration,
    /// Cadence between cycles
    pub interval: ChronoDuration,
    pub items: Vec<RequestWire>,
}

impl Schedule {
    pub fn from_config(config: &DaemonConfig, items: Vec<RequestWire>) -> Result<Self> {
        let start = timefmt::parse_day_offset(&config.start)?;
        let stop = timefmt::parse_day_offset(&config.stop)?;
        let interval = timefmt::parse_duration(&config.interval)?;
        if stop <= start {
            return Err(Error::BadRequest(format!(
                "daemon window is empty: {} .. {}",
                config.start, config.stop
            )));
        }
        if interval <= ChronoDuration::zero() {
            return Err(Error::BadRequest("daemon interval must be positive".into()));
        }
        Ok(Self {
            start,
            stop,
            interval,
            items,
        })
    }

    /// Number of cycles the window admits
    pub fn cycles(&self) -> i64 {
        let window_ms = (self.stop - self.start).num_milliseconds();
        let interval_ms = self.interval.num_milliseconds().max(1);
        window_ms / interval_ms
    }
}

/// Build the recurring request set from the planner's expected tables
///
/// Recurring requests carry no window: each tick asks the vendor for its
/// latest data at the declared resolution.
pub fn recurring_items(entries: &[ExpectedTable]) -> Vec<RequestWire> {
    entries
        .iter()
        .map(|entry| RequestWire {
            vendor: entry.vendor.clone(),
            endpoint: entry.endpoint.clone(),
            params: crate::model::RequestParamsWire {
                start: None,
                end: None,
                resolution: entry.resolution.map(timefmt::format_duration),
                resource: entry.resource.clone(),
            },
            corr_id: None,
        })
        .collect()
}

/// The posting daemon
pub struct Daemon {
    schedule: Schedule,
    endpoint: String,
    client: reqwest::Client,
    start_offset: Duration,
}

impl Daemon {
    pub fn new(schedule: Schedule, endpoint: impl Into<String>) -> Self {
        Self {
            schedule,
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            start_offset: Duration::from_secs(START_OFFSET_S),
        }
    }

    /// Override the startup delay (tests)
    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    /// Fire every item once per interval until the cycles are exhausted
    pub async fn run(self) {
        tokio::time::sleep(self.start_offset).await;
        let cycles = self.schedule.cycles();
        let interval = self
            .schedule
            .interval
            .to_std()
            .unwrap_or(Duration::from_secs(60));

        for cycle in 0..cycles {
            tracing::info!(cycle, of = cycles, items = self.schedule.items.len(), "daemon cycle");
            for item in &self.schedule.items {
                match self.post(item).await {
                    Ok(corr_id) => {
                        tracing::debug!(
                            vendor = %item.vendor,
                            endpoint = %item.endpoint,
                            corr_id = %corr_id,
                            "scheduled request accepted"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            vendor = %item.vendor,
                            endpoint = %item.endpoint,
                            error = %e,
                            "scheduled request failed"
                        );
                    }
                }
            }
            tokio::time::sleep(interval).await;
        }
        tracing::info!("daemon window exhausted, shutting down session");
        // The reqwest session drops with self
    }

    async fn post(&self, item: &RequestWire) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(item)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upstream(format!("front-end returned {status}")));
        }
        let body: serde_json::Value = response.json().await?;
        body["corr_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Upstream("front-end reply lacks corr_id".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config(start: &str, stop: &str, interval: &str) -> DaemonConfig {
        DaemonConfig {
            enabled: true,
            start: start.into(),
            stop: stop.into(),
            interval: interval.into(),
        }
    }

    #[test]
    fn cycle_count_follows_the_window() {
        let schedule =
            Schedule::from_config(&config("09:30:00", "16:00:00", "PT15M"), vec![]).unwrap();
        assert_eq!(schedule.cycles(), 26);

        let schedule =
            Schedule::from_config(&config("00:00:00", "01:00:00", "PT1H"), vec![]).unwrap();
        assert_eq!(schedule.cycles(), 1);
    }

    #[test]
    fn empty_or_inverted_windows_are_rejected() {
        assert!(Schedule::from_config(&config("16:00:00", "09:30:00", "PT15M"), vec![]).is_err());
        assert!(Schedule::from_config(&config("09:30:00", "09:30:00", "PT15M"), vec![]).is_err());
    }

    #[test]
    fn recurring_items_have_no_window() {
        let entries = vec![ExpectedTable {
            vendor: "fred".into(),
            endpoint: "series_observations".into(),
            columns: vec!["date".into(), "value".into()],
            resource: Some("Series$GDP".into()),
            resolution: Some(ChronoDuration::days(1)),
            range: None,
        }];
        let items = recurring_items(&entries);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].params.resolution.as_deref(), Some("P1D"));
        assert!(items[0].params.start.is_none());
        assert!(items[0].corr_id.is_none());
    }

    #[tokio::test]
    async fn daemon_posts_every_item_each_cycle() {
        use axum::{routing::post, Json, Router};

        let hits = Arc::new(AtomicUsize::new(0));
        let app_hits = Arc::clone(&hits);
        let app = Router::new().route(
            "/",
            post(move || {
                let hits = Arc::clone(&app_hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"corr_id": "1"}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let schedule = Schedule {
            start: ChronoDuration::zero(),
            stop: ChronoDuration::milliseconds(60),
            interval: ChronoDuration::milliseconds(20),
            items: recurring_items(&[
                ExpectedTable {
                    vendor: "fred".into(),
                    endpoint: "series".into(),
                    columns: vec![],
                    resource: None,
                    resolution: None,
                    range: None,
                },
                ExpectedTable {
                    vendor: "fred".into(),
                    endpoint: "releases".into(),
                    columns: vec![],
                    resource: None,
                    resolution: None,
                    range: None,
                },
            ]),
        };
        assert_eq!(schedule.cycles(), 3);

        Daemon::new(schedule, format!("http://{addr}/"))
            .with_start_offset(Duration::ZERO)
            .run()
            .await;

        // 3 cycles × 2 items
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }
}
