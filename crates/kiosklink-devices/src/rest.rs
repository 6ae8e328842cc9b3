//! Poll-channel client.
//!
//! The devices always accept synchronous HTTP requests, so this channel
//! carries commands and periodic info queries. Every request outcome feeds
//! the liveness tracker: the poll channel is evidence of reachability on
//! its own, independent of telemetry.
//!
//! The endpoint speaks a `?password=…&type=json&cmd=…` query dialect and
//! wraps command results in its own `status` envelope, which is
//! authoritative regardless of the HTTP status code.

use crate::liveness::LivenessTracker;
use crate::registry::Device;
use kiosklink_core::{BridgeEvent, EventBus};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Poll-channel failure kinds.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Network-level failure, no HTTP response at all.
    #[error("no response: {0}")]
    NoResponse(String),

    #[error("request timed out")]
    Timeout,

    /// HTTP response with a non-2xx status.
    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    /// Response received but missing an expected part.
    #[error("response missing {0}")]
    MissingField(String),

    /// The device's own status envelope reported an error.
    #[error("endpoint rejected request: {0}")]
    Endpoint(String),
}

/// Raw HTTP response as the transport saw it.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Transport seam for the poll channel, so tests can inject responses.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    /// Perform a GET. Only `NoResponse` and `Timeout` originate here.
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, PollError>;
}

/// `reqwest`-backed transport.
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestFetch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, PollError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    PollError::Timeout
                } else {
                    // without_url: the URL carries the device password.
                    PollError::NoResponse(err.without_url().to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| PollError::NoResponse(err.without_url().to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

/// Collapse runs of whitespace into single spaces and trim.
fn clean_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn encode_component(text: &str) -> String {
    urlencoding::encode(text).into_owned()
}

/// Encode the device password for the query string.
pub fn encode_password(password: &str) -> String {
    encode_component(password)
}

/// Render a command value for the query string.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the query fragment for a command, applying the per-command
/// encoding rules the endpoint expects.
pub fn command_query(command_id: &str, value: &Value) -> String {
    let text = value_text(value);
    match command_id {
        "textToSpeech" => format!("cmd=textToSpeech&text={}", encode_component(&clean_spaces(&text))),
        "loadURL" => format!("cmd=loadURL&url={}", encode_component(&clean_spaces(&text))),
        "startApplication" => format!("cmd=startApplication&package={}", clean_spaces(&text)),
        "screenBrightness" => {
            format!("cmd=setStringSetting&key=screenBrightness&value={text}")
        }
        "setAudioVolume" => format!("cmd=setAudioVolume&stream=3&level={text}"),
        _ => format!("cmd={command_id}"),
    }
}

/// Full device URL for a query fragment.
pub fn device_url(device: &Device, query: &str) -> String {
    format!(
        "{}?password={}&type=json&{}",
        device.base_url(),
        encode_password(&device.password),
        query
    )
}

/// Redact the password portion of a device URL for logging.
pub fn redact(url: &str) -> String {
    match (url.find("password="), url.find("&type")) {
        (Some(start), Some(end)) if start < end => {
            format!("{}password=(hidden){}", &url[..start], &url[end..])
        }
        _ => url.to_string(),
    }
}

/// Synchronous request/response client for one fleet.
pub struct PollClient {
    fetch: Arc<dyn HttpFetch>,
    liveness: LivenessTracker,
    timeout: Duration,
}

impl PollClient {
    pub fn new(fetch: Arc<dyn HttpFetch>, liveness: LivenessTracker, timeout: Duration) -> Self {
        Self {
            fetch,
            liveness,
            timeout,
        }
    }

    /// Query the device-info snapshot.
    ///
    /// Success refreshes liveness, any failure marks the device dead.
    pub async fn get_info(&self, device: &Device) -> Result<Map<String, Value>, PollError> {
        let url = device_url(device, "cmd=deviceInfo");
        let result = self.info_request(device, &url).await;
        match &result {
            Ok(_) => self.liveness.record_activity(&device.key),
            Err(err) => {
                tracing::warn!(device = %device.key, %err, "info poll failed");
                self.liveness.record_explicit_down(&device.key);
            }
        }
        result
    }

    async fn info_request(
        &self,
        device: &Device,
        url: &str,
    ) -> Result<Map<String, Value>, PollError> {
        let body = self.request(device, url).await?;
        let Value::Object(map) = body else {
            return Err(PollError::MissingField("info object body".to_string()));
        };
        // Bad credentials come back as a status envelope instead of info.
        if let Some(status) = map.get("status").and_then(Value::as_str) {
            if status == "Error" {
                return Err(endpoint_error(device, &map));
            }
        }
        if !map.contains_key("ip4") {
            return Err(PollError::MissingField("ip4".to_string()));
        }
        Ok(map)
    }

    /// Send one command. One attempt, no retry; an unacknowledged point is
    /// the failure signal upstream.
    pub async fn send_command(
        &self,
        device: &Device,
        command_id: &str,
        value: &Value,
    ) -> Result<(), PollError> {
        let query = command_query(command_id, value);
        let url = device_url(device, &query);
        let result = self.command_request(device, command_id, &url).await;
        match &result {
            Ok(()) => self.liveness.record_activity(&device.key),
            Err(err) => {
                tracing::warn!(device = %device.key, command = command_id, %err, "command failed");
                self.liveness.record_explicit_down(&device.key);
            }
        }
        result
    }

    async fn command_request(
        &self,
        device: &Device,
        command_id: &str,
        url: &str,
    ) -> Result<(), PollError> {
        let body = self.request(device, url).await?;
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| PollError::MissingField("status envelope".to_string()))?;

        match status {
            "OK" => {
                tracing::debug!(
                    device = %device.key,
                    command = command_id,
                    "command acknowledged by endpoint"
                );
                Ok(())
            }
            "Error" => {
                if let Value::Object(map) = &body {
                    Err(endpoint_error(device, map))
                } else {
                    Err(PollError::Endpoint("unspecified error".to_string()))
                }
            }
            other => Err(PollError::Endpoint(format!(
                "unexpected status {other:?}"
            ))),
        }
    }

    async fn request(&self, device: &Device, url: &str) -> Result<Value, PollError> {
        tracing::debug!(device = %device.key, url = %redact(url), "poll request");
        let response = self.fetch.get(url, self.timeout).await?;
        if !(200..300).contains(&response.status) {
            return Err(PollError::HttpStatus(response.status));
        }
        serde_json::from_str(&response.body)
            .map_err(|_| PollError::MissingField("valid JSON body".to_string()))
    }
}

fn endpoint_error(device: &Device, map: &Map<String, Value>) -> PollError {
    let text = map
        .get("statustext")
        .and_then(Value::as_str)
        .unwrap_or("unspecified error");
    if text == "Please login" {
        tracing::error!(
            device = %device.key,
            "remote admin password seems to be incorrect"
        );
    }
    PollError::Endpoint(text.to_string())
}

/// Periodic info polling for the enabled fleet.
///
/// One self-rescheduling task per device: the next sleep starts only after
/// the previous request finished, so requests to a device never overlap.
pub struct PollScheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl PollScheduler {
    pub fn start(
        client: Arc<PollClient>,
        bus: EventBus,
        devices: Vec<Arc<Device>>,
        interval: Duration,
    ) -> Self {
        let mut tasks = Vec::with_capacity(devices.len());

        for device in devices {
            let client = Arc::clone(&client);
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match client.get_info(&device).await {
                        Ok(map) => {
                            let values = crate::classify::normalize_telemetry(map);
                            bus.publish(BridgeEvent::telemetry(&device.key, values), "poll");
                        }
                        Err(_) => {
                            // Already logged and reflected in liveness;
                            // retried on the next tick, never immediately.
                        }
                    }
                }
            }));
        }

        Self { tasks }
    }

    /// Cancel every polling loop, pending sleeps included.
    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosklink_core::EventBus;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    struct FakeFetch {
        responses: Mutex<VecDeque<Result<HttpResponse, PollError>>>,
        urls: Mutex<Vec<String>>,
    }

    impl FakeFetch {
        fn new(responses: Vec<Result<HttpResponse, PollError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                urls: Mutex::new(Vec::new()),
            })
        }

        fn ok(body: Value) -> Result<HttpResponse, PollError> {
            Ok(HttpResponse {
                status: 200,
                body: body.to_string(),
            })
        }

        fn last_url(&self) -> String {
            self.urls.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl HttpFetch for FakeFetch {
        async fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse, PollError> {
            self.urls.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(PollError::Timeout))
        }
    }

    fn device() -> Device {
        Device {
            key: "Tablet_Kitchen".to_string(),
            name: "Tablet Kitchen".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 6),
            protocol: "http".to_string(),
            port: 8080,
            password: "p w&x".to_string(),
            enabled: true,
        }
    }

    fn client(fetch: Arc<FakeFetch>) -> (PollClient, LivenessTracker) {
        let bus = EventBus::new();
        let liveness = LivenessTracker::new(bus, ["Tablet_Kitchen".to_string()]);
        (
            PollClient::new(fetch, liveness.clone(), Duration::from_secs(6)),
            liveness,
        )
    }

    #[test]
    fn command_query_encodings() {
        assert_eq!(command_query("screenOn", &json!(true)), "cmd=screenOn");
        assert_eq!(
            command_query("textToSpeech", &json!("  hello   world ")),
            "cmd=textToSpeech&text=hello%20world"
        );
        assert_eq!(
            command_query("loadURL", &json!("https://example.org/a b")),
            "cmd=loadURL&url=https%3A%2F%2Fexample.org%2Fa%20b"
        );
        assert_eq!(
            command_query("startApplication", &json!("  com.app  x ")),
            "cmd=startApplication&package=com.app x"
        );
        assert_eq!(
            command_query("screenBrightness", &json!(128)),
            "cmd=setStringSetting&key=screenBrightness&value=128"
        );
        assert_eq!(
            command_query("setAudioVolume", &json!(7)),
            "cmd=setAudioVolume&stream=3&level=7"
        );
    }

    #[test]
    fn url_carries_encoded_password_and_redacts() {
        let url = device_url(&device(), "cmd=screenOn");
        assert_eq!(
            url,
            "http://10.0.0.6:8080/?password=p%20w%26x&type=json&cmd=screenOn"
        );
        assert_eq!(
            redact(&url),
            "http://10.0.0.6:8080/?password=(hidden)&type=json&cmd=screenOn"
        );
    }

    #[test]
    fn password_encoding_covers_uricomponent_extras() {
        assert_eq!(encode_password("a!'()*b"), "a%21%27%28%29%2Ab");
    }

    #[tokio::test(start_paused = true)]
    async fn get_info_success_refreshes_liveness() {
        let fetch = FakeFetch::new(vec![FakeFetch::ok(
            json!({"ip4": "10.0.0.6", "batteryLevel": 90}),
        )]);
        let (client, liveness) = client(fetch.clone());

        let info = client.get_info(&device()).await.expect("info");
        assert_eq!(info.get("batteryLevel"), Some(&json!(90)));
        assert_eq!(
            liveness.verdict("Tablet_Kitchen"),
            Some(crate::liveness::LivenessVerdict::Alive)
        );
        assert!(fetch.last_url().contains("cmd=deviceInfo"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_info_failure_kinds_mark_dead() {
        let cases: Vec<(Result<HttpResponse, PollError>, fn(&PollError) -> bool)> = vec![
            (Err(PollError::Timeout), |e| matches!(e, PollError::Timeout)),
            (
                Err(PollError::NoResponse("connection refused".to_string())),
                |e| matches!(e, PollError::NoResponse(_)),
            ),
            (
                Ok(HttpResponse {
                    status: 500,
                    body: String::new(),
                }),
                |e| matches!(e, PollError::HttpStatus(500)),
            ),
            (FakeFetch::ok(json!({"batteryLevel": 90})), |e| {
                matches!(e, PollError::MissingField(_))
            }),
            (FakeFetch::ok(json!([1, 2])), |e| {
                matches!(e, PollError::MissingField(_))
            }),
        ];

        for (response, check) in cases {
            let fetch = FakeFetch::new(vec![response]);
            let (client, liveness) = client(fetch);
            let err = client.get_info(&device()).await.expect_err("failure");
            assert!(check(&err), "unexpected error: {err}");
            assert_eq!(
                liveness.verdict("Tablet_Kitchen"),
                Some(crate::liveness::LivenessVerdict::Dead)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn command_envelope_is_authoritative_over_http_status() {
        // HTTP 200 but the endpoint reports an error.
        let fetch = FakeFetch::new(vec![FakeFetch::ok(
            json!({"status": "Error", "statustext": "Please login"}),
        )]);
        let (client, liveness) = client(fetch);

        let err = client
            .send_command(&device(), "screenOn", &json!(true))
            .await
            .expect_err("endpoint error");
        assert!(matches!(err, PollError::Endpoint(_)));
        assert_eq!(
            liveness.verdict("Tablet_Kitchen"),
            Some(crate::liveness::LivenessVerdict::Dead)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn command_ok_envelope_succeeds() {
        let fetch = FakeFetch::new(vec![FakeFetch::ok(
            json!({"status": "OK", "statustext": "done"}),
        )]);
        let (client, liveness) = client(fetch.clone());

        client
            .send_command(&device(), "screenOn", &json!(true))
            .await
            .expect("ok");
        assert_eq!(
            liveness.verdict("Tablet_Kitchen"),
            Some(crate::liveness::LivenessVerdict::Alive)
        );
        assert!(fetch.last_url().contains("cmd=screenOn"));
    }

    #[tokio::test(start_paused = true)]
    async fn command_unexpected_envelope_status_fails() {
        let fetch = FakeFetch::new(vec![FakeFetch::ok(json!({"status": "Maybe"}))]);
        let (client, _liveness) = client(fetch);
        let err = client
            .send_command(&device(), "screenOn", &json!(true))
            .await
            .expect_err("unexpected status");
        assert!(matches!(err, PollError::Endpoint(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_polls_and_stops() {
        let fetch = FakeFetch::new(vec![
            FakeFetch::ok(json!({"ip4": "10.0.0.6", "batteryLevel": 90})),
            FakeFetch::ok(json!({"ip4": "10.0.0.6", "batteryLevel": 85})),
        ]);
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let liveness = LivenessTracker::new(bus.clone(), ["Tablet_Kitchen".to_string()]);
        let client = Arc::new(PollClient::new(
            fetch,
            liveness,
            Duration::from_secs(6),
        ));

        let scheduler = PollScheduler::start(
            client,
            bus,
            vec![Arc::new(device())],
            Duration::from_secs(60),
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let mut saw_telemetry = false;
        while let Some((event, meta)) = rx.try_recv() {
            if matches!(event, BridgeEvent::Telemetry { .. }) {
                assert_eq!(meta.source, "poll");
                saw_telemetry = true;
            }
        }
        assert!(saw_telemetry);

        scheduler.stop();
        tokio::time::advance(Duration::from_secs(120)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        // Only liveness/fleet chatter at most; no further telemetry.
        let mut more_telemetry = false;
        while let Some((event, _)) = rx.try_recv() {
            if matches!(event, BridgeEvent::Telemetry { .. }) {
                more_telemetry = true;
            }
        }
        assert!(!more_telemetry);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_polls_waiting_on_their_timer() {
        let fetch = FakeFetch::new(vec![FakeFetch::ok(
            json!({"ip4": "10.0.0.6", "batteryLevel": 90}),
        )]);
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let liveness = LivenessTracker::new(bus.clone(), ["Tablet_Kitchen".to_string()]);
        let client = Arc::new(PollClient::new(
            fetch.clone(),
            liveness,
            Duration::from_secs(6),
        ));

        let scheduler = PollScheduler::start(
            client,
            bus,
            vec![Arc::new(device())],
            Duration::from_secs(60),
        );

        // Stopped mid-sleep: the pending tick must never fire.
        scheduler.stop();
        tokio::time::advance(Duration::from_secs(120)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert!(fetch.urls.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_none());
    }
}
