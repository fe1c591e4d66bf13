//! Dashboard subscriber.
//!
//! Listens on the server's event stream and re-fetches aggregates when a
//! response for its own company/survey lands. Bursts of change events are
//! coalesced by a trailing-edge debounce so a flurry of submissions costs one
//! fetch. Missed events are never replayed; instead every (re)connect starts
//! with a fresh fetch.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::models::{Aggregates, AggregatesResponse, ChangeEvent};
use crate::notifier::RESPONSE_CREATED_EVENT;

pub const RESPONSE_CHANGED_EVENT: &str = "response:changed";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(800);

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Feed it chunks as they arrive.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    partial: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes. A UTF-8 sequence split across chunks is held back
    /// until the rest of it arrives.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.partial.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.partial) {
            Ok(_) => self.partial.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // genuinely invalid bytes: decode lossily rather than stall
            Err(_) => {
                let text = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                return self.feed(&text);
            }
        };
        let rest = self.partial.split_off(valid);
        let text = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial = rest;
        self.feed(&text)
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);

        // a trailing CR may be the first half of a CRLF split across chunks
        let held_cr = self.buffer.ends_with('\r');
        if held_cr {
            self.buffer.pop();
        }
        self.buffer = self.buffer.replace("\r\n", "\n").replace('\r', "\n");

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        if held_cr {
            self.buffer.push('\r');
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    // comment-only blocks dispatch nothing
    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

/// What a dashboard for `(company_id, survey_id)` cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardScope {
    pub company_id: String,
    pub survey_id: String,
}

impl DashboardScope {
    /// Whether a frame should trigger a refetch. Unparseable
    /// `response:created` payloads refetch too.
    pub fn wants(&self, frame: &SseFrame) -> bool {
        match frame.event.as_str() {
            RESPONSE_CREATED_EVENT => match serde_json::from_str::<ChangeEvent>(&frame.data) {
                Ok(event) => event.company_id == self.company_id && event.survey_id == self.survey_id,
                Err(_) => true,
            },
            RESPONSE_CHANGED_EVENT => true,
            _ => false,
        }
    }
}

/// Handle for poking a running debouncer.
#[derive(Clone)]
pub struct Debouncer {
    triggers: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    /// Start a debouncer. The receiver yields once per quiet period that
    /// followed at least one trigger.
    pub fn spawn(window: Duration) -> (Self, mpsc::Receiver<()>) {
        let (triggers, rx) = mpsc::unbounded_channel();
        let (fire, fired) = mpsc::channel(1);
        tokio::spawn(debounce(window, rx, fire));
        (Self { triggers }, fired)
    }

    pub fn trigger(&self) {
        let _ = self.triggers.send(());
    }
}

async fn debounce(
    window: Duration,
    mut triggers: mpsc::UnboundedReceiver<()>,
    fire: mpsc::Sender<()>,
) {
    while triggers.recv().await.is_some() {
        // every trigger inside the window restarts it
        loop {
            match timeout(window, triggers.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    let _ = fire.send(()).await;
                    return;
                }
                Err(_) => break,
            }
        }
        if fire.send(()).await.is_err() {
            return;
        }
    }
}

/// Connection settings for [`DashboardClient`].
#[derive(Debug, Clone)]
pub struct DashboardOptions {
    pub server: String,
    pub scope: DashboardScope,
    pub debounce: Duration,
    pub reconnect_delay: Duration,
}

/// Reconnecting event-stream subscriber that prints fresh aggregates.
pub struct DashboardClient {
    http: reqwest::Client,
    options: DashboardOptions,
    connected: bool,
}

impl DashboardClient {
    pub fn new(options: DashboardOptions) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self {
            http,
            options,
            connected: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.options.server.trim_end_matches('/'), path)
    }

    /// Ask the server to remember our company in a cookie.
    pub async fn login(&self) -> reqwest::Result<()> {
        self.http
            .post(self.url("/api/login"))
            .json(&serde_json::json!({ "companyId": self.options.scope.company_id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn fetch_aggregates(&self) -> reqwest::Result<Aggregates> {
        let scope = &self.options.scope;
        let response: AggregatesResponse = self
            .http
            .get(self.url("/api/aggregates"))
            .query(&[
                ("companyId", scope.company_id.as_str()),
                ("surveyId", scope.survey_id.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.aggregates)
    }

    async fn refresh(&self) {
        match self.fetch_aggregates().await {
            Ok(aggregates) => match serde_json::to_string_pretty(&aggregates) {
                Ok(text) => println!("{text}"),
                Err(e) => warn!("could not render aggregates: {e}"),
            },
            Err(e) => warn!("fetching aggregates failed: {e}"),
        }
    }

    /// Subscribe forever, reconnecting after `reconnect_delay` whenever the
    /// stream drops.
    pub async fn run(&mut self) {
        if let Err(e) = self.login().await {
            warn!("login failed, continuing without cookie: {e}");
        }

        let (debouncer, mut fired) = Debouncer::spawn(self.options.debounce);
        loop {
            if let Err(e) = self.listen(&debouncer, &mut fired).await {
                warn!("event stream error: {e}");
            }
            self.connected = false;
            info!("disconnected, retrying in {:?}", self.options.reconnect_delay);
            tokio::time::sleep(self.options.reconnect_delay).await;
        }
    }

    async fn listen(
        &mut self,
        debouncer: &Debouncer,
        fired: &mut mpsc::Receiver<()>,
    ) -> reqwest::Result<()> {
        let response = self
            .http
            .get(self.url("/sse"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        self.connected = true;
        info!("event stream connected");
        // catch up on anything missed while disconnected
        self.refresh().await;

        let mut chunks = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();
        loop {
            tokio::select! {
                chunk = chunks.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in parser.feed_bytes(&bytes) {
                            debug!(event = %frame.event, "received event");
                            if self.options.scope.wants(&frame) {
                                debouncer.trigger();
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                Some(()) = fired.recv() => self.refresh().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn scope() -> DashboardScope {
        DashboardScope {
            company_id: "c1".to_string(),
            survey_id: "s1".to_string(),
        }
    }

    #[test]
    fn test_parser_splits_frames_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(":connected\n\n").is_empty());
        assert!(parser.feed("event: response:created\nda").is_empty());

        let frames = parser.feed("ta: {\"surveyId\":\"s1\"}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "response:created".to_string(),
                data: "{\"surveyId\":\"s1\"}".to_string(),
            }]
        );
    }

    #[test]
    fn test_parser_multiline_data_and_crlf() {
        let mut parser = SseParser::new();
        let frames = parser.feed("data: one\r\ndata: two\r\n\r\ndata:three\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "one\ntwo");
        assert_eq!(frames[1].data, "three");
    }

    #[test]
    fn test_parser_crlf_blank_line_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("event: response:created\r\ndata: {}\r\n\r").is_empty());

        let frames = parser.feed("\nevent: response:created\r\ndata: 2\r\n\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{}");
        assert_eq!(frames[1].data, "2");

        // bare CR line endings
        let frames = parser.feed("data: cr\r\rdata: next\r\r");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "cr");
    }

    #[test]
    fn test_parser_holds_split_utf8() {
        let mut parser = SseParser::new();
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.len() - 3;

        assert!(parser.feed_bytes(&bytes[..split]).is_empty());
        let frames = parser.feed_bytes(&bytes[split..]);
        assert_eq!(frames[0].data, "caf\u{e9}");
    }

    #[test]
    fn test_scope_filters_created_events() {
        let scope = scope();
        let created = |data: &str| SseFrame {
            event: RESPONSE_CREATED_EVENT.to_string(),
            data: data.to_string(),
        };

        let ours = r#"{"surveyId":"s1","companyId":"c1","timestamp":"2024-05-01T12:00:00Z","summary":{"submitted":1}}"#;
        let other = r#"{"surveyId":"s2","companyId":"c1","timestamp":"2024-05-01T12:00:00Z","summary":{"submitted":1}}"#;
        assert!(scope.wants(&created(ours)));
        assert!(!scope.wants(&created(other)));
        assert!(scope.wants(&created("not json")));

        assert!(scope.wants(&SseFrame {
            event: RESPONSE_CHANGED_EVENT.to_string(),
            data: String::new(),
        }));
        assert!(!scope.wants(&SseFrame {
            event: "message".to_string(),
            data: ours.to_string(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_burst() {
        let (debouncer, mut fired) = Debouncer::spawn(DEFAULT_DEBOUNCE);

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.trigger();
        debouncer.trigger();
        let last_trigger = Instant::now();

        fired.recv().await.unwrap();
        assert!(last_trigger.elapsed() >= DEFAULT_DEBOUNCE);

        // nothing more without new triggers
        assert!(timeout(Duration::from_secs(5), fired.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_separate_bursts_fire_separately() {
        let (debouncer, mut fired) = Debouncer::spawn(DEFAULT_DEBOUNCE);

        debouncer.trigger();
        fired.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        debouncer.trigger();
        fired.recv().await.unwrap();
    }

    #[test]
    fn test_client_starts_disconnected() {
        let client = DashboardClient::new(DashboardOptions {
            server: "http://localhost:3000/".to_string(),
            scope: scope(),
            debounce: DEFAULT_DEBOUNCE,
            reconnect_delay: Duration::from_secs(2),
        })
        .unwrap();

        assert!(!client.is_connected());
        assert_eq!(client.url("/sse"), "http://localhost:3000/sse");
    }
}
