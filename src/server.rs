use crate::config::Config;
use crate::error::SequencerError;
use crate::pattern::Pattern;
use crate::sequencer::{PatternHandle, PatternOutcome, Sequencer};
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Unparsed bytes a connection may hold while waiting for the rest of a request.
const MAX_PENDING: usize = 64 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    SetState { led: String, on: bool },
    Blink { leds: Vec<String>, cycles: u32 },
    Shine { cycles: Option<u32> },
    Cancel,
    Status,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Ok,
    Started,
    Status {
        busy: bool,
        leds: BTreeMap<String, bool>,
        last: Option<PatternReport>,
    },
    Error {
        kind: String,
        gpio: Option<u64>,
        message: String,
    },
}

impl ControlResponse {
    pub fn from_error(e: &SequencerError) -> Self {
        Self::Error {
            kind: e.kind().to_string(),
            gpio: e.gpio(),
            message: e.to_string(),
        }
    }

    fn decode_error(message: String) -> Self {
        Self::Error {
            kind: "decode".to_string(),
            gpio: None,
            message,
        }
    }
}

/// How the most recent background pattern ended.
///
/// `kind` is `completed`, `cancelled`, or the error kind that stopped it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PatternReport {
    pub pattern: String,
    pub kind: String,
    pub gpio: Option<u64>,
    pub led: Option<String>,
    pub message: Option<String>,
}

/// What the socket clients drive: the sequencer plus the pattern it is running.
pub struct Control {
    config: Config,
    sequencer: Sequencer,
    active: Mutex<Option<PatternHandle>>,
    last: Mutex<Option<PatternReport>>,
}

impl Control {
    pub fn new(config: Config, sequencer: Sequencer) -> Self {
        Self {
            config,
            sequencer,
            active: Mutex::new(None),
            last: Mutex::new(None),
        }
    }

    pub async fn handle_request(&self, req: ControlRequest) -> ControlResponse {
        let pattern = match req {
            ControlRequest::Cancel => {
                if let Some(handle) = self.active.lock().await.as_ref() {
                    info!("Cancelling {}", handle.kind());
                    handle.cancel();
                }
                return ControlResponse::Ok;
            }
            ControlRequest::Status => return self.status().await,
            ControlRequest::SetState { led, on } => self
                .config
                .resolve(&led)
                .map(|line| Pattern::SetState { line, on }),
            ControlRequest::Blink { leds, cycles } => self.config.blink_pattern(&leds, cycles),
            ControlRequest::Shine { cycles } => self.config.shine_pattern(cycles),
        };
        let started = match pattern {
            Ok(pattern) => self.start(pattern).await,
            Err(e) => Err(e.into()),
        };
        match started {
            Ok(response) => response,
            Err(e) => {
                warn!("Request failed: {}", e);
                ControlResponse::from_error(&e)
            }
        }
    }

    async fn start(&self, pattern: Pattern) -> Result<ControlResponse, SequencerError> {
        let mut active = self.active.lock().await;
        let handle = self.sequencer.run(pattern)?;
        if handle.is_finished() {
            return Ok(ControlResponse::Ok);
        }
        // Accepted, so any previous handle belongs to a finished pattern.
        if let Some(previous) = active.replace(handle) {
            self.record(previous).await;
        }
        Ok(ControlResponse::Started)
    }

    /// Collects the result of a pattern that is no longer running.
    async fn record(&self, handle: PatternHandle) {
        let pattern = handle.kind().to_string();
        let report = match handle.wait().await {
            Ok(outcome) => PatternReport {
                pattern,
                kind: match outcome {
                    PatternOutcome::Completed => "completed",
                    PatternOutcome::Cancelled => "cancelled",
                }
                .to_string(),
                gpio: None,
                led: None,
                message: None,
            },
            Err(e) => {
                warn!("{} failed: {}", pattern, e);
                let gpio = e.gpio();
                PatternReport {
                    pattern,
                    kind: e.kind().to_string(),
                    gpio,
                    led: gpio.and_then(|gpio| self.config.name_of(gpio)).map(str::to_string),
                    message: Some(e.to_string()),
                }
            }
        };
        *self.last.lock().await = Some(report);
    }

    async fn status(&self) -> ControlResponse {
        {
            let mut active = self.active.lock().await;
            // Once the busy flag drops the task only has to return.
            let done = active
                .as_ref()
                .map_or(false, |handle| handle.is_finished() || !self.sequencer.is_busy());
            if done {
                if let Some(handle) = active.take() {
                    self.record(handle).await;
                }
            }
        }
        let levels = self.sequencer.line_levels();
        let leds = self
            .config
            .leds
            .iter()
            .map(|(name, gpio)| {
                let on = levels.get(gpio).map_or(false, |level| level.is_high());
                (name.clone(), on)
            })
            .collect();
        ControlResponse::Status {
            busy: self.sequencer.is_busy(),
            leds,
            last: self.last.lock().await.clone(),
        }
    }

    /// Stops the running pattern, waits for its cleanup, then releases
    /// everything the single-line requests left exported.
    pub async fn shutdown(&self) {
        let active = self.active.lock().await.take();
        if let Some(handle) = active {
            handle.cancel();
            match handle.wait().await {
                Ok(outcome) => info!("Pattern stopped: {:?}", outcome),
                Err(e) => error!("Pattern ended with error: {}", e),
            }
        }
        self.sequencer.shutdown();
    }
}

pub async fn handle_stream(control: &Control, mut stream: UnixStream) -> Result<()> {
    info!("New connection: {:?}", stream);
    let mut msg = vec![0; 1024];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = stream.read(&mut msg).await?;
        if n == 0 {
            if !pending.is_empty() {
                warn!("Dropping {} bytes of an unfinished request", pending.len());
            }
            info!("Connection closed");
            break;
        }
        debug!("Read {} bytes", n);
        pending.extend_from_slice(&msg[..n]);

        let mut requests = Vec::new();
        let mut undecodable = None;
        let mut consumed = 0;
        {
            let mut decoder =
                serde_json::Deserializer::from_slice(&pending).into_iter::<ControlRequest>();
            loop {
                match decoder.next() {
                    Some(Ok(request)) => {
                        requests.push(request);
                        consumed = decoder.byte_offset();
                    }
                    // The rest of the value has not arrived yet.
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        undecodable = Some(e);
                        break;
                    }
                    None => {
                        consumed = pending.len();
                        break;
                    }
                }
            }
        }

        let mut responses = Vec::with_capacity(requests.len() + 1);
        for request in requests {
            debug!("Request: {:?}", request);
            responses.push(control.handle_request(request).await);
        }
        if let Some(e) = undecodable {
            warn!("Error decoding message: {}", e);
            responses.push(ControlResponse::decode_error(e.to_string()));
            // Nothing after a syntax error can be resynchronised.
            pending.clear();
        } else if pending.len() - consumed > MAX_PENDING {
            warn!("Request exceeds {} bytes", MAX_PENDING);
            responses.push(ControlResponse::decode_error(format!(
                "request exceeds {} bytes",
                MAX_PENDING
            )));
            pending.clear();
        } else {
            pending.drain(..consumed);
        }

        for response in responses {
            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            debug!("Response: {:?}", response);
            stream.write_all(&encoded).await?;
        }
    }
    Ok(())
}
