//! Playback of a recorded file.
//!
//! Lines are emitted verbatim, so a passthrough recording replays exactly
//! as it was captured. Bytes that are not valid UTF-8 are replaced rather
//! than ending playback. When consecutive lines carry timestamps the gap
//! between them is reproduced, divided by the playback speed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgnhub_types::{HubError, TransportFault};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{EventSink, TransportAdapter, already_used};
use crate::wire::{self, ParsedLine};

/// Longest pause between two lines regardless of recorded gaps.
pub const MAX_PLAYBACK_GAP: Duration = Duration::from_secs(5);

/// Pause before emitting a line stamped `current` after one stamped
/// `previous`. A speed of 0 replays as fast as possible.
pub fn playback_delay(
    previous: Option<DateTime<Utc>>,
    current: Option<DateTime<Utc>>,
    speed: f64,
) -> Option<Duration> {
    if speed <= 0.0 {
        return None;
    }
    let gap = (current? - previous?).to_std().ok()?;
    let scaled = gap.div_f64(speed).min(MAX_PLAYBACK_GAP);
    (!scaled.is_zero()).then_some(scaled)
}

fn timestamp_of(line: &str) -> Option<DateTime<Utc>> {
    match wire::parse_line(line).ok()? {
        ParsedLine::Message(msg) => msg.timestamp,
        ParsedLine::Frame(frame) => frame.timestamp,
    }
}

/// Next line without its terminator, `None` at end of file.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

pub struct FilePlaybackAdapter {
    path: String,
    speed: f64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    sink: Option<EventSink>,
}

impl FilePlaybackAdapter {
    pub fn new(path: String, speed: f64) -> Self {
        Self {
            path,
            speed,
            cancel: CancellationToken::new(),
            task: None,
            sink: None,
        }
    }
}

async fn run(path: String, speed: f64, cancel: CancellationToken, sink: EventSink) {
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(%path, error = %e, "cannot open playback file");
            sink.fail(TransportFault::from_io(&e));
            return;
        }
    };
    info!(%path, speed, "file playback started");
    sink.connected();

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut previous = None;
    let mut count: u64 = 0;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = next_line(&mut reader, &mut buf) => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!(%path, lines = count, "file playback reached end of file");
                break;
            }
            Err(e) => {
                warn!(%path, error = %e, "file playback read failed");
                sink.fail(TransportFault::from_io(&e));
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        if speed > 0.0 {
            let current = timestamp_of(&line);
            if let Some(delay) = playback_delay(previous, current, speed) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if current.is_some() {
                previous = current;
            }
        }
        sink.raw(line);
        count += 1;
    }
    debug!(%path, lines = count, "file playback stopped");
    sink.disconnected();
}

#[async_trait]
impl TransportAdapter for FilePlaybackAdapter {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn connect(&mut self, sink: EventSink) -> Result<(), HubError> {
        if self.sink.is_some() {
            return Err(already_used(self.kind()));
        }
        self.task = Some(tokio::spawn(run(
            self.path.clone(),
            self.speed,
            self.cancel.clone(),
            sink.clone(),
        )));
        self.sink = Some(sink);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(path = %self.path, error = %e, "playback task ended abnormally");
        }
        if let Some(sink) = &self.sink {
            sink.disconnected();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterEvent;
    use chrono::TimeZone;
    use std::io::Write;

    #[test]
    fn delay_scales_and_caps() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let t1 = t0 + chrono::TimeDelta::seconds(2);
        let t2 = t0 + chrono::TimeDelta::seconds(60);
        assert_eq!(playback_delay(Some(t0), Some(t1), 1.0), Some(Duration::from_secs(2)));
        assert_eq!(playback_delay(Some(t0), Some(t1), 4.0), Some(Duration::from_millis(500)));
        assert_eq!(playback_delay(Some(t0), Some(t2), 1.0), Some(MAX_PLAYBACK_GAP));
        assert_eq!(playback_delay(Some(t0), Some(t1), 0.0), None);
        assert_eq!(playback_delay(None, Some(t1), 1.0), None);
        // Timestamps going backwards do not pause.
        assert_eq!(playback_delay(Some(t1), Some(t0), 1.0), None);
    }

    #[tokio::test]
    async fn lines_replay_verbatim_then_disconnect() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        let input = [
            "2024-05-01T10:00:00.000Z,2,127250,1,255,3,ff,7f,00",
            "not a bus line at all",
            "$PCDIN,01F112,00000000,01,FF7F00*55",
        ];
        for line in input {
            writeln!(file, "{line}")?;
        }

        let mut adapter =
            FilePlaybackAdapter::new(file.path().to_string_lossy().into_owned(), 0.0);
        let (sink, mut rx) = EventSink::channel(1);
        adapter.connect(sink).await?;

        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Connected);
        for line in input {
            assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::RawData(line.into()));
        }
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Disconnected);
        adapter.disconnect().await;
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_stop_playback() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"first\r\nbad \xff\xfe byte\nlast")?;

        let mut adapter =
            FilePlaybackAdapter::new(file.path().to_string_lossy().into_owned(), 0.0);
        let (sink, mut rx) = EventSink::channel(1);
        adapter.connect(sink).await?;

        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Connected);
        let expected = ["first", "bad \u{fffd}\u{fffd} byte", "last"];
        for line in expected {
            assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::RawData(line.into()));
        }
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Disconnected);
        adapter.disconnect().await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_reports_enoent() {
        let mut adapter = FilePlaybackAdapter::new("/nonexistent/pgnhub/replay.raw".into(), 1.0);
        let (sink, mut rx) = EventSink::channel(1);
        adapter.connect(sink).await.unwrap();
        let AdapterEvent::Error(fault) = rx.recv().await.unwrap().event else {
            panic!("expected an error");
        };
        assert_eq!(fault.code.as_deref(), Some("ENOENT"));
        assert_eq!(rx.recv().await.unwrap().event, AdapterEvent::Disconnected);
    }
}
