mod common;

use common::{file_profile, line_server, next_event, spawn_session, tcp_profile};
use pgnhub_recorder::StartOptions;
use pgnhub_types::RecordingFormat;
use pgnhub_types::broadcast::events;

fn capture() -> Vec<String> {
    vec![
        "2024-05-01T10:00:00.000Z,2,127250,1,255,8,ff,7f,00,01,02,03,04,fd".into(),
        "10:00:00.120 R 09F80101 10 20 30 40 50 60 70 80".into(),
        "$PCDIN,01F112,00000000,01,FF7F00*55".into(),
        "not a bus line; kept anyway".into(),
        "(1714557600.250000) can0 09F11201#FF7F000102030405".into(),
        "  padded with spaces  ".into(),
    ]
}

#[tokio::test]
async fn passthrough_recording_replays_identically() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let session = spawn_session(dir.path());
    let input = capture();
    let (port, go) = line_server(input.clone()).await;
    session.save_profile(tcp_profile("live", port)).await?;

    let mut sub = session.subscribe();
    session.activate("live").await?;
    next_event(&mut sub, events::NMEA_CONNECTED).await;

    let started = session
        .start_recording(StartOptions::new(RecordingFormat::Passthrough).with_file_name("capture"))
        .await?;
    assert_eq!(started.file_name.as_deref(), Some("capture.raw"));
    let _ = go.send(());

    let mut live = Vec::new();
    while live.len() < input.len() {
        let msg = next_event(&mut sub, events::RAW_OUTPUT).await;
        live.push(msg.data.and_then(|d| d.as_str().map(str::to_string)).unwrap_or_default());
    }
    let stopped = session.stop_recording().await?;
    assert_eq!(stopped.message_count, input.len() as u64);
    assert_eq!(live, input);

    // Replay the file through the file adapter.
    session.deactivate().await?;
    let path = session.recording_path("capture.raw").await?;
    session.save_profile(file_profile("replay", &path)).await?;
    session.activate("replay").await?;
    next_event(&mut sub, events::NMEA_CONNECTED).await;

    let mut replayed = Vec::new();
    loop {
        let msg = tokio::time::timeout(common::WAIT, sub.recv()).await?.expect("hub open");
        match msg.event.as_str() {
            events::RAW_OUTPUT => {
                replayed.push(msg.data.and_then(|d| d.as_str().map(str::to_string)).unwrap_or_default())
            }
            events::NMEA_DISCONNECTED => break,
            _ => {}
        }
    }
    assert_eq!(replayed, input);

    let files = session.recordings().await?;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].format, Some(RecordingFormat::Passthrough));
    assert_eq!(files[0].message_count, input.len() as u64);

    session.shutdown().await?;
    Ok(())
}
