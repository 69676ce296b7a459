//! Drives a connection through the public API against a scripted analyzer.

use std::time::Duration;

use xrf_link::frame::{FrameReader, write_frame};
use xrf_link::{
    AssayState, Connection, ConnectionConfig, EngineEvent, Frame, ProtocolError, StartupOptions,
};

const PROLOG: &str = r#"<?xml version="1.0" encoding="utf-8"?>"#;

fn config() -> ConnectionConfig {
    let yaml = "host: analyzer.local\nrepeats: 2\nstartup:\n  sync_system_time: false\n";
    ConnectionConfig::from_yaml_str(yaml).expect("valid configuration")
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future).await.expect("timed out")
}

#[tokio::test]
async fn assay_with_repeat_over_duplex() {
    let _ = tracing_subscriber::fmt::try_init();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, mut server_write) = tokio::io::split(server);
    let mut commands = FrameReader::new(server_read);

    let connection = Connection::from_stream(client, &config()).expect("valid configuration");
    let mut events = connection.events();

    // Transmit toggles then the seven session queries
    let expected = StartupOptions { sync_system_time: false, ..StartupOptions::default() }
        .commands(chrono::NaiveDateTime::default())
        .len();
    for _ in 0..expected {
        within(commands.read_frame()).await.expect("startup command");
    }

    let send = |body: &str| Frame::xml(&format!("{}{}", PROLOG, body));
    let login = r#"<Response parameter="Login State" status="success">Yes</Response>"#;
    write_frame(&mut server_write, &send(login)).await.unwrap();
    write_frame(&mut server_write, &send(r#"<Status parameter="Armed">Yes</Status>"#)).await.unwrap();
    within(connection.wait_for_session(|s| s.is_logged_in && s.is_armed)).await.unwrap();

    within(connection.start_assay()).await.unwrap();
    let start = within(commands.read_frame()).await.unwrap();
    assert!(String::from_utf8_lossy(&start.payload).ends_with("<Command>Assay Start</Command>"));

    for _ in 0..2 {
        write_frame(&mut server_write, &send(r#"<Status parameter="Assay">Start</Status>"#)).await.unwrap();
        write_frame(&mut server_write, &send(r#"<Status parameter="Assay">Complete</Status>"#)).await.unwrap();
    }

    // One client-issued repeat
    let repeat = within(commands.read_frame()).await.unwrap();
    assert!(String::from_utf8_lossy(&repeat.payload).ends_with("<Command>Assay Start</Command>"));

    let mut indices = Vec::new();
    while indices.len() < 2 {
        if let EngineEvent::AssayCompleted(assay) = within(events.recv()).await.unwrap() {
            assert!(!assay.has_results());
            indices.push(assay.sequence_index);
        }
    }
    assert_eq!(indices, vec![1, 2]);
    assert_eq!(connection.session().assay_state, AssayState::Idle);

    connection.close();
    assert!(matches!(connection.stop_assay().await, Err(ProtocolError::Closed)));
}
