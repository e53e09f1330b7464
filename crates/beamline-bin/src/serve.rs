//! JSON-lines control protocol of `beamline serve`.
//!
//! Each stdin line is one [`Command`]; each stdout line is either a bus
//! message or a `{"reply": ...}` object answering a command.

use anyhow::Result;
use beamline_core::{BusMessage, ErrorInfo, MessageBus, RequestId, ScanRequest};
use beamline_scan::{OrderAction, ScanServer};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// One line of client input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Publish a scan request on the bus
    Submit { request: ScanRequest },
    Abort { rid: RequestId },
    Halt { rid: RequestId },
    Pause { queue: String },
    /// Pause once the active scan finishes its current point
    DeferPause { queue: String },
    Resume { queue: String },
    /// Abort the active scan and queue its request again
    Restart { queue: String },
    Lock {
        queue: String,
        id: String,
        #[serde(default)]
        reason: String,
    },
    Unlock { queue: String, id: String },
    Reorder { queue: String, order: Vec<RequestId> },
    Move {
        queue: String,
        rid: RequestId,
        action: OrderAction,
    },
    Clear { queue: String },
    /// Queue snapshot plus its history
    Status { queue: String },
    /// Stop reading input
    Quit,
}

/// Carry out `command`, returning the reply line.
pub async fn execute(server: &ScanServer, command: Command) -> Value {
    let queues = server.queues();
    let result = match command {
        Command::Submit { request } => {
            server
                .engine()
                .bus
                .publish(BusMessage::ScanRequest(request));
            Ok(json!({ "submitted": true }))
        }
        Command::Abort { rid } => queues.abort(&rid).await.map(|s| json!({ "state": s })),
        Command::Halt { rid } => queues.halt(&rid).await.map(|s| json!({ "state": s })),
        Command::Pause { queue } => queues.pause(&queue).map(|_| json!({})),
        Command::DeferPause { queue } => queues.defer_pause(&queue).map(|_| json!({})),
        Command::Resume { queue } => queues.resume(&queue).map(|_| json!({})),
        Command::Restart { queue } => queues.restart(&queue).await.map(|rid| json!({ "rid": rid })),
        Command::Lock { queue, id, reason } => queues.add_lock(&queue, &id, &reason).map(|_| json!({})),
        Command::Unlock { queue, id } => queues.remove_lock(&queue, &id).map(|_| json!({})),
        Command::Reorder { queue, order } => queues.reorder(&queue, order).map(|_| json!({})),
        Command::Move { queue, rid, action } => {
            queues.move_entry(&queue, &rid, action).map(|_| json!({}))
        }
        Command::Clear { queue } => queues.clear(&queue).map(|rids| json!({ "cleared": rids })),
        Command::Status { queue } => Ok(json!({
            "status": queues.snapshot(&queue),
            "history": queues.history(&queue),
        })),
        Command::Quit => Ok(json!({ "quit": true })),
    };
    match result {
        Ok(body) => json!({ "reply": { "ok": true, "result": body } }),
        Err(err) => json!({ "reply": { "ok": false, "error": ErrorInfo::from(&err) } }),
    }
}

/// Parse one input line; blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Result<Command, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Serve stdin until EOF or `quit`, echoing bus traffic on stdout.
pub async fn serve(server: &ScanServer) -> Result<()> {
    let mut rx = server.engine().bus.subscribe();
    let echo = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => match serde_json::to_string(&message) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(error = %err, "unserializable bus message"),
                },
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "stdout echo lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let listener = server.spawn_request_listener();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            None => continue,
            Some(Ok(command)) => command,
            Some(Err(err)) => {
                println!("{}", json!({ "reply": { "ok": false, "error": err.to_string() } }));
                continue;
            }
        };
        debug!(?command, "command received");
        let quit = command == Command::Quit;
        println!("{}", execute(server, command).await);
        if quit {
            break;
        }
    }

    server.shutdown().await;
    let _ = listener.await;
    echo.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_core::{EngineConfig, EntryState, LocalBus};
    use beamline_hardware::create_sim_registry;
    use std::sync::Arc;

    #[test]
    fn parses_commands() {
        let command = parse_line(
            r#"{"command":"move","queue":"primary","rid":"abc","action":{"action":"move_to","index":2}}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(
            command,
            Command::Move { action: OrderAction::MoveTo(2), .. }
        ));

        let command = parse_line(
            r#"{"command":"submit","request":{"scan_type":"acquire","kwargs":{"num_points":2}}}"#,
        )
        .unwrap()
        .unwrap();
        match command {
            Command::Submit { request } => {
                assert_eq!(request.scan_type, "acquire");
                assert_eq!(request.queue, "primary");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            parse_line(r#"{"command":"defer_pause","queue":"primary"}"#)
                .unwrap()
                .unwrap(),
            Command::DeferPause { queue: "primary".into() }
        );

        assert!(parse_line("   ").is_none());
        assert!(parse_line(r#"{"command":"launch"}"#).unwrap().is_err());
    }

    #[tokio::test]
    async fn replies_report_errors() {
        let server = ScanServer::new(
            Arc::new(create_sim_registry().unwrap()),
            Arc::new(LocalBus::new(256)),
            EngineConfig::default(),
        );
        server.start().unwrap();

        let reply = execute(&server, Command::Pause { queue: "nowhere".into() }).await;
        assert_eq!(reply["reply"]["ok"], json!(false));
        assert_eq!(reply["reply"]["error"]["kind"], json!("invalid_request"));

        let reply = execute(&server, Command::Lock {
            queue: "primary".into(),
            id: "hutch".into(),
            reason: "door open".into(),
        })
        .await;
        assert_eq!(reply["reply"]["ok"], json!(true));
        let reply = execute(&server, Command::Status { queue: "primary".into() }).await;
        assert_eq!(reply["reply"]["result"]["status"]["state"], json!("locked"));

        let reply = execute(&server, Command::Restart { queue: "primary".into() }).await;
        assert_eq!(reply["reply"]["ok"], json!(true));
        assert_eq!(reply["reply"]["result"]["rid"], Value::Null);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn submitted_requests_run_through_the_bus() {
        let server = ScanServer::new(
            Arc::new(create_sim_registry().unwrap()),
            Arc::new(LocalBus::new(256)),
            EngineConfig::default(),
        );
        server.start().unwrap();
        let listener = server.spawn_request_listener();
        let mut rx = server.engine().bus.subscribe();

        let request = ScanRequest::new("acquire").kwarg("num_points", 2);
        execute(&server, Command::Submit { request }).await;

        let rid = loop {
            if let BusMessage::RequestResponse(r) = rx.recv().await.unwrap() {
                assert!(r.accepted);
                break r.rid.unwrap();
            }
        };
        assert_eq!(
            server.queues().wait_for(&rid).await.unwrap(),
            EntryState::Completed
        );
        server.shutdown().await;
        listener.await.unwrap();
    }
}
