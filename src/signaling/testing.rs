//! Test-Hilfen: minimaler STOMP-Server auf einem lokalen Port

use super::stomp::{StompCommand, StompFrame};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(2);

/// Was der Server von einem Client beobachtet
pub(crate) enum ServerEvent {
    Frame(StompFrame),
    Closed,
}

/// Beantwortet CONNECT mit CONNECTED und meldet alle weiteren Frames
pub(crate) struct StompServer {
    addr: SocketAddr,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl StompServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, tx.clone()));
            }
        });

        Self { addr, events }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Nächster Frame nach dem Handshake (CONNECT wird übersprungen)
    pub async fn next_frame(&mut self) -> StompFrame {
        loop {
            match tokio::time::timeout(WAIT, self.events.recv()).await {
                Ok(Some(ServerEvent::Frame(frame))) => {
                    if frame.command != StompCommand::Connect {
                        return frame;
                    }
                }
                Ok(Some(ServerEvent::Closed)) => panic!("connection closed while waiting"),
                Ok(None) | Err(_) => panic!("no frame received"),
            }
        }
    }

    /// Wartet bis der Client die Verbindung geschlossen hat
    pub async fn wait_closed(&mut self) {
        loop {
            match tokio::time::timeout(WAIT, self.events.recv()).await {
                Ok(Some(ServerEvent::Closed)) => return,
                Ok(Some(ServerEvent::Frame(_))) => {}
                Ok(None) | Err(_) => panic!("connection still open"),
            }
        }
    }
}

async fn serve(stream: TcpStream, events: mpsc::UnboundedSender<ServerEvent>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    while let Some(msg) = ws.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(Some(frame)) = StompFrame::parse(&text) else {
            continue;
        };
        if frame.command == StompCommand::Connect {
            let connected = "CONNECTED\nversion:1.2\n\n\0".to_string();
            if ws.send(Message::Text(connected)).await.is_err() {
                break;
            }
        }
        let _ = events.send(ServerEvent::Frame(frame));
    }

    let _ = events.send(ServerEvent::Closed);
}
