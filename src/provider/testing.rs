//! In-process stand-in for a provider endpoint, used by adapter and session tests.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// What the fake provider sends back.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Text frames sent right after the handshake.
    pub greeting: Vec<String>,
    /// Text frames sent back after every binary (audio) frame.
    pub on_audio: Vec<String>,
    /// Text frames sent after the end-of-stream control message arrives.
    pub on_end_of_stream: Vec<String>,
    /// Keep the connection open after end-of-stream instead of closing it.
    pub hold_open: bool,
}

pub struct FakeProvider {
    pub url: String,
    pub frames: mpsc::UnboundedReceiver<Message>,
    authorization: Arc<Mutex<Option<String>>>,
    accepted: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

fn is_end_of_stream(message: &Message) -> bool {
    match message {
        Message::Text(text) => text.contains("CloseStream") || text.contains("EndOfStream"),
        _ => false,
    }
}

impl FakeProvider {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, frames) = mpsc::unbounded_channel();
        let authorization = Arc::new(Mutex::new(None));
        let accepted = Arc::new(AtomicBool::new(false));

        let auth_slot = authorization.clone();
        let accepted_flag = accepted.clone();
        let task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            accepted_flag.store(true, Ordering::SeqCst);

            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *auth_slot.lock().unwrap() = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                Ok(resp)
            };
            let mut ws = accept_hdr_async(tcp, callback).await.unwrap();

            for text in &script.greeting {
                ws.send(Message::Text(text.clone())).await.unwrap();
            }

            while let Some(Ok(message)) = ws.next().await {
                let end = is_end_of_stream(&message);
                let audio = message.is_binary();
                let _ = tx.send(message);
                if audio {
                    for text in &script.on_audio {
                        let _ = ws.send(Message::Text(text.clone())).await;
                    }
                }
                if end {
                    for text in &script.on_end_of_stream {
                        let _ = ws.send(Message::Text(text.clone())).await;
                    }
                    if !script.hold_open {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }
        });

        Self {
            url: format!("ws://{}/v2", addr),
            frames,
            authorization,
            accepted,
            task,
        }
    }

    pub fn authorization(&self) -> Option<String> {
        self.authorization.lock().unwrap().clone()
    }

    pub fn was_contacted(&self) -> bool {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Frames received so far, up to and including end-of-stream.
    pub async fn frames_until_end(&mut self) -> Vec<Message> {
        let mut received = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_secs(5), self.frames.recv()).await
        {
            let end = is_end_of_stream(&message);
            received.push(message);
            if end {
                break;
            }
        }
        received
    }

    /// Every frame received until the provider connection ended.
    pub async fn all_frames(mut self) -> Vec<Message> {
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.task).await;
        let mut received = Vec::new();
        while let Ok(message) = self.frames.try_recv() {
            received.push(message);
        }
        received
    }
}

impl Drop for FakeProvider {
    fn drop(&mut self) {
        self.task.abort();
    }
}
