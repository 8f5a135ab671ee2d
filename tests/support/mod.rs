//! In-process broker for integration tests: speaks just enough of the wire
//! protocol to open sessions, answer subscriptions, and echo requests.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Value};
use tether::{Command, Frame, FrameAccumulator};

pub enum ServerMode {
    /// Answer every request with a `"result": "ok"` response.
    Echo,
    /// Open the session but never answer requests.
    Silent,
    /// Echo requests and push one notification right after the
    /// subscription receipt.
    EchoWithPush { method: String, params: Value },
    /// Open the session, then drop the socket.
    DropAfterSubscribe,
}

pub struct MockServer {
    pub port: u16,
    _handle: JoinHandle<()>,
}

impl MockServer {
    pub fn spawn(mode: ServerMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let handle = std::thread::Builder::new()
            .name("mock-broker".into())
            .spawn(move || serve(&listener, &mode))
            .expect("spawn mock server");
        MockServer {
            port,
            _handle: handle,
        }
    }
}

fn serve(listener: &TcpListener, mode: &ServerMode) {
    let Ok((mut sock, _)) = listener.accept() else {
        return;
    };
    let _ = sock.set_read_timeout(Some(Duration::from_secs(30)));
    let mut acc = FrameAccumulator::new();
    let mut buf = [0u8; 4096];
    loop {
        match sock.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => acc.push(&buf[..n]),
            Err(_) => return,
        }
        while let Ok(Some(frame)) = acc.next_frame() {
            if !handle_frame(&mut sock, mode, &frame) {
                return;
            }
        }
    }
}

/// Returns `false` when the server should drop the connection.
fn handle_frame(sock: &mut TcpStream, mode: &ServerMode, frame: &Frame) -> bool {
    match frame.command {
        Command::Connect => {
            let connected = Frame::new(Command::Connected)
                .with_header("version", "1.2")
                .with_header("heart-beat", "0,0");
            write_frame(sock, &connected);
        }
        Command::Subscribe => {
            if let Some(receipt) = frame.headers.get("receipt") {
                let receipt_frame =
                    Frame::new(Command::Receipt).with_header("receipt-id", receipt);
                write_frame(sock, &receipt_frame);
            }
            match mode {
                ServerMode::EchoWithPush { method, params } => {
                    let body = json!({
                        "jsonrpc": "2.0",
                        "method": method,
                        "params": params,
                    });
                    push_message(sock, frame, &body);
                }
                ServerMode::DropAfterSubscribe => return false,
                _ => {}
            }
        }
        Command::Send => {
            if matches!(mode, ServerMode::Echo | ServerMode::EchoWithPush { .. }) {
                let request: Value =
                    serde_json::from_slice(&frame.body).expect("request body is json");
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": "ok",
                });
                push_message(sock, frame, &body);
            }
        }
        _ => {}
    }
    true
}

fn push_message(sock: &mut TcpStream, inbound: &Frame, body: &Value) {
    let destination = inbound
        .headers
        .get("reply-to")
        .or_else(|| inbound.headers.get("destination"))
        .unwrap_or("queue.responses")
        .to_owned();
    let message = Frame::new(Command::Message)
        .with_header("destination", destination)
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_vec(body).expect("serialize body"));
    write_frame(sock, &message);
}

fn write_frame(sock: &mut TcpStream, frame: &Frame) {
    sock.write_all(&frame.encode()).expect("write frame");
}
