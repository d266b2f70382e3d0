//! A tiny HTTP proxy that only speaks CONNECT.
//!
//! Every accepted connection must open with `CONNECT host:port`; the proxy
//! answers 200 and then plays the origin itself, replying to the tunnelled
//! request with a fixed body. Request lines are recorded in arrival order.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::socket_guard::should_skip_socket_bound_test;

pub struct ConnectProxy {
    addr: String,
    lines: Arc<Mutex<Vec<String>>>,
    accept_loop: JoinHandle<()>,
}

impl ConnectProxy {
    /// Starts the proxy, or returns `None` where localhost sockets are unavailable.
    pub async fn start_or_skip(body: &'static str) -> Option<Self> {
        if should_skip_socket_bound_test() {
            return None;
        }
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind connect proxy");
        let addr = listener.local_addr().expect("local addr").to_string();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, body, Arc::clone(&sink)));
            }
        });
        Some(Self {
            addr,
            lines,
            accept_loop,
        })
    }

    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Request lines seen so far: CONNECT lines and tunnelled request lines.
    pub fn request_lines(&self) -> Vec<String> {
        self.lines.lock().expect("lines lock").clone()
    }
}

impl Drop for ConnectProxy {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    String::from_utf8(head).ok()
}

fn first_line(head: &str) -> String {
    head.lines().next().unwrap_or_default().to_string()
}

async fn serve(mut stream: TcpStream, body: &'static str, lines: Arc<Mutex<Vec<String>>>) {
    let Some(connect) = read_head(&mut stream).await else {
        return;
    };
    let line = first_line(&connect);
    let is_connect = line.starts_with("CONNECT ");
    lines.lock().expect("lines lock").push(line);
    if !is_connect {
        let _ = stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\n\r\n")
            .await;
        return;
    }
    if stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }

    let Some(request) = read_head(&mut stream).await else {
        return;
    };
    lines.lock().expect("lines lock").push(first_line(&request));
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
}
