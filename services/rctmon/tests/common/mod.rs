//! In-process fake inverter speaking the RCT protocol over TCP

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};

use rctmon::catalog;
use rctmon::config::Config;
use rctmon::protocol::{Command, DecodeEvent, Frame, RctCodec, Value};

#[derive(Debug, Default)]
struct DeviceState {
    values: HashMap<u32, Value>,
    /// Identifiers whose next request closes the connection instead of answering
    hang_up_on: HashSet<u32>,
    requests: Vec<u32>,
    connections: usize,
}

pub struct FakeDevice {
    addr: SocketAddr,
    state: Arc<Mutex<DeviceState>>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(DeviceState::default()));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                shared.lock().connections += 1;
                tokio::spawn(serve(socket, Arc::clone(&shared)));
            }
        });

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set(&self, oid: u32, value: Value) {
        self.state.lock().values.insert(oid, value);
    }

    pub fn hang_up_on(&self, oid: u32) {
        self.state.lock().hang_up_on.insert(oid);
    }

    pub fn requests(&self) -> Vec<u32> {
        self.state.lock().requests.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Config pointing at this device, metrics on an ephemeral port
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.device.host = self.addr.ip().to_string();
        config.device.port = self.addr.port();
        config.device.request_timeout_ms = 500;
        config.reconnect.initial_delay_ms = 50;
        config.reconnect.max_delay_ms = 200;
        config.reconnect.jitter = false;
        config.prometheus.bind_port = 0;
        config.prometheus.exposition = true;
        config.normalize();
        config
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, state: Arc<Mutex<DeviceState>>) {
    let mut codec = RctCodec::new();
    let mut buffer = BytesMut::with_capacity(256);

    loop {
        match socket.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {},
        }

        while let Ok(Some(event)) = codec.decode(&mut buffer) {
            let DecodeEvent::Frame(frame) = event else {
                continue;
            };
            if frame.command != Command::Read {
                continue;
            }

            let reply = {
                let mut state = state.lock();
                state.requests.push(frame.oid);
                if state.hang_up_on.remove(&frame.oid) {
                    return;
                }
                answer(&state, frame.oid)
            };

            if let Some(reply) = reply {
                let mut out = BytesMut::new();
                codec.encode(reply, &mut out).unwrap();
                if socket.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Configured value, else the catalog kind's zero value; unknown identifiers stay silent
fn answer(state: &DeviceState, oid: u32) -> Option<Frame> {
    let info = catalog::object(oid)?;
    let value = state
        .values
        .get(&oid)
        .cloned()
        .unwrap_or_else(|| info.kind.default_value());
    let data = info.kind.encode(&value)?;
    Some(Frame::response(oid, data))
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub async fn scrape(addr: SocketAddr) -> String {
    reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}
