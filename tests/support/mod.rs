//! In-process stand-in for the bus daemon: a loopback TCP router that
//! implements topic fan-out and service routing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use busnode::bus::{DispatchExit, DispatchHandle, Node};
use busnode::config::Config;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Router {
    next_conn: usize,
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    node_of: HashMap<String, usize>,
    subscriptions: HashMap<String, Vec<usize>>,
    services: HashMap<String, usize>,
    records: Vec<Value>,
    tasks: Vec<JoinHandle<()>>,
}

impl Router {
    fn send_to(&self, conn: usize, record: &Value) {
        if let Some(tx) = self.clients.get(&conn) {
            let _ = tx.send(format!("{}\n", record));
        }
    }

    fn route(&mut self, conn: usize, record: Value) {
        self.records.push(record.clone());
        let op = record["op"].as_str().unwrap_or_default().to_string();
        match op.as_str() {
            "subscribe" => {
                self.node_of.insert(record["node_id"].as_str().unwrap_or_default().to_string(), conn);
                let subs = self
                    .subscriptions
                    .entry(record["topic"].as_str().unwrap_or_default().to_string())
                    .or_default();
                if !subs.contains(&conn) {
                    subs.push(conn);
                }
            }
            "advertise_service" => {
                self.node_of.insert(record["node_id"].as_str().unwrap_or_default().to_string(), conn);
                self.services
                    .insert(record["service"].as_str().unwrap_or_default().to_string(), conn);
            }
            "publish" => {
                let topic = record["topic"].as_str().unwrap_or_default();
                let message = json!({
                    "op": "message",
                    "topic": topic,
                    "payload": record["payload"],
                    "sender": record["sender"],
                });
                for target in self.subscriptions.get(topic).cloned().unwrap_or_default() {
                    self.send_to(target, &message);
                }
            }
            "call_service" => {
                self.node_of.insert(record["caller_id"].as_str().unwrap_or_default().to_string(), conn);
                if let Some(owner) = record["service"].as_str().and_then(|s| self.services.get(s)) {
                    self.send_to(*owner, &record);
                }
            }
            "service_response" => {
                if let Some(caller) = record["caller_id"].as_str().and_then(|c| self.node_of.get(c)) {
                    self.send_to(*caller, &record);
                }
            }
            _ => {}
        }
    }
}

pub struct FakeDaemon {
    url: String,
    router: Arc<Mutex<Router>>,
    accept: JoinHandle<()>,
}

impl FakeDaemon {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("tcp://{}", listener.local_addr().unwrap());
        let router = Arc::new(Mutex::new(Router::default()));

        let accept_router = router.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                serve(stream, accept_router.clone());
            }
        });
        Self { url, router, accept }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> Config {
        Config::default().with_daemon_url(self.url.clone())
    }

    pub fn records(&self) -> Vec<Value> {
        self.router.lock().unwrap().records.clone()
    }

    /// Poll the record log until `pred` matches one record.
    pub async fn wait_for(&self, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(found) = self.records().into_iter().find(|r| pred(r)) {
                return found;
            }
            assert!(tokio::time::Instant::now() < deadline, "daemon never saw the expected record");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_subscription(&self, topic: &str) {
        self.wait_for(|r| r["op"] == "subscribe" && r["topic"] == topic).await;
    }

    pub async fn wait_for_service(&self, service: &str) {
        self.wait_for(|r| r["op"] == "advertise_service" && r["service"] == service)
            .await;
    }

    /// Drop every client connection, as if the daemon crashed.
    pub fn kill_connections(&self) {
        let mut router = self.router.lock().unwrap();
        for task in router.tasks.drain(..) {
            task.abort();
        }
        router.clients.clear();
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.accept.abort();
        self.kill_connections();
    }
}

fn serve(stream: TcpStream, router: Arc<Mutex<Router>>) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let conn = {
        let mut r = router.lock().unwrap();
        r.next_conn += 1;
        let conn = r.next_conn;
        r.clients.insert(conn, tx);
        conn
    };

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let reader_router = router.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(record) = serde_json::from_str::<Value>(&line) {
                reader_router.lock().unwrap().route(conn, record);
            }
        }
        reader_router.lock().unwrap().clients.remove(&conn);
    });

    let mut r = router.lock().unwrap();
    r.tasks.push(writer);
    r.tasks.push(reader);
}

/// A node connected to `daemon` with its dispatch loop running.
pub struct RunningNode {
    pub node: Node,
    pub handle: DispatchHandle,
    pub dispatch: JoinHandle<DispatchExit>,
}

pub async fn running_node(daemon: &FakeDaemon, node_id: &str) -> RunningNode {
    let node = Node::new(node_id, daemon.config());
    start(node).await
}

/// Connect a node whose registrations were made beforehand and spin it.
pub async fn start(node: Node) -> RunningNode {
    node.connect().await.unwrap();
    let (dispatch, handle) = node.dispatcher().unwrap();
    let dispatch = tokio::spawn(dispatch.run());
    RunningNode {
        node,
        handle,
        dispatch,
    }
}

pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
