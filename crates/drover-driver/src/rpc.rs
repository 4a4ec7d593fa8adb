//! Master ↔ agent coordination surface.
//!
//! Both directions are expressed as handle traits with an in-process
//! implementation and a TCP client. The wire protocol is line-delimited
//! JSON with one connection per call: connect, write the request line,
//! read the response line, close. Agents call two methods on the master
//! (`current_time_millis`, `abort_run`); the master calls four on each
//! agent (`configure`, `start`, `stop_all`, `get_results`).

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use drover_error::{DroverError, Result};
use drover_types::RunInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::metrics::Metrics;

/// What agents may ask of the master.
pub trait MasterHandle: Send + Sync {
    /// The master's clock, for offset estimation.
    fn current_time_millis(&self) -> Result<i64>;
    /// Terminate the run immediately.
    fn abort_run(&self) -> Result<()>;
}

/// What the master may ask of an agent.
pub trait AgentHandle: Send + Sync {
    fn agent_id(&self) -> &str;
    fn configure(&self, run_info: &RunInfo) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn stop_all(&self) -> Result<()>;
    fn get_results(&self) -> Result<Vec<Metrics>>;
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MasterRequest {
    CurrentTimeMillis,
    AbortRun,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MasterResponse {
    Time { ms: i64 },
    Ok,
    Error { detail: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentRequest {
    Configure { run_info: Box<RunInfo> },
    Start,
    StopAll,
    GetResults,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentResponse {
    Ok,
    Results { metrics: Vec<Metrics> },
    Error { detail: String },
}

/// One round trip: connect, send the request line, read the response.
fn call<Req, Resp>(addr: &str, request: &Req) -> std::io::Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(None)?;
    let mut writer = &stream;
    let mut line = serde_json::to_string(request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    let mut reader = BufReader::new(&stream);
    let mut response = String::new();
    reader.read_line(&mut response)?;
    serde_json::from_str(response.trim())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

// ---------------------------------------------------------------------------
// TCP client handles
// ---------------------------------------------------------------------------

/// Master handle speaking the wire protocol.
pub struct RemoteMaster {
    addr: String,
}

impl RemoteMaster {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    fn call(&self, request: &MasterRequest) -> Result<MasterResponse> {
        call(&self.addr, request).map_err(|e| DroverError::MasterUnreachable {
            detail: e.to_string(),
        })
    }
}

impl MasterHandle for RemoteMaster {
    fn current_time_millis(&self) -> Result<i64> {
        match self.call(&MasterRequest::CurrentTimeMillis)? {
            MasterResponse::Time { ms } => Ok(ms),
            MasterResponse::Error { detail } => Err(DroverError::protocol(detail)),
            MasterResponse::Ok => Err(DroverError::protocol("expected a time response")),
        }
    }

    fn abort_run(&self) -> Result<()> {
        match self.call(&MasterRequest::AbortRun)? {
            MasterResponse::Ok | MasterResponse::Time { .. } => Ok(()),
            MasterResponse::Error { detail } => Err(DroverError::protocol(detail)),
        }
    }
}

/// Agent handle speaking the wire protocol. Calls are retried once on a
/// transport error before the failure is surfaced to the master.
pub struct RemoteAgent {
    id: String,
    addr: String,
}

impl RemoteAgent {
    #[must_use]
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }

    fn call(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let first = call(&self.addr, request);
        let outcome = match first {
            Ok(resp) => Ok(resp),
            Err(error) => {
                warn!(agent = %self.id, %error, "agent call failed; retrying once");
                call(&self.addr, request)
            }
        };
        match outcome {
            Ok(AgentResponse::Error { detail }) => Err(DroverError::protocol(detail)),
            Ok(resp) => Ok(resp),
            Err(e) => Err(DroverError::AgentUnreachable {
                agent: self.id.clone(),
                detail: e.to_string(),
            }),
        }
    }
}

impl AgentHandle for RemoteAgent {
    fn agent_id(&self) -> &str {
        &self.id
    }

    fn configure(&self, run_info: &RunInfo) -> Result<()> {
        self.call(&AgentRequest::Configure {
            run_info: Box::new(run_info.clone()),
        })?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.call(&AgentRequest::Start)?;
        Ok(())
    }

    fn stop_all(&self) -> Result<()> {
        self.call(&AgentRequest::StopAll)?;
        Ok(())
    }

    fn get_results(&self) -> Result<Vec<Metrics>> {
        match self.call(&AgentRequest::GetResults)? {
            AgentResponse::Results { metrics } => Ok(metrics),
            _ => Err(DroverError::protocol("expected a results response")),
        }
    }
}

// ---------------------------------------------------------------------------
// In-process agent handle
// ---------------------------------------------------------------------------

/// Agent handle for single-process deployments and tests.
pub struct LocalAgent {
    agent: Arc<Agent>,
}

impl LocalAgent {
    #[must_use]
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

impl AgentHandle for LocalAgent {
    fn agent_id(&self) -> &str {
        self.agent.label()
    }

    fn configure(&self, run_info: &RunInfo) -> Result<()> {
        self.agent.configure(run_info.clone())
    }

    fn start(&self) -> Result<()> {
        self.agent.start_workers()
    }

    fn stop_all(&self) -> Result<()> {
        self.agent.stop_all();
        Ok(())
    }

    fn get_results(&self) -> Result<Vec<Metrics>> {
        self.agent.collect_metrics()
    }
}

// ---------------------------------------------------------------------------
// Line-protocol server
// ---------------------------------------------------------------------------

/// A running request server; dropped or stopped, it stops accepting.
pub struct ServerHandle {
    addr: String,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The bound address, `host:port`.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop accepting connections and join the accept loop.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop with a throwaway connection.
        let _ = TcpStream::connect(&self.addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve a one-line-request, one-line-response protocol on `listener`.
///
/// Each connection is handled on its own thread: read one request line,
/// dispatch to `handler`, write the response line, close.
pub fn serve<Req, Resp, H>(listener: TcpListener, handler: H) -> Result<ServerHandle>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    H: Fn(Req) -> Resp + Send + Sync + 'static,
{
    let addr = listener.local_addr()?.to_string();
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler = Arc::new(handler);
    let accept_shutdown = Arc::clone(&shutdown);
    let accept_thread = thread::spawn(move || {
        for stream in listener.incoming() {
            if accept_shutdown.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(s) => s,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
            };
            let handler = Arc::clone(&handler);
            thread::spawn(move || {
                if let Err(error) = handle_connection(stream, handler.as_ref()) {
                    debug!(%error, "connection ended with an error");
                }
            });
        }
    });
    Ok(ServerHandle {
        addr,
        shutdown,
        accept_thread: Some(accept_thread),
    })
}

fn handle_connection<Req, Resp, H>(stream: TcpStream, handler: &H) -> std::io::Result<()>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    H: Fn(Req) -> Resp,
{
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    let mut reader = BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        // Shutdown wake-up or a probe; nothing to answer.
        return Ok(());
    }
    let request: Req = serde_json::from_str(line.trim())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let response = handler(request);
    let mut out = serde_json::to_string(&response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    out.push('\n');
    let mut writer = &stream;
    writer.write_all(out.as_bytes())?;
    writer.flush()
}

/// Serve the agent side of the wire protocol on `listener`.
pub fn serve_agent(listener: TcpListener, agent: Arc<Agent>) -> Result<ServerHandle> {
    serve(listener, move |request: AgentRequest| match request {
        AgentRequest::Configure { run_info } => match agent.configure(*run_info) {
            Ok(()) => AgentResponse::Ok,
            Err(e) => AgentResponse::Error {
                detail: e.to_string(),
            },
        },
        AgentRequest::Start => match agent.start_workers() {
            Ok(()) => AgentResponse::Ok,
            Err(e) => AgentResponse::Error {
                detail: e.to_string(),
            },
        },
        AgentRequest::StopAll => {
            agent.stop_all();
            AgentResponse::Ok
        }
        AgentRequest::GetResults => match agent.collect_metrics() {
            Ok(metrics) => AgentResponse::Results { metrics },
            Err(e) => AgentResponse::Error {
                detail: e.to_string(),
            },
        },
    })
}
