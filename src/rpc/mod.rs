//! Line-delimited JSON RPC.
//!
//! Each request is one JSON object on its own line, answered by exactly one
//! response line:
//!
//! ```text
//! -> {"method":"modelCount"}
//! <- {"ok":1}
//! -> {"method":"getModel","params":{"id":7}}
//! <- {"ok":null}
//! -> {"method":"sendTransaction","params":{"tx":{..},"signer":"..","signature":".."}}
//! <- {"error":{"kind":"AlreadySold","message":"model 1 already sold"}}
//! ```
//!
//! The server keeps one [`Host`] behind a mutex, so mutating calls from all
//! connections are applied one at a time in lock order. A transaction is
//! acknowledged only after the state file holds it.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    address::Address,
    host::{Host, Receipt, SignedTransaction},
    ledger::Amount,
    market::{Model, ModelId},
    store::StateStore,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Request {
    Health,
    ModelCount,
    GetModel { id: ModelId },
    ListModels,
    BalanceOf { address: Address },
    NonceOf { address: Address },
    SendTransaction(SignedTransaction),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(Value),
    Error(ErrorBody),
}

impl Response {
    fn error(kind: &str, message: impl ToString) -> Self {
        Response::Error(ErrorBody {
            kind: kind.to_string(),
            message: message.to_string(),
        })
    }

    fn encode<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Response::Ok(v),
            Err(err) => Response::error("Internal", err),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("cannot reach {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("rpc i/o: {0}")]
    Io(#[from] io::Error),
    #[error("malformed rpc message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("connection closed before a response arrived")]
    Closed,
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },
}

/// Result of one request against the host.
pub struct Outcome {
    pub response: Response,
    /// A transaction was applied; the state must be persisted.
    pub committed: bool,
}

pub fn dispatch(host: &mut Host, request: Request) -> Outcome {
    let mut committed = false;
    let response = match request {
        Request::Health => Response::Ok(json!({
            "status": "ok",
            "height": host.height(),
            "modelCount": host.model_count(),
        })),
        Request::ModelCount => Response::encode(host.model_count()),
        Request::GetModel { id } => Response::encode(host.get_model(id)),
        Request::ListModels => Response::encode(host.models().collect::<Vec<_>>()),
        Request::BalanceOf { address } => Response::encode(host.balance_of(&address)),
        Request::NonceOf { address } => Response::encode(host.nonce_of(&address)),
        Request::SendTransaction(signed) => match host.execute(&signed) {
            Ok(receipt) => {
                committed = true;
                Response::encode(receipt)
            }
            Err(err) => Response::error(err.kind(), &err),
        },
    };
    Outcome {
        response,
        committed,
    }
}

pub fn handle_line(host: &mut Host, line: &str) -> Outcome {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => dispatch(host, request),
        Err(err) => Outcome {
            response: Response::error("BadRequest", err),
            committed: false,
        },
    }
}

/// Like [`handle_line`], but a commit is saved before it is acknowledged.
/// If the save fails the host goes back to its prior state and the caller
/// gets `PersistFailed`.
pub fn handle_line_persisted(host: &mut Host, store: Option<&StateStore>, line: &str) -> Response {
    let Some(store) = store else {
        return handle_line(host, line).response;
    };
    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(err) => return Response::error("BadRequest", err),
    };
    let checkpoint = match request {
        Request::SendTransaction(_) => Some(host.state().clone()),
        _ => None,
    };
    let outcome = dispatch(host, request);
    if outcome.committed {
        if let Err(err) = store.save(host.state()) {
            error!(%err, "commit could not be persisted, rolling back");
            if let Some(state) = checkpoint {
                host.restore(state);
            }
            return Response::error("PersistFailed", &err);
        }
    }
    outcome.response
}

//==================== server ====================//

/// Per-connection bounds.
#[derive(Clone, Copy, Debug)]
pub struct ServerLimits {
    /// A connection with no complete request within this long is closed.
    pub idle_timeout: Duration,
    /// Longest accepted request line, newline included.
    pub max_line_bytes: u64,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_line_bytes: 1 << 20,
        }
    }
}

/// Accepts connections forever, one thread per connection.
pub fn serve(
    listener: TcpListener,
    host: Arc<Mutex<Host>>,
    store: Option<StateStore>,
    limits: ServerLimits,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "rpc listening");
    for conn in listener.incoming() {
        let stream = match conn {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let host = Arc::clone(&host);
        let store = store.clone();
        thread::spawn(move || {
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into());
            debug!(%peer, "connection opened");
            match handle_connection(stream, &host, store.as_ref(), limits) {
                Ok(()) => debug!(%peer, "connection closed"),
                Err(err) => debug!(%peer, %err, "connection dropped"),
            }
        });
    }
    Ok(())
}

fn handle_connection(
    stream: TcpStream,
    host: &Mutex<Host>,
    store: Option<&StateStore>,
    limits: ServerLimits,
) -> io::Result<()> {
    stream.set_read_timeout(Some(limits.idle_timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();
    loop {
        line.clear();
        let read = (&mut reader)
            .take(limits.max_line_bytes)
            .read_line(&mut line)?;
        if read == 0 {
            return Ok(());
        }
        if !line.ends_with('\n') && read as u64 >= limits.max_line_bytes {
            let response = Response::error(
                "BadRequest",
                format!("request line exceeds {} bytes", limits.max_line_bytes),
            );
            write_frame(&mut writer, &response)?;
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let response = {
            let mut guard = host.lock().unwrap_or_else(PoisonError::into_inner);
            handle_line_persisted(&mut guard, store, line.trim_end())
        };
        write_frame(&mut writer, &response)?;
    }
}

fn write_frame(writer: &mut TcpStream, response: &Response) -> io::Result<()> {
    let mut frame = serde_json::to_vec(response)?;
    frame.push(b'\n');
    writer.write_all(&frame)?;
    writer.flush()
}

//==================== client ====================//

#[derive(Clone, Debug)]
pub struct RpcClient {
    addr: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn call(&self, request: &Request) -> Result<Value, RpcError> {
        let stream = TcpStream::connect(&self.addr).map_err(|source| RpcError::Connect {
            addr: self.addr.clone(),
            source,
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');
        (&stream).write_all(&frame)?;

        let mut reader = BufReader::new(&stream);
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(RpcError::Closed);
        }
        match serde_json::from_str::<Response>(&line)? {
            Response::Ok(value) => Ok(value),
            Response::Error(body) => Err(RpcError::Remote {
                kind: body.kind,
                message: body.message,
            }),
        }
    }

    pub fn health(&self) -> Result<Value, RpcError> {
        self.call(&Request::Health)
    }

    pub fn model_count(&self) -> Result<u64, RpcError> {
        Ok(serde_json::from_value(self.call(&Request::ModelCount)?)?)
    }

    pub fn get_model(&self, id: ModelId) -> Result<Option<Model>, RpcError> {
        Ok(serde_json::from_value(self.call(&Request::GetModel { id })?)?)
    }

    pub fn list_models(&self) -> Result<Vec<Model>, RpcError> {
        Ok(serde_json::from_value(self.call(&Request::ListModels)?)?)
    }

    pub fn balance_of(&self, address: Address) -> Result<Amount, RpcError> {
        Ok(serde_json::from_value(
            self.call(&Request::BalanceOf { address })?,
        )?)
    }

    pub fn nonce_of(&self, address: Address) -> Result<u64, RpcError> {
        Ok(serde_json::from_value(self.call(&Request::NonceOf { address })?)?)
    }

    pub fn send_transaction(&self, signed: SignedTransaction) -> Result<Receipt, RpcError> {
        Ok(serde_json::from_value(
            self.call(&Request::SendTransaction(signed))?,
        )?)
    }
}
