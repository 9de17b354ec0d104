//! Unix domain socket IPC listener.
//!
//! Listens on the socket path and dispatches JSON-RPC-lite messages to the
//! [`TapeEngine`]. Each connection is served by its own task; requests on one
//! connection are answered in order.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::PROTOCOL_VERSION;
use crate::engine::TapeEngine;
use crate::protocol::*;

/// Bind the listener at `path`, replacing a stale socket file.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    tracing::info!("Tape service listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until `shutdown` flips to `true` (or its sender drops).
pub async fn serve(
    engine: Arc<TapeEngine>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(engine, stream).await {
                            tracing::warn!("Connection error: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {e}");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("Tape service stopped accepting connections");
    Ok(())
}

async fn handle_connection(engine: Arc<TapeEngine>, stream: UnixStream) -> std::io::Result<()> {
    let open = engine.connection_opened();
    tracing::debug!(connections = open, "Client connected");

    let result = read_requests(&engine, stream).await;

    let open = engine.connection_closed();
    engine.touch().await;
    tracing::debug!(connections = open, "Client disconnected");
    result
}

async fn read_requests(engine: &TapeEngine, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break; // EOF
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = dispatch_message(engine, trimmed).await;
        let mut response_bytes = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        response_bytes.push(b'\n');
        writer.write_all(&response_bytes).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Parse and dispatch a single JSON-RPC message.
pub async fn dispatch_message(engine: &TapeEngine, raw: &str) -> Value {
    let request: RpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => {
            return serde_json::to_value(RpcError {
                id: RequestId::Integer(0),
                error: RpcFailure::new(ERR_INVALID_REQUEST, format!("Invalid JSON-RPC: {e}"))
                    .into_body(),
            })
            .unwrap_or_default();
        }
    };

    let id = request.id.clone();
    match dispatch_method(engine, &request.method, request.params).await {
        Ok(result) => serde_json::to_value(RpcResponse { id, result }).unwrap_or_default(),
        Err(failure) => {
            tracing::debug!(
                method = %request.method,
                code = failure.code,
                "Request failed: {}",
                failure.message
            );
            serde_json::to_value(RpcError {
                id,
                error: failure.into_body(),
            })
            .unwrap_or_default()
        }
    }
}

type HandlerResult = Result<Value, RpcFailure>;

async fn dispatch_method(engine: &TapeEngine, method: &str, params: Option<Value>) -> HandlerResult {
    match method {
        "hello" => handle_hello(params),
        "tape.create" => handle_create(engine, params).await,
        "tape.resolve" => handle_resolve(engine, params).await,
        "tape.rename" => handle_rename(engine, params).await,
        "tape.append" => handle_append(engine, params).await,
        "tape.read" => handle_read(engine, params).await,
        "tape.handoff" => handle_handoff(engine, params).await,
        "tape.anchors" => handle_anchors(engine, params).await,
        "tape.anchor" => handle_anchor(engine, params).await,
        "tape.context" => handle_context(engine, params).await,
        "tape.fork" => handle_fork(engine, params).await,
        "tape.reset" => handle_reset(engine, params).await,
        "tape.search" => handle_search(engine, params).await,
        "tape.info" => handle_info(engine, params).await,
        "tape.list" => handle_list(engine, params).await,
        "tape.aliases" => handle_aliases(engine, params).await,
        "service.status" => handle_service_status(engine).await,
        "service.doctor" => handle_service_doctor(engine, params).await,
        _ => Err(RpcFailure::new(
            ERR_METHOD_NOT_FOUND,
            format!("Unknown method: {method}"),
        )),
    }
}

/// Missing params parse like `{}`, so methods whose fields all default need none.
fn parse_params<T: DeserializeOwned>(method: &str, params: Option<Value>) -> Result<T, RpcFailure> {
    let value = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(value)
        .map_err(|e| RpcFailure::invalid_params(format!("Invalid {method} params: {e}")))
}

fn to_result<T: Serialize>(value: T) -> HandlerResult {
    serde_json::to_value(value)
        .map_err(|e| RpcFailure::new(ERR_INTERNAL, format!("Serialize error: {e}")))
}

/// Handle the `hello` handshake.
fn handle_hello(params: Option<Value>) -> HandlerResult {
    let hello: HelloParams = params
        .ok_or_else(|| RpcFailure::invalid_params("Missing params"))
        .and_then(|v| parse_params("hello", Some(v)))?;

    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(RpcFailure::invalid_params(format!(
            "Incompatible protocol version: client={}, service={}",
            hello.protocol_version, PROTOCOL_VERSION
        )));
    }
    tracing::debug!(client_version = %hello.client_version, "Client handshake");

    to_result(HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: METHODS.iter().map(|m| (*m).to_string()).collect(),
    })
}

async fn handle_create(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: CreateParams = parse_params("tape.create", params)?;
    let tape_id = engine
        .call("tape.create", move |store| {
            store.create_tape(params.name.as_deref())
        })
        .await?;
    to_result(TapeIdResult { tape_id })
}

async fn handle_resolve(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: ResolveParams = parse_params("tape.resolve", params)?;
    let tape_id = engine
        .call("tape.resolve", move |store| store.resolve(&params.name))
        .await?;
    to_result(TapeIdResult { tape_id })
}

async fn handle_rename(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: RenameParams = parse_params("tape.rename", params)?;
    let result = engine
        .call("tape.rename", move |store| {
            let tape_id = store.resolve(&params.tape)?;
            store.rename(tape_id, &params.name)?;
            store.tape_info(tape_id)
        })
        .await?;
    to_result(result)
}

async fn handle_append(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: AppendParams = parse_params("tape.append", params)?;
    let result = engine
        .call("tape.append", move |store| {
            let tape_id = store.resolve(&params.tape)?;
            let seq_no = store.append(tape_id, params.kind, &params.payload, params.meta.as_ref())?;
            Ok(SeqNoResult { tape_id, seq_no })
        })
        .await?;
    to_result(result)
}

async fn handle_read(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: ReadParams = parse_params("tape.read", params)?;
    let result = engine
        .call("tape.read", move |store| {
            let tape_id = store.resolve(&params.tape)?;
            let entries = store.read(tape_id, params.from_seq, params.to_seq)?;
            Ok(EntriesResult { tape_id, entries })
        })
        .await?;
    to_result(result)
}

async fn handle_handoff(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: HandoffParams = parse_params("tape.handoff", params)?;
    let result = engine
        .call("tape.handoff", move |store| {
            let tape_id = store.resolve(&params.tape)?;
            let seq_no = store.handoff(tape_id, &params.name, params.state.as_ref())?;
            Ok(SeqNoResult { tape_id, seq_no })
        })
        .await?;
    to_result(result)
}

async fn handle_anchors(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: AnchorsParams = parse_params("tape.anchors", params)?;
    let result = engine
        .call("tape.anchors", move |store| {
            let tape_id = store.resolve(&params.tape)?;
            let anchors = store.list_anchors(tape_id, params.limit)?;
            Ok(AnchorsResult { tape_id, anchors })
        })
        .await?;
    to_result(result)
}

async fn handle_anchor(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: AnchorParams = parse_params("tape.anchor", params)?;
    let anchor = engine
        .call("tape.anchor", move |store| {
            let tape_id = store.resolve(&params.tape)?;
            store.get_anchor(tape_id, &params.name)
        })
        .await?;
    to_result(anchor)
}

async fn handle_context(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: ContextParams = parse_params("tape.context", params)?;
    let result = engine
        .call("tape.context", move |store| {
            let tape_id = store.resolve(&params.tape)?;
            let entries = match &params.policy {
                Some(policy) => store.context(tape_id, policy)?,
                None => store.default_context(tape_id)?,
            };
            Ok(EntriesResult { tape_id, entries })
        })
        .await?;
    to_result(result)
}

async fn handle_fork(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: ForkParams = parse_params("tape.fork", params)?;
    let result = engine
        .call("tape.fork", move |store| {
            let parent_tape_id = store.resolve(&params.tape)?;
            let tape_id = store.fork(parent_tape_id, &params.name, &params.cutoff)?;
            Ok(ForkResult {
                tape_id,
                parent_tape_id,
                name: params.name,
            })
        })
        .await?;
    to_result(result)
}

async fn handle_reset(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: TapeParams = parse_params("tape.reset", params)?;
    let result = engine
        .call("tape.reset", move |store| {
            let archived_tape_id = store.resolve(&params.tape)?;
            let tape_id = store.reset(archived_tape_id)?;
            Ok(ResetResult {
                archived_tape_id,
                tape_id,
            })
        })
        .await?;
    to_result(result)
}

async fn handle_search(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: SearchParams = parse_params("tape.search", params)?;
    let matches = engine
        .call("tape.search", move |store| {
            store.search(&params.query, &params.options)
        })
        .await?;
    to_result(SearchResult { matches })
}

async fn handle_info(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: TapeParams = parse_params("tape.info", params)?;
    let info = engine
        .call("tape.info", move |store| {
            let tape_id = store.resolve(&params.tape)?;
            store.tape_info(tape_id)
        })
        .await?;
    to_result(info)
}

async fn handle_list(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: ListParams = parse_params("tape.list", params)?;
    let tapes = engine
        .call("tape.list", move |store| {
            store.list_tapes(params.include_archived, params.limit)
        })
        .await?;
    to_result(ListResult { tapes })
}

async fn handle_aliases(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: TapeParams = parse_params("tape.aliases", params)?;
    let result = engine
        .call("tape.aliases", move |store| {
            let tape_id = store.resolve(&params.tape)?;
            let aliases = store.aliases(tape_id)?;
            Ok(AliasesResult { tape_id, aliases })
        })
        .await?;
    to_result(result)
}

async fn handle_service_status(engine: &TapeEngine) -> HandlerResult {
    engine.touch().await;
    to_result(ServiceStatusResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        store_version: tape_store::VERSION.to_string(),
        uptime_s: engine.uptime_s(),
        connections: engine.connection_count(),
        db_path: engine.store().config().db_path.clone(),
    })
}

async fn handle_service_doctor(engine: &TapeEngine, params: Option<Value>) -> HandlerResult {
    let params: DoctorParams = parse_params("service.doctor", params)?;
    let report = engine
        .call("service.doctor", move |store| store.doctor(params.repair))
        .await?;
    to_result(DoctorResult {
        healthy: report.is_healthy(),
        report,
    })
}
