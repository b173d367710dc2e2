//! Agent socket: the only channel across the sandbox boundary.
//!
//! One Unix socket per session. Each line the agent writes is a JSON
//! [`ToolCallRequest`]; each line written back is an [`AgentResponse`].
//! Connections are served concurrently, requests on one connection in order.
//! A line longer than `max_request_bytes` gets one `invalid_request` reply
//! and the connection is closed.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::error::{ErrorKind, MediatorError};
use crate::mediator::Mediator;
use crate::request::{ToolCallRequest, ToolCallResult};

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    Result(ToolCallResult),
    Error { kind: ErrorKind, message: String },
}

impl From<MediatorError> for AgentResponse {
    fn from(error: MediatorError) -> Self {
        AgentResponse::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Accept agent connections for `session_id` until the listener fails.
pub async fn serve_session(
    listener: UnixListener,
    mediator: Arc<Mediator>,
    session_id: String,
) -> std::io::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let mediator = mediator.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(e) = serve_connection(reader, writer, &mediator, &session_id).await {
                warn!(session_id = %session_id, error = %e, "agent connection failed");
            }
        });
    }
}

/// Serve one connection until EOF or an oversized line.
pub async fn serve_connection<R, W>(
    reader: R,
    mut writer: W,
    mediator: &Mediator,
    session_id: &str,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let max_bytes = mediator.config().max_request_bytes;
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_bytes));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(session_id = %session_id, max_bytes, "request line too long, closing");
                let response: AgentResponse = MediatorError::InvalidRequest(format!(
                    "request line exceeds {max_bytes} bytes"
                ))
                .into();
                write_response(&mut writer, &response).await?;
                return Ok(());
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(mediator, session_id, &line).await;
        write_response(&mut writer, &response).await?;
    }
    debug!(session_id = %session_id, "agent connection closed");
    Ok(())
}

async fn write_response<W>(writer: &mut W, response: &AgentResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = serde_json::to_vec(response)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

async fn handle_line(mediator: &Mediator, session_id: &str, line: &str) -> AgentResponse {
    let request: ToolCallRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return MediatorError::InvalidRequest(format!("malformed request line: {e}")).into()
        }
    };
    match mediator.handle_tool_call(session_id, request).await {
        Ok(result) => AgentResponse::Result(result),
        Err(e) => e.into(),
    }
}
