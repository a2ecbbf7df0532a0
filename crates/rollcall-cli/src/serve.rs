//! Newline-delimited JSON front end.
//!
//! Each stdin line is one request; each stdout line is one [`Response`],
//! tagged with the request's `id` when one was given. Requests run
//! concurrently, so replies may arrive out of order. At most
//! [`EngineHandle::capacity`] requests are in flight; further input is not
//! read until one finishes.

use crate::engine::EngineHandle;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rollcall_core::{Attributes, EnrollRequest, OutcomeKind, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServeRequest {
    Enroll {
        #[serde(default)]
        code: String,
        name: Option<String>,
        course: Option<String>,
        branch: Option<String>,
        image_base64: Option<String>,
        image_path: Option<PathBuf>,
    },
    Recognize {
        image_base64: Option<String>,
        image_path: Option<PathBuf>,
    },
    Remove {
        code: String,
    },
}

#[derive(Debug, Serialize)]
struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(flatten)]
    response: Response,
}

fn invalid(message: impl Into<String>) -> Response {
    Response::with_outcome(OutcomeKind::InvalidRequest, message)
}

/// Split a request line into its echo id and the typed request.
fn parse_line(line: &str) -> (Option<Value>, Result<ServeRequest, Response>) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return (None, Err(invalid(format!("malformed JSON: {e}")))),
    };
    let id = value.get("id").cloned();
    let request = serde_json::from_value(value).map_err(|e| invalid(format!("bad request: {e}")));
    (id, request)
}

async fn load_image(
    image_base64: Option<String>,
    image_path: Option<PathBuf>,
) -> Result<Option<Vec<u8>>, Response> {
    match (image_base64, image_path) {
        (Some(_), Some(_)) => Err(invalid("give image_base64 or image_path, not both")),
        (Some(encoded), None) => STANDARD
            .decode(encoded.trim())
            .map(Some)
            .map_err(|e| invalid(format!("image_base64: {e}"))),
        (None, Some(path)) => tokio::fs::read(&path)
            .await
            .map(Some)
            .map_err(|e| invalid(format!("{}: {e}", path.display()))),
        (None, None) => Ok(None),
    }
}

async fn handle(engine: &EngineHandle, request: ServeRequest) -> Response {
    match request {
        ServeRequest::Enroll { code, name, course, branch, image_base64, image_path } => {
            let image = match load_image(image_base64, image_path).await {
                Ok(image) => image,
                Err(resp) => return resp,
            };
            let request = EnrollRequest {
                code,
                attributes: Attributes { display_name: name, course, branch },
                image,
            };
            match engine.enroll(request).await {
                Ok(outcome) => Response::from_enrollment(&outcome),
                Err(e) => e.to_response(),
            }
        }
        ServeRequest::Recognize { image_base64, image_path } => {
            let image = match load_image(image_base64, image_path).await {
                Ok(Some(image)) => image,
                Ok(None) => return invalid("recognize needs image_base64 or image_path"),
                Err(resp) => return resp,
            };
            match engine.recognize(image).await {
                Ok(recognition) => Response::from_recognition(&recognition),
                Err(e) => e.to_response(),
            }
        }
        ServeRequest::Remove { code } => match engine.remove(code.clone()).await {
            Ok(0) => Response::with_outcome(OutcomeKind::NotFound, format!("no identity {code}")),
            Ok(_) => Response::removed(&code),
            Err(e) => e.to_response(),
        },
    }
}

/// Answer one request line.
async fn reply_to(engine: &EngineHandle, line: &str) -> Reply {
    let (id, request) = parse_line(line);
    let response = match request {
        Ok(request) => handle(engine, request).await,
        Err(resp) => resp,
    };
    tracing::debug!(outcome = ?response.outcome, "request served");
    Reply { id, response }
}

/// Serve requests from stdin until EOF.
pub async fn run(engine: EngineHandle) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    serve(engine, stdin, tokio::io::stdout()).await?;
    Ok(())
}

/// Serve every line of `input`, writing one reply line per request to `output`.
///
/// Returns the writer once all replies are flushed.
async fn serve<R, W>(engine: EngineHandle, input: R, mut output: W) -> anyhow::Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let in_flight = Arc::new(Semaphore::new(engine.capacity()));

    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(output)
    });

    let mut lines = input.lines();
    let mut served = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        served += 1;
        let permit = in_flight.clone().acquire_owned().await?;
        let engine = engine.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let reply = reply_to(&engine, &line).await;
            match serde_json::to_string(&reply) {
                Ok(json) => {
                    let _ = out_tx.send(json).await;
                }
                Err(e) => tracing::error!(error = %e, "failed to serialise reply"),
            }
            drop(permit);
        });
    }

    drop(out_tx);
    let output = writer.await??;
    tracing::info!(requests = served, "input closed; serve finished");
    Ok(output)
}
