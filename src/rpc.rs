use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::{IMAGE_SAVED, ImageSaved};
use crate::service::CaptureService;

/// 一行 JSON 请求,例如 `{"id": 1, "command": "open_image", "args": {"path": "/x.png"}}`
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<u64>,
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl ErrorBody {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: "BadRequest".to_string(),
            message: message.into(),
        }
    }
}

/// 写给对端的一行 JSON:
/// 响应 `{"id": 1, "ok": ...}`,失败 `{"id": 1, "error": {"kind": ..., "message": ...}}`,
/// 推送 `{"event": "image-saved", "payload": {...}}`
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Response {
        id: Option<u64>,
        ok: Value,
    },
    Failure {
        id: Option<u64>,
        error: ErrorBody,
    },
    Event {
        event: &'static str,
        payload: ImageSaved,
    },
}

impl Outgoing {
    fn failure(id: Option<u64>, error: ErrorBody) -> Self {
        Outgoing::Failure { id, error }
    }
}

/// 处理一行请求,总是产生一条响应
pub async fn handle_line(service: &CaptureService, line: &str) -> Outgoing {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => handle_request(service, request).await,
        Err(e) => Outgoing::failure(
            None,
            ErrorBody::bad_request(format!("malformed request: {}", e)),
        ),
    }
}

pub async fn handle_request(service: &CaptureService, request: Request) -> Outgoing {
    let id = request.id;
    debug!("RPC request {:?}: {}", id, request.command);

    let result = match request.command.as_str() {
        "get_settings" => to_value(service.get_settings()),
        "get_saved_images" => to_value(service.get_saved_images()),
        "open_image" => match path_arg(request.args) {
            Ok(path) => service.open_image(&path).map(|_| Value::Null).map_err(error_body),
            Err(e) => Err(e),
        },
        "start_monitoring" => service
            .start_monitoring()
            .await
            .map(|_| Value::Null)
            .map_err(error_body),
        "stop_monitoring" => service
            .stop_monitoring()
            .await
            .map(|_| Value::Null)
            .map_err(error_body),
        "set_save_dir" => match path_arg(request.args) {
            Ok(path) => match service.set_save_dir(path).await {
                Ok(settings) => to_value(settings),
                Err(e) => Err(error_body(e)),
            },
            Err(e) => Err(e),
        },
        other => Err(ErrorBody::bad_request(format!("unknown command: {}", other))),
    };

    match result {
        Ok(ok) => Outgoing::Response { id, ok },
        Err(error) => Outgoing::failure(id, error),
    }
}

/// 读请求、写响应,同时把 `image-saved` 事件推给对端,直到输入结束
pub async fn serve<R, W>(
    service: Arc<CaptureService>,
    input: R,
    output: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Outgoing>();
    let writer = tokio::spawn(write_task(output, rx));
    let forwarder = tokio::spawn(forward_events(service.subscribe(), tx.clone()));

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&service, &line).await;
        if tx.send(response).is_err() {
            warn!("RPC writer closed, stopping request loop");
            break;
        }
    }

    info!("RPC input closed");
    forwarder.abort();
    drop(tx);
    writer.await??;
    Ok(())
}

async fn write_task<W>(
    mut output: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}

async fn forward_events(
    mut events: tokio::sync::broadcast::Receiver<ImageSaved>,
    tx: mpsc::UnboundedSender<Outgoing>,
) {
    loop {
        match events.recv().await {
            Ok(payload) => {
                let message = Outgoing::Event {
                    event: IMAGE_SAVED,
                    payload,
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                // 前端可通过 get_saved_images 补齐
                warn!("Event listener lagged, {} events dropped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn path_arg(args: Value) -> Result<PathBuf, ErrorBody> {
    serde_json::from_value::<PathArgs>(args)
        .map(|a| a.path)
        .map_err(|e| ErrorBody::bad_request(format!("invalid args: {}", e)))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ErrorBody> {
    serde_json::to_value(value).map_err(|e| {
        error!("Failed to serialize response: {}", e);
        ErrorBody {
            kind: "Internal".to_string(),
            message: e.to_string(),
        }
    })
}

fn error_body(err: crate::error::CommandError) -> ErrorBody {
    ErrorBody {
        kind: err.kind().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::settings::Settings;
    use crate::settings::store::save;
    use crate::thumbnail::png_bytes;
    use std::fs;
    use std::path::Path;
    use tokio::io::{BufReader, duplex};
    use tokio::time::{Duration, timeout};

    fn service(data: &Path, shots: &Path) -> CaptureService {
        let mut config = Config::default();
        config.storage.data_dir = data.to_path_buf();
        config.monitor.settle_ms = 50;
        save(
            &config.settings_path(),
            &Settings {
                save_dir: shots.to_path_buf(),
                is_monitoring: false,
            },
        )
        .unwrap();
        CaptureService::open(&config).unwrap()
    }

    #[tokio::test]
    async fn test_get_settings() {
        let data = tempfile::tempdir().unwrap();
        let shots = tempfile::tempdir().unwrap();
        let service = service(data.path(), shots.path());

        let response = handle_line(&service, r#"{"id": 7, "command": "get_settings"}"#).await;
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["ok"]["is_monitoring"], false);
        assert_eq!(value["ok"]["save_dir"], shots.path().to_str().unwrap());
    }

    #[tokio::test]
    async fn test_open_image_not_found() {
        let data = tempfile::tempdir().unwrap();
        let shots = tempfile::tempdir().unwrap();
        let service = service(data.path(), shots.path());

        let response = handle_line(
            &service,
            r#"{"id": 1, "command": "open_image", "args": {"path": "/never/seen.png"}}"#,
        )
        .await;
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["error"]["kind"], "NotFound");
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let data = tempfile::tempdir().unwrap();
        let shots = tempfile::tempdir().unwrap();
        let service = service(data.path(), shots.path());

        let value = serde_json::to_value(handle_line(&service, "not json").await).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["kind"], "BadRequest");

        let value = serde_json::to_value(
            handle_line(&service, r#"{"id": 2, "command": "format_disk"}"#).await,
        )
        .unwrap();
        assert_eq!(value["error"]["kind"], "BadRequest");

        let value = serde_json::to_value(
            handle_line(&service, r#"{"id": 3, "command": "open_image"}"#).await,
        )
        .unwrap();
        assert_eq!(value["error"]["kind"], "BadRequest");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_streams_responses_and_events() {
        let data = tempfile::tempdir().unwrap();
        let shots_dir = tempfile::tempdir().unwrap();
        let shots = shots_dir.path().to_path_buf();
        let service = Arc::new(service(data.path(), &shots));

        let (mut client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let serve_task = tokio::spawn(serve(
            service.clone(),
            BufReader::new(server_read),
            server_write,
        ));

        client
            .write_all(b"{\"id\": 1, \"command\": \"start_monitoring\"}\n")
            .await
            .unwrap();

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut replies = BufReader::new(client_read).lines();

        let first = timeout(Duration::from_secs(5), replies.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let first: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(first["ok"], Value::Null);

        fs::write(shots.join("pushed.png"), png_bytes(100, 50)).unwrap();

        let pushed = timeout(Duration::from_secs(5), replies.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let pushed: Value = serde_json::from_str(&pushed).unwrap();
        assert_eq!(pushed["event"], "image-saved");
        assert_eq!(pushed["payload"]["width"], 100);
        assert_eq!(pushed["payload"]["height"], 50);
        assert_eq!(pushed["payload"]["filename"], "pushed.png");

        client_write.shutdown().await.unwrap();
        drop(client_write);
        timeout(Duration::from_secs(5), serve_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        service.shutdown().await;
    }
}
