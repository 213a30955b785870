use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::{Request, Response, RpcError};

static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub fn next_request_id() -> String {
    let sequence = REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_nanos())
        .unwrap_or_default();
    format!("req-{}-{sequence}-{nanos}", std::process::id())
}

/// Poll the agent socket until a connection succeeds. A successful probe is
/// closed without sending anything.
pub fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), RpcError> {
    let start = Instant::now();
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => {
                drop(stream);
                tracing::info!(socket = %path.display(), "agent socket is ready");
                return Ok(());
            }
            Err(err) => {
                tracing::trace!(socket = %path.display(), error = %err, "agent socket not ready");
            }
        }
        if start.elapsed() > timeout {
            return Err(RpcError::NotReady {
                path: path.to_path_buf(),
            });
        }
        thread::sleep(Duration::from_secs(1));
    }
}

/// Send one request and wait for its response, bounded by `timeout`. The
/// response must echo the request id; a mismatch is a hard failure rather
/// than an attempt to re-associate multiplexed replies.
pub fn call(path: &Path, mut request: Request, timeout: Duration) -> Result<Response, RpcError> {
    if request.id.is_empty() {
        request.id = next_request_id();
    }

    let stream = UnixStream::connect(path).map_err(|source| RpcError::Connect {
        path: path.to_path_buf(),
        source,
    })?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut payload = serde_json::to_string(&request)
        .map_err(|err| RpcError::Decode(format!("failed to encode request: {err}")))?;
    payload.push('\n');

    tracing::debug!(id = request.id.as_str(), command = ?request.command, "sending request");
    let mut writer = &stream;
    writer.write_all(payload.as_bytes())?;

    let mut reader = BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(RpcError::Decode("connection closed before response".to_string()));
    }

    let response: Response =
        serde_json::from_str(line.trim()).map_err(|err| RpcError::Decode(err.to_string()))?;
    if response.id != request.id {
        return Err(RpcError::IdMismatch {
            expected: request.id,
            got: response.id,
        });
    }
    Ok(response)
}
