use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::{Request, Response};

/// Bind the agent socket and serve connections on a background thread. Each
/// connection carries exactly one request; the handler's response is written
/// back and the connection closed. The accept loop lives for the rest of the
/// process — shutdown is signalled through the handler (the agent exits
/// after acknowledging a Shutdown request).
pub fn serve<H>(socket_path: &Path, handler: H) -> io::Result<()>
where
    H: Fn(Request) -> Response + Send + Sync + 'static,
{
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(0o666))?;
    tracing::info!(socket = %socket_path.display(), "agent listening");

    let handler = Arc::new(handler);
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let handler = Arc::clone(&handler);
                    thread::spawn(move || handle_connection(stream, handler.as_ref()));
                }
                Err(err) => {
                    tracing::debug!(error = %err, "accept failed");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    });

    Ok(())
}

fn handle_connection<H>(stream: UnixStream, handler: &H)
where
    H: Fn(Request) -> Response,
{
    let mut reader = BufReader::new(&stream);
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => {
            // Readiness probe: the daemon connects and closes without
            // sending a request.
            tracing::trace!("probe connection");
            return;
        }
        Ok(_) => {}
        Err(err) => {
            tracing::error!(error = %err, "failed to read request");
            return;
        }
    }

    let request: Request = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(err) => {
            tracing::error!(error = %err, "failed to decode request");
            return;
        }
    };

    tracing::debug!(
        id = request.id.as_str(),
        command = ?request.command,
        "handling request"
    );
    let response = handler(request);

    let mut payload = match serde_json::to_string(&response) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode response");
            return;
        }
    };
    payload.push('\n');

    let mut writer = &stream;
    if let Err(err) = writer.write_all(payload.as_bytes()) {
        tracing::error!(error = %err, "failed to write response");
    }
}
