use std::fs;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use anyhow::{Context, Result};
use stagehand_core::Settings;
use stagehand_installer::{ExecMode, FileKind, Platform, SystemInstaller};
use stagehand_ipc::{agent_socket_path, ensure_socket_dir, Command, Request, Response};

/// User-context helper: hosts the protocol server and performs user-targeted
/// actions on the daemon's request. Lives until a Shutdown request arrives.
pub fn run_agent(settings: &Settings, platform: Arc<dyn Platform>) -> Result<i32> {
    ensure_socket_dir(&settings.shared_state_dir).with_context(|| {
        format!(
            "failed to prepare socket directory {}",
            settings.shared_state_dir.display()
        )
    })?;

    let uid = platform
        .console_user_uid()
        .context("failed to determine console user")?;
    let socket = agent_socket_path(&settings.shared_state_dir, uid);

    let installer = Arc::new(SystemInstaller::new(
        settings.dry_run,
        ExecMode::User,
        platform,
    ));

    let (done_tx, done_rx) = mpsc::channel();
    let handler = agent_handler(
        Arc::clone(&installer),
        settings.track_background_processes,
        done_tx,
    );
    stagehand_ipc::serve(&socket, handler)
        .with_context(|| format!("failed to start agent server at {}", socket.display()))?;

    // Block until the daemon asks us to go away.
    let _ = done_rx.recv();
    tracing::info!("shutdown requested");

    if settings.track_background_processes && installer.background_count() > 0 {
        let errors = installer.wait_for_background(settings.background_timeout());
        for err in errors {
            tracing::error!(error = %err, "background process error during shutdown");
        }
    }

    let _ = fs::remove_file(&socket);
    Ok(0)
}

/// One handler per protocol command. A donotwait script is acknowledged as
/// started; when tracking is enabled it joins this process's background set
/// and is drained before the agent exits.
pub fn agent_handler(
    installer: Arc<SystemInstaller>,
    track_background: bool,
    done: Sender<()>,
) -> impl Fn(Request) -> Response + Send + Sync + 'static {
    move |request: Request| match request.command {
        Command::Ping => Response::ok(&request.id),
        Command::Shutdown => {
            let _ = done.send(());
            Response::ok(&request.id)
        }
        Command::RunUserScript => {
            let Some(path) = request.path.as_deref() else {
                return Response::failure(&request.id, "missing script path");
            };
            match installer.run_script(path, true, request.donotwait, track_background) {
                Ok(_) if request.donotwait => Response::started(&request.id),
                Ok(_) => Response::ok(&request.id),
                Err(err) => Response::failure(&request.id, err.to_string()),
            }
        }
        Command::PlaceUserFile => {
            let Some(path) = request.path.as_deref() else {
                return Response::failure(&request.id, "missing file path");
            };
            match installer.place_file(path, FileKind::User) {
                Ok(()) => Response::ok(&request.id),
                Err(err) => Response::failure(&request.id, err.to_string()),
            }
        }
    }
}
