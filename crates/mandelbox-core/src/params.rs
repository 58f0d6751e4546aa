//! Files shared with the container through its scratch directory.
//!
//! The host writes one small file per resource into
//! `<mandelbox_dir>/mandelboxResourceMappings/` so that services inside the
//! container can find their ports, TTY, GPU and input devices. The container
//! signals that it is up by creating the `.ready` marker in the same
//! directory.

use crate::error::{CoreError, Result};
use crate::gpu::GpuIndex;
use crate::ports::PortBinding;
use crate::tty::Tty;
use mandelbox_input::DevicePaths;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Subdirectory holding the resource descriptor files.
pub const RESOURCE_MAPPINGS_DIR: &str = "mandelboxResourceMappings";

/// Marker file the container creates once it is ready.
pub const READY_MARKER: &str = ".ready";

/// Unix socket the container connects to for its input device descriptors.
pub const UINPUT_SOCKET: &str = "sockets/uinput.sock";

/// Directory holding the descriptor files.
pub fn resource_mappings_dir(mandelbox_dir: &Path) -> PathBuf {
    mandelbox_dir.join(RESOURCE_MAPPINGS_DIR)
}

/// Path of the readiness marker.
pub fn ready_marker_path(mandelbox_dir: &Path) -> PathBuf {
    resource_mappings_dir(mandelbox_dir).join(READY_MARKER)
}

/// Path of the input device handoff socket.
pub fn uinput_socket_path(mandelbox_dir: &Path) -> PathBuf {
    mandelbox_dir.join(UINPUT_SOCKET)
}

/// Resources of one mandelbox, as written to disk.
#[derive(Debug, Clone, Serialize)]
pub struct MandelboxParams<'a> {
    pub port_bindings: &'a [PortBinding],
    pub tty: Tty,
    pub gpu: Option<GpuIndex>,
    pub devices: &'a DevicePaths,
}

/// Write the descriptor files for `params`.
///
/// Every value goes into its own file (`hostPort_for_my_32262_tcp`, `tty`,
/// `gpu_index`, `device_keyboard`, ...) and the whole set is also written as
/// `params.json`.
pub async fn write_mandelbox_params(mandelbox_dir: &Path, params: &MandelboxParams<'_>) -> Result<()> {
    let dir = resource_mappings_dir(mandelbox_dir);
    tokio::fs::create_dir_all(&dir).await?;

    for binding in params.port_bindings {
        let name = format!(
            "hostPort_for_my_{}_{}",
            binding.mandelbox_port, binding.protocol
        );
        tokio::fs::write(dir.join(name), binding.host_port.to_string()).await?;
    }
    tokio::fs::write(dir.join("tty"), params.tty.to_string()).await?;
    if let Some(gpu) = params.gpu {
        tokio::fs::write(dir.join("gpu_index"), gpu.to_string()).await?;
    }
    for (kind, path) in params.devices.iter() {
        let name = format!("device_{}", kind.to_string().replace(' ', "_"));
        tokio::fs::write(dir.join(name), path.to_string_lossy().as_bytes()).await?;
    }
    tokio::fs::write(dir.join("params.json"), serde_json::to_vec_pretty(params)?).await?;

    tracing::debug!(dir = %dir.display(), "Wrote mandelbox parameters");
    Ok(())
}

/// Wait for `marker` to appear.
///
/// Polls every `poll` until `timeout` elapses or `token` is cancelled.
pub async fn wait_for_ready(
    token: &CancellationToken,
    marker: &Path,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(marker).await? {
            tracing::debug!(
                marker = %marker.display(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Mandelbox ready"
            );
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CoreError::Timeout(timeout));
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CoreError::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Remove the scratch directory. A missing directory is fine.
pub async fn remove_mandelbox_dir(mandelbox_dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(mandelbox_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::TransportProtocol;

    fn device_paths() -> DevicePaths {
        DevicePaths {
            absolute_pointer: "/dev/input/event3".into(),
            relative_pointer: "/dev/input/event4".into(),
            keyboard: "/dev/input/event5".into(),
        }
    }

    #[tokio::test]
    async fn test_write_params_files() {
        let dir = tempfile::tempdir().unwrap();
        let bindings = [
            PortBinding::fixed(32262, 40001, TransportProtocol::Tcp),
            PortBinding::fixed(32263, 40002, TransportProtocol::Udp),
        ];
        let devices = device_paths();
        let params = MandelboxParams {
            port_bindings: &bindings,
            tty: 17,
            gpu: Some(1),
            devices: &devices,
        };
        write_mandelbox_params(dir.path(), &params).await.unwrap();

        let mappings = resource_mappings_dir(dir.path());
        let read = |name: &str| std::fs::read_to_string(mappings.join(name)).unwrap();
        assert_eq!(read("hostPort_for_my_32262_tcp"), "40001");
        assert_eq!(read("hostPort_for_my_32263_udp"), "40002");
        assert_eq!(read("tty"), "17");
        assert_eq!(read("gpu_index"), "1");
        assert_eq!(read("device_keyboard"), "/dev/input/event5");
        assert_eq!(read("device_absolute_pointer"), "/dev/input/event3");

        let json: serde_json::Value = serde_json::from_str(&read("params.json")).unwrap();
        assert_eq!(json["tty"], 17);
    }

    #[tokio::test]
    async fn test_wait_for_ready_sees_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = ready_marker_path(dir.path());
        let token = CancellationToken::new();

        let writer = {
            let marker = marker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                tokio::fs::create_dir_all(marker.parent().unwrap()).await.unwrap();
                tokio::fs::write(&marker, b"").await.unwrap();
            })
        };

        wait_for_ready(&token, &marker, Duration::from_secs(5), Duration::from_millis(5))
            .await
            .unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_ready_timeout_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let marker = ready_marker_path(dir.path());
        let token = CancellationToken::new();

        let result = wait_for_ready(
            &token,
            &marker,
            Duration::from_millis(30),
            Duration::from_millis(5),
        )
        .await;
        assert!(matches!(result, Err(CoreError::Timeout(_))));

        token.cancel();
        let result = wait_for_ready(&token, &marker, Duration::from_secs(5), Duration::from_millis(5)).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_remove_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("gone");
        remove_mandelbox_dir(&scratch).await.unwrap();

        tokio::fs::create_dir_all(resource_mappings_dir(&scratch)).await.unwrap();
        remove_mandelbox_dir(&scratch).await.unwrap();
        assert!(!scratch.exists());
    }
}
