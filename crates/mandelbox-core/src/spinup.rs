//! Spin-up of a new mandelbox.
//!
//! [`spin_up`] takes a client request all the way to a ready container:
//! it allocates every host resource, creates and starts the container,
//! writes the resource descriptors and waits for the container to report
//! readiness. Any failure closes the mandelbox and waits for the normal
//! teardown path to hand back everything allocated so far, so the error is
//! only returned once the host is back to its previous state.

use crate::error::{CoreError, Result};
use crate::host::Host;
use crate::mandelbox::{Mandelbox, MandelboxId, MandelboxInfo};
use crate::params::{self, MandelboxParams};
use crate::ports::{PortBinding, TransportProtocol};
use crate::runtime::ContainerSpec;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Mandelbox port for the client's TCP control connection.
pub const TCP_CONTROL_PORT: u16 = 32262;
/// Mandelbox port for the streaming protocol.
pub const UDP_STREAM_PORT: u16 = 32263;
/// Mandelbox port for the client's TCP data connection.
pub const TCP_DATA_PORT: u16 = 32273;

/// Request to start a mandelbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpinUpRequest {
    pub app_name: String,
    pub mandelbox_id: MandelboxId,
    #[serde(default)]
    pub config_encryption_token: String,
    #[serde(default)]
    pub jwt_access_token: String,
    #[serde(default)]
    pub user_id: String,
}

/// Where the client can reach a freshly started mandelbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinUpResult {
    pub host_port_for_tcp32262: u16,
    pub host_port_for_udp32263: u16,
    pub host_port_for_tcp32273: u16,
    /// Hex-encoded 128-bit key for the streaming protocol.
    pub aes_key: String,
}

impl SpinUpRequest {
    fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(CoreError::InvalidArgument("app_name is required".into()));
        }
        if self.mandelbox_id.as_uuid().is_nil() {
            return Err(CoreError::InvalidArgument("mandelbox_id must not be nil".into()));
        }
        Ok(())
    }
}

/// Start the mandelbox described by `request`.
pub async fn spin_up(host: &Arc<Host>, request: SpinUpRequest) -> Result<SpinUpResult> {
    if host.is_draining() {
        return Err(CoreError::Draining);
    }
    request.validate()?;

    let start = Instant::now();
    let id = request.mandelbox_id;
    tracing::info!(mandelbox_id = %id, app_name = %request.app_name, "Spinning up mandelbox");

    let info = MandelboxInfo {
        app_name: request.app_name.clone(),
        user_id: request.user_id,
        config_token: request.config_encryption_token,
        access_token: request.jwt_access_token,
    };
    let mandelbox = Mandelbox::create(host, id, info).await?;

    match provision(host, &mandelbox, &request.app_name).await {
        Ok(result) => {
            tracing::info!(
                mandelbox_id = %id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Mandelbox ready"
            );
            Ok(result)
        }
        Err(e) => {
            tracing::warn!(mandelbox_id = %id, error = %e, "Spin-up failed, tearing down");
            mandelbox.close();
            mandelbox.closed().await;
            Err(e)
        }
    }
}

async fn provision(host: &Arc<Host>, mandelbox: &Mandelbox, app_name: &str) -> Result<SpinUpResult> {
    let id = mandelbox.id();
    let bindings = mandelbox
        .assign_port_bindings(&[
            PortBinding::any(TCP_CONTROL_PORT, TransportProtocol::Tcp),
            PortBinding::any(UDP_STREAM_PORT, TransportProtocol::Udp),
            PortBinding::any(TCP_DATA_PORT, TransportProtocol::Tcp),
        ])
        .await?;
    let tty = mandelbox.assign_tty().await?;
    let gpu = if host.gpus().slot_count() > 0 {
        Some(mandelbox.assign_gpu().await?)
    } else {
        None
    };
    let devices = mandelbox.assign_input_devices().await?;

    let mandelbox_dir = mandelbox.mandelbox_dir();
    let spec = ContainerSpec {
        mandelbox_id: id,
        app_name: app_name.to_string(),
        image: format!("{app_name}:current-build"),
        port_bindings: bindings.clone(),
        tty,
        gpu,
        devices: devices.iter().map(|(_, path)| path.to_path_buf()).collect(),
        mandelbox_dir: mandelbox_dir.clone(),
        env: vec![
            format!("WHIST_MANDELBOX_ID={id}"),
            format!("TTY={tty}"),
        ],
    };
    let runtime_id = host.runtime().create_container(&spec).await?;
    mandelbox.register_creation(runtime_id.clone(), app_name).await?;

    params::write_mandelbox_params(
        &mandelbox_dir,
        &MandelboxParams {
            port_bindings: &bindings,
            tty,
            gpu,
            devices: &devices,
        },
    )
    .await?;
    mandelbox
        .start_input_handoff(params::uinput_socket_path(&mandelbox_dir))
        .await?;

    host.runtime().start_container(&runtime_id).await?;
    params::wait_for_ready(
        mandelbox.token(),
        &params::ready_marker_path(&mandelbox_dir),
        host.config().ready_timeout,
        host.config().ready_poll_interval,
    )
    .await?;

    mandelbox.mark_ready().await?;

    let host_port = |port: u16, protocol: TransportProtocol| {
        bindings
            .iter()
            .find(|b| b.mandelbox_port == port && b.protocol == protocol)
            .map(|b| b.host_port)
            .ok_or_else(|| CoreError::NotAllocated(format!("no binding for {port}/{protocol}")))
    };
    Ok(SpinUpResult {
        host_port_for_tcp32262: host_port(TCP_CONTROL_PORT, TransportProtocol::Tcp)?,
        host_port_for_udp32263: host_port(UDP_STREAM_PORT, TransportProtocol::Udp)?,
        host_port_for_tcp32273: host_port(TCP_DATA_PORT, TransportProtocol::Tcp)?,
        aes_key: generate_aes_key(),
    })
}

/// Fresh random 128-bit key, hex-encoded.
fn generate_aes_key() -> String {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    key.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_key_format() {
        let a = generate_aes_key();
        let b = generate_aes_key();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_deserialization() {
        let id = MandelboxId::new();
        let body = format!(
            r#"{{"app_name":"browsers/chrome","mandelbox_id":"{id}","jwt_access_token":"t"}}"#
        );
        let request: SpinUpRequest = serde_json::from_str(&body).unwrap();
        assert_eq!(request.mandelbox_id, id);
        assert!(request.config_encryption_token.is_empty());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_request_validation() {
        let request = SpinUpRequest {
            app_name: " ".into(),
            mandelbox_id: MandelboxId::new(),
            config_encryption_token: String::new(),
            jwt_access_token: String::new(),
            user_id: String::new(),
        };
        assert!(matches!(request.validate(), Err(CoreError::InvalidArgument(_))));

        let request = SpinUpRequest {
            app_name: "app".into(),
            mandelbox_id: MandelboxId::from(uuid::Uuid::nil()),
            ..request
        };
        assert!(matches!(request.validate(), Err(CoreError::InvalidArgument(_))));
    }
}
