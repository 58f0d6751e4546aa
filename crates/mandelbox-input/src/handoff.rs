//! Handing device descriptors to the process inside the mandelbox.
//!
//! The host binds a Unix socket inside the mandelbox's shared directory and
//! waits for the in-container input server to connect. All three
//! descriptors travel in a single `SCM_RIGHTS` message.

use crate::device::DeviceSet;
use crate::error::{InputError, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

/// Byte sent alongside the control message; some kernels drop
/// ancillary data on zero-length writes.
const HANDOFF_PAYLOAD: [u8; 1] = [b'D'];

/// Wait for one client on `socket_path` and send it the device descriptors.
///
/// Blocks until a client connects or `token` is cancelled. On cancellation
/// the listener is dropped, which unblocks the pending accept, and
/// [`InputError::Cancelled`] is returned. The socket file is removed on every
/// exit path.
pub async fn send_device_fds_over_socket(
    token: &CancellationToken,
    devices: &DeviceSet,
    socket_path: &Path,
) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => tracing::debug!(path = %socket_path.display(), "Removed stale handoff socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::debug!(path = %socket_path.display(), "Waiting for input client");

    let accepted = tokio::select! {
        biased;

        _ = token.cancelled() => None,
        res = listener.accept() => Some(res),
    };
    drop(listener);
    if let Err(e) = tokio::fs::remove_file(socket_path).await {
        tracing::trace!(error = %e, "Handoff socket already gone");
    }

    let (stream, _addr) = match accepted {
        Some(res) => res?,
        None => {
            tracing::debug!(path = %socket_path.display(), "Descriptor handoff cancelled");
            return Err(InputError::Cancelled);
        }
    };

    send_fds(&stream, &devices.raw_fds()).await?;
    tracing::info!(path = %socket_path.display(), "Sent input device descriptors");
    Ok(())
}

async fn send_fds(stream: &UnixStream, fds: &[RawFd]) -> Result<()> {
    loop {
        stream.writable().await?;
        let sent = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&HANDOFF_PAYLOAD)];
            let cmsgs = [ControlMessage::ScmRights(fds)];
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match sent {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(InputError::Handoff(e.to_string())),
        }
    }
}

/// Connect to a handoff socket and receive the three device descriptors.
///
/// This is the client side of [`send_device_fds_over_socket`], as run by
/// the input server inside the mandelbox.
pub async fn receive_device_fds(socket_path: &Path) -> Result<[OwnedFd; 3]> {
    let stream = UnixStream::connect(socket_path).await?;
    loop {
        stream.readable().await?;
        let received = stream.try_io(Interest::READABLE, || {
            let mut buf = [0u8; HANDOFF_PAYLOAD.len()];
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 3]);
            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .map_err(io::Error::from)?;

            let mut fds = Vec::with_capacity(3);
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    // Received descriptors are new entries owned by this process.
                    fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }
            Ok(fds)
        });
        match received {
            Ok(fds) => {
                return <[OwnedFd; 3]>::try_from(fds).map_err(|fds| {
                    InputError::Handoff(format!("expected 3 descriptors, got {}", fds.len()))
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(InputError::Handoff(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeInputProvider;
    use crate::InputDeviceProvider;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handoff_sends_three_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("sockets").join("uinput.sock");
        let provider = FakeInputProvider::new();
        let devices = provider.allocate().unwrap();
        let token = CancellationToken::new();

        let server_socket = socket.clone();
        let server_token = token.clone();
        let server = tokio::spawn(async move {
            let res = send_device_fds_over_socket(&server_token, &devices, &server_socket).await;
            (res, devices)
        });

        // Wait for the listener to appear
        let mut fds = None;
        for _ in 0..100 {
            if socket.exists() {
                fds = Some(receive_device_fds(&socket).await.unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let fds = fds.expect("handoff socket never appeared");
        assert_eq!(fds.len(), 3);

        let (res, devices) = server.await.unwrap();
        res.unwrap();
        assert!(!socket.exists());
        devices.close().unwrap();
    }

    #[tokio::test]
    async fn test_handoff_cancelled_while_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("uinput.sock");
        let provider = FakeInputProvider::new();
        let devices = provider.allocate().unwrap();
        let token = CancellationToken::new();

        let server_socket = socket.clone();
        let server_token = token.clone();
        let server = tokio::spawn(async move {
            send_device_fds_over_socket(&server_token, &devices, &server_socket).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let res = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("handoff task must finish after cancellation")
            .unwrap();
        assert!(matches!(res, Err(InputError::Cancelled)));
        assert!(!socket.exists());
        // Devices moved into the task were dropped with it
        assert_eq!(provider.open_devices(), 0);
    }

    #[tokio::test]
    async fn test_handoff_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("uinput.sock");
        std::fs::write(&socket, b"stale").unwrap();

        let provider = FakeInputProvider::new();
        let devices = provider.allocate().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let res = send_device_fds_over_socket(&token, &devices, &socket).await;
        assert!(matches!(res, Err(InputError::Cancelled)));
        assert!(!socket.exists());
        devices.close().unwrap();
    }
}
