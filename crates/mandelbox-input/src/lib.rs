//! # mandelbox-input
//!
//! Virtual input devices for mandelboxes.
//!
//! Every mandelbox receives three OS-level virtual input devices (absolute
//! pointer, relative pointer, keyboard). The host creates them, mounts their
//! device nodes into the container, and hands the open descriptors to the
//! in-container input server over a Unix socket.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mandelbox_input::{send_device_fds_over_socket, InputDeviceProvider, UinputProvider};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mandelbox_input::Result<()> {
//! let provider = UinputProvider::new();
//! let devices = provider.allocate()?;
//! println!("{:?}", devices.paths());
//!
//! let token = CancellationToken::new();
//! send_device_fds_over_socket(&token, &devices, "/whist/mb/sockets/uinput.sock".as_ref()).await?;
//!
//! devices.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **All-or-nothing allocation**: a failed set never leaks devices
//! - **Capability trait**: [`InputDeviceProvider`] hides the uinput ioctls
//! - **Cancellable handoff**: a pending accept unblocks on cancellation

mod device;
mod error;
mod handoff;
pub mod testing;
mod uinput;

pub use device::{DeviceKind, DevicePaths, DeviceSet, InputDevice, InputDeviceProvider};
pub use error::{InputError, Result};
pub use handoff::{receive_device_fds, send_device_fds_over_socket};
pub use uinput::{UinputProvider, UINPUT_PATH};
