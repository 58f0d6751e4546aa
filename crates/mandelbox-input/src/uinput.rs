//! Linux uinput provider.
//!
//! Each device is its own open handle on `/dev/uinput`, configured with the
//! uinput ioctls and then created with `UI_DEV_CREATE`. The resulting
//! `/dev/input/eventN` node is looked up in sysfs so it can be mounted into
//! the container.

use crate::device::{DeviceKind, DeviceSet, InputDevice, InputDeviceProvider};
use crate::error::{InputError, Result};
use nix::fcntl::OFlag;
use nix::sys::ioctl::ioctl_param_type;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default uinput control file.
pub const UINPUT_PATH: &str = "/dev/uinput";

/// Where the kernel lists virtual input devices.
const SYSFS_VIRTUAL_INPUT: &str = "/sys/devices/virtual/input";

/// Attempts to find the event node after creation (udev may lag behind).
const NODE_LOOKUP_ATTEMPTS: u32 = 20;
const NODE_LOOKUP_INTERVAL: Duration = Duration::from_millis(10);

const UINPUT_MAX_NAME_SIZE: usize = 80;
const SYSNAME_BUF_LEN: usize = 64;

// linux/input-event-codes.h
const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_REL: u16 = 0x02;
const EV_ABS: u16 = 0x03;
const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_HWHEEL: u16 = 0x06;
const REL_WHEEL: u16 = 0x08;
const ABS_X: u16 = 0x00;
const ABS_Y: u16 = 0x01;
const BTN_LEFT: u16 = 0x110;
const BTN_RIGHT: u16 = 0x111;
const BTN_MIDDLE: u16 = 0x112;
const BTN_SIDE: u16 = 0x113;
const BTN_EXTRA: u16 = 0x114;
const BTN_TOUCH: u16 = 0x14a;
const KEY_ESC: u16 = 1;
const KEY_MICMUTE: u16 = 248;
const BUS_USB: u16 = 0x03;

/// Range reported for absolute axes.
const ABS_MAX: i32 = 0xFFF;

const VENDOR_ID: u16 = 0x4d42;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct UinputSetup {
    id: InputId,
    name: [u8; UINPUT_MAX_NAME_SIZE],
    ff_effects_max: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct InputAbsinfo {
    value: i32,
    minimum: i32,
    maximum: i32,
    fuzz: i32,
    flat: i32,
    resolution: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct UinputAbsSetup {
    code: u16,
    absinfo: InputAbsinfo,
}

mod ioctls {
    use super::{UinputAbsSetup, UinputSetup};

    nix::ioctl_none!(ui_dev_create, b'U', 1);
    nix::ioctl_none!(ui_dev_destroy, b'U', 2);
    nix::ioctl_write_ptr!(ui_dev_setup, b'U', 3, UinputSetup);
    nix::ioctl_write_ptr!(ui_abs_setup, b'U', 4, UinputAbsSetup);
    nix::ioctl_write_int!(ui_set_evbit, b'U', 100);
    nix::ioctl_write_int!(ui_set_keybit, b'U', 101);
    nix::ioctl_write_int!(ui_set_relbit, b'U', 102);
    nix::ioctl_write_int!(ui_set_absbit, b'U', 103);
    nix::ioctl_read_buf!(ui_get_sysname, b'U', 44, u8);
}

impl DeviceKind {
    fn device_name(&self) -> &'static str {
        match self {
            Self::AbsolutePointer => "Mandelbox Virtual Absolute Input",
            Self::RelativePointer => "Mandelbox Virtual Relative Input",
            Self::Keyboard => "Mandelbox Virtual Keyboard",
        }
    }

    fn product_id(&self) -> u16 {
        match self {
            Self::AbsolutePointer => 1,
            Self::RelativePointer => 2,
            Self::Keyboard => 3,
        }
    }
}

/// Provider backed by the kernel's uinput module.
#[derive(Debug, Clone)]
pub struct UinputProvider {
    control_path: PathBuf,
    sysfs_root: PathBuf,
}

impl Default for UinputProvider {
    fn default() -> Self {
        Self {
            control_path: PathBuf::from(UINPUT_PATH),
            sysfs_root: PathBuf::from(SYSFS_VIRTUAL_INPUT),
        }
    }
}

impl UinputProvider {
    /// Provider using `/dev/uinput`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider using a custom uinput control file.
    pub fn with_control_path(path: impl Into<PathBuf>) -> Self {
        Self {
            control_path: path.into(),
            ..Self::default()
        }
    }

    /// Whether the uinput control file exists on this host.
    pub fn is_available(&self) -> bool {
        self.control_path.exists()
    }

    fn create(&self, kind: DeviceKind) -> Result<Box<dyn InputDevice>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&self.control_path)
            .map_err(|e| InputError::Create {
                kind,
                reason: format!("open {}: {e}", self.control_path.display()),
            })?;

        // From here on the handle is closed by drop if anything fails; the
        // device only exists in the kernel after UI_DEV_CREATE succeeds.
        configure(&file, kind)?;
        let fd = file.as_raw_fd();
        unsafe { ioctls::ui_dev_create(fd) }.map_err(|source| InputError::Ioctl {
            op: "UI_DEV_CREATE",
            source,
        })?;

        let lookup = read_sysname(&file).and_then(|sysname| {
            let node = find_event_node(&self.sysfs_root.join(&sysname))?;
            Ok((sysname, node))
        });
        let (sysname, node) = match lookup {
            Ok(found) => found,
            Err(e) => {
                if let Err(destroy_err) = unsafe { ioctls::ui_dev_destroy(fd) } {
                    tracing::warn!(kind = %kind, error = %destroy_err, "UI_DEV_DESTROY failed");
                }
                return Err(e);
            }
        };

        tracing::debug!(
            kind = %kind,
            sysname = %sysname,
            node = %node.display(),
            "Created uinput device"
        );
        Ok(Box::new(UinputDevice {
            kind,
            node,
            sysname,
            file,
        }))
    }
}

impl InputDeviceProvider for UinputProvider {
    fn allocate(&self) -> Result<DeviceSet> {
        DeviceSet::build(|kind| self.create(kind))
    }
}

fn ioctl_err(op: &'static str) -> impl FnOnce(nix::Error) -> InputError {
    move |source| InputError::Ioctl { op, source }
}

fn set_bit(
    fd: i32,
    op: &'static str,
    f: unsafe fn(i32, ioctl_param_type) -> nix::Result<i32>,
    bit: u16,
) -> Result<()> {
    unsafe { f(fd, bit as ioctl_param_type) }.map_err(ioctl_err(op))?;
    Ok(())
}

fn configure(file: &File, kind: DeviceKind) -> Result<()> {
    let fd = file.as_raw_fd();
    set_bit(fd, "UI_SET_EVBIT", ioctls::ui_set_evbit, EV_SYN)?;
    set_bit(fd, "UI_SET_EVBIT", ioctls::ui_set_evbit, EV_KEY)?;

    match kind {
        DeviceKind::AbsolutePointer => {
            for btn in [BTN_LEFT, BTN_RIGHT, BTN_MIDDLE, BTN_TOUCH] {
                set_bit(fd, "UI_SET_KEYBIT", ioctls::ui_set_keybit, btn)?;
            }
            set_bit(fd, "UI_SET_EVBIT", ioctls::ui_set_evbit, EV_ABS)?;
            for axis in [ABS_X, ABS_Y] {
                set_bit(fd, "UI_SET_ABSBIT", ioctls::ui_set_absbit, axis)?;
                let abs = UinputAbsSetup {
                    code: axis,
                    absinfo: InputAbsinfo {
                        maximum: ABS_MAX,
                        ..InputAbsinfo::default()
                    },
                };
                unsafe { ioctls::ui_abs_setup(fd, &abs) }.map_err(ioctl_err("UI_ABS_SETUP"))?;
            }
        }
        DeviceKind::RelativePointer => {
            for btn in [BTN_LEFT, BTN_RIGHT, BTN_MIDDLE, BTN_SIDE, BTN_EXTRA] {
                set_bit(fd, "UI_SET_KEYBIT", ioctls::ui_set_keybit, btn)?;
            }
            set_bit(fd, "UI_SET_EVBIT", ioctls::ui_set_evbit, EV_REL)?;
            for axis in [REL_X, REL_Y, REL_WHEEL, REL_HWHEEL] {
                set_bit(fd, "UI_SET_RELBIT", ioctls::ui_set_relbit, axis)?;
            }
        }
        DeviceKind::Keyboard => {
            for key in KEY_ESC..=KEY_MICMUTE {
                set_bit(fd, "UI_SET_KEYBIT", ioctls::ui_set_keybit, key)?;
            }
        }
    }

    let mut name = [0u8; UINPUT_MAX_NAME_SIZE];
    let bytes = kind.device_name().as_bytes();
    name[..bytes.len()].copy_from_slice(bytes);
    let setup = UinputSetup {
        id: InputId {
            bustype: BUS_USB,
            vendor: VENDOR_ID,
            product: kind.product_id(),
            version: 1,
        },
        name,
        ff_effects_max: 0,
    };
    unsafe { ioctls::ui_dev_setup(fd, &setup) }.map_err(ioctl_err("UI_DEV_SETUP"))?;
    Ok(())
}

fn read_sysname(file: &File) -> Result<String> {
    let mut buf = [0u8; SYSNAME_BUF_LEN];
    unsafe { ioctls::ui_get_sysname(file.as_raw_fd(), &mut buf) }
        .map_err(ioctl_err("UI_GET_SYSNAME"))?;
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

fn find_event_node(sys_dir: &Path) -> Result<PathBuf> {
    for _ in 0..NODE_LOOKUP_ATTEMPTS {
        if let Ok(entries) = std::fs::read_dir(sys_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("event") {
                    return Ok(Path::new("/dev/input").join(name.as_ref()));
                }
            }
        }
        std::thread::sleep(NODE_LOOKUP_INTERVAL);
    }
    Err(InputError::NodeNotFound(sys_dir.display().to_string()))
}

/// A device created through `/dev/uinput`.
#[derive(Debug)]
struct UinputDevice {
    kind: DeviceKind,
    node: PathBuf,
    sysname: String,
    file: File,
}

impl AsFd for UinputDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl InputDevice for UinputDevice {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn node_path(&self) -> &Path {
        &self.node
    }

    fn close(self: Box<Self>) -> Result<()> {
        // Drop performs UI_DEV_DESTROY and closes the handle.
        drop(self);
        Ok(())
    }
}

impl Drop for UinputDevice {
    fn drop(&mut self) {
        if let Err(e) = unsafe { ioctls::ui_dev_destroy(self.file.as_raw_fd()) } {
            tracing::warn!(
                kind = %self.kind,
                sysname = %self.sysname,
                error = %e,
                "UI_DEV_DESTROY failed"
            );
        }
    }
}
