//! RDMA device namespace moves over the RDMA netlink family
//!
//! Only the two nldev commands needed are spoken: a `GET` dump to map device
//! names to indices and a `SET` carrying the target namespace fd. RDMA devices
//! follow their namespace only in exclusive netns mode (`rdma system set netns
//! exclusive`).

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use error_stack::Report;
use error_stack::ResultExt;
use netlink_sys::Socket;
use netlink_sys::SocketAddr;
use tracing::debug;
use tracing::info;

use super::netns::with_netns;
use super::netns::CURRENT_NETNS;
use crate::domain::provisioner::MoveDirection;
use crate::domain::provisioner::ProvisionError;
use crate::domain::provisioner::RdmaNamespace;

const NETLINK_RDMA: isize = 20;

const NLMSG_HEADER_LEN: usize = 16;
const NLA_HEADER_LEN: usize = 4;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_MULTI: u16 = 0x2;
const NLM_F_ACK: u16 = 0x4;
const NLM_F_DUMP: u16 = 0x300;

const RDMA_NL_NLDEV: u16 = 5;
const RDMA_NLDEV_CMD_GET: u16 = 1;
const RDMA_NLDEV_CMD_SET: u16 = 2;

const RDMA_NLDEV_ATTR_DEV_INDEX: u16 = 1;
const RDMA_NLDEV_ATTR_DEV_NAME: u16 = 2;
const RDMA_NLDEV_NET_NS_FD: u16 = 68;

const fn nldev_type(command: u16) -> u16 {
    (RDMA_NL_NLDEV << 10) | command
}

fn align(len: usize) -> usize {
    (len + 3) & !3
}

fn push_attribute(buf: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    let len = NLA_HEADER_LEN + payload.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize(align(buf.len()), 0);
}

fn message(kind: u16, flags: u16, seq: u32, attributes: &[u8]) -> Vec<u8> {
    let len = NLMSG_HEADER_LEN + attributes.len();
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    // port id, filled in by the kernel
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(attributes);
    buf
}

/// Dump request listing every RDMA device of the socket's namespace
pub fn get_devices_request(seq: u32) -> Vec<u8> {
    message(
        nldev_type(RDMA_NLDEV_CMD_GET),
        NLM_F_REQUEST | NLM_F_DUMP,
        seq,
        &[],
    )
}

/// Request moving device `index` into the namespace behind `netns_fd`
pub fn set_netns_request(seq: u32, index: u32, netns_fd: u32) -> Vec<u8> {
    let mut attributes = Vec::new();
    push_attribute(&mut attributes, RDMA_NLDEV_ATTR_DEV_INDEX, &index.to_ne_bytes());
    push_attribute(&mut attributes, RDMA_NLDEV_NET_NS_FD, &netns_fd.to_ne_bytes());
    message(
        nldev_type(RDMA_NLDEV_CMD_SET),
        NLM_F_REQUEST | NLM_F_ACK,
        seq,
        &attributes,
    )
}

/// One decoded netlink message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkMessage<'a> {
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: &'a [u8],
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_ne_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_ne_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

/// Splits a datagram into messages
pub fn parse_messages(buf: &[u8]) -> io::Result<Vec<NetlinkMessage<'_>>> {
    let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed netlink message");
    let mut messages = Vec::new();
    let mut offset = 0;
    while offset + NLMSG_HEADER_LEN <= buf.len() {
        let len = read_u32(buf, offset).ok_or_else(malformed)? as usize;
        if len < NLMSG_HEADER_LEN || offset + len > buf.len() {
            return Err(malformed());
        }
        messages.push(NetlinkMessage {
            kind: read_u16(buf, offset + 4).ok_or_else(malformed)?,
            flags: read_u16(buf, offset + 6).ok_or_else(malformed)?,
            seq: read_u32(buf, offset + 8).ok_or_else(malformed)?,
            payload: &buf[offset + NLMSG_HEADER_LEN..offset + len],
        });
        offset += align(len);
    }
    Ok(messages)
}

/// Attributes of a message payload as `(type, value)` pairs
pub fn parse_attributes(payload: &[u8]) -> Vec<(u16, &[u8])> {
    let mut attributes = Vec::new();
    let mut offset = 0;
    while offset + NLA_HEADER_LEN <= payload.len() {
        let (Some(len), Some(kind)) = (read_u16(payload, offset), read_u16(payload, offset + 2))
        else {
            break;
        };
        let len = len as usize;
        if len < NLA_HEADER_LEN || offset + len > payload.len() {
            break;
        }
        // the top bits flag nested and byte-order attributes
        attributes.push((kind & 0x3fff, &payload[offset + NLA_HEADER_LEN..offset + len]));
        offset += align(len);
    }
    attributes
}

/// `(index, name)` of the device described by a `GET` reply
pub fn device_from_payload(payload: &[u8]) -> Option<(u32, String)> {
    let mut index = None;
    let mut name = None;
    for (kind, value) in parse_attributes(payload) {
        match kind {
            RDMA_NLDEV_ATTR_DEV_INDEX => index = read_u32(value, 0),
            RDMA_NLDEV_ATTR_DEV_NAME => {
                let value = value.split(|b| *b == 0).next().unwrap_or_default();
                name = Some(String::from_utf8_lossy(value).into_owned());
            }
            _ => {}
        }
    }
    Some((index?, name?))
}

/// Errno carried by an `NLMSG_ERROR` message, zero for an acknowledgement
fn error_code(payload: &[u8]) -> io::Result<i32> {
    payload
        .get(..4)
        .and_then(|code| code.try_into().ok())
        .map(i32::from_ne_bytes)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "truncated netlink error"))
}

struct RdmaSocket {
    socket: Socket,
}

static SEQUENCE: AtomicU32 = AtomicU32::new(1);

impl RdmaSocket {
    /// Opens a socket bound to the calling thread's network namespace
    fn open() -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_RDMA)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(Self { socket })
    }

    fn request(&self, request: &[u8], seq: u32, mut on_message: impl FnMut(&[u8])) -> io::Result<()> {
        self.socket.send(request, 0)?;
        loop {
            let (datagram, _) = self.socket.recv_from_full()?;
            for message in parse_messages(&datagram)? {
                if message.seq != seq {
                    continue;
                }
                match message.kind {
                    NLMSG_DONE => return Ok(()),
                    NLMSG_ERROR => {
                        let code = error_code(message.payload)?;
                        return if code == 0 {
                            Ok(())
                        } else {
                            Err(io::Error::from_raw_os_error(-code))
                        };
                    }
                    _ => {
                        on_message(message.payload);
                        if message.flags & NLM_F_MULTI == 0 {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn device_index(&self, device: &str) -> io::Result<Option<u32>> {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let mut found = None;
        self.request(&get_devices_request(seq), seq, |payload| {
            if let Some((index, name)) = device_from_payload(payload) {
                if name == device {
                    found = Some(index);
                }
            }
        })?;
        Ok(found)
    }

    fn move_device(&self, index: u32, target: &File) -> io::Result<()> {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        self.request(
            &set_netns_request(seq, index, target.as_raw_fd() as u32),
            seq,
            |_| {},
        )
    }
}

#[derive(Default)]
pub struct NetlinkRdma;

impl NetlinkRdma {
    pub fn new() -> Self {
        Self
    }
}

impl RdmaNamespace for NetlinkRdma {
    #[tracing::instrument(skip(self), fields(netns = %netns.display()))]
    fn move_into(&self, device: &str, netns: &Path) -> Result<(), Report<ProvisionError>> {
        let error = || ProvisionError::RdmaMove {
            device: device.to_string(),
            direction: MoveDirection::IntoPod,
        };

        let target = File::open(netns).change_context_lazy(error)?;
        let socket = RdmaSocket::open().change_context_lazy(error)?;
        let index = socket
            .device_index(device)
            .change_context_lazy(error)?
            .ok_or_else(|| Report::new(error()))
            .attach_printable("device not present in the root namespace")?;

        socket.move_device(index, &target).change_context_lazy(error)?;
        debug!(index, "rdma device moved into pod namespace");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(netns = %netns.display()))]
    fn move_back(&self, device: &str, netns: &Path) -> Result<(), Report<ProvisionError>> {
        let error = || ProvisionError::RdmaMove {
            device: device.to_string(),
            direction: MoveDirection::BackToRoot,
        };

        let root = File::open(CURRENT_NETNS).change_context_lazy(error)?;
        let moved = match with_netns(netns, || {
            let socket = RdmaSocket::open()?;
            match socket.device_index(device)? {
                Some(index) => socket.move_device(index, &root).map(|()| true),
                None => Ok(false),
            }
        }) {
            Ok(moved) => moved,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("pod namespace is gone, rdma device already released");
                return Ok(());
            }
            Err(e) => return Err(Report::new(e).change_context(error())),
        };

        if moved {
            debug!("rdma device moved back to root namespace");
        } else {
            info!("rdma device not present in pod namespace");
        }
        Ok(())
    }
}
