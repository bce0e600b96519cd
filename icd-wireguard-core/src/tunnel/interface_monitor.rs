//! Kernel link-state monitoring over rtnetlink
//!
//! Subscribes to `RTMGRP_LINK` on a `NETLINK_ROUTE` socket and turns
//! link records for the tunnel interface into [`Event::InterfaceUp`] and
//! [`Event::InterfaceDown`]. Only the fields the state machine consumes are
//! parsed: interface index, running flag and name.

use crate::error::MonitorError;
use crate::tunnel::event::{Event, InfraComponent};
use crate::tunnel::retry::RetryPolicy;
use netlink_packet_core::{NetlinkBuffer, NetlinkMessage, NetlinkPayload, NETLINK_HEADER_LEN};
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use std::future::Future;
use std::io;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Large enough for a full batch of link records
const RECV_BUFFER_LEN: usize = 16 * 1024;

/// One link record from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub index: u32,
    pub up: bool,
    /// `IFLA_IFNAME` when the record carries it
    pub name: Option<String>,
}

impl LinkRecord {
    fn from_link(link: &LinkMessage, deleted: bool) -> Option<Self> {
        if link.header.index == 0 {
            debug!("Ignoring link record without an interface index");
            return None;
        }
        let name = link.attributes.iter().find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        });
        Some(Self {
            index: link.header.index,
            up: !deleted && link.header.flags.contains(LinkFlags::Running),
            name,
        })
    }
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Parse every complete link record in one datagram
///
/// A truncated trailing message ends parsing without error. An
/// `NLMSG_ERROR` carrying a non-zero code fails the whole batch.
pub fn parse_link_messages(buf: &[u8]) -> Result<Vec<LinkRecord>, MonitorError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while buf.len().saturating_sub(offset) >= NETLINK_HEADER_LEN {
        let bytes = &buf[offset..];
        let msg_len = NetlinkBuffer::new(bytes).length() as usize;

        if msg_len < NETLINK_HEADER_LEN {
            return Err(MonitorError::Malformed(format!(
                "message length {} shorter than header",
                msg_len
            )));
        }
        if msg_len > bytes.len() {
            debug!(
                "Truncated netlink message ({} of {} bytes)",
                bytes.len(),
                msg_len
            );
            break;
        }

        match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&bytes[..msg_len]) {
            Ok(message) => match message.payload {
                NetlinkPayload::Done(_) => break,
                NetlinkPayload::Error(err) => {
                    if let Some(code) = err.code {
                        return Err(MonitorError::KernelError { code: code.get() });
                    }
                }
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                    records.extend(LinkRecord::from_link(&link, false));
                }
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                    records.extend(LinkRecord::from_link(&link, true));
                }
                other => debug!("Ignoring netlink message {:?}", other),
            },
            Err(e) => debug!("Skipping undecodable netlink message: {}", e),
        }

        offset += align4(msg_len);
    }

    Ok(records)
}

/// Look up the current name of an interface index
pub fn interface_name_for_index(index: u32) -> Option<String> {
    let interfaces = nix::ifaddrs::getifaddrs().ok()?;
    interfaces.map(|ifaddr| ifaddr.interface_name).find(|name| {
        nix::net::if_::if_nametoindex(name.as_str()).is_ok_and(|found| found == index)
    })
}

/// Turn a link record into a state machine event for `target`
///
/// Records for other interfaces are dropped. A down record whose name cannot
/// be resolved is still reported, since a removed interface no longer has a
/// name; the state machine only acts on it when the index matches the
/// interface it recorded as up.
pub fn classify(
    record: &LinkRecord,
    target: &str,
    resolve: impl Fn(u32) -> Option<String>,
) -> Option<Event> {
    let name = record.name.clone().or_else(|| resolve(record.index));
    match name {
        Some(ref name) if name == target => {
            if record.up {
                Some(Event::InterfaceUp {
                    index: record.index,
                })
            } else {
                Some(Event::InterfaceDown {
                    index: record.index,
                })
            }
        }
        Some(name) => {
            debug!("Ignoring link change on {} (index {})", name, record.index);
            None
        }
        None if !record.up => Some(Event::InterfaceDown {
            index: record.index,
        }),
        None => {
            warn!(
                "Dropping link-up record: cannot resolve name of interface {}",
                record.index
            );
            None
        }
    }
}

/// A non-blocking source of netlink datagrams
pub trait DatagramSource {
    /// Receive one datagram into `buf`, which is empty on entry
    fn recv_datagram(&self, buf: &mut Vec<u8>) -> io::Result<usize>;
}

impl DatagramSource for Socket {
    fn recv_datagram(&self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.recv(buf, 0)
    }
}

/// Read datagrams until the source would block
///
/// Batches that fail to parse are discarded; receive-buffer overruns are
/// logged and reading continues.
pub fn drain(source: &dyn DatagramSource, buf: &mut Vec<u8>) -> Result<Vec<LinkRecord>, MonitorError> {
    let mut records = Vec::new();
    loop {
        buf.clear();
        match source.recv_datagram(buf) {
            Ok(0) => return Ok(records),
            Ok(_) => match parse_link_messages(buf) {
                Ok(batch) => records.extend(batch),
                Err(e) => warn!("Discarding netlink batch: {}", e),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(records),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("Kernel dropped link notifications (receive buffer overrun)");
            }
            Err(e) => return Err(MonitorError::ReadFailed(e)),
        }
    }
}

/// Netlink route socket subscribed to link changes
struct NetlinkSocket {
    fd: AsyncFd<Socket>,
}

impl NetlinkSocket {
    fn open() -> Result<Self, MonitorError> {
        let mut socket = Socket::new(NETLINK_ROUTE).map_err(MonitorError::SocketFailed)?;
        socket
            .bind(&SocketAddr::new(0, libc::RTMGRP_LINK as u32))
            .map_err(MonitorError::BindFailed)?;
        socket
            .set_non_blocking(true)
            .map_err(MonitorError::SocketFailed)?;

        let fd = AsyncFd::new(socket).map_err(MonitorError::SocketFailed)?;
        Ok(Self { fd })
    }

    /// Wait for notifications and drain every available datagram
    async fn read_records(&self, buf: &mut Vec<u8>) -> Result<Vec<LinkRecord>, MonitorError> {
        loop {
            let mut guard = self.fd.readable().await.map_err(MonitorError::ReadFailed)?;
            let records = drain(self.fd.get_ref(), buf)?;
            guard.clear_ready();

            if !records.is_empty() {
                return Ok(records);
            }
        }
    }
}

/// Retry `open` with the policy's backoff until it succeeds or attempts run out
pub async fn connect_with_retry<T, F, Fut>(policy: &RetryPolicy, mut open: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MonitorError>>,
{
    for attempt in 1..=policy.max_attempts {
        match open().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("Interface monitor connected after {} attempts", attempt);
                }
                return Some(value);
            }
            Err(e) => {
                warn!(
                    "Interface monitor setup failed (attempt {}/{}): {}",
                    attempt, policy.max_attempts, e
                );
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }
    None
}

/// Watches the tunnel interface and feeds link events to the state machine
pub struct InterfaceMonitor {
    interface: String,
    retry: RetryPolicy,
    events: mpsc::UnboundedSender<Event>,
}

impl InterfaceMonitor {
    pub fn new(
        interface: impl Into<String>,
        retry: RetryPolicy,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            interface: interface.into(),
            retry,
            events,
        }
    }

    /// Run the monitor in a background task
    ///
    /// The task ends when the state machine stops accepting events or when
    /// the socket cannot be set up within the retry policy, in which case
    /// `InfrastructureFailed` is reported first.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut buf = Vec::with_capacity(RECV_BUFFER_LEN);

        loop {
            let socket =
                match connect_with_retry(&self.retry, || async { NetlinkSocket::open() }).await {
                    Some(socket) => socket,
                    None => {
                        error!(
                            "Giving up on link notifications for {} after {} attempts",
                            self.interface, self.retry.max_attempts
                        );
                        let _ = self.events.send(Event::InfrastructureFailed {
                            component: InfraComponent::InterfaceMonitor,
                        });
                        return;
                    }
                };
            info!("Monitoring link state of {}", self.interface);

            loop {
                let records = match socket.read_records(&mut buf).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!("Link notification socket failed, reopening: {}", e);
                        break;
                    }
                };

                for record in &records {
                    let Some(event) = classify(record, &self.interface, interface_name_for_index)
                    else {
                        continue;
                    };
                    debug!("Link event: {:?}", event);
                    if self.events.send(event).is_err() {
                        debug!("State machine gone, interface monitor exiting");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_core::{ErrorMessage, NetlinkHeader};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::num::NonZeroI32;

    fn encode(mut message: NetlinkMessage<RouteNetlinkMessage>) -> Vec<u8> {
        message.finalize();
        let mut buf = vec![0u8; message.buffer_len()];
        message.serialize(&mut buf[..]);
        buf
    }

    fn link_message(index: u32, running: bool, name: Option<&str>, deleted: bool) -> Vec<u8> {
        let mut link = LinkMessage::default();
        link.header.index = index;
        if running {
            link.header.flags = LinkFlags::Up | LinkFlags::Running;
        }
        if let Some(name) = name {
            link.attributes.push(LinkAttribute::IfName(name.to_string()));
        }
        let inner = if deleted {
            RouteNetlinkMessage::DelLink(link)
        } else {
            RouteNetlinkMessage::NewLink(link)
        };
        encode(NetlinkMessage::from(inner))
    }

    fn error_message(code: i32) -> Vec<u8> {
        let mut err = ErrorMessage::default();
        err.code = NonZeroI32::new(code);
        encode(NetlinkMessage::new(
            NetlinkHeader::default(),
            NetlinkPayload::Error(err),
        ))
    }

    fn done_message() -> Vec<u8> {
        let total = NETLINK_HEADER_LEN + 4;
        let mut msg = vec![0u8; total];
        msg[0..4].copy_from_slice(&(total as u32).to_ne_bytes());
        msg[4..6].copy_from_slice(&(libc::NLMSG_DONE as u16).to_ne_bytes());
        msg
    }

    /// Replays scripted receive results, then would block
    struct ScriptedSource {
        script: RefCell<VecDeque<io::Result<Vec<u8>>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                script: RefCell::new(script.into()),
            }
        }
    }

    impl DatagramSource for ScriptedSource {
        fn recv_datagram(&self, buf: &mut Vec<u8>) -> io::Result<usize> {
            match self.script.borrow_mut().pop_front() {
                Some(Ok(datagram)) => {
                    buf.extend_from_slice(&datagram);
                    Ok(datagram.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn test_parse_new_and_del_link() {
        let mut buf = link_message(7, true, Some("icdwg0"), false);
        buf.extend(link_message(7, true, None, true));

        let records = parse_link_messages(&buf).unwrap();
        assert_eq!(
            records,
            vec![
                LinkRecord {
                    index: 7,
                    up: true,
                    name: Some("icdwg0".to_string())
                },
                LinkRecord {
                    index: 7,
                    up: false,
                    name: None
                },
            ]
        );
    }

    #[test]
    fn test_parse_tolerates_partial_trailing_message() {
        let mut buf = link_message(3, false, Some("eth0"), false);
        let second = link_message(7, true, Some("icdwg0"), false);
        buf.extend_from_slice(&second[..second.len() - 6]);

        let records = parse_link_messages(&buf).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_deref(), Some("eth0"));
        assert!(!records[0].up);
    }

    #[test]
    fn test_parse_stops_at_done_and_fails_on_error() {
        let mut buf = done_message();
        buf.extend(link_message(7, true, Some("icdwg0"), false));
        assert!(parse_link_messages(&buf).unwrap().is_empty());

        assert!(matches!(
            parse_link_messages(&error_message(-libc::EPERM)),
            Err(MonitorError::KernelError { code }) if code == -libc::EPERM
        ));
        // A zero error code is an acknowledgement
        assert!(parse_link_messages(&error_message(0)).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_bogus_length() {
        let mut buf = link_message(7, false, None, false);
        buf[0..4].copy_from_slice(&4u32.to_ne_bytes());
        assert!(matches!(
            parse_link_messages(&buf),
            Err(MonitorError::Malformed(_))
        ));
    }

    #[test]
    fn test_drain_reads_until_would_block() {
        // Given: Two datagrams queued, the second with a truncated tail
        let mut second = link_message(7, true, Some("icdwg0"), false);
        let partial = link_message(8, true, Some("other0"), false);
        second.extend_from_slice(&partial[..partial.len() / 2]);
        let source = ScriptedSource::new(vec![
            Ok(link_message(3, false, Some("eth0"), false)),
            Err(io::ErrorKind::Interrupted.into()),
            Ok(second),
        ]);
        let mut buf = Vec::with_capacity(RECV_BUFFER_LEN);

        // When: Draining
        let records = drain(&source, &mut buf).unwrap();

        // Then: Every complete record is returned and the source is empty
        let indexes: Vec<u32> = records.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![3, 7]);
        assert!(source.script.borrow().is_empty());
    }

    #[test]
    fn test_drain_survives_overrun_and_bad_batches() {
        let source = ScriptedSource::new(vec![
            Err(io::Error::from_raw_os_error(libc::ENOBUFS)),
            Ok(error_message(-libc::EINVAL)),
            Ok(link_message(7, false, Some("icdwg0"), true)),
        ]);
        let mut buf = Vec::new();

        let records = drain(&source, &mut buf).unwrap();

        assert_eq!(
            records,
            vec![LinkRecord {
                index: 7,
                up: false,
                name: Some("icdwg0".to_string())
            }]
        );
    }

    #[test]
    fn test_drain_reports_read_failure() {
        let source = ScriptedSource::new(vec![Err(io::Error::from_raw_os_error(libc::EBADF))]);
        let mut buf = Vec::new();

        assert!(matches!(
            drain(&source, &mut buf),
            Err(MonitorError::ReadFailed(_))
        ));
    }

    #[test]
    fn test_classify_target_interface() {
        let up = LinkRecord {
            index: 7,
            up: true,
            name: Some("icdwg0".to_string()),
        };
        assert!(matches!(
            classify(&up, "icdwg0", |_| None),
            Some(Event::InterfaceUp { index: 7 })
        ));

        let down = LinkRecord { up: false, ..up };
        assert!(matches!(
            classify(&down, "icdwg0", |_| None),
            Some(Event::InterfaceDown { index: 7 })
        ));
    }

    #[test]
    fn test_classify_resolves_missing_name_by_index() {
        let up = LinkRecord {
            index: 9,
            up: true,
            name: None,
        };
        assert!(matches!(
            classify(&up, "icdwg0", |i| (i == 9).then(|| "icdwg0".to_string())),
            Some(Event::InterfaceUp { index: 9 })
        ));
        // Unresolvable up records are dropped
        assert!(classify(&up, "icdwg0", |_| None).is_none());
    }

    #[test]
    fn test_classify_drops_other_interfaces() {
        let other = LinkRecord {
            index: 2,
            up: false,
            name: Some("wlan0".to_string()),
        };
        assert!(classify(&other, "icdwg0", |_| None).is_none());
    }

    #[test]
    fn test_classify_reports_removed_interface_as_down() {
        let removed = LinkRecord {
            index: 7,
            up: false,
            name: None,
        };
        assert!(matches!(
            classify(&removed, "icdwg0", |_| None),
            Some(Event::InterfaceDown { index: 7 })
        ));
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_interval_ms: 1,
            max_interval_ms: 2,
            ..Default::default()
        };
        let mut calls = 0;
        let result: Option<()> = connect_with_retry(&policy, || {
            calls += 1;
            async { Err(MonitorError::Malformed("unavailable".to_string())) }
        })
        .await;

        assert!(result.is_none());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_connect_with_retry_recovers() {
        let policy = RetryPolicy {
            base_interval_ms: 1,
            ..Default::default()
        };
        let mut calls = 0;
        let result = connect_with_retry(&policy, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(MonitorError::Malformed("not yet".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Some(3));
    }
}
