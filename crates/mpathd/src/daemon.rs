//! Daemon assembly and event loop.
//!
//! Owns the transport sockets and drives everything from one task:
//!
//! - a generic netlink socket subscribed to the `nlctrl` notify group,
//!   watching the MPTCP family appear and vanish;
//! - a generic netlink socket subscribed to the family's event group
//!   while attached;
//! - a generic netlink command socket the path manager's outbox drains
//!   onto;
//! - an rtnetlink socket feeding the network monitor.
//!
//! All dispatch, command emission, and plugin callbacks run here, on
//! the runtime's single thread; shared state needs no locking because
//! only one logical action executes at a time.

use std::net::IpAddr;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::monitor::{IfAddrMsg, IfInfoMsg, MonitorEvent, RtMsg};
use crate::netlink::codec::{rtm, take, Attrs, FrameReader, NLM_F_ACK, NLM_F_DUMP};
use crate::netlink::genl::{
    self, genl_payload, split_genl, FamilyInfo, FamilyNotification, GENL_ID_CTRL,
};
use crate::netlink::socket::rtnetlink_groups;
use crate::netlink::{NetlinkSocket, Protocol};
use crate::plugin::Registry;
use crate::pm::{event, FamilyHandle, PathManager, Pending, ReplyHandler};
use crate::policy;

/// How long the family may stay unseen before a warning is logged.
const FAMILY_WARN_DELAY: Duration = Duration::from_secs(10);

/// Delay before the single route-reachability retry.
const ROUTE_CHECK_RETRY: Duration = Duration::from_secs(1);

/// Route attribute carrying the output interface index.
const RTA_OIF: u16 = 4;

/// A deferred address announcement awaiting a usable route.
#[derive(Debug, Clone)]
struct RouteRetry {
    index: u32,
    addr: IpAddr,
    due: Instant,
}

/// What woke the event loop.
enum Wake {
    Shutdown,
    Watch(Vec<u8>),
    Events(Vec<u8>),
    Route(Vec<u8>),
    WarnTimer,
    RouteRetry,
}

/// The assembled daemon.
pub struct Daemon {
    pm: PathManager,
    plugins: Registry,
    /// Command socket; outbox requests and their replies.
    cmd: NetlinkSocket,
    /// Event socket; member of the family's event group while attached.
    events: NetlinkSocket,
    /// Control socket; member of the nlctrl notify group.
    watch: NetlinkSocket,
    /// rtnetlink socket; link and address multicast.
    route: NetlinkSocket,
    /// Armed while the family has not been seen.
    warn_deadline: Option<Instant>,
    /// Addresses whose announcement awaits a route re-check.
    route_retries: Vec<RouteRetry>,
    /// Startup events replayed on the first loop iteration.
    replay: Vec<MonitorEvent>,
}

impl Daemon {
    /// Construct the daemon: probe the kernel dialect, open the
    /// transports, load plugins, and seed the interface table.
    pub async fn new(config: Config) -> Result<Self> {
        let mut pm = PathManager::new(&config)?;

        let cmd = NetlinkSocket::new(Protocol::Generic)?;
        let events = NetlinkSocket::new(Protocol::Generic)?;
        let mut watch = NetlinkSocket::new(Protocol::Generic)?;

        // Family appearance/disappearance notifications.
        let nlctrl = genl::resolve_family(&watch, "nlctrl").await?;
        let notify_group = nlctrl
            .mcast_group("notify")
            .ok_or_else(|| Error::InvalidMessage("nlctrl family lacks a notify group".into()))?;
        watch.add_membership(notify_group)?;

        // Seed the interface table before subscribing, so dump replies
        // and multicast events never interleave.
        let seed_socket = NetlinkSocket::new(Protocol::Route)?;
        let mut seed_events = Vec::new();
        for (msg_type, header) in [
            (rtm::GETLINK, IfInfoMsg::default().as_bytes().to_vec()),
            (rtm::GETADDR, IfAddrMsg::default().as_bytes().to_vec()),
        ] {
            for (reply_type, payload) in seed_socket.request(msg_type, NLM_F_DUMP, &header).await? {
                seed_events.extend(pm.interfaces_mut().handle_message(reply_type, &payload));
            }
        }
        drop(seed_socket);

        let mut route = NetlinkSocket::new(Protocol::Route)?;
        route.add_membership(rtnetlink_groups::RTNLGRP_LINK)?;
        route.add_membership(rtnetlink_groups::RTNLGRP_IPV4_IFADDR)?;
        route.add_membership(rtnetlink_groups::RTNLGRP_IPV6_IFADDR)?;

        let builtins = policy::builtin_descriptors();
        let plugins = Registry::load(
            &builtins,
            config.plugin_dir.as_deref(),
            &config.load_plugins,
            config.default_plugin.as_deref(),
        )?;

        let replay = if pm.interfaces().notify_flags().existing {
            info!(count = seed_events.len(), "replaying existing interface state");
            seed_events
        } else {
            Vec::new()
        };

        let mut daemon = Daemon {
            pm,
            plugins,
            cmd,
            events,
            watch,
            route,
            warn_deadline: None,
            route_retries: Vec::new(),
            replay,
        };

        // Initial family probe; when absent, the watch socket picks the
        // family up later and the warning timer covers the silence.
        let family_name = daemon.pm.dialect().family_name();
        let probe = genl::resolve_family(&daemon.cmd, family_name).await;
        match probe {
            Ok(info) => daemon.attach_family(info),
            Err(Error::FamilyNotFound { .. }) => {
                debug!(family = family_name, "MPTCP family not present yet");
                daemon.warn_deadline = Some(Instant::now() + FAMILY_WARN_DELAY);
            }
            Err(e) => return Err(e),
        }

        Ok(daemon)
    }

    /// Whether the kernel MPTCP family is currently attached.
    pub fn is_ready(&self) -> bool {
        self.pm.is_ready()
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(&mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        for event in std::mem::take(&mut self.replay) {
            self.deliver_monitor_event(event).await;
        }

        info!("mpathd running");

        loop {
            self.flush_outbox().await;

            let wake = tokio::select! {
                _ = sigint.recv() => Wake::Shutdown,
                _ = sigterm.recv() => Wake::Shutdown,
                r = self.watch.recv() => Wake::Watch(r?),
                r = self.events.recv() => Wake::Events(r?),
                r = self.route.recv() => Wake::Route(r?),
                _ = maybe_sleep(self.warn_deadline) => Wake::WarnTimer,
                _ = maybe_sleep(self.next_route_retry()) => Wake::RouteRetry,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Watch(buf) => self.handle_watch(&buf),
                Wake::Events(buf) => self.handle_events(&buf),
                Wake::Route(buf) => self.handle_route(&buf).await,
                Wake::WarnTimer => {
                    warn!(
                        family = self.pm.dialect().family_name(),
                        "MPTCP generic netlink family has not appeared"
                    );
                    self.warn_deadline = None;
                }
                Wake::RouteRetry => self.handle_route_retries().await,
            }
        }

        info!("shutting down");
        self.shutdown();
        Ok(())
    }

    /// Attach to a freshly resolved family.
    fn attach_family(&mut self, info: FamilyInfo) {
        let group_name = self.pm.dialect().event_group();
        let Some(group) = info.mcast_group(group_name) else {
            warn!(group = group_name, "family lacks its event multicast group");
            return;
        };
        if let Err(e) = self.events.add_membership(group) {
            warn!(error = %e, "unable to join event multicast group");
            return;
        }
        self.warn_deadline = None;
        self.pm.attach(FamilyHandle {
            id: info.id,
            event_group: group,
        });
    }

    /// Tear the family attachment down and re-arm the warning timer.
    fn detach_family(&mut self) {
        if let Some(handle) = self.pm.family() {
            if let Err(e) = self.events.drop_membership(handle.event_group) {
                debug!(error = %e, "dropping event group membership failed");
            }
        }
        self.pm.detach();
        self.warn_deadline = Some(Instant::now() + FAMILY_WARN_DELAY);
    }

    /// Process nlctrl notifications.
    fn handle_watch(&mut self, buf: &[u8]) {
        for result in FrameReader::new(buf) {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "malformed control message");
                    continue;
                }
            };
            if frame.msg_type != GENL_ID_CTRL {
                continue;
            }

            match genl::parse_notification(frame.payload) {
                Ok(Some(FamilyNotification::New { name, info }))
                    if name == self.pm.dialect().family_name() =>
                {
                    if !self.pm.is_ready() {
                        self.attach_family(info);
                    }
                }
                Ok(Some(FamilyNotification::Del { name }))
                    if name == self.pm.dialect().family_name() =>
                {
                    self.detach_family();
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "undecodable control notification"),
            }
        }
    }

    /// Process MPTCP events from the multicast group.
    fn handle_events(&mut self, buf: &[u8]) {
        let Some(family) = self.pm.family() else {
            return;
        };

        for result in FrameReader::new(buf) {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "malformed event message");
                    continue;
                }
            };
            if frame.msg_type != family.id {
                continue;
            }
            let Some((cmd, attrs)) = split_genl(frame.payload) else {
                warn!("event payload shorter than a GENL header");
                continue;
            };

            match event::decode(cmd, attrs) {
                Ok(Some(ev)) => {
                    debug!(event = ev.name(), token = %ev.token(), "dispatching MPTCP event");
                    self.plugins.dispatch(&mut self.pm, &ev);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "dropping undecodable MPTCP event"),
            }
        }
    }

    /// Process rtnetlink link/address multicast.
    async fn handle_route(&mut self, buf: &[u8]) {
        let mut events = Vec::new();
        for result in FrameReader::new(buf) {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "malformed rtnetlink message");
                    continue;
                }
            };
            events.extend(
                self.pm
                    .interfaces_mut()
                    .handle_message(frame.msg_type, frame.payload),
            );
        }

        for event in events {
            self.deliver_monitor_event(event).await;
        }
    }

    /// Fan a monitor event out to the plugins, applying the
    /// `check_route` gate to fresh addresses.
    async fn deliver_monitor_event(&mut self, event: MonitorEvent) {
        if self.pm.interfaces().notify_flags().check_route {
            if let MonitorEvent::NewLocalAddress(iface, addr) = &event {
                match check_default_route(addr, iface.index).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        debug!(%addr, "no default route yet; deferring announcement");
                        self.route_retries.push(RouteRetry {
                            index: iface.index,
                            addr: *addr,
                            due: Instant::now() + ROUTE_CHECK_RETRY,
                        });
                        return;
                    }
                }
            }
        }

        self.plugins.notify(&mut self.pm, &event);
    }

    fn next_route_retry(&self) -> Option<Instant> {
        self.route_retries.iter().map(|r| r.due).min()
    }

    /// Re-check deferred addresses once; drop the ones still without a
    /// usable route.
    async fn handle_route_retries(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.route_retries.retain(|r| {
            if r.due <= now {
                due.push(r.clone());
                false
            } else {
                true
            }
        });

        for retry in due {
            let Some(iface) = self.pm.interfaces().get(retry.index).cloned() else {
                continue;
            };
            if !iface.addrs.contains(&retry.addr) {
                continue;
            }
            match check_default_route(&retry.addr, retry.index).await {
                Ok(true) => {
                    self.plugins
                        .notify(&mut self.pm, &MonitorEvent::NewLocalAddress(iface, retry.addr));
                }
                Ok(false) | Err(_) => {
                    debug!(addr = %retry.addr, "still no default route; dropping announcement");
                }
            }
        }
    }

    /// Drain the path manager's outbox onto the command socket.
    ///
    /// Emission failures are logged, not propagated: the command's
    /// caller already returned, and a lost command leaves no
    /// half-applied daemon state.
    async fn flush_outbox(&mut self) {
        while let Some(pending) = self.pm.take_pending() {
            let command = pending.command;
            if let Err(e) = self.execute(pending).await {
                warn!(command, error = %e, "path management command failed");
            }
        }
    }

    /// Emit one queued request and route its reply.
    async fn execute(&mut self, pending: Pending) -> Result<()> {
        let family = self.pm.family().ok_or(Error::NotReady)?;
        let request = pending.request;

        let flags = if request.dump { NLM_F_DUMP } else { NLM_F_ACK };
        let payload = genl_payload(request.cmd, request.version, &request.attrs);

        match pending.reply {
            ReplyHandler::Ack => {
                match self.cmd.request(family.id, flags, &payload).await {
                    Ok(_) => debug!(command = pending.command, "command acknowledged"),
                    Err(e) => {
                        warn!(command = pending.command, error = %e, "kernel rejected command")
                    }
                }
                Ok(())
            }
            ReplyHandler::Endpoints { mut record, done } => {
                let replies = self.cmd.request(family.id, flags, &payload).await?;
                for (_, reply) in &replies {
                    match self.pm.dialect().parse_endpoint(reply) {
                        Ok(Some(info)) => record(&mut self.pm, &info),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "undecodable endpoint record"),
                    }
                }
                // The completion continuation runs exactly once, with
                // or without records.
                done(&mut self.pm);
                Ok(())
            }
            ReplyHandler::Limits { done } => {
                let replies = self.cmd.request(family.id, flags, &payload).await?;
                let mut limits = Vec::new();
                for (_, reply) in &replies {
                    limits.extend(self.pm.dialect().parse_limits(reply)?);
                }
                done(&mut self.pm, &limits);
                Ok(())
            }
        }
    }

    /// Tear everything down in dependency order.
    fn shutdown(&mut self) {
        self.plugins.unload(&mut self.pm);
        self.detach_family();
        self.warn_deadline = None;
        self.route_retries.clear();
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// True when a default route exists through interface `oif` for the
/// address family of `addr`.
///
/// Uses a short-lived socket so dump replies never interleave with the
/// monitor's multicast stream.
async fn check_default_route(addr: &IpAddr, oif: u32) -> Result<bool> {
    let socket = NetlinkSocket::new(Protocol::Route)?;

    let header = RtMsg {
        rtm_family: match addr {
            IpAddr::V4(_) => libc::AF_INET as u8,
            IpAddr::V6(_) => libc::AF_INET6 as u8,
        },
        ..Default::default()
    };

    let replies = socket
        .request(rtm::GETROUTE, NLM_F_DUMP, header.as_bytes())
        .await?;

    for (msg_type, payload) in replies {
        if msg_type != rtm::NEWROUTE {
            continue;
        }
        let Ok((route, attrs)) = RtMsg::read_from_prefix(&payload) else {
            continue;
        };
        // A default route: no destination prefix.
        if route.rtm_dst_len != 0 {
            continue;
        }
        for (attr_type, attr_payload) in Attrs::new(attrs) {
            if attr_type == RTA_OIF && take::u32_ne(attr_payload).ok() == Some(oif) {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtmsg_layout() {
        assert_eq!(std::mem::size_of::<RtMsg>(), 12);
    }

    #[test]
    fn test_route_retry_scheduling() {
        let now = Instant::now();
        let retries = [
            RouteRetry {
                index: 1,
                addr: "192.0.2.1".parse().unwrap(),
                due: now + Duration::from_secs(5),
            },
            RouteRetry {
                index: 2,
                addr: "192.0.2.2".parse().unwrap(),
                due: now + Duration::from_secs(1),
            },
        ];
        let next = retries.iter().map(|r| r.due).min().unwrap();
        assert_eq!(next, now + Duration::from_secs(1));
    }
}
