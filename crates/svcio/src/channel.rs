//! Channels: connections bound to a service
//!
//! The socket layer is outside this crate. It hands connections over as
//! [`Connection`] trait objects and reports activity through the
//! [`ConnectionHandler`] a channel installs on `bind`. Every callback turns
//! into an event in the bound service's mailbox, with the channel id as
//! the source.
//!
//! Status moves Starting -> Running (bind) -> Stopping (graceful close) ->
//! Stopped. A graceful close arms a one-shot timer that force-closes the
//! connection if the backend has not finished by then. The connection and
//! that timer are each taken exactly once, by whichever path gets there
//! first.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use svcio_core::{kdebug, SpinLock};
use svcio_runtime::EventTimer;

use crate::codec::Codec;
use crate::event::{ServiceEvent, EVENT_BINARY, EVENT_DISCONNECT, EVENT_MSG, EVENT_SEND_OK, MSG_CLOSE};
use crate::runtime::ServiceRuntime;
use crate::service::Service;

/// A socket owned by the I/O backend
pub trait Connection: Send + Sync {
    /// Install the callbacks and start reading. False if the connection is
    /// already dead.
    fn bind(&self, handler: Arc<dyn ConnectionHandler>, keep_alive: bool, no_delay: bool) -> bool;

    /// Queue `buf`. With a completion token the backend reports
    /// `on_send_complete` once the write finishes or fails.
    fn send(&self, buf: Vec<u8>, completion: Option<u32>) -> bool;

    /// Flush pending writes, then close
    fn close(&self);

    /// Close now, dropping pending writes
    fn force_close(&self);

    /// An outbound connect that has not failed
    fn is_connecting(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    fn write_pending(&self) -> usize;

    fn write_pending_bytes(&self) -> usize;

    fn receive_buf_len(&self) -> usize;
}

/// Backend to channel callbacks
pub trait ConnectionHandler: Send + Sync {
    /// Bytes arrived; consume what is used from the front of `buf`.
    /// Returning false drops the connection.
    fn on_receive(&self, buf: &mut Vec<u8>) -> bool;

    fn on_send_complete(&self, ok: bool, token: u32);

    fn on_disconnect(&self);

    /// The socket is closed; no more callbacks except `on_free`
    fn on_close(&self);

    /// The backend released its reference
    fn on_free(&self);
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelStatus {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ChannelStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelStatus::Starting,
            1 => ChannelStatus::Running,
            2 => ChannelStatus::Stopping,
            _ => ChannelStatus::Stopped,
        }
    }
}

pub struct Channel {
    runtime: Arc<ServiceRuntime>,
    id: AtomicU32,
    status: AtomicU8,
    bound: AtomicBool,
    connection: SpinLock<Option<Arc<dyn Connection>>>,
    disconnect_timer: SpinLock<Option<Arc<EventTimer>>>,
    service: SpinLock<Option<Arc<Service>>>,
    codec: SpinLock<Option<Arc<dyn Codec>>>,
}

impl Channel {
    /// Wrap `conn` and register it. The id is 0 if the channel registry
    /// is full.
    pub fn new(runtime: &Arc<ServiceRuntime>, conn: Arc<dyn Connection>) -> Arc<Self> {
        let channel = Arc::new(Self {
            runtime: Arc::clone(runtime),
            id: AtomicU32::new(0),
            status: AtomicU8::new(ChannelStatus::Starting as u8),
            bound: AtomicBool::new(false),
            connection: SpinLock::new(Some(conn)),
            disconnect_timer: SpinLock::new(None),
            service: SpinLock::new(None),
            codec: SpinLock::new(None),
        });
        let id = runtime.channels().register(Arc::clone(&channel));
        channel.id.store(id, Ordering::Release);
        channel
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status() == ChannelStatus::Running
    }

    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.lock().clone()
    }

    pub fn set_codec(&self, codec: Option<Arc<dyn Codec>>) {
        *self.codec.lock() = codec;
    }

    fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.lock().clone()
    }

    fn running_connection(&self) -> Option<Arc<dyn Connection>> {
        if self.is_running() {
            self.connection()
        } else {
            None
        }
    }

    /// Route the connection's events into `service`
    pub fn bind(self: &Arc<Self>, service: &Arc<Service>, keep_alive: bool, no_delay: bool) -> bool {
        let Some(conn) = self.connection() else {
            return false;
        };
        // only a fresh channel can bind; a closing one stays closing
        if self
            .status
            .compare_exchange(
                ChannelStatus::Starting as u8,
                ChannelStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        *self.service.lock() = Some(Arc::clone(service));
        self.bound.store(true, Ordering::Release);

        let handler: Arc<dyn ConnectionHandler> = Arc::clone(self) as Arc<dyn ConnectionHandler>;
        if !conn.bind(handler, keep_alive, no_delay) {
            self.status
                .store(ChannelStatus::Stopped as u8, Ordering::Release);
            self.bound.store(false, Ordering::Release);
            self.service.lock().take();
            self.connection.lock().take();
            self.release_id();
            return false;
        }
        kdebug!("channel {:#x} bound to service {:#x}", self.id(), service.id());
        true
    }

    /// `timeout_ms <= 0` closes now. Otherwise close gracefully and force
    /// it after `timeout_ms`.
    pub fn close(self: &Arc<Self>, timeout_ms: i32) {
        if timeout_ms <= 0 {
            let prev = self
                .status
                .swap(ChannelStatus::Stopped as u8, Ordering::AcqRel);
            if prev != ChannelStatus::Stopped as u8 {
                kdebug!("channel {:#x} force close", self.id());
                self.cancel_disconnect_timer();
                self.force_close_connection();
            }
            return;
        }

        let advanced = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < ChannelStatus::Stopping as u8).then_some(ChannelStatus::Stopping as u8)
            })
            .is_ok();
        if !advanced {
            return;
        }
        kdebug!("channel {:#x} closing, {}ms grace", self.id(), timeout_ms);

        let weak: Weak<Channel> = Arc::downgrade(self);
        let timer = EventTimer::new(
            self.runtime.io(),
            true,
            Duration::from_millis(timeout_ms as u64),
            move || {
                if let Some(channel) = weak.upgrade() {
                    channel.on_disconnect_timeout();
                }
            },
        );
        *self.disconnect_timer.lock() = Some(Arc::clone(&timer));
        timer.start();

        if let Some(conn) = self.connection() {
            conn.close();
        }
    }

    fn on_disconnect_timeout(&self) {
        self.disconnect_timer.lock().take();
        self.status
            .store(ChannelStatus::Stopped as u8, Ordering::Release);
        self.force_close_connection();
    }

    fn cancel_disconnect_timer(&self) {
        let timer = self.disconnect_timer.lock().take();
        if let Some(timer) = timer {
            timer.stop();
        }
    }

    fn force_close_connection(&self) {
        let conn = self.connection.lock().take();
        if let Some(conn) = conn {
            conn.force_close();
        }
        // nothing will ever call on_free for a connection that was not bound
        if !self.bound.load(Ordering::Acquire) {
            self.release_id();
        }
    }

    fn release_id(&self) {
        let id = self.id.swap(0, Ordering::AcqRel);
        if id != 0 {
            self.runtime.channels().deregister(id);
        }
    }

    /// Send through the codec when one is set
    pub fn send(&self, data: &[u8], kind: u8, token: u32) -> bool {
        let Some(conn) = self.running_connection() else {
            return false;
        };
        let codec = self.codec.lock().clone();
        match codec {
            Some(codec) => codec.write(conn.as_ref(), data, kind, token),
            None => conn.send(data.to_vec(), None),
        }
    }

    pub fn send_move(&self, data: Vec<u8>, kind: u8, token: u32) -> bool {
        let Some(conn) = self.running_connection() else {
            return false;
        };
        let codec = self.codec.lock().clone();
        match codec {
            Some(codec) => codec.write_move(conn.as_ref(), data, kind, token),
            None => conn.send(data, None),
        }
    }

    /// Raw write; a non-zero token asks for a SEND_OK (or MSG|CLOSE on
    /// failure) event when the write completes
    pub fn write(&self, data: &[u8], token: u32) -> bool {
        self.write_move(data.to_vec(), token)
    }

    pub fn write_move(&self, data: Vec<u8>, token: u32) -> bool {
        let Some(conn) = self.running_connection() else {
            return false;
        };
        conn.send(data, (token != 0).then_some(token))
    }

    /// Deliver bytes to the bound service as an event from this channel
    pub fn push_service(&self, data: &[u8], kind: u8, token: u32) -> bool {
        match self.service() {
            Some(service) => service.enqueue(ServiceEvent::message(kind, self.id(), token, data)),
            None => false,
        }
    }

    pub fn push_service_move(&self, data: Vec<u8>, kind: u8, token: u32) -> bool {
        match self.service() {
            Some(service) => service.enqueue(ServiceEvent::moved(kind, self.id(), token, data)),
            None => false,
        }
    }

    fn push_signal(&self, kind: u8, token: u32) {
        if let Some(service) = self.service() {
            service.enqueue(ServiceEvent::signal(kind, self.id(), token));
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running_connection()?.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.running_connection()?.remote_addr()
    }

    pub fn write_pending(&self) -> usize {
        self.connection().map_or(0, |c| c.write_pending())
    }

    pub fn write_pending_bytes(&self) -> usize {
        self.connection().map_or(0, |c| c.write_pending_bytes())
    }

    pub fn receive_buf_len(&self) -> usize {
        self.connection().map_or(0, |c| c.receive_buf_len())
    }
}

impl ConnectionHandler for Channel {
    fn on_receive(&self, buf: &mut Vec<u8>) -> bool {
        let codec = self.codec.lock().clone();
        match codec {
            Some(codec) => codec.receive(self, buf),
            None => {
                if buf.is_empty() {
                    return true;
                }
                self.push_service_move(std::mem::take(buf), EVENT_BINARY, 0)
            }
        }
    }

    fn on_send_complete(&self, ok: bool, token: u32) {
        let kind = if ok { EVENT_SEND_OK } else { EVENT_MSG | MSG_CLOSE };
        self.push_signal(kind, token);
    }

    fn on_disconnect(&self) {
        self.push_signal(EVENT_DISCONNECT, 0);
    }

    fn on_close(&self) {
        self.connection.lock().take();
        self.cancel_disconnect_timer();
        self.status
            .store(ChannelStatus::Stopped as u8, Ordering::Release);
    }

    fn on_free(&self) {
        self.release_id();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::LengthPrefixed;
    use crate::event::{Delivery, EVENT_ACCEPT, EVENT_CONNECT};
    use crate::runtime::tests::{running_runtime, test_runtime, wait_for};
    use crate::service::ServiceHandler;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// In-memory connection recording what the channel asks of it
    #[derive(Default)]
    pub(crate) struct MockConnection {
        pub handler: SpinLock<Option<Arc<dyn ConnectionHandler>>>,
        pub sent: SpinLock<Vec<(Vec<u8>, Option<u32>)>>,
        pub closes: AtomicUsize,
        pub force_closes: AtomicUsize,
        pub refuse_bind: bool,
        pub connecting: bool,
    }

    impl MockConnection {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                connecting: true,
                ..Default::default()
            })
        }

        pub fn handler(&self) -> Arc<dyn ConnectionHandler> {
            self.handler.lock().clone().unwrap()
        }
    }

    impl Connection for MockConnection {
        fn bind(&self, handler: Arc<dyn ConnectionHandler>, _: bool, _: bool) -> bool {
            if self.refuse_bind {
                return false;
            }
            *self.handler.lock() = Some(handler);
            true
        }

        fn send(&self, buf: Vec<u8>, completion: Option<u32>) -> bool {
            self.sent.lock().push((buf, completion));
            true
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn force_close(&self) {
            self.force_closes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_connecting(&self) -> bool {
            self.connecting
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            "127.0.0.1:9000".parse().ok()
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            "10.0.0.2:51000".parse().ok()
        }

        fn write_pending(&self) -> usize {
            self.sent.lock().len()
        }

        fn write_pending_bytes(&self) -> usize {
            self.sent.lock().iter().map(|(b, _)| b.len()).sum()
        }

        fn receive_buf_len(&self) -> usize {
            0
        }
    }

    type Seen = Arc<SpinLock<Vec<(u8, u32, u32, Vec<u8>)>>>;

    fn recording_service(rt: &Arc<ServiceRuntime>) -> (Arc<Service>, Seen) {
        let seen: Seen = Arc::new(SpinLock::new(Vec::new()));
        let s = Arc::clone(&seen);
        let service = Service::new(rt);
        service.start(move |_: &Arc<Service>, ev: Delivery<'_>| {
            s.lock()
                .push((ev.kind, ev.source_id, ev.token, ev.payload.to_vec()));
            true
        });
        (service, seen)
    }

    #[test]
    fn test_unbound_channel_deregisters_on_close() {
        let (rt, _io) = test_runtime();
        let conn = MockConnection::new();
        let channel = Channel::new(&rt, conn.clone());
        let id = channel.id();
        assert_ne!(id, 0);
        assert!(svcio_core::Handle::new(id).is_channel());
        assert!(rt.channels().gain(id).is_some());
        assert_eq!(channel.status(), ChannelStatus::Starting);
        assert!(!channel.send(b"x", EVENT_BINARY, 0));

        channel.close(0);
        assert_eq!(conn.force_closes.load(Ordering::SeqCst), 1);
        assert!(rt.channels().gain(id).is_none());
        assert_eq!(channel.id(), 0);
        channel.close(0);
        assert_eq!(conn.force_closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bound_channel_forwards_events() {
        let (rt, threads) = running_runtime(1);
        let (service, seen) = recording_service(&rt);
        let conn = MockConnection::new();
        let channel = Channel::new(&rt, conn.clone());
        let id = channel.id();

        assert!(channel.bind(&service, true, true));
        assert!(channel.is_running());
        assert_eq!(channel.local_addr(), "127.0.0.1:9000".parse().ok());

        let handler = conn.handler();
        let mut inbound = b"raw bytes".to_vec();
        assert!(handler.on_receive(&mut inbound));
        assert!(inbound.is_empty());
        handler.on_send_complete(true, 5);
        handler.on_send_complete(false, 6);
        handler.on_disconnect();

        assert!(wait_for(|| seen.lock().len() == 4));
        let seen = seen.lock().clone();
        assert_eq!(seen[0], (EVENT_BINARY, id, 0, b"raw bytes".to_vec()));
        assert_eq!(seen[1], (EVENT_SEND_OK, id, 5, vec![]));
        assert_eq!(seen[2], (EVENT_MSG | MSG_CLOSE, id, 6, vec![]));
        assert_eq!(seen[3], (EVENT_DISCONNECT, id, 0, vec![]));

        assert!(channel.write(b"w", 9));
        assert!(channel.send(b"s", EVENT_BINARY, 0));
        assert_eq!(
            *conn.sent.lock(),
            vec![(b"w".to_vec(), Some(9)), (b"s".to_vec(), None)]
        );

        // backend teardown
        handler.on_close();
        assert_eq!(channel.status(), ChannelStatus::Stopped);
        handler.on_free();
        assert!(rt.channels().gain(id).is_none());

        service.stop();
        drop(threads);
    }

    #[test]
    fn test_codec_framing_both_ways() {
        let (rt, threads) = running_runtime(1);
        let (service, seen) = recording_service(&rt);
        let conn = MockConnection::new();
        let channel = Channel::new(&rt, conn.clone());
        channel.set_codec(Some(Arc::new(LengthPrefixed::new())));
        channel.bind(&service, false, false);

        let codec = LengthPrefixed::new();
        let mut inbound = codec.encode(b"one").unwrap();
        inbound.extend(codec.encode(b"two").unwrap());
        inbound.extend_from_slice(&[0, 0]);
        assert!(conn.handler().on_receive(&mut inbound));
        assert_eq!(inbound, vec![0, 0]);
        assert!(wait_for(|| seen.lock().len() == 2));
        assert_eq!(seen.lock()[0].3, b"one".to_vec());
        assert_eq!(seen.lock()[1].3, b"two".to_vec());

        assert!(channel.send(b"out", EVENT_BINARY, 0));
        assert_eq!(conn.sent.lock()[0].0, codec.encode(b"out").unwrap());

        service.stop();
        drop(threads);
    }

    #[test]
    fn test_graceful_close_forces_after_timeout() {
        let (rt, threads) = running_runtime(1);
        let (service, _seen) = recording_service(&rt);
        let conn = MockConnection::new();
        let channel = Channel::new(&rt, conn.clone());
        channel.bind(&service, false, false);

        channel.close(20);
        assert_eq!(channel.status(), ChannelStatus::Stopping);
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
        assert!(!channel.send(b"late", EVENT_BINARY, 0));

        // a second graceful close does not re-arm
        channel.close(20);
        assert_eq!(conn.closes.load(Ordering::SeqCst), 1);

        assert!(wait_for(|| conn.force_closes.load(Ordering::SeqCst) == 1));
        assert_eq!(channel.status(), ChannelStatus::Stopped);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(conn.force_closes.load(Ordering::SeqCst), 1);

        service.stop();
        drop(threads);
    }

    #[test]
    fn test_close_before_timeout_cancels_timer() {
        let (rt, threads) = running_runtime(1);
        let (service, _seen) = recording_service(&rt);
        let conn = MockConnection::new();
        let channel = Channel::new(&rt, conn.clone());
        channel.bind(&service, false, false);

        channel.close(30);
        conn.handler().on_close();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(conn.force_closes.load(Ordering::SeqCst), 0);

        service.stop();
        drop(threads);
    }

    #[test]
    fn test_refused_bind() {
        let (rt, _io) = test_runtime();
        let (service, _seen) = recording_service(&rt);
        let conn = Arc::new(MockConnection {
            refuse_bind: true,
            ..Default::default()
        });
        let channel = Channel::new(&rt, conn);
        let id = channel.id();
        assert!(!channel.bind(&service, false, false));
        assert_eq!(channel.status(), ChannelStatus::Stopped);
        assert!(rt.channels().gain(id).is_none());
    }

    #[test]
    fn test_bind_after_close_refused() {
        let (rt, _io) = test_runtime();
        let (service, _seen) = recording_service(&rt);
        let conn = MockConnection::new();
        let channel = Channel::new(&rt, conn.clone());
        let id = channel.id();

        channel.close(1000);
        assert_eq!(channel.status(), ChannelStatus::Stopping);
        assert!(!channel.bind(&service, false, false));
        assert_eq!(channel.status(), ChannelStatus::Stopping);
        assert!(conn.handler.lock().is_none());
        assert!(channel.service.lock().is_none());
        assert!(rt.channels().gain(id).is_some());

        // a bound channel cannot be bound a second time either
        let other = MockConnection::new();
        let fresh = Channel::new(&rt, other.clone());
        assert!(fresh.bind(&service, false, false));
        assert!(!fresh.bind(&service, false, false));
        assert!(fresh.is_running());

        channel.close(0);
        assert_eq!(channel.status(), ChannelStatus::Stopped);
        fresh.close(0);
    }

    #[test]
    fn test_accept_creates_channel() {
        struct Acceptor {
            accepted: Arc<SpinLock<Vec<u32>>>,
            keep: bool,
        }
        impl ServiceHandler for Acceptor {
            fn on_event(&mut self, service: &Arc<Service>, ev: Delivery<'_>) -> bool {
                if ev.kind == EVENT_ACCEPT || ev.kind == EVENT_CONNECT {
                    self.accepted.lock().push(ev.source_id);
                    if self.keep {
                        if let Some(ch) = service.runtime().channels().gain(ev.source_id) {
                            ch.bind(service, true, true);
                        }
                    }
                    return self.keep;
                }
                true
            }
        }

        let (rt, threads) = running_runtime(1);
        for keep in [true, false] {
            let accepted = Arc::new(SpinLock::new(Vec::new()));
            let service = Service::new(&rt);
            service.start(Acceptor {
                accepted: Arc::clone(&accepted),
                keep,
            });

            let conn = MockConnection::new();
            service.enqueue(ServiceEvent::connection(EVENT_ACCEPT, 1, conn.clone(), b"hello"));
            assert!(wait_for(|| accepted.lock().len() == 1));
            let channel_id = accepted.lock()[0];
            assert!(svcio_core::Handle::new(channel_id).is_channel());
            if keep {
                assert!(rt.channels().gain(channel_id).is_some());
                assert!(conn.handler.lock().is_some());
            } else {
                assert!(wait_for(|| conn.force_closes.load(Ordering::SeqCst) == 1));
                assert!(rt.channels().gain(channel_id).is_none());
            }

            // a connect that already failed reports source 0
            let failed = Arc::new(MockConnection::default());
            service.enqueue(ServiceEvent::connection(EVENT_CONNECT, 2, failed, &[]));
            assert!(wait_for(|| accepted.lock().len() == 2));
            assert_eq!(accepted.lock()[1], 0);

            service.stop();
        }
        drop(threads);
    }

    #[test]
    fn test_channel_center_ids() {
        let (rt, _io) = test_runtime();
        let a = Channel::new(&rt, MockConnection::new());
        let b = Channel::new(&rt, MockConnection::new());
        let ids = rt.channels().ids();
        assert_eq!(ids, vec![a.id(), b.id()]);
        assert!(rt.channels().gain(a.id() & !svcio_core::handle::CHANNEL_BIT).is_none());
        assert_eq!(rt.channels().clear().len(), 2);
        assert!(rt.channels().is_empty());
    }
}
