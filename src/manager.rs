//! VNet manager: address allocation, TCP connection handling and lifecycle.

use crate::config::Config;
use crate::error::{VnetError, VnetResult};
use crate::forward::{forward_stack_to_tun, forward_tun_to_stack};
use crate::stack::stream::{ConnCloser, VnetStream};
use crate::stack::{create_stack, Netstack, StackHandles, TcpForwarderRequest};
use crate::tun::TunDevice;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Suffix 0 is reserved; suffix 1 is the NIC's own address. Handler
/// assignments start at 2.
const NIC_ADDRESS_SUFFIX: u32 = 1;

/// Capability for terminating TCP connections addressed to a bound VNet
/// address.
#[async_trait]
pub trait TcpHandler: Send + Sync + 'static {
    /// Handle one inbound TCP connection.
    ///
    /// `cancel` fires when the peer hangs up, the VNet shuts down, or the
    /// connection is otherwise torn down. Consuming `connector` completes the
    /// TCP handshake and yields the byte stream; returning without consuming
    /// it refuses the connection, so the client sees a reset.
    async fn handle_tcp(
        &self,
        cancel: CancellationToken,
        connector: TcpConnector,
    ) -> VnetResult<()>;
}

/// One-shot stream producer handed to [`TcpHandler::handle_tcp`].
///
/// [`connect`](TcpConnector::connect) consumes the producer, so a connection
/// can be accepted at most once.
pub struct TcpConnector {
    request: TcpForwarderRequest,
    shared: Arc<Shared>,
    scope: CancellationToken,
}

impl TcpConnector {
    /// Complete the TCP handshake and return the connection's byte stream.
    ///
    /// Also arms the per-connection supervisor: the connection is torn down
    /// promptly on peer hang-up, transport error, or VNet shutdown.
    pub async fn connect(self) -> VnetResult<VnetStream> {
        let id = self.request.id();
        let conn = self.request.create_endpoint().await?;

        let closed = CancellationToken::new();
        let closer = ConnCloser::new(conn.handle, conn.cmds, conn.wake, closed.clone());
        let stream = VnetStream::new(id, conn.read_rx, conn.write_tx, closer.clone());

        let peer_events = conn.peer_events;
        let scope = self.scope;
        let destroyed = self.shared.destroyed.clone();
        self.shared.tracker.spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {
                    // Stream already being closed by the handler.
                    return;
                }
                _ = peer_events.cancelled() => {
                    log::debug!("Got HUP or ERR, closing TCP connection {id}.");
                }
                _ = destroyed.cancelled() => {
                    log::debug!("VNet is being destroyed, closing TCP connection {id}.");
                }
            }
            scope.cancel();
            closer.close();
        });

        Ok(stream)
    }
}

struct State {
    tcp_handlers: HashMap<IpAddr, Arc<dyn TcpHandler>>,
    last_assigned_suffix: u32,
}

struct Shared {
    ipv6_prefix: Ipv6Addr,
    state: RwLock<State>,
    /// Tracks every task the manager spawns; `run` waits for it to drain.
    tracker: TaskTracker,
    /// The shutdown signal: fires once when the VNet starts tearing down.
    destroyed: CancellationToken,
}

impl Shared {
    fn lookup_tcp_handler(&self, addr: IpAddr) -> Option<Arc<dyn TcpHandler>> {
        self.state.read().unwrap().tcp_handlers.get(&addr).cloned()
    }

    /// Entry point for every SYN the stack intercepts. Runs the per-attempt
    /// protocol in a tracked task; the request's drop guard ensures exactly
    /// one completion.
    fn handle_tcp(shared: &Arc<Shared>, request: TcpForwarderRequest) {
        if shared.destroyed.is_cancelled() {
            // No new connections once shutdown has begun; dropping the
            // request resets the attempt.
            return;
        }
        let shared = shared.clone();
        let tracker = shared.tracker.clone();
        tracker.spawn(async move {
            let id = request.id();
            let scope = shared.destroyed.child_token();
            let _scope_guard = scope.clone().drop_guard();
            log::debug!("Handling TCP connection {id}.");

            let handler = match shared.lookup_tcp_handler(id.local.ip()) {
                Some(handler) => handler,
                None => {
                    log::debug!("{}.", VnetError::NoHandler(id.local.ip()));
                    return;
                }
            };

            let connector = TcpConnector {
                request,
                shared: shared.clone(),
                scope: scope.clone(),
            };
            match handler.handle_tcp(scope.clone(), connector).await {
                Ok(()) => {}
                Err(e) if e.is_canceled() => {
                    log::debug!("TCP connection handler {id} returned early: canceled.");
                }
                Err(e) => {
                    log::debug!("Error handling TCP connection {id}: {e}.");
                }
            }
            log::debug!("Finished handling TCP connection {id}.");
        });
    }
}

struct RunIo {
    frames_out: mpsc::Receiver<Vec<u8>>,
    driver: tokio::task::JoinHandle<()>,
}

/// Holds configuration and state for the VNet.
///
/// Create one with [`Manager::new`], bind handlers with
/// [`bind_handler`](Manager::bind_handler), then call
/// [`run`](Manager::run) to start the datapath.
pub struct Manager {
    shared: Arc<Shared>,
    tun: Arc<dyn TunDevice>,
    netstack: Netstack,
    frames_in: mpsc::Sender<Vec<u8>>,
    run_io: Mutex<Option<RunIo>>,
}

impl Manager {
    /// Create a new VNet manager. Takes ownership of `config.tun` and closes
    /// it before [`run`](Manager::run) returns.
    pub async fn new(config: Config) -> VnetResult<Self> {
        config.check()?;

        let shared = Arc::new(Shared {
            ipv6_prefix: config.ipv6_prefix,
            state: RwLock::new(State {
                tcp_handlers: HashMap::new(),
                last_assigned_suffix: NIC_ADDRESS_SUFFIX,
            }),
            tracker: TaskTracker::new(),
            destroyed: CancellationToken::new(),
        });

        let forward = {
            let shared = shared.clone();
            Box::new(move |request: TcpForwarderRequest| Shared::handle_tcp(&shared, request))
        };
        let nic_addr = ipv6_with_suffix(config.ipv6_prefix, NIC_ADDRESS_SUFFIX);
        let StackHandles {
            netstack,
            frames_in,
            frames_out,
            driver,
        } = create_stack(nic_addr, forward)?;
        // The stack's internal dispatch runs from construction; `run` joins
        // it during teardown.
        let driver = tokio::spawn(driver.run());
        netstack.add_protocol_address(IpAddr::V6(nic_addr)).await?;

        Ok(Self {
            shared,
            tun: config.tun,
            netstack,
            frames_in,
            run_io: Mutex::new(Some(RunIo { frames_out, driver })),
        })
    }

    /// The IPv6 prefix all assigned addresses share.
    pub fn ipv6_prefix(&self) -> Ipv6Addr {
        self.shared.ipv6_prefix
    }

    /// Assign the next free VNet address to `handler` and register it with
    /// the network stack. The registration is acknowledged by the stack
    /// before the address is returned, so any SYN delivered afterwards
    /// resolves to the handler.
    pub async fn bind_handler(&self, handler: Arc<dyn TcpHandler>) -> VnetResult<Ipv6Addr> {
        if self.shared.destroyed.is_cancelled() {
            return Err(VnetError::Canceled);
        }

        let addr = {
            let mut state = self.shared.state.write().unwrap();
            let suffix = state
                .last_assigned_suffix
                .checked_add(1)
                .ok_or_else(|| VnetError::bad_parameter("IPv6 suffix space exhausted"))?;
            state.last_assigned_suffix = suffix;

            let addr = ipv6_with_suffix(self.shared.ipv6_prefix, suffix);
            state.tcp_handlers.insert(IpAddr::V6(addr), handler);
            addr
        };
        // Best-effort consistency: on registration failure the table entry
        // stays and the caller treats the error as fatal.
        self.netstack.add_protocol_address(IpAddr::V6(addr)).await?;

        Ok(addr)
    }

    /// Run the VNet. Blocks until `cancel` fires (or a fatal datapath error
    /// occurs), then tears down in order: shutdown signal, link endpoint,
    /// TUN device, outstanding work, network stack.
    pub async fn run(&self, cancel: CancellationToken) -> VnetResult<()> {
        log::info!("Running VNet with IPv6 prefix {}.", self.shared.ipv6_prefix);

        let RunIo {
            frames_out,
            driver: driver_task,
        } = self
            .run_io
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| VnetError::bad_parameter("VNet manager is already running"))?;

        let child = cancel.child_token();

        // The forwarder pair. Each loop cancels the child token when it
        // exits, so a fault in one brings down the other via the watcher.
        let outbound = {
            let tun = self.tun.clone();
            let child = child.clone();
            tokio::spawn(async move {
                let result = forward_stack_to_tun(frames_out, tun, child.clone()).await;
                child.cancel();
                result
            })
        };
        let inbound = {
            let tun = self.tun.clone();
            let frames_in = self.frames_in.clone();
            let destroyed = self.shared.destroyed.clone();
            let child = child.clone();
            tokio::spawn(async move {
                let result = forward_tun_to_stack(tun, frames_in, destroyed).await;
                child.cancel();
                result
            })
        };

        // Shutdown watcher: fire the shutdown signal, close the link
        // endpoint, close the TUN device.
        let watcher = {
            let child = child.clone();
            let destroyed = self.shared.destroyed.clone();
            let netstack = self.netstack.clone();
            let tun = self.tun.clone();
            tokio::spawn(async move {
                child.cancelled().await;

                // In-flight connections start terminating now.
                destroyed.cancel();

                // Unblocks the forwarders if they are not already done.
                netstack.close_endpoint();
                tun.close()
                    .await
                    .map_err(|e| VnetError::io_with_source("closing TUN device", e))
            })
        };

        let mut errors = Vec::new();
        for task in [outbound, inbound, watcher] {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(VnetError::stack_with_source("VNet task panicked", e)),
            }
        }

        // Wait for all connections and handler tasks to clean themselves up.
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        // Now the network stack can be destroyed; this releases all pending
        // packets and transport state.
        self.netstack.destroy();
        if let Err(e) = driver_task.await {
            errors.push(VnetError::stack_with_source(
                "network stack driver panicked",
                e,
            ));
        }

        // A cancellation after intentional shutdown is the expected exit
        // path, not an error.
        errors.retain(|e| !e.is_canceled());
        match VnetError::aggregate(errors) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Overwrite the last four bytes of `prefix` with the big-endian encoding of
/// `suffix`. Bytes 8-11 of the interface ID stay zero.
fn ipv6_with_suffix(prefix: Ipv6Addr, suffix: u32) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[12..16].copy_from_slice(&suffix.to_be_bytes());
    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::testutil::{
        ack_frame, data_frame, fin_frame, parse_tcp_frame, syn_frame, ParsedTcpFrame,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const IO_TIMEOUT: Duration = Duration::from_secs(5);

    fn prefix() -> Ipv6Addr {
        "fd00::".parse().unwrap()
    }

    fn client() -> Ipv6Addr {
        "fd00::aaaa".parse().unwrap()
    }

    struct TestTun {
        to_vnet: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
        from_vnet: mpsc::Sender<Vec<u8>>,
        closed: CancellationToken,
        close_count: AtomicUsize,
    }

    #[async_trait]
    impl TunDevice for TestTun {
        async fn read(
            &self,
            bufs: &mut [Vec<u8>],
            sizes: &mut [usize],
            offset: usize,
        ) -> VnetResult<usize> {
            let mut rx = self.to_vnet.lock().await;
            tokio::select! {
                _ = self.closed.cancelled() => Err(VnetError::io("TUN device closed")),
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        bufs[0][offset..offset + frame.len()].copy_from_slice(&frame);
                        sizes[0] = frame.len();
                        Ok(1)
                    }
                    None => Err(VnetError::io("TUN input exhausted")),
                },
            }
        }

        async fn write(&self, bufs: &mut [Vec<u8>], offset: usize) -> VnetResult<usize> {
            if self.closed.is_cancelled() {
                return Err(VnetError::io("TUN device closed"));
            }
            for buf in bufs.iter() {
                let _ = self.from_vnet.send(buf[offset..].to_vec()).await;
            }
            Ok(bufs.len())
        }

        fn batch_size(&self) -> usize {
            4
        }

        async fn close(&self) -> VnetResult<()> {
            self.close_count.fetch_add(1, Ordering::SeqCst);
            self.closed.cancel();
            Ok(())
        }
    }

    fn test_tun() -> (Arc<TestTun>, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (to_tx, to_rx) = mpsc::channel(2048);
        let (from_tx, from_rx) = mpsc::channel(2048);
        let tun = Arc::new(TestTun {
            to_vnet: tokio::sync::Mutex::new(to_rx),
            from_vnet: from_tx,
            closed: CancellationToken::new(),
            close_count: AtomicUsize::new(0),
        });
        (tun, to_tx, from_rx)
    }

    struct Vnet {
        manager: Arc<Manager>,
        root: CancellationToken,
        run: tokio::task::JoinHandle<VnetResult<()>>,
        to_vnet: mpsc::Sender<Vec<u8>>,
        from_vnet: mpsc::Receiver<Vec<u8>>,
        tun: Arc<TestTun>,
    }

    impl Vnet {
        async fn start() -> Self {
            let (tun, to_vnet, from_vnet) = test_tun();
            let manager = Arc::new(
                Manager::new(Config {
                    tun: tun.clone(),
                    ipv6_prefix: prefix(),
                })
                .await
                .unwrap(),
            );
            let root = CancellationToken::new();
            let run = {
                let manager = manager.clone();
                let token = root.clone();
                tokio::spawn(async move { manager.run(token).await })
            };
            Self {
                manager,
                root,
                run,
                to_vnet,
                from_vnet,
                tun,
            }
        }

        async fn send(&self, frame: Vec<u8>) {
            self.to_vnet.send(frame).await.unwrap();
        }

        /// Next TCP frame emitted through the TUN.
        async fn expect_tcp(&mut self) -> ParsedTcpFrame {
            timeout(IO_TIMEOUT, async {
                loop {
                    let frame = self.from_vnet.recv().await.expect("TUN write side open");
                    if let Some(tcp) = parse_tcp_frame(&frame) {
                        return tcp;
                    }
                }
            })
            .await
            .expect("timed out waiting for a TCP frame")
        }

        /// Next TCP frame matching `want`.
        async fn expect_tcp_matching(
            &mut self,
            want: impl Fn(&ParsedTcpFrame) -> bool,
        ) -> ParsedTcpFrame {
            timeout(IO_TIMEOUT, async {
                loop {
                    let frame = self.from_vnet.recv().await.expect("TUN write side open");
                    if let Some(tcp) = parse_tcp_frame(&frame) {
                        if want(&tcp) {
                            return tcp;
                        }
                    }
                }
            })
            .await
            .expect("timed out waiting for a matching TCP frame")
        }

        /// Cancel the root token and wait for `run` to return.
        async fn shutdown(self) -> (VnetResult<()>, usize) {
            self.root.cancel();
            let result = timeout(IO_TIMEOUT, self.run)
                .await
                .expect("run did not return after cancellation")
                .expect("run task panicked");
            (result, self.tun.close_count.load(Ordering::SeqCst))
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl TcpHandler for EchoHandler {
        async fn handle_tcp(
            &self,
            _cancel: CancellationToken,
            connector: TcpConnector,
        ) -> VnetResult<()> {
            let mut stream = connector.connect().await?;
            let mut buf = vec![0u8; 2048];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                stream.write_all(&buf[..n]).await?;
            }
        }
    }

    /// Counts invocations, never touches the connector, parks until its
    /// scope is cancelled.
    struct ParkHandler {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TcpHandler for ParkHandler {
        async fn handle_tcp(
            &self,
            cancel: CancellationToken,
            connector: TcpConnector,
        ) -> VnetResult<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            drop(connector);
            Err(VnetError::Canceled)
        }
    }

    #[tokio::test]
    async fn refused_connection_to_unbound_address() {
        let mut vnet = Vnet::start().await;

        let dst: Ipv6Addr = "fd00::2".parse().unwrap();
        vnet.send(syn_frame((client(), 40000), (dst, 80), 100)).await;

        let reply = vnet.expect_tcp().await;
        assert!(reply.rst, "expected a reset, got {:?}", reply.payload);
        assert_eq!(reply.src, (dst, 80));
        assert_eq!(reply.dst, (client(), 40000));

        let (result, closes) = vnet.shutdown().await;
        result.unwrap();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn echo_handler_round_trip() {
        let mut vnet = Vnet::start().await;
        let addr = vnet.manager.bind_handler(Arc::new(EchoHandler)).await.unwrap();
        assert_eq!(addr, "fd00::2".parse::<Ipv6Addr>().unwrap());

        let c = (client(), 40001);
        let s = (addr, 7);

        vnet.send(syn_frame(c, s, 1000)).await;
        let synack = vnet.expect_tcp_matching(|t| t.syn).await;
        assert!(synack.ack);
        assert_eq!(synack.ack_number, 1001);
        let srv_seq = synack.seq;

        vnet.send(ack_frame(c, s, 1001, srv_seq.wrapping_add(1))).await;
        vnet.send(data_frame(c, s, 1001, srv_seq.wrapping_add(1), b"hello")).await;

        let echoed = vnet.expect_tcp_matching(|t| !t.payload.is_empty()).await;
        assert_eq!(echoed.payload, b"hello");
        assert_eq!(echoed.seq, srv_seq.wrapping_add(1));

        // Acknowledge the echo, then close from the client side.
        vnet.send(ack_frame(c, s, 1006, srv_seq.wrapping_add(6))).await;
        vnet.send(fin_frame(c, s, 1006, srv_seq.wrapping_add(6))).await;

        // The handler sees EOF and drops the stream; the endpoint finishes
        // the close handshake.
        let fin = vnet.expect_tcp_matching(|t| t.fin).await;
        vnet.send(ack_frame(c, s, 1007, fin.seq.wrapping_add(1))).await;

        let (result, closes) = vnet.shutdown().await;
        result.unwrap();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn peer_close_cancels_the_handler_scope() {
        let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
        let (canceled_tx, mut canceled_rx) = mpsc::unbounded_channel();

        struct HoldHandler {
            connected: mpsc::UnboundedSender<()>,
            canceled: mpsc::UnboundedSender<()>,
        }

        #[async_trait]
        impl TcpHandler for HoldHandler {
            async fn handle_tcp(
                &self,
                cancel: CancellationToken,
                connector: TcpConnector,
            ) -> VnetResult<()> {
                let mut stream = connector.connect().await?;
                let _ = self.connected.send(());
                let mut buf = [0u8; 64];
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            let _ = self.canceled.send(());
                            return Err(VnetError::Canceled);
                        }
                        result = stream.read(&mut buf) => {
                            if result? == 0 {
                                // Peer is gone; wait for the supervisor to
                                // cancel the scope.
                                cancel.cancelled().await;
                                let _ = self.canceled.send(());
                                return Err(VnetError::Canceled);
                            }
                        }
                    }
                }
            }
        }

        let mut vnet = Vnet::start().await;
        let addr = vnet
            .manager
            .bind_handler(Arc::new(HoldHandler {
                connected: connected_tx,
                canceled: canceled_tx,
            }))
            .await
            .unwrap();

        let c = (client(), 40002);
        let s = (addr, 443);
        vnet.send(syn_frame(c, s, 5000)).await;
        let synack = vnet.expect_tcp_matching(|t| t.syn).await;
        vnet.send(ack_frame(c, s, 5001, synack.seq.wrapping_add(1))).await;

        timeout(IO_TIMEOUT, connected_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // Client hangs up.
        vnet.send(fin_frame(c, s, 5001, synack.seq.wrapping_add(1))).await;
        timeout(IO_TIMEOUT, canceled_rx.recv())
            .await
            .expect("handler scope was not cancelled")
            .unwrap();

        let (result, closes) = vnet.shutdown().await;
        result.unwrap();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn shutdown_tears_down_live_connections() {
        let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
        let (released_tx, mut released_rx) = mpsc::unbounded_channel();

        struct StickyHandler {
            connected: mpsc::UnboundedSender<()>,
            released: mpsc::UnboundedSender<()>,
        }

        #[async_trait]
        impl TcpHandler for StickyHandler {
            async fn handle_tcp(
                &self,
                cancel: CancellationToken,
                connector: TcpConnector,
            ) -> VnetResult<()> {
                let stream = connector.connect().await?;
                let _ = self.connected.send(());
                cancel.cancelled().await;
                stream.close();
                let _ = self.released.send(());
                Ok(())
            }
        }

        let mut vnet = Vnet::start().await;
        let addr = vnet
            .manager
            .bind_handler(Arc::new(StickyHandler {
                connected: connected_tx,
                released: released_tx,
            }))
            .await
            .unwrap();

        let c = (client(), 40003);
        let s = (addr, 8080);
        vnet.send(syn_frame(c, s, 9000)).await;
        let synack = vnet.expect_tcp_matching(|t| t.syn).await;
        vnet.send(ack_frame(c, s, 9001, synack.seq.wrapping_add(1))).await;

        timeout(IO_TIMEOUT, connected_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let (result, closes) = vnet.shutdown().await;
        result.unwrap();
        assert_eq!(closes, 1);
        timeout(IO_TIMEOUT, released_rx.recv())
            .await
            .expect("handler was not released at shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_silently() {
        let mut vnet = Vnet::start().await;

        // First nibble 0x0: neither IPv4 nor IPv6.
        vnet.send(vec![0x05, 0xde, 0xad, 0xbe, 0xef]).await;

        // The datapath keeps running: a follow-up SYN still draws a reset.
        let dst: Ipv6Addr = "fd00::2".parse().unwrap();
        vnet.send(syn_frame((client(), 40004), (dst, 80), 1)).await;
        let reply = vnet.expect_tcp().await;
        assert!(reply.rst);

        let (result, _) = vnet.shutdown().await;
        result.unwrap();
    }

    #[tokio::test]
    async fn tun_read_fault_surfaces_as_io_error() {
        let vnet = Vnet::start().await;

        // Dropping the host-side sender makes the next TUN read fail while
        // the VNet is still live.
        drop(vnet.to_vnet);

        let result = timeout(IO_TIMEOUT, vnet.run)
            .await
            .expect("run did not return after TUN fault")
            .expect("run task panicked");
        let err = result.unwrap_err();
        assert!(matches!(err, VnetError::Io(_)), "got {err}");
        assert_eq!(vnet.tun.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_syns_invoke_the_handler_once() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut vnet = Vnet::start().await;
        let addr = vnet
            .manager
            .bind_handler(Arc::new(ParkHandler {
                invocations: invocations.clone(),
            }))
            .await
            .unwrap();

        let c = (client(), 40005);
        let s = (addr, 22);
        vnet.send(syn_frame(c, s, 7000)).await;
        vnet.send(syn_frame(c, s, 7000)).await;
        vnet.send(syn_frame(c, s, 7000)).await;

        // Nudge the datapath with an unrelated SYN so we know the duplicates
        // have been processed.
        let unbound: Ipv6Addr = "fd00::ffff".parse().unwrap();
        vnet.send(syn_frame((client(), 40006), (unbound, 80), 1)).await;
        let reply = vnet.expect_tcp().await;
        assert!(reply.rst);

        timeout(IO_TIMEOUT, async {
            while invocations.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler was never invoked");
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let (result, _) = vnet.shutdown().await;
        result.unwrap();
    }

    #[tokio::test]
    async fn assigned_addresses_are_distinct_and_share_the_prefix() {
        let (tun, _to_vnet, _from_vnet) = test_tun();
        let manager = Manager::new(Config {
            tun,
            ipv6_prefix: "fd12:3456::".parse().unwrap(),
        })
        .await
        .unwrap();

        let mut assigned = Vec::new();
        for _ in 0..3 {
            assigned.push(manager.bind_handler(Arc::new(EchoHandler)).await.unwrap());
        }

        for (i, addr) in assigned.iter().enumerate() {
            let octets = addr.octets();
            assert_eq!(octets[0], 0xfd);
            assert_eq!(&octets[..12], &manager.ipv6_prefix().octets()[..12]);
            // Suffixes start at 2 and count up.
            assert_eq!(&octets[12..], &(i as u32 + 2).to_be_bytes());
        }
        assert!(assigned.windows(2).all(|w| w[0] != w[1]));
    }

    #[tokio::test]
    async fn suffix_exhaustion_is_rejected() {
        let (tun, _to_vnet, _from_vnet) = test_tun();
        let manager = Manager::new(Config {
            tun,
            ipv6_prefix: prefix(),
        })
        .await
        .unwrap();

        manager.shared.state.write().unwrap().last_assigned_suffix = u32::MAX;
        let err = manager.bind_handler(Arc::new(EchoHandler)).await.unwrap_err();
        assert!(matches!(err, VnetError::BadParameter(_)));
    }

    #[tokio::test]
    async fn bindings_rejected_after_shutdown() {
        let vnet = Vnet::start().await;
        let manager = vnet.manager.clone();
        let (result, _) = vnet.shutdown().await;
        result.unwrap();

        let err = manager.bind_handler(Arc::new(EchoHandler)).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let vnet = Vnet::start().await;
        let err = vnet
            .manager
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VnetError::BadParameter(_)));

        let (result, _) = vnet.shutdown().await;
        result.unwrap();
    }

    #[test]
    fn ipv6_with_suffix_preserves_interface_id_padding() {
        let prefix: Ipv6Addr = "fd00:1111:2222::".parse().unwrap();
        let addr = ipv6_with_suffix(prefix, 0xdead_beef);
        let octets = addr.octets();
        assert_eq!(&octets[..8], &prefix.octets()[..8]);
        assert_eq!(&octets[8..12], &[0, 0, 0, 0]);
        assert_eq!(&octets[12..], &[0xde, 0xad, 0xbe, 0xef]);
    }
}
