//! The I/O-owning executor: runs [`crate::driver::HostDriver`] against a
//! real transport on a single scheduler task, the way this codebase's own
//! server wires a pure driver to a connection-owning runtime loop.

use std::{sync::Arc, time::Duration};

use bidib_core::{
    node::NodeTimer, CancelHandle, CoreError, Environment, Event, Node, SystemEnv,
};
use bidib_proto::{Address, CsDriveOptions, CsPomOpCode, CsProgOpCode, ParsedMessage};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::warn;

use crate::{
    config::HostConfig,
    driver::{HostAction, HostDriver},
    error::HostError,
    transport::{spawn_reader, Transport},
};

type Callback = Box<dyn FnOnce(&mut HostDriver) -> Vec<HostAction> + Send>;

/// One item on the dispatcher's single ingress queue: a transport-delivered
/// message, a fired timer, or a closure any task wants run in scheduler
/// context.
enum QueueItem {
    Ingress(ParsedMessage),
    Timer { addr: Address, timer: NodeTimer },
    Callback(Callback),
}

/// Enqueues `item`, racing the send against `timeout` so a stalled consumer
/// surfaces as a dropped message rather than a blocked caller.
///
/// # Errors
///
/// Returns [`HostError::QueueTimeout`] if the timeout elapses first.
async fn enqueue_timed<E: Environment>(
    tx: &mpsc::Sender<QueueItem>,
    item: QueueItem,
    timeout: Duration,
    env: &E,
) -> Result<(), HostError> {
    tokio::select! {
        result = tx.send(item) => result.map_err(|_| HostError::QueueTimeout(timeout)),
        () = env.sleep(timeout) => Err(HostError::QueueTimeout(timeout)),
    }
}

/// Applies one batch of [`HostAction`]s: sends downstream, schedules
/// delayed timers, and fans out node-changed events.
async fn execute_actions<S, E>(
    actions: Vec<HostAction>,
    transport: &Transport<S>,
    node_changed: &Event<Node>,
    root: &Node,
    queue_tx: &mpsc::Sender<QueueItem>,
    cancel_rx: &watch::Receiver<bool>,
    env: &E,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: Environment,
{
    let mut batch = Vec::new();
    for action in actions {
        match action {
            HostAction::Send { addr, seq, message } => batch.push((addr, seq, message)),
            HostAction::PostDelayed { addr, delay, timer } => {
                let queue_tx = queue_tx.clone();
                let env = env.clone();
                let mut cancel_rx = cancel_rx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel_rx.changed() => {}
                        () = env.sleep(delay) => {
                            let _ = queue_tx.send(QueueItem::Timer { addr, timer }).await;
                        }
                    }
                });
            },
            HostAction::NodeChanged => {
                node_changed.invoke(root.clone()).await;
            },
        }
    }
    if !batch.is_empty() {
        if let Err(err) = transport.send(&batch).await {
            warn!(error = %err, "downstream send failed");
        }
    }
}

/// Runs the scheduler: the only task that ever mutates the node tree.
async fn run_scheduler<S, E>(
    mut driver: HostDriver,
    mut queue_rx: mpsc::Receiver<QueueItem>,
    mut cancel_rx: watch::Receiver<bool>,
    transport: Arc<Transport<S>>,
    node_changed: Arc<Event<Node>>,
    queue_tx: mpsc::Sender<QueueItem>,
    env: E,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: Environment,
{
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            item = queue_rx.recv() => {
                let Some(item) = item else { break };
                let actions = match item {
                    QueueItem::Ingress(parsed) => match driver.process_ingress(parsed) {
                        Ok(actions) => actions,
                        Err(err) => {
                            log_core_error(&err);
                            Vec::new()
                        },
                    },
                    QueueItem::Timer { addr, timer } => driver.process_timer(addr, timer),
                    QueueItem::Callback(callback) => callback(&mut driver),
                };
                execute_actions(
                    actions,
                    &transport,
                    &node_changed,
                    driver.root(),
                    &queue_tx,
                    &cancel_rx,
                    &env,
                )
                .await;
            }
        }
    }
}

fn log_core_error(err: &CoreError) {
    warn!(error = %err, "dispatcher rejected inbound message");
}

/// The running BiDiB host: owns the serial transport, the node tree, and
/// the scheduler task that's the sole mutator of both.
pub struct Host<E: Environment = SystemEnv> {
    queue_tx: mpsc::Sender<QueueItem>,
    cancel_tx: watch::Sender<bool>,
    node_changed: Arc<Event<Node>>,
    config: HostConfig,
    env: E,
    scheduler_handle: JoinHandle<()>,
    reader_handle: JoinHandle<()>,
}

impl Host<SystemEnv> {
    /// Opens the serial port named in `config`, runs the startup sequence,
    /// and returns a running host.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::TransportOpen`] if no configured baud rate
    /// produces a `SYS_MAGIC` reply.
    pub async fn bind(config: HostConfig) -> Result<Self, HostError> {
        let (transport, reader) = Transport::open(&config.port_name, &config.baud_probe_order).await?;
        Ok(Self::bind_with_transport(config, SystemEnv::new(), transport, reader).await)
    }
}

impl<E: Environment> Host<E> {
    /// Wires a host onto an already-open transport. Split out from
    /// [`Host::bind`] so tests can drive a host over an in-memory duplex
    /// stream instead of a real serial port.
    pub async fn bind_with_transport<S>(
        config: HostConfig,
        env: E,
        transport: Transport<S>,
        reader: tokio::io::ReadHalf<S>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(config.ingress_queue_capacity);
        let node_changed = Arc::new(Event::new());
        let transport = Arc::new(transport);

        let reader_queue_tx = queue_tx.clone();
        let reader_env = env.clone();
        let ingress_timeout = config.enqueue_timeout_ingress;
        let reader_cancel_rx = cancel_rx.clone();
        let reader_handle = spawn_reader(reader, reader_cancel_rx, move |parsed: ParsedMessage| {
            let queue_tx = reader_queue_tx.clone();
            let env = reader_env.clone();
            async move {
                if let Err(err) =
                    enqueue_timed(&queue_tx, QueueItem::Ingress(parsed), ingress_timeout, &env).await
                {
                    warn!(error = %err, "dropping ingress message, queue full");
                }
            }
        });

        let mut driver = HostDriver::new();
        let startup_actions = driver.startup();
        execute_actions(
            startup_actions,
            &transport,
            &node_changed,
            driver.root(),
            &queue_tx,
            &cancel_rx,
            &env,
        )
        .await;

        let scheduler_handle = tokio::spawn(run_scheduler(
            driver,
            queue_rx,
            cancel_rx,
            Arc::clone(&transport),
            Arc::clone(&node_changed),
            queue_tx.clone(),
            env.clone(),
        ));

        Self { queue_tx, cancel_tx, node_changed, config, env, scheduler_handle, reader_handle }
    }

    async fn post<F>(&self, callback: F) -> Result<(), HostError>
    where
        F: FnOnce(&mut HostDriver) -> Vec<HostAction> + Send + 'static,
    {
        enqueue_timed(
            &self.queue_tx,
            QueueItem::Callback(Box::new(callback)),
            self.config.enqueue_timeout_default,
            &self.env,
        )
        .await
    }

    /// Reads a clone of the current node tree root.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::QueueTimeout`] if the scheduler doesn't service
    /// the request within the configured budget.
    pub async fn get_root(&self) -> Result<Node, HostError> {
        let (tx, rx) = oneshot::channel();
        self.post(move |driver| {
            let _ = tx.send(driver.root().clone());
            Vec::new()
        })
        .await?;
        rx.await.map_err(|_| HostError::QueueTimeout(self.config.enqueue_timeout_default))
    }

    /// Reads a clone of the node at `addr`, if discovered.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::QueueTimeout`] if the scheduler doesn't service
    /// the request within the configured budget.
    pub async fn get_node(&self, addr: Address) -> Result<Option<Node>, HostError> {
        let (tx, rx) = oneshot::channel();
        self.post(move |driver| {
            let _ = tx.send(driver.get_node(&addr).cloned());
            Vec::new()
        })
        .await?;
        rx.await.map_err(|_| HostError::QueueTimeout(self.config.enqueue_timeout_default))
    }

    /// Registers a handler invoked whenever the node tree changes.
    pub async fn register_node_changed<F>(&self, handler: F) -> CancelHandle<Node>
    where
        F: Fn(Node) + Send + Sync + 'static,
    {
        self.node_changed.register(handler).await
    }

    async fn command<F>(&self, addr: Address, f: F) -> Result<(), HostError>
    where
        F: FnOnce(&mut Node) -> Vec<bidib_core::node::NodeAction> + Send + 'static,
    {
        self.post(move |driver| match driver.find_mut(&addr) {
            Some(node) => {
                let node_actions = f(node);
                node_actions
                    .into_iter()
                    .map(|action| match action {
                        bidib_core::node::NodeAction::Send { addr, seq, message } => {
                            HostAction::Send { addr, seq, message }
                        },
                        bidib_core::node::NodeAction::PostDelayed { delay, timer } => {
                            HostAction::PostDelayed { addr, delay, timer }
                        },
                        bidib_core::node::NodeAction::NodeChanged => HostAction::NodeChanged,
                    })
                    .collect()
            },
            None => {
                warn!(addr = %addr, "command-station operation on unknown node");
                Vec::new()
            },
        })
        .await
    }

    /// Commands track power on for the command station at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::QueueTimeout`] on a saturated queue.
    pub async fn go(&self, addr: Address) -> Result<(), HostError> {
        self.command(addr, Node::go).await
    }

    /// Commands a normal stop for the command station at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::QueueTimeout`] on a saturated queue.
    pub async fn stop(&self, addr: Address) -> Result<(), HostError> {
        self.command(addr, Node::stop).await
    }

    /// Commands track power off for the command station at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::QueueTimeout`] on a saturated queue.
    pub async fn off(&self, addr: Address) -> Result<(), HostError> {
        self.command(addr, Node::off).await
    }

    /// Issues a `CS_DRIVE` command to the command station at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::QueueTimeout`] on a saturated queue.
    pub async fn drive(&self, addr: Address, options: CsDriveOptions) -> Result<(), HostError> {
        self.command(addr, move |node| node.drive(options)).await
    }

    /// Issues a programming-on-main request to the command station at
    /// `addr`. `cv` is the host-facing 1-based CV number.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::QueueTimeout`] on a saturated queue.
    pub async fn program_on_main(
        &self,
        addr: Address,
        loco_addr: u16,
        op: CsPomOpCode,
        cv: u16,
        data: [u8; 4],
    ) -> Result<(), HostError> {
        self.command(addr, move |node| node.program_on_main(loco_addr, op, cv, data)).await
    }

    /// Issues a service-mode programming request to the command station at
    /// `addr`. `cv` is the host-facing 1-based CV number.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::QueueTimeout`] on a saturated queue.
    pub async fn program(
        &self,
        addr: Address,
        op: CsProgOpCode,
        cv: u16,
        data: [u8; 4],
        data_len: u8,
    ) -> Result<(), HostError> {
        self.command(addr, move |node| node.program(op, cv, data, data_len)).await
    }

    /// Signals cancellation to the reader and scheduler tasks and waits for
    /// both to exit. Queued callbacks that haven't run yet are discarded.
    ///
    /// # Errors
    ///
    /// This implementation always succeeds; the `Result` is kept so a future
    /// transport-level shutdown failure can be surfaced without an API
    /// break.
    pub async fn close(self) -> Result<(), HostError> {
        let _ = self.cancel_tx.send(true);
        let _ = self.reader_handle.await;
        let _ = self.scheduler_handle.await;
        Ok(())
    }
}
