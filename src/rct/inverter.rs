use crate::prelude::*;
use crate::rct::frame::{FrameReader, Request, Response};
use crate::rct::DecodedResult;
use crate::sink::CONNECTION_STATE;

use {
    bytes::BytesMut,
    net2::TcpStreamExt,
    std::{future::pending, pin::Pin, sync::Arc, time::Duration},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        task::JoinHandle,
        time::{sleep, sleep_until, timeout, Instant, Sleep},
    },
};

const WRITE_TIMEOUT_SECS: u64 = 5; // Timeout for write operations
const TCP_KEEPALIVE_SECS: u64 = 60; // TCP keepalive interval
const READ_CHUNK: usize = 4096;

/// Requests to the connection manager
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    /// start (or restart) polling `registers` on `host`
    Process { host: String, registers: Vec<String> },
    /// close the current socket if it is still open
    Reconnect,
    /// stop polling and close the socket; a later Process starts again
    End,
    /// End, then exit the manager task
    Shutdown,
}
pub type Sender = broadcast::Sender<ChannelData>;
pub type Receiver = broadcast::Receiver<ChannelData>;

// Timings {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timings {
    pub poll_interval: Duration,
    /// after the requests of a cycle are sent, close the socket this much later
    pub watchdog: Duration,
    /// wait after a poll cycle found the previous socket still open
    pub overrun_backoff: Duration,
    /// wait after a socket error
    pub error_backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            watchdog: Duration::from_secs(2),
            overrun_backoff: Duration::from_secs(60),
            error_backoff: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
} // }}}

// InverterHandle {{{
/// Control surface for a running `Inverter`
#[derive(Clone, Debug)]
pub struct InverterHandle {
    sender: Sender,
}

impl InverterHandle {
    pub fn new(channels: &Channels) -> Self {
        Self {
            sender: channels.to_inverter.clone(),
        }
    }

    pub fn process(&self, host: &str, registers: &[String]) -> Result<()> {
        self.send(ChannelData::Process {
            host: host.to_string(),
            registers: registers.to_vec(),
        })
    }

    pub fn reconnect(&self) -> Result<()> {
        self.send(ChannelData::Reconnect)
    }

    pub fn end(&self) -> Result<()> {
        self.send(ChannelData::End)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(ChannelData::Shutdown)
    }

    fn send(&self, data: ChannelData) -> Result<()> {
        if self.sender.send(data).is_err() {
            bail!("send(to_inverter) failed - inverter not running?");
        }
        Ok(())
    }
} // }}}

// socket task <-> manager {{{
#[derive(Debug)]
enum SocketEvent {
    Connected,
    Data(BytesMut),
    Closed,
    Error(String),
}

#[derive(Debug)]
struct AttemptEvent {
    attempt: u64,
    event: SocketEvent,
}

#[derive(Debug)]
enum SocketCommand {
    Write(Vec<u8>),
    End,
}

/// One connection attempt: the socket task, its receive buffer, and
/// whether the socket is gone. Dropping it aborts the task, which closes
/// the socket.
struct Attempt {
    id: u64,
    commands: mpsc::UnboundedSender<SocketCommand>,
    task: JoinHandle<()>,
    destroyed: bool,
    reader: FrameReader,
}

impl Attempt {
    fn write(&self, bytes: Vec<u8>) -> Result<()> {
        self.commands
            .send(SocketCommand::Write(bytes))
            .map_err(|_| anyhow!("socket task for attempt {} has gone away", self.id))
    }

    fn end(&self) -> Result<()> {
        self.commands
            .send(SocketCommand::End)
            .map_err(|_| anyhow!("socket task for attempt {} has gone away", self.id))
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.task.abort();
    }
} // }}}

// ConnectionState {{{
/// Everything belonging to the active polling session. Created by the
/// first Process, dropped by End; `attempt` is replaced on every reconnect.
#[derive(Default)]
struct ConnectionState {
    host: String,
    requested: Vec<String>,
    attempt: Option<Attempt>,
    established: bool,
    /// next poll cycle; recurring while `refresh_period` is set
    refresh: Option<Pin<Box<Sleep>>>,
    refresh_period: Option<Duration>,
    watchdog: Option<Pin<Box<Sleep>>>,
}

impl ConnectionState {
    fn clear_timers(&mut self) {
        self.refresh = None;
        self.refresh_period = None;
        self.watchdog = None;
    }

    fn arm_backoff(&mut self, delay: Duration) {
        self.refresh_period = None;
        self.refresh = Some(Box::pin(sleep(delay)));
    }

    fn arm_interval(&mut self, period: Duration) {
        self.refresh_period = Some(period);
        self.refresh = Some(Box::pin(sleep(period)));
    }

    fn rearm_refresh(&mut self) {
        self.refresh = match (self.refresh.take(), self.refresh_period) {
            (Some(previous), Some(period)) => Some(Box::pin(sleep_until(next_refresh(
                previous.deadline(),
                period,
                Instant::now(),
            )))),
            _ => None,
        };
    }

    fn socket_open(&self) -> bool {
        self.attempt.as_ref().is_some_and(|a| !a.destroyed)
    }
} // }}}

enum Fired {
    Command(std::result::Result<ChannelData, broadcast::error::RecvError>),
    Event(AttemptEvent),
    Refresh,
    Watchdog,
}

/// Connection manager for one inverter. All socket events and timers are
/// handled on this task, one at a time.
pub struct Inverter {
    config: ConfigWrapper,
    registry: Arc<Registry>,
    sink: Arc<dyn StateSink>,
    stats: SharedStats,
    commands: Receiver,
    events_tx: mpsc::UnboundedSender<AttemptEvent>,
    events: mpsc::UnboundedReceiver<AttemptEvent>,
    next_attempt: u64,
    state: Option<ConnectionState>,
}

impl Inverter {
    pub fn new(
        config: ConfigWrapper,
        registry: Arc<Registry>,
        sink: Arc<dyn StateSink>,
        channels: &Channels,
        stats: SharedStats,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();

        Self {
            config,
            registry,
            sink,
            stats,
            commands: channels.to_inverter.subscribe(),
            events_tx,
            events,
            next_attempt: 0,
            state: None,
        }
    }

    pub async fn start(mut self) -> Result<()> {
        loop {
            let (refresh, watchdog) = match self.state.as_mut() {
                Some(state) => (state.refresh.as_mut(), state.watchdog.as_mut()),
                None => (None, None),
            };

            let fired = tokio::select! {
                command = self.commands.recv() => Fired::Command(command),
                Some(event) = self.events.recv() => Fired::Event(event),
                _ = expire(refresh) => Fired::Refresh,
                _ = expire(watchdog) => Fired::Watchdog,
            };

            match fired {
                Fired::Command(Ok(ChannelData::Process { host, registers })) => {
                    self.process(host, registers)
                }
                Fired::Command(Ok(ChannelData::Reconnect)) => self.reconnect(),
                Fired::Command(Ok(ChannelData::End)) => self.end(),
                Fired::Command(Ok(ChannelData::Shutdown))
                | Fired::Command(Err(broadcast::error::RecvError::Closed)) => {
                    info!("inverter: received shutdown signal");
                    self.end();
                    break;
                }
                Fired::Command(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!("inverter: {} control messages dropped", n);
                }
                Fired::Event(event) => self.handle_event(event),
                Fired::Refresh => {
                    if let Some(state) = self.state.as_mut() {
                        state.rearm_refresh();
                    }
                    self.request_cycle();
                }
                Fired::Watchdog => self.reconnect(),
            }
        }

        info!("inverter: manager exiting");
        Ok(())
    }

    fn process(&mut self, host: String, registers: Vec<String>) {
        let state = self.state.get_or_insert_with(ConnectionState::default);
        state.host = host;
        state.requested = registers;
        self.request_cycle();
    }

    /// Start a poll cycle. A socket left open by the previous cycle is an
    /// overrun: close it and retry after the overrun backoff.
    fn request_cycle(&mut self) {
        let timings = self.config.timings();
        let Some(state) = self.state.as_mut() else {
            return;
        };

        if state.socket_open() {
            warn!(
                "RCT: Connection error! Previous interval connection to {} not successfully completed!",
                state.host
            );
            state.attempt = None;
            state.clear_timers();
            state.arm_backoff(timings.overrun_backoff);
            self.count(|s| s.overruns += 1);
            self.connection_down();
            return;
        }

        // at most one live socket: drop the old reference first
        state.attempt = None;
        debug!("RCT: Starting interval connection to inverter at {}", state.host);
        let host = state.host.clone();

        let attempt = self.spawn_attempt(host, timings);
        if let Some(state) = self.state.as_mut() {
            state.attempt = Some(attempt);
        }
    }

    fn spawn_attempt(&mut self, host: String, timings: Timings) -> Attempt {
        self.next_attempt += 1;
        let id = self.next_attempt;
        let inverter = self.config.inverter();

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(
            id,
            host,
            inverter.port(),
            timings.connect_timeout,
            inverter.use_tcp_nodelay(),
            self.events_tx.clone(),
            commands_rx,
        ));

        Attempt {
            id,
            commands,
            task,
            destroyed: false,
            reader: FrameReader::new(inverter.escape_lookahead()),
        }
    }

    /// Gracefully close the current socket if it is still open.
    fn reconnect(&mut self) {
        let timings = self.config.timings();
        let Some(state) = self.state.as_mut() else {
            return;
        };
        state.watchdog = None;

        let Some(attempt) = state.attempt.as_ref() else {
            return;
        };
        if attempt.destroyed {
            return;
        }

        debug!("RCT: starting to terminate interval connection to inverter at {}", state.host);
        if let Err(e) = attempt.end() {
            error!("RCT: reconnection not working! {}", e);
            state.attempt = None;
            state.clear_timers();
            state.arm_backoff(timings.error_backoff);
            self.connection_down();
        }
    }

    fn end(&mut self) {
        let Some(state) = self.state.take() else {
            debug!("RCT: already stopped");
            return;
        };

        info!("RCT: terminated connection to inverter at {}", state.host);
        let was_established = state.established;
        // drops both timers and aborts the socket task
        drop(state);

        if was_established {
            self.publish(CONNECTION_STATE, &Value::Bool(false));
        }
    }

    fn handle_event(&mut self, event: AttemptEvent) {
        let current = self
            .state
            .as_ref()
            .and_then(|s| s.attempt.as_ref())
            .map(|a| a.id);
        if current != Some(event.attempt) {
            debug!("ignoring {:?} from stale attempt {}", event.event, event.attempt);
            return;
        }

        match event.event {
            SocketEvent::Connected => self.on_connected(),
            SocketEvent::Data(chunk) => self.on_data(&chunk),
            SocketEvent::Closed => {
                if let Some(state) = self.state.as_mut() {
                    debug!("RCT: Interval connection to inverter at {} closed", state.host);
                    if let Some(attempt) = state.attempt.as_mut() {
                        attempt.destroyed = true;
                    }
                }
            }
            SocketEvent::Error(e) => self.connection_error(&e),
        }
    }

    fn on_connected(&mut self) {
        let timings = self.config.timings();
        let registry = self.registry.clone();
        let Some(state) = self.state.as_mut() else {
            return;
        };

        let came_up = !state.established;
        if came_up {
            info!("RCT: Initial connection successful to inverter at {}!", state.host);
            state.established = true;
            state.arm_interval(timings.poll_interval);
        }

        debug!("RCT: Requesting elements {:?} from inverter", state.requested);
        if let Some(attempt) = state.attempt.as_ref() {
            for name in &state.requested {
                let Some(definition) = registry.lookup_by_name(name) else {
                    warn!("RCT: Invalid RCT name: {}", name);
                    continue;
                };

                let bytes = Request::read(definition.id).bytes();
                debug!("TX {:02X?}", bytes);
                if let Err(e) = attempt.write(bytes) {
                    warn!("RCT: failed to send request for {}: {}", name, e);
                    break;
                }
            }
        }
        state.watchdog = Some(Box::pin(sleep(timings.watchdog)));

        self.count(|s| s.connects += 1);
        if came_up {
            self.publish(CONNECTION_STATE, &Value::Bool(true));
        }
    }

    fn on_data(&mut self, chunk: &[u8]) {
        debug!("RX {:02X?}", chunk);
        let Some(attempt) = self.state.as_mut().and_then(|s| s.attempt.as_mut()) else {
            return;
        };

        let pushed = attempt.reader.push(chunk);
        let skipped = attempt.reader.take_skipped();
        if skipped > 0 {
            self.count(|s| s.noise_bytes_skipped += skipped);
        }

        match pushed {
            Ok(responses) => {
                for response in responses {
                    self.dispatch(&response);
                }
            }
            Err(e) => self.connection_error(&e.to_string()),
        }
    }

    fn dispatch(&self, response: &Response) {
        self.count(|s| s.frames_received += 1);

        let result = DecodedResult::new(&self.registry, response);
        if !result.crc_ok {
            warn!("RCT: CRC not valid for frame {}", result.info_text);
            self.count(|s| s.crc_errors += 1);
            return;
        }

        let (Some(name), Some(value)) = (&result.name, &result.result) else {
            debug!("RCT: received unknown: {}", result.text());
            self.count(|s| s.unknown_ids += 1);
            return;
        };

        let requested = self
            .state
            .as_ref()
            .is_some_and(|s| s.requested.iter().any(|r| r == name));
        if !requested {
            debug!("RCT: received, but not requested: {}", result.text());
            self.count(|s| s.values_not_requested += 1);
            return;
        }

        debug!("RCT: received: {}", result.text());
        if let Some(info) = self.registry.state_info(name) {
            if self.publish(&info.full, value) {
                self.count(|s| s.values_published += 1);
            }
        }
    }

    fn connection_error(&mut self, e: &str) {
        let timings = self.config.timings();
        error!(
            "RCT: Connection error, please check configured inverter ip address and network! ({})",
            e
        );

        if let Some(state) = self.state.as_mut() {
            state.attempt = None;
            state.clear_timers();
            state.arm_backoff(timings.error_backoff);
        }
        self.count(|s| s.connection_errors += 1);
        self.connection_down();
    }

    fn connection_down(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.established = false;
        }
        self.publish(CONNECTION_STATE, &Value::Bool(false));
    }

    fn publish(&self, path: &str, value: &Value) -> bool {
        match self.sink.set_state(path, value, true) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to set state {}: {}", path, e);
                self.count(|s| s.sink_errors += 1);
                false
            }
        }
    }

    fn count(&self, f: impl FnOnce(&mut ConnectionStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

/// Deadline of the poll cycle after one due at `previous`. Missed cycles
/// are skipped rather than fired back to back.
pub fn next_refresh(previous: Instant, period: Duration, now: Instant) -> Instant {
    let next = previous + period;
    if next <= now {
        now + period
    } else {
        next
    }
}

async fn expire(timer: Option<&mut Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn connect(host: &str, port: u16, connect_timeout: Duration, nodelay: bool) -> Result<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => bail!("Failed to connect to inverter: {}", e),
        Err(_) => bail!("Connection timeout after {:?}", connect_timeout),
    };

    // Configure TCP socket
    let std_stream = stream.into_std()?;
    if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
        warn!("Failed to set TCP keepalive: {}", e);
    }
    let stream = TcpStream::from_std(std_stream)?;

    if nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    }

    Ok(stream)
}

// owns one socket; reports everything that happens to it as AttemptEvents
async fn run_socket(
    attempt: u64,
    host: String,
    port: u16,
    connect_timeout: Duration,
    nodelay: bool,
    events: mpsc::UnboundedSender<AttemptEvent>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let send = |event: SocketEvent| {
        let _ = events.send(AttemptEvent { attempt, event });
    };

    let stream = match connect(&host, port, connect_timeout, nodelay).await {
        Ok(stream) => stream,
        Err(e) => {
            send(SocketEvent::Error(e.to_string()));
            return;
        }
    };
    let (mut reader, mut writer) = stream.into_split();
    send(SocketEvent::Connected);

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut writable = true;

    loop {
        buf.reserve(READ_CHUNK);

        tokio::select! {
            command = commands.recv(), if writable => match command {
                Some(SocketCommand::Write(bytes)) => {
                    let written = timeout(
                        Duration::from_secs(WRITE_TIMEOUT_SECS),
                        writer.write_all(&bytes),
                    )
                    .await;
                    match written {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            send(SocketEvent::Error(format!("Failed to write request: {}", e)));
                            return;
                        }
                        Err(_) => {
                            send(SocketEvent::Error(format!(
                                "Write operation timed out after {} seconds",
                                WRITE_TIMEOUT_SECS
                            )));
                            return;
                        }
                    }
                }
                Some(SocketCommand::End) => {
                    debug!("RCT: Terminating interval connection to inverter at {}", host);
                    if let Err(e) = writer.shutdown().await {
                        debug!("shutdown of write half failed: {}", e);
                    }
                    writable = false;
                }
                // manager dropped this attempt
                None => return,
            },
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    send(SocketEvent::Closed);
                    return;
                }
                Ok(_) => send(SocketEvent::Data(buf.split())),
                Err(e) => {
                    send(SocketEvent::Error(format!("Read error: {}", e)));
                    return;
                }
            },
        }
    }
}
