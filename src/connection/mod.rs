//! Connection to an analyzer
//!
//! A [`Connection`] is a cheap handle over the driver tasks. State is read
//! from snapshots; nothing here blocks on the wire except the intent
//! functions, which wait for the pipeline's verdict (not for the analyzer).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assay::AssayCatalogue;
use crate::config::ConnectionConfig;
use crate::driver::{Driver, IntentRequest};
use crate::frame::FrameReader;
use crate::machine::{EngineEvent, Intent};
use crate::session::SessionState;
use crate::stream::ThrottleExt;
use crate::{ProtocolError, Result};


/// Live connection to one analyzer
pub struct Connection {
    /// Session watch receiver
    sessions: watch::Receiver<Arc<SessionState>>,

    /// Catalogue watch receiver
    catalogue: watch::Receiver<Arc<AssayCatalogue>>,

    /// Event sender, used only to subscribe
    events: broadcast::Sender<EngineEvent>,

    /// Intent requests to the pipeline
    intents: mpsc::Sender<IntentRequest>,

    status_poll_interval: Duration,

    /// Address or label of the peer, for logging
    peer: String,

    /// Cancellation token for stopping tasks
    cancel: CancellationToken,
}

impl Connection {
    /// Connect over TCP and run the startup sequence.
    ///
    /// Only the socket connect is bounded by `connect_timeout_ms`; there are
    /// no protocol-level timeouts after that.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let address = config.address();
        info!(address = %address, "Connecting to analyzer");

        let stream = match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ProtocolError::Connect { address, source }),
            Err(_) => {
                return Err(ProtocolError::Connect {
                    address,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Could not disable Nagle's algorithm");
        }

        let (read_half, write_half) = stream.into_split();
        let connection = Self::spawn(FrameReader::new(read_half), write_half, config, address);
        info!(peer = %connection.peer, "Connected to analyzer");
        Ok(connection)
    }

    /// Run the protocol over an already connected byte stream.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Config` if `config` fails validation.
    pub fn from_stream<S>(stream: S, config: &ConnectionConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self::spawn(FrameReader::new(read_half), write_half, config, "stream".to_string()))
    }

    fn spawn<R, W>(reader: FrameReader<R>, writer: W, config: &ConnectionConfig, peer: String) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let channels = Driver::spawn(reader, writer, config);
        Self {
            sessions: channels.sessions,
            catalogue: channels.catalogue,
            events: channels.events,
            intents: channels.intents,
            status_poll_interval: config.status_poll_interval(),
            peer,
            cancel: channels.cancel,
        }
    }

    /// Current session snapshot
    pub fn session(&self) -> Arc<SessionState> {
        self.sessions.borrow().clone()
    }

    /// Get session updates as a stream
    ///
    /// Yields the current snapshot immediately, then every change. Ends when
    /// the session ends.
    pub fn session_updates(&self) -> impl Stream<Item = Arc<SessionState>> + 'static {
        WatchStream::new(self.sessions.clone())
    }

    /// Session snapshots at most once per status poll interval.
    pub fn status_updates(&self) -> impl Stream<Item = Arc<SessionState>> + 'static {
        WatchStream::new(self.sessions.clone()).throttle(self.status_poll_interval)
    }

    /// Wait until the session satisfies `predicate`.
    pub fn wait_for_session<F>(&self, mut predicate: F) -> impl Future<Output = Result<Arc<SessionState>>> + 'static
    where
        F: FnMut(&SessionState) -> bool + Send + 'static,
    {
        let mut sessions = self.sessions.clone();
        async move {
            let state = sessions.wait_for(|state| predicate(state)).await.map_err(|_| ProtocolError::Closed)?;
            Ok(state.clone())
        }
    }

    /// Current catalogue snapshot
    pub fn catalogue(&self) -> Arc<AssayCatalogue> {
        self.catalogue.borrow().clone()
    }

    /// Catalogue snapshots, one per completed assay.
    pub fn catalogue_updates(&self) -> impl Stream<Item = Arc<AssayCatalogue>> + 'static {
        WatchStream::from_changes(self.catalogue.clone())
    }

    /// Subscribe to events from now on
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Events as a stream; events missed by a lagging subscriber are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = EngineEvent> + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "Event subscriber lagged");
                    None
                }
            }
        })
    }

    pub async fn login(&self) -> Result<()> {
        self.request(Intent::Login).await
    }

    /// Start an assay; rejected unless the analyzer is logged in and armed.
    pub async fn start_assay(&self) -> Result<()> {
        self.request(Intent::StartAssay).await
    }

    /// Stop the running assay and cancel any remaining repeats.
    pub async fn stop_assay(&self) -> Result<()> {
        self.request(Intent::StopAssay).await
    }

    pub async fn set_application(&self, application: impl Into<String>, method: impl Into<String>) -> Result<()> {
        self.request(Intent::SetApplication { application: application.into(), method: method.into() })
            .await
    }

    pub async fn set_method(&self, method: impl Into<String>) -> Result<()> {
        self.request(Intent::SetMethod(method.into())).await
    }

    /// Configure one duration per known phase.
    pub async fn set_phase_times(&self, durations: Vec<Duration>) -> Result<()> {
        self.request(Intent::SetPhaseTimes(durations)).await
    }

    pub async fn set_repeat_count(&self, count: u32) -> Result<()> {
        self.request(Intent::SetRepeatCount(count)).await
    }

    /// Re-issue the session queries.
    pub async fn refresh(&self) -> Result<()> {
        self.request(Intent::Refresh).await
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop all tasks. Pending intents fail with [`ProtocolError::Closed`].
    pub fn close(&self) {
        info!(peer = %self.peer, "Closing analyzer connection");
        self.cancel.cancel();
    }

    async fn request(&self, intent: Intent) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        let (reply, verdict) = oneshot::channel();
        self.intents.send(IntentRequest { intent, reply }).await.map_err(|_| ProtocolError::Closed)?;
        verdict.await.map_err(|_| ProtocolError::Closed)?
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!(peer = %self.peer, "Dropping analyzer connection");
        // Cancel tasks on drop for clean shutdown
        self.cancel.cancel();
    }
}
