use {
    crate::{
        catalog::Service,
        client::ConsulClient,
        error::Error,
        kv::KeyValue,
        query::{BlockingQueryOptions, Indexed},
        ChangeIndex,
    },
    futures::FutureExt,
    retry::delay::Exponential,
    std::{
        fmt,
        future::Future,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
        time::Duration,
    },
    tokio::{
        sync::{mpsc, oneshot},
        task::{JoinError, JoinHandle},
    },
    tokio_stream::wrappers::ReceiverStream,
    tracing::{debug, trace, warn},
};

///
/// One emission from a running watch.
///
#[derive(Debug)]
pub enum WatchEvent<T> {
    /// The watched resource moved to a new state. `previous` is the state of
    /// the last `Changed` emission, absent on the first one.
    Changed { previous: Option<T>, next: T },

    /// One blocking query failed. The loop keeps the last state it saw and
    /// retries with backoff; `last_known` is that state, if any.
    Failed { last_known: Option<T>, error: Error },
}

///
/// Lifecycle misuse. These are programming errors and are signaled
/// synchronously instead of being absorbed by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    #[error("watch already started")]
    AlreadyStarted,
    #[error("watch has not been started")]
    NotStarted,
    #[error("watch already stopped")]
    AlreadyStopped,
}

///
/// Tuning knobs for the watch loop. The defaults follow the agent's
/// documented limits: a ten minute server-side wait, retry delays doubling
/// from one second up to a three minute cap.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Server-side hold time for each blocking query.
    pub wait: Duration,
    /// First retry delay after a failed query.
    pub base_delay: Duration,
    /// Upper bound for retry delays.
    pub max_delay: Duration,
    /// Pause before re-polling when a query comes back with an unchanged
    /// index, so an eagerly returning server cannot drive the loop hot.
    pub flood_pause: Duration,
    /// Capacity of the emission channel.
    pub buffer: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(10 * 60),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(180),
            flood_pause: Duration::from_secs(1),
            buffer: 10,
        }
    }
}

///
/// One blocking poll against a concrete resource. Implementations translate
/// the generic "wait for a change since `index`" primitive into the endpoint
/// for their resource kind.
#[async_trait::async_trait]
pub trait WatchTarget: Send + Sync + 'static {
    type Output: Clone + PartialEq + fmt::Debug + Send + 'static;

    async fn poll(
        &self,
        client: &ConsulClient,
        options: BlockingQueryOptions,
    ) -> Result<Indexed<Self::Output>, Error>;
}

/// Watches a single key. The output is `None` while the key is absent.
pub struct KeyWatch {
    key: String,
}

#[async_trait::async_trait]
impl WatchTarget for KeyWatch {
    type Output = Option<KeyValue>;

    async fn poll(
        &self,
        client: &ConsulClient,
        options: BlockingQueryOptions,
    ) -> Result<Indexed<Self::Output>, Error> {
        client.kv_get(&self.key, Some(options)).await
    }
}

/// Watches every key under a prefix.
pub struct KeyPrefixWatch {
    prefix: String,
}

#[async_trait::async_trait]
impl WatchTarget for KeyPrefixWatch {
    type Output = Vec<KeyValue>;

    async fn poll(
        &self,
        client: &ConsulClient,
        options: BlockingQueryOptions,
    ) -> Result<Indexed<Self::Output>, Error> {
        client.kv_get_tree(&self.prefix, Some(options)).await
    }
}

/// Watches the service catalog.
pub struct ServicesWatch;

#[async_trait::async_trait]
impl WatchTarget for ServicesWatch {
    type Output = Vec<Service>;

    async fn poll(
        &self,
        client: &ConsulClient,
        options: BlockingQueryOptions,
    ) -> Result<Indexed<Self::Output>, Error> {
        client.catalog_services(Some(options)).await
    }
}

///
/// Handle to the background watch task. Await it after [`Watch::stop`] to
/// join the loop.
#[derive(Debug)]
pub struct WatchHandle {
    inner: JoinHandle<()>,
}

impl Future for WatchHandle {
    type Output = Result<(), JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

enum Lifecycle {
    Idle,
    Running {
        cancel_tx: oneshot::Sender<()>,
        handle: WatchHandle,
    },
    Stopped,
}

///
/// Turns repeated blocking queries into a continuous change stream.
///
/// The loop keeps exactly one request in flight: iteration N+1 is not issued
/// before iteration N's response has been fully processed. A successful
/// query that reports a change is emitted and immediately followed by the
/// next query (the server-side wait provides pacing); an unchanged response
/// is re-polled after a short pause without emitting; a failed query is
/// emitted as [`WatchEvent::Failed`] and retried after an exponentially
/// growing, capped delay. The backoff resets on the next success. A watch
/// never stops on its own: only [`Watch::stop`] (or dropping the watch) ends
/// the loop.
///
/// ```no_run
/// use rust_consul_client::{client::{Config, ConsulClient}, watch::{Watch, WatchEvent}};
///
/// # async fn example() {
/// let client = ConsulClient::new(Config::new("http://127.0.0.1:8500"));
/// let mut watch = Watch::key(client, "config/feature-flags");
/// let mut rx = watch.start().expect("watch started twice");
/// while let Some(event) = rx.recv().await {
///     match event {
///         WatchEvent::Changed { next, .. } => println!("new state: {next:?}"),
///         WatchEvent::Failed { error, .. } => eprintln!("query failed: {error}"),
///     }
/// }
/// # }
/// ```
pub struct Watch<W: WatchTarget> {
    client: ConsulClient,
    target: Arc<W>,
    options: WatchOptions,
    lifecycle: Lifecycle,
}

impl Watch<KeyWatch> {
    /// Watch a single key for changes.
    pub fn key(client: ConsulClient, key: impl Into<String>) -> Self {
        Self::new(client, KeyWatch { key: key.into() })
    }
}

impl Watch<KeyPrefixWatch> {
    /// Watch every key under a prefix for changes.
    pub fn key_prefix(client: ConsulClient, prefix: impl Into<String>) -> Self {
        Self::new(
            client,
            KeyPrefixWatch {
                prefix: prefix.into(),
            },
        )
    }
}

impl Watch<ServicesWatch> {
    /// Watch the list of services in the catalog.
    pub fn services(client: ConsulClient) -> Self {
        Self::new(client, ServicesWatch)
    }
}

impl<W: WatchTarget> Watch<W> {
    pub fn new(client: ConsulClient, target: W) -> Self {
        Self {
            client,
            target: Arc::new(target),
            options: WatchOptions::default(),
            lifecycle: Lifecycle::Idle,
        }
    }

    pub fn with_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts the loop and hands back its emission channel. Starting twice,
    /// or after a stop, is an error.
    pub fn start(&mut self) -> Result<mpsc::Receiver<WatchEvent<W::Output>>, WatchError> {
        match self.lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => return Err(WatchError::AlreadyStarted),
            Lifecycle::Stopped => return Err(WatchError::AlreadyStopped),
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(self.options.buffer);
        let handle = tokio::spawn(run_watch(
            self.client.clone(),
            Arc::clone(&self.target),
            self.options.clone(),
            tx,
            cancel_rx,
        ));
        self.lifecycle = Lifecycle::Running {
            cancel_tx,
            handle: WatchHandle { inner: handle },
        };
        Ok(rx)
    }

    /// Same as [`Watch::start`], wrapping the channel in a `Stream`.
    pub fn start_stream(&mut self) -> Result<ReceiverStream<WatchEvent<W::Output>>, WatchError> {
        self.start().map(ReceiverStream::new)
    }

    /// Stops the loop. An in-flight blocking query is cancelled and its
    /// eventual completion discarded without emission. Returns the task
    /// handle so the caller can await the loop's teardown. Stopping an
    /// unstarted or already stopped watch is an error.
    pub fn stop(&mut self) -> Result<WatchHandle, WatchError> {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { cancel_tx, handle } => {
                // The task may already be gone if every receiver was dropped.
                let _ = cancel_tx.send(());
                Ok(handle)
            }
            Lifecycle::Idle => {
                self.lifecycle = Lifecycle::Idle;
                Err(WatchError::NotStarted)
            }
            Lifecycle::Stopped => Err(WatchError::AlreadyStopped),
        }
    }
}

async fn run_watch<W: WatchTarget>(
    client: ConsulClient,
    target: Arc<W>,
    options: WatchOptions,
    tx: mpsc::Sender<WatchEvent<W::Output>>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut last_value: Option<W::Output> = None;
    let mut last_index: ChangeIndex = 0;
    let mut delays = retry_delays(&options);

    loop {
        let query = BlockingQueryOptions::at_index(last_index).with_wait(options.wait);
        let polled = tokio::select! {
            _ = &mut cancel_rx => {
                trace!("watch stopped, discarding in-flight query");
                return;
            }
            polled = target.poll(&client, query) => polled,
        };
        match polled {
            Ok(Indexed { value, index }) => {
                delays = retry_delays(&options);
                if index == last_index && last_value.as_ref() == Some(&value) {
                    // Unchanged state: the server-side wait expired.
                    if !sleep_or_cancel(options.flood_pause, &mut cancel_rx).await {
                        return;
                    }
                    continue;
                }
                trace!(index, "watched resource changed");
                let previous = last_value.replace(value.clone());
                last_index = index;
                let event = WatchEvent::Changed {
                    previous,
                    next: value,
                };
                if tx.send(event).await.is_err() {
                    debug!("watch receiver dropped, ending loop");
                    return;
                }
            }
            Err(error) => {
                let delay = delays.next().unwrap_or(options.max_delay);
                warn!("blocking query failed: {error}; retrying in {delay:?}");
                let event = WatchEvent::Failed {
                    last_known: last_value.clone(),
                    error,
                };
                if tx.send(event).await.is_err() {
                    debug!("watch receiver dropped, ending loop");
                    return;
                }
                if !sleep_or_cancel(delay, &mut cancel_rx).await {
                    return;
                }
            }
        }
    }
}

/// Consecutive-failure delays: doubling from the base, capped at the
/// maximum. Rebuilt from scratch after every successful query.
fn retry_delays(options: &WatchOptions) -> impl Iterator<Item = Duration> {
    let max = options.max_delay;
    Exponential::from_millis_with_factor(options.base_delay.as_millis() as u64, 2.0)
        .map(move |delay| delay.min(max))
}

/// Sleeps, unless the watch is cancelled first. Returns `false` on
/// cancellation.
async fn sleep_or_cancel(delay: Duration, cancel_rx: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = cancel_rx => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
