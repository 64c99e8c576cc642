//! Delivery pipeline orchestration

pub mod context;

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Deserialize;
use silo_common::{Signal, internal, unix_now};
use silo_store::{Schema, Store};
use tracing::{debug, error, warn};

use self::context::{DeliveryContext, Settings, SiloHandle};
use crate::{
    completion::handle_completion,
    error::{DeliveryError, SystemError},
    reconciler::Reconciler,
    reminder,
    transport::{CompletionReceiver, Transport, completion_channel},
    worker::{WorkerPool, batch},
};

const fn default_batch_size() -> usize {
    10
}

const fn default_wait_ms() -> u64 {
    100
}

const fn default_workers() -> usize {
    1
}

const fn default_check_time() -> u64 {
    60
}

const fn default_clean_period() -> u64 {
    10
}

const fn default_expire_time() -> i64 {
    259_200 // 72 hours
}

const fn default_true() -> bool {
    true
}

const fn default_in_flight_timeout() -> i64 {
    300
}

const fn default_reload_backoff() -> i64 {
    5
}

const fn default_delete_batch_size() -> usize {
    10
}

/// Offline message delivery pipeline
///
/// Deserialized from the `delivery` section of the configuration, then
/// wired to a store and a transport with [`Silo::init`] and driven by
/// [`Silo::serve`].
#[derive(Debug, Deserialize)]
pub struct Silo {
    /// Retries allowed after the first delivery attempt
    ///
    /// Default: 0 (no retries)
    #[serde(default)]
    pub retry_count: u32,

    /// Most messages a worker reloads in one query
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long an idle worker sleeps before re-checking the queue, in ms
    ///
    /// Bounds how long a missed wakeup can delay pending work.
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,

    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Interval between reconciler sweeps, in seconds
    #[serde(default = "default_check_time")]
    pub check_time_secs: u64,

    /// Expired rows are evicted every `clean_period` sweeps
    #[serde(default = "default_clean_period")]
    pub clean_period: u64,

    /// Longest a message is kept, in seconds
    ///
    /// Default: 259200 (72 hours)
    #[serde(default = "default_expire_time")]
    pub expire_time_secs: i64,

    /// Interval between reminder runs, in seconds; 0 disables reminders
    #[serde(default)]
    pub send_time_secs: u64,

    /// Sender address of reminders
    #[serde(default)]
    pub reminder: Option<String>,

    #[serde(default)]
    pub outbound_proxy: Option<String>,

    /// Sender address of offline notifications
    #[serde(default)]
    pub from_address: Option<String>,

    /// Value of the `Contact` header added to outbound messages
    #[serde(default)]
    pub contact_hdr: Option<String>,

    /// Content type of offline notifications
    #[serde(default)]
    pub content_type_hdr: Option<String>,

    /// Body of the notification sent back when a message is stored
    #[serde(default)]
    pub offline_message: Option<String>,

    /// Send offline notifications to the sender's contact when it has one
    #[serde(default = "default_true")]
    pub use_contact: bool,

    /// Prefix plain text bodies with the date they were stored
    #[serde(default = "default_true")]
    pub add_date: bool,

    /// Most messages kept per recipient; 0 for no limit
    #[serde(default)]
    pub max_messages: usize,

    /// Claimed queue entries without a completion after this long are
    /// dropped, in seconds
    #[serde(default = "default_in_flight_timeout")]
    pub in_flight_timeout_secs: i64,

    /// Delay before a batch is retried after the store failed to reload it,
    /// in seconds
    #[serde(default = "default_reload_backoff")]
    pub reload_backoff_secs: i64,

    /// Most rows deleted by one statement
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,

    /// Most entries the retry queue holds; unlimited when unset
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    #[serde(default)]
    pub schema: Schema,

    /// Shared state (initialized in `init()`)
    #[serde(skip)]
    context: Option<Arc<DeliveryContext>>,

    /// Completion stream, taken by `serve()`
    #[serde(skip)]
    completions: Mutex<Option<CompletionReceiver>>,
}

impl Default for Silo {
    fn default() -> Self {
        Self {
            retry_count: 0,
            batch_size: default_batch_size(),
            wait_ms: default_wait_ms(),
            workers: default_workers(),
            check_time_secs: default_check_time(),
            clean_period: default_clean_period(),
            expire_time_secs: default_expire_time(),
            send_time_secs: 0,
            reminder: None,
            outbound_proxy: None,
            from_address: None,
            contact_hdr: None,
            content_type_hdr: None,
            offline_message: None,
            use_contact: true,
            add_date: true,
            max_messages: 0,
            in_flight_timeout_secs: default_in_flight_timeout(),
            reload_backoff_secs: default_reload_backoff(),
            delete_batch_size: default_delete_batch_size(),
            queue_capacity: None,
            schema: Schema::default(),
            context: None,
            completions: Mutex::new(None),
        }
    }
}

impl Silo {
    /// Check option combinations that cannot work
    ///
    /// # Errors
    /// [`SystemError::Configuration`] naming the first offending option.
    pub fn validate(&self) -> Result<(), SystemError> {
        let positive = [
            ("batch_size", self.batch_size as u64),
            ("workers", self.workers as u64),
            ("check_time_secs", self.check_time_secs),
            ("delete_batch_size", self.delete_batch_size as u64),
        ];

        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(SystemError::Configuration(format!(
                "{name} must be greater than 0"
            )));
        }

        let max_batch = batch::max_batch_size(&self.schema);
        if self.batch_size > max_batch {
            return Err(SystemError::Configuration(format!(
                "batch_size {} does not fit one reload query, at most {max_batch} can",
                self.batch_size
            )));
        }

        if self.offline_message.is_some() && self.content_type_hdr.is_none() {
            return Err(SystemError::Configuration(
                "offline_message requires content_type_hdr".to_string(),
            ));
        }

        Ok(())
    }

    fn settings(&self) -> Settings {
        Settings {
            retry_count: self.retry_count,
            batch_size: self.batch_size,
            wait: Duration::from_millis(self.wait_ms),
            schema: self.schema.clone(),
            outbound_proxy: self.outbound_proxy.clone(),
            from_address: self.from_address.clone(),
            contact_hdr: self.contact_hdr.clone(),
            content_type_hdr: self.content_type_hdr.clone(),
            offline_message: self.offline_message.clone(),
            reminder: self.reminder.clone(),
            use_contact: self.use_contact,
            add_date: self.add_date,
            max_messages: self.max_messages,
            expire_time_secs: self.expire_time_secs,
            check_time_secs: self.check_time_secs,
            clean_period: self.clean_period,
            in_flight_timeout_secs: self.in_flight_timeout_secs,
            reload_backoff_secs: self.reload_backoff_secs,
            delete_batch_size: self.delete_batch_size,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Wire the pipeline to its store and transport
    ///
    /// # Errors
    /// If the configuration is invalid or the store cannot be reached.
    pub fn init(
        &mut self,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), DeliveryError> {
        internal!("Initialising offline message delivery ...");
        self.validate()?;

        // Fail early if the table is missing
        store.connect()?.use_table(&self.schema.table)?;

        let (sender, receiver) = completion_channel();
        self.context = Some(Arc::new(DeliveryContext::new(
            self.settings(),
            store,
            transport,
            sender,
        )));
        *self.completions.lock() = Some(receiver);

        internal!(
            "Delivery configured with workers={}, batch_size={}, retry_count={}, check_time={}s",
            self.workers,
            self.batch_size,
            self.retry_count,
            self.check_time_secs
        );

        Ok(())
    }

    /// Producer-side handle for intake and dump
    ///
    /// # Errors
    /// [`SystemError::NotInitialized`] before `init()`.
    pub fn handle(&self) -> Result<SiloHandle, SystemError> {
        self.context.as_ref().map(|c| SiloHandle::new(Arc::clone(c))).ok_or_else(|| {
            SystemError::NotInitialized("Call init() before requesting a handle".to_string())
        })
    }

    /// Run the pipeline until a shutdown signal arrives
    ///
    /// Starts the workers, applies completions as they arrive, and runs the
    /// reconciler and reminder timers.
    ///
    /// ## Graceful Shutdown
    ///
    /// 1. Stop the workers and wait for every thread to exit
    /// 2. Apply completions that already arrived
    /// 3. Run a last reconciler sweep
    ///
    /// # Errors
    /// [`SystemError::NotInitialized`] before `init()` or when already
    /// serving, and [`SystemError::Spawn`] if the workers cannot start.
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!("Delivery pipeline starting");

        let Some(context) = self.context.clone() else {
            return Err(SystemError::NotInitialized(
                "Delivery pipeline not initialized. Call init() first.".to_string(),
            )
            .into());
        };

        let receiver = self.completions.lock().take();
        let Some(mut completions) = receiver else {
            return Err(SystemError::NotInitialized(
                "Delivery pipeline is already being served".to_string(),
            )
            .into());
        };

        let mut pool = WorkerPool::spawn(&context, self.workers)?;
        let reconciler = Arc::new(Mutex::new(Reconciler::new()));

        let mut reconcile_timer =
            tokio::time::interval(Duration::from_secs(self.check_time_secs));
        let reminders_enabled = self.reminder.is_some() && self.send_time_secs > 0;
        let mut reminder_timer =
            tokio::time::interval(Duration::from_secs(self.send_time_secs.max(1)));

        // Skip the first tick to avoid immediate execution
        reconcile_timer.tick().await;
        reminder_timer.tick().await;

        loop {
            tokio::select! {
                Some(completion) = completions.recv() => {
                    handle_completion(&context, completion);
                }
                _ = reconcile_timer.tick() => {
                    sweep(&context, &reconciler).await;
                }
                _ = reminder_timer.tick(), if reminders_enabled => {
                    let context = Arc::clone(&context);
                    let result = tokio::task::spawn_blocking(move || {
                        let mut conn = context.connect()?;
                        reminder::send_due(&context, conn.as_mut(), unix_now())
                    })
                    .await;

                    match result {
                        Ok(Ok(sent)) => debug!("Reminder run sent {sent}"),
                        Ok(Err(e)) => warn!("Reminder run failed: {e}"),
                        Err(e) => error!("Reminder task failed: {e}"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) => {
                            internal!("Delivery pipeline received shutdown signal");
                        }
                        Err(e) => {
                            error!("Delivery pipeline shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        if let Err(e) = tokio::task::spawn_blocking(move || pool.shutdown()).await {
            error!("Failed to join delivery workers: {e}");
        }

        while let Ok(completion) = completions.try_recv() {
            handle_completion(&context, completion);
        }
        sweep(&context, &reconciler).await;

        internal!("Delivery pipeline shutdown complete");
        Ok(())
    }
}

async fn sweep(context: &Arc<DeliveryContext>, reconciler: &Arc<Mutex<Reconciler>>) {
    let context = Arc::clone(context);
    let reconciler = Arc::clone(reconciler);

    let result =
        tokio::task::spawn_blocking(move || reconciler.lock().sweep(&context, unix_now())).await;

    if let Err(e) = result {
        error!("Reconciler task failed: {e}");
    }
}
