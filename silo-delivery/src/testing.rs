use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use silo_common::unix_now;
use silo_store::{MessageId, Store, TestStore, Value};

use crate::{
    processor::context::{DeliveryContext, Settings},
    transport::{Completion, CompletionReceiver, TestTransport, completion_channel},
};

pub const HOST: &str = "example.org";
pub const SENDER: &str = "sip:bob@example.org";

pub struct Fixture {
    pub context: Arc<DeliveryContext>,
    pub store: TestStore,
    pub transport: TestTransport,
    completions: Mutex<CompletionReceiver>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let store = TestStore::new(&settings.schema);
        let transport = TestTransport::new(200);
        let (tx, rx) = completion_channel();

        let context = Arc::new(DeliveryContext::new(
            settings,
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            tx,
        ));

        Self {
            context,
            store,
            transport,
            completions: Mutex::new(rx),
        }
    }

    /// Store a plain text message for `user@example.org`
    pub fn insert(&self, user: &str, body: &str) -> MessageId {
        self.insert_with(user, body, unix_now() + 3600, 0)
    }

    pub fn insert_with(&self, user: &str, body: &str, exp_time: i64, snd_time: i64) -> MessageId {
        let schema = &self.context.settings.schema;
        let mut conn = self.store.memory().connect().unwrap();
        conn.use_table(&schema.table).unwrap();

        conn.insert(&[
            (schema.from.as_str(), Value::from(SENDER)),
            (schema.to.as_str(), Value::from(format!("sip:{user}@{HOST}"))),
            (schema.uri_user.as_str(), Value::from(user)),
            (schema.uri_host.as_str(), Value::from(HOST)),
            (schema.body.as_str(), Value::from(body)),
            (schema.ctype.as_str(), Value::from("text/plain")),
            (schema.exp_time.as_str(), Value::Int(exp_time)),
            (schema.inc_time.as_str(), Value::Int(0)),
            (schema.snd_time.as_str(), Value::Int(snd_time)),
        ])
        .unwrap()
    }

    pub fn rows(&self) -> usize {
        self.store.memory().len(&self.context.settings.schema.table)
    }

    pub fn next_completion(&self, timeout: Duration) -> Option<Completion> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.completions.lock();

        loop {
            if let Ok(completion) = rx.try_recv() {
                return Some(completion);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }

    condition()
}
