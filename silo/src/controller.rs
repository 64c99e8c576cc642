use std::sync::LazyLock;

use serde::Deserialize;
use silo_common::{
    Signal, internal,
    logging::{self, LogConfig},
    tracing,
};
use silo_delivery::{Silo, SiloHandle, TransportConfig};
use silo_store::StoreConfig;
use tokio::sync::broadcast;

#[derive(Debug, Default, Deserialize)]
pub struct Controller {
    #[serde(default)]
    logging: LogConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    transport: TransportConfig,
    #[serde(alias = "silo", default)]
    delivery: Silo,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

impl Controller {
    /// Parse a controller from RON
    ///
    /// # Errors
    /// If the text is not a valid configuration.
    pub fn from_ron(config: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(config)?)
    }

    /// Connect the delivery pipeline to its store and transport
    ///
    /// # Errors
    /// If the delivery configuration is invalid.
    pub fn init(&mut self) -> anyhow::Result<SiloHandle> {
        let store = self.store.build(&self.delivery.schema);
        let transport = self.transport.build();

        self.delivery.init(store, transport)?;
        Ok(self.delivery.handle()?)
    }

    /// Run the delivery pipeline until SIGINT or SIGTERM
    ///
    /// # Errors
    /// If the pipeline fails to initialise or to start its workers.
    pub async fn run(mut self) -> anyhow::Result<()> {
        logging::init(&self.logging);
        self.init()?;

        internal!("Controller running");

        let serve = self.delivery.serve(SHUTDOWN_BROADCAST.subscribe());
        tokio::pin!(serve);

        let finished = tokio::select! {
            r = &mut serve => Some(r.map_err(anyhow::Error::from)),
            r = shutdown() => r.err().map(Err),
        };

        // Let the pipeline drain before returning
        let ret = match finished {
            Some(ret) => ret,
            None => serve.await.map_err(anyhow::Error::from),
        };

        internal!("Shutting down...");
        tracing::debug!("Controller stopped: {ret:?}");

        ret
    }
}
