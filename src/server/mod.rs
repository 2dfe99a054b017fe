pub mod control;
pub mod worker;

use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use service::{Device, SlotTable};
use tokio::{net::TcpListener, sync::Notify, task::JoinSet, time::timeout};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
    },
};

use crate::{config::Config, statistics::Statistics};

/// Budget for one TLS handshake; a stalled peer must not pin an accept
/// slot longer than this.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on draining active workers after the shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide shutdown flag.
///
/// Set once, observed by the accept loop on its next wakeup and by
/// every worker on its next polling tick.
#[derive(Default)]
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait for the trigger. Registers before re-checking the flag so a
    /// trigger racing this call is never lost.
    pub async fn notified(&self) {
        let mut notified = pin!(self.notify.notified());
        notified.as_mut().enable();

        if self.is_triggered() {
            return;
        }

        notified.await;
    }
}

/// Run the broker until a shutdown signal arrives.
///
/// The device is opened before any worker exists and closed after the
/// last one is gone; workers only ever borrow it through the `Arc`.
pub async fn run(config: Arc<Config>, statistics: Statistics) -> Result<()> {
    let device = Arc::new(Device::open(config.server.device_index)?);
    let slots = Arc::new(SlotTable::new(config.server.max_clients));
    let shutdown = Arc::new(Shutdown::default());

    let acceptor = TlsAcceptor::from(Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                CertificateDer::pem_file_iter(&config.ssl.certificate_chain)?
                    .collect::<Result<Vec<_>, _>>()?,
                PrivateKeyDer::from_pem_file(&config.ssl.private_key)?,
            )?,
    ));

    let listener = TcpListener::bind(config.server.listen).await?;

    log::info!(
        "broker listening: listen={}, max clients={}, device={}",
        config.server.listen,
        slots.capacity(),
        device.name()
    );

    let accept = tokio::spawn(accept_loop(
        listener,
        acceptor,
        device,
        slots,
        statistics.clone(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");
    shutdown.trigger();

    accept.await?;

    log::info!(
        "broker stopped: accepted={}, rejected={}, messages={}",
        statistics.accepted(),
        statistics.rejected(),
        statistics.messages()
    );

    Ok(())
}

/// Accept all connections on the listener until shutdown.
///
/// Admission happens right after the TLS handshake: a full slot table
/// closes the stream before any parameter is exchanged, and the loop
/// keeps serving everyone already admitted.
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    device: Arc<Device>,
    slots: Arc<SlotTable>,
    statistics: Statistics,
    shutdown: Arc<Shutdown>,
) {
    let mut workers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => {
                let (socket, address) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("tcp accept error: {}", e);
                        continue;
                    }
                };

                // Disable the Nagle algorithm. The bootstrap records are
                // a handful of bytes each and the exchange is strictly
                // request/response.
                if let Err(e) = socket.set_nodelay(true) {
                    log::error!("socket set nodelay failed!: addr={address}, err={e}");
                }

                let acceptor = acceptor.clone();
                let device = device.clone();
                let slots = slots.clone();
                let statistics = statistics.clone();
                let shutdown = shutdown.clone();

                workers.spawn(async move {
                    let stream = match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            log::warn!("tls handshake failed: addr={address}, err={e}");
                            return;
                        }
                        Err(_) => {
                            log::warn!("tls handshake timed out: addr={address}");
                            return;
                        }
                    };

                    let Some(client_id) = slots.claim() else {
                        statistics.on_rejected();
                        log::warn!("admission rejected, slot table full: addr={address}");

                        // Dropping the stream here is the rejection:
                        // the peer sees the channel close before any
                        // parameter exchange.
                        return;
                    };

                    statistics.on_accepted();
                    worker::serve(stream, address, client_id, device, slots, statistics, shutdown)
                        .await;
                });
            }
        }

        // Reap finished workers so the set doesn't grow with churn.
        while workers.try_join_next().is_some() {}
    }

    if timeout(SHUTDOWN_TIMEOUT, async {
        while workers.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        log::warn!(
            "shutdown drain timed out with {} workers active, aborting them",
            workers.len()
        );

        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }
}
