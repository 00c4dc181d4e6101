//! Service runner.
//!
//! Wires the feed client, the datastore with its derived views, the
//! restriction registry, and the client server together, and keeps the
//! receive loop alive until a shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use crate::apps::{self, AppContext};
use crate::applause::Applause;
use crate::auth::TokenTable;
use crate::config::Config;
use crate::configview::ConfigView;
use crate::core::Shutdown;
use crate::datastore::{
    BroadcasterLimits, Datastore, DatastoreError, DerivedViews, KeysChanged,
};
use crate::feed::{SocketFeed, UpstreamFeed};
use crate::permission::{GroupIds, PermissionIndex};
use crate::projector::Projectors;
use crate::required::RequiredUsers;
use crate::restrict::Restricter;
use crate::server::ClientServer;

/// Everything a connection needs, built once per process.
#[derive(Clone)]
pub struct Service {
    pub datastore: Arc<Datastore>,
    pub restricter: Arc<Restricter>,
    pub perms: Arc<PermissionIndex>,
}

/// Build the datastore and restriction registries around a feed.
///
/// Bootstraps from `full_data`, so the feed must be reachable.
pub fn build_service(
    feed: Box<dyn UpstreamFeed>,
    config: &Config,
) -> Result<Service, DatastoreError> {
    let config_view = Arc::new(ConfigView::new());
    let perms = Arc::new(PermissionIndex::new(
        GroupIds {
            default_group: config.groups.default_group,
            admin_group: config.groups.admin_group,
        },
        Arc::clone(&config_view),
    ));
    let required = Arc::new(RequiredUsers::new(apps::required_users()));
    let projectors = Arc::new(Projectors::new(apps::slides()));
    let applause = Arc::new(Applause::new(Arc::clone(&config_view)));

    let views = DerivedViews {
        config: Arc::clone(&config_view),
        perms: Arc::clone(&perms),
        required: Arc::clone(&required),
        projectors,
        applause,
    };

    let datastore = Arc::new(Datastore::new(
        feed,
        views,
        BroadcasterLimits {
            max_subscribers: config.limits.max_subscribers,
            queue_len: config.limits.subscriber_queue_len,
        },
        config.limits.gap_reset_limit,
    )?);

    let context = AppContext {
        perms: Arc::clone(&perms),
        required,
        config: config_view,
    };
    let restricter = Arc::new(Restricter::new(
        apps::restricters(&context),
        Arc::clone(&perms),
    ));

    Ok(Service {
        datastore,
        restricter,
        perms,
    })
}

/// Drive `keys_changed` and fan the outcomes out to the loops.
///
/// Feed errors never kill the loop: transient ones retry with backoff,
/// protocol violations drop the feed connection (the client redials on the
/// next call) and retry as well.
pub fn run_feed_loop(datastore: &Datastore, shutdown: &Shutdown, backoff_max: Duration) {
    let base = Duration::from_millis(250);
    let mut backoff = base;
    loop {
        if shutdown.is_triggered() {
            return;
        }
        match datastore.keys_changed(shutdown) {
            Ok(KeysChanged::Shutdown) => return,
            Ok(outcome) => {
                datastore.notify(&outcome);
                backoff = base;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::warn!("feed receive failed, retrying: {err}");
                } else {
                    tracing::error!("feed protocol error, reconnecting: {err}");
                }
                sleep_with_shutdown(shutdown, backoff);
                backoff = (backoff * 2).min(backoff_max);
            }
        }
    }
}

/// Run the whole service until SIGINT/SIGTERM.
pub fn run_service(config: Config) -> crate::Result<()> {
    let shutdown = Shutdown::new();
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.flag());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.flag());

    let backoff_max = Duration::from_millis(config.upstream.connect_backoff_max_ms);
    let backoff_base = Duration::from_millis(config.upstream.connect_backoff_ms);

    // Bootstrap needs a full snapshot; keep trying until the upstream is up.
    let service = loop {
        if shutdown.is_triggered() {
            return Ok(());
        }
        let feed = SocketFeed::new(config.upstream.addr.clone());
        match feed.connect().and_then(|()| {
            build_service(Box::new(feed), &config).map_err(|err| match err {
                DatastoreError::Feed(err) => err,
                other => {
                    tracing::error!("bootstrap failed: {other}");
                    crate::feed::FeedError::Protocol(other.to_string())
                }
            })
        }) {
            Ok(service) => break service,
            Err(err) => {
                tracing::warn!("upstream not ready, retrying: {err}");
                sleep_with_shutdown(&shutdown, backoff_base);
            }
        }
    };
    tracing::info!(
        change_id = service.datastore.current_id(),
        "datastore bootstrapped"
    );

    let receive_handle = {
        let datastore = Arc::clone(&service.datastore);
        let shutdown = shutdown.clone();
        std::thread::spawn(move || run_feed_loop(&datastore, &shutdown, backoff_max))
    };

    let server = ClientServer {
        datastore: Arc::clone(&service.datastore),
        restricter: Arc::clone(&service.restricter),
        perms: Arc::clone(&service.perms),
        auther: Arc::new(TokenTable::new(
            config.auth.tokens.clone().into_iter().collect(),
        )),
    };
    let result = server.serve(&config.server.socket_path(), &shutdown);

    shutdown.trigger();
    let _ = receive_handle.join();
    result?;
    Ok(())
}

fn sleep_with_shutdown(shutdown: &Shutdown, duration: Duration) {
    let step = Duration::from_millis(50);
    let mut remaining = duration;
    while !remaining.is_zero() {
        if shutdown.is_triggered() {
            return;
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
}
