use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use tokio::{sync::mpsc, time::MissedTickBehavior};

use crate::{
    api::{self, AuthorizationStatus},
    order::OrderResource,
    trans::Transport,
    Error, ObtainError, Result,
};

/// Retrieves every authorization of `order`.
///
/// One task is spawned per authorization URL, launches spaced by `launch_interval`. Launches do not
/// wait for earlier fetches to complete. Authorizations are returned in order, alongside the
/// failed fetches keyed by domain (or URL when the order has no identifier at that position).
pub(crate) async fn fetch_authorizations(
    transport: Arc<dyn Transport>,
    order: &OrderResource,
    launch_interval: Duration,
) -> (Vec<api::Authorization>, Option<ObtainError>) {
    let urls = &order.body.authorizations;
    let (tx, mut rx) = mpsc::channel(urls.len().max(1));

    // a zero period makes `interval` panic
    let mut pacer = tokio::time::interval(launch_interval.max(Duration::from_nanos(1)));
    pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending = HashMap::with_capacity(urls.len());

    for (idx, url) in urls.iter().enumerate() {
        pacer.tick().await;

        let key = order
            .body
            .identifiers
            .get(idx)
            .map_or_else(|| url.clone(), |identifier| identifier.value.clone());
        pending.insert(idx, key);

        let transport = Arc::clone(&transport);
        let tx = tx.clone();
        let url = url.clone();

        tokio::spawn(async move {
            let result = fetch_authorization(&*transport, &url).await;
            // receiver only goes away once every completion is collected
            let _ = tx.send((idx, result)).await;
        });
    }

    drop(tx);

    let mut authzs = Vec::with_capacity(urls.len());
    let mut failures = BTreeMap::new();

    for _ in 0..urls.len() {
        let Some((idx, result)) = rx.recv().await else {
            break;
        };

        let Some(key) = pending.remove(&idx) else {
            continue;
        };

        match result {
            Ok(authz) => authzs.push((idx, authz)),
            Err(err) => {
                failures.insert(key, err);
            }
        }
    }

    // a task that panicked never reports back
    for (_, key) in pending {
        failures.insert(key, Error::protocol("authorization fetch aborted"));
    }

    authzs.sort_by_key(|(idx, _)| *idx);

    for (idx, authz) in &authzs {
        if let Some(url) = urls.get(*idx) {
            log::info!("[{}] AuthURL: {url}", authz.domain());
        }
    }

    let authzs = authzs.into_iter().map(|(_, authz)| authz).collect();
    (authzs, ObtainError::from_failures(failures))
}

async fn fetch_authorization(transport: &dyn Transport, url: &str) -> Result<api::Authorization> {
    transport.post_as_get(url).await?.json::<api::Authorization>()
}

/// Deactivates the order's authorizations that are not yet valid.
///
/// Used after a failed order so pending authorizations do not linger with the provider. Failures
/// are only logged.
pub(crate) async fn deactivate_authorizations(transport: &dyn Transport, order: &OrderResource) {
    let payload = serde_json::json!({ "status": "deactivated" });

    for url in &order.body.authorizations {
        let authz = match fetch_authorization(transport, url).await {
            Ok(authz) => authz,
            Err(err) => {
                log::info!("Unable to get authorization for deactivation: {err}");
                continue;
            }
        };

        if authz.status == AuthorizationStatus::Valid {
            continue;
        }

        log::info!("[{}] acme: Deactivating authorization: {url}", authz.domain());

        if let Err(err) = transport.post(url, &payload).await {
            log::info!("[{}] Unable to deactivate authorization: {err}", authz.domain());
        }
    }
}
