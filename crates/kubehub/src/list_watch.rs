//! `ListWatch` backed by a `kube::Api`.

use std::fmt::Debug;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, VersionMatch, WatchParams};
use kube::core::{ApiResource, DynamicObject, WatchEvent as KubeEvent};
use kube::{Client, Resource};
use mirra_core::{Error, ListOptions, ListWatch, ObjectList, Result, Status, WatchEvent, WatchStream};
use serde::de::DeserializeOwned;
use tracing::debug;

/// API servers reject watch timeouts of 295s and above.
pub const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// `ListOptions::namespace` is sent as a `metadata.namespace` field selector
/// and ignored for cluster-scoped kinds.
pub struct KubeListWatch<K> {
    api: Api<K>,
    name: String,
    namespaced: bool,
}

impl<K> KubeListWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>, name: impl Into<String>) -> Self {
        Self { api, name: name.into(), namespaced: true }
    }

    /// Mark `K` as cluster-scoped so namespace requests are dropped.
    pub fn cluster_scoped(mut self) -> Self {
        self.namespaced = false;
        self
    }

    pub fn api(&self) -> &Api<K> {
        &self.api
    }

    fn scope(&self, opts: &ListOptions) -> ListOptions {
        scope_options(opts, self.namespaced)
    }
}

impl<K> KubeListWatch<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Every object of `K` across the cluster.
    pub fn all(client: Client) -> Self {
        Self::new(Api::all(client), K::plural(&()).into_owned())
    }
}

impl<K> KubeListWatch<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self::new(Api::namespaced(client, namespace), K::plural(&()).into_owned())
    }

    /// `None` (or an empty namespace) watches all namespaces.
    pub fn scoped(client: Client, namespace: Option<&str>) -> Self {
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => Self::namespaced(client, ns),
            None => Self::all(client),
        }
    }
}

impl KubeListWatch<DynamicObject> {
    /// Untyped access to a discovered resource.
    pub fn dynamic(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Self {
        let api = match namespace.filter(|ns| namespaced && !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(client, ns, ar),
            None => Api::all_with(client, ar),
        };
        let lw = Self::new(api, ar.plural.clone());
        if namespaced {
            lw
        } else {
            lw.cluster_scoped()
        }
    }
}

#[async_trait::async_trait]
impl<K> ListWatch<K> for KubeListWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self, opts: &ListOptions) -> Result<ObjectList<K>> {
        let mut lp = list_params(&self.scope(opts));
        let mut items = Vec::new();
        let mut pages = 0usize;
        loop {
            let page = self.api.list(&lp).await.map_err(map_error)?;
            pages += 1;
            items.extend(page.items);
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(token) => {
                    // continuation pages are pinned by the token, not by a version
                    lp.resource_version = None;
                    lp.version_match = None;
                    lp.continue_token = Some(token);
                }
                None => {
                    debug!(kind = %self.name, pages, count = items.len(), "list complete");
                    return Ok(ObjectList {
                        items,
                        resource_version: page.metadata.resource_version.unwrap_or_default(),
                    });
                }
            }
        }
    }

    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream<K>> {
        let wp = watch_params(&self.scope(opts));
        let stream = self.api.watch(&wp, &opts.resource_version).await.map_err(map_error)?;
        Ok(stream
            .map(|item| match item {
                Ok(ev) => Ok(convert_event(ev)),
                Err(e) => Err(map_error(e)),
            })
            .boxed())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Fold the namespace into the field selector.
pub(crate) fn scope_options(opts: &ListOptions, namespaced: bool) -> ListOptions {
    let mut out = opts.clone();
    let ns = match out.namespace.take().filter(|ns| namespaced && !ns.is_empty()) {
        Some(ns) => ns,
        None => return out,
    };
    let pin = format!("metadata.namespace={}", ns);
    out.field_selector = match out.field_selector.take().filter(|f| !f.is_empty()) {
        Some(fields) => Some(format!("{},{}", fields, pin)),
        None => Some(pin),
    };
    out
}

pub(crate) fn list_params(opts: &ListOptions) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(labels) = opts.label_selector.as_deref() {
        lp = lp.labels(labels);
    }
    if let Some(fields) = opts.field_selector.as_deref() {
        lp = lp.fields(fields);
    }
    if let Some(limit) = opts.limit {
        lp = lp.limit(limit);
    }
    if let Some(secs) = opts.timeout_secs {
        lp = lp.timeout(secs);
    }
    if !opts.resource_version.is_empty() {
        lp = lp.at(&opts.resource_version).matching(VersionMatch::NotOlderThan);
    }
    lp
}

pub(crate) fn watch_params(opts: &ListOptions) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(labels) = opts.label_selector.as_deref() {
        wp = wp.labels(labels);
    }
    if let Some(fields) = opts.field_selector.as_deref() {
        wp = wp.fields(fields);
    }
    if let Some(secs) = opts.timeout_secs {
        wp = wp.timeout(secs.min(MAX_WATCH_TIMEOUT_SECS));
    }
    if !opts.allow_bookmarks {
        wp = wp.disable_bookmarks();
    }
    wp
}

pub(crate) fn convert_event<K>(ev: KubeEvent<K>) -> WatchEvent<K> {
    match ev {
        KubeEvent::Added(o) => WatchEvent::Added(o),
        KubeEvent::Modified(o) => WatchEvent::Modified(o),
        KubeEvent::Deleted(o) => WatchEvent::Deleted(o),
        KubeEvent::Bookmark(b) => WatchEvent::Bookmark { resource_version: b.metadata.resource_version },
        KubeEvent::Error(e) => WatchEvent::Error(Status { code: e.code, reason: e.reason, message: e.message }),
    }
}

/// 410 Gone is an expired cursor; payload errors are per-event decode failures.
pub fn map_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == Error::GONE => Error::Expired(resp.message),
        kube::Error::Api(resp) => Error::Transport(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
        kube::Error::SerdeError(e) => Error::Decode(e.to_string()),
        other => Error::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ErrorResponse;

    #[test]
    fn list_params_follow_options() {
        let opts = ListOptions {
            label_selector: Some("app=web".into()),
            field_selector: Some("metadata.name=cfg".into()),
            resource_version: "42".into(),
            limit: Some(250),
            ..Default::default()
        };
        let lp = list_params(&opts);
        assert_eq!(lp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(lp.field_selector.as_deref(), Some("metadata.name=cfg"));
        assert_eq!(lp.limit, Some(250));
        assert_eq!(lp.resource_version.as_deref(), Some("42"));
        assert!(matches!(lp.version_match, Some(VersionMatch::NotOlderThan)));

        let fresh = list_params(&ListOptions::default());
        assert!(fresh.resource_version.is_none());
        assert!(fresh.version_match.is_none());
    }

    #[test]
    fn namespace_becomes_field_selector() {
        let opts = ListOptions {
            namespace: Some("prod".into()),
            field_selector: Some("metadata.name=cfg".into()),
            ..Default::default()
        };
        let scoped = scope_options(&opts, true);
        assert_eq!(scoped.namespace, None);
        assert_eq!(scoped.field_selector.as_deref(), Some("metadata.name=cfg,metadata.namespace=prod"));
        assert_eq!(list_params(&scoped).field_selector.as_deref(), Some("metadata.name=cfg,metadata.namespace=prod"));

        let bare = scope_options(&ListOptions { namespace: Some("prod".into()), ..Default::default() }, true);
        assert_eq!(watch_params(&bare).field_selector.as_deref(), Some("metadata.namespace=prod"));

        let cluster = scope_options(&opts, false);
        assert_eq!(cluster.field_selector.as_deref(), Some("metadata.name=cfg"));
        assert_eq!(scope_options(&ListOptions::default(), true), ListOptions::default());
    }

    #[test]
    fn watch_params_clamp_timeout() {
        let opts = ListOptions { timeout_secs: Some(3600), allow_bookmarks: true, ..Default::default() };
        let wp = watch_params(&opts);
        assert_eq!(wp.timeout, Some(MAX_WATCH_TIMEOUT_SECS));
        assert!(wp.bookmarks);

        let plain = watch_params(&ListOptions { timeout_secs: Some(60), ..Default::default() });
        assert_eq!(plain.timeout, Some(60));
        assert!(!plain.bookmarks);
    }

    #[test]
    fn gone_maps_to_expired() {
        let gone = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version: 1 (42)".into(),
            reason: "Expired".into(),
            code: 410,
        });
        assert!(map_error(gone).is_expired());

        let forbidden = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "configmaps is forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert!(matches!(map_error(forbidden), Error::Transport(_)));

        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(map_error(kube::Error::SerdeError(bad)), Error::Decode(_)));
    }

    #[test]
    fn converts_wire_events() {
        let bookmark: KubeEvent<ConfigMap> = serde_json::from_value(serde_json::json!({
            "type": "BOOKMARK",
            "object": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "resourceVersion": "12" } }
        }))
        .unwrap();
        match convert_event(bookmark) {
            WatchEvent::Bookmark { resource_version } => assert_eq!(resource_version, "12"),
            other => panic!("unexpected {:?}", other),
        }

        let gone: KubeEvent<ConfigMap> = serde_json::from_value(serde_json::json!({
            "type": "ERROR",
            "object": { "status": "Failure", "message": "too old", "reason": "Expired", "code": 410 }
        }))
        .unwrap();
        match convert_event(gone) {
            WatchEvent::Error(status) => assert_eq!(status.code, Error::GONE),
            other => panic!("unexpected {:?}", other),
        }

        let added: KubeEvent<ConfigMap> = serde_json::from_value(serde_json::json!({
            "type": "ADDED",
            "object": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cfg", "resourceVersion": "13" } }
        }))
        .unwrap();
        let ev = convert_event(added);
        assert_eq!(ev.resource_version(), Some("13"));
        assert_eq!(ev.type_name(), "added");
    }
}
