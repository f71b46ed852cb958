use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;

use documentdb_core::event::{sort_events, ClusterEvent, EventKind, EventQuery};
use documentdb_core::types::ClusterRef;
use documentdb_core::Result;

use crate::kubernetes::map_kube_error;
use crate::provider::EventSource;

/// Events whose involved object is the cluster resource.
pub struct KubeEventSource {
    client: Client,
}

impl KubeEventSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

pub fn field_selector(cluster: &ClusterRef) -> String {
    format!(
        "involvedObject.kind=DocumentDB,involvedObject.name={}",
        cluster.name
    )
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn events(
        &self,
        cluster: &ClusterRef,
        query: EventQuery,
    ) -> Result<BoxStream<'static, Result<ClusterEvent>>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let selector = field_selector(cluster);

        let list = api
            .list(&ListParams::default().fields(&selector))
            .await
            .map_err(|e| map_kube_error(e, cluster))?;
        let mut backlog: Vec<ClusterEvent> = list
            .items
            .iter()
            .filter_map(convert_event)
            .filter(|e| query.admits(e))
            .collect();
        sort_events(&mut backlog);
        tracing::debug!(cluster = %cluster, count = backlog.len(), "Listed events");

        let mut seen: HashSet<(String, i32)> =
            backlog.iter().map(|e| (e.uid.clone(), e.count)).collect();
        let initial = stream::iter(backlog.into_iter().map(Ok));
        if !query.follow {
            return Ok(initial.boxed());
        }

        let cluster = cluster.clone();
        let updates = watcher(api, watcher::Config::default().fields(&selector))
            .applied_objects()
            .filter_map(move |object| {
                let next = match object {
                    Ok(event) => convert_event(&event)
                        .filter(|e| query.admits(e) && seen.insert((e.uid.clone(), e.count)))
                        .map(Ok),
                    Err(error) => {
                        // Watch errors are retried by the watcher itself.
                        tracing::warn!(cluster = %cluster, "event watch error: {error}");
                        None
                    }
                };
                async move { next }
            });
        Ok(initial.chain(updates).boxed())
    }
}

/// Convert a Kubernetes event, skipping ones without a uid or timestamp.
pub fn convert_event(event: &Event) -> Option<ClusterEvent> {
    let uid = event.metadata.uid.clone()?;
    let timestamp = event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.first_timestamp.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))?;
    let kind = match event.type_.as_deref() {
        Some("Warning") => EventKind::Warning,
        _ => EventKind::Normal,
    };
    let object = format!(
        "{}/{}",
        event.involved_object.kind.as_deref().unwrap_or("Unknown"),
        event.involved_object.name.as_deref().unwrap_or("")
    );
    Some(ClusterEvent {
        uid,
        timestamp,
        kind,
        reason: event.reason.clone().unwrap_or_default(),
        message: event.message.clone().unwrap_or_default(),
        object,
        count: event.count.unwrap_or(1),
    })
}
