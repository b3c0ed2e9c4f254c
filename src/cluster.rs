//! Cluster node access
//!
//! Node lookups, the crash-resume annotation, and event publishing all go
//! through the Kubernetes API. Node lookup matches the instance id as a
//! substring of the node's provider id (provider ids look like
//! `aws:///us-west-2a/i-0123456789abcdef0`).

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, Node, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::debug;

use crate::error::Result;
use crate::event::NodeRef;
use crate::events::{ClusterEvent, EVENT_NAMESPACE, EVENT_NAME_PREFIX};

/// Abstract cluster operations consumed by the controller
#[async_trait]
pub trait ClusterNodes: Send + Sync {
    /// Nodes carrying the annotation key, paired with the annotation value
    async fn nodes_by_annotation(&self, key: &str) -> Result<Vec<(NodeRef, String)>>;

    /// The node whose provider id contains the instance id
    async fn find_node_by_instance(&self, instance_id: &str) -> Result<Option<NodeRef>>;

    /// Set an annotation on a node. An empty value clears the stored state.
    async fn annotate_node(&self, node_name: &str, key: &str, value: &str) -> Result<()>;

    /// Publish a cluster event into the default namespace
    async fn publish_event(&self, event: ClusterEvent) -> Result<()>;
}

/// Kubernetes API backed implementation
pub struct KubeClusterNodes {
    client: kube::Client,
}

impl KubeClusterNodes {
    /// Create a cluster service from a Kubernetes client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn node_ref(node: &Node) -> NodeRef {
        NodeRef {
            name: node.name_any(),
            provider_id: node
                .spec
                .as_ref()
                .and_then(|spec| spec.provider_id.clone())
                .unwrap_or_default(),
            created_at: node.metadata.creation_timestamp.clone().map(|time| time.0),
        }
    }
}

#[async_trait]
impl ClusterNodes for KubeClusterNodes {
    async fn nodes_by_annotation(&self, key: &str) -> Result<Vec<(NodeRef, String)>> {
        let nodes = self.nodes().list(&ListParams::default()).await?;
        Ok(nodes
            .items
            .iter()
            .filter_map(|node| {
                let value = node.annotations().get(key)?.clone();
                Some((Self::node_ref(node), value))
            })
            .collect())
    }

    async fn find_node_by_instance(&self, instance_id: &str) -> Result<Option<NodeRef>> {
        let nodes = self.nodes().list(&ListParams::default()).await?;
        Ok(nodes
            .items
            .iter()
            .map(Self::node_ref)
            .find(|node| node.provider_id.contains(instance_id)))
    }

    async fn annotate_node(&self, node_name: &str, key: &str, value: &str) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { key: value }
            }
        });
        self.nodes()
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn publish_event(&self, event: ClusterEvent) -> Result<()> {
        debug!(reason = event.reason.as_str(), "publishing event");
        let involved_object = if event.node_name.is_empty() {
            ObjectReference::default()
        } else {
            ObjectReference {
                kind: Some("Node".to_string()),
                name: Some(event.node_name.clone()),
                ..Default::default()
            }
        };
        let now = Utc::now();
        let object = Event {
            metadata: ObjectMeta {
                name: Some(format!(
                    "{EVENT_NAME_PREFIX}.{}",
                    now.timestamp_nanos_opt().unwrap_or_default()
                )),
                namespace: Some(EVENT_NAMESPACE.to_string()),
                ..Default::default()
            },
            reason: Some(event.reason.as_str().to_string()),
            message: Some(event.message()),
            type_: Some(event.reason.level().to_string()),
            last_timestamp: Some(Time(now)),
            involved_object,
            ..Default::default()
        };
        let api: Api<Event> = Api::namespaced(self.client.clone(), EVENT_NAMESPACE);
        api.create(&PostParams::default(), &object).await?;
        Ok(())
    }
}
