use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

use crate::planner::plan::{Operation, OperationType};
use crate::state::models::{DatabaseUserSpec, Resource, ResourceKey, ResourceKind};

/// A dependency graph over operations. Node weights are indexes into the
/// operation slice the graph was built from. An edge A -> B means A must
/// finish before B starts.
pub type OperationGraph = DiGraph<usize, ()>;

/// Build the dependency graph for a set of operations.
///
/// Creates, updates and unchanged resources follow the forward order
/// (project, clusters, roles, users and the rest). Deletes run in reverse:
/// a child delete precedes the delete of its parent. A NetworkAccess delete
/// precedes the create that replaces it.
pub fn build_operation_graph(operations: &[Operation]) -> OperationGraph {
    let mut graph = DiGraph::new();
    let mut nodes: Vec<NodeIndex> = Vec::with_capacity(operations.len());
    let mut forward: HashMap<ResourceKey, NodeIndex> = HashMap::new();
    let mut deletes: HashMap<ResourceKey, NodeIndex> = HashMap::new();

    for (i, op) in operations.iter().enumerate() {
        let idx = graph.add_node(i);
        nodes.push(idx);
        if op.op_type == OperationType::Delete {
            deletes.insert(op.key(), idx);
        } else {
            forward.insert(op.key(), idx);
        }
    }

    let forward_resources: Vec<&Resource> = operations
        .iter()
        .filter(|op| op.op_type != OperationType::Delete)
        .filter_map(|op| op.resource())
        .collect();
    let deleted_resources: Vec<&Resource> = operations
        .iter()
        .filter(|op| op.op_type == OperationType::Delete)
        .filter_map(|op| op.resource())
        .collect();

    for (i, op) in operations.iter().enumerate() {
        let Some(resource) = op.resource() else {
            continue;
        };
        let node = nodes[i];

        if op.op_type == OperationType::Delete {
            // Parents are deleted after their children.
            for parent in dependency_keys(resource, &deleted_resources) {
                if let Some(&parent_node) = deletes.get(&parent) {
                    if parent_node != node {
                        graph.update_edge(node, parent_node, ());
                    }
                }
            }
        } else {
            for parent in dependency_keys(resource, &forward_resources) {
                if let Some(&parent_node) = forward.get(&parent) {
                    if parent_node != node {
                        graph.update_edge(parent_node, node, ());
                    }
                }
            }
            if op.resource_kind == ResourceKind::NetworkAccess && op.op_type == OperationType::Create {
                if let Some(&delete_node) = deletes.get(&op.key()) {
                    graph.update_edge(delete_node, node, ());
                }
            }
        }
    }

    graph
}

/// Build a graph over desired resources alone, treating each as a create.
/// Used to validate manifests before any live state is known.
pub fn build_resource_graph(resources: &[Resource]) -> (OperationGraph, Vec<Operation>) {
    let operations: Vec<Operation> = resources
        .iter()
        .map(|r| Operation {
            op_type: OperationType::Create,
            resource_kind: r.kind,
            resource_name: r.name().to_string(),
            current: None,
            desired: Some(r.clone()),
            field_changes: Vec::new(),
            impact: Default::default(),
            stage: 0,
        })
        .collect();
    (build_operation_graph(&operations), operations)
}

/// Keys of the resources `resource` depends on, drawn from `candidates`.
pub fn dependency_keys(resource: &Resource, candidates: &[&Resource]) -> Vec<ResourceKey> {
    let mut keys = Vec::new();
    let mut push = |key: ResourceKey| {
        if key != resource.key() && !keys.contains(&key) {
            keys.push(key);
        }
    };

    let of_kind = |kind: ResourceKind| candidates.iter().filter(move |c| c.kind == kind);

    if resource.kind != ResourceKind::Project {
        for project in of_kind(ResourceKind::Project) {
            push(project.key());
        }
    }

    match resource.kind {
        ResourceKind::DatabaseUser | ResourceKind::NetworkAccess => {
            for cluster in of_kind(ResourceKind::Cluster) {
                push(cluster.key());
            }
        }
        ResourceKind::DatabaseRole => match resource.cluster_name() {
            Some(cluster) => push(ResourceKey::new(ResourceKind::Cluster, cluster)),
            None => {
                for cluster in of_kind(ResourceKind::Cluster) {
                    push(cluster.key());
                }
            }
        },
        ResourceKind::SearchIndex | ResourceKind::VpcEndpoint => {
            if let Some(cluster) = resource.cluster_name() {
                push(ResourceKey::new(ResourceKind::Cluster, cluster));
            }
        }
        _ => {}
    }

    // A user granted a custom role waits for that role.
    if resource.kind == ResourceKind::DatabaseUser {
        if let Ok(user) = resource.typed_spec::<DatabaseUserSpec>() {
            for role in of_kind(ResourceKind::DatabaseRole) {
                let role_name = role.spec_str("roleName").unwrap_or(role.name());
                let role_db = role.spec_str("databaseName");
                let granted = user.roles.iter().any(|assignment| {
                    assignment.role_name == role_name
                        && role_db.map_or(true, |db| db == assignment.database_name)
                });
                if granted {
                    push(role.key());
                }
            }
        }
    }

    for target in &resource.metadata.depends_on {
        for key in resolve_reference(target, candidates) {
            push(key);
        }
    }

    keys
}

/// Resolve a `dependsOn` entry, either `Kind/name` or a bare name.
fn resolve_reference(target: &str, candidates: &[&Resource]) -> Vec<ResourceKey> {
    if let Some((kind, name)) = target.split_once('/') {
        if let Ok(kind) = kind.parse::<ResourceKind>() {
            return vec![ResourceKey::new(kind, name)];
        }
    }
    candidates
        .iter()
        .filter(|c| c.name() == target)
        .map(|c| c.key())
        .collect()
}
