//! Graph backends: the fixed traversals the query service relies on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{OpsError, Result};
use crate::gateway::{Gateway, Target, UpstreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Job,
    Workstation,
    Event,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    DependsOn,
    RunsOn,
    Produces,
    Next,
    RelatesTo,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::DependsOn => "DEPENDS_ON",
            EdgeKind::RunsOn => "RUNS_ON",
            EdgeKind::Produces => "PRODUCES",
            EdgeKind::Next => "NEXT",
            EdgeKind::RelatesTo => "RELATES_TO",
        }
    }
}

/// A node reached by a traversal and its hop distance from the start node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEntry {
    pub job: String,
    pub depth: u32,
}

/// Fixed traversals over the external graph.
///
/// `ancestors_of(n, e)` follows `e` edges outward from `n` (what `n` depends on / runs on);
/// `descendants_of(n, e)` walks `e` edges backward (what depends on `n`). Unknown nodes yield
/// empty results, never errors.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    async fn ancestors_of(&self, node: &str, edge: EdgeKind) -> Result<Vec<DependencyEntry>>;

    async fn descendants_of(&self, node: &str, edge: EdgeKind) -> Result<Vec<DependencyEntry>>;

    /// Number of incoming `edge` edges per node of `kind` (downstream fan-out for DEPENDS_ON).
    async fn degree_counts(&self, kind: NodeKind, edge: EdgeKind) -> Result<Vec<(String, usize)>>;
}

#[derive(Default)]
struct Adjacency {
    nodes: HashMap<String, NodeKind>,
    outgoing: HashMap<(String, EdgeKind), Vec<String>>,
    incoming: HashMap<(String, EdgeKind), Vec<String>>,
}

/// In-process graph for tests and small installations.
#[derive(Default, Clone)]
pub struct InMemoryGraph {
    inner: Arc<RwLock<Adjacency>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, name: &str, kind: NodeKind) {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        g.nodes.entry(name.to_string()).or_insert(kind);
    }

    /// Add `from -[edge]-> to`. Missing endpoints are created as jobs.
    pub fn add_edge(&self, from: &str, edge: EdgeKind, to: &str) {
        let mut g = self.inner.write().unwrap_or_else(|p| p.into_inner());
        g.nodes.entry(from.to_string()).or_insert(NodeKind::Job);
        g.nodes.entry(to.to_string()).or_insert(NodeKind::Job);
        let out = g.outgoing.entry((from.to_string(), edge)).or_default();
        if !out.iter().any(|n| n == to) {
            out.push(to.to_string());
        }
        let inc = g.incoming.entry((to.to_string(), edge)).or_default();
        if !inc.iter().any(|n| n == from) {
            inc.push(from.to_string());
        }
    }

    /// `job` depends on `upstream`.
    pub fn depends_on(&self, job: &str, upstream: &str) {
        self.add_edge(job, EdgeKind::DependsOn, upstream);
    }

    pub fn runs_on(&self, job: &str, workstation: &str) {
        self.add_node(workstation, NodeKind::Workstation);
        self.add_edge(job, EdgeKind::RunsOn, workstation);
    }

    fn walk(&self, start: &str, edge: EdgeKind, forward: bool) -> Vec<DependencyEntry> {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let adjacency = if forward { &g.outgoing } else { &g.incoming };
        if !g.nodes.contains_key(start) {
            return Vec::new();
        }
        let mut seen: HashSet<String> = HashSet::from([start.to_string()]);
        let mut queue: VecDeque<(String, u32)> = VecDeque::from([(start.to_string(), 0)]);
        let mut out = Vec::new();
        while let Some((node, depth)) = queue.pop_front() {
            if let Some(next) = adjacency.get(&(node, edge)) {
                for n in next {
                    if seen.insert(n.clone()) {
                        out.push(DependencyEntry {
                            job: n.clone(),
                            depth: depth + 1,
                        });
                        queue.push_back((n.clone(), depth + 1));
                    }
                }
            }
        }
        out
    }
}

#[async_trait]
impl GraphBackend for InMemoryGraph {
    async fn ancestors_of(&self, node: &str, edge: EdgeKind) -> Result<Vec<DependencyEntry>> {
        Ok(self.walk(node, edge, true))
    }

    async fn descendants_of(&self, node: &str, edge: EdgeKind) -> Result<Vec<DependencyEntry>> {
        Ok(self.walk(node, edge, false))
    }

    async fn degree_counts(&self, kind: NodeKind, edge: EdgeKind) -> Result<Vec<(String, usize)>> {
        let g = self.inner.read().unwrap_or_else(|p| p.into_inner());
        Ok(g.nodes
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(name, _)| {
                let fan_out = g
                    .incoming
                    .get(&(name.clone(), edge))
                    .map(|v| v.len())
                    .unwrap_or(0);
                (name.clone(), fan_out)
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct TraversalRows {
    #[serde(default)]
    rows: Vec<DependencyEntry>,
}

#[derive(Deserialize)]
struct DegreeRow {
    node: String,
    degree: usize,
}

#[derive(Deserialize)]
struct DegreeRows {
    #[serde(default)]
    rows: Vec<DegreeRow>,
}

/// External graph service reached through the gateway's `Graph` target.
pub struct HttpGraphBackend {
    gateway: Arc<Gateway>,
}

impl HttpGraphBackend {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    async fn traversal(
        &self,
        query: &'static str,
        body: serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        let result = self
            .gateway
            .call(Target::Graph, query, move |client| async move {
                let res = client
                    .http()
                    .post(client.url(&format!("traversals/{}", query)))
                    .json(&body)
                    .send()
                    .await
                    .map_err(UpstreamError::from_reqwest)?;
                if !res.status().is_success() {
                    return Err(UpstreamError::from_status(res.status()));
                }
                res.json::<serde_json::Value>()
                    .await
                    .map_err(UpstreamError::from_reqwest)
            })
            .await;
        match result {
            Ok(v) => Ok(Some(v)),
            // Unknown start node.
            Err(OpsError::Upstream { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn rows(&self, query: &'static str, node: &str, edge: EdgeKind) -> Result<Vec<DependencyEntry>> {
        let body = json!({ "job": node, "edge": edge.as_str() });
        match self.traversal(query, body).await? {
            Some(v) => Ok(serde_json::from_value::<TraversalRows>(v)?.rows),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl GraphBackend for HttpGraphBackend {
    async fn ancestors_of(&self, node: &str, edge: EdgeKind) -> Result<Vec<DependencyEntry>> {
        self.rows("ancestors-of", node, edge).await
    }

    async fn descendants_of(&self, node: &str, edge: EdgeKind) -> Result<Vec<DependencyEntry>> {
        self.rows("descendants-of", node, edge).await
    }

    async fn degree_counts(&self, kind: NodeKind, edge: EdgeKind) -> Result<Vec<(String, usize)>> {
        let body = json!({ "node_kind": kind, "edge": edge.as_str() });
        match self.traversal("degree-count", body).await? {
            Some(v) => Ok(serde_json::from_value::<DegreeRows>(v)?
                .rows
                .into_iter()
                .map(|r| (r.node, r.degree))
                .collect()),
            None => Ok(Vec::new()),
        }
    }
}
