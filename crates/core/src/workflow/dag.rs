use crate::error::ValidationError;
use crate::manifest::{HealthSignal, Manifest, StepDeclaration};
use crate::types::{GlobalContext, PlanId, RetryPolicy, StepId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;
use std::time::Duration;

/// A compiled step: parameters interpolated, idempotency key fixed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSpec {
    pub id: StepId,
    pub kind: String,
    pub description: Option<String>,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub dependencies: Vec<StepId>,
    pub idempotency_key: String,
    pub retry: RetryPolicy,
    #[serde(rename = "timeout_ms", serialize_with = "serialize_timeout")]
    pub timeout: Option<Duration>,
    pub secrets: Vec<String>,
}

fn serialize_timeout<S: serde::Serializer>(
    timeout: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match timeout {
        Some(timeout) => serializer.serialize_some(&(timeout.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

impl StepSpec {
    /// String parameter lookup
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|value| value.as_str())
    }
}

/// Immutable, validated DAG of steps for one orchestration run
#[derive(Debug)]
pub struct Plan {
    id: PlanId,
    context: GlobalContext,
    health: Option<HealthSignal>,
    graph: DiGraph<StepSpec, ()>,
    step_indices: HashMap<StepId, NodeIndex>,
    order: Vec<StepId>,
    ancestors: HashMap<StepId, BTreeSet<StepId>>,
    descendants: HashMap<StepId, BTreeSet<StepId>>,
}

/// Compile a manifest into a plan
pub fn compile(manifest: &Manifest) -> Result<Plan, ValidationError> {
    Plan::compile(
        &manifest.steps,
        manifest.context.clone(),
        manifest.health.clone(),
    )
}

impl Plan {
    /// Build a plan from a manifest
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, ValidationError> {
        compile(manifest)
    }

    /// Validate declarations and build the DAG. Never touches external systems.
    pub fn compile(
        declarations: &[StepDeclaration],
        context: GlobalContext,
        health: Option<HealthSignal>,
    ) -> Result<Self, ValidationError> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        // Add all steps as nodes
        for declaration in declarations {
            validate_declaration(declaration)?;
            if step_indices.contains_key(&declaration.id) {
                return Err(ValidationError::DuplicateStep(declaration.id.clone()));
            }
            let spec = resolve_step(declaration, &context)?;
            let node = graph.add_node(spec);
            step_indices.insert(declaration.id.clone(), node);
        }

        // Add dependency edges (dep -> step)
        for declaration in declarations {
            let step_idx = step_indices[&declaration.id];
            let mut seen = HashSet::new();
            for dep_id in &declaration.depends_on {
                let dep_idx = step_indices.get(dep_id).ok_or_else(|| {
                    ValidationError::UnknownDependency {
                        step: declaration.id.clone(),
                        dependency: dep_id.clone(),
                    }
                })?;
                if seen.insert(dep_id.clone()) {
                    graph.add_edge(*dep_idx, step_idx, ());
                }
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(ValidationError::Cycle { cycle });
        }

        let mut topo = Topo::new(&graph);
        let mut order = Vec::with_capacity(graph.node_count());
        while let Some(node) = topo.next(&graph) {
            order.push(graph[node].id.clone());
        }

        let mut ancestors: HashMap<StepId, BTreeSet<StepId>> = HashMap::new();
        for step_id in &order {
            let mut closure = BTreeSet::new();
            for dep in &graph[step_indices[step_id]].dependencies {
                closure.insert(dep.clone());
                if let Some(transitive) = ancestors.get(dep) {
                    closure.extend(transitive.iter().cloned());
                }
            }
            ancestors.insert(step_id.clone(), closure);
        }

        let mut descendants: HashMap<StepId, BTreeSet<StepId>> = order
            .iter()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (step_id, closure) in &ancestors {
            for ancestor in closure {
                if let Some(entry) = descendants.get_mut(ancestor) {
                    entry.insert(step_id.clone());
                }
            }
        }

        let id = plan_identity(&graph, &context);

        Ok(Self {
            id,
            context,
            health,
            graph,
            step_indices,
            order,
            ancestors,
            descendants,
        })
    }

    pub fn id(&self) -> &PlanId {
        &self.id
    }

    pub fn context(&self) -> &GlobalContext {
        &self.context
    }

    pub fn health(&self) -> Option<&HealthSignal> {
        self.health.as_ref()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn step(&self, step_id: &StepId) -> Option<&StepSpec> {
        self.step_indices.get(step_id).map(|idx| &self.graph[*idx])
    }

    /// Step ids in topological order (dependencies first)
    pub fn execution_order(&self) -> &[StepId] {
        &self.order
    }

    /// Steps in topological order
    pub fn steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.order.iter().filter_map(|id| self.step(id))
    }

    /// Direct dependencies of a step
    pub fn dependencies(&self, step_id: &StepId) -> &[StepId] {
        self.step(step_id)
            .map(|step| step.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Direct dependents of a step
    pub fn dependents(&self, step_id: &StepId) -> Vec<StepId> {
        let Some(node) = self.step_indices.get(step_id) else {
            return Vec::new();
        };
        let mut dependents: Vec<StepId> = self
            .graph
            .neighbors_directed(*node, Direction::Outgoing)
            .map(|n| self.graph[n].id.clone())
            .collect();
        dependents.sort();
        dependents
    }

    /// Transitive dependency closure, cached at compile time
    pub fn ancestors(&self, step_id: &StepId) -> Option<&BTreeSet<StepId>> {
        self.ancestors.get(step_id)
    }

    /// Every step that depends on `step_id`, directly or transitively
    pub fn descendants(&self, step_id: &StepId) -> Option<&BTreeSet<StepId>> {
        self.descendants.get(step_id)
    }

    /// Steps grouped by depth; everything in one wave may run concurrently
    pub fn waves(&self) -> Vec<Vec<StepId>> {
        let mut depth: HashMap<&StepId, usize> = HashMap::new();
        let mut waves: Vec<Vec<StepId>> = Vec::new();

        for step_id in &self.order {
            let level = self
                .dependencies(step_id)
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(step_id, level);
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(step_id.clone());
        }

        waves
    }
}

fn validate_declaration(declaration: &StepDeclaration) -> Result<(), ValidationError> {
    let invalid = |message: &str| ValidationError::InvalidStep {
        step: declaration.id.clone(),
        message: message.to_string(),
    };

    if declaration.id.as_str().trim().is_empty() {
        return Err(invalid("step id must not be empty"));
    }
    if declaration.id.as_str().contains('/') {
        return Err(invalid("step id must not contain '/'"));
    }
    if declaration.kind.trim().is_empty() {
        return Err(invalid("kind must not be empty"));
    }
    if declaration.retry.max_attempts == 0 {
        return Err(invalid("retry.maxAttempts must be at least 1"));
    }
    if declaration.secrets.iter().any(|name| name.trim().is_empty()) {
        return Err(invalid("secret names must not be empty"));
    }
    Ok(())
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(\$)?\{([A-Za-z0-9_.-]+)\}").expect("placeholder pattern is valid")
    })
}

/// Replace `${name}` references to context values inside string parameters.
/// `$${name}` is kept as a literal `${name}` for shell scripts.
fn interpolate(
    value: &serde_json::Value,
    context: &GlobalContext,
    step: &StepId,
) -> Result<serde_json::Value, ValidationError> {
    use serde_json::Value;

    match value {
        Value::String(text) => {
            let pattern = placeholder_pattern();
            if let Some(missing) = pattern
                .captures_iter(text)
                .filter(|caps| caps.get(1).is_none())
                .map(|caps| caps[2].to_string())
                .find(|name| context.get(name).is_none())
            {
                return Err(ValidationError::UnresolvedPlaceholder {
                    step: step.clone(),
                    name: missing,
                });
            }
            let replaced = pattern.replace_all(text, |caps: &regex::Captures<'_>| {
                if caps.get(1).is_some() {
                    format!("${{{}}}", &caps[2])
                } else {
                    context.get(&caps[2]).unwrap_or_default().to_string()
                }
            });
            Ok(Value::String(replaced.into_owned()))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate(item, context, step))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), interpolate(item, context, step)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_step(
    declaration: &StepDeclaration,
    context: &GlobalContext,
) -> Result<StepSpec, ValidationError> {
    let mut parameters = BTreeMap::new();
    for (key, value) in &declaration.parameters {
        parameters.insert(key.clone(), interpolate(value, context, &declaration.id)?);
    }

    let mut dependencies = Vec::new();
    for dep in &declaration.depends_on {
        if !dependencies.contains(dep) {
            dependencies.push(dep.clone());
        }
    }

    let idempotency_key = match &declaration.idempotency_key {
        Some(key) => key.clone(),
        None => derive_idempotency_key(&declaration.id, &declaration.kind, &parameters),
    };

    Ok(StepSpec {
        id: declaration.id.clone(),
        kind: declaration.kind.clone(),
        description: declaration.description.clone(),
        parameters,
        dependencies,
        idempotency_key,
        retry: declaration.retry.clone(),
        timeout: declaration.timeout_ms.map(Duration::from_millis),
        secrets: declaration.secrets.clone(),
    })
}

/// Deterministic key from step identity and resolved inputs
pub fn derive_idempotency_key(
    id: &StepId,
    kind: &str,
    parameters: &BTreeMap<String, serde_json::Value>,
) -> String {
    let canonical = serde_json::json!({
        "id": id,
        "kind": kind,
        "parameters": parameters,
    });
    let hash = Sha256::digest(canonical.to_string().as_bytes());
    hex::encode(hash)
}

fn plan_identity(graph: &DiGraph<StepSpec, ()>, context: &GlobalContext) -> PlanId {
    let mut steps: Vec<&StepSpec> = graph.node_weights().collect();
    steps.sort_by(|a, b| a.id.cmp(&b.id));

    let steps: Vec<serde_json::Value> = steps
        .into_iter()
        .map(|step| {
            let mut dependencies = step.dependencies.clone();
            dependencies.sort();
            serde_json::json!({
                "id": step.id,
                "kind": step.kind,
                "parameters": step.parameters,
                "depends_on": dependencies,
                "idempotency_key": step.idempotency_key,
                "retry": step.retry,
                "timeout_ms": step.timeout.map(|t| t.as_millis() as u64),
                "secrets": step.secrets,
            })
        })
        .collect();

    let canonical = serde_json::json!({
        "context": context.entries(),
        "steps": steps,
    });
    PlanId(hex::encode(Sha256::digest(canonical.to_string().as_bytes())))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Three-colour depth-first search. Reaching an in-progress node closes a cycle;
/// the returned path starts and ends on that node.
fn find_cycle(graph: &DiGraph<StepSpec, ()>) -> Option<Vec<StepId>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut path = Vec::new();

    for start in graph.node_indices() {
        if marks[start.index()] == Mark::Unvisited {
            if let Some(cycle) = visit(graph, start, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit(
    graph: &DiGraph<StepSpec, ()>,
    node: NodeIndex,
    marks: &mut [Mark],
    path: &mut Vec<NodeIndex>,
) -> Option<Vec<StepId>> {
    marks[node.index()] = Mark::InProgress;
    path.push(node);

    for next in graph.neighbors_directed(node, Direction::Outgoing) {
        match marks[next.index()] {
            Mark::InProgress => {
                let start = path.iter().position(|n| *n == next).unwrap_or(0);
                let mut cycle: Vec<StepId> =
                    path[start..].iter().map(|n| graph[*n].id.clone()).collect();
                cycle.push(graph[next].id.clone());
                return Some(cycle);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(graph, next, marks, path) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    path.pop();
    marks[node.index()] = Mark::Done;
    None
}
