use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;
use uuid::Uuid;

use super::state::{PhaseState, PhaseStateMachine};
use super::storage::PersistentStorage;
use crate::error::CoreError;

const DEFAULT_DNS_ADDR: &str = "127.0.0.2";
const DEFAULT_DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[default]
    Install,
    Join,
    Upgrade,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Join => "join",
            Self::Upgrade => "upgrade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "install" => Some(Self::Install),
            "join" => Some(Self::Join),
            "upgrade" => Some(Self::Upgrade),
            _ => None,
        }
    }
}

/// Cluster-local DNS addressing used to reach in-cluster services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsConfig {
    pub addrs: Vec<String>,
    pub port: u16,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            addrs: vec![DEFAULT_DNS_ADDR.to_string()],
            port: DEFAULT_DNS_PORT,
        }
    }
}

impl DnsConfig {
    /// Address of the first resolver as `host:port`.
    pub fn addr(&self) -> String {
        let host = self
            .addrs
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_DNS_ADDR);
        format!("{}:{}", host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub hostname: String,
    pub advertise_ip: String,
    #[serde(default)]
    pub role: String,
}

/// Snapshot of the configuration a phase executor needs.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PhaseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Server>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_storage: Option<PersistentStorage>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseError {
    pub kind: String,
    pub message: String,
}

impl PhaseError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PhaseData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseError>,
    /// Order in which the phase reached Completed or Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_seq: Option<u64>,
}

impl Phase {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            state: PhaseState::default(),
            requires: Vec::new(),
            data: None,
            phases: Vec::new(),
            started_at: None,
            completed_at: None,
            error: None,
            completion_seq: None,
        }
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_data(mut self, data: PhaseData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = phases;
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.phases.is_empty()
    }
}

/// Persisted tree of phases for a single cluster operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub operation_id: Uuid,
    pub operation_kind: OperationKind,
    pub cluster_name: String,
    #[serde(default)]
    pub dns_config: DnsConfig,
    pub phases: Vec<Phase>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    dirty: bool,
}

impl Plan {
    pub fn new(operation_kind: OperationKind, cluster_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            operation_id: Uuid::new_v4(),
            operation_kind,
            cluster_name: cluster_name.into(),
            dns_config: DnsConfig::default(),
            phases: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            dirty: false,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.operation_id = id;
        self
    }

    pub fn with_phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = phases;
        self.refresh_parents();
        self
    }

    pub fn with_dns_config(mut self, dns_config: DnsConfig) -> Self {
        self.dns_config = dns_config;
        self
    }

    pub fn get_phase(&self, id: &str) -> Result<&Phase, CoreError> {
        find(&self.phases, id).ok_or_else(|| CoreError::PhaseNotFound(id.to_string()))
    }

    pub fn children(&self, id: &str) -> Result<&[Phase], CoreError> {
        Ok(&self.get_phase(id)?.phases)
    }

    /// All phases in pre-order.
    pub fn all_phases(&self) -> Vec<&Phase> {
        let mut out = Vec::new();
        walk(&self.phases, &mut out);
        out
    }

    /// Executable phases in pre-order.
    pub fn leaves(&self) -> Vec<&Phase> {
        self.all_phases()
            .into_iter()
            .filter(|phase| phase.is_leaf())
            .collect()
    }

    pub fn leaves_of(&self, id: &str) -> Result<Vec<&Phase>, CoreError> {
        let phase = self.get_phase(id)?;
        if phase.is_leaf() {
            return Ok(vec![phase]);
        }
        let mut out = Vec::new();
        walk(&phase.phases, &mut out);
        Ok(out.into_iter().filter(|p| p.is_leaf()).collect())
    }

    /// Ancestors of a phase, root first.
    pub fn ancestors(&self, id: &str) -> Result<Vec<&Phase>, CoreError> {
        let mut trail = Vec::new();
        if !lineage(&self.phases, id, &mut trail) {
            return Err(CoreError::PhaseNotFound(id.to_string()));
        }
        trail.pop();
        Ok(trail)
    }

    /// Declared dependencies of a phase plus those inherited from its ancestors.
    pub fn effective_requires(&self, id: &str) -> Result<Vec<String>, CoreError> {
        let phase = self.get_phase(id)?;
        let mut requires: Vec<String> = Vec::new();
        for ancestor in self.ancestors(id)? {
            requires.extend(ancestor.requires.iter().cloned());
        }
        requires.extend(phase.requires.iter().cloned());
        let mut seen = HashSet::new();
        requires.retain(|dep| seen.insert(dep.clone()));
        Ok(requires)
    }

    pub fn is_runnable(&self, id: &str) -> Result<bool, CoreError> {
        let phase = self.get_phase(id)?;
        if !matches!(phase.state, PhaseState::Unstarted | PhaseState::Failed) {
            return Ok(false);
        }
        for dep in self.effective_requires(id)? {
            if self.get_phase(&dep)?.state != PhaseState::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Moves a phase to `to`, returning the state it left.
    pub fn set_phase_state(&mut self, id: &str, to: PhaseState) -> Result<PhaseState, CoreError> {
        let now = Utc::now();
        let seq = self.next_sequence();

        let current = self.get_phase(id)?;
        if to == PhaseState::Completed && !current.is_leaf() {
            let pending: Vec<&str> = current
                .phases
                .iter()
                .filter(|child| child.state != PhaseState::Completed)
                .map(|child| child.id.as_str())
                .collect();
            if !pending.is_empty() {
                return Err(CoreError::IncompleteChildren {
                    phase: id.to_string(),
                    pending: pending.join(", "),
                });
            }
        }

        let phase = find_mut(&mut self.phases, id)
            .ok_or_else(|| CoreError::PhaseNotFound(id.to_string()))?;
        let from = phase.state;
        PhaseStateMachine::validate_transition(&from, &to)?;
        phase.state = to;
        match to {
            PhaseState::InProgress => {
                phase.started_at = Some(now);
                phase.completed_at = None;
                phase.error = None;
                phase.completion_seq = None;
            }
            PhaseState::Completed | PhaseState::Failed => {
                phase.completed_at = Some(now);
                phase.completion_seq = Some(seq);
            }
            PhaseState::RolledBack => {
                phase.completed_at = Some(now);
            }
            PhaseState::Unstarted => {}
        }

        self.refresh_parents();
        self.touch(now);
        Ok(from)
    }

    /// Marks a phase Failed and records why.
    pub fn fail_phase(&mut self, id: &str, error: PhaseError) -> Result<PhaseState, CoreError> {
        let from = self.set_phase_state(id, PhaseState::Failed)?;
        self.record_error(id, error)?;
        Ok(from)
    }

    /// Attaches an error to a phase without changing its state.
    pub fn record_error(&mut self, id: &str, error: PhaseError) -> Result<(), CoreError> {
        let phase = find_mut(&mut self.phases, id)
            .ok_or_else(|| CoreError::PhaseNotFound(id.to_string()))?;
        phase.error = Some(error);
        self.touch(Utc::now());
        Ok(())
    }

    pub fn in_progress_leaves(&self) -> Vec<String> {
        self.leaves()
            .into_iter()
            .filter(|phase| phase.state == PhaseState::InProgress)
            .map(|phase| phase.id.clone())
            .collect()
    }

    /// Leaves eligible for rollback, most recently finished first.
    ///
    /// With `from`, only phases that finished at or after the earliest leaf
    /// under `from` are returned.
    pub fn rollback_candidates(&self, from: Option<&str>) -> Result<Vec<&Phase>, CoreError> {
        let threshold = match from {
            Some(id) => {
                let earliest = self
                    .leaves_of(id)?
                    .into_iter()
                    .filter_map(|phase| phase.completion_seq)
                    .min();
                match earliest {
                    Some(seq) => seq,
                    None => return Ok(Vec::new()),
                }
            }
            None => 0,
        };

        let mut candidates: Vec<&Phase> = self
            .leaves()
            .into_iter()
            .filter(|phase| matches!(phase.state, PhaseState::Completed | PhaseState::Failed))
            .filter(|phase| phase.completion_seq.is_some_and(|seq| seq >= threshold))
            .collect();
        candidates.sort_by(|a, b| b.completion_seq.cmp(&a.completion_seq));
        Ok(candidates)
    }

    /// Checks identifiers, dependency references and that the dependency graph is acyclic.
    pub fn validate(&self) -> Result<(), CoreError> {
        let phases = self.all_phases();
        let mut ids = HashSet::new();
        for phase in &phases {
            if !phase_id_pattern().is_match(&phase.id) {
                return Err(CoreError::Validation(format!(
                    "invalid phase identifier {:?}",
                    phase.id
                )));
            }
            if !ids.insert(phase.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "duplicate phase identifier {}",
                    phase.id
                )));
            }
        }
        for phase in &phases {
            for dep in &phase.requires {
                if !ids.contains(dep.as_str()) {
                    return Err(CoreError::Validation(format!(
                        "phase {} requires unknown phase {}",
                        phase.id, dep
                    )));
                }
            }
        }

        // Kahn's algorithm over dependency edges plus child -> parent containment.
        let mut edges = Vec::new();
        collect_edges(&self.phases, &[], None, &mut edges);

        let index: HashMap<&str, usize> = phases
            .iter()
            .enumerate()
            .map(|(i, phase)| (phase.id.as_str(), i))
            .collect();
        let mut in_degree = vec![0usize; phases.len()];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); phases.len()];
        for (from, to) in edges {
            let (Some(&from), Some(&to)) = (index.get(from), index.get(to)) else {
                continue;
            };
            adjacency[from].push(to);
            in_degree[to] += 1;
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &next in &adjacency[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited != phases.len() {
            let cyclic: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, degree)| **degree > 0)
                .map(|(i, _)| phases[i].id.as_str())
                .collect();
            return Err(CoreError::Validation(format!(
                "dependency cycle between phases: {}",
                cyclic.join(", ")
            )));
        }

        Ok(())
    }

    /// Finalizes the plan once every phase is Completed or RolledBack.
    pub fn mark_completed(&mut self) -> Result<(), CoreError> {
        let pending: Vec<String> = self
            .leaves()
            .into_iter()
            .filter(|phase| !phase.state.is_final())
            .map(|phase| format!("{} ({})", phase.id, phase.state))
            .collect();
        if !pending.is_empty() {
            return Err(CoreError::Conflict(format!(
                "operation {} has unfinished phases: {}",
                self.operation_id,
                pending.join(", ")
            )));
        }
        let now = Utc::now();
        self.completed_at = Some(now);
        self.touch(now);
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns whether the plan changed since the last call and clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Recomputes container phases from their children.
    pub fn refresh_parents(&mut self) {
        for phase in self.phases.iter_mut() {
            refresh(phase);
        }
    }

    fn next_sequence(&self) -> u64 {
        self.all_phases()
            .iter()
            .filter_map(|phase| phase.completion_seq)
            .max()
            .map_or(1, |seq| seq + 1)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.dirty = true;
    }
}

fn phase_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^/?[A-Za-z0-9][A-Za-z0-9_.:-]*(/[A-Za-z0-9][A-Za-z0-9_.:-]*)*$")
            .expect("Invalid phase id pattern")
    })
}

fn find<'a>(phases: &'a [Phase], id: &str) -> Option<&'a Phase> {
    for phase in phases {
        if phase.id == id {
            return Some(phase);
        }
        if let Some(found) = find(&phase.phases, id) {
            return Some(found);
        }
    }
    None
}

fn find_mut<'a>(phases: &'a mut [Phase], id: &str) -> Option<&'a mut Phase> {
    for phase in phases.iter_mut() {
        if phase.id == id {
            return Some(phase);
        }
        if let Some(found) = find_mut(&mut phase.phases, id) {
            return Some(found);
        }
    }
    None
}

fn walk<'a>(phases: &'a [Phase], out: &mut Vec<&'a Phase>) {
    for phase in phases {
        out.push(phase);
        walk(&phase.phases, out);
    }
}

fn lineage<'a>(phases: &'a [Phase], id: &str, trail: &mut Vec<&'a Phase>) -> bool {
    for phase in phases {
        trail.push(phase);
        if phase.id == id || lineage(&phase.phases, id, trail) {
            return true;
        }
        trail.pop();
    }
    false
}

fn collect_edges<'a>(
    phases: &'a [Phase],
    inherited: &[&'a str],
    parent: Option<&'a str>,
    edges: &mut Vec<(&'a str, &'a str)>,
) {
    for phase in phases {
        let mut requires = inherited.to_vec();
        requires.extend(phase.requires.iter().map(String::as_str));
        for dep in &requires {
            edges.push((*dep, phase.id.as_str()));
        }
        if let Some(parent) = parent {
            edges.push((phase.id.as_str(), parent));
        }
        collect_edges(&phase.phases, &requires, Some(phase.id.as_str()), edges);
    }
}

fn refresh(phase: &mut Phase) {
    if phase.phases.is_empty() {
        return;
    }
    for child in phase.phases.iter_mut() {
        refresh(child);
    }
    let state = derive_state(&phase.phases);
    phase.state = state;
    phase.started_at = phase.phases.iter().filter_map(|c| c.started_at).min();
    phase.completed_at = match state {
        PhaseState::Completed | PhaseState::Failed | PhaseState::RolledBack => {
            phase.phases.iter().filter_map(|c| c.completed_at).max()
        }
        _ => None,
    };
}

fn derive_state(children: &[Phase]) -> PhaseState {
    let all = |state: PhaseState| children.iter().all(|c| c.state == state);
    if all(PhaseState::Completed) {
        PhaseState::Completed
    } else if all(PhaseState::Unstarted) {
        PhaseState::Unstarted
    } else if children.iter().any(|c| c.state == PhaseState::Failed) {
        PhaseState::Failed
    } else if children.iter().all(|c| c.state.is_final())
        && children.iter().any(|c| c.state == PhaseState::RolledBack)
    {
        PhaseState::RolledBack
    } else {
        PhaseState::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_plan() -> Plan {
        Plan::new(OperationKind::Install, "example.com").with_phases(vec![
            Phase::new("/checks", "Run preflight checks"),
            Phase::new("/masters", "Install master nodes")
                .with_requires(["/checks"])
                .with_phases(vec![
                    Phase::new("/masters/node-1", "Install node-1"),
                    Phase::new("/masters/node-2", "Install node-2"),
                ]),
            Phase::new("/openebs", "Configure OpenEBS").with_requires(["/masters"]),
        ])
    }

    fn complete(plan: &mut Plan, id: &str) {
        plan.set_phase_state(id, PhaseState::InProgress).unwrap();
        plan.set_phase_state(id, PhaseState::Completed).unwrap();
    }

    #[test]
    fn test_get_phase_and_children() {
        let plan = install_plan();

        assert_eq!(plan.get_phase("/masters/node-2").unwrap().description, "Install node-2");
        let children: Vec<&str> = plan
            .children("/masters")
            .unwrap()
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(children, vec!["/masters/node-1", "/masters/node-2"]);

        let err = plan.get_phase("/bogus").unwrap_err();
        assert!(matches!(err, CoreError::PhaseNotFound(id) if id == "/bogus"));
    }

    #[test]
    fn test_leaves_are_in_plan_order() {
        let plan = install_plan();
        let leaves: Vec<&str> = plan.leaves().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            leaves,
            vec!["/checks", "/masters/node-1", "/masters/node-2", "/openebs"]
        );
    }

    #[test]
    fn test_set_phase_state_stamps_and_marks_dirty() {
        let mut plan = install_plan();
        assert!(!plan.is_dirty());

        let from = plan.set_phase_state("/checks", PhaseState::InProgress).unwrap();
        assert_eq!(from, PhaseState::Unstarted);
        assert!(plan.take_dirty());
        assert!(!plan.is_dirty());

        let phase = plan.get_phase("/checks").unwrap();
        assert!(phase.started_at.is_some());
        assert!(phase.completed_at.is_none());

        plan.set_phase_state("/checks", PhaseState::Completed).unwrap();
        let phase = plan.get_phase("/checks").unwrap();
        assert!(phase.completed_at.is_some());
        assert_eq!(phase.completion_seq, Some(1));
        assert!(plan.is_dirty());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut plan = install_plan();
        let err = plan
            .set_phase_state("/checks", PhaseState::Completed)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert_eq!(plan.get_phase("/checks").unwrap().state, PhaseState::Unstarted);
    }

    #[test]
    fn test_parent_with_incomplete_children_cannot_complete() {
        let mut plan = install_plan();
        complete(&mut plan, "/masters/node-1");

        let err = plan
            .set_phase_state("/masters", PhaseState::Completed)
            .unwrap_err();
        match err {
            CoreError::IncompleteChildren { phase, pending } => {
                assert_eq!(phase, "/masters");
                assert_eq!(pending, "/masters/node-2");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parent_state_follows_children() {
        let mut plan = install_plan();
        assert_eq!(plan.get_phase("/masters").unwrap().state, PhaseState::Unstarted);

        plan.set_phase_state("/masters/node-1", PhaseState::InProgress)
            .unwrap();
        assert_eq!(plan.get_phase("/masters").unwrap().state, PhaseState::InProgress);

        plan.fail_phase("/masters/node-1", PhaseError::new("transient_network", "reset"))
            .unwrap();
        assert_eq!(plan.get_phase("/masters").unwrap().state, PhaseState::Failed);

        plan.set_phase_state("/masters/node-1", PhaseState::InProgress)
            .unwrap();
        plan.set_phase_state("/masters/node-1", PhaseState::Completed)
            .unwrap();
        complete(&mut plan, "/masters/node-2");
        let masters = plan.get_phase("/masters").unwrap();
        assert_eq!(masters.state, PhaseState::Completed);
        assert!(masters.completed_at.is_some());
    }

    #[test]
    fn test_is_runnable_respects_inherited_dependencies() {
        let mut plan = install_plan();

        assert!(plan.is_runnable("/checks").unwrap());
        assert!(!plan.is_runnable("/masters/node-1").unwrap());
        assert_eq!(
            plan.effective_requires("/masters/node-1").unwrap(),
            vec!["/checks".to_string()]
        );

        complete(&mut plan, "/checks");
        assert!(!plan.is_runnable("/checks").unwrap());
        assert!(plan.is_runnable("/masters/node-1").unwrap());
        assert!(!plan.is_runnable("/openebs").unwrap());

        complete(&mut plan, "/masters/node-1");
        complete(&mut plan, "/masters/node-2");
        assert!(plan.is_runnable("/openebs").unwrap());
    }

    #[test]
    fn test_failed_phase_is_runnable_for_retry() {
        let mut plan = install_plan();
        plan.set_phase_state("/checks", PhaseState::InProgress).unwrap();
        plan.fail_phase("/checks", PhaseError::new("unclassified", "boom"))
            .unwrap();

        assert!(plan.is_runnable("/checks").unwrap());
        let phase = plan.get_phase("/checks").unwrap();
        assert_eq!(phase.error.as_ref().unwrap().message, "boom");
    }

    #[test]
    fn test_rollback_candidates_follow_completion_order() {
        let mut plan = install_plan();
        complete(&mut plan, "/checks");
        complete(&mut plan, "/masters/node-2");
        complete(&mut plan, "/masters/node-1");

        let order: Vec<&str> = plan
            .rollback_candidates(None)
            .unwrap()
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(order, vec!["/masters/node-1", "/masters/node-2", "/checks"]);

        let order: Vec<&str> = plan
            .rollback_candidates(Some("/masters"))
            .unwrap()
            .iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(order, vec!["/masters/node-1", "/masters/node-2"]);

        assert!(plan
            .rollback_candidates(Some("/openebs"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_validate_accepts_well_formed_plan() {
        assert!(install_plan().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_unknown_dependencies() {
        let plan = Plan::new(OperationKind::Join, "example.com").with_phases(vec![
            Phase::new("/a", "A"),
            Phase::new("/a", "A again"),
        ]);
        assert!(matches!(plan.validate(), Err(CoreError::Validation(_))));

        let plan = Plan::new(OperationKind::Join, "example.com")
            .with_phases(vec![Phase::new("/a", "A").with_requires(["/missing"])]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("/missing"));

        let plan = Plan::new(OperationKind::Join, "example.com")
            .with_phases(vec![Phase::new("bad id", "Spaces are not allowed")]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_validate_detects_cycles() {
        let plan = Plan::new(OperationKind::Upgrade, "example.com").with_phases(vec![
            Phase::new("/a", "A").with_requires(["/c"]),
            Phase::new("/b", "B").with_requires(["/a"]),
            Phase::new("/c", "C").with_requires(["/b"]),
        ]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));

        let plan = Plan::new(OperationKind::Upgrade, "example.com").with_phases(vec![
            Phase::new("/parent", "Parent")
                .with_phases(vec![Phase::new("/parent/child", "Child").with_requires(["/parent"])]),
        ]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_mark_completed_requires_final_phases() {
        let mut plan = install_plan();
        complete(&mut plan, "/checks");

        let err = plan.mark_completed().unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(!plan.is_completed());

        complete(&mut plan, "/masters/node-1");
        complete(&mut plan, "/masters/node-2");
        plan.set_phase_state("/openebs", PhaseState::InProgress).unwrap();
        plan.fail_phase("/openebs", PhaseError::new("unclassified", "boom"))
            .unwrap();
        plan.set_phase_state("/openebs", PhaseState::RolledBack).unwrap();

        plan.mark_completed().unwrap();
        assert!(plan.is_completed());
    }

    #[test]
    fn test_dns_config_addr() {
        assert_eq!(DnsConfig::default().addr(), "127.0.0.2:53");
        let dns = DnsConfig {
            addrs: vec!["10.100.0.10".to_string(), "10.100.0.11".to_string()],
            port: 5353,
        };
        assert_eq!(dns.addr(), "10.100.0.10:5353");
    }

    #[test]
    fn test_plan_serialization_skips_dirty_flag() {
        let mut plan = install_plan();
        plan.set_phase_state("/checks", PhaseState::InProgress).unwrap();

        let json = serde_json::to_string(&plan).unwrap();
        assert!(!json.contains("dirty"));
        let restored: Plan = serde_json::from_str(&json).unwrap();
        assert!(!restored.is_dirty());
        assert_eq!(
            restored.get_phase("/checks").unwrap().state,
            PhaseState::InProgress
        );
    }
}
