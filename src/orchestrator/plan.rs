// src/orchestrator/plan.rs
// Deployment planning: a LabSpec becomes a typed task DAG. Validation
// happens here, at plan time; the executor assumes a well-formed graph.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::config::Config;
use crate::errors::{DomeError, DomeResult};
use crate::model::{LabSpec, NetworkSpec, PostConfigStep, VmSpec};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    Network,
    Vm,
    PostConfig,
    Validate,
}

#[derive(Debug, Clone)]
pub struct ReadinessCriteria {
    pub require_guest_agent: bool,
    pub tcp_probe_port: Option<u16>,
    pub ip_timeout: Duration,
}

impl Default for ReadinessCriteria {
    fn default() -> Self {
        ReadinessCriteria {
            require_guest_agent: true,
            tcp_probe_port: None,
            ip_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    EnsureNetwork(NetworkSpec),
    CreateVm(VmSpec),
    WaitForReady { vm_name: String, criteria: ReadinessCriteria },
    PostConfig { vm_name: String, step: PostConfigStep, index: usize },
    ValidateLab,
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub kind: TaskKind,
    pub depends_on: Vec<TaskId>,
    pub priority: i32,
    pub class: TaskClass,
    pub timeout: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub lab_name: String,
    pub tasks: Vec<TaskNode>,
}

impl Plan {
    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

pub fn build_plan(spec: &LabSpec, config: &Config) -> DomeResult<Plan> {
    if spec.vms.is_empty() {
        return Err(DomeError::validation(format!("lab '{}' declares no vms", spec.name)));
    }

    let mut network_names = HashSet::new();
    for network in &spec.networks {
        if !network_names.insert(network.name.as_str()) {
            return Err(DomeError::validation(format!(
                "lab '{}' declares network '{}' twice",
                spec.name, network.name
            )));
        }
        network.cidr.parse::<ipnet::IpNet>().map_err(|e| {
            DomeError::validation(format!("network '{}' cidr '{}': {e}", network.name, network.cidr))
        })?;
    }

    let mut vm_names = HashSet::new();
    for vm in &spec.vms {
        if !vm_names.insert(vm.name.as_str()) {
            return Err(DomeError::validation(format!(
                "lab '{}' declares vm '{}' twice",
                spec.name, vm.name
            )));
        }
    }
    for vm in &spec.vms {
        for network in &vm.networks {
            if !network_names.contains(network.as_str()) {
                return Err(DomeError::validation(format!(
                    "vm '{}' references unknown network '{}'",
                    vm.name, network
                )));
            }
        }
        for (index, step) in vm.post_config.iter().enumerate() {
            for required in &step.requires {
                if required == &vm.name {
                    return Err(DomeError::validation(format!(
                        "vm '{}' post_config step {index} requires itself",
                        vm.name
                    )));
                }
                if !vm_names.contains(required.as_str()) {
                    return Err(DomeError::validation(format!(
                        "vm '{}' post_config step {index} requires unknown vm '{required}'",
                        vm.name
                    )));
                }
            }
        }
    }

    let retry = config.orchestrator.retry;
    let default_timeout = Duration::from_secs(config.orchestrator.task_timeout_default_s);
    let mut tasks = Vec::new();

    for network in &spec.networks {
        tasks.push(TaskNode {
            id: format!("net:{}", network.name),
            kind: TaskKind::EnsureNetwork(network.clone()),
            depends_on: vec![],
            priority: -10,
            class: TaskClass::Network,
            timeout: Duration::from_secs(60),
            max_attempts: retry.max_attempts,
        });
    }

    let mut ready_ids = Vec::new();
    let mut pc_ids = Vec::new();

    for vm in &spec.vms {
        let vm_id = format!("vm:{}", vm.name);
        let ready_id = format!("ready:{}", vm.name);
        tasks.push(TaskNode {
            id: vm_id.clone(),
            kind: TaskKind::CreateVm(vm.clone()),
            depends_on: vm.networks.iter().map(|n| format!("net:{n}")).collect(),
            priority: vm.priority,
            class: TaskClass::Vm,
            timeout: default_timeout,
            max_attempts: retry.max_attempts,
        });

        let criteria = ReadinessCriteria {
            tcp_probe_port: vm.tags.get("tcp_probe").and_then(|p| p.parse().ok()),
            ..Default::default()
        };
        tasks.push(TaskNode {
            id: ready_id.clone(),
            kind: TaskKind::WaitForReady { vm_name: vm.name.clone(), criteria },
            depends_on: vec![vm_id],
            priority: vm.priority,
            class: TaskClass::Vm,
            timeout: default_timeout,
            max_attempts: retry.max_attempts,
        });
        ready_ids.push(ready_id.clone());

        for (index, step) in vm.post_config.iter().enumerate() {
            let id = format!("pc:{}:{index}", vm.name);
            let mut depends_on = vec![ready_id.clone()];
            for required in &step.requires {
                depends_on.push(format!("ready:{required}"));
            }
            if index > 0 {
                // Steps of one VM apply in declaration order.
                depends_on.push(format!("pc:{}:{}", vm.name, index - 1));
            }
            tasks.push(TaskNode {
                id: id.clone(),
                kind: TaskKind::PostConfig { vm_name: vm.name.clone(), step: step.clone(), index },
                depends_on,
                priority: vm.priority,
                class: TaskClass::PostConfig,
                timeout: Duration::from_secs(config.postconfig.timeout_s),
                max_attempts: retry.max_attempts,
            });
            pc_ids.push(id);
        }
    }

    let mut validate_deps = ready_ids;
    validate_deps.extend(pc_ids);
    tasks.push(TaskNode {
        id: "validate".to_string(),
        kind: TaskKind::ValidateLab,
        depends_on: validate_deps,
        priority: i32::MAX,
        class: TaskClass::Validate,
        timeout: Duration::from_secs(60),
        max_attempts: 1,
    });

    verify_acyclic(&tasks)?;
    Ok(Plan { lab_name: spec.name.clone(), tasks })
}

/// Kahn's algorithm; anything left unvisited sits on a cycle. Also rejects
/// dependencies on tasks that do not exist.
fn verify_acyclic(tasks: &[TaskNode]) -> DomeResult<()> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        in_degree.entry(task.id.as_str()).or_insert(0);
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(DomeError::validation(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.id
                )));
            }
            *in_degree.entry(task.id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }
    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop() {
        visited += 1;
        if let Some(children) = dependents.get(id) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(*child);
                    }
                }
            }
        }
    }
    if visited != tasks.len() {
        return Err(DomeError::validation("lab task graph contains a dependency cycle"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CredentialsBundle, NetworkMode, OsFamily, PlatformId};
    use std::collections::BTreeMap;

    fn vm(name: &str, networks: Vec<String>, post_config: Vec<PostConfigStep>) -> VmSpec {
        VmSpec {
            name: name.into(),
            os_family: OsFamily::Ubuntu,
            os_version: "22.04".into(),
            cores: 2,
            memory_mib: 2048,
            disk_gib: 20,
            networks,
            ip_policy: None,
            credentials: CredentialsBundle { username: "ubuntu".into(), ..Default::default() },
            post_config,
            tags: BTreeMap::new(),
            priority: 0,
        }
    }

    fn lab(vms: Vec<VmSpec>) -> LabSpec {
        LabSpec {
            name: "demo".into(),
            platform: PlatformId::from("mock:a"),
            networks: vec![NetworkSpec {
                name: "lan".into(),
                cidr: "10.101.0.0/24".into(),
                mode: NetworkMode::Isolated,
                vlan: Some(101),
                gateway: None,
            }],
            vms,
            tags: BTreeMap::new(),
        }
    }

    fn step(playbook: &str, requires: Vec<String>) -> PostConfigStep {
        PostConfigStep { playbook: playbook.into(), vars: BTreeMap::new(), requires }
    }

    #[test]
    fn two_vm_lab_plans_the_expected_graph() {
        let spec = lab(vec![
            vm("web", vec!["lan".into()], vec![step("web/install_apache.yml", vec![])]),
            vm("db", vec!["lan".into()], vec![]),
        ]);
        let plan = build_plan(&spec, &Config::default()).unwrap();

        let create_web = plan.task("vm:web").unwrap();
        assert_eq!(create_web.depends_on, vec!["net:lan"]);
        let ready_web = plan.task("ready:web").unwrap();
        assert_eq!(ready_web.depends_on, vec!["vm:web"]);
        let pc = plan.task("pc:web:0").unwrap();
        assert_eq!(pc.depends_on, vec!["ready:web"]);
        let validate = plan.task("validate").unwrap();
        assert!(validate.depends_on.contains(&"ready:db".to_string()));
        assert!(validate.depends_on.contains(&"pc:web:0".to_string()));
    }

    #[test]
    fn post_config_waits_for_upstream_vms() {
        let spec = lab(vec![
            vm("web", vec!["lan".into()], vec![step("web/wire_to_db.yml", vec!["db".into()])]),
            vm("db", vec!["lan".into()], vec![]),
        ]);
        let plan = build_plan(&spec, &Config::default()).unwrap();
        let pc = plan.task("pc:web:0").unwrap();
        assert!(pc.depends_on.contains(&"ready:web".to_string()));
        assert!(pc.depends_on.contains(&"ready:db".to_string()));
    }

    #[test]
    fn cyclic_task_graph_is_a_validation_error() {
        let node = |id: &str, deps: Vec<&str>| TaskNode {
            id: id.into(),
            kind: TaskKind::ValidateLab,
            depends_on: deps.into_iter().map(String::from).collect(),
            priority: 0,
            class: TaskClass::Validate,
            timeout: Duration::from_secs(1),
            max_attempts: 1,
        };
        let err = verify_acyclic(&[node("a", vec!["b"]), node("b", vec!["a"])]).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn self_requiring_step_is_rejected() {
        let spec = lab(vec![vm("a", vec!["lan".into()], vec![step("a.yml", vec!["a".into()])])]);
        let err = build_plan(&spec, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("requires itself"));
    }

    #[test]
    fn unknown_network_reference_is_rejected() {
        let spec = lab(vec![vm("web", vec!["dmz".into()], vec![])]);
        let err = build_plan(&spec, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("unknown network"));
    }

    #[test]
    fn duplicate_vm_names_are_rejected() {
        let spec = lab(vec![
            vm("web", vec!["lan".into()], vec![]),
            vm("web", vec!["lan".into()], vec![]),
        ]);
        assert!(build_plan(&spec, &Config::default()).is_err());
    }

    #[test]
    fn empty_lab_is_rejected() {
        let spec = lab(vec![]);
        assert!(build_plan(&spec, &Config::default()).is_err());
    }
}
