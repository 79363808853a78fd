// src/overseer/gate.rs
// Request gating. Six safety checks in fixed order; the first failure denies
// the request with a structured, stable reason. Production protection fails
// closed: unreadable member records deny rather than pass.

use tracing::info;

use crate::config::OverseerConfig;
use crate::model::{
    DenialReason, EntityKind, EntityRef, LabRecord, PlatformId, Request, RequestKind, VmActionKind,
    VmRecord,
};
use crate::overseer::knowledge::KnowledgeIndex;
use crate::registry::Registry;

pub const RULE_AUTHORIZATION: &str = "authorization";
pub const RULE_PRODUCTION: &str = "production_protected";
pub const RULE_MASS_ACTION: &str = "mass_action_exceeded";
pub const RULE_PLATFORM: &str = "platform_unreachable";
pub const RULE_MISSING: &str = "resource_missing";
pub const RULE_KNOWN_FAILURE: &str = "known_failure";

pub struct Gate<'a> {
    pub registry: &'a Registry,
    pub knowledge: &'a KnowledgeIndex,
    pub config: &'a OverseerConfig,
}

/// What the gate could learn about the request's target.
struct TargetInfo {
    exists: bool,
    production: bool,
    members_unreadable: bool,
    scope: usize,
    platform: Option<PlatformId>,
}

impl Gate<'_> {
    pub async fn evaluate(&self, request: &Request) -> Result<(), DenialReason> {
        // 1. Authorization: requester must meet the action's minimum role.
        let needed = request.kind.min_role();
        if request.requester_role < needed {
            return Err(deny(
                RULE_AUTHORIZATION,
                format!(
                    "{} requires role {:?}, requester '{}' holds {:?}",
                    request.kind.name(),
                    needed,
                    request.requester,
                    request.requester_role
                ),
                Some("submit through an account with the required role".to_string()),
            ));
        }

        let target = self.load_target(&request.kind).await;

        // 2. Production protection for destructive actions.
        if request.kind.is_destructive() && !request.kind.force_production() {
            if target.members_unreadable {
                return Err(deny(
                    RULE_PRODUCTION,
                    "target member records could not be read; refusing destructive action".to_string(),
                    Some("wait for the registry to settle, then retry".to_string()),
                ));
            }
            if target.production {
                return Err(deny(
                    RULE_PRODUCTION,
                    format!("{} targets a production-tagged resource", request.kind.name()),
                    Some("re-submit with force_production=true if this is intentional".to_string()),
                ));
            }
        }

        // 3. Mass-action cap on destruction scope.
        if request.kind.is_destructive() && target.scope > self.config.mass_action_cap {
            return Err(deny(
                RULE_MASS_ACTION,
                format!(
                    "estimated scope {} vms exceeds the cap of {}",
                    target.scope, self.config.mass_action_cap
                ),
                Some("split the request into smaller batches".to_string()),
            ));
        }

        // 4. Platform reachability within the freshness horizon.
        if let Some(platform) = &target.platform {
            if !self
                .registry
                .platform_fresh(platform, self.config.freshness_horizon_s)
                .await
            {
                return Err(deny(
                    RULE_PLATFORM,
                    format!(
                        "platform '{platform}' has no successful poll within {}s",
                        self.config.freshness_horizon_s
                    ),
                    Some("check platform connectivity and polling agents".to_string()),
                ));
            }
        }

        // 5. Resource existence (creation requests are exempt).
        if !request.kind.is_creation() && !matches!(request.kind, RequestKind::Alert { .. }) && !target.exists {
            return Err(deny(
                RULE_MISSING,
                format!("target of {} does not exist in the registry", request.kind.name()),
                None,
            ));
        }

        // 6. Prior-incident lookup on the request fingerprint.
        if let Some(incident) = self.knowledge.find_incident(&request.kind.fingerprint()) {
            return Err(deny(
                RULE_KNOWN_FAILURE,
                format!("a prior incident matches this request ({})", incident.doc),
                Some(incident.text.lines().next().unwrap_or_default().to_string()),
            ));
        }

        info!(request = %request.request_id, kind = request.kind.name(), "request approved");
        Ok(())
    }

    async fn load_target(&self, kind: &RequestKind) -> TargetInfo {
        match kind {
            RequestKind::DeployLab { spec } => TargetInfo {
                exists: true,
                production: false,
                members_unreadable: false,
                scope: spec.vms.len(),
                platform: Some(spec.platform.clone()),
            },
            RequestKind::DestroyLab { lab_id, .. } => {
                let lab: Option<LabRecord> = self
                    .registry
                    .get(&EntityRef::lab(lab_id.clone()))
                    .await
                    .ok()
                    .flatten();
                match lab {
                    Some(lab) => {
                        let members: Vec<VmRecord> = self
                            .registry
                            .list::<VmRecord>(EntityKind::Vm)
                            .await
                            .into_iter()
                            .filter(|vm| vm.owner_lab.as_deref() == Some(lab_id.as_str()))
                            .collect();
                        let members_unreadable = !lab.vm_ids.is_empty() && members.is_empty();
                        TargetInfo {
                            exists: true,
                            production: lab.is_production() || members.iter().any(VmRecord::is_production),
                            members_unreadable,
                            scope: lab.vm_ids.len().max(members.len()),
                            platform: Some(lab.spec.platform.clone()),
                        }
                    }
                    None => TargetInfo {
                        exists: false,
                        production: false,
                        members_unreadable: false,
                        scope: 0,
                        platform: None,
                    },
                }
            }
            RequestKind::VmAction { platform_id, vm_id, action, .. } => {
                let vm: Option<VmRecord> = self
                    .registry
                    .get(&EntityRef::vm(platform_id, vm_id))
                    .await
                    .ok()
                    .flatten();
                let scope = if *action == VmActionKind::Delete { 1 } else { 0 };
                match vm {
                    Some(vm) => TargetInfo {
                        exists: true,
                        production: vm.is_production(),
                        members_unreadable: false,
                        scope,
                        platform: Some(platform_id.clone()),
                    },
                    None => TargetInfo {
                        exists: false,
                        production: false,
                        members_unreadable: false,
                        scope,
                        platform: Some(platform_id.clone()),
                    },
                }
            }
            RequestKind::ReconcileDrift { entity_ref } => TargetInfo {
                exists: self.registry.get_raw(entity_ref).await.is_some(),
                production: false,
                members_unreadable: false,
                scope: 0,
                platform: None,
            },
            RequestKind::Alert { .. } => TargetInfo {
                exists: true,
                production: false,
                members_unreadable: false,
                scope: 0,
                platform: None,
            },
        }
    }
}

fn deny(rule: &str, message: String, remediation: Option<String>) -> DenialReason {
    info!(rule, %message, "request denied");
    DenialReason { rule: rule.to_string(), message, remediation }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CredentialsBundle, LabSpec, LabStatus, OsFamily, Role, StateChangeSource, VmSpec, VmStatus,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn lab_record(lab_id: &str, production: bool, vm_count: usize) -> LabRecord {
        let mut tags = BTreeMap::new();
        if production {
            tags.insert("production".to_string(), "true".to_string());
        }
        LabRecord {
            lab_id: lab_id.into(),
            spec: LabSpec {
                name: lab_id.into(),
                platform: PlatformId::from("mock:a"),
                networks: vec![],
                vms: vec![],
                tags,
            },
            status: LabStatus::Ready,
            vm_ids: (0..vm_count).map(|i| format!("{}", 100 + i)).collect(),
            network_ids: vec![],
            start_time: Utc::now(),
            end_time: None,
            deployment_log: vec![],
        }
    }

    fn vm_record(vm_id: &str, owner: &str, production: bool) -> VmRecord {
        let mut tags = BTreeMap::new();
        if production {
            tags.insert("production".to_string(), "true".to_string());
        }
        VmRecord {
            vm_id: vm_id.into(),
            platform_id: PlatformId::from("mock:a"),
            spec: VmSpec {
                name: format!("vm-{vm_id}"),
                os_family: OsFamily::Ubuntu,
                os_version: "22.04".into(),
                cores: 2,
                memory_mib: 2048,
                disk_gib: 20,
                networks: vec![],
                ip_policy: None,
                credentials: CredentialsBundle { username: "ubuntu".into(), ..Default::default() },
                post_config: vec![],
                tags: BTreeMap::new(),
                priority: 0,
            },
            status: VmStatus::Running,
            primary_ip: None,
            expected_ip: None,
            guest_tools: Default::default(),
            owner_lab: Some(owner.into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tags,
            ip_fallback: false,
        }
    }

    async fn seeded_registry(lab: &LabRecord, vms: &[VmRecord]) -> Registry {
        let registry = Registry::in_memory(64);
        registry
            .upsert(&lab.entity_ref(), lab, StateChangeSource::Orchestrator)
            .await
            .unwrap();
        for vm in vms {
            registry
                .upsert(&vm.entity_ref(), vm, StateChangeSource::Orchestrator)
                .await
                .unwrap();
        }
        registry.record_poll(&PlatformId::from("mock:a")).await;
        registry
    }

    fn destroy(lab_id: &str, force: bool, role: Role) -> Request {
        Request::new(
            RequestKind::DestroyLab { lab_id: lab_id.into(), force_production: force },
            "alice",
            role,
        )
    }

    #[tokio::test]
    async fn insufficient_role_is_denied_first() {
        let lab = lab_record("lab-1", true, 1);
        let registry = seeded_registry(&lab, &[vm_record("100", "lab-1", true)]).await;
        let knowledge = KnowledgeIndex::empty();
        let config = OverseerConfig::default();
        let gate = Gate { registry: &registry, knowledge: &knowledge, config: &config };

        let denial = gate.evaluate(&destroy("lab-1", false, Role::Viewer)).await.unwrap_err();
        // Authorization outranks production protection.
        assert_eq!(denial.rule, RULE_AUTHORIZATION);
    }

    #[tokio::test]
    async fn production_lab_is_protected_until_forced() {
        let lab = lab_record("lab-prod", true, 1);
        let registry = seeded_registry(&lab, &[vm_record("100", "lab-prod", false)]).await;
        let knowledge = KnowledgeIndex::empty();
        let config = OverseerConfig::default();
        let gate = Gate { registry: &registry, knowledge: &knowledge, config: &config };

        let denial = gate.evaluate(&destroy("lab-prod", false, Role::Admin)).await.unwrap_err();
        assert_eq!(denial.rule, RULE_PRODUCTION);

        gate.evaluate(&destroy("lab-prod", true, Role::Admin)).await.unwrap();
    }

    #[tokio::test]
    async fn production_tag_on_a_member_vm_protects_the_lab() {
        let lab = lab_record("lab-1", false, 1);
        let registry = seeded_registry(&lab, &[vm_record("100", "lab-1", true)]).await;
        let knowledge = KnowledgeIndex::empty();
        let config = OverseerConfig::default();
        let gate = Gate { registry: &registry, knowledge: &knowledge, config: &config };

        let denial = gate.evaluate(&destroy("lab-1", false, Role::Admin)).await.unwrap_err();
        assert_eq!(denial.rule, RULE_PRODUCTION);
    }

    #[tokio::test]
    async fn unreadable_members_fail_closed() {
        // Lab claims vms but no member records are loadable.
        let lab = lab_record("lab-1", false, 3);
        let registry = seeded_registry(&lab, &[]).await;
        let knowledge = KnowledgeIndex::empty();
        let config = OverseerConfig::default();
        let gate = Gate { registry: &registry, knowledge: &knowledge, config: &config };

        let denial = gate.evaluate(&destroy("lab-1", false, Role::Admin)).await.unwrap_err();
        assert_eq!(denial.rule, RULE_PRODUCTION);
    }

    #[tokio::test]
    async fn mass_action_cap_denies_sweeping_destroys() {
        let lab = lab_record("lab-big", false, 20);
        let vms: Vec<VmRecord> = (0..20).map(|i| vm_record(&format!("{}", 100 + i), "lab-big", false)).collect();
        let registry = seeded_registry(&lab, &vms).await;
        let knowledge = KnowledgeIndex::empty();
        let config = OverseerConfig::default();
        let gate = Gate { registry: &registry, knowledge: &knowledge, config: &config };

        let denial = gate.evaluate(&destroy("lab-big", false, Role::Admin)).await.unwrap_err();
        assert_eq!(denial.rule, RULE_MASS_ACTION);
    }

    #[tokio::test]
    async fn never_polled_platform_denies() {
        let lab = lab_record("lab-1", false, 1);
        let vm = vm_record("100", "lab-1", false);
        // No record_poll call: the platform has no freshness at all.
        let registry = Registry::in_memory(64);
        registry
            .upsert(&lab.entity_ref(), &lab, StateChangeSource::Orchestrator)
            .await
            .unwrap();
        registry
            .upsert(&vm.entity_ref(), &vm, StateChangeSource::Orchestrator)
            .await
            .unwrap();
        let knowledge = KnowledgeIndex::empty();
        let config = OverseerConfig::default();
        let gate = Gate { registry: &registry, knowledge: &knowledge, config: &config };
        let denial = gate.evaluate(&destroy("lab-1", false, Role::Admin)).await.unwrap_err();
        assert_eq!(denial.rule, RULE_PLATFORM);
    }

    #[tokio::test]
    async fn missing_target_is_resource_missing() {
        let registry = Registry::in_memory(64);
        registry.record_poll(&PlatformId::from("mock:a")).await;
        let knowledge = KnowledgeIndex::empty();
        let config = OverseerConfig::default();
        let gate = Gate { registry: &registry, knowledge: &knowledge, config: &config };

        let denial = gate.evaluate(&destroy("lab-ghost", false, Role::Admin)).await.unwrap_err();
        assert_eq!(denial.rule, RULE_MISSING);
    }

    #[tokio::test]
    async fn deploy_requests_skip_the_existence_check() {
        let registry = Registry::in_memory(64);
        registry.record_poll(&PlatformId::from("mock:a")).await;
        let knowledge = KnowledgeIndex::empty();
        let config = OverseerConfig::default();
        let gate = Gate { registry: &registry, knowledge: &knowledge, config: &config };

        let spec = LabSpec {
            name: "fresh".into(),
            platform: PlatformId::from("mock:a"),
            networks: vec![],
            vms: vec![],
            tags: BTreeMap::new(),
        };
        let request = Request::new(RequestKind::DeployLab { spec }, "alice", Role::Operator);
        gate.evaluate(&request).await.unwrap();
    }
}
