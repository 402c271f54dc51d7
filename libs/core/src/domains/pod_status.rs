//! kubectl-parity pod status derivation, shared by namespace-workloads and
//! any future builder that lists pods.

use k8s_openapi::api::core::v1::Pod;

/// Derives the kubectl-parity status string for `pod`, in priority order:
/// `Evicted` phase, then init-container crash/waiting, then regular
/// container waiting/terminated reasons, then `Terminating`, then the bare
/// phase.
pub fn status_string(pod: &Pod) -> String {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.clone()).unwrap_or_else(|| "Unknown".to_string());
    let reason = status.and_then(|s| s.reason.clone());

    if phase == "Failed" && reason.as_deref() == Some("Evicted") {
        return "Evicted".to_string();
    }

    if let Some(status) = status {
        for init in status.init_container_statuses.iter().flatten() {
            if let Some(terminated) = init.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                if terminated.exit_code != 0 {
                    let reason = terminated.reason.clone().unwrap_or_else(|| "Error".to_string());
                    return format!("Init:{reason}");
                }
            }
        }
        for init in status.init_container_statuses.iter().flatten() {
            if let Some(waiting) = init.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                if let Some(reason) = &waiting.reason {
                    if reason != "PodInitializing" {
                        return format!("Init:{reason}");
                    }
                }
            }
        }
        for container in status.container_statuses.iter().flatten() {
            if let Some(waiting) = container.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                if let Some(reason) = &waiting.reason {
                    return reason.clone();
                }
            }
        }
        for container in status.container_statuses.iter().flatten() {
            if let Some(terminated) = container.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                if let Some(reason) = &terminated.reason {
                    return reason.clone();
                }
            }
        }
    }

    if pod.metadata.deletion_timestamp.is_some() {
        return "Terminating".to_string();
    }

    phase
}

/// `ready/total` display string derived from container statuses.
pub fn ready_display(pod: &Pod) -> String {
    let statuses = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref());
    match statuses {
        Some(statuses) => {
            let ready = statuses.iter().filter(|c| c.ready).count();
            format!("{ready}/{}", statuses.len())
        }
        None => "0/0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod {
            metadata: ObjectMeta::default(),
            spec: None,
            status: Some(status),
        }
    }

    #[test]
    fn evicted_phase_wins_over_everything_else() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Failed".to_string()),
            reason: Some("Evicted".to_string()),
            ..Default::default()
        });
        assert_eq!(status_string(&pod), "Evicted");
    }

    #[test]
    fn init_container_crash_reports_init_prefixed_reason() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Pending".to_string()),
            init_container_statuses: Some(vec![ContainerStatus {
                name: "init".to_string(),
                ready: false,
                restart_count: 0,
                image: String::new(),
                image_id: String::new(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 1,
                        reason: Some("Error".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(status_string(&pod), "Init:Error");
    }

    #[test]
    fn init_container_waiting_with_specific_reason() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Pending".to_string()),
            init_container_statuses: Some(vec![ContainerStatus {
                name: "init".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("CrashLoopBackOff".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(status_string(&pod), "Init:CrashLoopBackOff");
    }

    #[test]
    fn init_container_waiting_pod_initializing_falls_back_to_phase() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Pending".to_string()),
            init_container_statuses: Some(vec![ContainerStatus {
                name: "init".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("PodInitializing".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(status_string(&pod), "Pending");
    }

    #[test]
    fn terminating_pod_with_deletion_timestamp() {
        let mut pod = pod_with_status(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        pod.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
        assert_eq!(status_string(&pod), "Terminating");
    }

    #[test]
    fn ready_display_counts_ready_containers() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![
                ContainerStatus { ready: true, ..ContainerStatus::default() },
                ContainerStatus { ready: false, ..ContainerStatus::default() },
            ]),
            ..Default::default()
        });
        assert_eq!(ready_display(&pod), "1/2");
    }
}
