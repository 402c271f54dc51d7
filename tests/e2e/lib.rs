#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use kube::Client;
    use kubevista_core::aggregator::Aggregator;
    use kubevista_core::config::{RefreshConfig, SystemClock};
    use kubevista_core::scope::{ClusterId, Scope};
    use kubevista_core::snapshot::BuildOptions;
    use tokio::time::timeout;

    async fn aggregator_with_local_cluster() -> (Arc<Aggregator>, ClusterId) {
        let cluster_id = ClusterId::new("e2e:local");
        let client = Client::try_default().await.expect("a kubeconfig must be reachable for e2e tests");
        let aggregator = Arc::new(Aggregator::new(RefreshConfig::default(), Arc::new(SystemClock)));
        aggregator.add_cluster(cluster_id.clone(), client, false).await;
        (aggregator, cluster_id)
    }

    #[tokio::test]
    async fn cluster_overview_builds_against_a_live_cluster() {
        let (aggregator, cluster_id) = aggregator_with_local_cluster().await;

        let by_cluster = aggregator
            .snapshot("cluster-overview", "", Some(cluster_id.clone()), BuildOptions::default())
            .await
            .unwrap();

        let snapshot = by_cluster
            .get(&cluster_id)
            .expect("routed cluster must appear in the fan-out result")
            .as_ref()
            .expect("cluster-overview should build against a reachable apiserver");
        assert!(snapshot.payload.is_object());
        assert!(snapshot.version >= 1);
    }

    #[tokio::test]
    async fn namespace_workloads_lists_the_default_namespace() {
        let (aggregator, cluster_id) = aggregator_with_local_cluster().await;

        let by_cluster = aggregator
            .snapshot(
                "namespace-workloads",
                "namespace:default",
                Some(cluster_id.clone()),
                BuildOptions::default(),
            )
            .await
            .unwrap();

        by_cluster
            .get(&cluster_id)
            .expect("routed cluster must appear in the fan-out result")
            .as_ref()
            .expect("namespace-workloads should build for the default namespace");
    }

    #[tokio::test]
    async fn repeated_build_without_changes_reuses_the_cached_etag() {
        let (aggregator, cluster_id) = aggregator_with_local_cluster().await;
        let subsystem = aggregator.subsystem(&cluster_id).await.unwrap();

        let first = subsystem
            .snapshot("cluster-overview", Scope::Empty, BuildOptions::default())
            .await
            .unwrap();
        let second = subsystem
            .snapshot("cluster-overview", Scope::Empty, BuildOptions::default())
            .await
            .unwrap();

        assert_eq!(first.etag, second.etag);
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn manual_refresh_job_reaches_a_terminal_state() {
        let (aggregator, cluster_id) = aggregator_with_local_cluster().await;
        let subsystem = aggregator.subsystem(&cluster_id).await.unwrap();

        let job_id = subsystem.submit_manual_refresh("cluster-overview", Scope::Empty).await;

        let job = timeout(Duration::from_secs(10), async {
            loop {
                let job = subsystem.manual_job(&job_id).await.unwrap();
                if matches!(
                    job.state,
                    kubevista_core::manual_queue::JobState::Succeeded
                        | kubevista_core::manual_queue::JobState::Failed
                ) {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("manual refresh job should reach a terminal state within the timeout");

        assert_eq!(job.state, kubevista_core::manual_queue::JobState::Succeeded);
    }

    #[tokio::test]
    async fn missing_cluster_scope_is_rejected_before_touching_any_subsystem() {
        let (aggregator, _cluster_id) = aggregator_with_local_cluster().await;
        let result = aggregator
            .snapshot("cluster-overview", "", None, BuildOptions::default())
            .await;
        assert!(matches!(result, Err(kubevista_core::Error::MissingClusterScope)));
    }

    #[tokio::test]
    async fn stream_replay_and_live_delivery_cover_published_sequences() {
        let (aggregator, cluster_id) = aggregator_with_local_cluster().await;
        let subsystem = aggregator.subsystem(&cluster_id).await.unwrap();

        let mut subscription = subsystem
            .stream("cluster-overview", Scope::Empty, None)
            .await
            .expect("subscribing to a just-registered domain should succeed");
        // The subsystem seeds the hub with a `reset` envelope carrying the
        // current snapshot on first connect.
        assert!(!subscription.replay.is_empty());

        let job_id = subsystem.submit_manual_refresh("cluster-overview", Scope::Empty).await;
        timeout(Duration::from_secs(10), async {
            loop {
                let job = subsystem.manual_job(&job_id).await.unwrap();
                if job.state == kubevista_core::manual_queue::JobState::Succeeded {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        let envelope = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("a reset envelope should follow the manual refresh")
            .expect("subscription should not be closed");
        assert_eq!(envelope.kind, kubevista_core::stream::EnvelopeKind::Reset);
    }
}
