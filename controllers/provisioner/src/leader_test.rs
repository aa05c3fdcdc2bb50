//! Unit tests for lease election and the leader-gated runner

#[cfg(test)]
mod tests {
    use crate::error::ProvisionError;
    use crate::leader::*;
    use crate::registry::{Controller, ControllerContext, ControllerRegistry};
    use chrono::{DateTime, Utc};
    use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use resource_client::{MockResourceClient, ResourceClientTrait};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn elector(mock: &MockResourceClient, identity: &str) -> LeaderElector {
        LeaderElector::new(Arc::new(mock.clone()), "kube-system", "kubeseed", identity)
    }

    fn lease(holder: Option<&str>, renewed: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("kubeseed".to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(15),
                renew_time: Some(to_micro_time(renewed).unwrap()),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn holder(mock: &MockResourceClient) -> Option<String> {
        let lease = mock.get_lease("kube-system", "kubeseed").await.unwrap();
        lease.spec.and_then(|s| s.holder_identity)
    }

    fn ctx(mock: &MockResourceClient, cancel: &CancellationToken) -> ControllerContext {
        ControllerContext {
            cancel: cancel.clone(),
            client: Arc::new(mock.clone()),
        }
    }

    /// Controller that counts starts and runs until its token is cancelled
    fn parked(starts: Arc<AtomicUsize>, seen: Arc<Mutex<Vec<CancellationToken>>>) -> Controller {
        Controller::new("parked", move |ctx: ControllerContext| {
            let starts = starts.clone();
            let seen = seen.clone();
            async move {
                starts.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(ctx.cancel.clone());
                ctx.cancel.cancelled().await;
                Ok(())
            }
        })
    }

    /// Tracks how many leader controllers run at once, across replicas
    #[derive(Default)]
    struct Occupancy {
        running: AtomicUsize,
        peak: AtomicUsize,
        starts: AtomicUsize,
    }

    /// Decrements the running count however the controller future ends
    struct Running(Arc<Occupancy>);

    impl Drop for Running {
        fn drop(&mut self) {
            self.0.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn exclusive(occupancy: Arc<Occupancy>) -> Controller {
        Controller::new("exclusive", move |ctx: ControllerContext| {
            let occupancy = occupancy.clone();
            async move {
                occupancy.starts.fetch_add(1, Ordering::SeqCst);
                let now = occupancy.running.fetch_add(1, Ordering::SeqCst) + 1;
                occupancy.peak.fetch_max(now, Ordering::SeqCst);
                let _running = Running(occupancy.clone());
                ctx.cancel.cancelled().await;
                Ok(())
            }
        })
    }

    fn fast_timing() -> ElectionTiming {
        ElectionTiming {
            lease_duration: Duration::from_secs(3),
            renew_deadline: Duration::from_secs(2),
            retry_interval: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_micro_time_round_trip() {
        let now = Utc::now();
        let back = from_micro_time(&to_micro_time(now).unwrap()).unwrap();
        assert!((now - back).num_milliseconds().abs() < 1);
    }

    #[test]
    fn test_default_identity_is_unique() {
        assert_ne!(default_identity(), default_identity());
    }

    #[tokio::test]
    async fn test_first_candidate_creates_lease() {
        let mock = MockResourceClient::new();
        assert!(elector(&mock, "a").try_acquire_or_renew().await.unwrap());
        assert_eq!(holder(&mock).await.as_deref(), Some("a"));
        assert_eq!(mock.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_held_lease_blocks_other_candidate() {
        let mock = MockResourceClient::new();
        let a = elector(&mock, "a");
        let b = elector(&mock, "b");

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        // holder renews its own lease
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert_eq!(holder(&mock).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let mock = MockResourceClient::new();
        mock.add_lease(lease(Some("old"), Utc::now() - chrono::Duration::hours(1), 2));

        assert!(elector(&mock, "b").try_acquire_or_renew().await.unwrap());

        let spec = mock.get_lease("kube-system", "kubeseed").await.unwrap().spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("b"));
        assert_eq!(spec.lease_transitions, Some(3));
    }

    #[tokio::test]
    async fn test_released_lease_is_taken_over_immediately() {
        let mock = MockResourceClient::new();
        let a = elector(&mock, "a");
        assert!(a.try_acquire_or_renew().await.unwrap());

        a.release_lease().await;
        assert_eq!(holder(&mock).await, None);

        assert!(elector(&mock, "b").try_acquire_or_renew().await.unwrap());
        assert_eq!(holder(&mock).await.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elect_disabled_returning_set_is_fatal() {
        let mock = MockResourceClient::new();
        let set = ControllerRegistry::new()
            .with_leader_controller(Controller::new("short-lived", |_ctx| async { Ok(()) }))
            .leader_set();
        let cancel = CancellationToken::new();

        let result = run_leader_gated(true, &elector(&mock, "a"), &set, ctx(&mock, &cancel)).await;

        assert!(matches!(result, Err(ProvisionError::ControllersExited)));
        // no election without leader elect
        assert_eq!(mock.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elect_disabled_runs_until_cancelled() {
        let mock = MockResourceClient::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = ControllerRegistry::new()
            .with_leader_controller(parked(starts.clone(), seen))
            .leader_set();
        let cancel = CancellationToken::new();

        let task_ctx = ctx(&mock, &cancel);
        let a = elector(&mock, "a");
        let handle = tokio::spawn(async move { run_leader_gated(true, &a, &set, task_ctx).await });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_controller_failure_is_fatal() {
        let mock = MockResourceClient::new();
        let set = ControllerRegistry::new()
            .with_leader_controller(Controller::new("broken", |_ctx| async {
                Err(ProvisionError::Runtime("boom".to_string()))
            }))
            .leader_set();
        let cancel = CancellationToken::new();

        let result = run_leader_gated(false, &elector(&mock, "a"), &set, ctx(&mock, &cancel)).await;

        assert!(matches!(result, Err(ProvisionError::LeaderController { .. })));
        // lease handed back on failure
        assert_eq!(holder(&mock).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_replica_runs_leader_set() {
        let mock = MockResourceClient::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for identity in ["a", "b", "c"] {
            let set = ControllerRegistry::new()
                .with_leader_controller(parked(starts.clone(), seen.clone()))
                .leader_set();
            let elector = elector(&mock, identity);
            let task_ctx = ctx(&mock, &cancel);
            handles.push(tokio::spawn(async move {
                run_leader_gated(false, &elector, &set, task_ctx).await
            }));
        }

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_loss_is_fatal_and_stops_controllers() {
        let mock = MockResourceClient::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = ControllerRegistry::new()
            .with_leader_controller(parked(starts.clone(), seen.clone()))
            .leader_set();
        let cancel = CancellationToken::new();

        let task_ctx = ctx(&mock, &cancel);
        let a = elector(&mock, "a");
        let handle = tokio::spawn(async move { run_leader_gated(false, &a, &set, task_ctx).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        // another replica overwrites the lease behind our back
        mock.add_lease(lease(Some("intruder"), Utc::now(), 1));

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ProvisionError::LeadershipLost(ref lock)) if lock == "kube-system/kubeseed"));
        assert!(seen.lock().unwrap()[0].is_cancelled());
        assert!(!cancel.is_cancelled());
        assert_eq!(holder(&mock).await.as_deref(), Some("intruder"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_lease() {
        let mock = MockResourceClient::new();
        let set = ControllerRegistry::new()
            .with_leader_controller(parked(Arc::new(AtomicUsize::new(0)), Arc::new(Mutex::new(Vec::new()))))
            .leader_set();
        let cancel = CancellationToken::new();

        let task_ctx = ctx(&mock, &cancel);
        let a = elector(&mock, "a");
        let handle = tokio::spawn(async move { run_leader_gated(false, &a, &set, task_ctx).await });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(holder(&mock).await.as_deref(), Some("a"));

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(holder(&mock).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_candidate() {
        let mock = MockResourceClient::new();
        mock.add_lease(lease(Some("other"), Utc::now(), 0));
        let starts = Arc::new(AtomicUsize::new(0));
        let set = ControllerRegistry::new()
            .with_leader_controller(parked(starts.clone(), Arc::new(Mutex::new(Vec::new()))))
            .leader_set();
        let cancel = CancellationToken::new();

        let task_ctx = ctx(&mock, &cancel);
        let b = elector(&mock, "b");
        let handle = tokio::spawn(async move { run_leader_gated(false, &b, &set, task_ctx).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        handle.await.unwrap().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 0);
        assert_eq!(holder(&mock).await.as_deref(), Some("other"));
    }

    #[test]
    fn test_default_timing_is_valid() {
        ElectionTiming::default().validate().unwrap();
        fast_timing().validate().unwrap();
    }

    #[tokio::test]
    async fn test_renew_deadline_must_be_shorter_than_lease() {
        let mock = MockResourceClient::new();
        let timing = ElectionTiming {
            lease_duration: Duration::from_secs(10),
            renew_deadline: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
        };
        let a = elector(&mock, "a").with_timing(timing);

        let err = a.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidConfig(_)));
        assert_eq!(mock.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_lease_expires_on_local_clock() {
        let mock = MockResourceClient::new();
        // renew time is fresh by the wall clock, so only the local observation can expire it
        mock.add_lease(lease(Some("stuck"), Utc::now(), 0));
        let b = elector(&mock, "b").with_timing(fast_timing());

        assert!(!b.try_acquire_or_renew().await.unwrap());
        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(!b.try_acquire_or_renew().await.unwrap());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(b.try_acquire_or_renew().await.unwrap());
        assert_eq!(holder(&mock).await.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewals_stop_holder_before_takeover() {
        let mock = MockResourceClient::new();
        let occupancy = Arc::new(Occupancy::default());
        let cancel = CancellationToken::new();

        let spawn_replica = |identity: &'static str| {
            let set = ControllerRegistry::new()
                .with_leader_controller(exclusive(occupancy.clone()))
                .leader_set();
            let elector = elector(&mock, identity).with_timing(fast_timing());
            let task_ctx = ctx(&mock, &cancel);
            tokio::spawn(async move { run_leader_gated(false, &elector, &set, task_ctx).await })
        };

        let a = spawn_replica("a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let b = spawn_replica("b");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(holder(&mock).await.as_deref(), Some("a"));
        let renewals = mock.calls().update_lease.load(Ordering::SeqCst);
        assert!(renewals >= 4, "holder renews every retry interval, saw {}", renewals);

        // every renewal from "a" is rejected from here on
        mock.fail_lease_updates_by(Some("a"));

        let a_result = a.await.unwrap();
        assert!(matches!(a_result, Err(ProvisionError::LeadershipLost(ref lock)) if lock == "kube-system/kubeseed"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(holder(&mock).await.as_deref(), Some("b"));
        assert_eq!(occupancy.starts.load(Ordering::SeqCst), 2);
        assert_eq!(occupancy.peak.load(Ordering::SeqCst), 1);

        cancel.cancel();
        b.await.unwrap().unwrap();
        assert_eq!(occupancy.running.load(Ordering::SeqCst), 0);
    }
}
