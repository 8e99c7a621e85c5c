pub mod client;
pub mod monitor;
pub mod notifier;

pub use client::{get_status, wait_idle};
pub use monitor::{Monitor, MonitorCommand, StatusService};
pub use notifier::ChangeNotifier;

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use gradeline_common::{
        request::Request,
        status::Status,
        submission::{FileId, FileKind, SubmissionId},
    };
    use gradeline_mq::{MemoryBroker, ProducerRegistry};

    use super::*;

    const RPC_TIMEOUT: Duration = Duration::from_secs(5);

    struct Cluster {
        service: StatusService,
        registry: ProducerRegistry,
        notifier: ChangeNotifier,
    }

    async fn cluster() -> Cluster {
        let broker = MemoryBroker::new();
        let service = StatusService::new(Arc::new(broker.clone()), 1);
        service.monitor_status().await.unwrap();

        let registry = ProducerRegistry::new(Arc::new(broker), 1);
        let notifier = ChangeNotifier::new(&registry).await.unwrap();
        Cluster {
            service,
            registry,
            notifier,
        }
    }

    /// Polls until the aggregator has applied enough events to satisfy `pred`.
    async fn status_where(registry: &ProducerRegistry, pred: impl Fn(&Status) -> bool) -> Status {
        for _ in 0..100 {
            let status = get_status(registry, RPC_TIMEOUT).await.unwrap();
            if pred(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status never reached the expected state");
    }

    #[tokio::test]
    async fn test_get_status_reflects_changes() {
        let c = cluster().await;
        let sid = SubmissionId::new();
        let fid = FileId::new();

        c.notifier.notify(&Request::start_submission(sid)).await;
        c.notifier
            .notify(&Request::add_file(sid, fid, FileKind::Source).unwrap())
            .await;

        let status = status_where(&c.registry, |s| s.file_count == 1).await;
        assert!(status.submissions[&sid].contains(&fid));
        assert!(status.is_consistent());

        c.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_returns_only_after_all_removals() {
        let c = cluster().await;
        let sid = SubmissionId::new();
        let files: Vec<FileId> = (0..5).map(|_| FileId::new()).collect();

        c.notifier.notify(&Request::start_submission(sid)).await;
        for fid in &files {
            c.notifier
                .notify(&Request::add_file(sid, *fid, FileKind::Source).unwrap())
                .await;
        }
        status_where(&c.registry, |s| s.file_count == 5).await;

        let waiter_registry = ProducerRegistry::new(c.registry.connector(), 1);
        let wait = tokio::spawn(async move { wait_idle(&waiter_registry, None).await });

        for fid in &files[..4] {
            c.notifier.notify(&Request::remove_file(sid, *fid)).await;
        }
        status_where(&c.registry, |s| s.file_count == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!wait.is_finished());

        c.notifier.notify(&Request::remove_file(sid, files[4])).await;
        c.notifier.notify(&Request::stop_submission(sid)).await;

        let idle = tokio::time::timeout(RPC_TIMEOUT, wait)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(idle.file_count, 0);

        let status = status_where(&c.registry, |s| s.submission_count() == 0).await;
        assert!(status.is_idle());
        c.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_when_already_idle() {
        let c = cluster().await;
        let status = wait_idle(&c.registry, Some(RPC_TIMEOUT)).await.unwrap();
        assert!(status.is_idle());
        c.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_get_status_callers() {
        let c = cluster().await;
        let other = ProducerRegistry::new(c.registry.connector(), 1);

        tokio::join!(
            async {
                for _ in 0..10 {
                    get_status(&c.registry, RPC_TIMEOUT).await.unwrap();
                }
            },
            async {
                for _ in 0..10 {
                    get_status(&other, RPC_TIMEOUT).await.unwrap();
                }
            }
        );
        c.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_replaces_monitor() {
        let c = cluster().await;
        let sid = SubmissionId::new();
        c.notifier.notify(&Request::start_submission(sid)).await;
        status_where(&c.registry, |s| s.submission_count() == 1).await;

        c.service.monitor_status().await.unwrap();
        assert!(c.service.is_running().await);

        // The replacement starts from an empty status.
        let status = get_status(&c.registry, RPC_TIMEOUT).await.unwrap();
        assert_eq!(status, Status::new());

        c.service.stop().await.unwrap();
        assert!(!c.service.is_running().await);
        assert!(
            get_status(&c.registry, Duration::from_millis(50))
                .await
                .is_err()
        );
    }
}
